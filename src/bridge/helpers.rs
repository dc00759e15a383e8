use rquickjs::{Ctx, Exception, Function, Result, Value};
use serde_json::Map;

use super::convert::{from_json, to_json};

pub fn parse_json(text: &str) -> std::result::Result<serde_json::Value, String> {
    serde_json::from_str(text).map_err(|e| format!("invalid JSON: {}", e))
}

pub fn to_json_string(value: &serde_json::Value) -> String {
    value.to_string()
}

/// `application/x-www-form-urlencoded` encoding of a flat map.
///
/// Arrays repeat their key, nested objects are sent as JSON text and null becomes
/// an empty value.
pub fn url_params_encode(params: &Map<String, serde_json::Value>) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in params {
        match value {
            serde_json::Value::Array(items) => {
                for item in items {
                    serializer.append_pair(key, &scalar_text(item));
                }
            }
            other => {
                serializer.append_pair(key, &scalar_text(other));
            }
        }
    }
    serializer.finish()
}

fn scalar_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Shallow merge; keys of `b` win.
pub fn merge(
    a: serde_json::Value,
    b: serde_json::Value,
) -> std::result::Result<serde_json::Value, String> {
    match (a, b) {
        (serde_json::Value::Object(mut left), serde_json::Value::Object(right)) => {
            left.extend(right);
            Ok(serde_json::Value::Object(left))
        }
        _ => Err("merge expects two objects".to_string()),
    }
}

pub fn len(value: &serde_json::Value) -> std::result::Result<usize, String> {
    match value {
        serde_json::Value::String(s) => Ok(s.chars().count()),
        serde_json::Value::Array(items) => Ok(items.len()),
        serde_json::Value::Object(map) => Ok(map.len()),
        other => Err(format!("len is not defined for {}", kind_name(other))),
    }
}

fn kind_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "booleans",
        serde_json::Value::Number(_) => "numbers",
        serde_json::Value::String(_) => "strings",
        serde_json::Value::Array(_) => "arrays",
        serde_json::Value::Object(_) => "objects",
    }
}

/// Register the side-effect free helpers. Safe to expose while loading a script.
pub fn register_sync<'js>(ctx: &Ctx<'js>) -> Result<()> {
    let globals = ctx.globals();

    globals.set(
        "parseJson",
        Function::new(ctx.clone(), |ctx: Ctx<'js>, text: String| -> Result<Value<'js>> {
            let parsed = parse_json(&text).map_err(|e| Exception::throw_syntax(&ctx, &e))?;
            from_json(&ctx, &parsed)
        })?,
    )?;

    globals.set(
        "toJson",
        Function::new(ctx.clone(), |ctx: Ctx<'js>, value: Value<'js>| -> Result<String> {
            Ok(to_json_string(&to_json(&ctx, &value)?))
        })?,
    )?;

    globals.set(
        "urlParamsEncode",
        Function::new(ctx.clone(), |ctx: Ctx<'js>, value: Value<'js>| -> Result<String> {
            match to_json(&ctx, &value)? {
                serde_json::Value::Object(map) => Ok(url_params_encode(&map)),
                _ => Err(Exception::throw_type(&ctx, "urlParamsEncode expects an object")),
            }
        })?,
    )?;

    globals.set(
        "merge",
        Function::new(
            ctx.clone(),
            |ctx: Ctx<'js>, a: Value<'js>, b: Value<'js>| -> Result<Value<'js>> {
                let merged = merge(to_json(&ctx, &a)?, to_json(&ctx, &b)?)
                    .map_err(|e| Exception::throw_type(&ctx, &e))?;
                from_json(&ctx, &merged)
            },
        )?,
    )?;

    globals.set(
        "len",
        Function::new(ctx.clone(), |ctx: Ctx<'js>, value: Value<'js>| -> Result<i32> {
            let n = len(&to_json(&ctx, &value)?).map_err(|e| Exception::throw_type(&ctx, &e))?;
            Ok(i32::try_from(n).unwrap_or(i32::MAX))
        })?,
    )?;

    Ok(())
}
