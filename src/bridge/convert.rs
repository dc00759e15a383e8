//! Conversion between QuickJS values and `serde_json::Value`.
//!
//! Only JSON-shaped data crosses the boundary. Functions, symbols, BigInts and
//! objects other than arrays and plain `{}` objects (dates, maps, class instances)
//! are rejected with a `TypeError`.

use rquickjs::{Array, Ctx, Exception, Function, Object, Result, Type, Value};
use serde_json::{Map, Number};

/// Nesting deeper than this is treated as a cycle.
const MAX_DEPTH: usize = 64;

pub fn to_json<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> Result<serde_json::Value> {
    let plain: Object = ctx.globals().get::<_, Object>("Object")?.get("prototype")?;
    to_json_at(ctx, &plain, value, 0)
}

fn to_json_at<'js>(
    ctx: &Ctx<'js>,
    plain: &Object<'js>,
    value: &Value<'js>,
    depth: usize,
) -> Result<serde_json::Value> {
    if depth > MAX_DEPTH {
        return Err(Exception::throw_type(ctx, "value is nested too deeply (cyclic?)"));
    }

    match value.type_of() {
        Type::Undefined | Type::Null => Ok(serde_json::Value::Null),
        Type::Bool => Ok(serde_json::Value::Bool(value.as_bool().unwrap_or_default())),
        Type::Int => Ok(serde_json::Value::from(value.as_int().unwrap_or_default())),
        Type::Float => Ok(float_to_json(value.as_float().unwrap_or_default())),
        Type::String => {
            let s = value
                .as_string()
                .map(|s| s.to_string())
                .transpose()?
                .unwrap_or_default();
            Ok(serde_json::Value::String(s))
        }
        Type::Array => {
            let mut out = Vec::new();
            if let Some(array) = value.as_array() {
                for item in array.iter::<Value>() {
                    out.push(to_json_at(ctx, plain, &item?, depth + 1)?);
                }
            }
            Ok(serde_json::Value::Array(out))
        }
        Type::Object => {
            let mut out = Map::new();
            if let Some(object) = value.as_object() {
                if object.get_prototype().is_some_and(|proto| proto != *plain) {
                    return Err(Exception::throw_type(
                        ctx,
                        &format!("unsupported value kind: {}", constructor_name(object)),
                    ));
                }
                for prop in object.props::<String, Value>() {
                    let (key, item) = prop?;
                    out.insert(key, to_json_at(ctx, plain, &item, depth + 1)?);
                }
            }
            Ok(serde_json::Value::Object(out))
        }
        other => Err(Exception::throw_type(
            ctx,
            &format!("unsupported value kind: {:?}", other),
        )),
    }
}

fn constructor_name(object: &Object<'_>) -> String {
    object
        .get::<_, Object>("constructor")
        .and_then(|c| c.get::<_, String>("name"))
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "object".to_string())
}

/// Integral floats become integers so `2.0` and `2` compare equal after a round trip.
fn float_to_json(f: f64) -> serde_json::Value {
    if f.fract() == 0.0 && f.abs() < 9.007_199_254_740_992e15 {
        serde_json::Value::from(f as i64)
    } else {
        Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

pub fn from_json<'js>(ctx: &Ctx<'js>, value: &serde_json::Value) -> Result<Value<'js>> {
    Ok(match value {
        serde_json::Value::Null => Value::new_null(ctx.clone()),
        serde_json::Value::Bool(b) => Value::new_bool(ctx.clone(), *b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) if i32::try_from(i).is_ok() => Value::new_int(ctx.clone(), i as i32),
            _ => Value::new_float(ctx.clone(), n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => rquickjs::String::from_str(ctx.clone(), s)?.into_value(),
        serde_json::Value::Array(items) => {
            let array = Array::new(ctx.clone())?;
            for (i, item) in items.iter().enumerate() {
                array.set(i, from_json(ctx, item)?)?;
            }
            array.into_value()
        }
        serde_json::Value::Object(map) => {
            let object = Object::new(ctx.clone())?;
            for (key, item) in map {
                object.set(key.as_str(), from_json(ctx, item)?)?;
            }
            object.into_value()
        }
    })
}

/// Build a deeply frozen JS value; writes to it throw in strict mode.
pub fn from_json_frozen<'js>(ctx: &Ctx<'js>, value: &serde_json::Value) -> Result<Value<'js>> {
    let js = from_json(ctx, value)?;
    let freeze: Function = ctx.eval("Object.freeze")?;
    deep_freeze(&freeze, &js)?;
    Ok(js)
}

fn deep_freeze<'js>(freeze: &Function<'js>, value: &Value<'js>) -> Result<()> {
    if let Some(array) = value.as_array() {
        for item in array.iter::<Value>() {
            deep_freeze(freeze, &item?)?;
        }
    } else if let Some(object) = value.as_object() {
        for prop in object.props::<String, Value>() {
            let (_, item) = prop?;
            deep_freeze(freeze, &item)?;
        }
    } else {
        return Ok(());
    }
    freeze.call::<_, Value>((value.clone(),))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{CatchResultExt, Context, Runtime};
    use serde_json::json;

    fn with_ctx<F: FnOnce(Ctx<'_>)>(f: F) {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        context.with(f);
    }

    #[test]
    fn test_round_trip_structured_values() {
        with_ctx(|ctx| {
            let original = json!({
                "name": "deluge",
                "count": 42,
                "ratio": 0.25,
                "big": 5_000_000_000i64,
                "ok": true,
                "nothing": null,
                "nested": {"list": [1, "two", {"three": [3.5]}]}
            });
            let js = from_json(&ctx, &original).unwrap();
            assert_eq!(to_json(&ctx, &js).unwrap(), original);
        });
    }

    #[test]
    fn test_script_values() {
        with_ctx(|ctx| {
            let value: Value = ctx
                .eval("({a: 1.0, b: [undefined, 'x'], c: NaN, d: -0.5})")
                .unwrap();
            assert_eq!(
                to_json(&ctx, &value).unwrap(),
                json!({"a": 1, "b": [null, "x"], "c": null, "d": -0.5})
            );
        });
    }

    #[test]
    fn test_rejects_functions_and_symbols() {
        with_ctx(|ctx| {
            for src in ["(function() {})", "({f: () => 1})", "Symbol('s')"] {
                let value: Value = ctx.eval(src).unwrap();
                assert!(to_json(&ctx, &value).catch(&ctx).is_err(), "{} accepted", src);
            }
        });
    }

    #[test]
    fn test_rejects_non_plain_objects() {
        with_ctx(|ctx| {
            let cases = [
                ("new Date(0)", "Date"),
                ("({m: new Map([[1, 2]])})", "Map"),
                ("[new Set()]", "Set"),
                ("/x/", "RegExp"),
                ("class Point {}; new Point()", "Point"),
            ];
            for (src, kind) in cases {
                let value: Value = ctx.eval(src).unwrap();
                match to_json(&ctx, &value).catch(&ctx) {
                    Err(e) => assert!(e.to_string().contains(kind), "{}: {}", src, e),
                    Ok(v) => panic!("{} accepted as {}", src, v),
                }
            }
        });
    }

    #[test]
    fn test_accepts_null_prototype_objects() {
        with_ctx(|ctx| {
            let value: Value = ctx
                .eval("const o = Object.create(null); o.k = 'v'; o")
                .unwrap();
            assert_eq!(to_json(&ctx, &value).unwrap(), json!({"k": "v"}));
        });
    }

    #[test]
    fn test_rejects_cycles() {
        with_ctx(|ctx| {
            let value: Value = ctx.eval("const o = {}; o.self = o; o").unwrap();
            assert!(to_json(&ctx, &value).catch(&ctx).is_err());
        });
    }

    #[test]
    fn test_frozen_values_reject_writes() {
        with_ctx(|ctx| {
            let frozen = from_json_frozen(&ctx, &json!({"inner": {"v": 1}, "list": [1]})).unwrap();
            ctx.globals().set("args", frozen).unwrap();
            let result: Result<()> = ctx.eval("'use strict'; args.inner.v = 2;");
            assert!(result.catch(&ctx).is_err());
            let result: Result<()> = ctx.eval("'use strict'; args.list.push(2);");
            assert!(result.catch(&ctx).is_err());
            let v: i32 = ctx.eval("args.inner.v").unwrap();
            assert_eq!(v, 1);
        });
    }
}
