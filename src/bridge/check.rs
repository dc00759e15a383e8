use rquickjs::convert::Coerced;
use rquickjs::function::Opt;
use rquickjs::{Ctx, Exception, Function, Result};

use super::SharedState;

pub fn assertion_message(label: Option<&str>) -> String {
    match label {
        Some(label) if !label.is_empty() => format!("Assertion failed: {}", label),
        _ => "Assertion failed".to_string(),
    }
}

/// `assert(condition, label?)`: a falsy condition fails the current iteration.
///
/// The failure is recorded before throwing, so a script that swallows the exception
/// with try/catch still gets the iteration counted as an assertion failure.
pub fn register_sync<'js>(ctx: &Ctx<'js>, state: SharedState) -> Result<()> {
    let assert_fn = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, condition: Coerced<bool>, label: Opt<String>| -> Result<()> {
            if condition.0 {
                return Ok(());
            }
            let message = assertion_message(label.0.as_deref());
            state
                .borrow_mut()
                .assertion
                .get_or_insert_with(|| message.clone());
            Err(Exception::throw_message(&ctx, &message))
        },
    )?;

    ctx.globals().set("assert", assert_fn)?;
    Ok(())
}
