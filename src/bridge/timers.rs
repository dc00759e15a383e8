use rquickjs::{Ctx, Exception, Function, Result};

use super::{Bindings, SharedState};
use crate::utils::parse_duration;

/// `pause(duration)`: suspend this virtual user only. Hard cancellation wakes it early
/// and aborts the iteration.
pub fn register_sync<'js>(ctx: &Ctx<'js>, bindings: &Bindings, state: SharedState) -> Result<()> {
    let handle = bindings.handle.clone();
    let cancel = bindings.cancel.clone();

    let pause_fn = Function::new(ctx.clone(), move |ctx: Ctx<'js>, duration: String| -> Result<()> {
        let delay = parse_duration(&duration).map_err(|e| Exception::throw_range(&ctx, &e.to_string()))?;

        let completed = handle.block_on(async {
            tokio::select! {
                _ = tokio::time::sleep(delay) => true,
                _ = cancel.cancelled() => false,
            }
        });
        if !completed {
            state.borrow_mut().cancelled = true;
            return Err(Exception::throw_message(&ctx, "iteration cancelled during pause"));
        }
        Ok(())
    })?;

    ctx.globals().set("pause", pause_fn)?;
    Ok(())
}
