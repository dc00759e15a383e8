use rquickjs::{Ctx, Exception, Function, Result, Value};
use serde_json::json;

use super::convert::{from_json, to_json};
use super::{Bindings, SharedState};
use crate::engine::executor::StepOrigin;
use crate::engine::http_client::HttpResponse;
use crate::error::{TransportError, TransportErrorKind};

pub fn response_value(resp: &HttpResponse) -> serde_json::Value {
    json!({
        "status": resp.status,
        "headers": resp.headers,
        "body": resp.body_text(),
        "latency": resp.latency.as_secs_f64() * 1000.0,
        "error": null,
        "errorKind": null,
    })
}

pub fn failed_response_value(err: &TransportError) -> serde_json::Value {
    json!({
        "status": 0,
        "headers": {},
        "body": "",
        "latency": 0,
        "error": err.message,
        "errorKind": err.kind.as_str(),
    })
}

/// `http(label, spec)`: blocks this virtual user until the response (or a transport
/// failure) is available. Transport failures are returned as a response with status 0
/// so the scenario decides whether they matter.
pub fn register_sync<'js>(ctx: &Ctx<'js>, bindings: &Bindings, state: SharedState) -> Result<()> {
    let bindings = bindings.clone();

    let http_fn = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, label: String, spec: Value<'js>| -> Result<Value<'js>> {
            let origin = StepOrigin {
                scenario: bindings.scenario.clone(),
                user: bindings.user,
                iteration: state.borrow().iteration,
            };

            let spec = match to_json(&ctx, &spec) {
                Ok(spec) => spec,
                Err(e) => {
                    bindings.executor.reject(
                        &origin,
                        &label,
                        TransportError::invalid_request("request spec contains unsupported values"),
                    );
                    return Err(e);
                }
            };

            let result = bindings.handle.block_on(bindings.executor.dispatch(
                &origin,
                &label,
                &spec,
                &bindings.cancel,
            ));

            match result {
                Ok(resp) => from_json(&ctx, &response_value(&resp)),
                Err(err) => match err.kind {
                    TransportErrorKind::Cancelled => {
                        state.borrow_mut().cancelled = true;
                        Err(Exception::throw_message(&ctx, "iteration cancelled during http call"))
                    }
                    TransportErrorKind::InvalidRequest => {
                        Err(Exception::throw_type(&ctx, &format!("http('{}'): {}", label, err.message)))
                    }
                    _ => from_json(&ctx, &failed_response_value(&err)),
                },
            }
        },
    )?;

    ctx.globals().set("http", http_fn)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::body::Bytes;
    use std::collections::BTreeMap;
    use std::time::Duration;

    #[test]
    fn test_response_value_shape() {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        let resp = HttpResponse {
            status: 201,
            headers,
            body: Bytes::from_static(b"{\"id\":1}"),
            latency: Duration::from_millis(12),
        };
        let value = response_value(&resp);
        assert_eq!(value["status"], 201);
        assert_eq!(value["headers"]["content-type"], "application/json");
        assert_eq!(value["body"], "{\"id\":1}");
        assert_eq!(value["latency"], 12.0);
        assert!(value["error"].is_null());
    }

    #[test]
    fn test_failed_response_value_shape() {
        let err = TransportError::new(TransportErrorKind::Connect, "connection refused");
        let value = failed_response_value(&err);
        assert_eq!(value["status"], 0);
        assert_eq!(value["error"], "connection refused");
        assert_eq!(value["errorKind"], "connect");
    }
}
