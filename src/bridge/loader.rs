//! Turns a deluge script into a [`DelugePlan`].

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::LazyLock;

use regex::Regex;
use rquickjs::{CatchResultExt, Context, Runtime};
use tracing::debug;

use super::{helpers, register_registry, script_error, strict_source, Registry, SharedRegistry};
use crate::engine::plan::DelugePlan;
use crate::error::ConfigurationError;
use crate::utils::parse_duration;

static PAUSE_CALL: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(r#"^pause\s*\(\s*(?:"([^"\\]*)"|'([^'\\]*)'|`([^`$\\]*)`)\s*\)"#)
});

/// Reject literal `pause("...")` arguments that can never parse. Computed arguments are
/// only known when the iteration runs.
pub fn check_pause_literals(source: &str) -> Result<(), ConfigurationError> {
    let pattern = PAUSE_CALL
        .as_ref()
        .map_err(|e| ConfigurationError::Engine(e.to_string()))?;
    for offset in pause_calls(source) {
        let Some(caps) = pattern.captures(&source[offset..]) else {
            continue;
        };
        if let Some(literal) = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3)) {
            parse_duration(literal.as_str())?;
        }
    }
    Ok(())
}

/// Byte offsets of the `pause` identifiers in code. Comments, string literals and
/// member accesses such as `player.pause` are skipped.
fn pause_calls(source: &str) -> Vec<usize> {
    let bytes = source.as_bytes();
    let mut found = Vec::new();
    // last non-whitespace byte outside comments
    let mut previous: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                i = find_from(bytes, i + 2, b"\n").unwrap_or(bytes.len());
                continue;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = find_from(bytes, i + 2, b"*/").map_or(bytes.len(), |end| end + 2);
                continue;
            }
            quote @ (b'"' | b'\'' | b'`') => {
                i = skip_string(bytes, i + 1, quote);
                previous = Some(quote);
                continue;
            }
            b if is_ident(b) => {
                let start = i;
                while i < bytes.len() && is_ident(bytes[i]) {
                    i += 1;
                }
                if &bytes[start..i] == b"pause" && previous != Some(b'.') {
                    found.push(start);
                }
                previous = Some(bytes[i - 1]);
                continue;
            }
            b if b.is_ascii_whitespace() => {}
            b => previous = Some(b),
        }
        i += 1;
    }
    found
}

fn is_ident(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}

/// Index just past the closing `quote`.
fn skip_string(bytes: &[u8], mut i: usize, quote: u8) -> usize {
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b if b == quote => return i + 1,
            b'\n' if quote != b'`' => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

fn find_from(bytes: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    bytes
        .get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Evaluate `source` once in a context exposing only `scenario`, `deluge` and the pure
/// helpers, then validate the declaration.
pub fn load_plan(source: &str, origin: &str) -> Result<DelugePlan, ConfigurationError> {
    check_pause_literals(source)?;

    let engine_err = |e: rquickjs::Error| ConfigurationError::Engine(e.to_string());
    let runtime = Runtime::new().map_err(engine_err)?;
    let context = Context::full(&runtime).map_err(engine_err)?;
    let registry: SharedRegistry = Rc::new(RefCell::new(Registry::default()));

    let evaluated = context.with(|ctx| {
        helpers::register_sync(&ctx)
            .and_then(|_| register_registry(&ctx, registry.clone()))
            .catch(&ctx)
            .map_err(|e| script_error(origin, e))?;
        ctx.eval::<(), _>(strict_source(source))
            .catch(&ctx)
            .map_err(|e| script_error(origin, e))
    });

    let (pending, deluge, defined) = {
        let mut registry = registry.borrow_mut();
        registry.sealed = true;
        registry.bodies.clear();
        (
            registry.error.take(),
            registry.deluge.take(),
            std::mem::take(&mut registry.defined),
        )
    };
    runtime.run_gc();
    drop(context);
    drop(runtime);

    // A registration error explains the exception it raised better than the exception does.
    if let Some(err) = pending {
        return Err(err);
    }
    evaluated?;

    let decl = deluge.ok_or_else(|| ConfigurationError::MissingDeluge(origin.to_string()))?;
    debug!(deluge = %decl.name, scenarios = defined.len(), origin, "script loaded");
    DelugePlan::from_declaration(decl, &defined, source, origin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    const SHOP: &str = r#"
        const base = "http://localhost:8080";

        scenario("browse", "Browse the catalog", (args, session) => {
            const res = http("home", { url: args.base + "/" });
            assert(res.status === 200);
            pause("100ms");
        });

        scenario("buy", "Checkout", (args, session) => {
            http("cart", { url: args.base + "/cart", method: "POST", body: { sku: 1 } });
        });

        deluge("shop", "2m", {
            browse: { concurrent: 20, delay: "10s", args: { base } },
            buy: { concurrent: 5, args: merge({ base }, { vip: true }) },
        });
    "#;

    #[test]
    fn test_load_plan() {
        let plan = load_plan(SHOP, "shop.js").unwrap();
        assert_eq!(plan.name, "shop");
        assert_eq!(plan.origin, "shop.js");
        assert_eq!(plan.duration, Some(Duration::from_secs(120)));
        assert_eq!(plan.scenarios.len(), 2);

        let browse = &plan.scenarios["browse"];
        assert_eq!(browse.concurrency, 20);
        assert_eq!(browse.ramp, Duration::from_secs(10));
        assert_eq!(browse.description, "Browse the catalog");
        assert_eq!(plan.scenarios["buy"].args, json!({"base": "http://localhost:8080", "vip": true}));
    }

    #[test]
    fn test_deluge_without_duration() {
        let src = "scenario('s', 'd', () => {}); deluge('forever', {s: {concurrent: 3}});";
        let plan = load_plan(src, "t.js").unwrap();
        assert_eq!(plan.duration, None);
        assert_eq!(plan.total_concurrency(), 3);
    }

    #[test]
    fn test_missing_deluge() {
        let err = load_plan("scenario('s', 'd', () => {});", "t.js").unwrap_err();
        assert_eq!(err, ConfigurationError::MissingDeluge("t.js".to_string()));
    }

    #[test]
    fn test_duplicate_deluge() {
        let src = "scenario('s', 'd', () => {});
            deluge('a', {s: {concurrent: 1}});
            deluge('b', {s: {concurrent: 1}});";
        let err = load_plan(src, "t.js").unwrap_err();
        assert_eq!(err, ConfigurationError::DuplicateDeluge("b".to_string(), "a".to_string()));
    }

    #[test]
    fn test_duplicate_scenario_wins_over_exception() {
        let src = "scenario('s', 'd', () => {}); scenario('s', 'again', () => {});
            deluge('a', {s: {concurrent: 1}});";
        let err = load_plan(src, "t.js").unwrap_err();
        assert_eq!(err, ConfigurationError::DuplicateScenario("s".to_string()));

        // even when the script catches the exception
        let src = "scenario('s', 'd', () => {});
            try { scenario('s', 'again', () => {}); } catch (e) {}
            deluge('a', {s: {concurrent: 1}});";
        let err = load_plan(src, "t.js").unwrap_err();
        assert_eq!(err, ConfigurationError::DuplicateScenario("s".to_string()));
    }

    #[test]
    fn test_unknown_scenario() {
        let src = "scenario('s', 'd', () => {}); deluge('a', {x: {concurrent: 1}});";
        let err = load_plan(src, "t.js").unwrap_err();
        assert_eq!(err.to_string(), "scenario 'x' is configured but not defined");
    }

    #[test]
    fn test_invalid_pause_literal() {
        let src = "scenario('s', 'd', () => { pause('1h'); }); deluge('a', {s: {concurrent: 1}});";
        let err = load_plan(src, "t.js").unwrap_err();
        assert_eq!(err, ConfigurationError::InvalidDuration("1h".to_string()));

        // computed arguments are left for run time
        let src = "scenario('s', 'd', (args) => { pause(args.wait); }); deluge('a', {s: {concurrent: 1}});";
        assert!(load_plan(src, "t.js").is_ok());
    }

    #[test]
    fn test_check_pause_literals() {
        assert!(check_pause_literals("pause(\"10ms\"); pause( '2s' ); pause(`1m`)").is_ok());
        assert!(check_pause_literals("pause(\"10 ms\")").is_err());
        assert!(check_pause_literals("unpause('forever')").is_ok());
        assert!(check_pause_literals("pause(`${x}s`)").is_ok());
    }

    #[test]
    fn test_pause_literals_outside_code_are_ignored() {
        for src in [
            "// TODO: pause('soon')\npause('10ms');",
            "/* pause('later') */ pause('1s');",
            "/* pause('a')\n * pause('b') */",
            "player.pause('forever');",
            "player?.pause('forever');",
            "player\n    .pause('forever');",
            "const help = \"call pause('x') to wait\";",
            "const tip = `pause('x')`;",
            "const tip = 'it\\'s pause(\"x\")';",
        ] {
            assert!(check_pause_literals(src).is_ok(), "{} was rejected", src);
        }
    }

    #[test]
    fn test_pause_literal_after_comment_is_checked() {
        let err = check_pause_literals("// pause('soon')\n/* x */ pause('soon');").unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidDuration(ref d) if d == "soon"));
        assert!(check_pause_literals("a.b; pause('nope')").is_err());
        assert!(check_pause_literals("const s = 'x'; pause('nope')").is_err());
    }

    #[test]
    fn test_load_plan_ignores_commented_pause() {
        let src = "// pause('soon') once the endpoint exists
                   const player = { pause: (what) => what };
                   scenario('s', 'd', () => { player.pause('forever'); pause('10ms'); });
                   deluge('a', {s: {concurrent: 1}});";
        assert!(load_plan(src, "t.js").is_ok());
    }

    #[test]
    fn test_script_errors() {
        for src in [
            "scenario('s', 'd', () => {",
            "throw new Error('boom');",
            "http('x', {url: 'http://localhost/'});",
            "undeclared = 1; deluge('a', {});",
        ] {
            let err = load_plan(src, "broken.js").unwrap_err();
            assert!(
                matches!(err, ConfigurationError::Script { ref origin, .. } if origin == "broken.js"),
                "{} gave {:?}",
                src,
                err
            );
        }
    }

    #[test]
    fn test_invalid_deluge_duration_type() {
        let src = "scenario('s', 'd', () => {}); deluge('a', 60, {s: {concurrent: 1}});";
        let err = load_plan(src, "t.js").unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidDeluge(_)));
    }
}
