//! One QuickJS runtime per realm, shared by every userscript it runs.

use anyhow::{anyhow, Context as _, Result};
use rquickjs::{Context, Ctx, Error as JsError, FromJs, Function, Runtime, Value};
use tracing::{debug, error, info, trace, warn};

/// Promise jobs drained after one evaluation before giving up on a runaway
/// chain.
const JOB_BUDGET: usize = 1000;

pub struct QuickJsEngine {
    runtime: Runtime,
    context: Context,
}

impl QuickJsEngine {
    /// Runtime plus a full context with `console`, `self` and `window`.
    pub fn new() -> Result<Self> {
        let runtime = Runtime::new().context("failed to create QuickJS runtime")?;
        let context = Context::full(&runtime).context("failed to create QuickJS context")?;
        context
            .with(install_globals)
            .context("failed to install userscript globals")?;
        Ok(Self { runtime, context })
    }

    pub fn eval(&self, source: &str, filename: &str) -> Result<()> {
        self.eval_with(source, filename)
    }

    /// Evaluate `source` and convert its completion value. Promise jobs it
    /// queued are drained before returning.
    pub fn eval_with<V>(&self, source: &str, filename: &str) -> Result<V>
    where
        V: for<'js> FromJs<'js>,
    {
        let script = with_source_url(source, filename);
        let value = self.context.with(|ctx| match ctx.eval::<V, _>(script) {
            Ok(value) => Ok(value),
            Err(JsError::Exception) => Err(anyhow!(exception_message(&ctx))),
            Err(err) => Err(anyhow::Error::from(err)),
        })?;

        for failure in self.drain_jobs() {
            warn!(target: "quickjs", file = filename, error = %failure, "promise job failed");
        }
        Ok(value)
    }

    /// Run queued promise jobs and return the message of every job that
    /// threw. Draining continues past a failed job.
    pub fn drain_jobs(&self) -> Vec<String> {
        let mut failures = Vec::new();
        let mut ran = 0;
        while self.runtime.is_job_pending() {
            if ran == JOB_BUDGET {
                warn!(target: "quickjs", budget = JOB_BUDGET, "promise jobs still queued after budget");
                break;
            }
            ran += 1;
            match self.runtime.execute_pending_job() {
                Ok(true) => {}
                Ok(false) => break,
                Err(exception) => failures.push(exception.0.with(|ctx| exception_message(&ctx))),
            }
        }
        if ran > 0 {
            trace!(target: "quickjs", ran, "drained promise jobs");
        }
        failures
    }

    pub fn with_context<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'js> FnOnce(Ctx<'js>) -> rquickjs::Result<T>,
    {
        self.context.with(f).map_err(anyhow::Error::from)
    }
}

fn install_globals(ctx: Ctx<'_>) -> rquickjs::Result<()> {
    let sink = Function::new(ctx.clone(), console_sink)?.with_name("__bridge_log")?;
    ctx.globals().set("__bridge_log", sink)?;
    ctx.eval::<(), _>(GLOBALS_BOOTSTRAP)
}

fn console_sink(level: String, message: String) -> rquickjs::Result<()> {
    match level.as_str() {
        "error" => error!(target: "userscript::console", "{message}"),
        "warn" => warn!(target: "userscript::console", "{message}"),
        "debug" => debug!(target: "userscript::console", "{message}"),
        "trace" => trace!(target: "userscript::console", "{message}"),
        _ => info!(target: "userscript::console", "{message}"),
    }
    Ok(())
}

/// Append a `sourceURL` pragma so stack traces name the userscript file.
pub(crate) fn with_source_url(source: &str, filename: &str) -> Vec<u8> {
    let newline = if source.ends_with('\n') { "" } else { "\n" };
    format!("{source}{newline}//# sourceURL={filename}\n").into_bytes()
}

/// Take the pending exception and render it as text, stack included when
/// QuickJS recorded one.
pub(crate) fn exception_message(ctx: &Ctx<'_>) -> String {
    let exception: Value = ctx.catch();

    if let Some(error) = exception.as_object() {
        let message = error.get::<_, Option<String>>("message").ok().flatten();
        let stack = error
            .get::<_, Option<String>>("stack")
            .ok()
            .flatten()
            .filter(|stack| !stack.trim().is_empty());
        match (message, stack) {
            (Some(message), Some(stack)) => return format!("{message}\n{stack}"),
            (Some(message), None) => return message,
            _ => {}
        }
    }

    match exception.as_string().and_then(|text| text.to_string().ok()) {
        Some(text) => text,
        None => format!("{exception:?}"),
    }
}

// `console.*` maps onto tracing levels through `__bridge_log(level, text)`.
const GLOBALS_BOOTSTRAP: &str = r#"
globalThis.self ??= globalThis;
globalThis.window ??= globalThis;
{
    const sink = globalThis.__bridge_log;
    const text = (value) => {
        if (typeof value === 'string') return value;
        if (typeof value === 'object' && value !== null) {
            try { return JSON.stringify(value); } catch (_) { /* cyclic */ }
        }
        return String(value);
    };
    const levels = { log: 'info', info: 'info', warn: 'warn', error: 'error', debug: 'debug', trace: 'trace' };
    const target = typeof globalThis.console === 'object' && globalThis.console !== null
        ? globalThis.console
        : (globalThis.console = {});
    for (const [method, level] of Object.entries(levels)) {
        target[method] = (...args) => {
            try { sink(level, args.map(text).join(' ')); } catch (_) { /* never throw from console */ }
        };
    }
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_url_is_appended_once() {
        let script = String::from_utf8(with_source_url("1 + 1", "a.user.js")).unwrap();
        assert_eq!(script, "1 + 1\n//# sourceURL=a.user.js\n");
        let script = String::from_utf8(with_source_url("x\n", "b.js")).unwrap();
        assert_eq!(script, "x\n//# sourceURL=b.js\n");
    }

    #[test]
    fn thrown_strings_keep_their_text() {
        let engine = QuickJsEngine::new().unwrap();
        let err = engine.eval("throw 'plain text'", "s.js").unwrap_err();
        assert_eq!(err.to_string(), "plain text");
    }

    #[test]
    fn console_accepts_every_level() {
        let engine = QuickJsEngine::new().unwrap();
        let ok: bool = engine
            .eval_with(
                "console.warn('w', {a: 1}); console.error(new Error('e')); console.debug(); true",
                "console.js",
            )
            .unwrap();
        assert!(ok);
    }
}
