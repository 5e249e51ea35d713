use std::rc::Rc;

use rquickjs::function::This;
use rquickjs::{Ctx, Error as JsError, Function, Object, Undefined, Value};
use tracing::debug;

use super::runtime::{exception_message, with_source_url, QuickJsEngine};
use crate::inject::{Capability, ErrorLogger, ScriptError, Userscript};

/// Userscript body evaluated in a [`QuickJsEngine`].
///
/// The body runs inside a function whose `this` is a frozen capability object
/// and whose single argument is `logError`. The `GM_*` members are also
/// destructured into local bindings so classic userscripts find them by name.
/// A body that returns a promise has its rejection passed to `logError`.
pub struct QuickJsUserscript {
    engine: Rc<QuickJsEngine>,
    source: String,
    filename: String,
}

impl QuickJsUserscript {
    pub fn new(engine: Rc<QuickJsEngine>, source: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            engine,
            source: source.into(),
            filename: filename.into(),
        }
    }

    pub fn boxed(self) -> Box<dyn Userscript> {
        Box::new(self)
    }
}

impl Userscript for QuickJsUserscript {
    fn run(self: Box<Self>, gm: Rc<dyn Capability>, on_error: ErrorLogger) -> Result<(), ScriptError> {
        let info_json = gm.info().to_string();
        let body = wrap_body(&self.source, &self.filename);

        let outcome = self.engine.with_context(|ctx| {
            match invoke(&ctx, &gm, &on_error, &info_json, body) {
                Ok(()) => Ok(None),
                Err(JsError::Exception) => Ok(Some(exception_message(&ctx))),
                Err(err) => Err(err),
            }
        });

        match outcome {
            Ok(None) => {}
            Ok(Some(message)) => return Err(ScriptError::Thrown(message)),
            Err(err) => return Err(ScriptError::Thrown(err.to_string())),
        }

        // Jobs drained here may include ones queued by scripts that ran
        // earlier on the same engine; they surface under this script.
        for failure in self.engine.drain_jobs() {
            on_error.report(&ScriptError::Thrown(failure));
        }
        Ok(())
    }
}

fn invoke<'js>(
    ctx: &Ctx<'js>,
    gm: &Rc<dyn Capability>,
    on_error: &ErrorLogger,
    info_json: &str,
    body: Vec<u8>,
) -> rquickjs::Result<()> {
    let factory: Function = ctx.eval(CAPABILITY_FACTORY.as_bytes())?;
    let info = ctx.json_parse(info_json.as_bytes())?;

    let get_value = {
        let gm = Rc::clone(gm);
        Function::new(ctx.clone(), move |key: String| -> rquickjs::Result<Option<String>> {
            Ok(gm.get_value(&key).map(|value| value.to_string()))
        })?
    };
    let set_value = {
        let gm = Rc::clone(gm);
        Function::new(ctx.clone(), move |key: String, json: String| -> rquickjs::Result<()> {
            match serde_json::from_str(&json) {
                Ok(value) => gm.set_value(&key, value),
                Err(err) => debug!(target: "quickjs", %key, error = %err, "unserializable value"),
            }
            Ok(())
        })?
    };
    let delete_value = {
        let gm = Rc::clone(gm);
        Function::new(ctx.clone(), move |key: String| -> rquickjs::Result<()> {
            gm.delete_value(&key);
            Ok(())
        })?
    };
    let list_values = {
        let gm = Rc::clone(gm);
        Function::new(ctx.clone(), move || -> rquickjs::Result<Vec<String>> {
            Ok(gm.list_values())
        })?
    };
    let log = {
        let logger = on_error.clone();
        Function::new(ctx.clone(), move |message: String| -> rquickjs::Result<()> {
            logger.report_message(message);
            Ok(())
        })?
    };

    let handles: Object = factory.call((info, get_value, set_value, delete_value, list_values, log))?;
    let this: Object = handles.get("gm")?;
    let log_error: Function = handles.get("logError")?;

    let script: Function = ctx.eval(body)?;
    let completion: Value = script.call((This(this), log_error.clone()))?;

    // A body that returns a promise has its rejection reported like a throw.
    if let Some(promise) = completion.as_object() {
        if let Ok(then) = promise.get::<_, Function>("then") {
            then.call::<_, ()>((This(promise.clone()), Undefined, log_error))?;
        }
    }
    Ok(())
}

fn wrap_body(source: &str, filename: &str) -> Vec<u8> {
    let mut wrapped = String::with_capacity(source.len() + 160);
    wrapped.push_str("(function (logError) {\n");
    wrapped.push_str(
        "const { GM_info, GM_getValue, GM_setValue, GM_deleteValue, GM_listValues } = this;\n",
    );
    wrapped.push_str(source);
    wrapped.push_str("\n})");
    with_source_url(&wrapped, filename)
}

const CAPABILITY_FACTORY: &str = r#"
(function (info, getValue, setValue, deleteValue, listValues, log) {
    const gm = Object.freeze({
        GM_info: info,
        GM_getValue(key, fallback) {
            const raw = getValue(String(key));
            return raw === undefined ? fallback : JSON.parse(raw);
        },
        GM_setValue(key, value) {
            setValue(String(key), JSON.stringify(value === undefined ? null : value));
        },
        GM_deleteValue(key) {
            deleteValue(String(key));
        },
        GM_listValues() {
            return listValues();
        },
    });
    const logError = (err) =>
        log(err && err.message !== undefined ? String(err.message) : String(err));
    return { gm, logError };
})
"#;
