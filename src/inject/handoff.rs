use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, error};

use super::capability::{Capability, CapabilityScope};
use super::intake::{Captured, ScriptItem};
use super::InjectorCore;

/// Anything a userscript can fail with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error("uncaught exception: {0}")]
    Thrown(String),
    #[error("userscript panicked: {0}")]
    Panicked(String),
    #[error("{0}")]
    Reported(String),
}

/// A compiled userscript, delivered by the loader through a data key.
///
/// The capability object is the script's `this`. The logger is handed in as
/// an argument for errors the script reports itself (for example from its own
/// callbacks). A returned error is reported by the handoff.
pub trait Userscript {
    fn run(self: Box<Self>, gm: Rc<dyn Capability>, on_error: ErrorLogger) -> Result<(), ScriptError>;
}

impl<F> Userscript for F
where
    F: FnOnce(Rc<dyn Capability>, ErrorLogger) -> Result<(), ScriptError>,
{
    fn run(self: Box<Self>, gm: Rc<dyn Capability>, on_error: ErrorLogger) -> Result<(), ScriptError> {
        (*self)(gm, on_error)
    }
}

/// Receives every userscript failure: the script's display name and the error.
pub type ErrorSink = Rc<dyn Fn(&str, &ScriptError)>;

pub fn log_script_error(script: &str, err: &ScriptError) {
    error!(target: "userscript", script, error = %err, "userscript failed");
}

#[derive(Clone)]
pub struct ErrorLogger {
    script: Rc<str>,
    sink: ErrorSink,
}

impl ErrorLogger {
    pub fn new(script: &str, sink: ErrorSink) -> Self {
        Self {
            script: Rc::from(script),
            sink,
        }
    }

    pub fn report(&self, err: &ScriptError) {
        (self.sink)(&*self.script, err);
    }

    pub fn report_message(&self, message: impl Into<String>) {
        self.report(&ScriptError::Reported(message.into()));
    }
}

impl fmt::Debug for ErrorLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorLogger")
            .field("script", &self.script)
            .finish_non_exhaustive()
    }
}

/// The DOM node whose evaluation delivered a userscript.
pub trait CarrierElement {
    fn detach(&self);
}

/// Host-environment hooks the injector cannot provide itself.
pub trait PageHost {
    /// The carrier element currently being evaluated, if any.
    fn current_carrier(&self) -> Option<Box<dyn CarrierElement>>;

    /// Make an ambient global unreadable from the page.
    fn suppress_global(&self, name: &str);
}

/// Host with no document and no ambient globals.
#[derive(Debug, Default)]
pub struct DetachedHost;

impl PageHost for DetachedHost {
    fn current_carrier(&self) -> Option<Box<dyn CarrierElement>> {
        None
    }

    fn suppress_global(&self, _name: &str) {}
}

/// Take a captured script the rest of the way: drop its carrier, then run it
/// now or once its stage allows.
///
/// The data key is already gone by the time this runs; `GlobalSlots` removes
/// it as part of producing the capture.
pub(crate) fn hand_off(core: &Rc<InjectorCore>, captured: Captured) {
    let Captured { item, script } = captured;
    debug!(
        target: "handoff",
        mode = core.state.mode().as_str(),
        script = %item.display_name(),
        "userscript captured"
    );

    if let Some(carrier) = core.host.current_carrier() {
        carrier.detach();
    }

    match item.stage {
        Some(stage) => {
            let weak = Rc::downgrade(core);
            core.gate.schedule(
                stage,
                Box::new(move || {
                    if let Some(core) = weak.upgrade() {
                        execute(&core, &item, script);
                    }
                }),
            );
        }
        None => execute(core, &item, script),
    }
}

fn execute(core: &Rc<InjectorCore>, item: &ScriptItem, script: Box<dyn Userscript>) {
    let scope = CapabilityScope {
        state: Rc::clone(&core.state),
        bridge: core.bridge.clone(),
    };
    let gm = core.capabilities.wrap(item, &scope);
    let logger = ErrorLogger::new(&item.display_name(), Rc::clone(&core.error_sink));

    let outcome = catch_unwind(AssertUnwindSafe(|| script.run(gm, logger.clone())));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => logger.report(&err),
        Err(panic) => logger.report(&ScriptError::Panicked(panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
