//! QuickJS host integration: evaluates userscript bodies handed over by the
//! injector.

pub mod runtime;
pub mod userscript;

pub use runtime::QuickJsEngine;
pub use userscript::QuickJsUserscript;
