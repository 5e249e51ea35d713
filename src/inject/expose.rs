use serde_json::{json, Value};

use crate::bridge::{BridgeError, CommandName, WeakBridge};

/// The object a page receives after explicitly asking for it with `Expose`.
/// Nothing here is reachable before that request.
#[derive(Clone)]
pub struct ExposedApi {
    version: &'static str,
    bridge: WeakBridge,
}

impl ExposedApi {
    pub(crate) fn new(bridge: WeakBridge) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            bridge,
        }
    }

    pub fn version(&self) -> &str {
        self.version
    }

    /// Ask the background whether a script with this name and namespace is
    /// installed.
    pub async fn is_installed(&self, name: &str, namespace: &str) -> Result<bool, BridgeError> {
        let bridge = self.bridge.upgrade().ok_or(BridgeError::NotConnected)?;
        let reply = bridge
            .send(
                CommandName::CheckScript,
                json!({ "name": name, "namespace": namespace }),
            )
            .await?;
        Ok(is_truthy(&reply))
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().map(|n| n != 0.0).unwrap_or(true),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
