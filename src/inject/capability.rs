//! The API surface a userscript sees instead of the extension's privileged
//! globals.

use std::rc::Rc;

use futures_util::future::{FutureExt, LocalBoxFuture};
use serde_json::{json, Value};

use super::intake::{ScriptId, ScriptItem};
use crate::bridge::{Bridge, BridgeError, CommandName};
use crate::state::BridgeState;

/// Handles a capability factory may hold on to.
#[derive(Clone)]
pub struct CapabilityScope {
    pub state: Rc<BridgeState>,
    pub bridge: Bridge,
}

pub trait Capability {
    fn script_id(&self) -> &ScriptId;

    /// `GM_info`-style description of the running script and handler.
    fn info(&self) -> Value;

    fn get_value(&self, key: &str) -> Option<Value>;

    fn set_value(&self, key: &str, value: Value);

    fn delete_value(&self, key: &str);

    fn list_values(&self) -> Vec<String>;

    /// Ask the counterpart realm for something and wait for its answer.
    fn request(
        &self,
        command: CommandName,
        payload: Value,
    ) -> LocalBoxFuture<'static, Result<Value, BridgeError>>;
}

pub trait CapabilityFactory {
    fn wrap(&self, item: &ScriptItem, scope: &CapabilityScope) -> Rc<dyn Capability>;
}

/// Builds [`GmCapability`] objects.
#[derive(Debug, Clone)]
pub struct GmCapabilityFactory {
    handler_name: String,
}

impl GmCapabilityFactory {
    pub fn new(handler_name: impl Into<String>) -> Self {
        Self {
            handler_name: handler_name.into(),
        }
    }
}

impl Default for GmCapabilityFactory {
    fn default() -> Self {
        Self::new(env!("CARGO_PKG_NAME"))
    }
}

impl CapabilityFactory for GmCapabilityFactory {
    fn wrap(&self, item: &ScriptItem, scope: &CapabilityScope) -> Rc<dyn Capability> {
        Rc::new(GmCapability {
            item: item.clone(),
            handler_name: self.handler_name.clone(),
            state: Rc::clone(&scope.state),
            bridge: scope.bridge.clone(),
        })
    }
}

/// Default capability object backed by the realm's isolated value store.
pub struct GmCapability {
    item: ScriptItem,
    handler_name: String,
    state: Rc<BridgeState>,
    bridge: Bridge,
}

impl GmCapability {
    fn announce_update(&self, key: &str, value: Option<Value>) {
        self.bridge.post(
            CommandName::UpdateValue,
            json!({
                "id": self.item.id,
                "key": key,
                "value": value,
            }),
        );
    }
}

impl Capability for GmCapability {
    fn script_id(&self) -> &ScriptId {
        &self.item.id
    }

    fn info(&self) -> Value {
        let cache = self.state.cache();
        json!({
            "script": self.item.meta,
            "scriptHandler": self.handler_name,
            "version": env!("CARGO_PKG_VERSION"),
            "userAgent": cache.user_agent,
            "isFirefox": cache.is_firefox,
            "cache": cache.shared,
            "injectInto": self.state.mode().as_str(),
        })
    }

    fn get_value(&self, key: &str) -> Option<Value> {
        self.state.value(&self.item.id, key)
    }

    fn set_value(&self, key: &str, value: Value) {
        self.state.set_value(&self.item.id, key, value.clone());
        self.announce_update(key, Some(value));
    }

    fn delete_value(&self, key: &str) {
        if self.state.delete_value(&self.item.id, key).is_some() {
            self.announce_update(key, None);
        }
    }

    fn list_values(&self) -> Vec<String> {
        self.state.value_keys(&self.item.id)
    }

    fn request(
        &self,
        command: CommandName,
        payload: Value,
    ) -> LocalBoxFuture<'static, Result<Value, BridgeError>> {
        self.bridge.send(command, payload).boxed_local()
    }
}
