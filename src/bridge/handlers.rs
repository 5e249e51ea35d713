use std::collections::HashMap;
use std::rc::Rc;

use serde_json::{json, Value};
use tracing::debug;

use super::message::CommandName;
use super::WeakBridge;

/// Local handler for one inbound command.
pub type Handler = Rc<dyn Fn(Value, Responder)>;

/// Lets a handler answer a `send` from the other realm.
///
/// Envelopes that were posted without a callback id produce a responder whose
/// `reply` does nothing.
pub struct Responder {
    callback_id: Option<String>,
    bridge: WeakBridge,
}

impl Responder {
    pub(crate) fn new(callback_id: Option<String>, bridge: WeakBridge) -> Self {
        Self {
            callback_id,
            bridge,
        }
    }

    pub fn expects_reply(&self) -> bool {
        self.callback_id.is_some()
    }

    pub fn callback_id(&self) -> Option<&str> {
        self.callback_id.as_deref()
    }

    pub fn reply(self, payload: Value) {
        let Some(callback_id) = self.callback_id else {
            return;
        };
        match self.bridge.upgrade() {
            Some(bridge) => bridge.post(
                CommandName::Callback,
                json!({ "callbackId": callback_id, "payload": payload }),
            ),
            None => debug!(target: "bridge", %callback_id, "bridge dropped before reply"),
        }
    }
}

/// Maps command names to handlers. Later registrations replace earlier ones.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<CommandName, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: CommandName, handler: Handler) {
        if self.handlers.insert(name, handler).is_some() {
            debug!(target: "bridge", command = %name, "handler replaced");
        }
    }

    pub fn extend<I>(&mut self, handlers: I)
    where
        I: IntoIterator<Item = (CommandName, Handler)>,
    {
        for (name, handler) in handlers {
            self.insert(name, handler);
        }
    }

    /// Clone the handler out so dispatch never holds the registry borrowed
    /// while user code runs.
    pub fn get(&self, name: CommandName) -> Option<Handler> {
        self.handlers.get(&name).cloned()
    }

    pub fn contains(&self, name: CommandName) -> bool {
        self.handlers.contains_key(&name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn recording(log: &Rc<RefCell<Vec<&'static str>>>, tag: &'static str) -> Handler {
        let log = Rc::clone(log);
        Rc::new(move |_payload, _responder| log.borrow_mut().push(tag))
    }

    #[test]
    fn last_registration_wins() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry.insert(CommandName::Ping, recording(&log, "default"));
        registry.extend([(CommandName::Ping, recording(&log, "override"))]);

        assert_eq!(registry.len(), 1);
        let handler = registry.get(CommandName::Ping).unwrap();
        handler(Value::Null, Responder::new(None, WeakBridge::default()));
        assert_eq!(*log.borrow(), vec!["override"]);
    }

    #[test]
    fn missing_handler_is_none() {
        let registry = HandlerRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.get(CommandName::Expose).is_none());
    }

    #[test]
    fn reply_without_callback_id_is_silent() {
        let responder = Responder::new(None, WeakBridge::default());
        assert!(!responder.expects_reply());
        responder.reply(json!(1));
    }
}
