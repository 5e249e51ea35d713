//! Page-realm signalling through named custom events.
//!
//! Both sides of a PAGE-mode bridge share one [`PageEvents`] bus (the page's
//! `window`). Each side listens on its own event name and dispatches on the
//! other's, so two extension instances on the same page stay isolated as long
//! as their id pairs differ. Details cross the bus as JSON text, the same way a
//! structured clone would strip anything that is not plain data.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::{debug, warn};

use super::message::Envelope;
use super::transport::Transport;
use super::WeakBridge;

type Listener = Rc<dyn Fn(&str)>;

#[derive(Clone, Default)]
pub struct PageEvents {
    listeners: Rc<RefCell<HashMap<String, Vec<Listener>>>>,
}

impl PageEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, event: &str, listener: impl Fn(&str) + 'static) {
        self.listeners
            .borrow_mut()
            .entry(event.to_string())
            .or_default()
            .push(Rc::new(listener));
    }

    /// Synchronously run every listener registered for `event`.
    pub fn dispatch(&self, event: &str, detail: &str) -> usize {
        let listeners = self
            .listeners
            .borrow()
            .get(event)
            .cloned()
            .unwrap_or_default();
        for listener in &listeners {
            listener(detail);
        }
        listeners.len()
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners
            .borrow()
            .get(event)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

/// Outbound half of a PAGE-mode channel.
pub struct PageEventTransport {
    events: PageEvents,
    post_id: String,
}

impl Transport for PageEventTransport {
    fn post(&self, envelope: Envelope) {
        match serde_json::to_string(&envelope) {
            Ok(detail) => {
                if self.events.dispatch(&self.post_id, &detail) == 0 {
                    debug!(target: "bridge", event = %self.post_id, cmd = %envelope.command, "no listener for page event");
                }
            }
            Err(err) => {
                warn!(target: "bridge", error = %err, cmd = %envelope.command, "failed to encode envelope");
            }
        }
    }
}

/// Listen for envelopes on `listen_id` and return the transport that posts on
/// `post_id`. The counterpart binds the same two ids the other way round.
pub fn bind_events(
    events: &PageEvents,
    listen_id: &str,
    post_id: &str,
    bridge: WeakBridge,
) -> PageEventTransport {
    events.add_listener(listen_id, move |detail| {
        let Some(bridge) = bridge.upgrade() else {
            return;
        };
        match serde_json::from_str::<Envelope>(detail) {
            Ok(envelope) => bridge.handle(envelope),
            Err(err) => debug!(target: "bridge", error = %err, "ignoring malformed page event"),
        }
    });
    PageEventTransport {
        events: events.clone(),
        post_id: post_id.to_string(),
    }
}
