//! Message bridge between two adjacent realms.

mod callbacks;
mod handlers;
mod message;
mod page_events;
mod transport;

use std::cell::RefCell;
use std::future::Future;
use std::rc::{Rc, Weak};

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

pub use callbacks::CallbackTable;
pub use handlers::{Handler, HandlerRegistry, Responder};
pub use message::{CallbackReply, CommandName, Envelope, UnknownCommand};
pub use page_events::{bind_events, PageEventTransport, PageEvents};
pub use transport::{GuestInvoker, HostInvoker, HostInvokerTransport, Transport};

/// Which realm this bridge lives in. Fixed for the realm's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Page,
    Content,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Page => "page",
            Mode::Content => "content",
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("reply channel closed before a reply arrived")]
    ReplyDropped,
    #[error("no transport connected")]
    NotConnected,
    #[error("PAGE mode needs a page event bus")]
    MissingPageEvents,
    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
}

struct BridgeInner {
    mode: Mode,
    transport: RefCell<Option<Rc<dyn Transport>>>,
    handlers: RefCell<HandlerRegistry>,
    callbacks: RefCell<CallbackTable>,
}

/// One realm's end of the channel: outbound delivery, inbound dispatch and
/// reply correlation.
///
/// Cloning is cheap and every clone talks to the same handler set.
#[derive(Clone)]
pub struct Bridge {
    inner: Rc<BridgeInner>,
}

/// Non-owning handle, used by handlers that need to reach their own bridge.
#[derive(Clone)]
pub struct WeakBridge {
    inner: Weak<BridgeInner>,
}

impl Default for WeakBridge {
    fn default() -> Self {
        Self { inner: Weak::new() }
    }
}

impl WeakBridge {
    pub fn upgrade(&self) -> Option<Bridge> {
        self.inner.upgrade().map(|inner| Bridge { inner })
    }
}

impl Bridge {
    pub fn new(mode: Mode) -> Self {
        let bridge = Self {
            inner: Rc::new(BridgeInner {
                mode,
                transport: RefCell::new(None),
                handlers: RefCell::new(HandlerRegistry::new()),
                callbacks: RefCell::new(CallbackTable::new()),
            }),
        };

        let weak = bridge.downgrade();
        bridge.add_typed_handler(CommandName::Callback, move |reply: CallbackReply, _| {
            if let Some(bridge) = weak.upgrade() {
                bridge.resolve_callback(reply);
            }
        });

        bridge
    }

    /// PAGE-mode bridge wired to `events`: listens on `listen_id`, posts on
    /// `post_id`.
    pub fn over_page_events(mode: Mode, events: &PageEvents, listen_id: &str, post_id: &str) -> Self {
        let bridge = Self::new(mode);
        let transport = bind_events(events, listen_id, post_id, bridge.downgrade());
        bridge.connect(Rc::new(transport));
        bridge
    }

    pub fn mode(&self) -> Mode {
        self.inner.mode
    }

    pub fn downgrade(&self) -> WeakBridge {
        WeakBridge {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn connect(&self, transport: Rc<dyn Transport>) {
        *self.inner.transport.borrow_mut() = Some(transport);
    }

    pub fn is_connected(&self) -> bool {
        self.inner.transport.borrow().is_some()
    }

    pub fn add_handlers<I>(&self, handlers: I)
    where
        I: IntoIterator<Item = (CommandName, Handler)>,
    {
        self.inner.handlers.borrow_mut().extend(handlers);
    }

    pub fn add_handler(&self, name: CommandName, handler: impl Fn(Value, Responder) + 'static) {
        self.inner.handlers.borrow_mut().insert(name, Rc::new(handler));
    }

    /// Register a handler whose payload is decoded into `T` first. Payloads of
    /// the wrong shape are treated like an unknown command.
    pub fn add_typed_handler<T, F>(&self, name: CommandName, handler: F)
    where
        T: DeserializeOwned,
        F: Fn(T, Responder) + 'static,
    {
        self.add_handler(name, move |payload, responder| {
            match serde_json::from_value::<T>(payload) {
                Ok(decoded) => handler(decoded, responder),
                Err(err) => {
                    debug!(target: "bridge", command = %name, error = %err, "ignoring malformed payload")
                }
            }
        });
    }

    pub fn has_handler(&self, name: CommandName) -> bool {
        self.inner.handlers.borrow().contains(name)
    }

    /// Route one inbound envelope to its handler. Unknown commands are ignored.
    pub fn handle(&self, envelope: Envelope) {
        let Some(name) = envelope.command_name() else {
            debug!(target: "bridge", mode = self.mode().as_str(), cmd = %envelope.command, "ignoring unknown command");
            return;
        };
        let handler = self.inner.handlers.borrow().get(name);
        match handler {
            Some(handler) => {
                let responder = Responder::new(envelope.callback_id, self.downgrade());
                handler(envelope.payload, responder);
            }
            None => {
                debug!(target: "bridge", mode = self.mode().as_str(), command = %name, "no handler registered")
            }
        }
    }

    /// Fire-and-forget delivery.
    pub fn post(&self, command: CommandName, payload: Value) {
        self.transmit(Envelope::new(command, payload));
    }

    /// Deliver an envelope and wait for the matching `Callback`.
    ///
    /// The returned future owns nothing borrowed from the bridge, so other
    /// inbound messages keep flowing while it is pending.
    pub fn send(
        &self,
        command: CommandName,
        payload: Value,
    ) -> impl Future<Output = Result<Value, BridgeError>> + 'static {
        let (callback_id, rx) = self.inner.callbacks.borrow_mut().register();
        self.transmit(Envelope::new(command, payload).with_callback(callback_id));
        async move { rx.await.map_err(|_| BridgeError::ReplyDropped) }
    }

    pub fn pending_callbacks(&self) -> usize {
        self.inner.callbacks.borrow().len()
    }

    fn resolve_callback(&self, reply: CallbackReply) {
        let resolved = self
            .inner
            .callbacks
            .borrow_mut()
            .resolve(&reply.callback_id, reply.payload);
        if !resolved {
            debug!(target: "bridge", callback_id = %reply.callback_id, "ignoring stray callback");
        }
    }

    fn transmit(&self, envelope: Envelope) {
        let transport = self.inner.transport.borrow().clone();
        match transport {
            Some(transport) => transport.post(envelope),
            None => {
                warn!(target: "bridge", cmd = %envelope.command, error = %BridgeError::NotConnected, "dropping outbound envelope")
            }
        }
    }
}
