use std::rc::Rc;

use super::message::Envelope;
use super::Mode;

/// Physical delivery of envelopes to the adjacent realm.
pub trait Transport {
    fn post(&self, envelope: Envelope);
}

impl<F> Transport for F
where
    F: Fn(Envelope),
{
    fn post(&self, envelope: Envelope) {
        self(envelope)
    }
}

/// Function supplied by the host when the bridge lives in the content realm.
/// The second argument tags the realm the message originates from.
pub type HostInvoker = Rc<dyn Fn(Envelope, Mode)>;

/// Function handed back to the host so it can forward page-realm messages
/// into a content-mode bridge.
pub type GuestInvoker = Rc<dyn Fn(Envelope)>;

/// CONTENT-mode delivery: every outbound envelope goes straight to the host.
pub struct HostInvokerTransport {
    invoker: HostInvoker,
}

impl HostInvokerTransport {
    pub fn new(invoker: HostInvoker) -> Self {
        Self { invoker }
    }
}

impl Transport for HostInvokerTransport {
    fn post(&self, envelope: Envelope) {
        (self.invoker)(envelope, Mode::Content)
    }
}
