//! Injection coordinator for one realm.
//!
//! An [`Injector`] is created once per page load. It receives `ScriptData`
//! batches over its [`Bridge`], pairs every descriptor with the compiled
//! function the loader assigns to the descriptor's data key, and runs the
//! pair with a capability object once the descriptor's stage allows.
//!
//! Gated runs and `SetTimeout` replies are spawned with
//! `tokio::task::spawn_local`, so the injector must live inside a
//! `tokio::task::LocalSet`.

mod capability;
mod expose;
mod handoff;
mod intake;
mod stage;

use std::rc::Rc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

pub use capability::{
    Capability, CapabilityFactory, CapabilityScope, GmCapability, GmCapabilityFactory,
};
pub use expose::ExposedApi;
pub use handoff::{
    log_script_error, CarrierElement, DetachedHost, ErrorLogger, ErrorSink, PageHost,
    ScriptError, Userscript,
};
pub use intake::{
    Captured, CustomMeta, DataKey, GlobalSlots, ScriptBatch, ScriptId, ScriptItem, ScriptMeta,
};
pub(crate) use intake::null_as_default;
pub use stage::{Deferral, RoundTripDeferral, Stage, StageGate, TimerDeferral};

use crate::bridge::{
    bind_events, Bridge, BridgeError, CommandName, Envelope, GuestInvoker, HostInvoker,
    HostInvokerTransport, Mode, PageEvents,
};
use crate::config::{BridgeConfig, IdleDefer};
use crate::state::BridgeState;

pub(crate) struct InjectorCore {
    pub(crate) bridge: Bridge,
    pub(crate) state: Rc<BridgeState>,
    pub(crate) gate: StageGate,
    pub(crate) slots: GlobalSlots,
    pub(crate) host: Rc<dyn PageHost>,
    pub(crate) capabilities: Rc<dyn CapabilityFactory>,
    pub(crate) error_sink: ErrorSink,
}

pub struct InjectorBuilder {
    page_id: String,
    content_id: String,
    host_invoker: Option<HostInvoker>,
    page_events: Option<PageEvents>,
    host: Option<Rc<dyn PageHost>>,
    capabilities: Option<Rc<dyn CapabilityFactory>>,
    error_sink: Option<ErrorSink>,
    deferral: Option<Rc<dyn Deferral>>,
    config: BridgeConfig,
}

impl InjectorBuilder {
    fn new(page_id: &str, content_id: &str) -> Self {
        Self {
            page_id: page_id.to_string(),
            content_id: content_id.to_string(),
            host_invoker: None,
            page_events: None,
            host: None,
            capabilities: None,
            error_sink: None,
            deferral: None,
            config: BridgeConfig::default(),
        }
    }

    /// Supplying an invoker puts the injector in CONTENT mode.
    pub fn host_invoker(mut self, invoker: HostInvoker) -> Self {
        self.host_invoker = Some(invoker);
        self
    }

    /// Event bus used in PAGE mode.
    pub fn page_events(mut self, events: PageEvents) -> Self {
        self.page_events = Some(events);
        self
    }

    pub fn host(mut self, host: Rc<dyn PageHost>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn capabilities(mut self, factory: Rc<dyn CapabilityFactory>) -> Self {
        self.capabilities = Some(factory);
        self
    }

    pub fn error_sink(mut self, sink: ErrorSink) -> Self {
        self.error_sink = Some(sink);
        self
    }

    /// Overrides the deferment chosen by `config.idle_defer`.
    pub fn deferral(mut self, deferral: Rc<dyn Deferral>) -> Self {
        self.deferral = Some(deferral);
        self
    }

    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn initialize(self) -> Result<Injector, BridgeError> {
        let mode = if self.host_invoker.is_some() {
            Mode::Content
        } else {
            Mode::Page
        };
        let page_events = match mode {
            Mode::Page => Some(self.page_events.ok_or(BridgeError::MissingPageEvents)?),
            Mode::Content => None,
        };

        let bridge = Bridge::new(mode);
        let deferral: Rc<dyn Deferral> = match self.deferral {
            Some(deferral) => deferral,
            None => match self.config.idle_defer {
                IdleDefer::RoundTrip => Rc::new(RoundTripDeferral::new(bridge.downgrade())),
                IdleDefer::LocalTimer => Rc::new(TimerDeferral),
            },
        };
        let host: Rc<dyn PageHost> = match self.host {
            Some(host) => host,
            None => Rc::new(DetachedHost),
        };
        let capabilities: Rc<dyn CapabilityFactory> = match self.capabilities {
            Some(factory) => factory,
            None => Rc::new(GmCapabilityFactory::new(self.config.handler_name.clone())),
        };
        let error_sink: ErrorSink = match self.error_sink {
            Some(sink) => sink,
            None => Rc::new(log_script_error),
        };

        let core = Rc::new(InjectorCore {
            bridge: bridge.clone(),
            state: Rc::new(BridgeState::new(mode)),
            gate: StageGate::new(deferral),
            slots: GlobalSlots::new(),
            host,
            capabilities,
            error_sink,
        });

        install_common_handlers(&core);

        let guest = match (self.host_invoker, page_events) {
            (Some(invoker), _) => {
                bridge.connect(Rc::new(HostInvokerTransport::new(invoker)));
                for name in &self.config.suppressed_globals {
                    core.host.suppress_global(name);
                }
                install_content_handlers(&core);
                let weak = bridge.downgrade();
                let guest: GuestInvoker = Rc::new(move |envelope: Envelope| {
                    if let Some(bridge) = weak.upgrade() {
                        bridge.handle(envelope);
                    }
                });
                Some(guest)
            }
            (None, Some(events)) => {
                let transport =
                    bind_events(&events, &self.page_id, &self.content_id, bridge.downgrade());
                bridge.connect(Rc::new(transport));
                install_page_handlers(&core);
                None
            }
            (None, None) => return Err(BridgeError::MissingPageEvents),
        };

        debug!(target: "inject", mode = mode.as_str(), "injector initialized");
        Ok(Injector { core, guest })
    }
}

/// One realm's injection coordinator.
pub struct Injector {
    core: Rc<InjectorCore>,
    guest: Option<GuestInvoker>,
}

impl Injector {
    pub fn builder(page_id: &str, content_id: &str) -> InjectorBuilder {
        InjectorBuilder::new(page_id, content_id)
    }

    pub fn mode(&self) -> Mode {
        self.core.state.mode()
    }

    pub fn bridge(&self) -> &Bridge {
        &self.core.bridge
    }

    pub fn state(&self) -> Rc<BridgeState> {
        Rc::clone(&self.core.state)
    }

    /// Inbound-delivery function for the host. Only present in CONTENT mode.
    pub fn guest_invoker(&self) -> Option<GuestInvoker> {
        self.guest.clone()
    }

    /// The loader assigned `script` to the global `key`.
    pub fn assign_global(&self, key: &DataKey, script: Box<dyn Userscript>) {
        let captured = self.core.slots.assign(key, script);
        if let Some(captured) = captured {
            handoff::hand_off(&self.core, captured);
        }
    }

    /// Whether the temporary global `key` still exists.
    pub fn has_global(&self, key: &DataKey) -> bool {
        self.core.slots.contains(key)
    }

    pub fn signal_stage(&self, stage: Stage) -> bool {
        self.core.gate.signal(stage)
    }

    pub fn has_stage_waiter(&self, stage: Stage) -> bool {
        self.core.gate.has_waiter(stage)
    }

    pub fn register_command(&self, name: &str, command: impl Fn() + 'static) {
        self.core.state.register_command(name, Rc::new(command));
    }

    pub fn exposed(&self) -> Option<ExposedApi> {
        self.core.state.exposed()
    }
}

fn install_common_handlers(core: &Rc<InjectorCore>) {
    let bridge = &core.bridge;

    let weak = Rc::downgrade(core);
    bridge.add_typed_handler(CommandName::Command, move |name: String, _| {
        let Some(core) = weak.upgrade() else {
            return;
        };
        if !core.state.run_command(&name) {
            debug!(target: "inject", command = %name, "no local command registered");
        }
    });

    let weak = Rc::downgrade(core);
    bridge.add_typed_handler(CommandName::ScriptData, move |batch: ScriptBatch, _| {
        if let Some(core) = weak.upgrade() {
            receive_batch(&core, batch);
        }
    });

    let weak = Rc::downgrade(core);
    bridge.add_handler(CommandName::Expose, move |_, _| {
        if let Some(core) = weak.upgrade() {
            core.state
                .set_exposed(ExposedApi::new(core.bridge.downgrade()));
        }
    });

    bridge.add_handler(CommandName::SetTimeout, |payload, responder| {
        let delay = Duration::from_millis(payload.as_u64().unwrap_or(0));
        tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            responder.reply(Value::Null);
        });
    });
}

fn install_content_handlers(core: &Rc<InjectorCore>) {
    let weak = Rc::downgrade(core);
    core.bridge
        .add_typed_handler(CommandName::RunAt, move |stage: Stage, _| {
            if let Some(core) = weak.upgrade() {
                core.gate.signal(stage);
            }
        });
}

fn install_page_handlers(core: &Rc<InjectorCore>) {
    let bridge = core.bridge.downgrade();
    core.bridge.add_handler(CommandName::Ping, move |_, _| {
        if let Some(bridge) = bridge.upgrade() {
            bridge.post(CommandName::Pong, Value::Null);
        }
    });
}

fn receive_batch(core: &Rc<InjectorCore>, batch: ScriptBatch) {
    if let Some(info) = batch.decode_info() {
        core.state.apply_info(info);
    }
    let Some(items) = batch.decode_items() else {
        return;
    };

    for stage in items.iter().filter_map(|item| item.stage) {
        core.gate.ensure(stage);
    }
    for item in items {
        core.state.store_values(item.id.clone(), item.values.clone());
        let captured = core.slots.arm(item);
        if let Some(captured) = captured {
            handoff::hand_off(core, captured);
        }
    }

    // Firefox only applies sourceURL to injected page scripts after this
    // extra announcement.
    if core.state.is_firefox() && core.state.mode() == Mode::Page {
        core.bridge
            .post(CommandName::InjectList, batch.run_at.unwrap_or(Value::Null));
    }
}
