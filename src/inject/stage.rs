//! Document lifecycle gating.
//!
//! Each stage owns a `watch` flag that flips once, plus the tail of the chain
//! of scripts waiting on it. Scripts gated on the same stage run one after
//! another in the order they were captured.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use futures_util::future::{FutureExt, LocalBoxFuture, Shared};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tracing::debug;

use crate::bridge::{CommandName, WeakBridge};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    #[serde(alias = "document-start")]
    Start,
    #[serde(alias = "document-end")]
    End,
    #[serde(alias = "document-idle")]
    Idle,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Start => "start",
            Stage::End => "end",
            Stage::Idle => "idle",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One macrotask boundary, used to push `idle` scripts behind the page's own
/// idle listeners.
pub trait Deferral {
    fn defer(&self) -> LocalBoxFuture<'static, ()>;
}

/// Asks the counterpart realm for a zero-delay `SetTimeout` and resumes when
/// it answers.
pub struct RoundTripDeferral {
    bridge: WeakBridge,
}

impl RoundTripDeferral {
    pub fn new(bridge: WeakBridge) -> Self {
        Self { bridge }
    }
}

impl Deferral for RoundTripDeferral {
    fn defer(&self) -> LocalBoxFuture<'static, ()> {
        let reply = self
            .bridge
            .upgrade()
            .map(|bridge| bridge.send(CommandName::SetTimeout, json!(0)));
        async move {
            if let Some(reply) = reply {
                if let Err(err) = reply.await {
                    debug!(target: "stage", error = %err, "SetTimeout round trip failed");
                }
            }
        }
        .boxed_local()
    }
}

/// Defers on the local tokio timer instead of the counterpart realm.
#[derive(Default)]
pub struct TimerDeferral;

impl Deferral for TimerDeferral {
    fn defer(&self) -> LocalBoxFuture<'static, ()> {
        async {
            tokio::time::sleep(Duration::ZERO).await;
            tokio::task::yield_now().await;
        }
        .boxed_local()
    }
}

type Link = Shared<LocalBoxFuture<'static, bool>>;

struct StageSlot {
    reached: watch::Sender<bool>,
    tail: Option<Link>,
}

impl StageSlot {
    fn new() -> Self {
        let (reached, _) = watch::channel(false);
        Self {
            reached,
            tail: None,
        }
    }

    /// Resolves `true` once the stage is signaled, `false` if the gate went
    /// away first.
    fn reached(&self) -> LocalBoxFuture<'static, bool> {
        let mut rx = self.reached.subscribe();
        async move { rx.wait_for(|reached| *reached).await.is_ok() }.boxed_local()
    }
}

pub struct StageGate {
    slots: RefCell<HashMap<Stage, StageSlot>>,
    deferral: Rc<dyn Deferral>,
}

impl StageGate {
    pub fn new(deferral: Rc<dyn Deferral>) -> Self {
        Self {
            slots: RefCell::new(HashMap::new()),
            deferral,
        }
    }

    /// Create the waiter for `stage` unless one exists. Returns `true` when a
    /// waiter was created.
    pub fn ensure(&self, stage: Stage) -> bool {
        let mut slots = self.slots.borrow_mut();
        if slots.contains_key(&stage) {
            return false;
        }
        slots.insert(stage, StageSlot::new());
        debug!(target: "stage", %stage, "waiter created");
        true
    }

    pub fn has_waiter(&self, stage: Stage) -> bool {
        self.slots.borrow().contains_key(&stage)
    }

    pub fn is_reached(&self, stage: Stage) -> bool {
        self.slots
            .borrow()
            .get(&stage)
            .map(|slot| *slot.reached.borrow())
            .unwrap_or(false)
    }

    /// Mark `stage` reached. Only the first signal for a stage with a waiter
    /// does anything.
    pub fn signal(&self, stage: Stage) -> bool {
        let slots = self.slots.borrow();
        let Some(slot) = slots.get(&stage) else {
            debug!(target: "stage", %stage, "signal for a stage nobody waits on");
            return false;
        };
        if *slot.reached.borrow() {
            return false;
        }
        slot.reached.send_replace(true);
        debug!(target: "stage", %stage, "stage reached");
        true
    }

    /// Completes once `stage` has been signaled, plus one deferment for
    /// `idle`.
    pub fn wait_for(&self, stage: Stage) -> LocalBoxFuture<'static, ()> {
        self.ensure(stage);
        let reached = self
            .slots
            .borrow_mut()
            .entry(stage)
            .or_insert_with(StageSlot::new)
            .reached();
        let deferral = (stage == Stage::Idle).then(|| Rc::clone(&self.deferral));
        async move {
            if !reached.await {
                return futures_util::future::pending().await;
            }
            if let Some(deferral) = deferral {
                deferral.defer().await;
            }
        }
        .boxed_local()
    }

    /// Queue `job` behind the stage and behind every job queued on it before.
    ///
    /// Must be called from inside a `LocalSet`.
    pub fn schedule(&self, stage: Stage, job: Box<dyn FnOnce()>) {
        self.ensure(stage);
        let link = {
            let mut slots = self.slots.borrow_mut();
            let slot = slots.entry(stage).or_insert_with(StageSlot::new);
            let previous = match slot.tail.take() {
                Some(tail) => tail.boxed_local(),
                None => slot.reached(),
            };
            let deferral = (stage == Stage::Idle).then(|| Rc::clone(&self.deferral));
            let link: Link = async move {
                if !previous.await {
                    return false;
                }
                if let Some(deferral) = deferral {
                    deferral.defer().await;
                }
                job();
                true
            }
            .boxed_local()
            .shared();
            slot.tail = Some(link.clone());
            link
        };
        tokio::task::spawn_local(link);
    }
}
