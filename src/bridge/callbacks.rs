use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Outstanding replies keyed by callback id.
///
/// Entries are never expired: a reply that never arrives keeps its slot until
/// the realm goes away.
#[derive(Default)]
pub struct CallbackTable {
    pending: HashMap<String, oneshot::Sender<Value>>,
}

impl CallbackTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self) -> (String, oneshot::Receiver<Value>) {
        let (tx, rx) = oneshot::channel();
        let mut id = next_callback_id();
        while self.pending.contains_key(&id) {
            id = next_callback_id();
        }
        self.pending.insert(id.clone(), tx);
        (id, rx)
    }

    /// Remove the entry and hand it the payload. Returns `false` for ids that
    /// are unknown or already resolved.
    pub fn resolve(&mut self, callback_id: &str, payload: Value) -> bool {
        match self.pending.remove(callback_id) {
            Some(tx) => {
                // The caller may have stopped waiting; the entry is gone either way.
                let _ = tx.send(payload);
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, callback_id: &str) -> bool {
        self.pending.contains_key(callback_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

fn next_callback_id() -> String {
    Uuid::new_v4().simple().to_string()
}
