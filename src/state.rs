use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::bridge::Mode;
use crate::inject::{null_as_default, ExposedApi, ScriptId};

/// Browser facts and the shared blob delivered with a `ScriptData` batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BridgeCache {
    pub is_firefox: bool,
    pub user_agent: String,
    pub shared: Value,
}

/// `info` block of a `ScriptData` batch.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InjectInfo {
    #[serde(default, rename = "isFirefox", deserialize_with = "null_as_default")]
    pub is_firefox: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub ua: String,
    #[serde(default)]
    pub cache: Value,
}

pub type LocalCommand = Rc<dyn Fn()>;

/// Everything one realm remembers for the lifetime of the page.
pub struct BridgeState {
    mode: Mode,
    cache: RefCell<BridgeCache>,
    commands: RefCell<HashMap<String, LocalCommand>>,
    values: RefCell<HashMap<ScriptId, Map<String, Value>>>,
    exposed: RefCell<Option<ExposedApi>>,
}

impl BridgeState {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            cache: RefCell::new(BridgeCache::default()),
            commands: RefCell::new(HashMap::new()),
            values: RefCell::new(HashMap::new()),
            exposed: RefCell::new(None),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn apply_info(&self, info: InjectInfo) {
        *self.cache.borrow_mut() = BridgeCache {
            is_firefox: info.is_firefox,
            user_agent: info.ua,
            shared: info.cache,
        };
    }

    pub fn cache(&self) -> BridgeCache {
        self.cache.borrow().clone()
    }

    pub fn is_firefox(&self) -> bool {
        self.cache.borrow().is_firefox
    }

    pub fn register_command(&self, name: impl Into<String>, command: LocalCommand) {
        self.commands.borrow_mut().insert(name.into(), command);
    }

    /// Run a registered command. Returns `false` when nothing is registered
    /// under `name`.
    pub fn run_command(&self, name: &str) -> bool {
        let command = self.commands.borrow().get(name).cloned();
        match command {
            Some(command) => {
                command();
                true
            }
            None => false,
        }
    }

    pub fn store_values(&self, id: ScriptId, values: Map<String, Value>) {
        self.values.borrow_mut().insert(id, values);
    }

    pub fn value(&self, id: &ScriptId, key: &str) -> Option<Value> {
        self.values.borrow().get(id).and_then(|values| values.get(key).cloned())
    }

    pub fn set_value(&self, id: &ScriptId, key: &str, value: Value) {
        self.values
            .borrow_mut()
            .entry(id.clone())
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn delete_value(&self, id: &ScriptId, key: &str) -> Option<Value> {
        self.values
            .borrow_mut()
            .get_mut(id)
            .and_then(|values| values.remove(key))
    }

    pub fn value_keys(&self, id: &ScriptId) -> Vec<String> {
        self.values
            .borrow()
            .get(id)
            .map(|values| values.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn set_exposed(&self, api: ExposedApi) {
        *self.exposed.borrow_mut() = Some(api);
    }

    pub fn exposed(&self) -> Option<ExposedApi> {
        self.exposed.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::Cell;

    #[test]
    fn values_are_isolated_per_script() {
        let state = BridgeState::new(Mode::Page);
        let a = ScriptId::from("a");
        let b = ScriptId::from("b");
        let mut initial = Map::new();
        initial.insert("count".into(), json!(1));
        state.store_values(a.clone(), initial);

        state.set_value(&b, "count", json!(5));
        assert_eq!(state.value(&a, "count"), Some(json!(1)));
        assert_eq!(state.value(&b, "count"), Some(json!(5)));

        assert_eq!(state.delete_value(&a, "count"), Some(json!(1)));
        assert!(state.value_keys(&a).is_empty());
    }

    #[test]
    fn commands_run_by_name() {
        let state = BridgeState::new(Mode::Content);
        let hits = Rc::new(Cell::new(0));
        let counter = Rc::clone(&hits);
        state.register_command("open", Rc::new(move || counter.set(counter.get() + 1)));

        assert!(state.run_command("open"));
        assert!(!state.run_command("close"));
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn info_replaces_cache() {
        let state = BridgeState::new(Mode::Page);
        state.apply_info(InjectInfo {
            is_firefox: true,
            ua: "Gecko".into(),
            cache: json!({"k": 1}),
        });
        let cache = state.cache();
        assert!(cache.is_firefox);
        assert_eq!(cache.user_agent, "Gecko");
        assert_eq!(cache.shared, json!({"k": 1}));
    }
}
