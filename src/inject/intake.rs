use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use super::handoff::Userscript;
use super::stage::Stage;
use crate::state::InjectInfo;

/// Opaque script identifier assigned by the background store. Numbers and
/// strings on the wire both map onto the same textual form, so `1` and `"1"`
/// name the same script and share one value store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ScriptId(String);

impl ScriptId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ScriptId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<u64> for ScriptId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ScriptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ScriptId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(serde_json::Number),
            Text(String),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Number(number) => ScriptId(number.to_string()),
            Raw::Text(text) => ScriptId(text),
        })
    }
}

/// Name of the temporary global property a compiled userscript is assigned
/// to. Unique per descriptor for the whole page load.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataKey(String);

impl DataKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Fresh unguessable key.
    pub fn generate() -> Self {
        Self(format!("_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptMeta {
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub namespace: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// User overrides layered on top of the script's own metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// One userscript waiting to be injected.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScriptItem {
    pub id: ScriptId,
    #[serde(rename = "dataKey", alias = "dataKeyName")]
    pub data_key: DataKey,
    #[serde(default)]
    pub stage: Option<Stage>,
    #[serde(default, alias = "metadata", deserialize_with = "null_as_default")]
    pub meta: ScriptMeta,
    #[serde(default, deserialize_with = "null_as_default")]
    pub custom: CustomMeta,
    #[serde(default, alias = "isolatedValues", deserialize_with = "null_as_default")]
    pub values: Map<String, Value>,
}

impl ScriptItem {
    pub fn new(id: impl Into<ScriptId>, data_key: DataKey) -> Self {
        Self {
            id: id.into(),
            data_key,
            stage: None,
            meta: ScriptMeta::default(),
            custom: CustomMeta::default(),
            values: Map::new(),
        }
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Custom name, then metadata name, then the id.
    pub fn display_name(&self) -> String {
        self.custom
            .name
            .as_deref()
            .filter(|name| !name.is_empty())
            .or_else(|| Some(self.meta.name.as_str()).filter(|name| !name.is_empty()))
            .map(str::to_string)
            .unwrap_or_else(|| self.id.to_string())
    }
}

/// Payload of `ScriptData`.
///
/// `info` and each item are kept raw and decoded one at a time, so a single
/// malformed entry costs only itself.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScriptBatch {
    #[serde(default)]
    pub info: Option<Value>,
    #[serde(default)]
    pub items: Option<Vec<Value>>,
    #[serde(default, rename = "runAt")]
    pub run_at: Option<Value>,
}

impl ScriptBatch {
    pub fn decode_info(&self) -> Option<InjectInfo> {
        let raw = self.info.as_ref().filter(|info| !info.is_null())?;
        match InjectInfo::deserialize(raw) {
            Ok(info) => Some(info),
            Err(err) => {
                debug!(target: "intake", error = %err, "ignoring malformed info block");
                None
            }
        }
    }

    /// Decoded items, in batch order. `None` when the batch carries no items.
    pub fn decode_items(&self) -> Option<Vec<ScriptItem>> {
        let raw = self.items.as_ref()?;
        let items = raw
            .iter()
            .enumerate()
            .filter_map(|(index, item)| match ScriptItem::deserialize(item) {
                Ok(item) => Some(item),
                Err(err) => {
                    debug!(target: "intake", index, error = %err, "skipping malformed item");
                    None
                }
            })
            .collect();
        Some(items)
    }
}

/// Treats an explicit `null` like a missing field.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

enum Slot {
    /// The loader assigned a function before the data arrived.
    Assigned(Box<dyn Userscript>),
    /// Data arrived; waiting for the loader.
    Armed(ScriptItem),
}

/// A descriptor paired with its compiled function, ready for handoff.
pub struct Captured {
    pub item: ScriptItem,
    pub script: Box<dyn Userscript>,
}

/// The temporary global keys of the page realm.
///
/// A key is written once by the loader and read once by intake. Whichever
/// side comes second takes the entry out, which doubles as deleting the
/// global property.
#[derive(Default)]
pub struct GlobalSlots {
    slots: RefCell<HashMap<DataKey, Slot>>,
}

impl GlobalSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Data side. Returns the capture when the function was already there.
    pub fn arm(&self, item: ScriptItem) -> Option<Captured> {
        let mut slots = self.slots.borrow_mut();
        match slots.remove(&item.data_key) {
            Some(Slot::Assigned(script)) => Some(Captured { item, script }),
            Some(Slot::Armed(existing)) => {
                warn!(
                    target: "intake",
                    data_key = %item.data_key,
                    kept = %existing.id,
                    refused = %item.id,
                    "data key already armed"
                );
                slots.insert(existing.data_key.clone(), Slot::Armed(existing));
                None
            }
            None => {
                slots.insert(item.data_key.clone(), Slot::Armed(item));
                None
            }
        }
    }

    /// Loader side. Returns the capture when the data was already there.
    pub fn assign(&self, key: &DataKey, script: Box<dyn Userscript>) -> Option<Captured> {
        let mut slots = self.slots.borrow_mut();
        match slots.remove(key) {
            Some(Slot::Armed(item)) => Some(Captured { item, script }),
            Some(Slot::Assigned(_)) | None => {
                slots.insert(key.clone(), Slot::Assigned(script));
                None
            }
        }
    }

    pub fn contains(&self, key: &DataKey) -> bool {
        self.slots.borrow().contains_key(key)
    }

    pub fn is_armed(&self, key: &DataKey) -> bool {
        matches!(self.slots.borrow().get(key), Some(Slot::Armed(_)))
    }

    pub fn len(&self) -> usize {
        self.slots.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.borrow().is_empty()
    }
}
