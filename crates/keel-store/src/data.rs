use crate::StoreError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Key/value payload attached to the state, to changes, and to tasks.
///
/// Values are stored as JSON so the whole graph serializes as one document;
/// callers read and write them through their own serde types, one type per key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataBag(BTreeMap<String, Value>);

impl DataBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the value stored under `key`, or `None` if it was never set.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.0.get(key) {
            None => Ok(None),
            Some(raw) => serde_json::from_value(raw.clone())
                .map(Some)
                .map_err(|e| StoreError::InvalidData {
                    key: key.to_owned(),
                    reason: e.to_string(),
                }),
        }
    }

    /// Encode and store `value` under `key`, replacing any previous value.
    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<(), StoreError> {
        let raw = serde_json::to_value(value)?;
        self.0.insert(key.to_owned(), raw);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.0.remove(key).is_some()
    }

    pub fn has(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Raw JSON access, used by generic tooling such as the conflict checker.
    pub fn raw(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
