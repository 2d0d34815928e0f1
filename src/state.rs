//! State snapshots
//!
//! A [`StateSchema`] fixes the ordered set of state keys once, when the model
//! is declared. Every [`State`] snapshot is bound to a schema, so no update
//! can introduce or remove a key; it can only overwrite a value in place of
//! a declared slot on a fresh copy.

use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::error::{ConfigError, StepError};
use crate::value::Value;

/// Ordered, duplicate-free set of state keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSchema {
    keys: IndexSet<String>,
}

impl StateSchema {
    pub fn new<I, K>(keys: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let mut set = IndexSet::new();
        for key in keys {
            let key = key.into();
            if !set.insert(key.clone()) {
                return Err(ConfigError::DuplicateStateKey(key));
            }
        }
        Ok(Self { keys: set })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn index_of(&self, key: &str) -> Option<usize> {
        self.keys.get_index_of(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }
}

/// One immutable snapshot of the state vector.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    schema: Arc<StateSchema>,
    values: Vec<Value>,
}

impl State {
    /// Declare the key set and initial values in one go.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let (keys, values): (Vec<String>, Vec<Value>) = pairs
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .unzip();
        let schema = StateSchema::new(keys)?;
        Ok(Self {
            schema: Arc::new(schema),
            values,
        })
    }

    pub fn schema(&self) -> &Arc<StateSchema> {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.schema.index_of(key).map(|idx| &self.values[idx])
    }

    /// Lookup that reports an unknown key as a step failure.
    pub fn value(&self, key: &str) -> Result<&Value, StepError> {
        self.get(key)
            .ok_or_else(|| StepError::UnknownStateKey(key.to_string()))
    }

    pub fn float(&self, key: &str) -> Result<f64, StepError> {
        self.value(key)?.expect_f64(key)
    }

    pub fn int(&self, key: &str) -> Result<i64, StepError> {
        self.value(key)?.expect_i64(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.schema.keys().zip(self.values.iter())
    }

    /// Copy of this snapshot with one key overwritten.
    pub fn with_value(&self, key: &str, value: impl Into<Value>) -> Result<Self, StepError> {
        let idx = self
            .schema
            .index_of(key)
            .ok_or_else(|| StepError::UnknownStateKey(key.to_string()))?;
        let mut next = self.clone();
        next.values[idx] = value.into();
        Ok(next)
    }

    pub(crate) fn set_at(&mut self, idx: usize, value: Value) {
        self.values[idx] = value;
    }

    /// First float slot holding NaN or an infinity, in declaration order.
    pub fn first_non_finite(&self) -> Option<(&str, &Value)> {
        self.iter().find(|(_, value)| !value.is_finite())
    }

    pub fn to_map(&self) -> IndexMap<String, Value> {
        self.iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }
}

impl Serialize for State {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (key, value) in self.iter() {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}
