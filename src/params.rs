//! System parameters
//!
//! [`ParameterSpace`] holds the candidate lists declared by a model;
//! [`ParamSubset`] is one concrete assignment produced by the sweep expander.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, StepError};
use crate::value::Value;

/// Ordered mapping parameter name -> candidate values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSpace {
    candidates: IndexMap<String, Vec<Value>>,
}

impl ParameterSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style declaration. Re-declaring a name replaces its candidates
    /// but keeps its original position.
    pub fn param<I, V>(mut self, name: impl Into<String>, candidates: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.candidates
            .insert(name.into(), candidates.into_iter().map(Into::into).collect());
        self
    }

    /// Replace the candidates of an already declared parameter.
    pub fn override_with(&mut self, name: &str, candidates: Vec<Value>) -> Result<(), ConfigError> {
        let slot = self
            .candidates
            .get_mut(name)
            .ok_or_else(|| ConfigError::UnknownOverride(name.to_string()))?;
        *slot = candidates;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.candidates.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.candidates.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Value])> {
        self.candidates
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    /// Every candidate list must be non-empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.iter().find(|(_, values)| values.is_empty()) {
            Some((name, _)) => Err(ConfigError::EmptyCandidates(name.to_string())),
            None => Ok(()),
        }
    }
}

impl<K: Into<String>> FromIterator<(K, Vec<Value>)> for ParameterSpace {
    fn from_iter<I: IntoIterator<Item = (K, Vec<Value>)>>(iter: I) -> Self {
        Self {
            candidates: iter
                .into_iter()
                .map(|(name, values)| (name.into(), values))
                .collect(),
        }
    }
}

/// One immutable point of the sweep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamSubset {
    pub index: usize,
    pub values: IndexMap<String, Value>,
}

impl ParamSubset {
    pub fn new(index: usize, values: IndexMap<String, Value>) -> Self {
        Self { index, values }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn value(&self, name: &str) -> Result<&Value, StepError> {
        self.get(name)
            .ok_or_else(|| StepError::UnknownParameter(name.to_string()))
    }

    pub fn float(&self, name: &str) -> Result<f64, StepError> {
        self.value(name)?.expect_f64(name)
    }

    pub fn int(&self, name: &str) -> Result<i64, StepError> {
        self.value(name)?.expect_i64(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Same index, only the named parameters. Names outside the subset are
    /// ignored.
    pub fn restrict<'a, I>(&self, names: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let values = names
            .into_iter()
            .filter_map(|name| {
                self.values
                    .get_key_value(name)
                    .map(|(key, value)| (key.clone(), value.clone()))
            })
            .collect();
        Self::new(self.index, values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_candidate_list_fails_validation() {
        let space = ParameterSpace::new()
            .param("a", [1_i64])
            .param("b", Vec::<Value>::new());
        assert_eq!(
            space.validate(),
            Err(ConfigError::EmptyCandidates("b".into()))
        );
    }

    #[test]
    fn override_requires_declared_name() {
        let mut space = ParameterSpace::new().param("price", [0.3]);
        space
            .override_with("price", vec![Value::Float(0.4), Value::Float(0.5)])
            .unwrap();
        assert_eq!(space.iter().next().unwrap().1.len(), 2);
        assert_eq!(
            space.override_with("fee", vec![Value::Int(1)]),
            Err(ConfigError::UnknownOverride("fee".into()))
        );
    }

    #[test]
    fn restricted_view_hides_other_parameters() {
        let subset = ParamSubset::new(
            4,
            [("a", 1_i64), ("b", 2), ("c", 3)]
                .into_iter()
                .map(|(name, value)| (name.to_string(), Value::Int(value)))
                .collect(),
        );
        let view = subset.restrict(["c", "a", "missing"]);

        assert_eq!(view.index, 4);
        assert_eq!(view.int("a"), Ok(1));
        assert_eq!(view.int("c"), Ok(3));
        assert_eq!(view.int("b"), Err(StepError::UnknownParameter("b".into())));
        assert_eq!(view.values.len(), 2);
    }

    #[test]
    fn subset_lookup_errors_are_typed() {
        let subset = ParamSubset::new(0, [("fee".to_string(), Value::from("x"))].into_iter().collect());
        assert_eq!(
            subset.float("missing"),
            Err(StepError::UnknownParameter("missing".into()))
        );
        assert!(matches!(
            subset.float("fee"),
            Err(StepError::TypeMismatch { .. })
        ));
    }
}
