//! Scalar values carried by state keys, parameters and signals

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::StepError;

/// A simple scalar.
///
/// Integers are kept apart from floats so that counts survive export
/// unchanged, but every numeric accessor accepts both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    /// False only for NaN or infinite floats.
    pub fn is_finite(&self) -> bool {
        match self {
            Self::Float(v) => v.is_finite(),
            _ => true,
        }
    }

    /// Numeric addition used by the `Sum` signal merge. Integer overflow
    /// falls back to float addition.
    pub fn checked_add(&self, other: &Value) -> Option<Value> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Some(
                a.checked_add(*b)
                    .map(Self::Int)
                    .unwrap_or(Self::Float(*a as f64 + *b as f64)),
            ),
            _ => Some(Self::Float(self.as_f64()? + other.as_f64()?)),
        }
    }

    /// Numeric view with a typed error naming the offending key.
    pub(crate) fn expect_f64(&self, name: &str) -> Result<f64, StepError> {
        self.as_f64().ok_or_else(|| StepError::TypeMismatch {
            name: name.to_string(),
            expected: "number",
            found: self.type_name(),
        })
    }

    pub(crate) fn expect_i64(&self, name: &str) -> Result<i64, StepError> {
        self.as_i64().ok_or_else(|| StepError::TypeMismatch {
            name: name.to_string(),
            expected: "int",
            found: self.type_name(),
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v:.10}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}
