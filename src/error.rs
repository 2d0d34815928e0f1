//! Error taxonomy
//!
//! Three layers: [`ConfigError`] is raised while validating a model or sweep
//! before any run starts, [`StepError`] is raised from inside a run and only
//! aborts that run, [`PsubError`] wraps both plus the I/O failures of the
//! configuration loader and output writers.

use thiserror::Error;

/// Structural problems detected before any job starts. Always fatal for the
/// whole sweep.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("parameter '{0}' has an empty candidate list")]
    EmptyCandidates(String),

    #[error("zip sweep needs equal candidate lengths: '{name}' has {got}, expected {expected}")]
    ZipLengthMismatch {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("duplicate state key '{0}' in schema")]
    DuplicateStateKey(String),

    #[error("block {block}: update targets undeclared state key '{key}'")]
    UnknownStateKey { block: usize, key: String },

    #[error("block {block}: state key '{key}' is updated more than once")]
    DuplicateUpdateKey { block: usize, key: String },

    #[error("block {block}: policy name '{name}' is declared more than once")]
    DuplicatePolicy { block: usize, name: String },

    #[error("block {block}: references undeclared parameter '{name}'")]
    UnknownParameter { block: usize, name: String },

    #[error("parameter override '{0}' does not match any model parameter")]
    UnknownOverride(String),

    #[error("name '{0}' is used by both a state key and a parameter")]
    NameClash(String),

    #[error("name '{0}' is reserved for trace metadata")]
    ReservedName(String),

    #[error("model declares no state update blocks")]
    NoBlocks,

    #[error("initial state key '{key}' is not finite ({value})")]
    NonFiniteInitialState { key: String, value: String },

    #[error("parameter sweep expands to more subsets than usize can count")]
    SweepTooLarge,

    #[error("experiment contains no simulations")]
    NoSimulations,

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failure raised while executing a policy or update function. Aborts only
/// the run that raised it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StepError {
    #[error("missing signal '{0}'")]
    MissingSignal(String),

    #[error("non-finite or invalid value for '{key}': {message}")]
    NumericInvalidState { key: String, message: String },

    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),

    #[error("unknown state key '{0}'")]
    UnknownStateKey(String),

    #[error("'{name}' expected {expected}, found {found}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("signal '{signal}' emitted by both '{first}' and '{second}'")]
    SignalCollision {
        signal: String,
        first: String,
        second: String,
    },

    #[error("execution failed: {0}")]
    Execution(String),
}

impl StepError {
    /// Shorthand for model code raising an arbitrary execution failure.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }

    /// Shorthand for model code guarding a domain constraint.
    pub fn invalid_state(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NumericInvalidState {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Coarse classification used in summaries and trace output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingSignal(_) => "missing_signal",
            Self::NumericInvalidState { .. } => "numeric_invalid_state",
            _ => "execution",
        }
    }
}

#[derive(Debug, Error)]
pub enum PsubError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("worker pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T> = std::result::Result<T, PsubError>;
