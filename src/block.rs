//! Partial state update blocks
//!
//! A block is an ordered policy list plus an ordered update list. Policies
//! read the current snapshot and emit [`Signals`]; update functions read the
//! merged [`SignalSet`] and return the new value of exactly one state key.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, StepError};
use crate::params::{ParamSubset, ParameterSpace};
use crate::run::{RunRng, TrajectoryEvent};
use crate::state::{State, StateSchema};
use crate::value::Value;

/// Output of a single policy for one substep.
pub type Signals = IndexMap<String, Value>;

/// Function that turns the current snapshot into signals
pub type PolicyFn = Box<dyn Fn(&mut PolicyContext<'_>) -> Result<Signals, StepError> + Send + Sync>;

/// Function that computes the next value of one state key
pub type UpdateFn = Box<dyn Fn(&UpdateContext<'_>) -> Result<Value, StepError> + Send + Sync>;

/// Build a [`Signals`] map from pairs.
pub fn signals<I, K, V>(pairs: I) -> Signals
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(name, value)| (name.into(), value.into()))
        .collect()
}

/// Update function that copies a signal verbatim into its state key.
pub fn update_from_signal(
    signal: impl Into<String>,
) -> impl Fn(&UpdateContext<'_>) -> Result<Value, StepError> + Send + Sync + 'static {
    let signal = signal.into();
    move |ctx: &UpdateContext<'_>| ctx.signal(&signal).cloned()
}

/// Position of the substep being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct StepIndex {
    pub simulation_id: usize,
    pub subset_index: usize,
    pub run_index: usize,
    pub timestep: usize,
    pub substep: usize,
}

/// Context available to policy functions
pub struct PolicyContext<'a> {
    /// Parameter subset of this run
    pub params: &'a ParamSubset,
    pub step: StepIndex,
    /// Events already committed by this run, oldest first
    pub history: &'a [TrajectoryEvent],
    /// Snapshot committed by the previous substep
    pub state: &'a State,
    /// Seeded generator owned by this run
    pub rng: &'a mut RunRng,
}

/// Context available to update functions
pub struct UpdateContext<'a> {
    pub params: &'a ParamSubset,
    pub step: StepIndex,
    pub history: &'a [TrajectoryEvent],
    /// Snapshot committed by the previous substep (not the one being built)
    pub state: &'a State,
    /// Merged signals of every policy in the block
    pub signals: &'a SignalSet,
}

impl UpdateContext<'_> {
    pub fn signal(&self, name: &str) -> Result<&Value, StepError> {
        self.signals
            .get(name)
            .ok_or_else(|| StepError::MissingSignal(name.to_string()))
    }

    pub fn signal_f64(&self, name: &str) -> Result<f64, StepError> {
        self.signal(name)?.expect_f64(name)
    }
}

/// How signals emitted under the same name by several policies of one
/// block are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalMerge {
    /// The earliest declared policy keeps its value.
    #[default]
    FirstWins,
    /// The latest declared policy overwrites earlier values.
    LastWins,
    /// Numeric values are added; non-numeric collisions fail the run.
    Sum,
    /// Any collision fails the run.
    Reject,
}

/// A name emitted by more than one policy in the same substep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalCollision {
    pub signal: String,
    pub first: String,
    pub second: String,
}

#[derive(Debug, Clone)]
struct SignalEntry {
    value: Value,
    source: String,
}

/// Signals of all policies of one substep after merging.
#[derive(Debug, Clone, Default)]
pub struct SignalSet {
    entries: IndexMap<String, SignalEntry>,
    collisions: Vec<SignalCollision>,
}

impl SignalSet {
    /// Merge policy outputs given in declaration order.
    pub fn merge<'a, I>(outputs: I, strategy: SignalMerge) -> Result<Self, StepError>
    where
        I: IntoIterator<Item = (&'a str, Signals)>,
    {
        let mut set = Self::default();

        for (policy, signals) in outputs {
            for (name, value) in signals {
                let Some(existing) = set.entries.get_mut(&name) else {
                    set.entries.insert(
                        name,
                        SignalEntry {
                            value,
                            source: policy.to_string(),
                        },
                    );
                    continue;
                };

                let collision = SignalCollision {
                    signal: name.clone(),
                    first: existing.source.clone(),
                    second: policy.to_string(),
                };

                match strategy {
                    SignalMerge::FirstWins => {}
                    SignalMerge::LastWins => {
                        existing.value = value;
                        existing.source = policy.to_string();
                    }
                    SignalMerge::Sum => {
                        existing.value = existing.value.checked_add(&value).ok_or_else(|| {
                            StepError::TypeMismatch {
                                name: name.clone(),
                                expected: "number",
                                found: if existing.value.as_f64().is_none() {
                                    existing.value.type_name()
                                } else {
                                    value.type_name()
                                },
                            }
                        })?;
                    }
                    SignalMerge::Reject => {
                        return Err(StepError::SignalCollision {
                            signal: collision.signal,
                            first: collision.first,
                            second: collision.second,
                        });
                    }
                }

                set.collisions.push(collision);
            }
        }

        Ok(set)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.get(name).map(|entry| &entry.value)
    }

    /// Policy whose value is visible under `name` (the first contributor
    /// under `Sum`).
    pub fn source(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(|entry| entry.source.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn collisions(&self) -> &[SignalCollision] {
        &self.collisions
    }
}

/// One (policy-set, update-set) pair, executed as one substep.
#[derive(Default)]
pub struct StateUpdateBlock {
    description: Option<String>,
    pub(crate) policies: Vec<(String, PolicyFn)>,
    pub(crate) updates: Vec<(String, UpdateFn)>,
    params: Vec<String>,
}

impl StateUpdateBlock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn policy<F>(mut self, name: impl Into<String>, policy: F) -> Self
    where
        F: Fn(&mut PolicyContext<'_>) -> Result<Signals, StepError> + Send + Sync + 'static,
    {
        self.policies.push((name.into(), Box::new(policy)));
        self
    }

    pub fn update<F>(mut self, key: impl Into<String>, update: F) -> Self
    where
        F: Fn(&UpdateContext<'_>) -> Result<Value, StepError> + Send + Sync + 'static,
    {
        self.updates.push((key.into(), Box::new(update)));
        self
    }

    /// Declare the parameters this block reads, checked against the
    /// parameter space before any run starts.
    pub fn uses_params<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn policy_names(&self) -> impl Iterator<Item = &str> {
        self.policies.iter().map(|(name, _)| name.as_str())
    }

    pub fn update_keys(&self) -> impl Iterator<Item = &str> {
        self.updates.iter().map(|(key, _)| key.as_str())
    }

    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(String::as_str)
    }

    pub(crate) fn validate(
        &self,
        block: usize,
        schema: &StateSchema,
        space: &ParameterSpace,
    ) -> Result<(), ConfigError> {
        let mut seen = Vec::with_capacity(self.policies.len());
        for name in self.policy_names() {
            if seen.contains(&name) {
                return Err(ConfigError::DuplicatePolicy {
                    block,
                    name: name.to_string(),
                });
            }
            seen.push(name);
        }

        let mut seen = Vec::with_capacity(self.updates.len());
        for key in self.update_keys() {
            if !schema.contains(key) {
                return Err(ConfigError::UnknownStateKey {
                    block,
                    key: key.to_string(),
                });
            }
            if seen.contains(&key) {
                return Err(ConfigError::DuplicateUpdateKey {
                    block,
                    key: key.to_string(),
                });
            }
            seen.push(key);
        }

        if let Some(name) = self.param_names().find(|name| !space.contains(name)) {
            return Err(ConfigError::UnknownParameter {
                block,
                name: name.to_string(),
            });
        }

        Ok(())
    }
}

impl fmt::Debug for StateUpdateBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateUpdateBlock")
            .field("description", &self.description)
            .field("policies", &self.policy_names().collect::<Vec<_>>())
            .field("updates", &self.update_keys().collect::<Vec<_>>())
            .field("params", &self.params)
            .finish()
    }
}
