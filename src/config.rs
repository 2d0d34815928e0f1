use std::fs;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_with::{serde_as, DefaultOnNull};

use crate::block::SignalMerge;
use crate::error::{ConfigError, PsubError};
use crate::substep::{NonFinitePolicy, StepOptions};
use crate::sweep::SweepMode;
use crate::value::Value;

/// Days simulated by default, one year.
pub const DEFAULT_TIMESTEPS: usize = 365;

/// Per-simulation sweep settings.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    #[serde(deserialize_with = "timesteps_or_default")]
    pub timesteps: usize,
    #[serde(deserialize_with = "runs_or_default")]
    pub runs: usize,
    /// Run `i` is seeded with `seed + i`.
    #[serde_as(as = "DefaultOnNull")]
    pub seed: u64,
    #[serde_as(as = "DefaultOnNull")]
    pub sweep_mode: SweepMode,
    #[serde_as(as = "DefaultOnNull")]
    pub signal_merge: SignalMerge,
    #[serde_as(as = "DefaultOnNull")]
    pub non_finite: NonFinitePolicy,
    /// Candidate lists replacing the model's declared ones.
    #[serde(default)]
    pub params: IndexMap<String, Vec<Value>>,
}

// Null maps to the `SimConfig` default, not to zero.
fn timesteps_or_default<'de, D: Deserializer<'de>>(deserializer: D) -> Result<usize, D::Error> {
    Ok(Option::<usize>::deserialize(deserializer)?.unwrap_or(DEFAULT_TIMESTEPS))
}

fn runs_or_default<'de, D: Deserializer<'de>>(deserializer: D) -> Result<usize, D::Error> {
    Ok(Option::<usize>::deserialize(deserializer)?.unwrap_or(1))
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            timesteps: DEFAULT_TIMESTEPS,
            runs: 1,
            seed: 0,
            sweep_mode: SweepMode::Cartesian,
            signal_merge: SignalMerge::FirstWins,
            non_finite: NonFinitePolicy::Fail,
            params: IndexMap::new(),
        }
    }
}

impl SimConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timesteps == 0 {
            return Err(ConfigError::Invalid(
                "timesteps must be greater than zero".to_string(),
            ));
        }

        if self.runs == 0 {
            return Err(ConfigError::Invalid(
                "runs must be greater than zero".to_string(),
            ));
        }

        if let Some((name, _)) = self.params.iter().find(|(_, values)| values.is_empty()) {
            return Err(ConfigError::EmptyCandidates(name.clone()));
        }

        Ok(())
    }

    pub fn step_options(&self) -> StepOptions {
        StepOptions {
            merge: self.signal_merge,
            non_finite: self.non_finite,
        }
    }

    pub fn seed_for(&self, run_index: usize) -> u64 {
        self.seed.wrapping_add(run_index as u64)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Jobs run one after another on the calling thread.
    Sequential,
    /// Jobs run on a dedicated rayon pool.
    #[default]
    Parallel,
}

/// Settings of the orchestrator itself, shared by every simulation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub mode: ExecutionMode,
    /// Pool size; `None` lets rayon pick one thread per core.
    pub workers: Option<usize>,
    /// Skip every job not yet started once one job fails.
    pub cancel_on_failure: bool,
}

impl ExecutorConfig {
    pub fn sequential() -> Self {
        Self {
            mode: ExecutionMode::Sequential,
            ..Self::default()
        }
    }

    pub fn parallel(workers: usize) -> Self {
        Self {
            mode: ExecutionMode::Parallel,
            workers: Some(workers),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid(
                "workers must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// File-level configuration: orchestrator settings plus one entry per
/// simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub execution: ExecutorConfig,
    pub simulations: Vec<SimConfig>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            execution: ExecutorConfig::default(),
            simulations: vec![SimConfig::default()],
        }
    }
}

impl ExperimentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.execution.validate()?;
        if self.simulations.is_empty() {
            return Err(ConfigError::NoSimulations);
        }
        for simulation in &self.simulations {
            simulation.validate()?;
        }
        Ok(())
    }

    /// Parse TOML, or JSON when the file extension is `.json`.
    pub fn from_path(path: &Path) -> Result<Self, PsubError> {
        let raw = fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let config = if is_json {
            serde_json::from_str(&raw)?
        } else {
            toml::from_str(&raw)?
        };
        Ok(config)
    }
}
