//! Substep execution
//!
//! Runs one [`StateUpdateBlock`] against a committed snapshot: every policy
//! in declared order, one signal merge, every update, then the non-finite
//! guard. The input snapshot is never touched; the result is a fresh copy.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::block::{PolicyContext, SignalMerge, SignalSet, StateUpdateBlock, StepIndex, UpdateContext};
use crate::error::StepError;
use crate::params::ParamSubset;
use crate::run::{RunRng, TrajectoryEvent};
use crate::state::State;

/// What to do when a float state value becomes NaN or infinite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NonFinitePolicy {
    /// Abort the run with `NumericInvalidState`.
    #[default]
    Fail,
    /// Propagate the value unchanged.
    Allow,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepOptions {
    pub merge: SignalMerge,
    pub non_finite: NonFinitePolicy,
}

/// Part of a substep that raised a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "stage", content = "name", rename_all = "snake_case")]
pub enum Stage {
    Policy(String),
    Merge,
    Update(String),
    Guard,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Policy(name) => write!(f, "policy '{name}'"),
            Self::Merge => f.write_str("signal merge"),
            Self::Update(key) => write!(f, "update '{key}'"),
            Self::Guard => f.write_str("non-finite guard"),
        }
    }
}

/// Terminal failure of a run, located at the substep that raised it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{stage} failed at timestep {timestep}, substep {substep}: {error}")]
pub struct SubstepFailure {
    pub timestep: usize,
    pub substep: usize,
    pub stage: Stage,
    pub error: StepError,
}

/// Executes blocks for one run; holds the run's parameter subset.
pub struct SubstepExecutor<'a> {
    params: &'a ParamSubset,
    options: StepOptions,
}

impl<'a> SubstepExecutor<'a> {
    pub fn new(params: &'a ParamSubset, options: StepOptions) -> Self {
        Self { params, options }
    }

    pub fn execute(
        &self,
        block: &StateUpdateBlock,
        step: StepIndex,
        history: &[TrajectoryEvent],
        state: &State,
        rng: &mut RunRng,
    ) -> Result<State, SubstepFailure> {
        let fail = |stage: Stage, error: StepError| SubstepFailure {
            timestep: step.timestep,
            substep: step.substep,
            stage,
            error,
        };

        let mut outputs = Vec::with_capacity(block.policies.len());
        for (name, policy) in &block.policies {
            let mut ctx = PolicyContext {
                params: self.params,
                step,
                history,
                state,
                rng: &mut *rng,
            };
            let signals = policy(&mut ctx).map_err(|error| fail(Stage::Policy(name.clone()), error))?;
            outputs.push((name.as_str(), signals));
        }

        let signals = SignalSet::merge(outputs, self.options.merge)
            .map_err(|error| fail(Stage::Merge, error))?;
        for collision in signals.collisions() {
            debug!(
                signal = %collision.signal,
                first = %collision.first,
                second = %collision.second,
                merge = ?self.options.merge,
                "signal collision"
            );
        }

        let ctx = UpdateContext {
            params: self.params,
            step,
            history,
            state,
            signals: &signals,
        };

        let schema = state.schema();
        let mut next = state.clone();
        for (key, update) in &block.updates {
            let stage = || Stage::Update(key.clone());
            let value = update(&ctx).map_err(|error| fail(stage(), error))?;
            let idx = schema
                .index_of(key)
                .ok_or_else(|| fail(stage(), StepError::UnknownStateKey(key.clone())))?;
            next.set_at(idx, value);
        }

        if self.options.non_finite == NonFinitePolicy::Fail {
            if let Some((key, value)) = next.first_non_finite() {
                return Err(fail(
                    Stage::Guard,
                    StepError::invalid_state(key, format!("value became {value}")),
                ));
            }
        }

        trace!(
            timestep = step.timestep,
            substep = step.substep,
            signals = signals.len(),
            "substep committed"
        );
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::signals;
    use crate::value::Value;
    use indexmap::IndexMap;
    use rand::{Rng, SeedableRng};

    fn step() -> StepIndex {
        StepIndex {
            simulation_id: 0,
            subset_index: 0,
            run_index: 0,
            timestep: 1,
            substep: 1,
        }
    }

    fn params() -> ParamSubset {
        ParamSubset::new(0, IndexMap::from([("k".to_string(), Value::Int(3))]))
    }

    fn state() -> State {
        State::from_pairs([("x", Value::Int(1)), ("y", Value::Float(0.5))]).unwrap()
    }

    #[test]
    fn untouched_keys_keep_their_value() {
        let block = StateUpdateBlock::new()
            .policy("p", |ctx| Ok(signals([("dx", ctx.params.int("k")?)])))
            .update("x", |ctx| Ok(Value::Int(ctx.state.int("x")? + ctx.signal("dx")?.expect_i64("dx")?)));
        let params = params();
        let executor = SubstepExecutor::new(&params, StepOptions::default());
        let mut rng = RunRng::seed_from_u64(0);
        let before = state();

        let after = executor.execute(&block, step(), &[], &before, &mut rng).unwrap();

        assert_eq!(after.int("x").unwrap(), 4);
        assert_eq!(after.float("y").unwrap(), 0.5);
        assert_eq!(before.int("x").unwrap(), 1);
    }

    #[test]
    fn updates_see_previous_snapshot_not_partial_result() {
        let block = StateUpdateBlock::new()
            .update("x", |_| Ok(Value::Int(100)))
            .update("y", |ctx| Ok(Value::Float(ctx.state.float("x")?)));
        let params = params();
        let executor = SubstepExecutor::new(&params, StepOptions::default());
        let mut rng = RunRng::seed_from_u64(0);

        let after = executor.execute(&block, step(), &[], &state(), &mut rng).unwrap();
        assert_eq!(after.float("y").unwrap(), 1.0);
    }

    #[test]
    fn missing_signal_is_located() {
        let block = StateUpdateBlock::new()
            .policy("p", |_| Ok(signals([("present", 1_i64)])))
            .update("x", |ctx| ctx.signal("absent").cloned());
        let params = params();
        let executor = SubstepExecutor::new(&params, StepOptions::default());
        let mut rng = RunRng::seed_from_u64(0);

        let failure = executor.execute(&block, step(), &[], &state(), &mut rng).unwrap_err();
        assert_eq!(failure.stage, Stage::Update("x".into()));
        assert_eq!(failure.error, StepError::MissingSignal("absent".into()));
        assert_eq!((failure.timestep, failure.substep), (1, 1));
    }

    #[test]
    fn non_finite_guard_follows_policy() {
        let block = StateUpdateBlock::new().update("y", |_| Ok(Value::Float(f64::INFINITY)));
        let params = params();
        let mut rng = RunRng::seed_from_u64(0);

        let strict = SubstepExecutor::new(&params, StepOptions::default());
        let failure = strict.execute(&block, step(), &[], &state(), &mut rng).unwrap_err();
        assert_eq!(failure.stage, Stage::Guard);
        assert_eq!(failure.error.kind(), "numeric_invalid_state");

        let lenient = SubstepExecutor::new(
            &params,
            StepOptions {
                non_finite: NonFinitePolicy::Allow,
                ..StepOptions::default()
            },
        );
        let after = lenient.execute(&block, step(), &[], &state(), &mut rng).unwrap();
        assert!(after.float("y").unwrap().is_infinite());
    }

    #[test]
    fn policies_share_the_run_generator_in_declared_order() {
        let block = StateUpdateBlock::new()
            .policy("a", |ctx| Ok(signals([("a", ctx.rng.gen::<f64>())])))
            .policy("b", |ctx| Ok(signals([("b", ctx.rng.gen::<f64>())])))
            .update("y", |ctx| Ok(Value::Float(ctx.signal_f64("b")?)));
        let params = params();
        let executor = SubstepExecutor::new(&params, StepOptions::default());

        let mut rng = RunRng::seed_from_u64(9);
        let after = executor.execute(&block, step(), &[], &state(), &mut rng).unwrap();

        let mut reference = RunRng::seed_from_u64(9);
        let _first: f64 = reference.gen();
        let second: f64 = reference.gen();
        assert_eq!(after.float("y").unwrap(), second);
    }
}
