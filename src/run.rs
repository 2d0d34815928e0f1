//! Run controller
//!
//! Drives one (parameter subset, seed) pair through all timesteps. The
//! initial state is recorded as (timestep 0, substep 0); each of the
//! timesteps 1..=T then executes every block in declared order and records
//! one event per block at substeps 1..=B.

use std::sync::Arc;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::block::StepIndex;
use crate::model::Model;
use crate::params::ParamSubset;
use crate::state::State;
use crate::substep::{StepOptions, SubstepExecutor, SubstepFailure};

/// Generator handed to policies. ChaCha output is stable across platforms
/// and `rand` releases, so seeded runs replay bit for bit.
pub type RunRng = ChaCha8Rng;

/// Snapshot committed after one substep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrajectoryEvent {
    pub simulation_id: usize,
    pub subset_index: usize,
    pub run_index: usize,
    pub timestep: usize,
    pub substep: usize,
    pub state: State,
}

impl TrajectoryEvent {
    /// Ordering key used by the merged event log.
    pub fn sort_key(&self) -> (usize, usize, usize, usize, usize) {
        (
            self.simulation_id,
            self.subset_index,
            self.run_index,
            self.timestep,
            self.substep,
        )
    }
}

/// One unit of work for the orchestrator.
#[derive(Debug, Clone)]
pub struct RunJob {
    pub simulation_id: usize,
    pub subset: Arc<ParamSubset>,
    pub run_index: usize,
    pub seed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Trajectory produced by one job, complete or cut at its first failure.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub simulation_id: usize,
    pub subset_index: usize,
    pub run_index: usize,
    pub seed: u64,
    pub status: RunStatus,
    pub failure: Option<SubstepFailure>,
    pub events: Vec<TrajectoryEvent>,
}

impl RunOutcome {
    pub(crate) fn cancelled(job: &RunJob) -> Self {
        Self {
            simulation_id: job.simulation_id,
            subset_index: job.subset.index,
            run_index: job.run_index,
            seed: job.seed,
            status: RunStatus::Cancelled,
            failure: None,
            events: Vec::new(),
        }
    }

    /// Last committed snapshot.
    pub fn final_state(&self) -> Option<&State> {
        self.events.last().map(|event| &event.state)
    }
}

/// Events to preallocate for one run. Huge horizons grow on demand.
const MAX_PREALLOCATED_EVENTS: usize = 1 << 16;

fn event_capacity(timesteps: usize, blocks: usize) -> usize {
    timesteps
        .saturating_mul(blocks)
        .saturating_add(1)
        .min(MAX_PREALLOCATED_EVENTS)
}

pub struct RunController<'a> {
    model: &'a Model,
    timesteps: usize,
    options: StepOptions,
}

impl<'a> RunController<'a> {
    pub fn new(model: &'a Model, timesteps: usize, options: StepOptions) -> Self {
        Self {
            model,
            timesteps,
            options,
        }
    }

    #[instrument(
        skip_all,
        name = "run",
        fields(
            simulation = job.simulation_id,
            subset = job.subset.index,
            run = job.run_index,
            seed = job.seed
        )
    )]
    pub fn run(&self, job: &RunJob) -> RunOutcome {
        let blocks = &self.model.blocks;
        let mut rng = RunRng::seed_from_u64(job.seed);
        let mut events = Vec::with_capacity(event_capacity(self.timesteps, blocks.len()));

        let index = |timestep: usize, substep: usize| StepIndex {
            simulation_id: job.simulation_id,
            subset_index: job.subset.index,
            run_index: job.run_index,
            timestep,
            substep,
        };
        let event = |step: StepIndex, state: State| TrajectoryEvent {
            simulation_id: step.simulation_id,
            subset_index: step.subset_index,
            run_index: step.run_index,
            timestep: step.timestep,
            substep: step.substep,
            state,
        };

        events.push(event(index(0, 0), self.model.initial_state.clone()));

        // Each block sees only the parameters it declared.
        let views: Vec<ParamSubset> = blocks
            .iter()
            .map(|block| job.subset.restrict(block.param_names()))
            .collect();
        let executors: Vec<SubstepExecutor<'_>> = views
            .iter()
            .map(|view| SubstepExecutor::new(view, self.options))
            .collect();
        let mut failure = None;

        'timesteps: for timestep in 1..=self.timesteps {
            for (block_idx, (block, executor)) in blocks.iter().zip(&executors).enumerate() {
                let step = index(timestep, block_idx + 1);
                let current = &events[events.len() - 1].state;
                match executor.execute(block, step, &events, current, &mut rng) {
                    Ok(next) => events.push(event(step, next)),
                    Err(err) => {
                        warn!(
                            timestep,
                            substep = step.substep,
                            stage = %err.stage,
                            error = %err.error,
                            "run failed"
                        );
                        failure = Some(err);
                        break 'timesteps;
                    }
                }
            }
        }

        let status = if failure.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        debug!(events = events.len(), ?status, "run finished");

        RunOutcome {
            simulation_id: job.simulation_id,
            subset_index: job.subset.index,
            run_index: job.run_index,
            seed: job.seed,
            status,
            failure,
            events,
        }
    }
}
