//! Sweep orchestration
//!
//! Fans the run controller out over simulations × parameter subsets × Monte
//! Carlo runs. Each job fills its own event buffer; the buffers are merged
//! and re-sorted once every job has returned, so the log order never depends
//! on completion order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{ExecutionMode, ExecutorConfig, SimConfig};
use crate::error::{ConfigError, PsubError, StepError};
use crate::model::Model;
use crate::params::ParamSubset;
use crate::run::{RunController, RunJob, RunOutcome, RunStatus, TrajectoryEvent};
use crate::substep::SubstepFailure;
use crate::sweep;

/// A model paired with the sweep it should be run under.
#[derive(Debug)]
pub struct Simulation {
    pub model: Model,
    pub config: SimConfig,
}

impl Simulation {
    pub fn new(model: Model, config: SimConfig) -> Self {
        Self { model, config }
    }
}

/// Simulation after overrides, validation and sweep expansion.
#[derive(Debug)]
struct Prepared {
    model: Model,
    config: SimConfig,
    subsets: Vec<Arc<ParamSubset>>,
}

impl Prepared {
    /// Trial timestep on the first subset. A block that reads a parameter it
    /// did not declare fails here with `UnknownParameter`, which is reported
    /// as a configuration error. Reads behind branches not taken in that
    /// timestep stay undetected until they run.
    fn check_parameter_reads(&self) -> Result<(), ConfigError> {
        let Some(subset) = self.subsets.first() else {
            return Ok(());
        };
        let job = RunJob {
            simulation_id: 0,
            subset: Arc::clone(subset),
            run_index: 0,
            seed: self.config.seed_for(0),
        };
        let trial = RunController::new(&self.model, 1, self.config.step_options()).run(&job);
        match trial.failure {
            Some(SubstepFailure {
                substep,
                error: StepError::UnknownParameter(name),
                ..
            }) => Err(ConfigError::UnknownParameter {
                block: substep - 1,
                name,
            }),
            _ => Ok(()),
        }
    }
}

/// Cooperative cancellation flag shared with every job.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct Executor {
    config: ExecutorConfig,
    simulations: Vec<Prepared>,
    cancel: CancelHandle,
}

impl Executor {
    /// Validate every simulation eagerly. Any structural problem is returned
    /// here, before a single job is built.
    pub fn new(config: ExecutorConfig, simulations: Vec<Simulation>) -> Result<Self, ConfigError> {
        config.validate()?;
        if simulations.is_empty() {
            return Err(ConfigError::NoSimulations);
        }

        let simulations = simulations
            .into_iter()
            .map(|Simulation { mut model, config: sim }| {
                sim.validate()?;
                for (name, candidates) in &sim.params {
                    model.params.override_with(name, candidates.clone())?;
                }
                model.validate()?;
                model.validate_initial_state(sim.non_finite)?;
                let subsets = sweep::expand(&model.params, sim.sweep_mode)?;
                let prepared = Prepared {
                    model,
                    config: sim,
                    subsets,
                };
                prepared.check_parameter_reads()?;
                Ok(prepared)
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(Self {
            config,
            simulations,
            cancel: CancelHandle::default(),
        })
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Subsets of one simulation, in index order.
    pub fn subsets(&self, simulation_id: usize) -> Option<&[Arc<ParamSubset>]> {
        self.simulations
            .get(simulation_id)
            .map(|prepared| prepared.subsets.as_slice())
    }

    /// Every (simulation, subset, run) job in log order.
    pub fn jobs(&self) -> Vec<RunJob> {
        self.simulations
            .iter()
            .enumerate()
            .flat_map(|(simulation_id, prepared)| {
                prepared.subsets.iter().flat_map(move |subset| {
                    (0..prepared.config.runs).map(move |run_index| RunJob {
                        simulation_id,
                        subset: Arc::clone(subset),
                        run_index,
                        seed: prepared.config.seed_for(run_index),
                    })
                })
            })
            .collect()
    }

    pub fn execute(&self) -> Result<EventLog, PsubError> {
        let jobs = self.jobs();
        info!(
            simulations = self.simulations.len(),
            jobs = jobs.len(),
            mode = ?self.config.mode,
            "sweep starting"
        );

        // Set by the first failure under `cancel_on_failure`. Lives for this
        // sweep only; the shared handle is reserved for explicit cancellation.
        let failed = AtomicBool::new(false);
        let outcomes: Vec<RunOutcome> = match self.config.mode {
            ExecutionMode::Sequential => jobs.iter().map(|job| self.run_job(job, &failed)).collect(),
            ExecutionMode::Parallel => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(self.config.workers.unwrap_or(0))
                    .thread_name(|idx| format!("psub-worker-{idx}"))
                    .build()?;
                pool.install(|| jobs.par_iter().map(|job| self.run_job(job, &failed)).collect())
            }
        };

        let log = EventLog::merge(
            outcomes,
            self.simulations
                .iter()
                .map(|prepared| prepared.subsets.clone())
                .collect(),
        );
        let summary = log.summary();
        info!(
            jobs = summary.total_jobs,
            completed = summary.completed,
            failed = summary.failed,
            cancelled = summary.cancelled,
            events = log.events.len(),
            "sweep finished"
        );
        Ok(log)
    }

    fn run_job(&self, job: &RunJob, failed: &AtomicBool) -> RunOutcome {
        if self.cancel.is_cancelled() || failed.load(Ordering::SeqCst) {
            warn!(
                simulation = job.simulation_id,
                subset = job.subset.index,
                run = job.run_index,
                "job skipped after cancellation"
            );
            return RunOutcome::cancelled(job);
        }

        let prepared = &self.simulations[job.simulation_id];
        debug!(
            simulation = job.simulation_id,
            subset = job.subset.index,
            run = job.run_index,
            "job starting"
        );
        let controller = RunController::new(
            &prepared.model,
            prepared.config.timesteps,
            prepared.config.step_options(),
        );
        let outcome = controller.run(job);

        if outcome.status == RunStatus::Failed && self.config.cancel_on_failure {
            warn!(
                simulation = job.simulation_id,
                subset = job.subset.index,
                run = job.run_index,
                "cancelling remaining jobs after failure"
            );
            failed.store(true, Ordering::SeqCst);
        }
        outcome
    }
}

/// Status of one job as recorded in the merged log.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub simulation_id: usize,
    pub subset_index: usize,
    pub run_index: usize,
    pub seed: u64,
    pub status: RunStatus,
    pub failure: Option<SubstepFailure>,
    pub events: usize,
}

impl JobRecord {
    pub fn key(&self) -> (usize, usize, usize) {
        (self.simulation_id, self.subset_index, self.run_index)
    }
}

/// Every event of every job, ordered by (simulation, subset, run, timestep,
/// substep).
#[derive(Debug, Clone)]
pub struct EventLog {
    pub events: Vec<TrajectoryEvent>,
    pub jobs: Vec<JobRecord>,
    subsets: Vec<Vec<Arc<ParamSubset>>>,
}

impl EventLog {
    pub(crate) fn merge(outcomes: Vec<RunOutcome>, subsets: Vec<Vec<Arc<ParamSubset>>>) -> Self {
        let mut jobs = Vec::with_capacity(outcomes.len());
        let mut events = Vec::with_capacity(outcomes.iter().map(|o| o.events.len()).sum());

        for outcome in outcomes {
            jobs.push(JobRecord {
                simulation_id: outcome.simulation_id,
                subset_index: outcome.subset_index,
                run_index: outcome.run_index,
                seed: outcome.seed,
                status: outcome.status,
                failure: outcome.failure,
                events: outcome.events.len(),
            });
            events.extend(outcome.events);
        }

        jobs.sort_by_key(JobRecord::key);
        events.sort_by_key(TrajectoryEvent::sort_key);

        Self {
            events,
            jobs,
            subsets,
        }
    }

    pub fn subset(&self, simulation_id: usize, subset_index: usize) -> Option<&ParamSubset> {
        self.subsets
            .get(simulation_id)
            .and_then(|subsets| subsets.get(subset_index))
            .map(Arc::as_ref)
    }

    pub fn job(&self, simulation_id: usize, subset_index: usize, run_index: usize) -> Option<&JobRecord> {
        let key = (simulation_id, subset_index, run_index);
        self.jobs
            .binary_search_by_key(&key, JobRecord::key)
            .ok()
            .map(|idx| &self.jobs[idx])
    }

    pub fn summary(&self) -> SweepSummary {
        let count = |status: RunStatus| self.jobs.iter().filter(|job| job.status == status).count();
        let failures = self
            .jobs
            .iter()
            .filter_map(|job| {
                job.failure.as_ref().map(|failure| FailureReport {
                    simulation_id: job.simulation_id,
                    subset_index: job.subset_index,
                    run_index: job.run_index,
                    timestep: failure.timestep,
                    substep: failure.substep,
                    stage: failure.stage.to_string(),
                    kind: failure.error.kind(),
                    message: failure.error.to_string(),
                })
            })
            .collect();

        SweepSummary {
            total_jobs: self.jobs.len(),
            completed: count(RunStatus::Completed),
            failed: count(RunStatus::Failed),
            cancelled: count(RunStatus::Cancelled),
            failures,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureReport {
    pub simulation_id: usize,
    pub subset_index: usize,
    pub run_index: usize,
    pub timestep: usize,
    pub substep: usize,
    pub stage: String,
    pub kind: &'static str,
    pub message: String,
}

/// Sweep-level tally of job outcomes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepSummary {
    pub total_jobs: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub failures: Vec<FailureReport>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::StateUpdateBlock;
    use crate::params::ParameterSpace;
    use crate::state::State;
    use crate::substep::NonFinitePolicy;
    use crate::value::Value;

    fn counter_model() -> Model {
        Model::new(
            State::from_pairs([("x", 0_i64)]).unwrap(),
            ParameterSpace::new().param("step", [1_i64, 2, 3]),
            vec![StateUpdateBlock::new()
                .uses_params(["step"])
                .update("x", |ctx| {
                    Ok(Value::Int(ctx.state.int("x")? + ctx.params.int("step")?))
                })],
        )
    }

    fn config(timesteps: usize, runs: usize) -> SimConfig {
        SimConfig {
            timesteps,
            runs,
            ..SimConfig::default()
        }
    }

    #[test]
    fn job_list_covers_subsets_times_runs() {
        let executor = Executor::new(
            ExecutorConfig::sequential(),
            vec![Simulation::new(counter_model(), config(2, 4))],
        )
        .unwrap();
        let jobs = executor.jobs();

        assert_eq!(jobs.len(), 12);
        assert_eq!(jobs[5].subset.index, 1);
        assert_eq!(jobs[5].run_index, 1);
        assert_eq!(jobs[5].seed, 1);
    }

    #[test]
    fn configuration_errors_abort_before_any_job() {
        let mut sim = config(2, 1);
        sim.params.insert("unknown".into(), vec![Value::Int(1)]);
        let result = Executor::new(
            ExecutorConfig::sequential(),
            vec![Simulation::new(counter_model(), sim)],
        );
        assert!(matches!(result, Err(ConfigError::UnknownOverride(_))));

        let result = Executor::new(ExecutorConfig::sequential(), Vec::new());
        assert!(matches!(result, Err(ConfigError::NoSimulations)));
    }

    #[test]
    fn undeclared_parameter_reads_are_configuration_errors() {
        let reads_unlisted = Model::new(
            State::from_pairs([("x", 0_i64), ("y", 0_i64)]).unwrap(),
            ParameterSpace::new().param("step", [1_i64, 2]),
            vec![
                StateUpdateBlock::new()
                    .uses_params(["step"])
                    .update("x", |ctx| Ok(Value::Int(ctx.params.int("step")?))),
                StateUpdateBlock::new().update("y", |ctx| Ok(Value::Int(ctx.params.int("step")?))),
            ],
        );
        let err = Executor::new(
            ExecutorConfig::sequential(),
            vec![Simulation::new(reads_unlisted, config(3, 1))],
        )
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnknownParameter {
                block: 1,
                name: "step".into()
            }
        );

        let reads_missing = Model::new(
            State::from_pairs([("x", 0_i64)]).unwrap(),
            ParameterSpace::new().param("k", [1_i64]),
            vec![StateUpdateBlock::new()
                .uses_params(["k"])
                .update("x", |ctx| Ok(Value::Int(ctx.params.int("nope")?)))],
        );
        let err = Executor::new(
            ExecutorConfig::sequential(),
            vec![Simulation::new(reads_missing, config(3, 1))],
        )
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnknownParameter {
                block: 0,
                name: "nope".into()
            }
        );
    }

    #[test]
    fn non_finite_initial_state_fails_validation() {
        let model = || {
            Model::new(
                State::from_pairs([("x", f64::INFINITY)]).unwrap(),
                ParameterSpace::new(),
                vec![StateUpdateBlock::new().update("x", |ctx| Ok(Value::Float(ctx.state.float("x")?)))],
            )
        };
        let err = Executor::new(ExecutorConfig::sequential(), vec![Simulation::new(model(), config(2, 1))])
            .unwrap_err();
        assert!(matches!(err, ConfigError::NonFiniteInitialState { ref key, .. } if key == "x"));

        let allow = SimConfig {
            non_finite: NonFinitePolicy::Allow,
            ..config(2, 1)
        };
        let log = Executor::new(ExecutorConfig::sequential(), vec![Simulation::new(model(), allow)])
            .unwrap()
            .execute()
            .unwrap();
        assert_eq!(log.summary().completed, 1);
    }

    #[test]
    fn overrides_replace_declared_candidates() {
        let mut sim = config(2, 1);
        sim.params.insert("step".into(), vec![Value::Int(5)]);
        let executor =
            Executor::new(ExecutorConfig::sequential(), vec![Simulation::new(counter_model(), sim)])
                .unwrap();
        let log = executor.execute().unwrap();

        assert_eq!(log.jobs.len(), 1);
        assert_eq!(log.events.last().unwrap().state.int("x").unwrap(), 10);
    }

    #[test]
    fn parallel_log_matches_sequential_log() {
        let sequential = Executor::new(
            ExecutorConfig::sequential(),
            vec![Simulation::new(counter_model(), config(5, 3))],
        )
        .unwrap()
        .execute()
        .unwrap();
        let parallel = Executor::new(
            ExecutorConfig::parallel(4),
            vec![Simulation::new(counter_model(), config(5, 3))],
        )
        .unwrap()
        .execute()
        .unwrap();

        assert_eq!(sequential.events, parallel.events);
        assert_eq!(sequential.jobs, parallel.jobs);
    }

    #[test]
    fn cancelled_executor_skips_every_job() {
        let executor = Executor::new(
            ExecutorConfig::sequential(),
            vec![Simulation::new(counter_model(), config(2, 2))],
        )
        .unwrap();
        executor.cancel_handle().cancel();
        let log = executor.execute().unwrap();

        let summary = log.summary();
        assert_eq!(summary.cancelled, 6);
        assert!(log.events.is_empty());
    }

    #[test]
    fn cancel_on_failure_skips_later_jobs() {
        let model = Model::new(
            State::from_pairs([("x", 0_i64)]).unwrap(),
            ParameterSpace::new(),
            vec![StateUpdateBlock::new().update("x", |_| Err(StepError::execution("always")))],
        );
        let executor = Executor::new(
            ExecutorConfig {
                cancel_on_failure: true,
                ..ExecutorConfig::sequential()
            },
            vec![Simulation::new(model, config(3, 3))],
        )
        .unwrap();
        let summary = executor.execute().unwrap().summary();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.cancelled, 2);
        assert_eq!(summary.failures[0].kind, "execution");
    }

    #[test]
    fn failure_cancellation_does_not_outlive_its_sweep() {
        let model = Model::new(
            State::from_pairs([("x", 0_i64)]).unwrap(),
            ParameterSpace::new(),
            vec![StateUpdateBlock::new().update("x", |ctx| {
                if ctx.step.run_index == 1 {
                    return Err(StepError::execution("run 1 always fails"));
                }
                Ok(Value::Int(ctx.state.int("x")? + 1))
            })],
        );
        let executor = Executor::new(
            ExecutorConfig {
                cancel_on_failure: true,
                ..ExecutorConfig::sequential()
            },
            vec![Simulation::new(model, config(2, 3))],
        )
        .unwrap();

        for _ in 0..2 {
            let summary = executor.execute().unwrap().summary();
            assert_eq!(
                (summary.completed, summary.failed, summary.cancelled),
                (1, 1, 1)
            );
        }
        assert!(!executor.cancel_handle().is_cancelled());
    }

    #[test]
    fn merge_resorts_out_of_order_outcomes() {
        let executor = Executor::new(
            ExecutorConfig::sequential(),
            vec![Simulation::new(counter_model(), config(1, 2))],
        )
        .unwrap();
        let model = &executor.simulations[0].model;
        let mut outcomes: Vec<RunOutcome> = executor
            .jobs()
            .iter()
            .map(|job| RunController::new(model, 1, Default::default()).run(job))
            .collect();
        outcomes.reverse();

        let log = EventLog::merge(outcomes, vec![executor.subsets(0).unwrap().to_vec()]);
        let keys: Vec<_> = log.events.iter().map(TrajectoryEvent::sort_key).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(log.job(0, 2, 1).unwrap().status, RunStatus::Completed);
    }
}
