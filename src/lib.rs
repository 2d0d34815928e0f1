//! psub - partial state update block simulation
//!
//! A discrete-time simulation engine. A model declares an initial state, the
//! candidate values of its parameters and an ordered list of state update
//! blocks. The engine expands the parameter sweep, runs every (subset, Monte
//! Carlo run) pair through all timesteps on a worker pool, and assembles one
//! flat record per (subset, run, timestep) for analysis.

pub mod block;
pub mod config;
pub mod error;
pub mod executor;
pub mod model;
pub mod models;
pub mod output;
pub mod params;
pub mod run;
pub mod state;
pub mod substep;
pub mod sweep;
pub mod trace;
pub mod value;

// Re-export main types
pub use block::{signals, update_from_signal, PolicyContext, SignalMerge, Signals, StateUpdateBlock, UpdateContext};
pub use config::{ExecutionMode, ExecutorConfig, ExperimentConfig, SimConfig};
pub use error::{ConfigError, PsubError, Result, StepError};
pub use executor::{CancelHandle, EventLog, Executor, Simulation, SweepSummary};
pub use model::Model;
pub use output::{
    create_timestamped_output_dir, write_manifest_json, write_records_csv, write_records_jsonl,
    write_summary_json, Manifest, OUTPUT_SCHEMA_VERSION,
};
pub use params::{ParamSubset, ParameterSpace};
pub use run::{RunController, RunJob, RunOutcome, RunRng, RunStatus, TrajectoryEvent};
pub use state::{State, StateSchema};
pub use substep::{NonFinitePolicy, Stage, StepOptions, SubstepExecutor, SubstepFailure};
pub use sweep::SweepMode;
pub use trace::{assemble, Trace, TraceRecord};
pub use value::Value;
