//! Trace assembly
//!
//! Turns the merged event log into flat records: one row per (simulation,
//! subset, run, timestep), taken from the last substep of that timestep, with
//! the subset's parameter values and the job status attached.

use indexmap::{IndexMap, IndexSet};
use serde::Serialize;

use crate::executor::EventLog;
use crate::run::{RunStatus, TrajectoryEvent};
use crate::value::Value;

/// Column names owned by the record metadata. State keys and parameter names
/// may not reuse them.
pub const RESERVED_COLUMNS: [&str; 6] = [
    "simulation_id",
    "subset_index",
    "run_index",
    "timestep",
    "substep",
    "status",
];

/// Anything that can be reduced to one row per timestep.
pub trait TimestepRow {
    /// (simulation, subset, run)
    fn run_key(&self) -> (usize, usize, usize);
    fn timestep(&self) -> usize;
    fn substep(&self) -> usize;
}

impl TimestepRow for TrajectoryEvent {
    fn run_key(&self) -> (usize, usize, usize) {
        (self.simulation_id, self.subset_index, self.run_index)
    }

    fn timestep(&self) -> usize {
        self.timestep
    }

    fn substep(&self) -> usize {
        self.substep
    }
}

impl<T: TimestepRow> TimestepRow for &T {
    fn run_key(&self) -> (usize, usize, usize) {
        (**self).run_key()
    }

    fn timestep(&self) -> usize {
        (**self).timestep()
    }

    fn substep(&self) -> usize {
        (**self).substep()
    }
}

/// Keep the highest substep of every (run, timestep) group. Output is sorted
/// and contains no two rows of the same group, so a second pass keeps
/// everything.
pub fn retain_last_substep<T: TimestepRow>(mut rows: Vec<T>) -> Vec<T> {
    rows.sort_by_key(|row| (row.run_key(), row.timestep(), row.substep()));

    let mut retained: Vec<T> = Vec::with_capacity(rows.len());
    for row in rows {
        let same_group = retained
            .last()
            .is_some_and(|last| last.run_key() == row.run_key() && last.timestep() == row.timestep());
        if same_group {
            retained.pop();
        }
        retained.push(row);
    }
    retained
}

/// One assembled row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceRecord {
    pub simulation_id: usize,
    pub subset_index: usize,
    pub run_index: usize,
    pub timestep: usize,
    pub substep: usize,
    pub status: RunStatus,
    #[serde(flatten)]
    pub state: IndexMap<String, Value>,
    #[serde(flatten)]
    pub params: IndexMap<String, Value>,
}

impl TraceRecord {
    /// State value first, then parameter value.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.state.get(name).or_else(|| self.params.get(name))
    }
}

impl TimestepRow for TraceRecord {
    fn run_key(&self) -> (usize, usize, usize) {
        (self.simulation_id, self.subset_index, self.run_index)
    }

    fn timestep(&self) -> usize {
        self.timestep
    }

    fn substep(&self) -> usize {
        self.substep
    }
}

/// Ordered, read-only record sequence handed to analysis code and writers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Trace {
    records: Vec<TraceRecord>,
}

impl Trace {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[TraceRecord] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TraceRecord> {
        self.records.iter()
    }

    pub fn into_records(self) -> Vec<TraceRecord> {
        self.records
    }

    /// Apply the retention rule again. Leaves an assembled trace unchanged.
    pub fn reassemble(self) -> Self {
        Self {
            records: retain_last_substep(self.records),
        }
    }

    /// Records whose subset assigned `value` to parameter `name`.
    pub fn with_param<'a>(&'a self, name: &'a str, value: &'a Value) -> impl Iterator<Item = &'a TraceRecord> + 'a {
        self.records
            .iter()
            .filter(move |record| record.params.get(name) == Some(value))
    }

    /// Records of one (simulation, subset, run).
    pub fn run(&self, simulation_id: usize, subset_index: usize, run_index: usize) -> impl Iterator<Item = &TraceRecord> {
        let key = (simulation_id, subset_index, run_index);
        self.records.iter().filter(move |record| record.run_key() == key)
    }

    /// State keys and parameter names in first-seen order, across every
    /// simulation in the trace.
    pub fn columns(&self) -> (Vec<&str>, Vec<&str>) {
        let mut state: IndexSet<&str> = IndexSet::new();
        let mut params: IndexSet<&str> = IndexSet::new();
        for record in &self.records {
            state.extend(record.state.keys().map(String::as_str));
            params.extend(record.params.keys().map(String::as_str));
        }
        (state.into_iter().collect(), params.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Trace {
    type Item = &'a TraceRecord;
    type IntoIter = std::slice::Iter<'a, TraceRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// Build the flat trace from a merged event log.
///
/// A failed run contributes only the timesteps it finished. Events committed
/// by earlier blocks of the failing timestep stay in the log but get no
/// record.
pub fn assemble(log: &EventLog) -> Trace {
    let finished: Vec<&TrajectoryEvent> = log
        .events
        .iter()
        .filter(|event| {
            log.job(event.simulation_id, event.subset_index, event.run_index)
                .and_then(|job| job.failure.as_ref())
                .map_or(true, |failure| event.timestep < failure.timestep)
        })
        .collect();
    let retained = retain_last_substep(finished);

    let records = retained
        .into_iter()
        .map(|event| {
            let status = log
                .job(event.simulation_id, event.subset_index, event.run_index)
                .map_or(RunStatus::Completed, |job| job.status);
            let params = log
                .subset(event.simulation_id, event.subset_index)
                .map(|subset| subset.values.clone())
                .unwrap_or_default();

            TraceRecord {
                simulation_id: event.simulation_id,
                subset_index: event.subset_index,
                run_index: event.run_index,
                timestep: event.timestep,
                substep: event.substep,
                status,
                state: event.state.to_map(),
                params,
            }
        })
        .collect();

    Trace { records }
}
