use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use csv::Writer;
use serde::Serialize;

use crate::error::PsubError;
use crate::executor::SweepSummary;
use crate::trace::{Trace, RESERVED_COLUMNS};
use crate::value::Value;

pub const OUTPUT_SCHEMA_VERSION: &str = "1.0.0";

/// Describes what produced an output directory.
#[derive(Debug, Clone, Serialize)]
pub struct Manifest {
    pub schema_version: String,
    pub crate_version: String,
    pub model: String,
    pub simulations: usize,
    pub records: usize,
    pub files: Vec<String>,
    pub created_at: String,
}

impl Manifest {
    pub fn new(model: impl Into<String>, simulations: usize, trace: &Trace) -> Self {
        Self {
            schema_version: OUTPUT_SCHEMA_VERSION.to_string(),
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
            model: model.into(),
            simulations,
            records: trace.len(),
            files: Vec::new(),
            created_at: Utc::now().to_rfc3339(),
        }
    }
}

/// Create `<root>/<UTC timestamp>`, adding a counter suffix when the
/// directory already exists.
pub fn create_timestamped_output_dir(root: &Path) -> Result<PathBuf, PsubError> {
    fs::create_dir_all(root)?;

    let timestamp = Utc::now().format("%Y-%m-%dT%H-%M-%SZ").to_string();
    let mut output_dir = root.join(&timestamp);
    let mut counter = 1_u32;

    while output_dir.exists() {
        output_dir = root.join(format!("{timestamp}-{counter:02}"));
        counter += 1;
    }

    fs::create_dir_all(&output_dir)?;
    Ok(output_dir)
}

fn fmt_f64(value: f64) -> String {
    format!("{value:.10}")
}

fn fmt_value(value: Option<&Value>) -> String {
    match value {
        Some(Value::Float(v)) => fmt_f64(*v),
        Some(Value::Int(v)) => v.to_string(),
        Some(Value::Bool(v)) => v.to_string(),
        Some(Value::Text(v)) => v.clone(),
        None => String::new(),
    }
}

/// One JSON object per line.
pub fn write_records_jsonl(path: &Path, trace: &Trace) -> Result<(), PsubError> {
    let mut writer = BufWriter::new(File::create(path)?);
    for record in trace {
        serde_json::to_writer(&mut writer, record)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

/// Metadata columns, then state keys, then parameters. Cells of keys a
/// simulation does not declare stay empty.
pub fn write_records_csv(path: &Path, trace: &Trace) -> Result<(), PsubError> {
    let (state_keys, param_names) = trace.columns();

    let mut writer = Writer::from_path(path)?;
    writer.write_record(
        RESERVED_COLUMNS
            .iter()
            .chain(state_keys.iter())
            .chain(param_names.iter()),
    )?;

    for record in trace {
        let mut row = vec![
            record.simulation_id.to_string(),
            record.subset_index.to_string(),
            record.run_index.to_string(),
            record.timestep.to_string(),
            record.substep.to_string(),
            record.status.as_str().to_string(),
        ];
        row.extend(state_keys.iter().map(|key| fmt_value(record.state.get(*key))));
        row.extend(param_names.iter().map(|name| fmt_value(record.params.get(*name))));
        writer.write_record(&row)?;
    }

    writer.flush()?;
    Ok(())
}

pub fn write_summary_json(path: &Path, summary: &SweepSummary) -> Result<(), PsubError> {
    let payload = serde_json::to_string_pretty(summary)?;
    fs::write(path, payload)?;
    Ok(())
}

pub fn write_manifest_json(outdir: &Path, manifest: &Manifest) -> Result<PathBuf, PsubError> {
    let path = outdir.join("manifest.json");
    let payload = serde_json::to_string_pretty(manifest)?;
    fs::write(&path, payload)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::StateUpdateBlock;
    use crate::config::{ExecutorConfig, SimConfig};
    use crate::executor::{Executor, Simulation};
    use crate::model::Model;
    use crate::params::ParameterSpace;
    use crate::state::State;
    use crate::trace::assemble;

    fn trace() -> (Trace, SweepSummary) {
        let model = Model::new(
            State::from_pairs([("x", Value::Float(1.0)), ("n", Value::Int(0))]).unwrap(),
            ParameterSpace::new().param("rate", [0.5, 1.5]),
            vec![StateUpdateBlock::new()
                .uses_params(["rate"])
                .update("x", |ctx| {
                    Ok(Value::Float(ctx.state.float("x")? * ctx.params.float("rate")?))
                })],
        );
        let config = SimConfig {
            timesteps: 2,
            ..SimConfig::default()
        };
        let log = Executor::new(ExecutorConfig::sequential(), vec![Simulation::new(model, config)])
            .unwrap()
            .execute()
            .unwrap();
        (assemble(&log), log.summary())
    }

    #[test]
    fn csv_has_fixed_header_and_formatting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.csv");
        let (trace, _) = trace();
        write_records_csv(&path, &trace).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        let mut lines = raw.lines();
        assert_eq!(
            lines.next().unwrap(),
            "simulation_id,subset_index,run_index,timestep,substep,status,x,n,rate"
        );
        assert_eq!(
            lines.nth(1).unwrap(),
            "0,0,0,1,1,completed,0.5000000000,0,0.5000000000"
        );
        assert_eq!(raw.lines().count(), 1 + trace.len());
    }

    #[test]
    fn jsonl_has_one_object_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.jsonl");
        let (trace, _) = trace();
        write_records_jsonl(&path, &trace).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        let rows: Vec<serde_json::Value> = raw
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(rows.len(), 6);
        assert_eq!(rows[5]["subset_index"], 1);
        assert_eq!(rows[5]["rate"], 1.5);
    }

    #[test]
    fn summary_and_manifest_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let (trace, summary) = trace();

        let summary_path = dir.path().join("summary.json");
        write_summary_json(&summary_path, &summary).unwrap();
        let parsed: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&summary_path).unwrap()).unwrap();
        assert_eq!(parsed["total_jobs"], 2);
        assert_eq!(parsed["failed"], 0);

        let manifest = Manifest::new("test", 1, &trace);
        let path = write_manifest_json(dir.path(), &manifest).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(parsed["schema_version"], OUTPUT_SCHEMA_VERSION);
        assert_eq!(parsed["records"], 6);
    }

    #[test]
    fn timestamped_dirs_never_collide() {
        let root = tempfile::tempdir().unwrap();
        let first = create_timestamped_output_dir(root.path()).unwrap();
        let second = create_timestamped_output_dir(root.path()).unwrap();
        assert_ne!(first, second);
        assert!(first.is_dir() && second.is_dir());
    }
}
