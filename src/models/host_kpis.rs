//! Host KPI model
//!
//! Tracks one connectivity host over a year: clients arrive along an
//! S-shaped adoption curve capped by the host's line capacity, demand follows
//! clients, and revenue, expenses (net of the platform commission), daily
//! profit and cumulative profit follow demand with a one-day lag. Every
//! policy reads the previous day's snapshot, so the model is a single block.
//!
//! `demand_noise` scales a multiplicative Normal(1, σ) factor on demand,
//! drawn from the run generator. At the default of 0 the model is
//! deterministic.

use rand_distr::{Distribution, Normal};

use crate::block::{signals, update_from_signal, PolicyContext, Signals, StateUpdateBlock};
use crate::config::{SimConfig, DEFAULT_TIMESTEPS};
use crate::error::{ConfigError, StepError};
use crate::model::Model;
use crate::params::ParameterSpace;
use crate::state::State;
use crate::sweep::SweepMode;
use crate::value::Value;

pub const MODEL_NAME: &str = "host_kpis";

pub fn initial_state() -> Result<State, ConfigError> {
    State::from_pairs([
        ("clients", Value::Int(0)),
        ("demand", Value::Float(0.0)),
        ("host_revenue", Value::Float(0.0)),
        ("host_expenses", Value::Float(0.0)),
        ("host_profit", Value::Float(0.0)),
        ("cumulative_profit", Value::Float(0.0)),
    ])
}

/// Four scenarios meant for a zip sweep: client allocation of 10 and 30 Mbps
/// under a slow and a fast adoption curve.
pub fn parameters() -> ParameterSpace {
    ParameterSpace::new()
        .param("price", [0.3])
        .param("host_line_cost", [0.06])
        .param("host_capacity", [2000.0])
        .param("potential_clients", [100.0])
        .param("operating_expenses", [10.0])
        .param("avg_client_allocation", [10.0, 30.0, 10.0, 30.0])
        .param("platform_fee", [0.02])
        .param("client_acquisition_rate_coeff", [0.013, 0.013, 0.016, 0.016])
        .param("adoption_midpoint", [DEFAULT_TIMESTEPS as f64 / 2.0])
        .param("demand_noise", [0.0])
}

pub fn model() -> Result<Model, ConfigError> {
    let block = StateUpdateBlock::new()
        .describe("client acquisition, demand and host finances")
        .uses_params([
            "price",
            "host_line_cost",
            "host_capacity",
            "potential_clients",
            "operating_expenses",
            "avg_client_allocation",
            "platform_fee",
            "client_acquisition_rate_coeff",
            "adoption_midpoint",
            "demand_noise",
        ])
        .policy("client_acquisition", client_acquisition)
        .policy("demand", demand)
        .policy("revenue", revenue)
        .policy("expenses", expenses)
        .policy("profit", profit)
        .policy("cumulative_profit", cumulative_profit)
        .update("clients", update_from_signal("new_clients"))
        .update("demand", update_from_signal("demand"))
        .update("host_revenue", update_from_signal("host_revenue"))
        .update("host_expenses", update_from_signal("host_expenses"))
        .update("host_profit", update_from_signal("host_profit"))
        .update("cumulative_profit", update_from_signal("cumulative_profit"));

    Ok(Model::new(initial_state()?, parameters(), vec![block]))
}

/// One year, zipped scenarios, one run.
pub fn default_config() -> SimConfig {
    SimConfig {
        timesteps: DEFAULT_TIMESTEPS,
        sweep_mode: SweepMode::Zip,
        ..SimConfig::default()
    }
}

/// Logistic adoption over the day index of the previous snapshot, truncated
/// to whole clients and capped at what the host line can serve.
fn client_acquisition(ctx: &mut PolicyContext<'_>) -> Result<Signals, StepError> {
    let params = ctx.params;
    let max_clients = params.float("host_capacity")? / params.float("avg_client_allocation")?;

    let x = ctx.step.timestep.saturating_sub(1) as f64;
    let k = params.float("client_acquisition_rate_coeff")?;
    let midpoint = params.float("adoption_midpoint")?;
    let height = params.float("potential_clients")?;
    let adopted = height / (1.0 + (-k * (x - midpoint)).exp());

    let clients = adopted.min(max_clients);
    if !clients.is_finite() || clients < 0.0 {
        return Err(StepError::invalid_state("clients", format!("adoption produced {clients}")));
    }
    Ok(signals([("new_clients", clients.trunc() as i64)]))
}

fn demand(ctx: &mut PolicyContext<'_>) -> Result<Signals, StepError> {
    let clients = ctx.state.float("clients")?;
    let mut demand = clients * ctx.params.float("avg_client_allocation")?;

    let noise = ctx.params.float("demand_noise")?;
    if noise > 0.0 {
        let factor = Normal::new(1.0, noise).map_err(|err| StepError::execution(err.to_string()))?;
        demand *= factor.sample(&mut *ctx.rng);
    }
    if demand < 0.0 {
        return Err(StepError::invalid_state("demand", format!("negative demand {demand}")));
    }
    Ok(signals([("demand", demand)]))
}

fn revenue(ctx: &mut PolicyContext<'_>) -> Result<Signals, StepError> {
    let revenue = ctx.state.float("demand")? * ctx.params.float("price")?;
    Ok(signals([("host_revenue", revenue)]))
}

fn expenses(ctx: &mut PolicyContext<'_>) -> Result<Signals, StepError> {
    let params = ctx.params;
    let commission = ctx.state.float("host_revenue")? * params.float("platform_fee")?;
    let expenses = params.float("host_line_cost")? * params.float("host_capacity")?
        + params.float("operating_expenses")?
        - commission;
    Ok(signals([("host_expenses", expenses)]))
}

fn profit(ctx: &mut PolicyContext<'_>) -> Result<Signals, StepError> {
    let profit = ctx.state.float("host_revenue")? - ctx.state.float("host_expenses")?;
    Ok(signals([("host_profit", profit)]))
}

fn cumulative_profit(ctx: &mut PolicyContext<'_>) -> Result<Signals, StepError> {
    let total = ctx.state.float("cumulative_profit")? + ctx.state.float("host_profit")?;
    Ok(signals([("cumulative_profit", total)]))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use approx::assert_relative_eq;

    use super::*;
    use crate::run::{RunController, RunJob, RunStatus};
    use crate::sweep;

    fn run(subset_index: usize, timesteps: usize, overrides: &[(&str, f64)], seed: u64) -> crate::run::RunOutcome {
        let mut model = model().unwrap();
        for (name, value) in overrides {
            model
                .params
                .override_with(name, vec![Value::Float(*value)])
                .unwrap();
        }
        model.validate().unwrap();
        let subsets = sweep::expand(&model.params, SweepMode::Zip).unwrap();
        let job = RunJob {
            simulation_id: 0,
            subset: Arc::clone(&subsets[subset_index.min(subsets.len() - 1)]),
            run_index: 0,
            seed,
        };
        RunController::new(&model, timesteps, Default::default()).run(&job)
    }

    #[test]
    fn default_model_is_valid_and_zips_four_scenarios() {
        let model = model().unwrap();
        assert_eq!(model.validate(), Ok(()));
        let subsets = sweep::expand(&model.params, SweepMode::Zip).unwrap();
        assert_eq!(subsets.len(), 4);
        assert_eq!(subsets[1].float("avg_client_allocation").unwrap(), 30.0);
        assert_eq!(subsets[2].float("client_acquisition_rate_coeff").unwrap(), 0.016);
        assert_eq!(default_config().sweep_mode, SweepMode::Zip);
    }

    #[test]
    fn first_days_follow_the_lagged_formulas() {
        let outcome = run(0, 2, &[], 0);
        assert_eq!(outcome.status, RunStatus::Completed);

        let day1 = &outcome.events[1].state;
        // 100 / (1 + e^(0.013 * 182.5)) = 8.53
        assert_eq!(day1.int("clients").unwrap(), 8);
        assert_relative_eq!(day1.float("demand").unwrap(), 0.0);
        assert_relative_eq!(day1.float("host_expenses").unwrap(), 130.0);
        assert_relative_eq!(day1.float("host_profit").unwrap(), 0.0);

        let day2 = &outcome.events[2].state;
        assert_relative_eq!(day2.float("demand").unwrap(), 80.0);
        assert_relative_eq!(day2.float("host_profit").unwrap(), -130.0);
        assert_relative_eq!(day2.float("cumulative_profit").unwrap(), 0.0);
    }

    #[test]
    fn clients_are_capped_by_host_capacity() {
        let outcome = run(1, 5, &[("potential_clients", 10_000.0)], 0);
        for event in &outcome.events[1..] {
            assert_eq!(event.state.int("clients").unwrap(), 66);
        }
    }

    #[test]
    fn profit_accumulates_over_a_year() {
        let outcome = run(2, DEFAULT_TIMESTEPS, &[], 0);
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.events.len(), DEFAULT_TIMESTEPS + 1);

        let last = outcome.final_state().unwrap();
        let profits: f64 = outcome.events[..outcome.events.len() - 1]
            .iter()
            .map(|event| event.state.float("host_profit").unwrap())
            .sum();
        assert_relative_eq!(last.float("cumulative_profit").unwrap(), profits, max_relative = 1e-9);
    }

    #[test]
    fn demand_noise_is_seeded() {
        let a = run(0, 30, &[("demand_noise", 0.1)], 3);
        let b = run(0, 30, &[("demand_noise", 0.1)], 3);
        let c = run(0, 30, &[("demand_noise", 0.1)], 4);

        assert_eq!(a.events, b.events);
        assert_ne!(a.events, c.events);
    }

    #[test]
    fn negative_demand_fails_the_run() {
        let outcome = run(0, DEFAULT_TIMESTEPS, &[("demand_noise", 50.0)], 1);
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.failure.unwrap().error.kind(), "numeric_invalid_state");
    }
}
