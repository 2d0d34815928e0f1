//! Model plugin contract
//!
//! A model is the initial state, the parameter candidates and the ordered
//! block sequence. The engine checks its structure once, never its formulas.

use crate::block::StateUpdateBlock;
use crate::error::ConfigError;
use crate::params::ParameterSpace;
use crate::state::State;
use crate::substep::NonFinitePolicy;
use crate::trace::RESERVED_COLUMNS;

#[derive(Debug)]
pub struct Model {
    pub initial_state: State,
    pub params: ParameterSpace,
    pub blocks: Vec<StateUpdateBlock>,
}

impl Model {
    pub fn new(initial_state: State, params: ParameterSpace, blocks: Vec<StateUpdateBlock>) -> Self {
        Self {
            initial_state,
            params,
            blocks,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.blocks.is_empty() {
            return Err(ConfigError::NoBlocks);
        }

        self.params.validate()?;

        let schema = self.initial_state.schema();
        for name in schema.keys().chain(self.params.names()) {
            if RESERVED_COLUMNS.contains(&name) {
                return Err(ConfigError::ReservedName(name.to_string()));
            }
        }
        if let Some(name) = self.params.names().find(|name| schema.contains(name)) {
            return Err(ConfigError::NameClash(name.to_string()));
        }

        for (idx, block) in self.blocks.iter().enumerate() {
            block.validate(idx, schema, &self.params)?;
        }

        Ok(())
    }

    /// Under `Fail`, a non-finite initial value would only surface as a guard
    /// failure in the first substep of every run.
    pub fn validate_initial_state(&self, policy: NonFinitePolicy) -> Result<(), ConfigError> {
        if policy == NonFinitePolicy::Fail {
            if let Some((key, value)) = self.initial_state.first_non_finite() {
                return Err(ConfigError::NonFiniteInitialState {
                    key: key.to_string(),
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }
}
