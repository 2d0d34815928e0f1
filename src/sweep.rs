//! Parameter sweep expansion
//!
//! Turns a [`ParameterSpace`] into the ordered list of [`ParamSubset`]s every
//! run is executed against.

use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::params::{ParamSubset, ParameterSpace};
use crate::value::Value;

/// How candidate lists are combined into subsets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepMode {
    /// Full Cartesian product; the last declared parameter varies fastest.
    #[default]
    Cartesian,
    /// Column-wise pairing; single-value lists are broadcast.
    Zip,
}

pub fn expand(space: &ParameterSpace, mode: SweepMode) -> Result<Vec<Arc<ParamSubset>>, ConfigError> {
    let subsets = match mode {
        SweepMode::Cartesian => expand_cartesian(space)?,
        SweepMode::Zip => expand_zip(space)?,
    };
    Ok(subsets.into_iter().map(Arc::new).collect())
}

/// Cartesian product in standard odometer order.
pub fn expand_cartesian(space: &ParameterSpace) -> Result<Vec<ParamSubset>, ConfigError> {
    space.validate()?;

    let columns: Vec<(&str, &[Value])> = space.iter().collect();
    let total = columns
        .iter()
        .try_fold(1_usize, |acc, (_, values)| acc.checked_mul(values.len()))
        .ok_or(ConfigError::SweepTooLarge)?;
    let mut subsets = Vec::with_capacity(total);
    let mut cursor = vec![0_usize; columns.len()];

    for index in 0..total {
        let values: IndexMap<String, Value> = columns
            .iter()
            .zip(cursor.iter())
            .map(|((name, candidates), &pos)| (name.to_string(), candidates[pos].clone()))
            .collect();
        subsets.push(ParamSubset::new(index, values));

        for slot in (0..columns.len()).rev() {
            cursor[slot] += 1;
            if cursor[slot] < columns[slot].1.len() {
                break;
            }
            cursor[slot] = 0;
        }
    }

    Ok(subsets)
}

/// Zipped expansion: all lists longer than one must share one length.
pub fn expand_zip(space: &ParameterSpace) -> Result<Vec<ParamSubset>, ConfigError> {
    space.validate()?;

    let mut width = 1_usize;
    let mut width_owner: Option<&str> = None;
    for (name, values) in space.iter() {
        if values.len() == 1 {
            continue;
        }
        match width_owner {
            None => {
                width = values.len();
                width_owner = Some(name);
            }
            Some(_) if values.len() != width => {
                return Err(ConfigError::ZipLengthMismatch {
                    name: name.to_string(),
                    expected: width,
                    got: values.len(),
                });
            }
            Some(_) => {}
        }
    }

    Ok((0..width)
        .map(|index| {
            let values = space
                .iter()
                .map(|(name, candidates)| {
                    let pos = if candidates.len() == 1 { 0 } else { index };
                    (name.to_string(), candidates[pos].clone())
                })
                .collect();
            ParamSubset::new(index, values)
        })
        .collect())
}
