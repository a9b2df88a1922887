use std::fmt::Display;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use isogroup::KeepPolicy;

/// How overlapping clusters are resolved after merging identical ones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgKeepPolicy {
    /// Keep every distinct cluster
    None,
    #[default]
    /// Drop clusters contained in a larger cluster
    Longest,
    /// Keep only the feature closest to the expected m/z for each isotopologue
    #[value(name = "closest_mz", alias = "closest-mz")]
    ClosestMz,
    /// Apply both `longest` and `closest_mz`
    Both,
}

impl From<ArgKeepPolicy> for KeepPolicy {
    fn from(value: ArgKeepPolicy) -> Self {
        match value {
            ArgKeepPolicy::None => KeepPolicy::None,
            ArgKeepPolicy::Longest => KeepPolicy::Longest,
            ArgKeepPolicy::ClosestMz => KeepPolicy::ClosestMz,
            ArgKeepPolicy::Both => KeepPolicy::Both,
        }
    }
}

impl Display for ArgKeepPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", KeepPolicy::from(*self))
    }
}

pub(crate) fn non_negative_float_f64(s: &str) -> Result<f64, String> {
    let value = s.parse::<f64>().map_err(|e| e.to_string())?;
    if value.is_nan() || value < 0.0 {
        Err(format!("`{s}` is not a non-negative number"))
    } else {
        Ok(value)
    }
}
