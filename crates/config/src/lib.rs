#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! Configuration for the coordination core.
//!
//! Parsing argv or environment variables into this structure is out of
//! scope here (`spec.md` §6 is explicit that there is no CLI layer in this
//! crate): `Config` is built programmatically, starting from `Config::default`
//! and overriding fields, then checked with `validate_bounds` before a
//! manager is started from it. What belongs in this crate is the shape of
//! the configuration, its defaults, and its validation — the same
//! separation the `config` crate drew around pipeline configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::Validate;

/// Hard cap on the number of workers a manager may launch over its
/// lifetime.
pub const MAX_PROCESSES_CAP: u32 = 50;
/// Hard cap on concurrently live workers, fixed by the width of the
/// process table.
pub const MAX_SIMULTANEOUS_CAP: u32 = 18;
/// Hard cap on the number of distinct resource types.
pub const MAX_RESOURCES_CAP: u32 = 10;
/// Hard cap on the instance count of any single resource type.
pub const MAX_INSTANCES_CAP: u32 = 40;

/// Errors produced while validating a `Config`.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// One or more fields fell outside their allowed range.
    #[error("invalid configuration: {0}")]
    Invalid(#[from] validator::ValidationErrors),
}

/// Coordination-core configuration, per `spec.md` §6.
///
/// All bounds are enforced by `validate_bounds`; a `Config` that passes it
/// is guaranteed constructible into a manager without any field needing a
/// further runtime check. The resource catalogue (`max_resources` types,
/// each with `instances_per_resource` units) is fixed for the life of the
/// manager built from it — resizing it later is out of scope.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    /// Total workers the manager may launch over its lifetime.
    #[validate(range(min = 1, max = 50))]
    pub max_processes: u32,

    /// Concurrent live workers allowed at once (the process table's width).
    #[validate(range(min = 1, max = 18))]
    pub max_simultaneous: u32,

    /// Number of distinct resource types in the catalogue.
    #[validate(range(min = 1, max = 10))]
    pub max_resources: u32,

    /// Instances of each resource type, applied uniformly at manager init.
    #[validate(range(min = 1, max = 40))]
    pub instances_per_resource: u32,

    /// Minimum wall-clock milliseconds between successive worker launches.
    #[validate(range(min = 0))]
    pub launch_interval_ms: u64,

    /// Upper bound, in simulated seconds, on a worker's randomized
    /// lifespan.
    #[validate(range(min = 1))]
    pub child_time_limit_seconds: u64,

    /// Destination of the manager's append-only run log.
    pub log_file_path: String,

    /// Wall-clock hard stop for the whole run, in seconds.
    #[validate(range(min = 1))]
    pub max_runtime_seconds: u64,

    /// Ratio of simulated time advanced per unit of wall time.
    #[validate(range(min = 0.0))]
    pub sim_speed_factor: f64,
}

impl Default for Config {
    /// Defaults taken from the reference implementation's
    /// `include/globals.h` (`DEFAULT_MAX_RESOURCES`, `DEFAULT_MAX_PROCESSES`,
    /// `DEFAULT_MAX_INSTANCES`, `DEFAULT_CHILD_TIME_LIMIT`,
    /// `DEFAULT_LAUNCH_INTERVAL`, `MAX_RUNTIME`) and the `simSpeedFactor`
    /// used by `src/timekeeper.c`.
    fn default() -> Self {
        Self {
            max_processes: 18,
            max_simultaneous: MAX_SIMULTANEOUS_CAP,
            max_resources: 10,
            instances_per_resource: 20,
            launch_interval_ms: 1_000,
            child_time_limit_seconds: 10,
            log_file_path: "psmgmt.log".to_string(),
            max_runtime_seconds: 60,
            sim_speed_factor: clock::DEFAULT_SIM_SPEED_FACTOR,
        }
    }
}

impl Config {
    /// Checks every field against the hard caps of `spec.md` §6.
    pub fn validate_bounds(&self) -> Result<(), Error> {
        Validate::validate(self).map_err(Error::Invalid)
    }

    /// Per-resource-type totals, shaped for `restable::ResourceTable::new`.
    pub fn resource_totals(&self) -> Vec<u32> {
        vec![self.instances_per_resource; self.max_resources as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate_bounds().unwrap();
    }

    #[test]
    fn max_simultaneous_above_hard_cap_is_rejected() {
        let config = Config {
            max_simultaneous: MAX_SIMULTANEOUS_CAP + 1,
            ..Config::default()
        };
        assert!(config.validate_bounds().is_err());
    }

    #[test]
    fn zero_max_processes_is_rejected() {
        let config = Config {
            max_processes: 0,
            ..Config::default()
        };
        assert!(config.validate_bounds().is_err());
    }

    #[test]
    fn resource_totals_has_one_entry_per_resource_type() {
        let config = Config {
            max_resources: 3,
            instances_per_resource: 7,
            ..Config::default()
        };
        assert_eq!(config.resource_totals(), vec![7, 7, 7]);
    }
}
