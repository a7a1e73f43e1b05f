// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Engine tunables, loadable from a TOML file.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory on launch nodes holding the unpacked update payload,
    /// executor logs, and the patch metadata file.
    pub patch_base: Utf8PathBuf,

    /// How often to poll a running executor session for completion.
    pub executor_poll_interval_secs: u64,

    /// Operator-configurable ceiling on one executor invocation. Expiry is
    /// reported as a timeout, never retried automatically.
    pub executor_wait_ceiling_secs: u64,

    /// Hard kill for a single parallel worker (health probe, reachability
    /// check) that does not return on its own.
    pub task_max_execution_time_secs: u64,

    /// Batch-level join deadline for a parallel fan-out; elapsing it kills
    /// the whole batch.
    pub task_join_timeout_secs: u64,

    /// How many times a health-check worker may try to restart an unhealthy
    /// service before reporting the node unhealthy.
    pub health_retry_budget: u32,

    /// Fixed sleep between health-check restart attempts.
    pub health_retry_sleep_secs: u64,

    /// Marker file created on a node for the duration of its EXEC window so
    /// monitoring ignores transient alerts from the update itself.
    pub monitor_suppression_file: Utf8PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            patch_base: "/opt/fleet-patch".into(),
            executor_poll_interval_secs: 30,
            executor_wait_ceiling_secs: 4 * 3600,
            task_max_execution_time_secs: 600,
            task_join_timeout_secs: 900,
            health_retry_budget: 3,
            health_retry_sleep_secs: 10,
            monitor_suppression_file: "/var/run/patch-in-progress".into(),
        }
    }
}

impl Config {
    /// Load a `Config` from the given TOML file.
    pub fn from_file<P: AsRef<Utf8Path>>(path: P) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|error| {
            ConfigError::Io { error, path: path.to_owned() }
        })?;
        toml::from_str(&data).map_err(|error| ConfigError::Parse {
            error,
            path: path.to_owned(),
        })
    }

    pub fn executor_poll_interval(&self) -> Duration {
        Duration::from_secs(self.executor_poll_interval_secs)
    }

    pub fn executor_wait_ceiling(&self) -> Duration {
        Duration::from_secs(self.executor_wait_ceiling_secs)
    }

    pub fn task_max_execution_time(&self) -> Duration {
        Duration::from_secs(self.task_max_execution_time_secs)
    }

    pub fn task_join_timeout(&self) -> Duration {
        Duration::from_secs(self.task_join_timeout_secs)
    }

    pub fn health_retry_sleep(&self) -> Duration {
        Duration::from_secs(self.health_retry_sleep_secs)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {path}")]
    Io {
        #[source]
        error: std::io::Error,
        path: Utf8PathBuf,
    },
    #[error("Failed to parse config file: {path}")]
    Parse {
        #[source]
        error: toml::de::Error,
        path: Utf8PathBuf,
    },
}
