//! Runtime settings.
//!
//! Precedence, lowest first: built-in defaults, an optional YAML file, then
//! `PLATE_LIVE_<FIELD>` environment variables. Unparseable environment values
//! are logged and ignored.

use crate::error::{LiveError, LiveResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt::Display;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

pub const ENV_PREFIX: &str = "PLATE_LIVE_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LiveConfig {
    pub sweep_interval_secs: u64,
    pub audit_interval_secs: u64,
    pub stats_interval_secs: u64,
    /// 0 disables the limit.
    pub max_connections: usize,
    pub worker_threads: usize,
    pub failure_log_capacity: usize,
    pub heartbeat: bool,
    /// Re-trigger samples the scheduled audit finds inconsistent.
    pub audit_repair: bool,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
            audit_interval_secs: 300,
            stats_interval_secs: 60,
            max_connections: 1000,
            worker_threads: 4,
            failure_log_capacity: 1000,
            heartbeat: true,
            audit_repair: false,
        }
    }
}

impl LiveConfig {
    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> LiveResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> LiveResult<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| LiveError::Config(format!("read {}: {}", path.display(), e)))?;
        let config = Self::from_yaml_str(&raw)?;
        info!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    pub fn from_yaml_str(raw: &str) -> LiveResult<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).map_err(|e| LiveError::Config(format!("parse yaml: {}", e)))
    }

    /// Overlay values from `lookup`, keyed by `PLATE_LIVE_<FIELD>`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        override_from(&lookup, "SWEEP_INTERVAL_SECS", &mut self.sweep_interval_secs);
        override_from(&lookup, "AUDIT_INTERVAL_SECS", &mut self.audit_interval_secs);
        override_from(&lookup, "STATS_INTERVAL_SECS", &mut self.stats_interval_secs);
        override_from(&lookup, "MAX_CONNECTIONS", &mut self.max_connections);
        override_from(&lookup, "WORKER_THREADS", &mut self.worker_threads);
        override_from(&lookup, "FAILURE_LOG_CAPACITY", &mut self.failure_log_capacity);
        override_from(&lookup, "HEARTBEAT", &mut self.heartbeat);
        override_from(&lookup, "AUDIT_REPAIR", &mut self.audit_repair);
    }

    pub fn validate(&self) -> LiveResult<()> {
        let mut problems = Vec::new();
        if self.sweep_interval_secs == 0 {
            problems.push("sweep_interval_secs must be > 0");
        }
        if self.audit_interval_secs == 0 {
            problems.push("audit_interval_secs must be > 0");
        }
        if self.stats_interval_secs == 0 {
            problems.push("stats_interval_secs must be > 0");
        }
        if self.worker_threads == 0 {
            problems.push("worker_threads must be > 0");
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(LiveError::Config(problems.join("; ")))
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn audit_interval(&self) -> Duration {
        Duration::from_secs(self.audit_interval_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}

fn override_from<T>(lookup: &impl Fn(&str) -> Option<String>, field: &str, slot: &mut T)
where
    T: FromStr + Display,
    T::Err: Display,
{
    let key = format!("{}{}", ENV_PREFIX, field);
    let Some(raw) = lookup(&key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => {
            info!("{key} set, using {value}");
            *slot = value;
        }
        Err(e) => warn!("Invalid {key} value {raw:?}: {e}, keeping {slot}"),
    }
}
