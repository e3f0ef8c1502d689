use crate::infrastructure::error::InfraError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

const APP_JSON: &str = "app.json";
const SCHEMA_VERSION: u64 = 1;
pub const TRACKER_BIN_ENV: &str = "TAGTIMER_TRACKER_BIN";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackerConfig {
    pub schema: u64,
    pub tracker_binary: String,
    pub poll_interval_ms: u64,
    pub command_timeout_ms: u64,
    pub probe_interval_ms: u64,
    pub history_capacity: usize,
    pub history_seed_intervals: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            schema: SCHEMA_VERSION,
            tracker_binary: "timew".to_string(),
            poll_interval_ms: 2_000,
            command_timeout_ms: 5_000,
            probe_interval_ms: 30_000,
            history_capacity: 100,
            history_seed_intervals: 50,
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.tracker_binary.trim().is_empty() {
            return Err("trackerBinary must not be empty".to_string());
        }
        for (value, field) in [
            (self.poll_interval_ms, "pollIntervalMs"),
            (self.command_timeout_ms, "commandTimeoutMs"),
            (self.probe_interval_ms, "probeIntervalMs"),
        ] {
            if value == 0 {
                return Err(format!("{field} must be > 0"));
            }
        }
        if self.history_capacity == 0 {
            return Err("historyCapacity must be > 0".to_string());
        }
        Ok(())
    }

    pub fn with_binary_override(mut self, binary: Option<String>) -> Self {
        if let Some(binary) = binary
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
        {
            self.tracker_binary = binary;
        }
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

fn default_files() -> Result<HashMap<&'static str, serde_json::Value>, InfraError> {
    Ok(HashMap::from([(
        APP_JSON,
        serde_json::to_value(TrackerConfig::default())?,
    )]))
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), InfraError> {
    for (name, value) in default_files()? {
        let path = config_dir.join(name);
        if !path.exists() {
            let formatted = serde_json::to_string_pretty(&value)?;
            fs::write(path, format!("{formatted}\n"))?;
        }
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != SCHEMA_VERSION {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

/// Loads `app.json`, applying the tracker binary override from the environment.
pub fn load_tracker_config(config_dir: &Path) -> Result<TrackerConfig, InfraError> {
    let path = config_dir.join(APP_JSON);
    let config: TrackerConfig = serde_json::from_value(read_config(&path)?)?;
    let config = config.with_binary_override(std::env::var(TRACKER_BIN_ENV).ok());
    config
        .validate()
        .map_err(|message| InfraError::InvalidConfig(format!("{message} in {}", path.display())))?;
    Ok(config)
}
