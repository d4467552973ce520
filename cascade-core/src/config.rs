//! Engine and router configuration.
//!
//! Both structs deserialize from JSON with every field optional; missing
//! fields take their defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ReactError, Result};

/// Configuration for the propagation engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How many times one node may be deferred within a single turn before
    /// the turn is treated as non-convergent (default: 1024).
    pub max_deferrals_per_node: u32,

    /// Buffer capacity for flows created without an explicit capacity
    /// (default: 64).
    pub default_flow_capacity: usize,

    /// Emit a `trace` event for every node evaluation (default: false).
    pub trace_evaluations: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_deferrals_per_node: 1024,
            default_flow_capacity: 64,
            trace_evaluations: false,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ReactError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_deferrals_per_node == 0 {
            return Err(ReactError::Config(
                "max_deferrals_per_node must be at least 1".into(),
            ));
        }
        if self.default_flow_capacity == 0 {
            return Err(ReactError::Config(
                "default_flow_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for a [`Router`](crate::router::Router).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Routes that have not received an update for this long are disposed by
    /// the next eviction pass. `None` disables idle eviction.
    pub idle_timeout: Option<Duration>,
}

impl RouterConfig {
    pub fn with_idle_timeout(timeout: Duration) -> Self {
        Self {
            idle_timeout: Some(timeout),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ReactError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_deferrals_per_node, 1024);
        assert_eq!(config.default_flow_capacity, 64);
        assert!(!config.trace_evaluations);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config = EngineConfig::from_json_str(r#"{ "trace_evaluations": true }"#).unwrap();
        assert!(config.trace_evaluations);
        assert_eq!(config.default_flow_capacity, 64);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = EngineConfig::from_json_str(r#"{ "default_flow_capacity": 0 }"#).unwrap_err();
        assert!(matches!(err, ReactError::Config(_)));

        let err = EngineConfig::from_json_str("not json").unwrap_err();
        assert!(matches!(err, ReactError::Config(_)));
    }

    #[test]
    fn router_config_parses_durations() {
        let config =
            RouterConfig::from_json_str(r#"{ "idle_timeout": { "secs": 5, "nanos": 0 } }"#)
                .unwrap();
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(5)));
        assert_eq!(RouterConfig::default().idle_timeout, None);
    }
}
