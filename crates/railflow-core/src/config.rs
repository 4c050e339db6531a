//! Engine configuration
//!
//! Configuration can come from YAML, from `RAILFLOW_*` environment variables,
//! or from both (environment overrides whatever was loaded first).

use serde::{Deserialize, Serialize};
use std::env;
use tracing::{info, warn};

use crate::error::CoreError;

/// Direction of the creation-order tie-break used by the conflict resolver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TieBreak {
    /// The earlier created instance wins
    #[default]
    EarliestFirst,
    /// The most recently created instance wins
    LatestFirst,
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of instances one activation pattern may spawn per step
    #[serde(default = "default_max_instances_per_pattern")]
    pub max_instances_per_pattern: usize,

    /// Maximum number of events dequeued while processing one external event
    #[serde(default = "default_max_events_per_step")]
    pub max_events_per_step: usize,

    /// Steps a terminal instance stays observable before eviction
    #[serde(default = "default_terminal_grace_steps")]
    pub terminal_grace_steps: u64,

    /// Priority for flows that declare none
    #[serde(default = "default_priority")]
    pub default_priority: i32,

    /// Creation-order tie-break direction
    #[serde(default)]
    pub tie_break: TieBreak,

    /// Seed for id generation; random when absent
    #[serde(default)]
    pub id_seed: Option<u64>,
}

fn default_max_instances_per_pattern() -> usize {
    8
}

fn default_max_events_per_step() -> usize {
    1000
}

fn default_terminal_grace_steps() -> u64 {
    1
}

fn default_priority() -> i32 {
    50
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_instances_per_pattern: default_max_instances_per_pattern(),
            max_events_per_step: default_max_events_per_step(),
            terminal_grace_steps: default_terminal_grace_steps(),
            default_priority: default_priority(),
            tie_break: TieBreak::default(),
            id_seed: None,
        }
    }
}

impl EngineConfig {
    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self, CoreError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden from `RAILFLOW_*` environment variables
    pub fn from_env() -> Result<Self, CoreError> {
        let mut config = Self::default();
        config.apply_overrides(|key| env::var(key).ok());
        config.validate()?;
        info!(?config, "Loaded engine configuration");
        Ok(config)
    }

    /// Apply overrides from a variable lookup; invalid values are ignored
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("RAILFLOW_MAX_INSTANCES_PER_PATTERN") {
            match value.parse::<usize>() {
                Ok(parsed) => self.max_instances_per_pattern = parsed,
                Err(_) => warn!("Invalid RAILFLOW_MAX_INSTANCES_PER_PATTERN value: {}", value),
            }
        }

        if let Some(value) = lookup("RAILFLOW_MAX_EVENTS_PER_STEP") {
            match value.parse::<usize>() {
                Ok(parsed) => self.max_events_per_step = parsed,
                Err(_) => warn!("Invalid RAILFLOW_MAX_EVENTS_PER_STEP value: {}", value),
            }
        }

        if let Some(value) = lookup("RAILFLOW_TERMINAL_GRACE_STEPS") {
            match value.parse::<u64>() {
                Ok(parsed) => self.terminal_grace_steps = parsed,
                Err(_) => warn!("Invalid RAILFLOW_TERMINAL_GRACE_STEPS value: {}", value),
            }
        }

        if let Some(value) = lookup("RAILFLOW_DEFAULT_PRIORITY") {
            match value.parse::<i32>() {
                Ok(parsed) => self.default_priority = parsed,
                Err(_) => warn!("Invalid RAILFLOW_DEFAULT_PRIORITY value: {}", value),
            }
        }

        if let Some(value) = lookup("RAILFLOW_TIE_BREAK") {
            match value.to_lowercase().as_str() {
                "earliest-first" => self.tie_break = TieBreak::EarliestFirst,
                "latest-first" => self.tie_break = TieBreak::LatestFirst,
                _ => warn!("Invalid RAILFLOW_TIE_BREAK value: {}", value),
            }
        }

        if let Some(value) = lookup("RAILFLOW_ID_SEED") {
            match value.parse::<u64>() {
                Ok(parsed) => self.id_seed = Some(parsed),
                Err(_) => warn!("Invalid RAILFLOW_ID_SEED value: {}", value),
            }
        }
    }

    /// Reject limits that would stop the engine from making progress
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_instances_per_pattern == 0 {
            return Err(CoreError::ConfigurationError(
                "max_instances_per_pattern must be at least 1".to_string(),
            ));
        }
        if self.max_events_per_step == 0 {
            return Err(CoreError::ConfigurationError(
                "max_events_per_step must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_instances_per_pattern, 8);
        assert_eq!(config.max_events_per_step, 1000);
        assert_eq!(config.terminal_grace_steps, 1);
        assert_eq!(config.default_priority, 50);
        assert_eq!(config.tie_break, TieBreak::EarliestFirst);
        assert!(config.id_seed.is_none());
    }

    #[test]
    fn test_from_yaml_fills_missing_fields() {
        let config = EngineConfig::from_yaml_str(
            "max_instances_per_pattern: 2\ntie_break: latest-first\nid_seed: 9\n",
        )
        .unwrap();

        assert_eq!(config.max_instances_per_pattern, 2);
        assert_eq!(config.tie_break, TieBreak::LatestFirst);
        assert_eq!(config.id_seed, Some(9));
        assert_eq!(config.max_events_per_step, 1000);
    }

    #[test]
    fn test_from_yaml_rejects_zero_limits() {
        let err = EngineConfig::from_yaml_str("max_events_per_step: 0").unwrap_err();
        assert!(matches!(err, CoreError::ConfigurationError(_)));
    }

    #[test]
    fn test_overrides_ignore_invalid_values() {
        let vars: HashMap<&str, &str> = [
            ("RAILFLOW_MAX_INSTANCES_PER_PATTERN", "3"),
            ("RAILFLOW_DEFAULT_PRIORITY", "not-a-number"),
            ("RAILFLOW_TIE_BREAK", "LATEST-FIRST"),
        ]
        .into_iter()
        .collect();

        let mut config = EngineConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.max_instances_per_pattern, 3);
        assert_eq!(config.default_priority, 50);
        assert_eq!(config.tie_break, TieBreak::LatestFirst);
    }
}
