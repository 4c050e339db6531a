//! Monitoring for the Railflow engine: log initialisation and engine metrics.

use railflow_core::{EngineObserver, TracingObserver};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub mod logging;
pub mod metrics;

/// Configuration for initializing the monitoring system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Service name attached to logs
    pub service_name: String,
    /// Count engine events through [`MetricsObserver`]; see [`engine_observer`]
    pub enable_metrics: bool,
    /// Log level filter (e.g., "info,railflow_core=debug"); `RUST_LOG` wins when set
    pub log_filter: String,
    /// Emit JSON lines instead of human readable output
    pub enable_json_logging: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service_name: "railflow".to_string(),
            enable_metrics: true,
            log_filter: "info".to_string(),
            enable_json_logging: false,
        }
    }
}

pub use crate::logging::init_logging;
pub use crate::metrics::{global_stats, EngineStats, MetricsObserver, StatsSnapshot};

/// Observer to install on an engine for this configuration.
///
/// With metrics enabled events are counted into [`global_stats`] and then
/// logged; otherwise they are only logged.
pub fn engine_observer(config: &MonitoringConfig) -> Arc<dyn EngineObserver> {
    if config.enable_metrics {
        Arc::new(MetricsObserver::new())
    } else {
        Arc::new(TracingObserver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = MonitoringConfig::default();
        assert_eq!(config.service_name, "railflow");
        assert!(config.enable_metrics);
        assert!(!config.enable_json_logging);
    }

    #[test]
    fn test_engine_observer_respects_enable_metrics() {
        use railflow_core::{EngineEvent, InvocationId};

        let late = EngineEvent::LateActionResult {
            invocation_id: InvocationId::from("x"),
        };
        let before = global_stats().snapshot().late_results;

        let disabled = MonitoringConfig {
            enable_metrics: false,
            ..MonitoringConfig::default()
        };
        engine_observer(&disabled).observe(&late);
        let after_disabled = global_stats().snapshot().late_results;

        engine_observer(&MonitoringConfig::default()).observe(&late);
        let after_enabled = global_stats().snapshot().late_results;

        assert_eq!(after_disabled, before);
        assert_eq!(after_enabled, before + 1);
    }

    #[test]
    fn test_config_partial_json() {
        let config: MonitoringConfig =
            serde_json::from_str(r#"{ "enable_json_logging": true }"#).unwrap();
        assert!(config.enable_json_logging);
        assert_eq!(config.log_filter, "info");
    }
}
