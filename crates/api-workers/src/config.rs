//! Dispatcher configuration.

use serde::Deserialize;
use std::time::Duration;

/// How a worker unit is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    /// A tokio task on the dispatcher's runtime.
    #[default]
    Task,
    /// A dedicated OS thread driving its own current-thread runtime.
    Thread,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Execution variant for resources registered without an explicit kind.
    pub default_unit_kind: UnitKind,
    /// Prefix of the OS thread name for `UnitKind::Thread` units.
    pub thread_name_prefix: String,
    /// How long shutdown waits for units to exit before detaching the rest.
    pub shutdown_timeout_ms: u64,
}

impl DispatcherConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_unit_kind: UnitKind::Task,
            thread_name_prefix: "api-worker".to_string(),
            shutdown_timeout_ms: 5_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_falls_back_to_defaults() {
        let config: DispatcherConfig =
            serde_json::from_str(r#"{"default_unit_kind": "thread"}"#).unwrap();
        assert_eq!(config.default_unit_kind, UnitKind::Thread);
        assert_eq!(config.thread_name_prefix, "api-worker");
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(5));
    }
}
