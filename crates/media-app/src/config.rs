//! Application configuration.
//!
//! Values are layered, later sources winning:
//!
//! 1. Built-in defaults.
//! 2. An optional configuration file (any format the `config` crate detects by extension).
//! 3. Environment variables prefixed with `MEDIA_MANAGER`, sections separated by `__`,
//!    e.g. `MEDIA_MANAGER__REST_API__VERSION=v1`.

use api_workers::DispatcherConfig;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::error::AppError;

const ENV_PREFIX: &str = "MEDIA_MANAGER";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub rest_api: RestApiConfig,
    pub notifications: NotificationsConfig,
    pub dispatcher: DispatcherConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RestApiConfig {
    pub path_prefix: String,
    pub version: String,
}

impl Default for RestApiConfig {
    fn default() -> Self {
        Self {
            path_prefix: "/api/media-manager".to_string(),
            version: "v0".to_string(),
        }
    }
}

impl RestApiConfig {
    /// Full path of the resource mounted at `name`, e.g. `/images` →
    /// `/api/media-manager/v0/images`.
    pub fn full_path(&self, name: &str) -> String {
        format!(
            "{}/{}/{}",
            self.path_prefix.trim_end_matches('/'),
            self.version.trim_matches('/'),
            name.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    /// Events buffered per topic before slow subscribers start lagging.
    pub channel_capacity: usize,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
        }
    }
}

impl AppConfig {
    /// Loads defaults, then `file` if given, then the process environment.
    pub fn load(file: Option<&Path>) -> Result<Self, AppError> {
        Self::load_from(file, None)
    }

    fn load_from(
        file: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, AppError> {
        let mut builder = Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(File::from(file));
        }
        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .source(env),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use api_workers::UnitKind;

    #[test]
    fn defaults_mount_under_media_manager_v0() {
        let config = AppConfig::load_from(None, Some(HashMap::new())).unwrap();
        assert_eq!(config.rest_api.path_prefix, "/api/media-manager");
        assert_eq!(config.rest_api.version, "v0");
        assert_eq!(config.notifications.channel_capacity, 256);
        assert_eq!(config.dispatcher.default_unit_kind, UnitKind::Task);
    }

    #[test]
    fn environment_overrides_defaults() {
        let env = HashMap::from([
            ("MEDIA_MANAGER__REST_API__VERSION".to_string(), "v1".to_string()),
            (
                "MEDIA_MANAGER__DISPATCHER__DEFAULT_UNIT_KIND".to_string(),
                "thread".to_string(),
            ),
            (
                "MEDIA_MANAGER__NOTIFICATIONS__CHANNEL_CAPACITY".to_string(),
                "16".to_string(),
            ),
        ]);
        let config = AppConfig::load_from(None, Some(env)).unwrap();
        assert_eq!(config.rest_api.version, "v1");
        assert_eq!(config.rest_api.path_prefix, "/api/media-manager");
        assert_eq!(config.dispatcher.default_unit_kind, UnitKind::Thread);
        assert_eq!(config.notifications.channel_capacity, 16);
    }

    #[test]
    fn full_path_joins_prefix_version_and_name() {
        let rest = RestApiConfig::default();
        assert_eq!(rest.full_path("/images"), "/api/media-manager/v0/images");
        assert_eq!(
            rest.full_path("/storage/synchronizers"),
            "/api/media-manager/v0/storage/synchronizers"
        );

        let rest = RestApiConfig {
            path_prefix: "/api/".into(),
            version: "v2".into(),
        };
        assert_eq!(rest.full_path("tags"), "/api/v2/tags");
    }
}
