//! Restart configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MoltError, Result};
use crate::manifest::DEFAULT_MANIFEST_VAR;
use crate::shutdown::DEFAULT_SHUTDOWN_TIMEOUT;

/// Settings for one process's part in the handoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartConfig {
    /// Environment variable that carries the manifest to a successor.
    #[serde(default = "default_manifest_var")]
    pub manifest_var: String,

    /// Deadline handed to the quit callback.
    #[serde(default = "default_shutdown_timeout")]
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Whether a successor sends SIGINT to its parent once it is ready.
    #[serde(default = "default_true")]
    pub notify_parent: bool,
}

fn default_manifest_var() -> String {
    DEFAULT_MANIFEST_VAR.to_string()
}

fn default_shutdown_timeout() -> Duration {
    DEFAULT_SHUTDOWN_TIMEOUT
}

fn default_true() -> bool {
    true
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            manifest_var: default_manifest_var(),
            shutdown_timeout: default_shutdown_timeout(),
            notify_parent: true,
        }
    }
}

impl RestartConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the manifest variable name.
    #[must_use]
    pub fn with_manifest_var(mut self, name: impl Into<String>) -> Self {
        self.manifest_var = name.into();
        self
    }

    /// Sets the quit deadline.
    #[must_use]
    pub const fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Enables or disables the readiness signal to the parent.
    #[must_use]
    pub const fn with_notify_parent(mut self, notify: bool) -> Self {
        self.notify_parent = notify;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns an error if the manifest variable is not a usable
    /// environment name or the timeout is zero.
    pub fn validate(&self) -> Result<()> {
        if self.manifest_var.is_empty() {
            return Err(MoltError::config("manifest_var cannot be empty"));
        }
        if self.manifest_var.contains(['=', '\0']) {
            return Err(MoltError::config(
                "manifest_var cannot contain '=' or NUL",
            ));
        }
        if self.shutdown_timeout.is_zero() {
            return Err(MoltError::config("shutdown_timeout must be greater than 0"));
        }
        Ok(())
    }

    /// Parses and validates a TOML document.
    ///
    /// # Errors
    /// Returns an error if the document cannot be parsed or is invalid.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| MoltError::config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| MoltError::config(format!("failed to read config: {e}")))?;
        Self::from_toml_str(&content)
    }
}

/// Serde helper for humantime durations.
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serializes a duration as a human-readable string.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    /// Deserializes a duration from a human-readable string.
    ///
    /// # Errors
    /// Returns an error if the string cannot be parsed.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = RestartConfig::default();
        assert_eq!(config.manifest_var, "ENDLESS");
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert!(config.notify_parent);
        tokio_test::assert_ok!(config.validate());
    }

    #[test]
    fn test_config_empty_document() {
        let config = RestartConfig::from_toml_str("").unwrap();
        assert_eq!(config, RestartConfig::default());
    }

    #[test]
    fn test_config_parse() {
        let config = RestartConfig::from_toml_str(
            r#"
            manifest_var = "APP_HANDOFF"
            shutdown_timeout = "1m 30s"
            notify_parent = false
            "#,
        )
        .unwrap();
        assert_eq!(config.manifest_var, "APP_HANDOFF");
        assert_eq!(config.shutdown_timeout, Duration::from_secs(90));
        assert!(!config.notify_parent);
    }

    #[test]
    fn test_config_validate_manifest_var() {
        tokio_test::assert_err!(RestartConfig::new().with_manifest_var("").validate());
        tokio_test::assert_err!(RestartConfig::new().with_manifest_var("A=B").validate());
        tokio_test::assert_err!(RestartConfig::new().with_manifest_var("A\0").validate());
    }

    #[test]
    fn test_config_validate_timeout() {
        let config = RestartConfig::new().with_shutdown_timeout(Duration::ZERO);
        assert!(matches!(config.validate(), Err(MoltError::Config(_))));
    }

    #[test]
    fn test_config_bad_duration() {
        let err = RestartConfig::from_toml_str(r#"shutdown_timeout = "soon""#).unwrap_err();
        assert!(matches!(err, MoltError::Config(_)));
    }

    #[test]
    fn test_config_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("molt.toml");
        std::fs::write(&path, "shutdown_timeout = \"250ms\"\n").unwrap();
        let config = RestartConfig::load(&path).unwrap();
        assert_eq!(config.shutdown_timeout, Duration::from_millis(250));

        assert!(RestartConfig::load(dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_config_serialize_roundtrip() {
        let config = RestartConfig::new().with_shutdown_timeout(Duration::from_secs(12));
        let text = toml::to_string(&config).unwrap();
        assert_eq!(RestartConfig::from_toml_str(&text).unwrap(), config);
    }
}
