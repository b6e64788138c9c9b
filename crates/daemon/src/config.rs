//! Configuration management for the Tether daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/tether/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tether_protocol::AeadAlgorithm;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 100000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("max_participants must be between 2 and 16, got {0}")]
    InvalidMaxParticipants(usize),

    #[error("default_timeout_secs must be at most 86400 seconds, got {0}")]
    InvalidSessionTimeout(u64),

    #[error("{name} must be greater than 0")]
    ZeroInterval { name: &'static str },

    #[error("rate limit for {operation} must allow at least one attempt per non-empty window")]
    InvalidWindow { operation: &'static str },

    #[error("failure_threshold must be between 1 and 1000, got {0}")]
    InvalidFailureThreshold(u32),

    #[error("base_block_secs ({base}) must be greater than 0 and not exceed max_block_secs ({max})")]
    InvalidBlockDurations { base: u64, max: u64 },

    #[error("kdf_context must not be empty")]
    EmptyKdfContext,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Tether daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Session lifecycle configuration.
    pub session: SessionConfig,

    /// Signaling rate limits and reputation.
    pub rate_limit: RateLimitConfig,

    /// Key agreement and encryption settings.
    pub crypto: CryptoConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for storing daemon data (installation id, fingerprint salt).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Session lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds before an unverified session expires (0 = never).
    pub default_timeout_secs: u64,

    /// Invalidate the session code once the session is verified.
    pub one_time_use: bool,

    /// Seconds a session may sit in `Created` with nobody joining.
    pub abandoned_grace_secs: u64,

    /// Maximum devices in one session, host included.
    pub max_participants: usize,

    /// Deny sensitive operations until the session is verified.
    pub require_verification: bool,

    /// Seconds between cleanup sweeps.
    pub cleanup_interval_secs: u64,

    /// Maximum number of live sessions.
    pub max_sessions: usize,
}

/// Sliding-window limit for one signaling operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct WindowConfig {
    /// Window length in seconds.
    pub window_secs: u64,

    /// Attempts allowed inside one window.
    pub max_attempts: u32,
}

impl WindowConfig {
    /// Window length as a [`Duration`].
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Signaling rate limits and reputation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Limit for session creation.
    pub create: WindowConfig,

    /// Limit for joining with a code.
    pub join: WindowConfig,

    /// Limit for fingerprint verification.
    pub verify: WindowConfig,

    /// Limit for heartbeats and session teardown.
    pub heartbeat: WindowConfig,

    /// Failed attempts that trigger a block.
    pub failure_threshold: u32,

    /// Length of the first block in seconds; doubles with every repeat.
    pub base_block_secs: u64,

    /// Upper bound for any single block in seconds.
    pub max_block_secs: u64,

    /// Successes needed to forgive one failed attempt.
    pub success_decay: u32,

    /// Seconds an idle client's reputation is retained.
    pub retention_secs: u64,

    /// Seconds between reputation sweeps.
    pub sweep_interval_secs: u64,
}

/// Key agreement and encryption settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CryptoConfig {
    /// AEAD used for sealed application events.
    pub aead: AeadAlgorithm,

    /// HKDF info string binding derived keys to this deployment.
    pub kdf_context: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 300, // 5 minutes
            one_time_use: true,
            abandoned_grace_secs: 600,
            max_participants: 2,
            require_verification: true,
            cleanup_interval_secs: 60,
            max_sessions: 1000,
        }
    }
}

impl SessionConfig {
    /// The default session timeout, or `None` when sessions never expire.
    pub fn default_timeout(&self) -> Option<Duration> {
        (self.default_timeout_secs > 0).then(|| Duration::from_secs(self.default_timeout_secs))
    }

    /// Grace period for sessions nobody joins.
    pub fn abandoned_grace(&self) -> Duration {
        Duration::from_secs(self.abandoned_grace_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            create: WindowConfig {
                window_secs: 60,
                max_attempts: 10,
            },
            join: WindowConfig {
                window_secs: 60,
                max_attempts: 5,
            },
            verify: WindowConfig {
                window_secs: 60,
                max_attempts: 5,
            },
            heartbeat: WindowConfig {
                window_secs: 60,
                max_attempts: 120,
            },
            failure_threshold: 10,
            base_block_secs: 60,
            max_block_secs: 3600,
            success_decay: 5,
            retention_secs: 24 * 60 * 60,
            sweep_interval_secs: 60,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            aead: AeadAlgorithm::ChaCha20Poly1305,
            kdf_context: "tether-session-key-v1".to_string(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tether")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tether")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TETHER_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - TETHER_DATA_DIR: Override the data directory
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("TETHER_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!(log_level = %level, "Overriding log_level from environment");
                self.daemon.log_level = level;
            }
        }

        if let Ok(dir) = std::env::var("TETHER_DATA_DIR") {
            if !dir.is_empty() {
                tracing::info!(data_dir = %dir, "Overriding data_dir from environment");
                self.daemon.data_dir = PathBuf::from(dir);
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;
        if session.max_sessions < 1 || session.max_sessions > 100_000 {
            return Err(ConfigError::InvalidMaxSessions(session.max_sessions));
        }
        if session.max_participants < 2 || session.max_participants > 16 {
            return Err(ConfigError::InvalidMaxParticipants(session.max_participants));
        }
        if session.default_timeout_secs > 86_400 {
            return Err(ConfigError::InvalidSessionTimeout(session.default_timeout_secs));
        }
        if session.cleanup_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval {
                name: "cleanup_interval_secs",
            });
        }

        let limits = &self.rate_limit;
        for (operation, window) in [
            ("create", &limits.create),
            ("join", &limits.join),
            ("verify", &limits.verify),
            ("heartbeat", &limits.heartbeat),
        ] {
            if window.window_secs == 0 || window.max_attempts == 0 {
                return Err(ConfigError::InvalidWindow { operation });
            }
        }
        if limits.failure_threshold < 1 || limits.failure_threshold > 1000 {
            return Err(ConfigError::InvalidFailureThreshold(limits.failure_threshold));
        }
        if limits.base_block_secs == 0 || limits.base_block_secs > limits.max_block_secs {
            return Err(ConfigError::InvalidBlockDurations {
                base: limits.base_block_secs,
                max: limits.max_block_secs,
            });
        }
        if limits.success_decay == 0 {
            return Err(ConfigError::ZeroInterval {
                name: "success_decay",
            });
        }
        if limits.sweep_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval {
                name: "sweep_interval_secs",
            });
        }

        if self.crypto.kdf_context.is_empty() {
            return Err(ConfigError::EmptyKdfContext);
        }

        // Validate log_level is a known value
        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    ///
    /// The default path is `~/.config/tether/config.toml`.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.session.default_timeout_secs, 300);
        assert!(config.session.one_time_use);
        assert_eq!(config.session.max_participants, 2);
        assert_eq!(config.rate_limit.failure_threshold, 10);
        assert_eq!(config.rate_limit.join.max_attempts, 5);
        assert_eq!(config.crypto.aead, AeadAlgorithm::ChaCha20Poly1305);
    }

    #[test]
    fn test_default_daemon_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.log_level, "info");
        assert!(config.data_dir.to_string_lossy().contains("tether"));
    }

    #[test]
    fn test_session_durations() {
        let mut config = SessionConfig::default();
        assert_eq!(config.default_timeout(), Some(Duration::from_secs(300)));
        assert_eq!(config.abandoned_grace(), Duration::from_secs(600));

        config.default_timeout_secs = 0;
        assert_eq!(config.default_timeout(), None);
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[daemon]
log_level = "debug"

[session]
max_participants = 4
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.session.max_participants, 4);
        // Other values should be defaults
        assert_eq!(config.session.default_timeout_secs, 300);
        assert_eq!(config.rate_limit, RateLimitConfig::default());
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[daemon]
data_dir = "/custom/data"
log_level = "trace"

[session]
default_timeout_secs = 120
one_time_use = false
abandoned_grace_secs = 30
max_participants = 3
require_verification = false
cleanup_interval_secs = 5
max_sessions = 50

[rate_limit]
failure_threshold = 3
base_block_secs = 10
max_block_secs = 80
success_decay = 2
retention_secs = 600
sweep_interval_secs = 15

[rate_limit.create]
window_secs = 30
max_attempts = 2

[rate_limit.join]
window_secs = 10
max_attempts = 1

[rate_limit.verify]
window_secs = 10
max_attempts = 1

[rate_limit.heartbeat]
window_secs = 1
max_attempts = 4

[crypto]
aead = "aes-256-gcm"
kdf_context = "custom-context"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.daemon.log_level, "trace");
        assert_eq!(config.session.default_timeout_secs, 120);
        assert!(!config.session.one_time_use);
        assert_eq!(config.session.abandoned_grace_secs, 30);
        assert_eq!(config.session.max_participants, 3);
        assert!(!config.session.require_verification);
        assert_eq!(config.session.max_sessions, 50);
        assert_eq!(config.rate_limit.failure_threshold, 3);
        assert_eq!(config.rate_limit.max_block_secs, 80);
        assert_eq!(
            config.rate_limit.create,
            WindowConfig {
                window_secs: 30,
                max_attempts: 2
            }
        );
        assert_eq!(config.rate_limit.heartbeat.window(), Duration::from_secs(1));
        assert_eq!(config.crypto.aead, AeadAlgorithm::Aes256Gcm);
        assert_eq!(config.crypto.kdf_context, "custom-context");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let toml = r#"
[daemon
log_level = "debug"
"#;
        let result = Config::from_toml(toml);
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[session]
max_participants = "two"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_from_toml_unknown_aead() {
        let toml = r#"
[crypto]
aead = "rot13"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_to_toml() {
        let config = Config::default();
        let toml = config.to_toml().unwrap();

        assert!(toml.contains("[daemon]"));
        assert!(toml.contains("[session]"));
        assert!(toml.contains("[rate_limit]"));
        assert!(toml.contains("[crypto]"));
        assert!(toml.contains("chacha20-poly1305"));
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.daemon.log_level = "warn".to_string();
        original.session.one_time_use = false;
        original.rate_limit.verify.max_attempts = 9;
        original.crypto.aead = AeadAlgorithm::Aes256Gcm;

        let toml = original.to_toml().unwrap();
        let loaded = Config::from_toml(&toml).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = Config::default();
        original.daemon.log_level = "debug".to_string();
        original.session.max_participants = 5;

        original.save(&config_path).unwrap();
        let loaded = Config::load(&config_path).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        fs::write(&config_path, "invalid [ toml").unwrap();

        let result = Config::load(&config_path);
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("tether"));
        assert!(path.to_string_lossy().contains("config.toml"));
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        std::env::remove_var("TETHER_DATA_DIR");
        std::env::set_var("TETHER_LOG_LEVEL", "debug");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.daemon.log_level, "debug");

        std::env::remove_var("TETHER_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_override_data_dir() {
        std::env::remove_var("TETHER_LOG_LEVEL");
        std::env::set_var("TETHER_DATA_DIR", "/tmp/tether-test");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.daemon.data_dir, PathBuf::from("/tmp/tether-test"));

        std::env::remove_var("TETHER_DATA_DIR");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("TETHER_LOG_LEVEL", "");
        std::env::set_var("TETHER_DATA_DIR", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config, Config::default());

        std::env::remove_var("TETHER_LOG_LEVEL");
        std::env::remove_var("TETHER_DATA_DIR");
    }

    #[test]
    #[serial]
    fn test_env_override_unset_does_not_override() {
        std::env::remove_var("TETHER_LOG_LEVEL");
        std::env::remove_var("TETHER_DATA_DIR");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_validate_default_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_max_participants() {
        let mut config = Config::default();
        config.session.max_participants = 1;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidMaxParticipants(1))
        );

        config.session.max_participants = 17;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidMaxParticipants(17))
        );

        config.session.max_participants = 16;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_max_sessions() {
        let mut config = Config::default();
        config.session.max_sessions = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxSessions(0)));
    }

    #[test]
    fn test_validate_session_timeout() {
        let mut config = Config::default();
        config.session.default_timeout_secs = 86_401;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidSessionTimeout(86_401))
        );

        // Zero disables expiry and is valid
        config.session.default_timeout_secs = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_window() {
        let mut config = Config::default();
        config.rate_limit.join.max_attempts = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidWindow { operation: "join" })
        );

        let mut config = Config::default();
        config.rate_limit.heartbeat.window_secs = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidWindow {
                operation: "heartbeat"
            })
        );
    }

    #[test]
    fn test_validate_block_durations() {
        let mut config = Config::default();
        config.rate_limit.base_block_secs = 7200;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidBlockDurations {
                base: 7200,
                max: 3600
            })
        );
    }

    #[test]
    fn test_validate_failure_threshold() {
        let mut config = Config::default();
        config.rate_limit.failure_threshold = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidFailureThreshold(0))
        );
    }

    #[test]
    fn test_validate_zero_intervals() {
        let mut config = Config::default();
        config.session.cleanup_interval_secs = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroInterval {
                name: "cleanup_interval_secs"
            })
        );

        let mut config = Config::default();
        config.rate_limit.success_decay = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_kdf_context() {
        let mut config = Config::default();
        config.crypto.kdf_context.clear();
        assert_eq!(config.validate(), Err(ConfigError::EmptyKdfContext));
    }

    #[test]
    fn test_validate_log_level_case_insensitive() {
        let mut config = Config::default();

        config.daemon.log_level = "DEBUG".to_string();
        assert!(config.validate().is_ok());

        config.daemon.log_level = "Warn".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_log_level_invalid() {
        let mut config = Config::default();
        config.daemon.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    fn test_config_error_display() {
        assert_eq!(
            ConfigError::InvalidWindow { operation: "join" }.to_string(),
            "rate limit for join must allow at least one attempt per non-empty window"
        );
        assert_eq!(
            ConfigError::InvalidBlockDurations { base: 0, max: 10 }.to_string(),
            "base_block_secs (0) must be greater than 0 and not exceed max_block_secs (10)"
        );
    }
}
