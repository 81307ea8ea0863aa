//! Run configuration and credential loading.
//!
//! Configuration is a TOML file with three tables (`run`, `reputation`,
//! `distribution`), every field defaulted so an empty file is valid.
//! Secrets are never stored in the file: collaborator credentials come
//! from the environment and are checked before the run starts.

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use std::fmt;
use thiserror::Error;

/// Environment variable holding the distribution endpoint user name.
pub const ENV_DIST_USERNAME: &str = "PACKFERRY_DIST_USERNAME";
/// Environment variable holding the distribution endpoint password.
pub const ENV_DIST_PASSWORD: &str = "PACKFERRY_DIST_PASSWORD";
/// Environment variable holding the scanning collaborator API key.
pub const ENV_SCAN_API_KEY: &str = "PACKFERRY_SCAN_API_KEY";

/// Errors arising from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// Path to the configuration file.
        path: Utf8PathBuf,
        /// The underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML of the expected shape.
    #[error("failed to parse config {path}: {reason}")]
    Parse {
        /// Path to the configuration file.
        path: Utf8PathBuf,
        /// Description of the parse failure.
        reason: String,
    },

    /// A configuration value is out of range or inconsistent.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// Description of the inconsistency.
        reason: String,
    },

    /// A required credential is absent from the environment.
    #[error("missing credential: set {variable} ({purpose})")]
    MissingCredential {
        /// The environment variable that must be set.
        variable: &'static str,
        /// What the credential is for.
        purpose: &'static str,
    },
}

/// Policy applied when the scanning collaborator is unreachable.
///
/// The choice is always explicit: an unreachable scanner is a distinct,
/// non-fatal warning state, and only configuration decides whether an
/// unscanned artifact may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UnavailablePolicy {
    /// Degrade gracefully: publish with a recorded warning.
    Allow,
    /// Fail closed: block the artifact for this run.
    #[default]
    Block,
}

impl fmt::Display for UnavailablePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => write!(f, "allow (fail open)"),
            Self::Block => write!(f, "block (fail closed)"),
        }
    }
}

/// General run settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunSection {
    /// Maximum number of parallel workers.
    pub jobs: usize,
    /// Directory receiving per-entry download subdirectories.
    pub downloads_dir: Utf8PathBuf,
    /// Path the finalized run report is written to.
    pub report_path: Utf8PathBuf,
    /// Keep per-entry working directories after the run instead of
    /// deleting them.
    pub retain_artifacts: bool,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            jobs: 4,
            downloads_dir: Utf8PathBuf::from("downloads"),
            report_path: Utf8PathBuf::from("reports/results.json"),
            retain_artifacts: false,
        }
    }
}

/// Reputation gate settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReputationSection {
    /// Whether reputation checking runs at all. Disabling it is recorded
    /// in every outcome.
    pub enabled: bool,
    /// Base URL of the scanning collaborator's API.
    pub base_url: String,
    /// An artifact is flagged when positive detections exceed this count.
    pub flag_threshold: u32,
    /// What to do when no verdict can be obtained.
    pub unavailable_policy: UnavailablePolicy,
    /// Outbound request ceiling shared across all workers.
    pub requests_per_minute: u32,
    /// Seconds between verdict polls after a submission.
    pub poll_interval_secs: u64,
    /// Maximum seconds to wait for a verdict before declaring it
    /// unavailable.
    pub poll_deadline_secs: u64,
}

impl Default for ReputationSection {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: String::new(),
            flag_threshold: 0,
            unavailable_policy: UnavailablePolicy::Block,
            requests_per_minute: 4,
            poll_interval_secs: 15,
            poll_deadline_secs: 300,
        }
    }
}

/// Distribution publisher settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DistributionSection {
    /// Base URL of the distribution endpoint's API.
    pub base_url: String,
    /// Chunk size in bytes for uploads.
    pub chunk_size: u64,
    /// How many attempts each chunk gets before the publish fails.
    pub chunk_retry_limit: u32,
    /// Base backoff in milliseconds between chunk retries; doubles per
    /// attempt.
    pub retry_backoff_ms: u64,
}

impl Default for DistributionSection {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            chunk_size: 4 * 1024 * 1024,
            chunk_retry_limit: 3,
            retry_backoff_ms: 500,
        }
    }
}

/// The complete run configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// General run settings.
    pub run: RunSection,
    /// Reputation gate settings.
    pub reputation: ReputationSection,
    /// Distribution publisher settings.
    pub distribution: DistributionSection,
}

impl RunConfig {
    /// Load configuration from a TOML file and validate it.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the file cannot be read or parsed,
    /// or when any value fails [`Self::validate`].
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges and cross-field consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run.jobs == 0 {
            return Err(ConfigError::Invalid {
                reason: "run.jobs must be at least 1".to_owned(),
            });
        }
        if self.distribution.chunk_size == 0 {
            return Err(ConfigError::Invalid {
                reason: "distribution.chunk_size must be at least 1".to_owned(),
            });
        }
        if self.distribution.chunk_retry_limit == 0 {
            return Err(ConfigError::Invalid {
                reason: "distribution.chunk_retry_limit must be at least 1".to_owned(),
            });
        }
        if self.distribution.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid {
                reason: "distribution.base_url must be set".to_owned(),
            });
        }
        if self.reputation.enabled {
            if self.reputation.base_url.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    reason: "reputation.base_url must be set when reputation is enabled"
                        .to_owned(),
                });
            }
            if self.reputation.requests_per_minute == 0 {
                return Err(ConfigError::Invalid {
                    reason: "reputation.requests_per_minute must be at least 1".to_owned(),
                });
            }
        }
        Ok(())
    }
}

/// Credentials for the external collaborators, sourced from the
/// environment.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Distribution endpoint user name.
    pub dist_username: String,
    /// Distribution endpoint password.
    pub dist_password: String,
    /// Scanning collaborator API key; present only when reputation
    /// checking is enabled.
    pub scan_api_key: Option<String>,
}

impl Credentials {
    /// Read credentials from the environment, requiring the scanner key
    /// only when reputation checking is enabled.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingCredential`] naming the first unset
    /// variable.
    pub fn from_env(reputation_enabled: bool) -> Result<Self, ConfigError> {
        let dist_username = require_env(ENV_DIST_USERNAME, "distribution endpoint user name")?;
        let dist_password = require_env(ENV_DIST_PASSWORD, "distribution endpoint password")?;
        let scan_api_key = if reputation_enabled {
            Some(require_env(ENV_SCAN_API_KEY, "scanning collaborator API key")?)
        } else {
            std::env::var(ENV_SCAN_API_KEY).ok()
        };
        Ok(Self {
            dist_username,
            dist_password,
            scan_api_key,
        })
    }
}

fn require_env(variable: &'static str, purpose: &'static str) -> Result<String, ConfigError> {
    match std::env::var(variable) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingCredential { variable, purpose }),
    }
}
