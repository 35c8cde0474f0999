// Configuration module - loads the list of XenServer targets
//
// This module is responsible for:
// 1. Reading the YAML configuration file from disk
// 2. Parsing it into strongly-typed host targets
// 3. Validating the targets before any collector is built
//
// The configuration is loaded once at startup and treated as immutable
// afterwards; collectors receive it behind an Arc.

use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not unmarshal config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid settings format: {0}")]
    InvalidSettings(String),

    #[error("Missing required setting: {0}")]
    MissingRequiredSetting(String),
}

/// Main configuration structure loaded from the YAML file
///
/// # Example
/// ```yaml
/// xenhosts:
///   - xenhost: 10.0.0.10
///     credentials:
///       username: root
///       password: secret
///   - xenhost: https://xen2.example.org
///     credentials:
///       username: monitor
///       password: hunter2
/// rpc_timeout_secs: 10
/// accept_invalid_certs: true
/// session:
///   revalidate: false
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ExporterConfig {
    /// Hypervisor targets, scraped in this order
    #[serde(default)]
    pub xenhosts: Vec<HostConfig>,

    /// Per-request timeout for every XenAPI call
    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,

    /// Accept self-signed certificates (the XenServer default install)
    #[serde(default)]
    pub accept_invalid_certs: bool,

    #[serde(default)]
    pub session: SessionSettings,
}

/// One hypervisor target
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct HostConfig {
    /// Address of the host's management API, with or without scheme
    #[serde(alias = "host")]
    pub xenhost: String,

    pub credentials: Credentials,
}

#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// How cached sessions are treated between scrapes
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionSettings {
    /// Probe a cached session before reusing it and log in again if the
    /// probe fails. Off by default: sessions live for the process lifetime.
    #[serde(default)]
    pub revalidate: bool,
}

fn default_rpc_timeout_secs() -> u64 {
    10
}

impl HostConfig {
    #[cfg(test)]
    pub fn new(xenhost: &str, username: &str, password: &str) -> Self {
        HostConfig {
            xenhost: xenhost.to_string(),
            credentials: Credentials {
                username: username.to_string(),
                password: password.to_string(),
            },
        }
    }

    /// Address used as the session cache key
    pub fn host(&self) -> &str {
        &self.xenhost
    }

    pub fn username(&self) -> &str {
        &self.credentials.username
    }

    pub fn password(&self) -> &str {
        &self.credentials.password
    }

    /// Base URL of the management API
    ///
    /// A bare address such as `10.0.0.10` is reached over HTTPS.
    pub fn base_url(&self) -> String {
        let host = self.xenhost.trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("https://{}", host)
        }
    }
}

// The password must never reach logs, so Debug is written by hand.
impl fmt::Debug for HostConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostConfig")
            .field("xenhost", &self.xenhost)
            .field("credentials", &self.credentials)
            .finish()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"****")
            .finish()
    }
}

impl ExporterConfig {
    /// Reads and validates the configuration file
    ///
    /// # Arguments
    /// * `path` - Location of the YAML file (the `--config.file` flag)
    ///
    /// # Returns
    /// * `Ok(ExporterConfig)` - Parsed and validated configuration
    /// * `Err(ConfigError)` - File missing, malformed or semantically invalid
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let config = Self::from_yaml(&source)?;

        for host in &config.xenhosts {
            info!("  {} - user '{}'", host.xenhost, host.credentials.username);
        }

        Ok(config)
    }

    /// Parses and validates configuration text
    pub fn from_yaml(source: &str) -> Result<Self, ConfigError> {
        let config: ExporterConfig = serde_yaml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.xenhosts.is_empty() {
            return Err(ConfigError::MissingRequiredSetting("xenhosts".to_string()));
        }

        let mut seen = HashSet::new();
        for (idx, host) in self.xenhosts.iter().enumerate() {
            if host.xenhost.trim().is_empty() {
                return Err(ConfigError::MissingRequiredSetting(format!(
                    "xenhosts[{}].xenhost",
                    idx
                )));
            }
            if host.credentials.username.is_empty() {
                return Err(ConfigError::MissingRequiredSetting(format!(
                    "xenhosts[{}].credentials.username",
                    idx
                )));
            }
            if !seen.insert(host.xenhost.as_str()) {
                return Err(ConfigError::InvalidSettings(format!(
                    "duplicate xenhost '{}'",
                    host.xenhost
                )));
            }
        }

        if self.rpc_timeout_secs == 0 {
            return Err(ConfigError::InvalidSettings(
                "rpc_timeout_secs must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }
}
