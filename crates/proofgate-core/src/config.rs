//! Configuration parsing.
//!
//! A single TOML file carries the identity the gate enforces, the precheck
//! allow-lists, receipt validation settings, and the source block stamped
//! into every sealed manifest. Unknown keys are rejected.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Duration;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::crypto::ReceiptMac;
use crate::receipt::{
    ConsumeError, ConsumeIndex, DEFAULT_STALENESS_WINDOW_SECS, FileBackedConsumeIndex,
    InMemoryConsumeIndex, ReceiptValidator,
};

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProofgateConfig {
    /// Identity the gate enforces.
    pub identity: IdentityConfig,

    /// Gate precheck settings.
    #[serde(default)]
    pub gate: GateConfig,

    /// Receipt validation settings.
    #[serde(default)]
    pub receipts: ReceiptConfig,

    /// Provenance recorded in run manifests.
    #[serde(default)]
    pub source: SourceConfig,
}

impl ProofgateConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid, contains unknown keys, or
    /// fails [`validate`](Self::validate).
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks values serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] for empty identity fields, a
    /// non-positive staleness window, or a half-configured MAC.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity.tenant_id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "identity.tenant_id must not be empty".to_string(),
            ));
        }
        if self.identity.actor_id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "identity.actor_id must not be empty".to_string(),
            ));
        }
        if self.receipts.staleness_window_secs <= 0 {
            return Err(ConfigError::Validation(format!(
                "receipts.staleness_window_secs must be positive, got {}",
                self.receipts.staleness_window_secs
            )));
        }
        if self.receipts.mac_key_id.is_some() != self.receipts.mac_secret_env.is_some() {
            return Err(ConfigError::Validation(
                "receipts.mac_key_id and receipts.mac_secret_env must be set together"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Identity the gate enforces on every packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityConfig {
    /// Tenant every packet must belong to.
    pub tenant_id: String,
    /// Actor every packet must come from.
    pub actor_id: String,
}

/// Gate precheck configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GateConfig {
    /// Destinations a packet may target. Empty denies everything.
    #[serde(default)]
    pub allowed_destinations: Vec<String>,

    /// Payload kinds (file extensions, without the dot) a payload reference
    /// may name. Empty denies everything.
    #[serde(default)]
    pub allowed_payload_kinds: Vec<String>,

    /// Whether the optional execution stage runs.
    #[serde(default)]
    pub execution_enabled: bool,
}

/// Receipt validation configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReceiptConfig {
    /// Receipts issued longer ago than this are refused.
    #[serde(default = "default_staleness_window_secs")]
    pub staleness_window_secs: i64,

    /// Durable consume log. In-memory consumption when unset.
    #[serde(default)]
    pub consume_log: Option<PathBuf>,

    /// Key id of the shared receipt MAC secret.
    #[serde(default)]
    pub mac_key_id: Option<String>,

    /// Environment variable holding the shared receipt MAC secret.
    #[serde(default)]
    pub mac_secret_env: Option<String>,
}

impl Default for ReceiptConfig {
    fn default() -> Self {
        Self {
            staleness_window_secs: default_staleness_window_secs(),
            consume_log: None,
            mac_key_id: None,
            mac_secret_env: None,
        }
    }
}

impl ReceiptConfig {
    /// Staleness window as a duration.
    #[must_use]
    pub fn staleness_window(&self) -> Duration {
        Duration::seconds(self.staleness_window_secs)
    }

    /// Loads the receipt MAC from the configured environment variable.
    ///
    /// Returns `Ok(None)` when no MAC is configured.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if the variable is unset or the
    /// secret is rejected.
    pub fn receipt_mac(&self) -> Result<Option<ReceiptMac>, ConfigError> {
        let (Some(key_id), Some(var)) = (&self.mac_key_id, &self.mac_secret_env) else {
            return Ok(None);
        };
        let secret = std::env::var(var).map_err(|_| {
            ConfigError::Validation(format!("receipt MAC secret variable {var} is not set"))
        })?;
        ReceiptMac::new(key_id.clone(), SecretString::from(secret))
            .map(Some)
            .map_err(|e| ConfigError::Validation(e.to_string()))
    }

    /// Builds the receipt validator these settings describe: the configured
    /// MAC, the durable consume log when one is configured, and the
    /// staleness window.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if no MAC is configured or it
    /// cannot be loaded, and [`ConfigError::ConsumeLog`] if the log cannot
    /// be opened.
    pub fn validator(&self) -> Result<ReceiptValidator, ConfigError> {
        let mac = self.receipt_mac()?.ok_or_else(|| {
            ConfigError::Validation(
                "receipt validation requires receipts.mac_key_id and receipts.mac_secret_env"
                    .to_string(),
            )
        })?;
        self.validator_with(mac)
    }

    /// Like [`validator`](Self::validator), with the MAC supplied by the
    /// caller instead of the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ConsumeLog`] if the log cannot be opened.
    pub fn validator_with(&self, mac: ReceiptMac) -> Result<ReceiptValidator, ConfigError> {
        let index: Arc<dyn ConsumeIndex> = match &self.consume_log {
            Some(path) => Arc::new(FileBackedConsumeIndex::open(path)?),
            None => Arc::new(InMemoryConsumeIndex::new()),
        };
        Ok(ReceiptValidator::new(index, Arc::new(mac))
            .with_staleness_window(self.staleness_window()))
    }
}

const fn default_staleness_window_secs() -> i64 {
    DEFAULT_STALENESS_WINDOW_SECS
}

/// Provenance block written into each manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// Host the pack was sealed on.
    #[serde(default = "default_host")]
    pub host: String,
    /// Service name.
    #[serde(default = "default_service")]
    pub service: String,
    /// Service version.
    #[serde(default = "default_service_version")]
    pub service_version: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            service: default_service(),
            service_version: default_service_version(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_service() -> String {
    "proofgate".to_string()
}

fn default_service_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),

    /// The configured consume log could not be opened.
    #[error("failed to open consume log: {0}")]
    ConsumeLog(#[from] ConsumeError),
}
