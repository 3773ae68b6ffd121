//! Client configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Coordinator endpoints used when none are configured
pub const DEFAULT_ENDPOINTS: [&str; 2] = [
    "wss://proxy.wynd.network:4650",
    "wss://proxy.wynd.network:4444",
];

/// Namespace from which per-address browser ids are derived
pub const DEFAULT_NAMESPACE: Uuid = Uuid::from_u128(0xbfeb71b6_06b8_5e07_87b2_c461c20d9ff6);

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/108.0.0.0 Safari/537.36";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("at least one identity must be configured")]
    NoIdentities,

    #[error("at least one coordinator endpoint must be configured")]
    NoEndpoints,

    #[error("invalid coordinator endpoint '{0}': expected ws:// or wss:// URL")]
    InvalidEndpoint(String),

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Identities on whose behalf connections are made
    pub identities: Vec<String>,
    /// Coordinator endpoints, rotated by the retry counter
    pub endpoints: Vec<String>,
    pub namespace: Uuid,
    pub user_agent: String,
    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,
    /// Silence after which a connection is considered dead
    #[serde(with = "duration_secs")]
    pub stale_threshold: Duration,
    #[serde(with = "duration_secs")]
    pub session_lifetime: Duration,
    /// Delay between two connection starts
    #[serde(with = "duration_secs")]
    pub start_delay: Duration,
    #[serde(with = "duration_secs")]
    pub relay_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub summary_interval: Duration,
    /// Use at most this many local addresses (`None` or 0 = all)
    pub address_limit: Option<usize>,
    /// PEM bundle of trusted coordinator roots
    pub ca_bundle: Option<PathBuf>,
    /// Skip coordinator certificate verification
    pub insecure: bool,
}

/// Helper module for serializing Duration as seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            identities: Vec::new(),
            endpoints: DEFAULT_ENDPOINTS.iter().map(|e| e.to_string()).collect(),
            namespace: DEFAULT_NAMESPACE,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            keepalive_interval: Duration::from_secs(20),
            stale_threshold: Duration::from_secs(29),
            session_lifetime: Duration::from_secs(24 * 60 * 60),
            start_delay: Duration::from_secs(3),
            relay_timeout: Duration::from_secs(60),
            summary_interval: Duration::from_secs(60),
            address_limit: None,
            ca_bundle: None,
            insecure: false,
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Load a YAML config file; missing fields take their defaults
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Effective address cap; 0 means unlimited
    pub fn effective_address_limit(&self) -> Option<usize> {
        self.address_limit.filter(|limit| *limit > 0)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identities.is_empty() {
            return Err(ConfigError::NoIdentities);
        }
        if self.endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }
        for endpoint in &self.endpoints {
            let valid = url::Url::parse(endpoint)
                .map(|url| matches!(url.scheme(), "ws" | "wss") && url.host_str().is_some())
                .unwrap_or(false);
            if !valid {
                return Err(ConfigError::InvalidEndpoint(endpoint.clone()));
            }
        }
        for (name, value) in [
            ("keepalive_interval", self.keepalive_interval),
            ("stale_threshold", self.stale_threshold),
            ("session_lifetime", self.session_lifetime),
            ("summary_interval", self.summary_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        Ok(())
    }
}

/// Builder for ClientConfig
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.config.identities.push(identity.into());
        self
    }

    pub fn identities<I, S>(mut self, identities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config
            .identities
            .extend(identities.into_iter().map(Into::into));
        self
    }

    /// Replace the default endpoints
    pub fn endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.endpoints = endpoints.into_iter().map(Into::into).collect();
        self
    }

    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.keepalive_interval = interval;
        self
    }

    pub fn stale_threshold(mut self, threshold: Duration) -> Self {
        self.config.stale_threshold = threshold;
        self
    }

    pub fn session_lifetime(mut self, lifetime: Duration) -> Self {
        self.config.session_lifetime = lifetime;
        self
    }

    pub fn start_delay(mut self, delay: Duration) -> Self {
        self.config.start_delay = delay;
        self
    }

    pub fn relay_timeout(mut self, timeout: Duration) -> Self {
        self.config.relay_timeout = timeout;
        self
    }

    pub fn address_limit(mut self, limit: Option<usize>) -> Self {
        self.config.address_limit = limit;
        self
    }

    pub fn ca_bundle(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ca_bundle = Some(path.into());
        self
    }

    pub fn insecure(mut self, insecure: bool) -> Self {
        self.config.insecure = insecure;
        self
    }

    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
