use crate::controller::{EntityKind, TrackedEntity};
use crate::error::Error;
use crate::heartbeat::HeartbeatStrategy;
use std::time::Duration;
use url::Url;

/// Configuration for the sync controller
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Where each channel family lives
    pub endpoints: EndpointConfig,
    /// Settings for per-entity (book pipeline) connections
    pub dedicated: ChannelConfig,
    /// Settings for the shared translation-job connection
    pub multiplexed: ChannelConfig,
    /// Timeout for establishing a single connection
    pub connect_timeout: Duration,
    /// Capacity of the broadcast channel carrying [`SyncEvent`](crate::SyncEvent)s
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoints: EndpointConfig::default(),
            dedicated: ChannelConfig::dedicated(),
            multiplexed: ChannelConfig::multiplexed(),
            connect_timeout: Duration::from_secs(10),
            event_capacity: 256,
        }
    }
}

impl SyncConfig {
    /// Create a new builder for configuration
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::default()
    }
}

/// Builder for SyncConfig
#[derive(Debug, Clone, Default)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
    base_url: Option<String>,
}

impl SyncConfigBuilder {
    /// Set the server base URL (`ws://` or `wss://`)
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Set the path of the shared translation-job channel
    pub fn translation_path(mut self, path: impl Into<String>) -> Self {
        self.config.endpoints.translation_path = path.into();
        self
    }

    /// Set the path prefix of first-generation book pipeline channels
    pub fn book_v1_path(mut self, path: impl Into<String>) -> Self {
        self.config.endpoints.book_v1_path = path.into();
        self
    }

    /// Set the path prefix of second-generation book pipeline channels
    pub fn book_v2_path(mut self, path: impl Into<String>) -> Self {
        self.config.endpoints.book_v2_path = path.into();
        self
    }

    /// Set dedicated channel configuration
    pub fn dedicated(mut self, config: ChannelConfig) -> Self {
        self.config.dedicated = config;
        self
    }

    /// Set multiplexed channel configuration
    pub fn multiplexed(mut self, config: ChannelConfig) -> Self {
        self.config.multiplexed = config;
        self
    }

    /// Set the connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the event broadcast capacity
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    /// Build the configuration with validation.
    pub fn build(mut self) -> Result<SyncConfig, ConfigError> {
        let raw = self
            .base_url
            .take()
            .unwrap_or_else(|| self.config.endpoints.base_url.clone());
        self.config.endpoints.base_url = parse_base_url(&raw)?.to_string();

        for (name, channel) in [
            ("dedicated", &self.config.dedicated),
            ("multiplexed", &self.config.multiplexed),
        ] {
            channel.reconnect.validate(name)?;
            channel.heartbeat.validate(name)?;
        }

        if self.config.connect_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "connect_timeout must be > 0".to_string(),
            ));
        }

        if self.config.event_capacity == 0 {
            return Err(ConfigError::InvalidCapacity(
                "event_capacity cannot be 0".to_string(),
            ));
        }

        Ok(self.config)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Invalid reconnect configuration
    #[error("Invalid reconnect configuration: {0}")]
    InvalidBackoff(String),
    /// Invalid heartbeat configuration
    #[error("Invalid heartbeat configuration: {0}")]
    InvalidHeartbeat(String),
    /// Invalid endpoint
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
    /// Invalid timeout
    #[error("Invalid timeout: {0}")]
    InvalidTimeout(String),
    /// Invalid channel capacity
    #[error("Invalid capacity: {0}")]
    InvalidCapacity(String),
}

/// Per-channel-family settings: how to reconnect and how to keep alive.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Backoff settings for reconnection
    pub reconnect: ReconnectConfig,
    /// Keep-alive behavior while open
    pub heartbeat: HeartbeatStrategy,
}

impl ChannelConfig {
    /// Defaults for per-entity book pipeline channels: capped exponential
    /// backoff with an attempt limit, client `"ping"` every 30s.
    pub fn dedicated() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatStrategy::default(),
        }
    }

    /// Defaults for the shared translation channel: flat 3s retries with no
    /// attempt limit, no client pings.
    pub fn multiplexed() -> Self {
        Self {
            reconnect: ReconnectConfig::flat(Duration::from_secs(3)),
            heartbeat: HeartbeatStrategy::Disabled,
        }
    }
}

/// Backoff configuration for reconnection
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt
    pub base_delay: Duration,
    /// Maximum delay between reconnection attempts
    pub max_delay: Duration,
    /// Multiplier applied per attempt
    pub decay_factor: f64,
    /// Attempts before giving up and reporting fallback (`None` retries forever)
    pub max_attempts: Option<u32>,
    /// Whether to add random jitter to delays
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(3000),
            max_delay: Duration::from_secs(30),
            decay_factor: 1.5,
            max_attempts: Some(10),
            jitter: false,
        }
    }
}

impl ReconnectConfig {
    /// Constant delay, unlimited attempts.
    pub fn flat(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            decay_factor: 1.0,
            max_attempts: None,
            jitter: false,
        }
    }

    fn validate(&self, channel: &str) -> Result<(), ConfigError> {
        if self.base_delay.is_zero() {
            return Err(ConfigError::InvalidBackoff(format!(
                "{channel}: base_delay must be > 0"
            )));
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::InvalidBackoff(format!(
                "{channel}: max_delay must be >= base_delay"
            )));
        }
        if self.decay_factor.is_nan() || self.decay_factor < 1.0 {
            return Err(ConfigError::InvalidBackoff(format!(
                "{channel}: decay_factor must be >= 1.0"
            )));
        }
        Ok(())
    }
}

const DEFAULT_BASE_URL: &str = "ws://localhost:8000/";

/// Server endpoints for each channel family.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Base URL (`ws://` or `wss://`), normalized to end with `/`
    pub base_url: String,
    /// Path of the shared translation-job channel
    pub translation_path: String,
    /// Path prefix of first-generation book pipeline channels
    pub book_v1_path: String,
    /// Path prefix of second-generation book pipeline channels
    pub book_v2_path: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            translation_path: "ws/translations".to_string(),
            book_v1_path: "ws/books".to_string(),
            book_v2_path: "ws/v2/books".to_string(),
        }
    }
}

impl EndpointConfig {
    /// URL of the shared translation-job channel
    pub fn multiplexed_url(&self) -> Result<Url, Error> {
        self.base()?
            .join(self.translation_path.trim_start_matches('/'))
            .map_err(|e| Error::InvalidUrl(format!("{}: {}", self.translation_path, e)))
    }

    /// URL of the dedicated channel for `entity`, with the entity ID as the
    /// final (percent-encoded) path segment.
    ///
    /// Translation jobs have no dedicated channel and resolve to the
    /// multiplexed URL.
    pub fn url_for(&self, entity: &TrackedEntity) -> Result<Url, Error> {
        let prefix = match entity.kind {
            EntityKind::TranslationJob => return self.multiplexed_url(),
            EntityKind::BookPipelineV1 => &self.book_v1_path,
            EntityKind::BookPipelineV2 => &self.book_v2_path,
        };

        let mut url = self
            .base()?
            .join(prefix.trim_start_matches('/'))
            .map_err(|e| Error::InvalidUrl(format!("{}: {}", prefix, e)))?;
        url.path_segments_mut()
            .map_err(|_| Error::InvalidUrl(format!("{} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .push(&entity.id);
        Ok(url)
    }

    fn base(&self) -> Result<Url, Error> {
        parse_base_url(&self.base_url).map_err(|e| Error::InvalidUrl(e.to_string()))
    }
}

fn parse_base_url(raw: &str) -> Result<Url, ConfigError> {
    let mut url = Url::parse(raw).map_err(|e| ConfigError::InvalidEndpoint(format!("{raw}: {e}")))?;
    if url.scheme() != "ws" && url.scheme() != "wss" {
        return Err(ConfigError::InvalidEndpoint(format!(
            "{raw}: scheme must be ws or wss"
        )));
    }
    if url.cannot_be_a_base() {
        return Err(ConfigError::InvalidEndpoint(format!(
            "{raw}: cannot be a base URL"
        )));
    }
    // Relative joins replace the last segment unless the path ends with '/'
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}
