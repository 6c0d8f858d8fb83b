// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Client and server configuration.
//!
//! Durations are written in humantime form (`"500ms"`, `"30s"`). A negative
//! `max_retry` means the initial connection is retried forever.
//!
//! ```toml
//! endpoint = "opc.tcp://plc-01:4840"
//! session_timeout = "60s"
//! publish_pipeline_depth = 3
//!
//! [reconnect]
//! initial_delay = "500ms"
//! max_delay = "10s"
//! jitter = 0.1
//! max_retry = 2
//!
//! [subscription]
//! publishing_interval = "250ms"
//! max_keep_alive_count = 10
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use trellis_core::{BackoffConfig, ConfigurationError, MonitoringMode, UaError, UaResult};

use crate::filter::{Deadband, MonitoringFilter};
use crate::identity::IdentityToken;

// =============================================================================
// SubscriptionSettings
// =============================================================================

/// Requested subscription parameters.
///
/// The server revises these; a lifetime count below three keep-alive
/// periods is raised by the server, not rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSettings {
    /// Publishing interval.
    #[serde(default = "default_publishing_interval", with = "humantime_serde")]
    pub publishing_interval: Duration,

    /// Lifetime count.
    #[serde(default = "default_lifetime_count")]
    pub lifetime_count: u32,

    /// Max keep-alive count.
    #[serde(default = "default_keep_alive_count")]
    pub max_keep_alive_count: u32,

    /// Maximum notifications per publish, 0 = unbounded.
    #[serde(default)]
    pub max_notifications_per_publish: u32,

    /// Priority (higher is served first).
    #[serde(default)]
    pub priority: u8,

    /// Publishing enabled.
    #[serde(default = "default_true")]
    pub publishing_enabled: bool,
}

fn default_publishing_interval() -> Duration {
    Duration::from_millis(1000)
}

fn default_lifetime_count() -> u32 {
    60
}

fn default_keep_alive_count() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            publishing_interval: default_publishing_interval(),
            lifetime_count: default_lifetime_count(),
            max_keep_alive_count: default_keep_alive_count(),
            max_notifications_per_publish: 0,
            priority: 0,
            publishing_enabled: true,
        }
    }
}

impl SubscriptionSettings {
    /// Settings with a custom publishing interval.
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            publishing_interval: interval,
            ..Default::default()
        }
    }

    /// Sets the keep-alive and lifetime counts.
    pub fn with_counts(mut self, max_keep_alive_count: u32, lifetime_count: u32) -> Self {
        self.max_keep_alive_count = max_keep_alive_count;
        self.lifetime_count = lifetime_count;
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the per-message notification cap.
    pub fn with_max_notifications(mut self, max: u32) -> Self {
        self.max_notifications_per_publish = max;
        self
    }

    /// Checks values the server cannot repair.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.publishing_interval.is_zero() {
            return Err(ConfigurationError::invalid_value(
                "publishing_interval",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

// =============================================================================
// MonitoredItemSettings
// =============================================================================

/// Default monitored item parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredItemSettings {
    /// Sampling interval; absent samples at the publishing interval.
    #[serde(default, with = "humantime_serde::option")]
    pub sampling_interval: Option<Duration>,

    /// Queue size.
    #[serde(default = "default_queue_size")]
    pub queue_size: u32,

    /// Discard oldest on overflow.
    #[serde(default = "default_true")]
    pub discard_oldest: bool,

    /// Initial monitoring mode.
    #[serde(default)]
    pub monitoring_mode: MonitoringMode,

    /// Deadband for value items.
    #[serde(default)]
    pub deadband: Deadband,
}

fn default_queue_size() -> u32 {
    1
}

impl Default for MonitoredItemSettings {
    fn default() -> Self {
        Self {
            sampling_interval: None,
            queue_size: default_queue_size(),
            discard_oldest: true,
            monitoring_mode: MonitoringMode::Reporting,
            deadband: Deadband::None,
        }
    }
}

impl MonitoredItemSettings {
    /// Returns the filter implied by the deadband setting.
    pub fn filter(&self) -> MonitoringFilter {
        match self.deadband {
            Deadband::None => MonitoringFilter::None,
            Deadband::Absolute { value } => MonitoringFilter::absolute_deadband(value),
            Deadband::Percent { percent } => MonitoringFilter::percent_deadband(percent),
        }
    }
}

// =============================================================================
// ClientConfig
// =============================================================================

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server endpoint URL.
    pub endpoint: String,

    /// Session name sent in CreateSession.
    #[serde(default = "default_session_name")]
    pub session_name: String,

    /// Requested session timeout.
    #[serde(default = "default_session_timeout", with = "humantime_serde")]
    pub session_timeout: Duration,

    /// Timeout for individual requests.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Identity used on activation and after every reconnect.
    #[serde(default)]
    pub identity: IdentityToken,

    /// Backoff for connecting. `max_retry` applies to first contact only.
    #[serde(default)]
    pub reconnect: BackoffConfig,

    /// Number of publish requests kept outstanding.
    #[serde(default = "default_pipeline_depth")]
    pub publish_pipeline_depth: usize,

    /// Default subscription parameters.
    #[serde(default)]
    pub subscription: SubscriptionSettings,

    /// Default monitored item parameters.
    #[serde(default)]
    pub monitored_item: MonitoredItemSettings,
}

fn default_session_name() -> String {
    "trellis-client".to_string()
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_pipeline_depth() -> usize {
    3
}

impl ClientConfig {
    /// Creates a builder.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigurationError::missing_field("endpoint"));
        }
        if !self.endpoint.contains("://") {
            return Err(ConfigurationError::invalid_value(
                "endpoint",
                format!("'{}' is not a URL", self.endpoint),
            ));
        }
        if self.session_timeout.is_zero() {
            return Err(ConfigurationError::invalid_value(
                "session_timeout",
                "must be greater than zero",
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigurationError::invalid_value(
                "request_timeout",
                "must be greater than zero",
            ));
        }
        if self.publish_pipeline_depth == 0 {
            return Err(ConfigurationError::invalid_value(
                "publish_pipeline_depth",
                "must be at least 1",
            ));
        }
        self.reconnect
            .validate()
            .map_err(|reason| ConfigurationError::invalid_value("reconnect", reason))?;
        self.subscription.validate()?;
        self.monitored_item
            .filter()
            .validate()
            .map_err(|reason| ConfigurationError::invalid_value("monitored_item.deadband", reason))?;
        Ok(())
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    endpoint: Option<String>,
    session_name: Option<String>,
    session_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
    identity: Option<IdentityToken>,
    reconnect: Option<BackoffConfig>,
    publish_pipeline_depth: Option<usize>,
    subscription: Option<SubscriptionSettings>,
    monitored_item: Option<MonitoredItemSettings>,
}

impl ClientConfigBuilder {
    /// Sets the endpoint URL.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Sets the session name.
    pub fn session_name(mut self, name: impl Into<String>) -> Self {
        self.session_name = Some(name.into());
        self
    }

    /// Sets the requested session timeout.
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Sets the request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Sets the identity.
    pub fn identity(mut self, identity: IdentityToken) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Sets the reconnect backoff.
    pub fn reconnect(mut self, reconnect: BackoffConfig) -> Self {
        self.reconnect = Some(reconnect);
        self
    }

    /// Sets the publish pipeline depth.
    pub fn publish_pipeline_depth(mut self, depth: usize) -> Self {
        self.publish_pipeline_depth = Some(depth);
        self
    }

    /// Sets the default subscription settings.
    pub fn subscription(mut self, settings: SubscriptionSettings) -> Self {
        self.subscription = Some(settings);
        self
    }

    /// Sets the default monitored item settings.
    pub fn monitored_item(mut self, settings: MonitoredItemSettings) -> Self {
        self.monitored_item = Some(settings);
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> Result<ClientConfig, ConfigurationError> {
        let config = ClientConfig {
            endpoint: self
                .endpoint
                .ok_or_else(|| ConfigurationError::missing_field("endpoint"))?,
            session_name: self.session_name.unwrap_or_else(default_session_name),
            session_timeout: self.session_timeout.unwrap_or_else(default_session_timeout),
            request_timeout: self.request_timeout.unwrap_or_else(default_request_timeout),
            identity: self.identity.unwrap_or_default(),
            reconnect: self.reconnect.unwrap_or_default(),
            publish_pipeline_depth: self
                .publish_pipeline_depth
                .unwrap_or_else(default_pipeline_depth),
            subscription: self.subscription.unwrap_or_default(),
            monitored_item: self.monitored_item.unwrap_or_default(),
        };
        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// ServerConfig
// =============================================================================

/// Limits the server enforces and revises requests against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerLimits {
    /// Fastest publishing interval granted.
    #[serde(with = "humantime_serde")]
    pub min_publishing_interval: Duration,
    /// Slowest publishing interval granted.
    #[serde(with = "humantime_serde")]
    pub max_publishing_interval: Duration,
    /// Keep-alive count used when 0 is requested.
    pub default_keep_alive_count: u32,
    /// Largest keep-alive count granted.
    pub max_keep_alive_count: u32,
    /// Largest lifetime count granted.
    pub max_lifetime_count: u32,
    /// Cap on notifications per message, 0 = unbounded.
    pub max_notifications_per_publish: u32,
    /// Subscriptions per session.
    pub max_subscriptions_per_session: usize,
    /// Concurrent sessions.
    pub max_sessions: usize,
    /// Entries per batch call.
    pub max_operations_per_call: usize,
    /// Monitored items per subscription.
    pub max_monitored_items_per_subscription: usize,
    /// Fastest sampling interval granted.
    #[serde(with = "humantime_serde")]
    pub min_sampling_interval: Duration,
    /// Largest queue granted.
    pub max_queue_size: u32,
    /// Publish requests parked per session.
    pub max_pending_publish_requests: usize,
    /// Unacknowledged messages kept per session for republish.
    pub max_retransmission_queue: usize,
    /// Notification messages buffered per subscription while late.
    pub max_queued_messages: usize,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            min_publishing_interval: Duration::from_millis(10),
            max_publishing_interval: Duration::from_secs(3600),
            default_keep_alive_count: 10,
            max_keep_alive_count: 30_000,
            max_lifetime_count: 90_000,
            max_notifications_per_publish: 0,
            max_subscriptions_per_session: 100,
            max_sessions: 100,
            max_operations_per_call: 1_000,
            max_monitored_items_per_subscription: 10_000,
            min_sampling_interval: Duration::ZERO,
            max_queue_size: 1_000,
            max_pending_publish_requests: 20,
            max_retransmission_queue: 100,
            max_queued_messages: 100,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Enforced limits.
    pub limits: ServerLimits,
    /// Whether TransferSubscriptions is offered.
    pub enable_transfer: bool,
    /// Shortest session timeout granted.
    #[serde(with = "humantime_serde")]
    pub min_session_timeout: Duration,
    /// Longest session timeout granted.
    #[serde(with = "humantime_serde")]
    pub max_session_timeout: Duration,
    /// Upper bound on how long the runtime sleeps between ticks.
    #[serde(with = "humantime_serde")]
    pub max_tick_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            limits: ServerLimits::default(),
            enable_transfer: true,
            min_session_timeout: Duration::from_secs(1),
            max_session_timeout: Duration::from_secs(3600),
            max_tick_interval: Duration::from_secs(1),
        }
    }
}

impl ServerConfig {
    /// Replaces the limits.
    pub fn with_limits(mut self, limits: ServerLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Enables or disables TransferSubscriptions.
    pub fn with_transfer(mut self, enabled: bool) -> Self {
        self.enable_transfer = enabled;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let l = &self.limits;
        if l.min_publishing_interval.is_zero() {
            return Err(ConfigurationError::invalid_value(
                "limits.min_publishing_interval",
                "must be greater than zero",
            ));
        }
        if l.max_publishing_interval < l.min_publishing_interval {
            return Err(ConfigurationError::invalid_value(
                "limits.max_publishing_interval",
                "must not be smaller than min_publishing_interval",
            ));
        }
        if l.default_keep_alive_count == 0 || l.default_keep_alive_count > l.max_keep_alive_count {
            return Err(ConfigurationError::invalid_value(
                "limits.default_keep_alive_count",
                "must be within 1..=max_keep_alive_count",
            ));
        }
        if u64::from(l.max_lifetime_count) < 3 * u64::from(l.max_keep_alive_count) {
            return Err(ConfigurationError::invalid_value(
                "limits.max_lifetime_count",
                "must be at least three times max_keep_alive_count",
            ));
        }
        if l.max_queue_size == 0 || l.max_pending_publish_requests == 0 {
            return Err(ConfigurationError::invalid_value(
                "limits",
                "queue and publish request limits must be at least 1",
            ));
        }
        if self.max_session_timeout < self.min_session_timeout {
            return Err(ConfigurationError::invalid_value(
                "max_session_timeout",
                "must not be smaller than min_session_timeout",
            ));
        }
        if self.max_tick_interval.is_zero() {
            return Err(ConfigurationError::invalid_value(
                "max_tick_interval",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Loading
// =============================================================================

/// Loads and validates a client configuration from a TOML or JSON file.
pub fn load_client_config(path: impl AsRef<Path>) -> UaResult<ClientConfig> {
    let config: ClientConfig = load_file(path.as_ref())?;
    config.validate()?;
    Ok(config)
}

/// Loads and validates a server configuration from a TOML or JSON file.
pub fn load_server_config(path: impl AsRef<Path>) -> UaResult<ServerConfig> {
    let config: ServerConfig = load_file(path.as_ref())?;
    config.validate()?;
    Ok(config)
}

fn load_file<T: DeserializeOwned>(path: &Path) -> UaResult<T> {
    let path_str = path.display().to_string();
    let content = fs::read_to_string(path).map_err(|source| ConfigurationError::Io {
        path: path_str.clone(),
        source,
    })?;

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase());

    let parsed = match ext.as_deref() {
        Some("toml") => {
            toml::from_str(&content).map_err(|e| ConfigurationError::parse(&path_str, e.to_string()))
        }
        Some("json") => serde_json::from_str(&content)
            .map_err(|e| ConfigurationError::parse(&path_str, e.to_string())),
        other => Err(ConfigurationError::parse(
            &path_str,
            format!("unsupported format '{}'", other.unwrap_or("(no extension)")),
        )),
    };

    tracing::debug!(path = %path_str, ok = parsed.is_ok(), "Loaded configuration file");
    parsed.map_err(UaError::from)
}

// =============================================================================
// humantime_serde helper
// =============================================================================

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        humantime::format_duration(*duration)
            .to_string()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            duration
                .map(|d| humantime::format_duration(d).to_string())
                .serialize(serializer)
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use trellis_core::RetryLimit;

    #[test]
    fn test_builder_defaults() {
        let config = ClientConfig::builder()
            .endpoint("opc.tcp://localhost:4840")
            .build()
            .unwrap();
        assert_eq!(config.publish_pipeline_depth, 3);
        assert_eq!(config.session_timeout, Duration::from_secs(60));
        assert_eq!(config.identity, IdentityToken::Anonymous);
    }

    #[test]
    fn test_builder_rejects_bad_values() {
        assert!(ClientConfig::builder().build().is_err());
        assert!(ClientConfig::builder().endpoint("localhost").build().is_err());
        assert!(ClientConfig::builder()
            .endpoint("opc.tcp://localhost:4840")
            .publish_pipeline_depth(0)
            .build()
            .is_err());
        assert!(ClientConfig::builder()
            .endpoint("opc.tcp://localhost:4840")
            .monitored_item(MonitoredItemSettings {
                deadband: Deadband::Percent { percent: 250.0 },
                ..Default::default()
            })
            .build()
            .is_err());
    }

    #[test]
    fn test_low_lifetime_is_not_a_client_error() {
        let settings = SubscriptionSettings::default().with_counts(10, 5);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_server_config_validation() {
        assert!(ServerConfig::default().validate().is_ok());
        let bad = ServerConfig::default().with_limits(ServerLimits {
            max_keep_alive_count: 100,
            max_lifetime_count: 200,
            ..Default::default()
        });
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_load_client_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
endpoint = "opc.tcp://plc-01:4840"
session_timeout = "30s"
publish_pipeline_depth = 5

[identity]
type = "user_name"
user_name = "operator"
password = "secret"

[reconnect]
initial_delay = "200ms"
max_delay = "5s"
max_retry = -1

[subscription]
publishing_interval = "250ms"
max_keep_alive_count = 4

[monitored_item]
sampling_interval = "100ms"
queue_size = 10

[monitored_item.deadband]
type = "absolute"
value = 0.5
"#
        )
        .unwrap();

        let config = load_client_config(file.path()).unwrap();
        assert_eq!(config.endpoint, "opc.tcp://plc-01:4840");
        assert_eq!(config.session_timeout, Duration::from_secs(30));
        assert_eq!(config.publish_pipeline_depth, 5);
        assert_eq!(config.reconnect.max_retry, RetryLimit::Unbounded);
        assert_eq!(config.subscription.publishing_interval, Duration::from_millis(250));
        assert_eq!(
            config.monitored_item.sampling_interval,
            Some(Duration::from_millis(100))
        );
        assert_eq!(config.monitored_item.deadband, Deadband::Absolute { value: 0.5 });
        assert!(matches!(config.identity, IdentityToken::UserName { .. }));
    }

    #[test]
    fn test_load_server_json() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{ "enable_transfer": false, "limits": {{ "max_pending_publish_requests": 4 }} }}"#
        )
        .unwrap();
        let config = load_server_config(file.path()).unwrap();
        assert!(!config.enable_transfer);
        assert_eq!(config.limits.max_pending_publish_requests, 4);
        assert_eq!(config.limits.default_keep_alive_count, 10);
    }

    #[test]
    fn test_load_unknown_extension() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        assert!(load_client_config(file.path()).is_err());
    }
}
