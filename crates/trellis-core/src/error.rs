// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Error types for the trellis runtime.
//!
//! Protocol-level rejections are [`StatusCode`] values and live inside
//! results. This module covers everything else: transport failures,
//! session and subscription lifecycle problems, rejected service calls,
//! configuration mistakes and timeouts.
//!
//! # Error Categories
//!
//! ```text
//! UaError
//! ├── Transport     - Channel failures (always recoverable)
//! ├── Session       - Session lifecycle errors
//! ├── Subscription  - Subscription lifecycle errors
//! ├── Service       - Whole-call rejections carrying a StatusCode
//! ├── Configuration - Invalid settings, raised before any request is sent
//! └── Timeout       - Request and connect deadlines
//! ```
//!
//! # Disposition
//!
//! Every error answers [`UaError::disposition`], which lets an application
//! tell apart the three outcomes it must react to differently:
//!
//! | Disposition | Meaning                                  |
//! |-------------|------------------------------------------|
//! | `Terminal`  | gone, will not come back                 |
//! | `Transient` | the runtime is recovering, data resumes  |
//! | `Local`     | this particular argument was rejected    |
//!
//! # Examples
//!
//! ```
//! use trellis_core::error::{UaError, TransportError, Disposition};
//!
//! let error = UaError::from(TransportError::connection_reset("opc.tcp://plc:4840"));
//! assert!(error.is_retryable());
//! assert_eq!(error.disposition(), Disposition::Transient);
//! ```

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;
use tracing::Level;

use crate::status::StatusCode;

// =============================================================================
// UaError - Main Error Type
// =============================================================================

/// The main error type for the runtime.
#[derive(Debug, Error)]
pub enum UaError {
    /// Transport failures.
    #[error("{0}")]
    Transport(#[from] TransportError),

    /// Session lifecycle errors.
    #[error("{0}")]
    Session(#[from] SessionError),

    /// Subscription lifecycle errors.
    #[error("{0}")]
    Subscription(#[from] SubscriptionError),

    /// A service call rejected as a whole.
    #[error("{0}")]
    Service(#[from] ServiceError),

    /// Configuration errors.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// Timeout errors.
    #[error("{0}")]
    Timeout(#[from] TimeoutError),
}

/// Result alias used throughout the runtime.
pub type UaResult<T> = Result<T, UaError>;

impl UaError {
    // =========================================================================
    // Convenience Factory Methods
    // =========================================================================

    /// Creates a not connected error.
    pub fn not_connected() -> Self {
        Self::Transport(TransportError::NotConnected)
    }

    /// Creates a service fault for the given service.
    pub fn service_fault(service: &'static str, status: StatusCode) -> Self {
        Self::Service(ServiceError::fault(service, status))
    }

    /// Creates an invalid configuration value error.
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration(ConfigurationError::invalid_value(field, reason))
    }

    /// Creates a request timeout error.
    pub fn request_timeout(service: &'static str, duration: Duration) -> Self {
        Self::Timeout(TimeoutError::request(service, duration))
    }

    // =========================================================================
    // Classification
    // =========================================================================

    /// Returns how the application should interpret this error.
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::Transport(e) => e.disposition(),
            Self::Session(e) => e.disposition(),
            Self::Subscription(e) => e.disposition(),
            Self::Service(e) => e.disposition(),
            Self::Configuration(_) => Disposition::Local,
            Self::Timeout(_) => Disposition::Transient,
        }
    }

    /// Returns `true` if retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_retryable(),
            Self::Session(e) => e.is_retryable(),
            Self::Subscription(_) => false,
            Self::Service(e) => e.is_retryable(),
            Self::Configuration(_) => false,
            Self::Timeout(_) => true,
        }
    }

    /// Returns the status code carried by this error, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Service(ServiceError::Fault { status, .. }) => Some(*status),
            Self::Session(e) => e.status(),
            Self::Subscription(SubscriptionError::Terminated { status, .. }) => Some(*status),
            _ => None,
        }
    }

    /// Returns the suggested delay before retrying.
    pub fn suggested_retry_delay(&self) -> Option<Duration> {
        match self {
            Self::Transport(e) => e.suggested_retry_delay(),
            Self::Session(e) => e.suggested_retry_delay(),
            Self::Service(e) if e.is_retryable() => Some(Duration::from_millis(500)),
            Self::Timeout(_) => Some(Duration::from_millis(100)),
            _ => None,
        }
    }

    /// Returns the severity level of this error.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Transport(e) => e.severity(),
            Self::Session(e) => e.severity(),
            Self::Subscription(e) => e.severity(),
            Self::Service(_) => ErrorSeverity::Warning,
            Self::Configuration(_) => ErrorSeverity::Critical,
            Self::Timeout(_) => ErrorSeverity::Warning,
        }
    }

    /// Returns the error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Session(_) => "session",
            Self::Subscription(_) => "subscription",
            Self::Service(_) => "service",
            Self::Configuration(_) => "configuration",
            Self::Timeout(_) => "timeout",
        }
    }

    /// Returns a unique error code for this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Transport(e) => e.error_code(),
            Self::Session(e) => e.error_code(),
            Self::Subscription(e) => e.error_code(),
            Self::Service(e) => e.error_code(),
            Self::Configuration(e) => e.error_code(),
            Self::Timeout(e) => e.error_code(),
        }
    }

    /// Returns recovery hints for this error.
    pub fn recovery_hints(&self) -> Vec<&'static str> {
        match self {
            Self::Transport(_) => vec![
                "The client reconnects automatically",
                "Check network connectivity to the server",
            ],
            Self::Session(e) => e.recovery_hints(),
            Self::Subscription(e) => e.recovery_hints(),
            Self::Service(_) => vec!["Inspect the returned status code"],
            Self::Configuration(_) => vec!["Fix the configuration and restart"],
            Self::Timeout(_) => vec!["Increase the request timeout", "Retry the operation"],
        }
    }

    /// Returns a user-friendly error message.
    pub fn user_message(&self) -> String {
        match self {
            Self::Transport(e) => e.user_message(),
            Self::Session(e) => e.user_message(),
            Self::Subscription(e) => e.user_message(),
            Self::Service(ServiceError::Fault { service, status }) => {
                format!("{} 요청이 거부되었습니다: {}", service, status.name())
            }
            Self::Service(ServiceError::UnexpectedResponse { service, .. }) => {
                format!("{} 요청에 대한 응답 형식이 올바르지 않습니다", service)
            }
            Self::Configuration(e) => format!("설정 오류: {}", e),
            Self::Timeout(_) => "요청 시간이 초과되었습니다".to_string(),
        }
    }

    /// Logs this error with appropriate level and context.
    pub fn log(&self, context: &str) {
        let code = self.error_code();
        match self.severity().to_tracing_level() {
            Level::ERROR => tracing::error!(
                error_code = %code,
                category = self.category(),
                disposition = %self.disposition(),
                context = context,
                "{self}"
            ),
            Level::WARN => tracing::warn!(
                error_code = %code,
                category = self.category(),
                disposition = %self.disposition(),
                context = context,
                "{self}"
            ),
            _ => tracing::debug!(
                error_code = %code,
                category = self.category(),
                disposition = %self.disposition(),
                context = context,
                "{self}"
            ),
        }
    }
}

// =============================================================================
// Disposition
// =============================================================================

/// What an error means for the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// The session or subscription is gone and will not come back.
    Terminal,
    /// The runtime is recovering; data will resume.
    Transient,
    /// This individual request argument was rejected.
    Local,
}

impl Disposition {
    /// Returns the string representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Terminal => "terminal",
            Self::Transient => "transient",
            Self::Local => "local",
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// TransportError
// =============================================================================

/// Failures of the underlying channel.
///
/// Transport errors drive the reconnection state machine. Apart from
/// [`TransportError::GaveUp`], which ends first contact, they are never
/// terminal.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer reset the connection.
    #[error("Connection reset by '{endpoint}'")]
    ConnectionReset {
        /// Target endpoint.
        endpoint: String,
    },

    /// The connection was refused.
    #[error("Connection refused by '{endpoint}'")]
    Refused {
        /// Target endpoint.
        endpoint: String,
    },

    /// The channel was closed.
    #[error("Channel closed: {reason}")]
    ChannelClosed {
        /// Reason for closure.
        reason: String,
    },

    /// No channel is currently open.
    #[error("Not connected")]
    NotConnected,

    /// I/O failure.
    #[error("I/O error: {message}")]
    Io {
        /// Error message.
        message: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// First contact failed within the configured retry budget.
    #[error("Gave up connecting to '{endpoint}' after {attempts} attempts")]
    GaveUp {
        /// Target endpoint.
        endpoint: String,
        /// Attempts made.
        attempts: u32,
    },
}

impl TransportError {
    /// Creates a connection reset error.
    pub fn connection_reset(endpoint: impl Into<String>) -> Self {
        Self::ConnectionReset {
            endpoint: endpoint.into(),
        }
    }

    /// Creates a connection refused error.
    pub fn refused(endpoint: impl Into<String>) -> Self {
        Self::Refused {
            endpoint: endpoint.into(),
        }
    }

    /// Creates a channel closed error.
    pub fn channel_closed(reason: impl Into<String>) -> Self {
        Self::ChannelClosed {
            reason: reason.into(),
        }
    }

    /// Returns the disposition of this error.
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::GaveUp { .. } => Disposition::Terminal,
            _ => Disposition::Transient,
        }
    }

    /// Returns `true` if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::GaveUp { .. })
    }

    /// Returns the suggested retry delay.
    pub fn suggested_retry_delay(&self) -> Option<Duration> {
        match self {
            Self::ConnectionReset { .. } | Self::ChannelClosed { .. } => {
                Some(Duration::from_millis(500))
            }
            Self::Refused { .. } | Self::Io { .. } => Some(Duration::from_secs(1)),
            Self::NotConnected => Some(Duration::from_millis(100)),
            Self::GaveUp { .. } => None,
        }
    }

    /// Returns the severity level.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::GaveUp { .. } => ErrorSeverity::Error,
            _ => ErrorSeverity::Warning,
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::ConnectionReset { .. } => ErrorCode::new(1, 1),
            Self::Refused { .. } => ErrorCode::new(1, 2),
            Self::ChannelClosed { .. } => ErrorCode::new(1, 3),
            Self::NotConnected => ErrorCode::new(1, 4),
            Self::Io { .. } => ErrorCode::new(1, 5),
            Self::GaveUp { .. } => ErrorCode::new(1, 6),
        }
    }

    /// Returns a user-friendly error message.
    pub fn user_message(&self) -> String {
        match self {
            Self::ConnectionReset { endpoint } => {
                format!("서버({})와의 연결이 끊어졌습니다. 재연결 중입니다", endpoint)
            }
            Self::Refused { endpoint } => {
                format!("서버({})에 연결할 수 없습니다", endpoint)
            }
            Self::ChannelClosed { .. } => "채널이 닫혔습니다. 재연결 중입니다".to_string(),
            Self::NotConnected => "서버에 연결되어 있지 않습니다".to_string(),
            Self::Io { .. } => "네트워크 오류가 발생했습니다".to_string(),
            Self::GaveUp { endpoint, attempts } => {
                format!("서버({})에 {}회 연결을 시도했으나 실패했습니다", endpoint, attempts)
            }
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::ConnectionRefused => Self::Refused {
                endpoint: "unknown".to_string(),
            },
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => {
                Self::ConnectionReset {
                    endpoint: "unknown".to_string(),
                }
            }
            _ => Self::Io {
                message: error.to_string(),
                source: error,
            },
        }
    }
}

// =============================================================================
// SessionError
// =============================================================================

/// Session lifecycle errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// CreateSession was rejected.
    #[error("Failed to create session: {status}")]
    CreationFailed {
        /// Status returned by the server.
        status: StatusCode,
    },

    /// ActivateSession was rejected.
    #[error("Session activation rejected: {status}")]
    ActivationRejected {
        /// Status returned by the server.
        status: StatusCode,
    },

    /// The server no longer knows the session; the client is recreating it.
    #[error("Session invalidated by server: {status}")]
    Invalidated {
        /// Status returned by the server.
        status: StatusCode,
    },

    /// No session exists yet.
    #[error("No active session")]
    NoSession,

    /// The client was disconnected by the application.
    #[error("Client disconnected")]
    Disconnected,
}

impl SessionError {
    /// Returns the disposition of this error.
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::Invalidated { .. } | Self::NoSession => Disposition::Transient,
            Self::ActivationRejected { .. } => Disposition::Local,
            Self::CreationFailed { .. } | Self::Disconnected => Disposition::Terminal,
        }
    }

    /// Returns `true` if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Invalidated { .. } | Self::NoSession)
    }

    /// Returns the status code carried by this error.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::CreationFailed { status }
            | Self::ActivationRejected { status }
            | Self::Invalidated { status } => Some(*status),
            _ => None,
        }
    }

    /// Returns the suggested retry delay.
    pub fn suggested_retry_delay(&self) -> Option<Duration> {
        match self {
            Self::Invalidated { .. } => Some(Duration::from_millis(500)),
            Self::NoSession => Some(Duration::from_millis(100)),
            _ => None,
        }
    }

    /// Returns the severity level.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Invalidated { .. } | Self::NoSession => ErrorSeverity::Warning,
            Self::Disconnected => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::CreationFailed { .. } => ErrorCode::new(2, 1),
            Self::ActivationRejected { .. } => ErrorCode::new(2, 2),
            Self::Invalidated { .. } => ErrorCode::new(2, 3),
            Self::NoSession => ErrorCode::new(2, 4),
            Self::Disconnected => ErrorCode::new(2, 5),
        }
    }

    /// Returns recovery hints.
    pub fn recovery_hints(&self) -> Vec<&'static str> {
        match self {
            Self::CreationFailed { .. } => vec![
                "Check the server session limits",
                "Verify the endpoint accepts new sessions",
            ],
            Self::ActivationRejected { .. } => vec![
                "Verify the identity token credentials",
                "The previous identity remains in force",
            ],
            Self::Invalidated { .. } | Self::NoSession => {
                vec!["The client recreates the session automatically"]
            }
            Self::Disconnected => vec!["Call connect() to start a new session"],
        }
    }

    /// Returns a user-friendly error message.
    pub fn user_message(&self) -> String {
        match self {
            Self::CreationFailed { .. } => "세션 생성에 실패했습니다".to_string(),
            Self::ActivationRejected { .. } => "세션 인증이 거부되었습니다".to_string(),
            Self::Invalidated { .. } => "세션이 만료되어 다시 생성하는 중입니다".to_string(),
            Self::NoSession => "활성 세션이 없습니다".to_string(),
            Self::Disconnected => "클라이언트 연결이 종료되었습니다".to_string(),
        }
    }
}

// =============================================================================
// SubscriptionError
// =============================================================================

/// Subscription lifecycle errors.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// The subscription is unknown to this client.
    #[error("Subscription not found: {subscription_id}")]
    NotFound {
        /// Subscription ID.
        subscription_id: u32,
    },

    /// The subscription was terminated by the server.
    #[error("Subscription {subscription_id} terminated: {status}")]
    Terminated {
        /// Subscription ID.
        subscription_id: u32,
        /// Terminating status.
        status: StatusCode,
    },

    /// The subscription now belongs to another session.
    #[error("Subscription {subscription_id} transferred to another session")]
    TransferredAway {
        /// Subscription ID.
        subscription_id: u32,
    },

    /// A monitored item client handle is unknown to the subscription.
    #[error("Monitored item with client handle {client_handle} not found")]
    MonitoredItemNotFound {
        /// Client handle.
        client_handle: u32,
    },
}

impl SubscriptionError {
    /// Returns the disposition of this error.
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::Terminated { .. } | Self::TransferredAway { .. } => Disposition::Terminal,
            Self::NotFound { .. } | Self::MonitoredItemNotFound { .. } => Disposition::Local,
        }
    }

    /// Returns the severity level.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Terminated { .. } => ErrorSeverity::Error,
            _ => ErrorSeverity::Warning,
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. } => ErrorCode::new(3, 1),
            Self::Terminated { .. } => ErrorCode::new(3, 2),
            Self::TransferredAway { .. } => ErrorCode::new(3, 3),
            Self::MonitoredItemNotFound { .. } => ErrorCode::new(3, 4),
        }
    }

    /// Returns recovery hints.
    pub fn recovery_hints(&self) -> Vec<&'static str> {
        match self {
            Self::Terminated { .. } => vec![
                "Create a new subscription",
                "Keep publish requests flowing to avoid lifetime expiry",
            ],
            Self::TransferredAway { .. } => vec!["Another session now owns this subscription"],
            Self::NotFound { .. } | Self::MonitoredItemNotFound { .. } => {
                vec!["Verify the identifier"]
            }
        }
    }

    /// Returns a user-friendly error message.
    pub fn user_message(&self) -> String {
        match self {
            Self::NotFound { subscription_id } => {
                format!("구독을 찾을 수 없습니다: {}", subscription_id)
            }
            Self::Terminated { subscription_id, .. } => {
                format!("구독({})이 서버에서 종료되었습니다", subscription_id)
            }
            Self::TransferredAway { subscription_id } => {
                format!("구독({})이 다른 세션으로 이전되었습니다", subscription_id)
            }
            Self::MonitoredItemNotFound { client_handle } => {
                format!("모니터링 항목을 찾을 수 없습니다: {}", client_handle)
            }
        }
    }
}

// =============================================================================
// ServiceError
// =============================================================================

/// A service call rejected as a whole.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The server answered with a service fault.
    #[error("{service} failed: {status}")]
    Fault {
        /// Service name.
        service: &'static str,
        /// Status returned by the server.
        status: StatusCode,
    },

    /// The server answered with a response of the wrong kind.
    #[error("{service} received unexpected response '{got}'")]
    UnexpectedResponse {
        /// Service name.
        service: &'static str,
        /// Kind of the response received.
        got: &'static str,
    },
}

impl ServiceError {
    /// Creates a service fault.
    pub fn fault(service: &'static str, status: StatusCode) -> Self {
        Self::Fault { service, status }
    }

    /// Returns the disposition of this error.
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::Fault { status, .. } => {
                if status.is_session_invalid() {
                    Disposition::Transient
                } else if *status == StatusCode::BAD_SUBSCRIPTION_ID_INVALID
                    || *status == StatusCode::BAD_NO_SUBSCRIPTION
                {
                    Disposition::Terminal
                } else {
                    Disposition::Local
                }
            }
            Self::UnexpectedResponse { .. } => Disposition::Local,
        }
    }

    /// Returns `true` if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Fault { status, .. } => {
                status.is_session_invalid()
                    || *status == StatusCode::BAD_TIMEOUT
                    || *status == StatusCode::BAD_TOO_MANY_PUBLISH_REQUESTS
            }
            Self::UnexpectedResponse { .. } => false,
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Fault { .. } => ErrorCode::new(4, 1),
            Self::UnexpectedResponse { .. } => ErrorCode::new(4, 2),
        }
    }
}

// =============================================================================
// ConfigurationError
// =============================================================================

/// Configuration errors, raised before any request is sent.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// A field holds an invalid value.
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Reason.
        reason: String,
    },

    /// A required field is missing.
    #[error("Missing required field '{field}'")]
    MissingField {
        /// Field name.
        field: String,
    },

    /// A node id string could not be parsed.
    #[error("Invalid node id '{input}': {reason}")]
    InvalidNodeId {
        /// The input string.
        input: String,
        /// Reason.
        reason: String,
    },

    /// A configuration file could not be parsed.
    #[error("Failed to parse '{path}': {message}")]
    Parse {
        /// File path.
        path: String,
        /// Parser message.
        message: String,
    },

    /// A configuration file could not be read.
    #[error("Failed to read '{path}'")]
    Io {
        /// File path.
        path: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

impl ConfigurationError {
    /// Creates an invalid value error.
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Creates a missing field error.
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    /// Creates an invalid node id error.
    pub fn invalid_node_id(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidNodeId {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Creates a parse error.
    pub fn parse(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::InvalidValue { .. } => ErrorCode::new(5, 1),
            Self::MissingField { .. } => ErrorCode::new(5, 2),
            Self::InvalidNodeId { .. } => ErrorCode::new(5, 3),
            Self::Parse { .. } => ErrorCode::new(5, 4),
            Self::Io { .. } => ErrorCode::new(5, 5),
        }
    }
}

// =============================================================================
// TimeoutError
// =============================================================================

/// Deadline failures.
#[derive(Debug, Error)]
pub enum TimeoutError {
    /// A request did not complete in time.
    #[error("{service} timed out after {duration:?}")]
    Request {
        /// Service name.
        service: &'static str,
        /// Timeout duration.
        duration: Duration,
    },

    /// Waiting for the connection to be restored timed out.
    #[error("Connection not restored within {duration:?}")]
    Reconnect {
        /// Timeout duration.
        duration: Duration,
    },
}

impl TimeoutError {
    /// Creates a request timeout.
    pub fn request(service: &'static str, duration: Duration) -> Self {
        Self::Request { service, duration }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Request { .. } => ErrorCode::new(6, 1),
            Self::Reconnect { .. } => ErrorCode::new(6, 2),
        }
    }
}

// =============================================================================
// ErrorSeverity
// =============================================================================

/// Error severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorSeverity {
    /// Informational - no action required.
    Info,
    /// Warning - action may be required.
    Warning,
    /// Error - action required, but recoverable.
    Error,
    /// Critical - immediate action required.
    Critical,
}

impl ErrorSeverity {
    /// Converts to tracing level.
    pub fn to_tracing_level(self) -> Level {
        match self {
            Self::Info => Level::INFO,
            Self::Warning => Level::WARN,
            Self::Error | Self::Critical => Level::ERROR,
        }
    }
}

// =============================================================================
// ErrorCode
// =============================================================================

/// Structured error code, formatted `UA-XXYY`.
///
/// Categories: 1 transport, 2 session, 3 subscription, 4 service,
/// 5 configuration, 6 timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode {
    /// Category.
    pub category: u8,
    /// Specific error within category.
    pub code: u8,
}

impl ErrorCode {
    /// Creates a new error code.
    pub const fn new(category: u8, code: u8) -> Self {
        Self { category, code }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UA-{:02X}{:02X}", self.category, self.code)
    }
}

// =============================================================================
// Error Context Extension
// =============================================================================

/// Extension trait adding context logging to results.
pub trait UaErrorContext<T> {
    /// Logs the error with a session context.
    fn with_session(self, session_id: &str) -> UaResult<T>;

    /// Logs the error with a subscription context.
    fn with_subscription(self, subscription_id: u32) -> UaResult<T>;
}

impl<T> UaErrorContext<T> for UaResult<T> {
    fn with_session(self, session_id: &str) -> UaResult<T> {
        self.map_err(|e| {
            tracing::debug!(session_id = session_id, error = %e, "Error with session context");
            e
        })
    }

    fn with_subscription(self, subscription_id: u32) -> UaResult<T> {
        self.map_err(|e| {
            tracing::debug!(subscription_id, error = %e, "Error with subscription context");
            e
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
