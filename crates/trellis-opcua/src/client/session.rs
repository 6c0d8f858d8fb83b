// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Connection state, session info, client events and statistics.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use trellis_core::{AuthToken, ChannelId, SessionId, StatusCode, SubscriptionId};

// =============================================================================
// ConnectionState
// =============================================================================

/// State of the client's connection to its server.
///
/// ```text
/// Disconnected ──► Connecting ──► Connected ──(channel break)──► Reconnecting
///                      │              ▲                              │
///                      ▼              └──────────────────────────────┤
///                   GiveUp                                           │
///                 (first contact only)                     (never gives up)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected.
    #[default]
    Disconnected,

    /// First connection attempt in progress.
    Connecting,

    /// Session active, requests flow.
    Connected,

    /// Restoring a connection that was established before.
    Reconnecting,

    /// The initial connection retry budget is exhausted.
    GiveUp,
}

impl ConnectionState {
    /// Returns `true` if requests can be sent.
    #[inline]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Returns `true` while a connection is being (re-)established.
    #[inline]
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting)
    }

    /// Returns `true` if no further attempt will be made.
    #[inline]
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Disconnected | Self::GiveUp)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Reconnecting => write!(f, "Reconnecting"),
            Self::GiveUp => write!(f, "GiveUp"),
        }
    }
}

// =============================================================================
// SessionInfo
// =============================================================================

/// The session the client currently talks through.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    /// Server-assigned session id.
    pub session_id: SessionId,

    /// Authentication token sent with every request.
    pub auth_token: AuthToken,

    /// Channel the session is bound to.
    pub channel: ChannelId,

    /// Timeout revised by the server.
    pub revised_timeout: Duration,

    /// When the session was created.
    pub created_at: Instant,
}

impl SessionInfo {
    /// Returns `true` if `other` is the same session on the same channel.
    pub fn same_binding(&self, other: &SessionInfo) -> bool {
        self.auth_token == other.auth_token && self.channel == other.channel
    }
}

// =============================================================================
// ClientEvent
// =============================================================================

/// Connection-level events broadcast by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The connection state changed.
    StateChanged {
        /// Previous state.
        from: ConnectionState,
        /// New state.
        to: ConnectionState,
    },

    /// A (re-)connection attempt failed; the next one follows after `delay`.
    Backoff {
        /// Number of the failed attempt, 1-based.
        attempt: u32,
        /// Delay before the next attempt.
        delay: Duration,
    },

    /// The transport failed or the session was invalidated.
    ConnectionLost {
        /// `true` when the server no longer knows the session.
        session_lost: bool,
    },

    /// The original session was re-activated on a new channel.
    SessionRepaired {
        /// Session id.
        session_id: SessionId,
    },

    /// A new session replaced the lost one.
    SessionRecreated {
        /// Session id of the new session.
        session_id: SessionId,
    },

    /// A subscription was transferred to the new session.
    SubscriptionTransferred {
        /// Subscription id.
        subscription_id: SubscriptionId,
    },

    /// A subscription could not be transferred and was created again.
    SubscriptionRecreated {
        /// Id before recreation.
        old_id: SubscriptionId,
        /// Id after recreation.
        new_id: SubscriptionId,
    },

    /// The initial connection retry budget is exhausted.
    GaveUp {
        /// Failed attempts.
        attempts: u32,
    },
}

// =============================================================================
// ClientStats
// =============================================================================

/// Client counters.
#[derive(Debug, Default)]
pub struct ClientStats {
    requests_sent: AtomicU64,
    request_failures: AtomicU64,
    service_faults: AtomicU64,
    reconnect_attempts: AtomicU64,
    sessions_repaired: AtomicU64,
    sessions_recreated: AtomicU64,
    subscriptions_transferred: AtomicU64,
    subscriptions_recreated: AtomicU64,
    republish_requests: AtomicU64,
    messages_lost: AtomicU64,
    notifications_received: AtomicU64,
}

impl ClientStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_request(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.request_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fault(&self, _status: StatusCode) {
        self.service_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_repair(&self) {
        self.sessions_repaired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recreation(&self) {
        self.sessions_recreated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transfer(&self) {
        self.subscriptions_transferred.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_subscription_recreated(&self) {
        self.subscriptions_recreated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_republish(&self) {
        self.republish_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_lost(&self) {
        self.messages_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_notification(&self) {
        self.notifications_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Requests sent.
    pub fn requests_sent(&self) -> u64 {
        self.requests_sent.load(Ordering::Relaxed)
    }

    /// Requests that failed at the transport or timed out.
    pub fn request_failures(&self) -> u64 {
        self.request_failures.load(Ordering::Relaxed)
    }

    /// Service faults received.
    pub fn service_faults(&self) -> u64 {
        self.service_faults.load(Ordering::Relaxed)
    }

    /// Reconnection attempts.
    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    /// Sessions repaired by re-activation.
    pub fn sessions_repaired(&self) -> u64 {
        self.sessions_repaired.load(Ordering::Relaxed)
    }

    /// Sessions replaced by a new one.
    pub fn sessions_recreated(&self) -> u64 {
        self.sessions_recreated.load(Ordering::Relaxed)
    }

    /// Subscriptions transferred during recovery.
    pub fn subscriptions_transferred(&self) -> u64 {
        self.subscriptions_transferred.load(Ordering::Relaxed)
    }

    /// Subscriptions recreated from scratch.
    pub fn subscriptions_recreated(&self) -> u64 {
        self.subscriptions_recreated.load(Ordering::Relaxed)
    }

    /// Republish requests issued for sequence gaps.
    pub fn republish_requests(&self) -> u64 {
        self.republish_requests.load(Ordering::Relaxed)
    }

    /// Messages that could not be recovered.
    pub fn messages_lost(&self) -> u64 {
        self.messages_lost.load(Ordering::Relaxed)
    }

    /// Data and event messages delivered.
    pub fn notifications_received(&self) -> u64 {
        self.notifications_received.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(ConnectionState::Reconnecting.is_transitioning());
        assert!(ConnectionState::GiveUp.is_final());
        assert!(!ConnectionState::Reconnecting.is_final());
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_stats() {
        let stats = ClientStats::new();
        stats.record_request();
        stats.record_request();
        stats.record_republish();
        assert_eq!(stats.requests_sent(), 2);
        assert_eq!(stats.republish_requests(), 1);
        assert_eq!(stats.messages_lost(), 0);
    }
}
