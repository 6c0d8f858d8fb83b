// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! OPC UA status codes.
//!
//! Protocol-level rejections travel as [`StatusCode`] values inside results,
//! one per entry in batch calls. They are data, not errors: a batch with one
//! bad entry still succeeds as a whole.
//!
//! # Layout
//!
//! ```text
//! 31..30  severity   00 = Good, 01 = Uncertain, 10 = Bad
//! 29..16  sub-code   identifies the condition
//! 15..0   info bits  (Overflow = 0x0080 with InfoType DataValue = 0x0400)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// An OPC UA status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCode(pub u32);

macro_rules! status_codes {
    ($( $(#[$doc:meta])* $name:ident = $value:literal; )*) => {
        impl StatusCode {
            $(
                $(#[$doc])*
                pub const $name: StatusCode = StatusCode($value);
            )*

            /// Returns the symbolic name of the code, ignoring info bits.
            pub fn name(&self) -> &'static str {
                match self.code() {
                    $( $value => stringify!($name), )*
                    _ => "Unknown",
                }
            }
        }
    };
}

status_codes! {
    /// The operation succeeded.
    GOOD = 0x0000_0000;
    /// The subscription was transferred to another session.
    GOOD_SUBSCRIPTION_TRANSFERRED = 0x002D_0000;
    /// An internal error occurred.
    BAD_INTERNAL_ERROR = 0x8002_0000;
    /// A low level communication error occurred.
    BAD_COMMUNICATION_ERROR = 0x8005_0000;
    /// The operation timed out.
    BAD_TIMEOUT = 0x800A_0000;
    /// The server has stopped.
    BAD_SERVER_HALTED = 0x800E_0000;
    /// There was nothing to do.
    BAD_NOTHING_TO_DO = 0x800F_0000;
    /// Too many operations in one request.
    BAD_TOO_MANY_OPERATIONS = 0x8010_0000;
    /// The user has no access to the item.
    BAD_USER_ACCESS_DENIED = 0x801F_0000;
    /// The identity token is not valid.
    BAD_IDENTITY_TOKEN_INVALID = 0x8020_0000;
    /// The identity token was rejected.
    BAD_IDENTITY_TOKEN_REJECTED = 0x8021_0000;
    /// The secure channel id is not valid for this session.
    BAD_SECURE_CHANNEL_ID_INVALID = 0x8022_0000;
    /// The session id is not valid.
    BAD_SESSION_ID_INVALID = 0x8025_0000;
    /// The session was closed.
    BAD_SESSION_CLOSED = 0x8026_0000;
    /// The session has not been activated.
    BAD_SESSION_NOT_ACTIVATED = 0x8027_0000;
    /// The subscription id is not valid.
    BAD_SUBSCRIPTION_ID_INVALID = 0x8028_0000;
    /// The timestamps-to-return parameter is invalid.
    BAD_TIMESTAMPS_TO_RETURN_INVALID = 0x802B_0000;
    /// Waiting for the server to obtain values from the source.
    BAD_WAITING_FOR_INITIAL_DATA = 0x8032_0000;
    /// The node id syntax is invalid.
    BAD_NODE_ID_INVALID = 0x8033_0000;
    /// The node id refers to a node that does not exist.
    BAD_NODE_ID_UNKNOWN = 0x8034_0000;
    /// The attribute is not supported by the node.
    BAD_ATTRIBUTE_ID_INVALID = 0x8035_0000;
    /// The index range syntax is invalid.
    BAD_INDEX_RANGE_INVALID = 0x8036_0000;
    /// No data exists within the index range.
    BAD_INDEX_RANGE_NO_DATA = 0x8037_0000;
    /// The requested service is not implemented.
    BAD_NOT_IMPLEMENTED = 0x8040_0000;
    /// The monitoring mode is invalid.
    BAD_MONITORING_MODE_INVALID = 0x8041_0000;
    /// The monitored item id is not valid.
    BAD_MONITORED_ITEM_ID_INVALID = 0x8042_0000;
    /// The monitored item filter parameter is not valid.
    BAD_MONITORED_ITEM_FILTER_INVALID = 0x8043_0000;
    /// The filter is not supported by the server.
    BAD_MONITORED_ITEM_FILTER_UNSUPPORTED = 0x8044_0000;
    /// A filter cannot be used with the monitored attribute.
    BAD_FILTER_NOT_ALLOWED = 0x8045_0000;
    /// The event filter is not valid.
    BAD_EVENT_FILTER_INVALID = 0x8047_0000;
    /// The continuation point is not valid.
    BAD_CONTINUATION_POINT_INVALID = 0x804A_0000;
    /// The server has reached its maximum number of sessions.
    BAD_TOO_MANY_SESSIONS = 0x8056_0000;
    /// The server has reached its maximum number of subscriptions.
    BAD_TOO_MANY_SUBSCRIPTIONS = 0x8077_0000;
    /// The server has reached the maximum number of queued publish requests.
    BAD_TOO_MANY_PUBLISH_REQUESTS = 0x8078_0000;
    /// There is no subscription available for this session.
    BAD_NO_SUBSCRIPTION = 0x8079_0000;
    /// The sequence number is unknown to the server.
    BAD_SEQUENCE_NUMBER_UNKNOWN = 0x807A_0000;
    /// The requested notification message is no longer available.
    BAD_MESSAGE_NOT_AVAILABLE = 0x807B_0000;
    /// The deadband filter is not valid.
    BAD_DEADBAND_FILTER_INVALID = 0x808E_0000;
    /// The network connection has been closed.
    BAD_CONNECTION_CLOSED = 0x80AE_0000;
    /// The server has reached the maximum number of monitored items.
    BAD_TOO_MANY_MONITORED_ITEMS = 0x80DB_0000;
}

impl StatusCode {
    const SEVERITY_MASK: u32 = 0xC000_0000;
    const CODE_MASK: u32 = 0xFFFF_0000;
    const INFO_TYPE_DATA_VALUE: u32 = 0x0000_0400;
    const OVERFLOW: u32 = 0x0000_0080;

    /// Returns the code without info bits.
    #[inline]
    pub const fn code(&self) -> u32 {
        self.0 & Self::CODE_MASK
    }

    /// Returns `true` for Good severity.
    #[inline]
    pub const fn is_good(&self) -> bool {
        self.0 & Self::SEVERITY_MASK == 0
    }

    /// Returns `true` for Uncertain severity.
    #[inline]
    pub const fn is_uncertain(&self) -> bool {
        self.0 & Self::SEVERITY_MASK == 0x4000_0000
    }

    /// Returns `true` for Bad severity.
    #[inline]
    pub const fn is_bad(&self) -> bool {
        self.0 & 0x8000_0000 != 0
    }

    /// Returns a copy with the queue-overflow info bit set.
    pub const fn with_overflow(self) -> Self {
        Self(self.0 | Self::INFO_TYPE_DATA_VALUE | Self::OVERFLOW)
    }

    /// Returns `true` if the queue-overflow info bit is set.
    pub const fn has_overflow(&self) -> bool {
        self.0 & (Self::INFO_TYPE_DATA_VALUE | Self::OVERFLOW)
            == (Self::INFO_TYPE_DATA_VALUE | Self::OVERFLOW)
    }

    /// Returns `true` if the code means the session is gone server-side.
    pub fn is_session_invalid(&self) -> bool {
        let code = StatusCode(self.code());
        code == Self::BAD_SESSION_ID_INVALID
            || code == Self::BAD_SESSION_CLOSED
            || code == Self::BAD_SESSION_NOT_ACTIVATED
    }

    /// Returns `true` if the code means the service is not offered.
    pub fn is_unsupported_service(&self) -> bool {
        self.code() == Self::BAD_NOT_IMPLEMENTED.0
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:08X})", self.name(), self.0)
    }
}

impl From<u32> for StatusCode {
    fn from(value: u32) -> Self {
        Self(value)
    }
}
