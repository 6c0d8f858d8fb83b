// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Shared value and identifier types.
//!
//! - [`NodeId`] / [`AttributeId`]: what a monitored item points at
//! - [`Variant`] / [`DataValue`]: values flowing from the data source to the client
//! - Newtype identifiers for sessions, channels, subscriptions and items
//! - [`MonitoringMode`], [`TimestampsToReturn`], [`NumericRange`]

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigurationError;
use crate::status::StatusCode;

// =============================================================================
// NodeId
// =============================================================================

/// An address-space node identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    /// Namespace index (0 = standard namespace).
    pub namespace_index: u16,

    /// The node identifier.
    pub identifier: NodeIdentifier,
}

/// The identifier part of a [`NodeId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum NodeIdentifier {
    /// Numeric identifier.
    Numeric(u32),
    /// String identifier.
    String(String),
    /// GUID identifier.
    Guid(Uuid),
}

impl NodeId {
    /// Creates a numeric node ID.
    #[inline]
    pub fn numeric(namespace_index: u16, value: u32) -> Self {
        Self {
            namespace_index,
            identifier: NodeIdentifier::Numeric(value),
        }
    }

    /// Creates a string node ID.
    #[inline]
    pub fn string(namespace_index: u16, value: impl Into<String>) -> Self {
        Self {
            namespace_index,
            identifier: NodeIdentifier::String(value.into()),
        }
    }

    /// Creates a GUID node ID.
    #[inline]
    pub fn guid(namespace_index: u16, value: Uuid) -> Self {
        Self {
            namespace_index,
            identifier: NodeIdentifier::Guid(value),
        }
    }

    /// Returns `true` if this is the null node id (`i=0`).
    pub fn is_null(&self) -> bool {
        self.namespace_index == 0 && self.identifier == NodeIdentifier::Numeric(0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace_index != 0 {
            write!(f, "ns={};", self.namespace_index)?;
        }
        match &self.identifier {
            NodeIdentifier::Numeric(v) => write!(f, "i={}", v),
            NodeIdentifier::String(v) => write!(f, "s={}", v),
            NodeIdentifier::Guid(v) => write!(f, "g={}", v),
        }
    }
}

impl FromStr for NodeId {
    type Err = ConfigurationError;

    /// Parses `ns=2;s=Boiler.Temp`, `ns=2;i=1001`, `g=<uuid>` or `i=85`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        let (namespace_index, identifier_part) = match s.strip_prefix("ns=") {
            Some(rest) => {
                let (ns, id) = rest.split_once(';').ok_or_else(|| {
                    ConfigurationError::invalid_node_id(s, "Missing identifier after namespace")
                })?;
                let ns: u16 = ns.parse().map_err(|_| {
                    ConfigurationError::invalid_node_id(s, "Invalid namespace index")
                })?;
                (ns, id)
            }
            None => (0, s),
        };

        let identifier = if let Some(id) = identifier_part.strip_prefix("i=") {
            NodeIdentifier::Numeric(id.parse().map_err(|_| {
                ConfigurationError::invalid_node_id(s, "Invalid numeric identifier")
            })?)
        } else if let Some(id) = identifier_part.strip_prefix("s=") {
            NodeIdentifier::String(id.to_string())
        } else if let Some(id) = identifier_part.strip_prefix("g=") {
            NodeIdentifier::Guid(Uuid::parse_str(id).map_err(|e| {
                ConfigurationError::invalid_node_id(s, format!("Invalid GUID: {}", e))
            })?)
        } else {
            return Err(ConfigurationError::invalid_node_id(
                s,
                "Unknown identifier type. Expected i=, s= or g=",
            ));
        };

        Ok(Self {
            namespace_index,
            identifier,
        })
    }
}

// =============================================================================
// AttributeId
// =============================================================================

/// Node attributes a monitored item can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AttributeId {
    /// Node ID attribute.
    NodeId,
    /// Browse name attribute.
    BrowseName,
    /// Display name attribute.
    DisplayName,
    /// Description attribute.
    Description,
    /// Event notifier attribute; targets event monitoring.
    EventNotifier,
    /// Value attribute.
    #[default]
    Value,
    /// Data type attribute.
    DataType,
    /// Access level attribute.
    AccessLevel,
    /// User access level attribute.
    UserAccessLevel,
}

impl AttributeId {
    /// Returns the numeric attribute identifier.
    pub const fn value(&self) -> u32 {
        match self {
            Self::NodeId => 1,
            Self::BrowseName => 3,
            Self::DisplayName => 4,
            Self::Description => 5,
            Self::EventNotifier => 12,
            Self::Value => 13,
            Self::DataType => 14,
            Self::AccessLevel => 17,
            Self::UserAccessLevel => 18,
        }
    }
}

impl fmt::Display for AttributeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// =============================================================================
// Variant
// =============================================================================

/// A dynamically typed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "value")]
pub enum Variant {
    /// No value.
    #[default]
    Null,
    /// Boolean value.
    Boolean(bool),
    /// Signed byte.
    SByte(i8),
    /// Unsigned byte.
    Byte(u8),
    /// 16-bit signed integer.
    Int16(i16),
    /// 16-bit unsigned integer.
    UInt16(u16),
    /// 32-bit signed integer.
    Int32(i32),
    /// 32-bit unsigned integer.
    UInt32(u32),
    /// 64-bit signed integer.
    Int64(i64),
    /// 64-bit unsigned integer.
    UInt64(u64),
    /// 32-bit float.
    Float(f32),
    /// 64-bit double.
    Double(f64),
    /// String value.
    String(String),
    /// Date/time value.
    DateTime(DateTime<Utc>),
    /// Byte string.
    ByteString(Vec<u8>),
    /// Array of values.
    Array(Vec<Variant>),
}

impl Variant {
    /// Returns the kind of this value.
    pub fn kind(&self) -> DataKind {
        match self {
            Self::Null => DataKind::Null,
            Self::Boolean(_) => DataKind::Boolean,
            Self::SByte(_) => DataKind::SByte,
            Self::Byte(_) => DataKind::Byte,
            Self::Int16(_) => DataKind::Int16,
            Self::UInt16(_) => DataKind::UInt16,
            Self::Int32(_) => DataKind::Int32,
            Self::UInt32(_) => DataKind::UInt32,
            Self::Int64(_) => DataKind::Int64,
            Self::UInt64(_) => DataKind::UInt64,
            Self::Float(_) => DataKind::Float,
            Self::Double(_) => DataKind::Double,
            Self::String(_) => DataKind::String,
            Self::DateTime(_) => DataKind::DateTime,
            Self::ByteString(_) => DataKind::ByteString,
            Self::Array(_) => DataKind::Array,
        }
    }

    /// Returns `true` if this is a null value.
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the value as an exact integer, for integer kinds only.
    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Self::SByte(v) => Some(i128::from(*v)),
            Self::Byte(v) => Some(i128::from(*v)),
            Self::Int16(v) => Some(i128::from(*v)),
            Self::UInt16(v) => Some(i128::from(*v)),
            Self::Int32(v) => Some(i128::from(*v)),
            Self::UInt32(v) => Some(i128::from(*v)),
            Self::Int64(v) => Some(i128::from(*v)),
            Self::UInt64(v) => Some(i128::from(*v)),
            _ => None,
        }
    }

    /// Returns the value as an f64, for numeric kinds only.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(f64::from(*v)),
            Self::Double(v) => Some(*v),
            other => other.as_i128().map(|v| v as f64),
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Boolean(v) => write!(f, "{}", v),
            Self::String(v) => write!(f, "{:?}", v),
            Self::DateTime(v) => write!(f, "{}", v.to_rfc3339()),
            Self::ByteString(v) => write!(f, "<{} bytes>", v.len()),
            Self::Array(v) => write!(f, "[{} items]", v.len()),
            other => match other.as_f64() {
                Some(n) => write!(f, "{}", n),
                None => write!(f, "{:?}", other),
            },
        }
    }
}

macro_rules! variant_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Variant {
                fn from(value: $ty) -> Self {
                    Self::$variant(value)
                }
            }
        )*
    };
}

variant_from! {
    bool => Boolean,
    i8 => SByte,
    u8 => Byte,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f32 => Float,
    f64 => Double,
    String => String,
}

impl From<&str> for Variant {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

// =============================================================================
// DataKind
// =============================================================================

/// The declared data type of a node's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    /// No value.
    Null,
    /// Boolean.
    Boolean,
    /// Signed byte.
    SByte,
    /// Unsigned byte.
    Byte,
    /// 16-bit signed integer.
    Int16,
    /// 16-bit unsigned integer.
    UInt16,
    /// 32-bit signed integer.
    Int32,
    /// 32-bit unsigned integer.
    UInt32,
    /// 64-bit signed integer.
    Int64,
    /// 64-bit unsigned integer.
    UInt64,
    /// 32-bit float.
    Float,
    /// 64-bit double.
    Double,
    /// String.
    String,
    /// Date/time.
    DateTime,
    /// Byte string.
    ByteString,
    /// Array.
    Array,
}

impl DataKind {
    /// Returns `true` for integer kinds.
    pub const fn is_integer(&self) -> bool {
        matches!(
            self,
            Self::SByte
                | Self::Byte
                | Self::Int16
                | Self::UInt16
                | Self::Int32
                | Self::UInt32
                | Self::Int64
                | Self::UInt64
        )
    }

    /// Returns `true` for kinds a deadband can apply to.
    pub const fn is_numeric(&self) -> bool {
        self.is_integer() || matches!(self, Self::Float | Self::Double)
    }
}

// =============================================================================
// DataValue
// =============================================================================

/// A value with quality and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DataValue {
    /// The value, absent for pure status reports.
    pub value: Option<Variant>,
    /// Quality of the value.
    pub status: StatusCode,
    /// When the source produced the value.
    pub source_timestamp: Option<DateTime<Utc>>,
    /// When the server observed the value.
    pub server_timestamp: Option<DateTime<Utc>>,
}

impl DataValue {
    /// Creates a Good value stamped with the current time.
    pub fn new(value: impl Into<Variant>) -> Self {
        let now = Utc::now();
        Self {
            value: Some(value.into()),
            status: StatusCode::GOOD,
            source_timestamp: Some(now),
            server_timestamp: Some(now),
        }
    }

    /// Creates a value-less report carrying only a status.
    pub fn from_status(status: StatusCode) -> Self {
        Self {
            value: None,
            status,
            source_timestamp: None,
            server_timestamp: Some(Utc::now()),
        }
    }

    /// Returns `true` if the status is Good.
    #[inline]
    pub fn is_good(&self) -> bool {
        self.status.is_good()
    }

    /// Returns a copy restricted to the requested timestamps.
    pub fn with_timestamps(&self, timestamps: TimestampsToReturn) -> Self {
        let mut value = self.clone();
        match timestamps {
            TimestampsToReturn::Source => value.server_timestamp = None,
            TimestampsToReturn::Server => value.source_timestamp = None,
            TimestampsToReturn::Both => {}
            TimestampsToReturn::Neither => {
                value.source_timestamp = None;
                value.server_timestamp = None;
            }
        }
        value
    }
}

// =============================================================================
// Identifiers
// =============================================================================

macro_rules! numeric_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl $name {
            /// Creates a new identifier.
            #[inline]
            pub const fn new(id: u32) -> Self {
                Self(id)
            }

            /// Returns the raw value.
            #[inline]
            pub const fn value(&self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }

        impl From<u32> for $name {
            fn from(id: u32) -> Self {
                Self(id)
            }
        }
    };
}

numeric_id!(
    /// Server-assigned subscription identifier.
    SubscriptionId,
    "sub"
);
numeric_id!(
    /// Server-assigned monitored item identifier.
    MonitoredItemId,
    "item"
);
numeric_id!(
    /// Server-assigned session identifier.
    SessionId,
    "session"
);
numeric_id!(
    /// Identifier of a secure channel.
    ChannelId,
    "channel"
);

/// Secret authentication token binding requests to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthToken(pub Uuid);

impl AuthToken {
    /// Generates a fresh random token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// The token sent before any session exists.
    pub const fn null() -> Self {
        Self(Uuid::nil())
    }
}

impl fmt::Display for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only a prefix: tokens end up in logs.
        let s = self.0.simple().to_string();
        write!(f, "{}…", &s[..8])
    }
}

// =============================================================================
// MonitoringMode
// =============================================================================

/// Monitoring mode of a monitored item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MonitoringMode {
    /// Not sampling.
    Disabled,
    /// Sampling into the queue without reporting.
    Sampling,
    /// Sampling and reporting.
    #[default]
    Reporting,
}

impl MonitoringMode {
    /// Returns `true` if the item samples in this mode.
    #[inline]
    pub const fn is_sampling(&self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

impl fmt::Display for MonitoringMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disabled => "disabled",
            Self::Sampling => "sampling",
            Self::Reporting => "reporting",
        };
        f.write_str(s)
    }
}

// =============================================================================
// TimestampsToReturn
// =============================================================================

/// Which timestamps notifications carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimestampsToReturn {
    /// Source timestamp only.
    Source,
    /// Server timestamp only.
    Server,
    /// Both timestamps.
    #[default]
    Both,
    /// No timestamps.
    Neither,
}

// =============================================================================
// NumericRange
// =============================================================================

/// An index range into an array or string value, `"n"` or `"lo:hi"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NumericRange {
    /// First index, inclusive.
    pub low: u32,
    /// Last index, inclusive.
    pub high: u32,
}

impl NumericRange {
    /// Parses an index range, returning `BadIndexRangeInvalid` on bad syntax.
    pub fn parse(s: &str) -> Result<Self, StatusCode> {
        let invalid = |_| StatusCode::BAD_INDEX_RANGE_INVALID;
        match s.split_once(':') {
            None => {
                let index: u32 = s.trim().parse().map_err(invalid)?;
                Ok(Self {
                    low: index,
                    high: index,
                })
            }
            Some((low, high)) => {
                let low: u32 = low.trim().parse().map_err(invalid)?;
                let high: u32 = high.trim().parse().map_err(invalid)?;
                if low >= high {
                    return Err(StatusCode::BAD_INDEX_RANGE_INVALID);
                }
                Ok(Self { low, high })
            }
        }
    }

    /// Applies the range to a value.
    ///
    /// Arrays, strings and byte strings are sliced; a range starting past
    /// the end yields `BadIndexRangeNoData`. Scalars do not support ranges.
    pub fn apply(&self, value: &Variant) -> Result<Variant, StatusCode> {
        let low = self.low as usize;
        let high = self.high as usize;
        match value {
            Variant::Array(items) => {
                if low >= items.len() {
                    return Err(StatusCode::BAD_INDEX_RANGE_NO_DATA);
                }
                let end = (high + 1).min(items.len());
                Ok(Variant::Array(items[low..end].to_vec()))
            }
            Variant::String(s) => {
                let chars: Vec<char> = s.chars().collect();
                if low >= chars.len() {
                    return Err(StatusCode::BAD_INDEX_RANGE_NO_DATA);
                }
                let end = (high + 1).min(chars.len());
                Ok(Variant::String(chars[low..end].iter().collect()))
            }
            Variant::ByteString(bytes) => {
                if low >= bytes.len() {
                    return Err(StatusCode::BAD_INDEX_RANGE_NO_DATA);
                }
                let end = (high + 1).min(bytes.len());
                Ok(Variant::ByteString(bytes[low..end].to_vec()))
            }
            _ => Err(StatusCode::BAD_INDEX_RANGE_NO_DATA),
        }
    }
}

impl fmt::Display for NumericRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.low == self.high {
            write!(f, "{}", self.low)
        } else {
            write!(f, "{}:{}", self.low, self.high)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_parse_and_display() {
        let node: NodeId = "ns=2;s=Boiler.Temp".parse().unwrap();
        assert_eq!(node, NodeId::string(2, "Boiler.Temp"));
        assert_eq!(node.to_string(), "ns=2;s=Boiler.Temp");

        let node: NodeId = "i=2258".parse().unwrap();
        assert_eq!(node, NodeId::numeric(0, 2258));
        assert_eq!(node.to_string(), "i=2258");

        assert!("ns=x;i=1".parse::<NodeId>().is_err());
        assert!("ns=2".parse::<NodeId>().is_err());
        assert!("q=1".parse::<NodeId>().is_err());
    }

    #[test]
    fn test_variant_numeric_views() {
        assert_eq!(Variant::Int32(-5).as_i128(), Some(-5));
        assert_eq!(Variant::UInt64(u64::MAX).as_i128(), Some(i128::from(u64::MAX)));
        assert_eq!(Variant::Double(1.5).as_i128(), None);
        assert_eq!(Variant::Float(2.5).as_f64(), Some(2.5));
        assert_eq!(Variant::from("text").as_f64(), None);
        assert!(Variant::Int16(1).kind().is_integer());
        assert!(!Variant::Boolean(true).kind().is_numeric());
    }

    #[test]
    fn test_numeric_range_parse() {
        assert_eq!(
            NumericRange::parse("2:4"),
            Ok(NumericRange { low: 2, high: 4 })
        );
        assert_eq!(NumericRange::parse("3"), Ok(NumericRange { low: 3, high: 3 }));
        assert_eq!(
            NumericRange::parse("4:2"),
            Err(StatusCode::BAD_INDEX_RANGE_INVALID)
        );
        assert_eq!(
            NumericRange::parse("a:b"),
            Err(StatusCode::BAD_INDEX_RANGE_INVALID)
        );
        assert_eq!(
            NumericRange::parse("1:1"),
            Err(StatusCode::BAD_INDEX_RANGE_INVALID)
        );
    }

    #[test]
    fn test_numeric_range_apply() {
        let array = Variant::Array((0..5).map(Variant::Int32).collect());
        let range = NumericRange::parse("1:2").unwrap();
        assert_eq!(
            range.apply(&array),
            Ok(Variant::Array(vec![Variant::Int32(1), Variant::Int32(2)]))
        );
        let past_end = NumericRange::parse("9").unwrap();
        assert_eq!(
            past_end.apply(&array),
            Err(StatusCode::BAD_INDEX_RANGE_NO_DATA)
        );
        assert_eq!(
            NumericRange::parse("0:2").unwrap().apply(&Variant::from("hello")),
            Ok(Variant::from("hel"))
        );
    }

    #[test]
    fn test_data_value_timestamps() {
        let value = DataValue::new(1i32);
        let stripped = value.with_timestamps(TimestampsToReturn::Neither);
        assert!(stripped.source_timestamp.is_none());
        assert!(stripped.server_timestamp.is_none());
        let source = value.with_timestamps(TimestampsToReturn::Source);
        assert!(source.source_timestamp.is_some());
        assert!(source.server_timestamp.is_none());
    }

    #[test]
    fn test_id_display() {
        assert_eq!(SubscriptionId::new(7).to_string(), "sub-7");
        assert_eq!(MonitoredItemId::from(3).to_string(), "item-3");
    }
}
