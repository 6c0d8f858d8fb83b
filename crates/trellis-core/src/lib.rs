// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # trellis-core
//!
//! Foundational types for the trellis OPC UA subscription runtime.
//!
//! - **Status**: [`StatusCode`] values returned per entry by batch services
//! - **Error**: the [`UaError`] hierarchy with terminal/transient/local disposition
//! - **Retry**: exponential backoff used by connection establishment and recovery
//! - **Types**: node ids, values, identifiers and monitoring enums
//!
//! This crate performs no I/O.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

pub mod error;
pub mod retry;
pub mod status;
pub mod types;

pub use error::{
    ConfigurationError, Disposition, ErrorCode, ErrorSeverity, ServiceError, SessionError,
    SubscriptionError, TimeoutError, TransportError, UaError, UaErrorContext, UaResult,
};
pub use retry::{BackoffConfig, ExponentialBackoff, RetryDecision, RetryLimit};
pub use status::StatusCode;
pub use types::{
    AttributeId, AuthToken, ChannelId, DataKind, DataValue, MonitoredItemId, MonitoringMode,
    NodeId, NodeIdentifier, NumericRange, SessionId, SubscriptionId, TimestampsToReturn, Variant,
};
