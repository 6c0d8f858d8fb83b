// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Transport abstraction consumed by the client.
//!
//! A transport opens secure channels and carries one request to its
//! correlated response. Framing, chunking and channel security live behind
//! this trait; failures surface as [`TransportError`] values.

use async_trait::async_trait;
use trellis_core::{ChannelId, TransportError};

use crate::messages::{Request, Response};

/// Request/response transport to one server endpoint.
///
/// Implementations must fail every in-flight [`send`](Self::send) on a
/// channel once that channel breaks, so waiting callers never hang on a dead
/// connection.
#[async_trait]
pub trait UaTransport: Send + Sync + 'static {
    /// Endpoint URL, for logging.
    fn endpoint(&self) -> &str;

    /// Opens a new secure channel.
    async fn open_channel(&self) -> Result<ChannelId, TransportError>;

    /// Sends `request` on `channel` and waits for its response.
    async fn send(&self, channel: ChannelId, request: Request) -> Result<Response, TransportError>;

    /// Closes `channel`. Closing an unknown or broken channel is a no-op.
    async fn close_channel(&self, channel: ChannelId);
}
