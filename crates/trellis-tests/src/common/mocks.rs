// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Mock Implementations
//!
//! A loopback [`UaTransport`] that hands requests straight to an in-process
//! [`SubscriptionServer`].
//!
//! ## Fault injection
//!
//! - [`LoopbackTransport::break_channels`]: every open channel dies and
//!   in-flight requests fail with a connection reset
//! - [`LoopbackTransport::set_online`]: while offline, no channel opens
//! - [`LoopbackTransport::refuse_next`]: the next `n` opens are refused
//! - [`LoopbackTransport::restart_server`]: breaks all channels and points
//!   the transport at a different server
//! - [`LoopbackTransport::drop_data_responses`]: the next `n` Publish
//!   responses carrying data are lost on the way back

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use trellis_core::{ChannelId, TransportError};
use trellis_opcua::messages::{Request, Response, ResponseBody};
use trellis_opcua::{SubscriptionServer, UaTransport};

// =============================================================================
// Loopback Transport
// =============================================================================

/// In-process transport with fault injection.
#[derive(Debug)]
pub struct LoopbackTransport {
    /// Reported endpoint.
    endpoint: String,

    /// Server answering requests.
    server: RwLock<Arc<SubscriptionServer>>,

    /// Channel id source, shared by every transport of one harness.
    channel_ids: Arc<AtomicU32>,

    /// Open channels; dropping or signalling the sender kills the channel.
    channels: Mutex<HashMap<ChannelId, watch::Sender<bool>>>,

    /// Whether channels can be opened.
    online: AtomicBool,

    /// Opens still to refuse.
    refusals: AtomicU32,

    /// Data-carrying Publish responses still to lose.
    data_drops: AtomicU32,

    /// Open attempts, refused ones included.
    open_attempts: AtomicU64,

    /// Requests sent.
    requests: AtomicU64,
}

impl LoopbackTransport {
    /// Creates a transport to `server` with its own channel id source.
    pub fn new(server: Arc<SubscriptionServer>) -> Self {
        Self::with_channel_ids(server, Arc::new(AtomicU32::new(0)))
    }

    /// Creates a transport drawing channel ids from a shared source.
    pub fn with_channel_ids(server: Arc<SubscriptionServer>, channel_ids: Arc<AtomicU32>) -> Self {
        Self {
            endpoint: crate::common::ConfigFixtures::ENDPOINT.to_string(),
            server: RwLock::new(server),
            channel_ids,
            channels: Mutex::new(HashMap::new()),
            online: AtomicBool::new(true),
            refusals: AtomicU32::new(0),
            data_drops: AtomicU32::new(0),
            open_attempts: AtomicU64::new(0),
            requests: AtomicU64::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Fault injection
    // -------------------------------------------------------------------------

    /// Kills every open channel.
    pub fn break_channels(&self) -> usize {
        let channels: Vec<_> = self.channels.lock().drain().collect();
        for (_, closed) in &channels {
            closed.send_replace(true);
        }
        tracing::debug!(count = channels.len(), "Loopback channels broken");
        channels.len()
    }

    /// Allows or forbids opening channels. Going offline also breaks the
    /// open ones.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        if !online {
            self.break_channels();
        }
    }

    /// Refuses the next `count` open attempts.
    pub fn refuse_next(&self, count: u32) {
        self.refusals.store(count, Ordering::SeqCst);
    }

    /// Loses the next `count` Publish responses that carry data.
    ///
    /// The server has sent them, so they wait unacknowledged in its
    /// retransmission queue. The request never completes on the client.
    pub fn drop_data_responses(&self, count: u32) {
        self.data_drops.store(count, Ordering::SeqCst);
    }

    /// Breaks every channel and routes later requests to `server`.
    pub fn restart_server(&self, server: Arc<SubscriptionServer>) {
        *self.server.write() = server;
        self.break_channels();
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    /// Number of open attempts so far.
    pub fn open_attempts(&self) -> u64 {
        self.open_attempts.load(Ordering::SeqCst)
    }

    /// Number of requests sent so far.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    /// Number of open channels.
    pub fn open_channels(&self) -> usize {
        self.channels.lock().len()
    }

    fn refuse(&self) -> bool {
        self.refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn lose(&self, response: &Response) -> bool {
        let carries_data = matches!(
            &response.body,
            ResponseBody::Publish(publish) if publish.notification_message.carries_data()
        );
        carries_data
            && self
                .data_drops
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
    }
}

#[async_trait]
impl UaTransport for LoopbackTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn open_channel(&self) -> Result<ChannelId, TransportError> {
        self.open_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.online.load(Ordering::SeqCst) || self.refuse() {
            return Err(TransportError::refused(self.endpoint.clone()));
        }
        let id = ChannelId(self.channel_ids.fetch_add(1, Ordering::SeqCst) + 1);
        self.channels.lock().insert(id, watch::channel(false).0);
        Ok(id)
    }

    async fn send(&self, channel: ChannelId, request: Request) -> Result<Response, TransportError> {
        let mut closed = match self.channels.lock().get(&channel) {
            Some(sender) => sender.subscribe(),
            None => return Err(TransportError::channel_closed(format!("{} is not open", channel))),
        };
        self.requests.fetch_add(1, Ordering::SeqCst);
        let server = Arc::clone(&self.server.read());

        let response = tokio::select! {
            response = server.handle_request(channel, request) => response,
            // Resolves on a break signal and once the channel is closed.
            _ = closed.changed() => {
                return Err(TransportError::connection_reset(self.endpoint.clone()));
            }
        };

        if self.lose(&response) {
            tracing::debug!(request_handle = response.header.request_handle, "Loopback lost a Publish response");
            let _ = closed.changed().await;
            return Err(TransportError::connection_reset(self.endpoint.clone()));
        }
        Ok(response)
    }

    async fn close_channel(&self, channel: ChannelId) {
        self.channels.lock().remove(&channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> Arc<SubscriptionServer> {
        Arc::new(SubscriptionServer::builder().build().unwrap())
    }

    #[tokio::test]
    async fn test_refusals_are_counted_down() {
        let transport = LoopbackTransport::new(server());
        transport.refuse_next(2);

        assert!(transport.open_channel().await.is_err());
        assert!(transport.open_channel().await.is_err());
        assert!(transport.open_channel().await.is_ok());
        assert_eq!(transport.open_attempts(), 3);
    }

    #[tokio::test]
    async fn test_break_closes_every_channel() {
        let transport = LoopbackTransport::new(server());
        let a = transport.open_channel().await.unwrap();
        let b = transport.open_channel().await.unwrap();
        assert_ne!(a, b);
        assert_eq!(transport.break_channels(), 2);
        assert_eq!(transport.open_channels(), 0);

        transport.set_online(false);
        assert!(transport.open_channel().await.is_err());
        transport.set_online(true);
        assert!(transport.open_channel().await.is_ok());
    }
}
