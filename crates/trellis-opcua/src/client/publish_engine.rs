// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Client publish pipeline.
//!
//! A fixed number of workers each keep one Publish request outstanding so
//! the server always holds a request when data becomes ready. Responses are
//! routed to their [`ClientSubscription`] and delivered in sequence order:
//!
//! ```text
//!  worker ──Publish(acks)──► server
//!    ▲                          │
//!    │                          ▼
//!    └── ack ◄── deliver ◄── classify(seq) ──gap──► Republish(seq)
//! ```
//!
//! Workers idle while the pipeline is suspended, while the client is not
//! connected, and while no subscription exists.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace, warn};
use trellis_core::{StatusCode, SubscriptionId, UaError};

use super::subscription::{
    ClientSubscription, ClientSubscriptionState, DeliveryState, Sequencing, SubscriptionEvent,
};
use super::transport::UaTransport;
use super::ua_client::ClientInner;
use crate::messages::{
    NotificationData, NotificationMessage, PublishRequest, PublishResponse, RepublishRequest,
    RequestBody, ResponseBody, SubscriptionAcknowledgement,
};

/// Pause after the server refuses a Publish request.
const PUBLISH_RETRY_DELAY: Duration = Duration::from_millis(100);

// =============================================================================
// PublishEngine
// =============================================================================

/// Subscription registry and acknowledgement queue shared by the workers.
#[derive(Debug)]
pub(crate) struct PublishEngine {
    depth: usize,
    subscriptions: DashMap<SubscriptionId, Arc<ClientSubscription>>,
    acks: Mutex<Vec<SubscriptionAcknowledgement>>,
    suspended: watch::Sender<bool>,
    live: watch::Sender<usize>,
}

impl PublishEngine {
    pub(crate) fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            subscriptions: DashMap::new(),
            acks: Mutex::new(Vec::new()),
            suspended: watch::channel(false).0,
            live: watch::channel(0).0,
        }
    }

    /// Number of publish workers.
    pub(crate) fn depth(&self) -> usize {
        self.depth
    }

    pub(crate) fn register(&self, subscription: Arc<ClientSubscription>) {
        self.subscriptions.insert(subscription.id(), subscription);
        self.live.send_replace(self.subscriptions.len());
    }

    pub(crate) fn unregister(&self, id: SubscriptionId) -> Option<Arc<ClientSubscription>> {
        let removed = self.subscriptions.remove(&id).map(|(_, sub)| sub);
        self.acks.lock().retain(|ack| ack.subscription_id != id);
        self.live.send_replace(self.subscriptions.len());
        removed
    }

    /// Moves a subscription to the id it received when it was recreated.
    pub(crate) fn rekey(&self, old: SubscriptionId, new: SubscriptionId) {
        if let Some((_, sub)) = self.subscriptions.remove(&old) {
            self.acks.lock().retain(|ack| ack.subscription_id != old);
            self.subscriptions.insert(new, sub);
        }
    }

    pub(crate) fn subscription(&self, id: SubscriptionId) -> Option<Arc<ClientSubscription>> {
        self.subscriptions.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Registered subscriptions ordered by id.
    pub(crate) fn subscriptions(&self) -> Vec<Arc<ClientSubscription>> {
        let mut subs: Vec<_> = self
            .subscriptions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        subs.sort_by_key(|sub| sub.id());
        subs
    }

    /// Unregisters every subscription.
    pub(crate) fn clear(&self) -> Vec<Arc<ClientSubscription>> {
        let subs = self.subscriptions();
        self.subscriptions.clear();
        self.acks.lock().clear();
        self.live.send_replace(0);
        subs
    }

    pub(crate) fn suspend(&self) {
        self.suspended.send_replace(true);
    }

    pub(crate) fn resume(&self) {
        self.suspended.send_replace(false);
    }

    pub(crate) fn is_suspended(&self) -> bool {
        *self.suspended.borrow()
    }

    fn take_acks(&self) -> Vec<SubscriptionAcknowledgement> {
        std::mem::take(&mut *self.acks.lock())
    }

    fn restore_acks(&self, acks: Vec<SubscriptionAcknowledgement>) {
        if acks.is_empty() {
            return;
        }
        let mut pending = self.acks.lock();
        for ack in acks {
            if self.subscriptions.contains_key(&ack.subscription_id) && !pending.contains(&ack) {
                pending.push(ack);
            }
        }
    }

    fn push_ack(&self, subscription_id: SubscriptionId, sequence_number: u32) {
        self.acks.lock().push(SubscriptionAcknowledgement {
            subscription_id,
            sequence_number,
        });
    }

    /// Publish requests may legitimately wait one full keep-alive period.
    pub(crate) fn publish_timeout(&self, base: Duration) -> Duration {
        let longest = self
            .subscriptions
            .iter()
            .map(|entry| entry.value().revised().keep_alive_period())
            .max()
            .unwrap_or_default();
        base + longest
    }
}

// =============================================================================
// Worker
// =============================================================================

/// Runs one publish worker until the client shuts down.
pub(crate) async fn run_worker<T: UaTransport>(inner: Arc<ClientInner<T>>, worker: usize) {
    let mut state = inner.state.subscribe();
    let mut suspended = inner.engine.suspended.subscribe();
    let mut live = inner.engine.live.subscribe();
    let mut shutdown = inner.shutdown.subscribe();
    debug!(worker, "Publish worker started");

    loop {
        loop {
            if *shutdown.borrow_and_update() {
                debug!(worker, "Publish worker stopped");
                return;
            }
            let connected = state.borrow_and_update().is_connected();
            let paused = *suspended.borrow_and_update();
            let subscriptions = *live.borrow_and_update();
            if connected && !paused && subscriptions > 0 {
                break;
            }
            tokio::select! {
                _ = state.changed() => {}
                _ = suspended.changed() => {}
                _ = live.changed() => {}
                _ = shutdown.changed() => {}
            }
        }

        let acks = inner.engine.take_acks();
        let timeout = inner.engine.publish_timeout(inner.config.request_timeout);
        let body = RequestBody::Publish(PublishRequest {
            subscription_acknowledgements: acks.clone(),
        });

        match inner.call(body, timeout).await {
            Ok(ResponseBody::Publish(response)) => {
                handle_publish_response(&inner, response).await;
            }
            Ok(other) => {
                inner.engine.restore_acks(acks);
                warn!(worker, got = other.kind(), "Unexpected response to Publish");
                tokio::time::sleep(PUBLISH_RETRY_DELAY).await;
            }
            Err(e) => {
                inner.engine.restore_acks(acks);
                match e.status() {
                    Some(StatusCode::BAD_TIMEOUT) => {
                        trace!(worker, "Publish request expired on the server");
                    }
                    Some(status)
                        if status == StatusCode::BAD_NO_SUBSCRIPTION
                            || status == StatusCode::BAD_TOO_MANY_PUBLISH_REQUESTS =>
                    {
                        debug!(worker, status = %status, "Publish refused");
                        tokio::time::sleep(PUBLISH_RETRY_DELAY).await;
                    }
                    _ if matches!(e, UaError::Timeout(_)) => {
                        trace!(worker, "Publish request timed out");
                    }
                    _ => {
                        debug!(worker, error = %e, "Publish failed");
                        tokio::time::sleep(PUBLISH_RETRY_DELAY).await;
                    }
                }
            }
        }
    }
}

// =============================================================================
// Response handling
// =============================================================================

async fn handle_publish_response<T: UaTransport>(
    inner: &Arc<ClientInner<T>>,
    response: PublishResponse,
) {
    let id = response.subscription_id;
    let message = response.notification_message;
    for (index, status) in response.results.iter().enumerate() {
        if !status.is_good() {
            trace!(subscription_id = %id, index, status = %status, "Acknowledgement rejected");
        }
    }

    let Some(sub) = inner.engine.subscription(id) else {
        if message.carries_data() {
            inner.engine.push_ack(id, message.sequence_number);
        }
        debug!(subscription_id = %id, "Publish response for unknown subscription");
        return;
    };

    let mut delivery = sub.delivery().lock().await;

    if let Some(status) = message.status_change_code() {
        if status == StatusCode::GOOD_SUBSCRIPTION_TRANSFERRED {
            sub.set_state(ClientSubscriptionState::TransferredAway);
            inner.engine.unregister(id);
            tracing::info!(subscription_id = %id, "Subscription transferred to another session");
            sub.notify(SubscriptionEvent::Transferred).await;
        } else if status.is_bad() {
            sub.set_state(ClientSubscriptionState::Terminated);
            inner.engine.unregister(id);
            warn!(subscription_id = %id, status = %status, "Subscription terminated by server");
            sub.notify(SubscriptionEvent::Terminated { status }).await;
        } else {
            sub.notify(SubscriptionEvent::StatusChange { status }).await;
        }
        return;
    }

    if message.is_keep_alive() {
        let next = message.sequence_number;
        for seq in delivery.missing_before(next) {
            recover(inner, &sub, &mut delivery, seq).await;
        }
        delivery.advance_before(next);
        sub.notify(SubscriptionEvent::KeepAlive {
            next_sequence_number: next,
        })
        .await;
        return;
    }

    let seq = message.sequence_number;
    match delivery.classify(seq) {
        Sequencing::Duplicate => {
            trace!(subscription_id = %id, seq, "Duplicate notification dropped");
            inner.engine.push_ack(id, seq);
            return;
        }
        Sequencing::Gap(missing) => {
            debug!(subscription_id = %id, seq, missing = missing.len(), "Sequence gap detected");
            for lost in missing {
                recover(inner, &sub, &mut delivery, lost).await;
            }
        }
        Sequencing::First | Sequencing::InOrder => {}
    }

    deliver(inner, &sub, message).await;
    delivery.advance(seq);
    inner.engine.push_ack(id, seq);
}

/// Fetches a missing message with Republish and delivers it.
async fn recover<T: UaTransport>(
    inner: &Arc<ClientInner<T>>,
    sub: &ClientSubscription,
    delivery: &mut DeliveryState,
    seq: u32,
) {
    let id = sub.id();
    inner.stats.record_republish();
    let body = RequestBody::Republish(RepublishRequest {
        subscription_id: id,
        retransmit_sequence_number: seq,
    });

    match inner.call(body, inner.config.request_timeout).await {
        Ok(ResponseBody::Republish(response)) => {
            debug!(subscription_id = %id, seq, "Recovered missing notification");
            deliver(inner, sub, response.notification_message).await;
            inner.engine.push_ack(id, seq);
        }
        Ok(other) => {
            warn!(subscription_id = %id, seq, got = other.kind(), "Unexpected response to Republish");
            report_lost(inner, sub, seq).await;
        }
        Err(e) => {
            warn!(subscription_id = %id, seq, error = %e, "Notification could not be recovered");
            report_lost(inner, sub, seq).await;
        }
    }
    delivery.advance(seq);
}

async fn report_lost<T: UaTransport>(inner: &ClientInner<T>, sub: &ClientSubscription, seq: u32) {
    inner.stats.record_lost();
    sub.notify(SubscriptionEvent::DataLost {
        sequence_number: seq,
    })
    .await;
}

async fn deliver<T: UaTransport>(
    inner: &ClientInner<T>,
    sub: &ClientSubscription,
    message: NotificationMessage,
) {
    let sequence_number = message.sequence_number;
    for data in message.notification_data {
        match data {
            NotificationData::DataChange(change) => {
                inner.stats.record_notification();
                sub.notify(SubscriptionEvent::DataChange {
                    sequence_number,
                    items: change.monitored_items,
                })
                .await;
            }
            NotificationData::Event(list) => {
                inner.stats.record_notification();
                sub.notify(SubscriptionEvent::Event {
                    sequence_number,
                    events: list.events,
                })
                .await;
            }
            NotificationData::StatusChange(change) => {
                sub.notify(SubscriptionEvent::StatusChange {
                    status: change.status,
                })
                .await;
            }
        }
    }
}
