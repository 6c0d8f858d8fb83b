// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Client-side view of a subscription.
//!
//! A [`ClientSubscription`] remembers everything needed to deliver its
//! notifications in order and to rebuild it on a new session: requested
//! settings, the monitored items keyed by client handle, triggering links
//! and the last delivered sequence number.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use trellis_core::{
    MonitoredItemId, MonitoringMode, StatusCode, SubscriptionId, TimestampsToReturn,
};

use crate::config::SubscriptionSettings;
use crate::messages::{EventFieldList, MonitoredItemCreateRequest, MonitoredItemNotification};

/// Longest gap recovered by republishing; older messages are reported lost.
const MAX_RECOVERABLE_GAP: u32 = 256;

// =============================================================================
// Events and Listeners
// =============================================================================

/// Per-subscription events, delivered in sequence order.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// Data changes of one notification message.
    DataChange {
        /// Sequence number of the message.
        sequence_number: u32,
        /// Changed items.
        items: Vec<MonitoredItemNotification>,
    },

    /// Events of one notification message.
    Event {
        /// Sequence number of the message.
        sequence_number: u32,
        /// Event field lists.
        events: Vec<EventFieldList>,
    },

    /// The subscription is alive but had nothing to report.
    KeepAlive {
        /// Sequence number the next data message will carry.
        next_sequence_number: u32,
    },

    /// A status change that does not end the subscription.
    StatusChange {
        /// Reported status.
        status: StatusCode,
    },

    /// A message could not be recovered.
    DataLost {
        /// Sequence number of the lost message.
        sequence_number: u32,
    },

    /// Another session took the subscription over.
    Transferred,

    /// The server discarded the subscription.
    Terminated {
        /// Terminating status.
        status: StatusCode,
    },

    /// The subscription was created again after a failed transfer.
    Recreated {
        /// Id before recreation.
        old_id: SubscriptionId,
        /// Id after recreation.
        new_id: SubscriptionId,
    },
}

/// Receives subscription events.
#[async_trait]
pub trait SubscriptionListener: Send + Sync {
    /// Called once per event, in delivery order.
    async fn on_event(&self, subscription_id: SubscriptionId, event: SubscriptionEvent);
}

/// A listener forwarding events into an mpsc channel.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    sender: mpsc::Sender<SubscriptionEvent>,
}

impl ChannelListener {
    /// Creates a listener around an existing sender.
    pub fn new(sender: mpsc::Sender<SubscriptionEvent>) -> Self {
        Self { sender }
    }

    /// Creates a listener and its receiver.
    pub fn with_channel(capacity: usize) -> (Self, mpsc::Receiver<SubscriptionEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl SubscriptionListener for ChannelListener {
    async fn on_event(&self, _subscription_id: SubscriptionId, event: SubscriptionEvent) {
        let _ = self.sender.send(event).await;
    }
}

// =============================================================================
// State
// =============================================================================

/// Lifecycle of a client subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ClientSubscriptionState {
    /// Delivering notifications.
    #[default]
    Active,
    /// Another session owns it now.
    TransferredAway,
    /// Gone on the server.
    Terminated,
}

impl ClientSubscriptionState {
    /// Returns `true` if notifications are still expected.
    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for ClientSubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::TransferredAway => write!(f, "TransferredAway"),
            Self::Terminated => write!(f, "Terminated"),
        }
    }
}

/// Parameters revised by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevisedParameters {
    /// Publishing interval.
    pub publishing_interval: Duration,
    /// Lifetime count.
    pub lifetime_count: u32,
    /// Keep-alive count.
    pub max_keep_alive_count: u32,
}

impl RevisedParameters {
    /// Longest silence the server may keep before a keep-alive.
    pub fn keep_alive_period(&self) -> Duration {
        self.publishing_interval
            .saturating_mul(self.max_keep_alive_count.max(1))
    }
}

/// A monitored item as the client knows it.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientMonitoredItem {
    /// Client handle, stable across recreation.
    pub client_handle: u32,
    /// Server-assigned id.
    pub monitored_item_id: MonitoredItemId,
    /// The request that created it, kept for recreation.
    pub request: MonitoredItemCreateRequest,
    /// Revised sampling interval.
    pub revised_sampling_interval: Duration,
    /// Revised queue size.
    pub revised_queue_size: u32,
    /// Timestamps requested at creation.
    pub timestamps_to_return: TimestampsToReturn,
}

impl ClientMonitoredItem {
    /// Current monitoring mode.
    pub fn mode(&self) -> MonitoringMode {
        self.request.monitoring_mode
    }
}

// =============================================================================
// Sequence Tracking
// =============================================================================

/// How a data message's sequence number relates to what was delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Sequencing {
    /// Nothing delivered yet.
    First,
    /// The next expected number.
    InOrder,
    /// Already delivered.
    Duplicate,
    /// Newer than expected; the listed numbers are missing.
    Gap(Vec<u32>),
}

/// Sequence numbers skip 0 when they wrap.
pub(crate) fn next_after(seq: u32) -> u32 {
    if seq == u32::MAX {
        1
    } else {
        seq + 1
    }
}

fn previous_of(seq: u32) -> u32 {
    if seq <= 1 {
        u32::MAX
    } else {
        seq - 1
    }
}

fn is_newer(candidate: u32, reference: u32) -> bool {
    let distance = candidate.wrapping_sub(reference);
    distance != 0 && distance < u32::MAX / 2
}

/// Delivery cursor of one subscription.
#[derive(Debug, Default)]
pub(crate) struct DeliveryState {
    last_sequence: Option<u32>,
}

impl DeliveryState {
    pub(crate) fn last_sequence(&self) -> Option<u32> {
        self.last_sequence
    }

    pub(crate) fn classify(&self, seq: u32) -> Sequencing {
        let Some(last) = self.last_sequence else {
            return Sequencing::First;
        };
        let expected = next_after(last);
        if seq == expected {
            Sequencing::InOrder
        } else if is_newer(seq, last) {
            Sequencing::Gap(Self::range(expected, seq))
        } else {
            Sequencing::Duplicate
        }
    }

    /// Numbers a keep-alive announcing `next` implies were sent but not seen.
    pub(crate) fn missing_before(&self, next: u32) -> Vec<u32> {
        match self.last_sequence {
            Some(last) if is_newer(next, next_after(last)) => Self::range(next_after(last), next),
            _ => Vec::new(),
        }
    }

    /// Moves the cursor to `seq` if it is newer.
    pub(crate) fn advance(&mut self, seq: u32) {
        match self.last_sequence {
            Some(last) if !is_newer(seq, last) => {}
            _ => self.last_sequence = Some(seq),
        }
    }

    /// Moves the cursor to just before `next`, if anything was delivered.
    pub(crate) fn advance_before(&mut self, next: u32) {
        if self.last_sequence.is_some() {
            self.advance(previous_of(next));
        }
    }

    pub(crate) fn reset(&mut self) {
        self.last_sequence = None;
    }

    fn range(from: u32, to_exclusive: u32) -> Vec<u32> {
        let mut missing = Vec::new();
        let mut seq = from;
        while seq != to_exclusive && missing.len() < MAX_RECOVERABLE_GAP as usize {
            missing.push(seq);
            seq = next_after(seq);
        }
        missing
    }
}

// =============================================================================
// ClientSubscription
// =============================================================================

/// A subscription owned by a [`UaClient`](super::UaClient).
pub struct ClientSubscription {
    server_id: AtomicU32,
    settings: RwLock<SubscriptionSettings>,
    revised: RwLock<RevisedParameters>,
    items: RwLock<BTreeMap<u32, ClientMonitoredItem>>,
    triggers: RwLock<BTreeMap<u32, BTreeSet<u32>>>,
    listeners: RwLock<Vec<Arc<dyn SubscriptionListener>>>,
    delivery: Mutex<DeliveryState>,
    state: RwLock<ClientSubscriptionState>,
    next_client_handle: AtomicU32,
}

impl ClientSubscription {
    pub(crate) fn new(
        id: SubscriptionId,
        settings: SubscriptionSettings,
        revised: RevisedParameters,
    ) -> Self {
        Self {
            server_id: AtomicU32::new(id.0),
            settings: RwLock::new(settings),
            revised: RwLock::new(revised),
            items: RwLock::new(BTreeMap::new()),
            triggers: RwLock::new(BTreeMap::new()),
            listeners: RwLock::new(Vec::new()),
            delivery: Mutex::new(DeliveryState::default()),
            state: RwLock::new(ClientSubscriptionState::Active),
            next_client_handle: AtomicU32::new(1),
        }
    }

    /// Current server-side id. Changes if the subscription is recreated.
    pub fn id(&self) -> SubscriptionId {
        SubscriptionId(self.server_id.load(Ordering::Acquire))
    }

    /// Requested settings.
    pub fn settings(&self) -> SubscriptionSettings {
        self.settings.read().clone()
    }

    /// Server-revised parameters.
    pub fn revised(&self) -> RevisedParameters {
        *self.revised.read()
    }

    /// Lifecycle state.
    pub fn state(&self) -> ClientSubscriptionState {
        *self.state.read()
    }

    /// Returns `true` if notifications are still expected.
    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// Registers a listener.
    pub fn add_listener(&self, listener: Arc<dyn SubscriptionListener>) {
        self.listeners.write().push(listener);
    }

    /// The item with `client_handle`.
    pub fn item(&self, client_handle: u32) -> Option<ClientMonitoredItem> {
        self.items.read().get(&client_handle).cloned()
    }

    /// All items ordered by client handle.
    pub fn items(&self) -> Vec<ClientMonitoredItem> {
        self.items.read().values().cloned().collect()
    }

    /// Number of items.
    pub fn item_count(&self) -> usize {
        self.items.read().len()
    }

    /// Items linked to the trigger with `client_handle`.
    pub fn triggered_by(&self, client_handle: u32) -> Vec<u32> {
        self.triggers
            .read()
            .get(&client_handle)
            .map(|links| links.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Delivered sequence cursor.
    pub async fn last_sequence_number(&self) -> Option<u32> {
        self.delivery.lock().await.last_sequence()
    }

    // -------------------------------------------------------------------------
    // Crate-internal bookkeeping
    // -------------------------------------------------------------------------

    pub(crate) fn allocate_client_handle(&self) -> u32 {
        self.next_client_handle.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn server_item_id(&self, client_handle: u32) -> Option<MonitoredItemId> {
        self.items
            .read()
            .get(&client_handle)
            .map(|item| item.monitored_item_id)
    }

    pub(crate) fn set_id(&self, id: SubscriptionId) {
        self.server_id.store(id.0, Ordering::Release);
    }

    pub(crate) fn set_settings(&self, settings: SubscriptionSettings) {
        *self.settings.write() = settings;
    }

    pub(crate) fn set_revised(&self, revised: RevisedParameters) {
        *self.revised.write() = revised;
    }

    pub(crate) fn set_state(&self, state: ClientSubscriptionState) {
        *self.state.write() = state;
    }

    pub(crate) fn insert_item(&self, item: ClientMonitoredItem) {
        self.items.write().insert(item.client_handle, item);
    }

    pub(crate) fn update_item(&self, client_handle: u32, update: impl FnOnce(&mut ClientMonitoredItem)) {
        if let Some(item) = self.items.write().get_mut(&client_handle) {
            update(item);
        }
    }

    pub(crate) fn remove_item(&self, client_handle: u32) {
        self.items.write().remove(&client_handle);
        let mut triggers = self.triggers.write();
        triggers.remove(&client_handle);
        for links in triggers.values_mut() {
            links.remove(&client_handle);
        }
    }

    pub(crate) fn link(&self, trigger: u32, linked: u32) {
        self.triggers.write().entry(trigger).or_default().insert(linked);
    }

    pub(crate) fn unlink(&self, trigger: u32, linked: u32) {
        let mut triggers = self.triggers.write();
        if let Some(links) = triggers.get_mut(&trigger) {
            links.remove(&linked);
            if links.is_empty() {
                triggers.remove(&trigger);
            }
        }
    }

    pub(crate) fn trigger_links(&self) -> Vec<(u32, Vec<u32>)> {
        self.triggers
            .read()
            .iter()
            .map(|(trigger, links)| (*trigger, links.iter().copied().collect()))
            .collect()
    }

    pub(crate) fn delivery(&self) -> &Mutex<DeliveryState> {
        &self.delivery
    }

    /// Delivers `event` to every listener, in registration order.
    pub(crate) async fn notify(&self, event: SubscriptionEvent) {
        let listeners: Vec<_> = self.listeners.read().iter().cloned().collect();
        let id = self.id();
        for listener in listeners {
            listener.on_event(id, event.clone()).await;
        }
    }
}

impl fmt::Debug for ClientSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSubscription")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("items", &self.item_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor(last: u32) -> DeliveryState {
        let mut state = DeliveryState::default();
        state.advance(last);
        state
    }

    #[test]
    fn test_classify() {
        assert_eq!(DeliveryState::default().classify(7), Sequencing::First);
        assert_eq!(cursor(3).classify(4), Sequencing::InOrder);
        assert_eq!(cursor(3).classify(3), Sequencing::Duplicate);
        assert_eq!(cursor(3).classify(2), Sequencing::Duplicate);
        assert_eq!(cursor(3).classify(6), Sequencing::Gap(vec![4, 5]));
    }

    #[test]
    fn test_wraparound_skips_zero() {
        assert_eq!(next_after(u32::MAX), 1);
        assert_eq!(cursor(u32::MAX).classify(1), Sequencing::InOrder);
        assert_eq!(cursor(u32::MAX - 1).classify(1), Sequencing::Gap(vec![u32::MAX]));
    }

    #[test]
    fn test_keep_alive_reveals_missing() {
        let state = cursor(3);
        assert!(state.missing_before(4).is_empty());
        assert_eq!(state.missing_before(6), vec![4, 5]);
        assert!(DeliveryState::default().missing_before(9).is_empty());

        let mut state = cursor(3);
        state.advance_before(6);
        assert_eq!(state.last_sequence(), Some(5));
        state.advance(2);
        assert_eq!(state.last_sequence(), Some(5));
    }

    #[tokio::test]
    async fn test_listener_and_links() {
        let sub = ClientSubscription::new(
            SubscriptionId(4),
            SubscriptionSettings::default(),
            RevisedParameters {
                publishing_interval: Duration::from_millis(100),
                lifetime_count: 30,
                max_keep_alive_count: 10,
            },
        );
        let (listener, mut rx) = ChannelListener::with_channel(4);
        sub.add_listener(Arc::new(listener));
        sub.notify(SubscriptionEvent::KeepAlive {
            next_sequence_number: 1,
        })
        .await;
        assert_eq!(
            rx.recv().await,
            Some(SubscriptionEvent::KeepAlive {
                next_sequence_number: 1
            })
        );

        sub.link(1, 2);
        sub.link(1, 3);
        assert_eq!(sub.triggered_by(1), vec![2, 3]);
        sub.remove_item(2);
        assert_eq!(sub.triggered_by(1), vec![3]);
        sub.unlink(1, 3);
        assert!(sub.trigger_links().is_empty());
        assert_eq!(sub.revised().keep_alive_period(), Duration::from_secs(1));
    }
}
