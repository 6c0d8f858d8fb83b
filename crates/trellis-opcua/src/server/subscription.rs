// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Server-side subscription state machine.
//!
//! ```text
//!   Creating ──► Normal ◄──────► Late
//!                  │  ▲    (ready data, no publish request)
//!                  │  └── Transferring (ownership moves to another session)
//!                  ▼
//!               Closing ──► Terminated
//! ```
//!
//! Every publishing interval the subscription ticks:
//!
//! 1. items sample any held value whose sampling interval elapsed;
//! 2. Reporting items with queued data fire their triggering links;
//! 3. queued data becomes one or more notification messages, each taking
//!    the next sequence number, otherwise the keep-alive counter advances
//!    and an empty message is queued once it reaches the keep-alive count;
//! 4. the lifetime counter advances when no publish request was available,
//!    and the subscription expires when it reaches the lifetime count.
//!
//! Keep-alive and status-change messages carry the next sequence number
//! without consuming it.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use trellis_core::{
    AttributeId, DataValue, MonitoredItemId, MonitoringMode, NodeId, SessionId, StatusCode,
    SubscriptionId, Variant,
};

use crate::config::ServerLimits;
use crate::identity::UserIdentity;
use crate::messages::{
    DataChangeNotification, EventFieldList, EventNotificationList, MonitoredItemNotification,
    NotificationData, NotificationMessage,
};

use super::monitored_item::{ItemPayload, MonitoredItem};

// =============================================================================
// State
// =============================================================================

/// Lifecycle state of a server-side subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    /// Parameters revised, no tick yet.
    #[default]
    Creating,
    /// Publishing normally.
    Normal,
    /// Messages are ready but no publish request is available.
    Late,
    /// Ownership is moving to another session.
    Transferring,
    /// Being deleted.
    Closing,
    /// Gone.
    Terminated,
}

impl SubscriptionState {
    /// Returns `true` once the subscription is gone.
    #[inline]
    pub const fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// Returns `true` if starved of publish requests.
    #[inline]
    pub const fn is_late(&self) -> bool {
        matches!(self, Self::Late)
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Creating => "Creating",
            Self::Normal => "Normal",
            Self::Late => "Late",
            Self::Transferring => "Transferring",
            Self::Closing => "Closing",
            Self::Terminated => "Terminated",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Parameters
// =============================================================================

/// Subscription parameters, as requested or as revised.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionParams {
    /// Publishing interval.
    pub publishing_interval: Duration,
    /// Lifetime count.
    pub lifetime_count: u32,
    /// Max keep-alive count.
    pub max_keep_alive_count: u32,
    /// Notifications per message, 0 = unbounded.
    pub max_notifications_per_publish: u32,
    /// Publishing enabled.
    pub publishing_enabled: bool,
    /// Priority, higher first.
    pub priority: u8,
}

impl SubscriptionParams {
    /// Revises requested parameters against the server limits.
    ///
    /// A keep-alive count of 0 takes the server default. The lifetime count
    /// is raised to at least three keep-alive periods; it is never an error.
    pub fn revise(&self, limits: &ServerLimits) -> Self {
        let publishing_interval = self
            .publishing_interval
            .clamp(limits.min_publishing_interval, limits.max_publishing_interval);

        let max_keep_alive_count = match self.max_keep_alive_count {
            0 => limits.default_keep_alive_count,
            n => n,
        }
        .clamp(1, limits.max_keep_alive_count.max(1));

        let floor = max_keep_alive_count.saturating_mul(3);
        let lifetime_count = self
            .lifetime_count
            .max(floor)
            .min(limits.max_lifetime_count.max(floor));

        let max_notifications_per_publish = match (
            self.max_notifications_per_publish,
            limits.max_notifications_per_publish,
        ) {
            (0, cap) => cap,
            (n, 0) => n,
            (n, cap) => n.min(cap),
        };

        Self {
            publishing_interval,
            lifetime_count,
            max_keep_alive_count,
            max_notifications_per_publish,
            publishing_enabled: self.publishing_enabled,
            priority: self.priority,
        }
    }
}

/// Outcome of a publishing tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing to send.
    Idle,
    /// At least one message is waiting for a publish request.
    Ready,
    /// The lifetime count was reached; the subscription is terminated.
    Expired,
}

/// Snapshot for the subscription diagnostics inventory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionDiagnostics {
    /// Subscription id.
    pub subscription_id: SubscriptionId,
    /// Owning session, `None` when detached.
    pub session_id: Option<SessionId>,
    /// State.
    pub state: SubscriptionState,
    /// Priority.
    pub priority: u8,
    /// Revised publishing interval.
    #[serde(with = "duration_millis")]
    pub publishing_interval: Duration,
    /// Revised keep-alive count.
    pub max_keep_alive_count: u32,
    /// Revised lifetime count.
    pub lifetime_count: u32,
    /// Publishing enabled.
    pub publishing_enabled: bool,
    /// Monitored items.
    pub monitored_item_count: usize,
    /// Disabled monitored items.
    pub disabled_monitored_item_count: usize,
    /// Next sequence number.
    pub next_sequence_number: u32,
    /// Current keep-alive counter.
    pub current_keep_alive_count: u32,
    /// Current lifetime counter.
    pub current_lifetime_count: u32,
    /// Data-change notifications produced.
    pub data_change_notifications: u64,
    /// Event notifications produced.
    pub event_notifications: u64,
    /// Messages produced, keep-alives included.
    pub notification_messages: u64,
    /// Samples dropped by item queue overflow.
    pub monitoring_queue_overflow_count: u64,
    /// Ticks that found the subscription late.
    pub late_publish_count: u64,
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    data_changes: u64,
    events: u64,
    messages: u64,
    late: u64,
}

// =============================================================================
// Subscription
// =============================================================================

/// A server-side subscription.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    creation_seq: u64,
    owner: Option<SessionId>,
    owner_identity: UserIdentity,
    params: SubscriptionParams,
    state: SubscriptionState,
    items: BTreeMap<MonitoredItemId, MonitoredItem>,
    next_sequence: u32,
    keep_alive_counter: u32,
    lifetime_counter: u32,
    ready: VecDeque<(Instant, NotificationMessage)>,
    next_tick_at: Instant,
    counters: Counters,
}

impl Subscription {
    /// Creates a subscription with already revised parameters.
    pub fn new(
        id: SubscriptionId,
        creation_seq: u64,
        owner: SessionId,
        owner_identity: UserIdentity,
        params: SubscriptionParams,
        now: Instant,
    ) -> Self {
        let next_tick_at = now + params.publishing_interval;
        Self {
            id,
            creation_seq,
            owner: Some(owner),
            owner_identity,
            params,
            state: SubscriptionState::Creating,
            items: BTreeMap::new(),
            next_sequence: 1,
            keep_alive_counter: 0,
            lifetime_counter: 0,
            ready: VecDeque::new(),
            next_tick_at,
            counters: Counters::default(),
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Subscription id.
    #[inline]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Creation order, used as the last tie-break between ready subscriptions.
    #[inline]
    pub fn creation_seq(&self) -> u64 {
        self.creation_seq
    }

    /// Owning session.
    #[inline]
    pub fn owner(&self) -> Option<SessionId> {
        self.owner
    }

    /// Identity of the owning user.
    pub fn owner_identity(&self) -> &UserIdentity {
        &self.owner_identity
    }

    /// Revised parameters.
    pub fn params(&self) -> &SubscriptionParams {
        &self.params
    }

    /// Current state.
    #[inline]
    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Priority.
    #[inline]
    pub fn priority(&self) -> u8 {
        self.params.priority
    }

    /// When the next publishing tick is due.
    #[inline]
    pub fn next_tick_at(&self) -> Instant {
        self.next_tick_at
    }

    /// The sequence number the next data message will take.
    #[inline]
    pub fn next_sequence_number(&self) -> u32 {
        self.next_sequence
    }

    /// Current lifetime counter.
    #[inline]
    pub fn lifetime_counter(&self) -> u32 {
        self.lifetime_counter
    }

    /// Returns `true` if a message is waiting for a publish request.
    #[inline]
    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// When the oldest waiting message became ready.
    pub fn ready_at(&self) -> Option<Instant> {
        self.ready.front().map(|(at, _)| *at)
    }

    /// Dispatch order key: earliest ready, then higher priority, then older.
    pub fn dispatch_key(&self) -> Option<(Instant, Reverse<u8>, u64)> {
        self.ready_at()
            .map(|at| (at, Reverse(self.params.priority), self.creation_seq))
    }

    /// Monitored items.
    pub fn items(&self) -> impl Iterator<Item = &MonitoredItem> {
        self.items.values()
    }

    /// Number of monitored items.
    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Looks up an item.
    pub fn item(&self, id: MonitoredItemId) -> Option<&MonitoredItem> {
        self.items.get(&id)
    }

    /// Looks up an item for modification.
    pub fn item_mut(&mut self, id: MonitoredItemId) -> Option<&mut MonitoredItem> {
        self.items.get_mut(&id)
    }

    // -------------------------------------------------------------------------
    // Item management
    // -------------------------------------------------------------------------

    /// Adds an item.
    pub fn add_item(&mut self, item: MonitoredItem) {
        self.items.insert(item.id(), item);
    }

    /// Removes an item and every triggering link pointing at it.
    pub fn remove_item(&mut self, id: MonitoredItemId) -> Option<MonitoredItem> {
        let removed = self.items.remove(&id)?;
        for item in self.items.values_mut() {
            item.remove_link(id);
        }
        Some(removed)
    }

    /// Adds and removes triggering links of `trigger`.
    ///
    /// Returns one status per link; unknown ids fail individually with
    /// `BadMonitoredItemIdInvalid`. An unknown trigger fails the whole call.
    pub fn set_triggering(
        &mut self,
        trigger: MonitoredItemId,
        links_to_add: &[MonitoredItemId],
        links_to_remove: &[MonitoredItemId],
    ) -> Result<(Vec<StatusCode>, Vec<StatusCode>), StatusCode> {
        if !self.items.contains_key(&trigger) {
            return Err(StatusCode::BAD_MONITORED_ITEM_ID_INVALID);
        }

        let remove_results = links_to_remove
            .iter()
            .map(|id| {
                let removed = self
                    .items
                    .get_mut(&trigger)
                    .map_or(false, |item| item.remove_link(*id));
                if removed {
                    StatusCode::GOOD
                } else {
                    StatusCode::BAD_MONITORED_ITEM_ID_INVALID
                }
            })
            .collect();

        let add_results = links_to_add
            .iter()
            .map(|id| {
                if *id == trigger || !self.items.contains_key(id) {
                    return StatusCode::BAD_MONITORED_ITEM_ID_INVALID;
                }
                if let Some(item) = self.items.get_mut(&trigger) {
                    item.add_link(*id);
                }
                StatusCode::GOOD
            })
            .collect();

        Ok((add_results, remove_results))
    }

    /// Feeds a data-source value change to items watching `node`.
    pub fn on_value_changed(&mut self, node: &NodeId, value: &DataValue, now: Instant) {
        for item in self.items.values_mut() {
            let target = item.target();
            if target.attribute_id == AttributeId::Value && &target.node_id == node {
                item.on_value_changed(value.clone(), now);
            }
        }
    }

    /// Feeds an event to event items watching `node`.
    pub fn on_event(&mut self, node: &NodeId, fields: &HashMap<String, Variant>) {
        for item in self.items.values_mut() {
            let target = item.target();
            if target.attribute_id == AttributeId::EventNotifier && &target.node_id == node {
                item.on_event(fields);
            }
        }
    }

    /// Applies re-evaluated access; returns how many items changed.
    pub fn apply_access(&mut self, access: &HashMap<MonitoredItemId, bool>, now: Instant) -> usize {
        let mut changed = 0;
        for (id, granted) in access {
            if let Some(item) = self.items.get_mut(id) {
                if item.set_access(*granted, now) {
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Queues the current value of every item again (sendInitialValues).
    pub fn resend_initial_values(&mut self) {
        for item in self.items.values_mut() {
            item.resend_current();
        }
    }

    // -------------------------------------------------------------------------
    // Parameters & ownership
    // -------------------------------------------------------------------------

    /// Applies revised parameters from ModifySubscription and resets counters.
    pub fn modify(&mut self, params: SubscriptionParams, now: Instant) {
        self.params = SubscriptionParams {
            publishing_enabled: self.params.publishing_enabled,
            ..params
        };
        self.keep_alive_counter = 0;
        self.lifetime_counter = 0;
        self.next_tick_at = now + self.params.publishing_interval;
    }

    /// Enables or disables publishing. Keep-alives continue while disabled.
    pub fn set_publishing_enabled(&mut self, enabled: bool) {
        self.params.publishing_enabled = enabled;
    }

    /// Detaches from the owning session; the subscription lives on until
    /// transferred or expired.
    pub fn detach(&mut self) {
        tracing::debug!(subscription_id = %self.id, "Subscription detached from session");
        self.owner = None;
    }

    /// Marks the start of an ownership transfer.
    pub fn begin_transfer(&mut self) {
        self.state = SubscriptionState::Transferring;
    }

    /// Completes a transfer to `owner`.
    pub fn complete_transfer(&mut self, owner: SessionId, identity: UserIdentity) {
        self.owner = Some(owner);
        self.owner_identity = identity;
        self.lifetime_counter = 0;
        self.state = if self.ready.is_empty() {
            SubscriptionState::Normal
        } else {
            SubscriptionState::Late
        };
    }

    /// Updates the owner identity after a re-activation.
    pub fn set_owner_identity(&mut self, identity: UserIdentity) {
        self.owner_identity = identity;
    }

    // -------------------------------------------------------------------------
    // Publishing
    // -------------------------------------------------------------------------

    /// Runs one publishing cycle.
    pub fn tick(&mut self, now: Instant, publish_available: bool) -> TickOutcome {
        if self.state.is_terminated() {
            return TickOutcome::Expired;
        }
        self.advance_deadline(now);
        if self.state == SubscriptionState::Creating {
            self.state = SubscriptionState::Normal;
        }

        for item in self.items.values_mut() {
            item.sample_if_due(now);
        }

        let queued_data = if self.params.publishing_enabled {
            let notifications = self.collect(now);
            if notifications.is_empty() {
                false
            } else {
                self.queue_data(notifications, now);
                true
            }
        } else {
            false
        };

        if queued_data {
            self.keep_alive_counter = 0;
        } else if self.ready.is_empty() {
            self.keep_alive_counter += 1;
            if self.keep_alive_counter >= self.params.max_keep_alive_count {
                self.keep_alive_counter = 0;
                let message = NotificationMessage::keep_alive(self.next_sequence);
                self.ready.push_back((now, message));
                self.counters.messages += 1;
                tracing::trace!(subscription_id = %self.id, next = self.next_sequence, "Keep-alive queued");
            }
        }

        if publish_available {
            self.lifetime_counter = 0;
        } else {
            self.lifetime_counter += 1;
            if self.lifetime_counter >= self.params.lifetime_count {
                tracing::info!(
                    subscription_id = %self.id,
                    lifetime_count = self.params.lifetime_count,
                    "Subscription lifetime expired"
                );
                self.terminate();
                return TickOutcome::Expired;
            }
            if !self.ready.is_empty() && self.state == SubscriptionState::Normal {
                self.state = SubscriptionState::Late;
                self.counters.late += 1;
                tracing::debug!(subscription_id = %self.id, "Subscription is late");
            }
        }

        if self.ready.is_empty() {
            TickOutcome::Idle
        } else {
            TickOutcome::Ready
        }
    }

    /// Queues what reporting items hold without waiting for the next tick.
    ///
    /// Used when items switch into Reporting. The publishing cadence is
    /// left as it is. Returns `true` if a message was queued.
    pub fn flush_reported(&mut self, now: Instant) -> bool {
        if !self.params.publishing_enabled || self.state.is_terminated() {
            return false;
        }
        let notifications = self.collect(now);
        if notifications.is_empty() {
            return false;
        }
        self.queue_data(notifications, now);
        self.keep_alive_counter = 0;
        true
    }

    /// Records that a publish request arrived for the owning session.
    pub fn on_publish_request(&mut self) {
        self.lifetime_counter = 0;
    }

    /// Takes the oldest waiting message.
    pub fn take_message(&mut self) -> Option<NotificationMessage> {
        let (_, message) = self.ready.pop_front()?;
        self.lifetime_counter = 0;
        if self.ready.is_empty() && self.state.is_late() {
            self.state = SubscriptionState::Normal;
        }
        Some(message)
    }

    /// Consumes a sequence number; wraps from `u32::MAX` to 1.
    fn consume_sequence(&mut self) -> u32 {
        let seq = self.next_sequence;
        self.next_sequence = if seq == u32::MAX { 1 } else { seq + 1 };
        seq
    }

    fn advance_deadline(&mut self, now: Instant) {
        self.next_tick_at += self.params.publishing_interval;
        if self.next_tick_at <= now {
            self.next_tick_at = now + self.params.publishing_interval;
        }
    }

    /// Drains reportable items, firing triggering links first.
    fn collect(&mut self, now: Instant) -> Vec<(u32, ItemPayload)> {
        let triggered: BTreeSet<MonitoredItemId> = self
            .items
            .values()
            .filter(|item| item.mode() == MonitoringMode::Reporting && item.has_queued())
            .flat_map(|item| item.links())
            .collect();

        for id in &triggered {
            if let Some(item) = self.items.get_mut(id) {
                if item.mode() == MonitoringMode::Sampling {
                    item.force_sample(now);
                }
            }
        }

        let mut notifications = Vec::new();
        for (id, item) in self.items.iter_mut() {
            let report = match item.mode() {
                MonitoringMode::Reporting => true,
                MonitoringMode::Sampling => triggered.contains(id),
                MonitoringMode::Disabled => false,
            };
            if report && item.has_queued() {
                let handle = item.client_handle();
                notifications.extend(item.drain().into_iter().map(|p| (handle, p)));
            }
        }
        notifications
    }

    fn queue_data(&mut self, notifications: Vec<(u32, ItemPayload)>, now: Instant) {
        // A waiting keep-alive is stale once data is queued behind it.
        self.ready.retain(|(_, m)| !m.is_keep_alive());

        let cap = match self.params.max_notifications_per_publish {
            0 => notifications.len().max(1),
            n => n as usize,
        };

        let mut remaining = notifications.into_iter().peekable();
        while remaining.peek().is_some() {
            let mut data_change = DataChangeNotification::default();
            let mut events = EventNotificationList::default();
            for (client_handle, payload) in remaining.by_ref().take(cap) {
                match payload {
                    ItemPayload::Value(value) => data_change
                        .monitored_items
                        .push(MonitoredItemNotification { client_handle, value }),
                    ItemPayload::Event(event_fields) => events.events.push(EventFieldList {
                        client_handle,
                        event_fields,
                    }),
                }
            }

            self.counters.data_changes += data_change.monitored_items.len() as u64;
            self.counters.events += events.events.len() as u64;

            let mut notification_data = Vec::with_capacity(2);
            if !data_change.monitored_items.is_empty() {
                notification_data.push(NotificationData::DataChange(data_change));
            }
            if !events.events.is_empty() {
                notification_data.push(NotificationData::Event(events));
            }

            let message = NotificationMessage {
                sequence_number: self.consume_sequence(),
                publish_time: Utc::now(),
                notification_data,
            };
            tracing::trace!(
                subscription_id = %self.id,
                sequence_number = message.sequence_number,
                "Notification message queued"
            );
            self.counters.messages += 1;
            self.ready.push_back((now, message));
        }
    }

    // -------------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------------

    /// Starts deletion.
    pub fn close(&mut self) {
        if !self.state.is_terminated() {
            self.state = SubscriptionState::Closing;
            self.terminate();
        }
    }

    /// Terminates the subscription and releases its items.
    ///
    /// Idempotent; returns `false` if it was already terminated.
    pub fn terminate(&mut self) -> bool {
        if self.state.is_terminated() {
            return false;
        }
        self.state = SubscriptionState::Terminated;
        let released = self.items.len();
        self.items.clear();
        self.ready.clear();
        tracing::debug!(subscription_id = %self.id, released, "Subscription terminated");
        true
    }

    /// Diagnostics snapshot.
    pub fn diagnostics(&self) -> SubscriptionDiagnostics {
        SubscriptionDiagnostics {
            subscription_id: self.id,
            session_id: self.owner,
            state: self.state,
            priority: self.params.priority,
            publishing_interval: self.params.publishing_interval,
            max_keep_alive_count: self.params.max_keep_alive_count,
            lifetime_count: self.params.lifetime_count,
            publishing_enabled: self.params.publishing_enabled,
            monitored_item_count: self.items.len(),
            disabled_monitored_item_count: self
                .items
                .values()
                .filter(|i| i.mode() == MonitoringMode::Disabled)
                .count(),
            next_sequence_number: self.next_sequence,
            current_keep_alive_count: self.keep_alive_counter,
            current_lifetime_count: self.lifetime_counter,
            data_change_notifications: self.counters.data_changes,
            event_notifications: self.counters.events,
            notification_messages: self.counters.messages,
            monitoring_queue_overflow_count: self.items.values().map(|i| i.lost_count()).sum(),
            late_publish_count: self.counters.late,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{ChangeDetector, ResolvedFilter};
    use crate::server::monitored_item::{ItemSettings, ItemTarget};
    use trellis_core::{DataKind, TimestampsToReturn};

    fn params(keep_alive: u32, lifetime: u32) -> SubscriptionParams {
        SubscriptionParams {
            publishing_interval: Duration::from_millis(100),
            lifetime_count: lifetime,
            max_keep_alive_count: keep_alive,
            max_notifications_per_publish: 0,
            publishing_enabled: true,
            priority: 0,
        }
    }

    fn subscription(p: SubscriptionParams, now: Instant) -> Subscription {
        Subscription::new(
            SubscriptionId(1),
            1,
            SessionId(1),
            UserIdentity::anonymous(),
            p,
            now,
        )
    }

    fn item(id: u32, node: u32, mode: MonitoringMode, now: Instant) -> MonitoredItem {
        MonitoredItem::new(
            MonitoredItemId(id),
            ItemTarget {
                node_id: NodeId::numeric(2, node),
                attribute_id: AttributeId::Value,
                index_range: None,
            },
            ItemSettings {
                client_handle: id * 10,
                mode,
                sampling_interval: Duration::ZERO,
                queue_size: 1,
                discard_oldest: true,
                filter: ResolvedFilter::DataChange(ChangeDetector::plain(Some(DataKind::Int32))),
                timestamps: TimestampsToReturn::Both,
            },
            true,
            Some(DataValue::new(0i32)),
            now,
        )
    }

    fn handles(message: &NotificationMessage) -> Vec<u32> {
        message
            .notification_data
            .iter()
            .flat_map(|d| match d {
                NotificationData::DataChange(dc) => {
                    dc.monitored_items.iter().map(|n| n.client_handle).collect()
                }
                _ => Vec::new(),
            })
            .collect()
    }

    #[test]
    fn test_revision_rules() {
        let limits = ServerLimits::default();
        let revised = params(10, 5).revise(&limits);
        assert_eq!(revised.max_keep_alive_count, 10);
        assert_eq!(revised.lifetime_count, 30);

        let revised = params(0, 0).revise(&limits);
        assert_eq!(revised.max_keep_alive_count, limits.default_keep_alive_count);
        assert!(revised.lifetime_count >= 3 * revised.max_keep_alive_count);

        let mut fast = params(1, 3);
        fast.publishing_interval = Duration::from_millis(1);
        assert_eq!(
            fast.revise(&limits).publishing_interval,
            limits.min_publishing_interval
        );
    }

    #[test]
    fn test_keep_alive_after_k_empty_cycles() {
        let start = Instant::now();
        let mut sub = subscription(params(3, 100), start);
        let mut now = start;
        for cycle in 1..=3 {
            now += Duration::from_millis(100);
            let outcome = sub.tick(now, true);
            if cycle < 3 {
                assert_eq!(outcome, TickOutcome::Idle);
            } else {
                assert_eq!(outcome, TickOutcome::Ready);
            }
        }
        let ka = sub.take_message().unwrap();
        assert!(ka.is_keep_alive());
        assert_eq!(ka.sequence_number, 1);
        assert!(!sub.has_ready());

        for _ in 0..2 {
            now += Duration::from_millis(100);
            assert_eq!(sub.tick(now, true), TickOutcome::Idle);
        }
    }

    #[test]
    fn test_data_consumes_sequence_numbers() {
        let start = Instant::now();
        let mut sub = subscription(params(5, 100), start);
        sub.add_item(item(1, 1, MonitoringMode::Reporting, start));
        let now = start + Duration::from_millis(100);
        assert_eq!(sub.tick(now, true), TickOutcome::Ready);
        let first = sub.take_message().unwrap();
        assert_eq!(first.sequence_number, 1);
        assert!(first.carries_data());
        assert_eq!(sub.next_sequence_number(), 2);
    }

    #[test]
    fn test_notification_cap_splits_messages() {
        let start = Instant::now();
        let mut p = params(5, 100);
        p.max_notifications_per_publish = 2;
        let mut sub = subscription(p, start);
        for id in 1..=5 {
            sub.add_item(item(id, id, MonitoringMode::Reporting, start));
        }
        sub.tick(start + Duration::from_millis(100), true);
        let sizes: Vec<usize> = std::iter::from_fn(|| sub.take_message())
            .map(|m| handles(&m).len())
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(sub.next_sequence_number(), 4);
    }

    #[test]
    fn test_lifetime_expiry_and_late_state() {
        let start = Instant::now();
        let mut sub = subscription(params(1, 3), start);
        let mut now = start + Duration::from_millis(100);
        assert_eq!(sub.tick(now, false), TickOutcome::Ready);
        assert!(sub.state().is_late());
        now += Duration::from_millis(100);
        assert_eq!(sub.tick(now, false), TickOutcome::Ready);
        now += Duration::from_millis(100);
        assert_eq!(sub.tick(now, false), TickOutcome::Expired);
        assert!(sub.state().is_terminated());
        assert!(!sub.terminate());
    }

    #[test]
    fn test_publish_arrival_resets_lifetime() {
        let start = Instant::now();
        let mut sub = subscription(params(10, 30), start);
        let mut now = start;
        for _ in 0..29 {
            now += Duration::from_millis(100);
            assert_ne!(sub.tick(now, false), TickOutcome::Expired);
        }
        sub.on_publish_request();
        assert_eq!(sub.lifetime_counter(), 0);
    }

    #[test]
    fn test_triggering_reports_linked_sampling_items() {
        let start = Instant::now();
        let mut sub = subscription(params(100, 300), start);
        sub.add_item(item(1, 1, MonitoringMode::Reporting, start));
        sub.add_item(item(2, 2, MonitoringMode::Sampling, start));
        sub.add_item(item(3, 3, MonitoringMode::Sampling, start));
        let (added, _) = sub
            .set_triggering(
                MonitoredItemId(1),
                &[MonitoredItemId(2), MonitoredItemId(3), MonitoredItemId(99)],
                &[],
            )
            .unwrap();
        assert_eq!(
            added,
            vec![
                StatusCode::GOOD,
                StatusCode::GOOD,
                StatusCode::BAD_MONITORED_ITEM_ID_INVALID
            ]
        );

        let mut now = start + Duration::from_millis(100);
        sub.tick(now, true);
        assert_eq!(handles(&sub.take_message().unwrap()), vec![10, 20, 30]);

        sub.on_value_changed(&NodeId::numeric(2, 2), &DataValue::new(5i32), now);
        now += Duration::from_millis(100);
        assert_eq!(sub.tick(now, true), TickOutcome::Idle);

        // Only the first linked item changed; the second still reports.
        sub.on_value_changed(&NodeId::numeric(2, 1), &DataValue::new(1i32), now);
        now += Duration::from_millis(100);
        assert_eq!(sub.tick(now, true), TickOutcome::Ready);
        let message = sub.take_message().unwrap();
        assert_eq!(handles(&message), vec![10, 20, 30]);
        assert_eq!(sub.item(MonitoredItemId(2)).unwrap().queue_len(), 0);
        assert_eq!(sub.item(MonitoredItemId(3)).unwrap().queue_len(), 0);
    }

    #[test]
    fn test_reporting_switch_flushes_without_tick() {
        let start = Instant::now();
        let mut sub = subscription(params(10, 30), start);
        let mut sampled = item(1, 1, MonitoringMode::Sampling, start);
        assert!(sampled.has_queued());
        assert!(!sub.flush_reported(start));

        sampled.set_mode(MonitoringMode::Reporting, start);
        sub.add_item(sampled);
        let next_tick = sub.next_tick_at();
        assert!(sub.flush_reported(start));
        assert_eq!(sub.next_tick_at(), next_tick);
        assert_eq!(handles(&sub.take_message().unwrap()), vec![10]);
        assert!(!sub.flush_reported(start));
    }

    #[test]
    fn test_remove_item_drops_links() {
        let start = Instant::now();
        let mut sub = subscription(params(10, 30), start);
        sub.add_item(item(1, 1, MonitoringMode::Reporting, start));
        sub.add_item(item(2, 2, MonitoringMode::Sampling, start));
        sub.set_triggering(MonitoredItemId(1), &[MonitoredItemId(2)], &[])
            .unwrap();
        sub.remove_item(MonitoredItemId(2));
        assert_eq!(sub.item(MonitoredItemId(1)).unwrap().links().count(), 0);
        assert_eq!(
            sub.set_triggering(MonitoredItemId(2), &[], &[]),
            Err(StatusCode::BAD_MONITORED_ITEM_ID_INVALID)
        );
    }

    #[test]
    fn test_sequence_wraps_to_one() {
        let start = Instant::now();
        let mut sub = subscription(params(10, 30), start);
        sub.next_sequence = u32::MAX;
        assert_eq!(sub.consume_sequence(), u32::MAX);
        assert_eq!(sub.consume_sequence(), 1);
    }

    #[test]
    fn test_stale_keep_alive_replaced_by_data() {
        let start = Instant::now();
        let mut sub = subscription(params(1, 100), start);
        sub.add_item(item(1, 1, MonitoringMode::Reporting, start));
        let mut now = start + Duration::from_millis(100);
        sub.tick(now, false);
        sub.take_message();
        now += Duration::from_millis(100);
        sub.tick(now, false);
        assert!(sub.ready.front().unwrap().1.is_keep_alive());

        sub.on_value_changed(&NodeId::numeric(2, 1), &DataValue::new(9i32), now);
        now += Duration::from_millis(100);
        sub.tick(now, false);
        assert_eq!(sub.ready.len(), 1);
        assert!(sub.take_message().unwrap().carries_data());
    }
}
