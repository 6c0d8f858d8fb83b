// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Server-side monitored item.
//!
//! An item turns raw value changes (or events) from the data source into
//! queued notifications:
//!
//! ```text
//!  on_value_changed ──► index range ──► sampling gate ──► filter ──► bounded queue
//!                                          │                           │
//!                        pending until due ┘          overflow: loss++ ┘
//! ```
//!
//! The queue is drained by the owning subscription on its publishing tick,
//! but only while the item is `Reporting` or when a triggering item fires.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use trellis_core::{
    AttributeId, DataValue, MonitoredItemId, MonitoringMode, NodeId, NumericRange, StatusCode,
    TimestampsToReturn, Variant,
};

use crate::filter::ResolvedFilter;

// =============================================================================
// Types
// =============================================================================

/// What an item monitors.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemTarget {
    /// Monitored node.
    pub node_id: NodeId,
    /// Monitored attribute.
    pub attribute_id: AttributeId,
    /// Sub-range of an array or string value.
    pub index_range: Option<NumericRange>,
}

/// Revised item parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemSettings {
    /// Client handle echoed in notifications.
    pub client_handle: u32,
    /// Monitoring mode.
    pub mode: MonitoringMode,
    /// Revised sampling interval; zero samples on every change.
    pub sampling_interval: Duration,
    /// Revised queue size, at least 1.
    pub queue_size: u32,
    /// Overflow policy.
    pub discard_oldest: bool,
    /// Resolved filter.
    pub filter: ResolvedFilter,
    /// Timestamps attached to reported values.
    pub timestamps: TimestampsToReturn,
}

/// A queued notification.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemPayload {
    /// A data change.
    Value(DataValue),
    /// Selected event fields.
    Event(Vec<Variant>),
}

impl ItemPayload {
    fn mark_overflow(&mut self) {
        if let Self::Value(value) = self {
            value.status = value.status.with_overflow();
        }
    }
}

// =============================================================================
// MonitoredItem
// =============================================================================

/// A server-side monitored item.
#[derive(Debug)]
pub struct MonitoredItem {
    id: MonitoredItemId,
    target: ItemTarget,
    settings: ItemSettings,
    queue: VecDeque<ItemPayload>,
    /// Last sample accepted by the filter; the filter compares against it.
    last_accepted: Option<DataValue>,
    /// Latest value seen from the data source, after the index range.
    latest: Option<DataValue>,
    sample_pending: bool,
    next_sample_at: Option<Instant>,
    access_granted: bool,
    links: BTreeSet<MonitoredItemId>,
    lost: u64,
}

impl MonitoredItem {
    /// Creates an item and takes its initial sample.
    pub fn new(
        id: MonitoredItemId,
        target: ItemTarget,
        settings: ItemSettings,
        access_granted: bool,
        current: Option<DataValue>,
        now: Instant,
    ) -> Self {
        let mut item = Self {
            id,
            target,
            settings,
            queue: VecDeque::new(),
            last_accepted: None,
            latest: None,
            sample_pending: false,
            next_sample_at: None,
            access_granted,
            links: BTreeSet::new(),
            lost: 0,
        };
        item.latest = Some(match current {
            Some(value) => item.apply_range(value),
            None => DataValue::from_status(StatusCode::BAD_WAITING_FOR_INITIAL_DATA),
        });
        if item.settings.mode.is_sampling() {
            item.initial_sample(now);
        }
        item
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Server-assigned id.
    #[inline]
    pub fn id(&self) -> MonitoredItemId {
        self.id
    }

    /// Client handle.
    #[inline]
    pub fn client_handle(&self) -> u32 {
        self.settings.client_handle
    }

    /// Monitored target.
    pub fn target(&self) -> &ItemTarget {
        &self.target
    }

    /// Current settings.
    pub fn settings(&self) -> &ItemSettings {
        &self.settings
    }

    /// Monitoring mode.
    #[inline]
    pub fn mode(&self) -> MonitoringMode {
        self.settings.mode
    }

    /// Returns `true` for event items.
    pub fn is_event(&self) -> bool {
        matches!(self.settings.filter, ResolvedFilter::Event(_))
    }

    /// Returns `true` if the current identity may see this item's data.
    #[inline]
    pub fn access_granted(&self) -> bool {
        self.access_granted
    }

    /// Number of samples dropped by queue overflow.
    #[inline]
    pub fn lost_count(&self) -> u64 {
        self.lost
    }

    /// Number of queued notifications.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Returns `true` if notifications are queued.
    pub fn has_queued(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Items this item triggers.
    pub fn links(&self) -> impl Iterator<Item = MonitoredItemId> + '_ {
        self.links.iter().copied()
    }

    // -------------------------------------------------------------------------
    // Sampling
    // -------------------------------------------------------------------------

    /// Records a new value from the data source.
    ///
    /// The value is sampled right away when the sampling interval allows,
    /// otherwise it is held until [`sample_if_due`](Self::sample_if_due).
    pub fn on_value_changed(&mut self, value: DataValue, now: Instant) {
        if self.is_event() {
            return;
        }
        self.latest = Some(self.apply_range(value));
        if !self.settings.mode.is_sampling() || !self.access_granted {
            return;
        }
        self.sample_pending = true;
        if self.sample_due(now) {
            self.take_sample(now);
        }
    }

    /// Samples a held value if the sampling interval has elapsed.
    pub fn sample_if_due(&mut self, now: Instant) {
        if self.sample_pending && self.sample_due(now) {
            self.take_sample(now);
        }
    }

    /// Samples a held value regardless of the sampling interval.
    ///
    /// Used when a triggering item fires. A held value still goes through
    /// the filter. If nothing ends up queued, the last accepted value is
    /// reported again so the linked item always appears with its trigger.
    pub fn force_sample(&mut self, now: Instant) {
        if !self.settings.mode.is_sampling() || !self.access_granted {
            return;
        }
        if self.sample_pending {
            self.take_sample(now);
        }
        if self.queue.is_empty() {
            if let Some(value) = self.last_accepted.clone() {
                self.enqueue(ItemPayload::Value(value));
            }
        }
    }

    /// Records an event raised by the monitored notifier.
    pub fn on_event(&mut self, fields: &HashMap<String, Variant>) {
        if !self.settings.mode.is_sampling() || !self.access_granted {
            return;
        }
        if let ResolvedFilter::Event(filter) = &self.settings.filter {
            let projected = filter.project(fields);
            self.enqueue(ItemPayload::Event(projected));
        }
    }

    /// Queues the last accepted value again, bypassing the filter.
    pub fn resend_current(&mut self) {
        if self.is_event() || !self.settings.mode.is_sampling() {
            return;
        }
        if let Some(value) = self.last_accepted.clone() {
            self.enqueue(ItemPayload::Value(value));
        }
    }

    /// Takes all queued notifications, with the requested timestamps applied.
    pub fn drain(&mut self) -> Vec<ItemPayload> {
        let timestamps = self.settings.timestamps;
        self.queue
            .drain(..)
            .map(|payload| match payload {
                ItemPayload::Value(value) => ItemPayload::Value(value.with_timestamps(timestamps)),
                event => event,
            })
            .collect()
    }

    fn sample_due(&self, now: Instant) -> bool {
        self.next_sample_at.map_or(true, |at| now >= at)
    }

    fn take_sample(&mut self, now: Instant) {
        self.sample_pending = false;
        self.next_sample_at = if self.settings.sampling_interval.is_zero() {
            None
        } else {
            Some(now + self.settings.sampling_interval)
        };
        if let Some(value) = self.latest.clone() {
            self.accept(value);
        }
    }

    fn initial_sample(&mut self, now: Instant) {
        if self.is_event() {
            return;
        }
        if self.access_granted {
            self.sample_pending = true;
            self.take_sample(now);
        } else {
            self.accept(DataValue::from_status(StatusCode::BAD_USER_ACCESS_DENIED));
        }
    }

    fn accept(&mut self, value: DataValue) {
        let ResolvedFilter::DataChange(detector) = &self.settings.filter else {
            return;
        };
        if detector.is_change(self.last_accepted.as_ref(), &value) {
            self.last_accepted = Some(value.clone());
            self.enqueue(ItemPayload::Value(value));
        }
    }

    fn enqueue(&mut self, payload: ItemPayload) {
        let capacity = self.settings.queue_size.max(1) as usize;
        if self.queue.len() < capacity {
            self.queue.push_back(payload);
            return;
        }

        self.lost += 1;
        if self.settings.discard_oldest {
            self.queue.pop_front();
            self.queue.push_back(payload);
            if capacity > 1 {
                if let Some(front) = self.queue.front_mut() {
                    front.mark_overflow();
                }
            }
        } else if let Some(last) = self.queue.back_mut() {
            *last = payload;
            if capacity > 1 {
                last.mark_overflow();
            }
        }
        tracing::trace!(item = %self.id, lost = self.lost, "Monitored item queue overflow");
    }

    fn apply_range(&self, mut value: DataValue) -> DataValue {
        let (Some(range), Some(inner)) = (self.target.index_range, value.value.as_ref()) else {
            return value;
        };
        match range.apply(inner) {
            Ok(ranged) => {
                value.value = Some(ranged);
                value
            }
            Err(status) => DataValue {
                value: None,
                status,
                source_timestamp: value.source_timestamp,
                server_timestamp: value.server_timestamp,
            },
        }
    }

    // -------------------------------------------------------------------------
    // Control
    // -------------------------------------------------------------------------

    /// Changes the monitoring mode.
    ///
    /// Disabling clears the queue without reporting. Enabling takes a fresh
    /// sample. Moving from Sampling to Reporting keeps the queue; the owning
    /// subscription flushes it right away.
    pub fn set_mode(&mut self, mode: MonitoringMode, now: Instant) {
        let previous = self.settings.mode;
        if previous == mode {
            return;
        }
        self.settings.mode = mode;
        tracing::debug!(item = %self.id, from = %previous, to = %mode, "Monitoring mode changed");

        match mode {
            MonitoringMode::Disabled => {
                self.queue.clear();
                self.sample_pending = false;
                self.last_accepted = None;
            }
            _ if previous == MonitoringMode::Disabled => self.initial_sample(now),
            _ => {}
        }
    }

    /// Applies revised parameters from ModifyMonitoredItems.
    pub fn modify(&mut self, settings: ItemSettings) {
        let capacity = settings.queue_size.max(1) as usize;
        while self.queue.len() > capacity {
            if settings.discard_oldest {
                self.queue.pop_front();
            } else {
                self.queue.pop_back();
            }
            self.lost += 1;
        }
        if settings.sampling_interval != self.settings.sampling_interval {
            self.next_sample_at = None;
        }
        let mode = self.settings.mode;
        self.settings = ItemSettings { mode, ..settings };
    }

    /// Updates access after an identity change; returns `true` if it changed.
    ///
    /// Losing access replaces queued data with a `BadUserAccessDenied`
    /// report. Regaining access samples the latest value immediately.
    pub fn set_access(&mut self, granted: bool, now: Instant) -> bool {
        if self.access_granted == granted {
            return false;
        }
        self.access_granted = granted;
        tracing::debug!(item = %self.id, node = %self.target.node_id, granted, "Item access changed");

        if !self.settings.mode.is_sampling() {
            return true;
        }
        self.queue.clear();
        if self.is_event() {
            return true;
        }
        if granted {
            self.sample_pending = true;
            self.take_sample(now);
        } else {
            self.sample_pending = false;
            self.accept(DataValue::from_status(StatusCode::BAD_USER_ACCESS_DENIED));
        }
        true
    }

    /// Adds a triggering link; returns `false` if it already existed.
    pub fn add_link(&mut self, linked: MonitoredItemId) -> bool {
        self.links.insert(linked)
    }

    /// Removes a triggering link; returns `false` if it did not exist.
    pub fn remove_link(&mut self, linked: MonitoredItemId) -> bool {
        self.links.remove(&linked)
    }
}

// =============================================================================
// Tests
// =============================================================================
