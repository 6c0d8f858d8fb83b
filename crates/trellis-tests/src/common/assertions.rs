// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Custom Assertions
//!
//! Waiting helpers for subscription and client events. Every wait has an
//! explicit deadline and panics with a description when it passes; on a
//! paused clock the deadline costs nothing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::{timeout, Instant};

use trellis_core::{StatusCode, Variant};
use trellis_opcua::messages::MonitoredItemNotification;
use trellis_opcua::{ChannelListener, ClientEvent, ClientSubscription, ConnectionState, SubscriptionEvent};

use super::harness::TestClient;

/// Default deadline for an expected event.
pub const EVENT_WAIT: Duration = Duration::from_secs(30);

// =============================================================================
// Subscription Events
// =============================================================================

/// Registers a channel listener on `subscription` and returns its receiver.
pub fn listen(subscription: &Arc<ClientSubscription>) -> mpsc::Receiver<SubscriptionEvent> {
    let (listener, receiver) = ChannelListener::with_channel(1024);
    subscription.add_listener(Arc::new(listener));
    receiver
}

/// Waits for the next event of any kind.
pub async fn next_event(events: &mut mpsc::Receiver<SubscriptionEvent>, within: Duration) -> SubscriptionEvent {
    match timeout(within, events.recv()).await {
        Ok(Some(event)) => event,
        Ok(None) => panic!("Subscription event channel closed"),
        Err(_) => panic!("No subscription event within {:?}", within),
    }
}

/// Waits for the first event matching `predicate`, skipping the others.
pub async fn wait_for_event<F>(
    events: &mut mpsc::Receiver<SubscriptionEvent>,
    within: Duration,
    mut predicate: F,
) -> SubscriptionEvent
where
    F: FnMut(&SubscriptionEvent) -> bool,
{
    let deadline = Instant::now() + within;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, events.recv()).await {
            Ok(Some(event)) if predicate(&event) => return event,
            Ok(Some(event)) => tracing::trace!(?event, "Skipping event"),
            Ok(None) => panic!("Subscription event channel closed"),
            Err(_) => panic!("No matching subscription event within {:?}", within),
        }
    }
}

/// Waits for the next data change, returning its sequence number and items.
pub async fn next_data_change(
    events: &mut mpsc::Receiver<SubscriptionEvent>,
    within: Duration,
) -> (u32, Vec<MonitoredItemNotification>) {
    match wait_for_event(events, within, |e| matches!(e, SubscriptionEvent::DataChange { .. })).await {
        SubscriptionEvent::DataChange {
            sequence_number,
            items,
        } => (sequence_number, items),
        other => unreachable!("Filtered for data changes, got {:?}", other),
    }
}

/// Asserts that no data change arrives for `window`. Other events are
/// drained and returned.
pub async fn assert_no_data_change(
    events: &mut mpsc::Receiver<SubscriptionEvent>,
    window: Duration,
) -> Vec<SubscriptionEvent> {
    let deadline = Instant::now() + window;
    let mut seen = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, events.recv()).await {
            Ok(Some(SubscriptionEvent::DataChange { items, .. })) => {
                panic!("Unexpected data change: {:?}", items)
            }
            Ok(Some(event)) => seen.push(event),
            Ok(None) | Err(_) => return seen,
        }
    }
}

/// Values reported for `client_handle`, in order.
pub fn values_of(items: &[MonitoredItemNotification], client_handle: u32) -> Vec<Variant> {
    items
        .iter()
        .filter(|n| n.client_handle == client_handle)
        .filter_map(|n| n.value.value.clone())
        .collect()
}

/// Statuses reported for `client_handle`, in order.
pub fn statuses_of(items: &[MonitoredItemNotification], client_handle: u32) -> Vec<StatusCode> {
    items
        .iter()
        .filter(|n| n.client_handle == client_handle)
        .map(|n| n.value.status)
        .collect()
}

/// Asserts the Int32 values reported for `client_handle`.
pub fn assert_int_values(items: &[MonitoredItemNotification], client_handle: u32, expected: &[i32]) {
    let expected: Vec<Variant> = expected.iter().map(|v| Variant::Int32(*v)).collect();
    assert_eq!(
        values_of(items, client_handle),
        expected,
        "values for client handle {}",
        client_handle
    );
}

// =============================================================================
// Client Events
// =============================================================================

/// Waits for the first client event matching `predicate`.
pub async fn wait_for_client_event<F>(
    events: &mut broadcast::Receiver<ClientEvent>,
    within: Duration,
    mut predicate: F,
) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    let deadline = Instant::now() + within;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, events.recv()).await {
            Ok(Ok(event)) if predicate(&event) => return event,
            Ok(Ok(_)) => {}
            Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                tracing::warn!(skipped, "Client event receiver lagged");
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => panic!("Client event channel closed"),
            Err(_) => panic!("No matching client event within {:?}", within),
        }
    }
}

/// Drains every client event already queued.
pub fn drain_client_events(events: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut drained = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => drained.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return drained,
        }
    }
}

/// Waits until the client reaches `state`.
pub async fn wait_for_state(client: &TestClient, state: ConnectionState, within: Duration) {
    let mut watch = client.state_watch();
    let reached = timeout(within, watch.wait_for(|current| *current == state)).await;
    match reached {
        Ok(Ok(_)) => {}
        Ok(Err(_)) => panic!("Client state channel closed"),
        Err(_) => panic!(
            "Client did not reach {} within {:?}, still {}",
            state,
            within,
            client.state()
        ),
    }
}
