// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Reconnection Integration Tests
//!
//! Connection loss and recovery against the loopback transport:
//!
//! ```text
//! first contact ── refused ──► backoff ──► ... ──► GiveUp (max_retry)
//! channel break ──► re-activate ──► repaired
//! session lost  ──► new session ──► transfer ──► (fallback) recreate
//! ```
//!
//! ## Test Categories
//!
//! - `test_connect_*`: First contact and its retry budget
//! - `test_reconnect_*`: Recovery of a live client
//! - `test_requests_*`: Requests issued during an outage

use std::time::Duration;

use tokio::time::Instant;

use trellis_core::{StatusCode, TimeoutError, TimestampsToReturn, TransportError, UaError};
use trellis_opcua::{ClientEvent, ClientSubscription, ConnectionState, SubscriptionEvent};
use trellis_tests::prelude::*;

// =============================================================================
// First Contact Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_connect_gives_up_after_max_retry() {
    let mut harness = UaHarness::start(ConfigFixtures::server());
    let (client, transport) = harness.client(ConfigFixtures::client(IdentityFixtures::operator()));
    let mut events = client.events();
    transport.set_online(false);

    let started = Instant::now();
    let err = client.connect().await.unwrap_err();

    match err {
        UaError::Transport(TransportError::GaveUp { endpoint, attempts }) => {
            assert_eq!(endpoint, ConfigFixtures::ENDPOINT);
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(client.state(), ConnectionState::GiveUp);
    assert_eq!(transport.open_attempts(), 3);
    assert!(client.session().is_none());
    // Two backoff sleeps: 50ms then 100ms.
    let elapsed = Instant::now() - started;
    assert!(
        elapsed >= Duration::from_millis(150) && elapsed <= Duration::from_millis(155),
        "elapsed {:?}",
        elapsed
    );

    let emitted = drain_client_events(&mut events);
    let backoffs: Vec<(u32, Duration)> = emitted
        .iter()
        .filter_map(|e| match e {
            ClientEvent::Backoff { attempt, delay } => Some((*attempt, *delay)),
            _ => None,
        })
        .collect();
    assert_eq!(
        backoffs,
        vec![(1, Duration::from_millis(50)), (2, Duration::from_millis(100))]
    );
    assert!(emitted.contains(&ClientEvent::GaveUp { attempts: 3 }));
    assert_eq!(harness.server().session_count(), 0);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_connect_succeeds_within_budget() {
    let mut harness = UaHarness::start(ConfigFixtures::server());
    let (client, transport) = harness.client(ConfigFixtures::client(IdentityFixtures::operator()));
    transport.refuse_next(2);

    client.connect().await.unwrap();

    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(transport.open_attempts(), 3);
    assert!(client.session().is_some());
    assert_eq!(harness.server().session_count(), 1);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_connect_again_after_give_up() {
    let mut harness = UaHarness::start(ConfigFixtures::server());
    let (client, transport) = harness.client(ConfigFixtures::client(IdentityFixtures::operator()));
    transport.set_online(false);
    assert!(client.connect().await.is_err());

    transport.set_online(true);
    client.connect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);

    harness.shutdown().await;
}

// =============================================================================
// Recovery Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_reconnect_repairs_session_after_channel_break() {
    let mut harness = UaHarness::start(ConfigFixtures::server());
    let (client, transport) = harness.connected_client(IdentityFixtures::operator()).await;
    let node = NodeFixtures::variable(1);

    let sub = client
        .create_subscription(ConfigFixtures::subscription(100, 10))
        .await
        .unwrap();
    let created = client
        .create_monitored_items(&sub, TimestampsToReturn::Both, vec![ItemRequestBuilder::value(node.clone()).build()])
        .await
        .unwrap();
    let handle = created[0].client_handle;
    let session_id = client.session().unwrap().session_id;
    let mut data = listen(&sub);
    next_data_change(&mut data, EVENT_WAIT).await;
    let mut events = client.events();

    // Recovery outlasts the first-contact budget of two retries.
    transport.refuse_next(5);
    assert!(transport.break_channels() > 0);
    wait_for_state(&client, ConnectionState::Reconnecting, EVENT_WAIT).await;
    harness.write(&node, 42);

    let repaired = wait_for_client_event(&mut events, EVENT_WAIT, |e| {
        matches!(e, ClientEvent::SessionRepaired { .. })
    })
    .await;
    assert_eq!(repaired, ClientEvent::SessionRepaired { session_id });
    wait_for_state(&client, ConnectionState::Connected, EVENT_WAIT).await;
    assert_eq!(client.stats().sessions_repaired(), 1);
    assert_eq!(client.stats().sessions_recreated(), 0);
    assert_eq!(harness.server().session_count(), 1);

    let (_, items) = next_data_change(&mut data, EVENT_WAIT).await;
    assert_int_values(&items, handle, &[42]);

    harness.write(&node, 43);
    let (_, items) = next_data_change(&mut data, EVENT_WAIT).await;
    assert_int_values(&items, handle, &[43]);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_backoff_is_unbounded() {
    let mut harness = UaHarness::start(ConfigFixtures::server());
    let (client, transport) = harness.connected_client(IdentityFixtures::operator()).await;
    client
        .create_subscription(ConfigFixtures::subscription(100, 10))
        .await
        .unwrap();
    let mut events = client.events();

    transport.set_online(false);
    let mut delays = Vec::new();
    while delays.len() < 6 {
        if let ClientEvent::Backoff { delay, .. } =
            wait_for_client_event(&mut events, EVENT_WAIT, |e| matches!(e, ClientEvent::Backoff { .. })).await
        {
            delays.push(delay.as_millis() as u64);
        }
    }
    assert_eq!(delays, vec![50, 100, 200, 400, 400, 400]);
    assert_eq!(client.state(), ConnectionState::Reconnecting);

    transport.set_online(true);
    wait_for_state(&client, ConnectionState::Connected, EVENT_WAIT).await;

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_transfers_after_session_loss() {
    let mut harness = UaHarness::start(ConfigFixtures::server());
    let (client, _) = harness.connected_client(IdentityFixtures::operator()).await;
    let node = NodeFixtures::variable(2);
    harness.write(&node, 7);

    let sub = client
        .create_subscription(ConfigFixtures::subscription(100, 10))
        .await
        .unwrap();
    let created = client
        .create_monitored_items(&sub, TimestampsToReturn::Both, vec![ItemRequestBuilder::value(node.clone()).build()])
        .await
        .unwrap();
    let handle = created[0].client_handle;
    let original_id = sub.id();
    let mut data = listen(&sub);
    next_data_change(&mut data, EVENT_WAIT).await;
    let mut events = client.events();

    let old_session = client.session().unwrap().session_id;
    assert!(harness.server().terminate_session(old_session));

    let lost = wait_for_client_event(&mut events, EVENT_WAIT, |e| {
        matches!(e, ClientEvent::ConnectionLost { .. })
    })
    .await;
    assert_eq!(lost, ClientEvent::ConnectionLost { session_lost: true });
    let transferred = wait_for_client_event(&mut events, EVENT_WAIT, |e| {
        matches!(e, ClientEvent::SubscriptionTransferred { .. })
    })
    .await;
    assert_eq!(
        transferred,
        ClientEvent::SubscriptionTransferred {
            subscription_id: original_id
        }
    );
    wait_for_state(&client, ConnectionState::Connected, EVENT_WAIT).await;

    assert_ne!(client.session().unwrap().session_id, old_session);
    assert_eq!(sub.id(), original_id);
    assert_eq!(client.stats().subscriptions_transferred(), 1);
    assert_eq!(harness.server().subscription_count(), 1);

    // The last value is sent again on transfer.
    let (_, items) = next_data_change(&mut data, EVENT_WAIT).await;
    assert_int_values(&items, handle, &[7]);

    harness.write(&node, 8);
    let (_, items) = next_data_change(&mut data, EVENT_WAIT).await;
    assert_int_values(&items, handle, &[8]);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_recreates_when_transfer_unsupported() {
    let mut harness = UaHarness::start(ConfigFixtures::server_without_transfer());
    let (client, _) = harness.connected_client(IdentityFixtures::operator()).await;
    let node = NodeFixtures::variable(2);
    harness.write(&node, 3);

    let sub = client
        .create_subscription(ConfigFixtures::subscription(100, 10))
        .await
        .unwrap();
    let created = client
        .create_monitored_items(
            &sub,
            TimestampsToReturn::Both,
            vec![ItemRequestBuilder::value(node.clone()).queue_size(4).build()],
        )
        .await
        .unwrap();
    let handle = created[0].client_handle;
    let original_id = sub.id();
    let mut data = listen(&sub);
    next_data_change(&mut data, EVENT_WAIT).await;
    let mut events = client.events();

    let session_id = client.session().unwrap().session_id;
    harness.server().terminate_session(session_id);

    let recreated = wait_for_client_event(&mut events, EVENT_WAIT, |e| {
        matches!(e, ClientEvent::SubscriptionRecreated { .. })
    })
    .await;
    let ClientEvent::SubscriptionRecreated { old_id, new_id } = recreated else {
        unreachable!()
    };
    assert_eq!(old_id, original_id);
    assert_ne!(new_id, original_id);
    assert_eq!(sub.id(), new_id);
    assert!(client.subscription(new_id).is_some());
    assert!(client.subscription(original_id).is_none());

    // Listeners hear about the new id; the handle is unchanged.
    let notice = wait_for_event(&mut data, EVENT_WAIT, |e| {
        matches!(e, SubscriptionEvent::Recreated { .. })
    })
    .await;
    assert_eq!(notice, SubscriptionEvent::Recreated { old_id, new_id });
    assert_eq!(sub.item(handle).unwrap().revised_queue_size, 4);

    let (sequence_number, items) = next_data_change(&mut data, EVENT_WAIT).await;
    assert_eq!(sequence_number, 1);
    assert_int_values(&items, handle, &[3]);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_recreates_after_server_restart() {
    let mut harness = UaHarness::start(ConfigFixtures::server());
    let (client, _) = harness.connected_client(IdentityFixtures::operator()).await;
    let trigger_node = NodeFixtures::variable(1);
    let linked_node = NodeFixtures::variable(4);

    let sub = client
        .create_subscription(ConfigFixtures::subscription(100, 10))
        .await
        .unwrap();
    let created = client
        .create_monitored_items(
            &sub,
            TimestampsToReturn::Both,
            vec![
                ItemRequestBuilder::value(trigger_node.clone()).build(),
                ItemRequestBuilder::value(linked_node.clone()).sampling().build(),
            ],
        )
        .await
        .unwrap();
    let (trigger, linked) = (created[0].client_handle, created[1].client_handle);
    client.set_triggering(&sub, trigger, &[linked], &[]).await.unwrap();
    let mut data = listen(&sub);
    next_data_change(&mut data, EVENT_WAIT).await;
    let mut events = client.events();

    harness.restart_server(ConfigFixtures::server()).await;

    wait_for_client_event(&mut events, EVENT_WAIT, |e| {
        matches!(e, ClientEvent::SessionRecreated { .. })
    })
    .await;
    wait_for_client_event(&mut events, EVENT_WAIT, |e| {
        matches!(e, ClientEvent::SubscriptionRecreated { .. })
    })
    .await;
    wait_for_state(&client, ConnectionState::Connected, EVENT_WAIT).await;
    assert_eq!(harness.server().session_count(), 1);
    assert_eq!(harness.server().subscription_count(), 1);

    // Items and their triggering link came back.
    assert_eq!(sub.triggered_by(trigger), vec![linked]);
    harness.write(&linked_node, 12);
    harness.write(&trigger_node, 2);
    let (_, items) = wait_for_data(&mut data, trigger, 2).await;
    assert_int_values(&items, linked, &[12]);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_stops_on_disconnect() {
    let mut harness = UaHarness::start(ConfigFixtures::server());
    let (client, transport) = harness.connected_client(IdentityFixtures::operator()).await;
    client
        .create_subscription(ConfigFixtures::subscription(100, 10))
        .await
        .unwrap();

    transport.set_online(false);
    wait_for_state(&client, ConnectionState::Reconnecting, EVENT_WAIT).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    client.disconnect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(client.subscriptions().is_empty());

    let attempts = transport.open_attempts();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(transport.open_attempts(), attempts);

    harness.shutdown().await;
}

// =============================================================================
// Outage Request Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_requests_wait_for_reconnection() {
    let mut harness = UaHarness::start(ConfigFixtures::server());
    let (client, transport) = harness.connected_client(IdentityFixtures::operator()).await;
    client
        .create_subscription(ConfigFixtures::subscription(100, 10))
        .await
        .unwrap();

    transport.set_online(false);
    wait_for_state(&client, ConnectionState::Reconnecting, EVENT_WAIT).await;

    let restore = async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        transport.set_online(true);
    };
    let (created, ()) = tokio::join!(
        client.create_subscription(ConfigFixtures::subscription(100, 10)),
        restore
    );

    let sub = created.unwrap();
    assert!(sub.is_active());
    assert_eq!(client.subscriptions().len(), 2);
    assert_eq!(client.state(), ConnectionState::Connected);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_requests_time_out_during_long_outage() {
    let mut harness = UaHarness::start(ConfigFixtures::server());
    let (client, transport) = harness.connected_client(IdentityFixtures::operator()).await;
    client
        .create_subscription(ConfigFixtures::subscription(100, 10))
        .await
        .unwrap();

    transport.set_online(false);
    wait_for_state(&client, ConnectionState::Reconnecting, EVENT_WAIT).await;

    let err = client
        .create_subscription(ConfigFixtures::subscription(100, 10))
        .await
        .unwrap_err();
    assert!(
        matches!(err, UaError::Timeout(TimeoutError::Reconnect { .. })),
        "unexpected error: {}",
        err
    );
    // A timed-out request does not disturb recovery.
    assert_eq!(client.state(), ConnectionState::Reconnecting);

    transport.set_online(true);
    wait_for_state(&client, ConnectionState::Connected, EVENT_WAIT).await;
    let subscriptions = client.subscriptions();
    let refs: Vec<&ClientSubscription> = subscriptions.iter().map(|s| s.as_ref()).collect();
    let statuses = client.set_publishing_mode(&refs, true).await.unwrap();
    assert_eq!(statuses, vec![StatusCode::GOOD]);

    harness.shutdown().await;
}

/// Waits for a data change carrying `value` for `handle`.
async fn wait_for_data(
    events: &mut tokio::sync::mpsc::Receiver<SubscriptionEvent>,
    handle: u32,
    value: i32,
) -> (u32, Vec<trellis_opcua::messages::MonitoredItemNotification>) {
    loop {
        let (sequence_number, items) = next_data_change(events, EVENT_WAIT).await;
        if values_of(&items, handle).contains(&trellis_core::Variant::Int32(value)) {
            return (sequence_number, items);
        }
    }
}
