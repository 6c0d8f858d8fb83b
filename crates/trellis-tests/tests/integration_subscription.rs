// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Subscription Integration Tests
//!
//! Subscription behaviour observed from a client:
//!
//! - Keep-alive cadence and lifetime revision
//! - Parameter changes and publishing mode
//! - Transfer between sessions
//!
//! ## Test Categories
//!
//! - `test_keep_alive_*`: Keep-alive timing
//! - `test_lifetime_*`: Revision of counts
//! - `test_modify_*` / `test_publishing_*`: Parameter changes
//! - `test_transfer_*`: Ownership transfer
//! - `test_delete_*`: Deletion

use std::time::Duration;

use tokio::time::Instant;

use trellis_core::{StatusCode, TimestampsToReturn};
use trellis_opcua::client::ClientSubscriptionState;
use trellis_opcua::{SubscriptionEvent, SubscriptionSettings};
use trellis_tests::prelude::*;

fn assert_near(actual: Duration, expected: Duration) {
    let tolerance = Duration::from_millis(5);
    assert!(
        actual + tolerance >= expected && actual <= expected + tolerance,
        "expected about {:?}, got {:?}",
        expected,
        actual
    );
}

// =============================================================================
// Keep-alive and Lifetime Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_keep_alive_after_k_empty_cycles() {
    let mut harness = UaHarness::start(ConfigFixtures::server());
    let (client, _transport) = harness.connected_client(IdentityFixtures::operator()).await;

    let sub = client
        .create_subscription(ConfigFixtures::subscription(100, 3))
        .await
        .unwrap();
    let created = Instant::now();
    let mut events = listen(&sub);

    let first = next_event(&mut events, EVENT_WAIT).await;
    let first_at = Instant::now();
    assert_eq!(first, SubscriptionEvent::KeepAlive { next_sequence_number: 1 });
    assert_near(first_at - created, Duration::from_millis(300));

    // The counter resets: the next one follows after another K cycles.
    let second = next_event(&mut events, EVENT_WAIT).await;
    assert_eq!(second, SubscriptionEvent::KeepAlive { next_sequence_number: 1 });
    assert_near(Instant::now() - first_at, Duration::from_millis(300));

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_does_not_consume_sequence_numbers() {
    let mut harness = UaHarness::start(ConfigFixtures::server());
    let (client, _transport) = harness.connected_client(IdentityFixtures::operator()).await;
    let node = NodeFixtures::variable(1);

    let sub = client
        .create_subscription(ConfigFixtures::subscription(100, 2))
        .await
        .unwrap();
    client
        .create_monitored_items(&sub, TimestampsToReturn::Both, vec![ItemRequestBuilder::value(node.clone()).build()])
        .await
        .unwrap();
    let mut events = listen(&sub);

    let (first, _) = next_data_change(&mut events, EVENT_WAIT).await;
    assert_eq!(first, 1);

    let keep_alive = next_event(&mut events, EVENT_WAIT).await;
    assert_eq!(keep_alive, SubscriptionEvent::KeepAlive { next_sequence_number: 2 });

    harness.write(&node, 5i32);
    let (second, _) = next_data_change(&mut events, EVENT_WAIT).await;
    assert_eq!(second, 2);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_lifetime_revised_to_three_keep_alive_periods() {
    let mut harness = UaHarness::start(ConfigFixtures::server());
    let (client, _transport) = harness.connected_client(IdentityFixtures::operator()).await;

    let settings = SubscriptionSettings::with_interval(Duration::from_millis(100)).with_counts(10, 5);
    let sub = client.create_subscription(settings).await.unwrap();

    let revised = sub.revised();
    assert_eq!(revised.max_keep_alive_count, 10);
    assert!(revised.lifetime_count >= 30, "lifetime {}", revised.lifetime_count);

    let diagnostics = harness
        .server()
        .subscription_diagnostics()
        .into_iter()
        .find(|d| d.subscription_id == sub.id())
        .expect("subscription diagnostics");
    assert_eq!(diagnostics.lifetime_count, revised.lifetime_count);
    assert_eq!(diagnostics.max_keep_alive_count, 10);

    harness.shutdown().await;
}

// =============================================================================
// Parameter Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_modify_subscription_changes_cadence() {
    let mut harness = UaHarness::start(ConfigFixtures::server());
    let (client, _transport) = harness.connected_client(IdentityFixtures::operator()).await;

    let sub = client
        .create_subscription(ConfigFixtures::subscription(100, 3))
        .await
        .unwrap();
    let mut events = listen(&sub);

    let revised = client
        .modify_subscription(&sub, ConfigFixtures::subscription(200, 2))
        .await
        .unwrap();
    assert_eq!(revised.publishing_interval, Duration::from_millis(200));
    assert_eq!(revised.max_keep_alive_count, 2);
    assert_eq!(sub.revised(), revised);

    next_event(&mut events, EVENT_WAIT).await;
    let settled = Instant::now();
    let next = next_event(&mut events, EVENT_WAIT).await;
    assert!(matches!(next, SubscriptionEvent::KeepAlive { .. }));
    assert_near(Instant::now() - settled, Duration::from_millis(400));

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_publishing_disabled_holds_data_until_enabled() {
    let mut harness = UaHarness::start(ConfigFixtures::server());
    let (client, _transport) = harness.connected_client(IdentityFixtures::operator()).await;
    let node = NodeFixtures::variable(1);

    let sub = client
        .create_subscription(ConfigFixtures::subscription(100, 5))
        .await
        .unwrap();
    let created = client
        .create_monitored_items(&sub, TimestampsToReturn::Both, vec![ItemRequestBuilder::value(node.clone()).build()])
        .await
        .unwrap();
    let handle = created[0].client_handle;
    let mut events = listen(&sub);

    let (_, items) = next_data_change(&mut events, EVENT_WAIT).await;
    assert_int_values(&items, handle, &[0]);

    let statuses = client.set_publishing_mode(&[&*sub], false).await.unwrap();
    assert_eq!(statuses, vec![StatusCode::GOOD]);
    assert!(!sub.settings().publishing_enabled);

    harness.write(&node, 7i32);
    let seen = assert_no_data_change(&mut events, Duration::from_secs(1)).await;
    assert!(seen.iter().any(|e| matches!(e, SubscriptionEvent::KeepAlive { .. })));

    client.set_publishing_mode(&[&*sub], true).await.unwrap();
    let (_, items) = next_data_change(&mut events, EVENT_WAIT).await;
    assert_int_values(&items, handle, &[7]);

    harness.shutdown().await;
}

// =============================================================================
// Transfer Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_transfer_between_sessions() {
    let mut harness = UaHarness::start(ConfigFixtures::server());
    let (client_a, _) = harness.connected_client(IdentityFixtures::operator()).await;
    let (client_b, _) = harness.connected_client(IdentityFixtures::operator()).await;
    let node = NodeFixtures::variable(1);

    let sub_a = client_a
        .create_subscription(ConfigFixtures::subscription(100, 10))
        .await
        .unwrap();
    let created = client_a
        .create_monitored_items(&sub_a, TimestampsToReturn::Both, vec![ItemRequestBuilder::value(node.clone()).build()])
        .await
        .unwrap();
    let handle = created[0].client_handle;
    let mut events_a = listen(&sub_a);

    let (initial, _) = next_data_change(&mut events_a, EVENT_WAIT).await;
    harness.write(&node, 1i32);
    let (before, items) = next_data_change(&mut events_a, EVENT_WAIT).await;
    assert!(before > initial);
    assert_int_values(&items, handle, &[1]);

    let results = client_b.transfer_subscriptions(&[sub_a.id()], false).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, StatusCode::GOOD);

    // A is told exactly once.
    let notice = wait_for_event(&mut events_a, EVENT_WAIT, |e| {
        !matches!(e, SubscriptionEvent::KeepAlive { .. })
    })
    .await;
    assert_eq!(notice, SubscriptionEvent::Transferred);
    assert_eq!(sub_a.state(), ClientSubscriptionState::TransferredAway);
    let later = assert_no_data_change(&mut events_a, Duration::from_secs(2)).await;
    assert!(later.is_empty(), "events after transfer: {:?}", later);

    // A no longer owns it.
    let status = client_a.delete_subscription(&sub_a).await.unwrap();
    assert_eq!(status, StatusCode::BAD_SUBSCRIPTION_ID_INVALID);

    // Sequence numbers continue under B.
    let sub_b = client_b.subscription(sub_a.id()).expect("adopted subscription");
    let mut events_b = listen(&sub_b);
    harness.write(&node, 2i32);
    let (after, items) = next_data_change(&mut events_b, EVENT_WAIT).await;
    assert_eq!(after, before + 1);
    assert_int_values(&items, handle, &[2]);

    // B owns it.
    let status = client_b.delete_subscription(&sub_b).await.unwrap();
    assert_eq!(status, StatusCode::GOOD);
    assert_eq!(harness.server().subscription_count(), 0);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_transfer_denied_to_other_user() {
    let mut harness = UaHarness::start(ConfigFixtures::server());
    let (operator, _) = harness.connected_client(IdentityFixtures::operator()).await;
    let (engineer, _) = harness.connected_client(IdentityFixtures::engineer()).await;

    let sub = operator
        .create_subscription(ConfigFixtures::subscription(100, 10))
        .await
        .unwrap();
    let owner = operator.session().unwrap().session_id;

    let results = engineer.transfer_subscriptions(&[sub.id()], true).await.unwrap();
    assert_eq!(results[0].status, StatusCode::BAD_USER_ACCESS_DENIED);
    assert!(engineer.subscriptions().is_empty());
    assert_eq!(harness.server().subscription_owner(sub.id()), Some(Some(owner)));
    assert!(sub.is_active());

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_transfer_unknown_subscription_reported_per_id() {
    let mut harness = UaHarness::start(ConfigFixtures::server());
    let (client, _) = harness.connected_client(IdentityFixtures::operator()).await;

    let sub = client
        .create_subscription(ConfigFixtures::subscription(100, 10))
        .await
        .unwrap();
    let unknown = trellis_core::SubscriptionId(9_999);

    let results = client.transfer_subscriptions(&[sub.id(), unknown], false).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].status, StatusCode::GOOD);
    assert_eq!(results[1].status, StatusCode::BAD_SUBSCRIPTION_ID_INVALID);
    assert_eq!(client.subscriptions().len(), 1);

    harness.shutdown().await;
}

// =============================================================================
// Deletion Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_delete_subscription_releases_it() {
    let mut harness = UaHarness::start(ConfigFixtures::server());
    let (client, _) = harness.connected_client(IdentityFixtures::operator()).await;

    let sub = client
        .create_subscription(ConfigFixtures::subscription(100, 10))
        .await
        .unwrap();
    assert_eq!(harness.server().subscription_count(), 1);

    assert_eq!(client.delete_subscription(&sub).await.unwrap(), StatusCode::GOOD);
    assert_eq!(sub.state(), ClientSubscriptionState::Terminated);
    assert!(client.subscription(sub.id()).is_none());
    assert_eq!(harness.server().subscription_count(), 0);

    // A second delete is a per-id rejection, not an error.
    assert_eq!(
        client.delete_subscription(&sub).await.unwrap(),
        StatusCode::BAD_SUBSCRIPTION_ID_INVALID
    );

    harness.shutdown().await;
}
