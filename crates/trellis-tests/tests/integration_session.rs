// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Session Integration Tests
//!
//! Session identity and lifecycle as seen by live subscriptions:
//!
//! - Identity change re-evaluates item access in place
//! - Rejected identities leave the session untouched
//! - Close and republish behaviour
//! - Recovery of notifications lost in transit
//!
//! ## Test Categories
//!
//! - `test_identity_*`: ActivateSession on a live session
//! - `test_session_*`: Lifecycle
//! - `test_republish_*`: Retransmission and sequence gap recovery

use std::time::Duration;

use trellis_core::{ServiceError, SessionError, StatusCode, TimestampsToReturn, TransportError, UaError};
use trellis_opcua::{ConnectionState, SubscriptionEvent};
use trellis_tests::prelude::*;

// =============================================================================
// Identity Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_identity_upgrade_grants_access_in_place() {
    let mut harness = UaHarness::start(ConfigFixtures::server());
    let (client, _) = harness.connected_client(IdentityFixtures::operator()).await;
    harness.write(&NodeFixtures::restricted(), 33);

    let sub = client
        .create_subscription(ConfigFixtures::subscription(100, 10))
        .await
        .unwrap();
    let created = client
        .create_monitored_items(
            &sub,
            TimestampsToReturn::Both,
            vec![ItemRequestBuilder::value(NodeFixtures::restricted()).build()],
        )
        .await
        .unwrap();

    // The item exists; only its data is withheld.
    assert!(created[0].is_good());
    let handle = created[0].client_handle;
    let mut events = listen(&sub);
    let (_, items) = next_data_change(&mut events, EVENT_WAIT).await;
    assert_eq!(statuses_of(&items, handle), vec![StatusCode::BAD_USER_ACCESS_DENIED]);
    assert!(values_of(&items, handle).is_empty());

    let session_before = client.session().unwrap().session_id;
    client.activate_session(IdentityFixtures::engineer()).await.unwrap();
    assert_eq!(client.identity(), IdentityFixtures::engineer());
    assert_eq!(client.session().unwrap().session_id, session_before);

    let (_, items) = next_data_change(&mut events, Duration::from_millis(105)).await;
    assert_eq!(statuses_of(&items, handle), vec![StatusCode::GOOD]);
    assert_int_values(&items, handle, &[33]);
    assert_eq!(sub.item_count(), 1);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_identity_downgrade_withholds_data() {
    let mut harness = UaHarness::start(ConfigFixtures::server());
    let (client, _) = harness.connected_client(IdentityFixtures::engineer()).await;

    let sub = client
        .create_subscription(ConfigFixtures::subscription(100, 10))
        .await
        .unwrap();
    let created = client
        .create_monitored_items(
            &sub,
            TimestampsToReturn::Both,
            vec![
                ItemRequestBuilder::value(NodeFixtures::restricted()).build(),
                ItemRequestBuilder::value(NodeFixtures::variable(1)).build(),
            ],
        )
        .await
        .unwrap();
    let (restricted, open) = (created[0].client_handle, created[1].client_handle);
    let mut events = listen(&sub);
    let (_, items) = next_data_change(&mut events, EVENT_WAIT).await;
    assert_int_values(&items, restricted, &[0]);
    assert_int_values(&items, open, &[0]);

    client.activate_session(IdentityFixtures::operator()).await.unwrap();
    let (_, items) = next_data_change(&mut events, EVENT_WAIT).await;
    assert_eq!(statuses_of(&items, restricted), vec![StatusCode::BAD_USER_ACCESS_DENIED]);
    assert!(statuses_of(&items, open).is_empty());

    // Writes to the restricted node no longer reach the operator.
    harness.write(&NodeFixtures::restricted(), 9);
    harness.write(&NodeFixtures::variable(1), 9);
    let (_, items) = next_data_change(&mut events, EVENT_WAIT).await;
    assert!(statuses_of(&items, restricted).is_empty());
    assert_int_values(&items, open, &[9]);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_identity_rejected_keeps_previous() {
    let mut harness = UaHarness::start(ConfigFixtures::server());
    let (client, _) = harness.connected_client(IdentityFixtures::operator()).await;

    let sub = client
        .create_subscription(ConfigFixtures::subscription(100, 10))
        .await
        .unwrap();
    let created = client
        .create_monitored_items(
            &sub,
            TimestampsToReturn::Both,
            vec![ItemRequestBuilder::value(NodeFixtures::restricted()).build()],
        )
        .await
        .unwrap();
    let handle = created[0].client_handle;
    let mut events = listen(&sub);
    next_data_change(&mut events, EVENT_WAIT).await;

    let err = client
        .activate_session(IdentityFixtures::wrong_password())
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            UaError::Session(SessionError::ActivationRejected {
                status: StatusCode::BAD_IDENTITY_TOKEN_REJECTED
            })
        ),
        "unexpected error: {}",
        err
    );
    assert_eq!(client.identity(), IdentityFixtures::operator());
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(harness.server().stats().activations_rejected(), 1);

    // Nothing was re-evaluated: the item stays denied and silent.
    harness.write(&NodeFixtures::restricted(), 5);
    assert_no_data_change(&mut events, Duration::from_secs(1)).await;
    assert!(sub.item(handle).is_some());

    harness.shutdown().await;
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_session_disconnect_deletes_subscriptions() {
    let mut harness = UaHarness::start(ConfigFixtures::server());
    let (client, transport) = harness.connected_client(IdentityFixtures::operator()).await;

    let sub = client
        .create_subscription(ConfigFixtures::subscription(100, 10))
        .await
        .unwrap();
    assert_eq!(harness.server().session_count(), 1);
    assert_eq!(harness.server().subscription_count(), 1);

    client.disconnect().await.unwrap();

    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(client.session().is_none());
    assert!(client.subscriptions().is_empty());
    assert!(!sub.is_active());
    assert_eq!(harness.server().session_count(), 0);
    assert_eq!(harness.server().subscription_count(), 0);
    assert_eq!(transport.open_channels(), 0);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_session_requests_fail_after_disconnect() {
    let mut harness = UaHarness::start(ConfigFixtures::server());
    let (client, _) = harness.connected_client(IdentityFixtures::operator()).await;
    client.disconnect().await.unwrap();

    let err = client
        .create_subscription(ConfigFixtures::subscription(100, 10))
        .await
        .unwrap_err();
    assert!(
        matches!(err, UaError::Transport(TransportError::NotConnected)),
        "unexpected error: {}",
        err
    );

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_session_each_client_has_its_own() {
    let mut harness = UaHarness::start(ConfigFixtures::server());
    let (first, _) = harness.connected_client(IdentityFixtures::operator()).await;
    let (second, _) = harness.connected_client(IdentityFixtures::operator()).await;

    let a = first.session().unwrap();
    let b = second.session().unwrap();
    assert_ne!(a.session_id, b.session_id);
    assert!(!a.same_binding(&b));
    assert_eq!(harness.server().session_count(), 2);
    assert_eq!(harness.server().stats().sessions_created(), 2);

    // A subscription of one session is invisible to the other.
    let sub = first
        .create_subscription(ConfigFixtures::subscription(100, 10))
        .await
        .unwrap();
    let adopted = second.subscription(sub.id());
    assert!(adopted.is_none());
    let err = second
        .modify_subscription(&sub, ConfigFixtures::subscription(200, 10))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        UaError::Service(ServiceError::Fault {
            status: StatusCode::BAD_SUBSCRIPTION_ID_INVALID,
            ..
        })
    ));

    harness.shutdown().await;
}

// =============================================================================
// Republish Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_republish_unknown_sequence_number() {
    let mut harness = UaHarness::start(ConfigFixtures::server());
    let (client, _) = harness.connected_client(IdentityFixtures::operator()).await;

    let sub = client
        .create_subscription(ConfigFixtures::subscription(100, 10))
        .await
        .unwrap();

    let err = client.republish(&sub, 4_000).await.unwrap_err();
    assert!(matches!(
        err,
        UaError::Service(ServiceError::Fault {
            status: StatusCode::BAD_MESSAGE_NOT_AVAILABLE,
            ..
        })
    ));
    assert_eq!(client.stats().republish_requests(), 1);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_republish_fills_sequence_gap() {
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
    let mut events = listen(&sub);
    let (first, _) = next_data_change(&mut events, EVENT_WAIT).await;

    transport.drop_data_responses(1);
    harness.write(&node, 5);
    tokio::time::sleep(Duration::from_millis(250)).await;
    harness.write(&node, 6);

    // The lost message is fetched and delivered ahead of the newer one.
    let (seq, items) = next_data_change(&mut events, EVENT_WAIT).await;
    assert_eq!(seq, first + 1);
    assert_int_values(&items, handle, &[5]);
    let (seq, items) = next_data_change(&mut events, EVENT_WAIT).await;
    assert_eq!(seq, first + 2);
    assert_int_values(&items, handle, &[6]);

    assert_eq!(client.stats().republish_requests(), 1);
    assert_eq!(client.stats().messages_lost(), 0);
    assert_eq!(client.state(), ConnectionState::Connected);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_republish_gap_found_by_keep_alive() {
    let mut harness = UaHarness::start(ConfigFixtures::server());
    let (client, transport) = harness.connected_client(IdentityFixtures::operator()).await;
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
    let (first, _) = next_data_change(&mut events, EVENT_WAIT).await;

    transport.drop_data_responses(1);
    harness.write(&node, 8);

    // Nothing else changes; the next keep-alive exposes the gap.
    let (seq, items) = next_data_change(&mut events, EVENT_WAIT).await;
    assert_eq!(seq, first + 1);
    assert_int_values(&items, handle, &[8]);
    match next_event(&mut events, EVENT_WAIT).await {
        SubscriptionEvent::KeepAlive { next_sequence_number } => {
            assert_eq!(next_sequence_number, first + 2)
        }
        other => panic!("expected a keep-alive, got {:?}", other),
    }
    assert_eq!(client.stats().republish_requests(), 1);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_republish_unavailable_reports_data_lost() {
    let mut config = ConfigFixtures::server();
    config.limits.max_retransmission_queue = 1;
    let mut harness = UaHarness::start(config);
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
    let mut events = listen(&sub);
    let (first, _) = next_data_change(&mut events, EVENT_WAIT).await;

    // The next message pushes the lost one out of the server's queue.
    transport.drop_data_responses(1);
    harness.write(&node, 5);
    tokio::time::sleep(Duration::from_millis(250)).await;
    harness.write(&node, 6);

    match next_event(&mut events, EVENT_WAIT).await {
        SubscriptionEvent::DataLost { sequence_number } => assert_eq!(sequence_number, first + 1),
        other => panic!("expected lost data, got {:?}", other),
    }
    let (seq, items) = next_data_change(&mut events, EVENT_WAIT).await;
    assert_eq!(seq, first + 2);
    assert_int_values(&items, handle, &[6]);

    assert_eq!(client.stats().republish_requests(), 1);
    assert_eq!(client.stats().messages_lost(), 1);
    assert_eq!(client.state(), ConnectionState::Connected);

    harness.shutdown().await;
}
