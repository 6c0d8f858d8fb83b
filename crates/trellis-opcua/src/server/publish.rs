// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Publish dispatch: matching ready messages with parked publish requests.
//!
//! Requests are consumed oldest first. For each request the session first
//! pays out owed status-change messages, then serves the ready subscription
//! with the smallest `(ready instant, higher priority, creation order)` key.

use std::collections::HashMap;

use trellis_core::{StatusCode, SubscriptionId};

use crate::messages::{NotificationMessage, PublishResponse, Response, ResponseBody};

use super::session::{PendingPublish, ServerSession};
use super::subscription::Subscription;

/// Outcome of a dispatch pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Messages carrying data or events.
    pub data_messages: usize,
    /// Keep-alive messages.
    pub keep_alives: usize,
    /// Status-change messages.
    pub status_changes: usize,
}

impl DispatchSummary {
    /// Total responses sent.
    pub fn total(&self) -> usize {
        self.data_messages + self.keep_alives + self.status_changes
    }
}

/// Answers as many parked requests of `session` as there are ready messages.
pub fn dispatch(
    session: &mut ServerSession,
    subscriptions: &mut HashMap<SubscriptionId, Subscription>,
    retransmission_limit: usize,
) -> DispatchSummary {
    let mut summary = DispatchSummary::default();

    while let Some(pending) = session.next_request() {
        if let Some((subscription_id, message)) = session.pop_status() {
            let more = session.has_status() || has_ready(session, subscriptions);
            summary.status_changes += 1;
            send(session, pending, subscription_id, message, more);
            continue;
        }

        let candidate = session
            .subscriptions()
            .filter_map(|id| subscriptions.get(&id))
            .filter_map(|s| s.dispatch_key().map(|key| (key, s.id())))
            .min();

        let Some((_, subscription_id)) = candidate else {
            session.unpark(pending);
            break;
        };
        let Some(message) = subscriptions
            .get_mut(&subscription_id)
            .and_then(Subscription::take_message)
        else {
            session.unpark(pending);
            break;
        };

        if message.carries_data() {
            session.remember(subscription_id, message.clone(), retransmission_limit);
            summary.data_messages += 1;
        } else {
            summary.keep_alives += 1;
        }
        let more = has_ready(session, subscriptions);
        send(session, pending, subscription_id, message, more);
    }

    if summary.total() > 0 {
        tracing::trace!(
            session_id = %session.id(),
            data = summary.data_messages,
            keep_alives = summary.keep_alives,
            status_changes = summary.status_changes,
            "Publish responses dispatched"
        );
    }
    summary
}

/// Fails parked requests with `BadNoSubscription` when nothing can ever
/// answer them.
pub fn fail_if_idle(session: &mut ServerSession) -> usize {
    if session.subscription_count() > 0 || session.has_status() {
        return 0;
    }
    let drained = session.drain_requests();
    let count = drained.len();
    for pending in drained {
        pending.fail(StatusCode::BAD_NO_SUBSCRIPTION);
    }
    count
}

fn has_ready(session: &ServerSession, subscriptions: &HashMap<SubscriptionId, Subscription>) -> bool {
    session
        .subscriptions()
        .filter_map(|id| subscriptions.get(&id))
        .any(Subscription::has_ready)
}

fn send(
    session: &ServerSession,
    pending: PendingPublish,
    subscription_id: SubscriptionId,
    message: NotificationMessage,
    more_notifications: bool,
) {
    let PendingPublish {
        request_handle,
        ack_results,
        responder,
        ..
    } = pending;

    let body = PublishResponse {
        subscription_id,
        available_sequence_numbers: session.available_sequence_numbers(subscription_id),
        more_notifications,
        notification_message: message,
        results: ack_results,
    };
    if responder
        .send(Response::ok(request_handle, ResponseBody::Publish(body)))
        .is_err()
    {
        tracing::debug!(
            session_id = %session.id(),
            subscription_id = %subscription_id,
            "Publish requester went away; message stays available for republish"
        );
    }
}
