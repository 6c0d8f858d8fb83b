// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Server-side session.
//!
//! A session owns its parked publish requests, a bounded retransmission
//! queue of unacknowledged data messages, and the status-change messages
//! owed to it (subscription transferred away or expired).

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use trellis_core::{AuthToken, ChannelId, SessionId, StatusCode, SubscriptionId};

use crate::identity::UserIdentity;
use crate::messages::{NotificationMessage, Response, SubscriptionAcknowledgement};

/// A publish request parked until a subscription has something to send.
#[derive(Debug)]
pub struct PendingPublish {
    /// Handle echoed in the response.
    pub request_handle: u32,
    /// When the request expires with `BadTimeout`.
    pub deadline: Option<Instant>,
    /// Per-acknowledgement results computed on arrival.
    pub ack_results: Vec<StatusCode>,
    /// Where the response goes.
    pub responder: oneshot::Sender<Response>,
}

impl PendingPublish {
    /// Answers the request; a vanished requester is not an error.
    pub fn respond(self, response: Response) {
        if self.responder.send(response).is_err() {
            tracing::trace!(request_handle = self.request_handle, "Publish requester went away");
        }
    }

    /// Answers the request with a service fault.
    pub fn fail(self, status: StatusCode) {
        let handle = self.request_handle;
        self.respond(Response::fault(handle, status));
    }

    fn is_abandoned(&self) -> bool {
        self.responder.is_closed()
    }
}

/// A server-side session.
pub struct ServerSession {
    id: SessionId,
    auth_token: AuthToken,
    name: String,
    timeout: Duration,
    identity: Option<UserIdentity>,
    channel: ChannelId,
    last_activity: Instant,
    subscriptions: BTreeSet<SubscriptionId>,
    retired: BTreeSet<SubscriptionId>,
    publish_queue: VecDeque<PendingPublish>,
    retransmission: VecDeque<(SubscriptionId, NotificationMessage)>,
    pending_status: VecDeque<(SubscriptionId, NotificationMessage)>,
}

impl ServerSession {
    /// Creates an unactivated session bound to `channel`.
    pub fn new(
        id: SessionId,
        name: impl Into<String>,
        timeout: Duration,
        channel: ChannelId,
        now: Instant,
    ) -> Self {
        Self {
            id,
            auth_token: AuthToken::generate(),
            name: name.into(),
            timeout,
            identity: None,
            channel,
            last_activity: now,
            subscriptions: BTreeSet::new(),
            retired: BTreeSet::new(),
            publish_queue: VecDeque::new(),
            retransmission: VecDeque::new(),
            pending_status: VecDeque::new(),
        }
    }

    /// Session id.
    #[inline]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Authentication token.
    #[inline]
    pub fn auth_token(&self) -> AuthToken {
        self.auth_token
    }

    /// Session name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Revised timeout.
    #[inline]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Bound channel.
    #[inline]
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Current identity, `None` until activated.
    pub fn identity(&self) -> Option<&UserIdentity> {
        self.identity.as_ref()
    }

    /// Returns `true` once activated.
    #[inline]
    pub fn is_activated(&self) -> bool {
        self.identity.is_some()
    }

    /// Applies an accepted activation: identity and channel swap together.
    pub fn activate(&mut self, identity: UserIdentity, channel: ChannelId) {
        if channel != self.channel {
            tracing::debug!(session_id = %self.id, from = %self.channel, to = %channel, "Session moved to new channel");
            // Requests parked on the old channel can no longer be answered.
            for pending in self.publish_queue.drain(..) {
                pending.fail(StatusCode::BAD_SECURE_CHANNEL_ID_INVALID);
            }
        }
        self.identity = Some(identity);
        self.channel = channel;
    }

    /// Records activity.
    #[inline]
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// When the session times out.
    pub fn expires_at(&self) -> Instant {
        self.last_activity + self.timeout
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Subscriptions owned by this session.
    pub fn subscriptions(&self) -> impl Iterator<Item = SubscriptionId> + '_ {
        self.subscriptions.iter().copied()
    }

    /// Number of owned subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Returns `true` if the session owns `id`.
    pub fn owns(&self, id: SubscriptionId) -> bool {
        self.subscriptions.contains(&id)
    }

    /// Returns `true` if `id` used to belong to this session.
    pub fn has_retired(&self, id: SubscriptionId) -> bool {
        self.retired.contains(&id)
    }

    /// Takes ownership of a subscription.
    pub fn attach(&mut self, id: SubscriptionId) {
        self.retired.remove(&id);
        self.subscriptions.insert(id);
    }

    /// Gives up a subscription that was deleted, expired or transferred.
    pub fn retire(&mut self, id: SubscriptionId) {
        if self.subscriptions.remove(&id) {
            self.retired.insert(id);
        }
        self.drop_retransmissions(id);
    }

    /// Releases every owned subscription id.
    pub fn take_subscriptions(&mut self) -> Vec<SubscriptionId> {
        std::mem::take(&mut self.subscriptions).into_iter().collect()
    }

    // -------------------------------------------------------------------------
    // Publish requests
    // -------------------------------------------------------------------------

    /// Parks a publish request; returns the oldest one if the limit was hit.
    pub fn park(&mut self, pending: PendingPublish, limit: usize) -> Option<PendingPublish> {
        self.publish_queue.push_back(pending);
        if self.publish_queue.len() > limit.max(1) {
            self.publish_queue.pop_front()
        } else {
            None
        }
    }

    /// Number of parked requests still being waited on.
    pub fn available_requests(&self) -> usize {
        self.publish_queue.iter().filter(|p| !p.is_abandoned()).count()
    }

    /// Takes the oldest parked request whose requester is still waiting.
    pub fn next_request(&mut self) -> Option<PendingPublish> {
        while let Some(pending) = self.publish_queue.pop_front() {
            if !pending.is_abandoned() {
                return Some(pending);
            }
        }
        None
    }

    /// Puts a request back at the front of the queue.
    pub fn unpark(&mut self, pending: PendingPublish) {
        self.publish_queue.push_front(pending);
    }

    /// Removes requests past their deadline.
    pub fn expired_requests(&mut self, now: Instant) -> Vec<PendingPublish> {
        let (expired, live): (Vec<_>, Vec<_>) = self
            .publish_queue
            .drain(..)
            .partition(|p| p.deadline.map_or(false, |d| d <= now));
        self.publish_queue = live.into();
        expired
    }

    /// Removes every parked request.
    pub fn drain_requests(&mut self) -> Vec<PendingPublish> {
        self.publish_queue.drain(..).collect()
    }

    /// Earliest parked request deadline.
    pub fn next_request_deadline(&self) -> Option<Instant> {
        self.publish_queue.iter().filter_map(|p| p.deadline).min()
    }

    // -------------------------------------------------------------------------
    // Status changes
    // -------------------------------------------------------------------------

    /// Queues a status-change message owed to this session.
    pub fn push_status(&mut self, id: SubscriptionId, message: NotificationMessage) {
        self.pending_status.push_back((id, message));
    }

    /// Takes the oldest owed status-change message.
    pub fn pop_status(&mut self) -> Option<(SubscriptionId, NotificationMessage)> {
        self.pending_status.pop_front()
    }

    /// Returns `true` if a status-change message is owed.
    pub fn has_status(&self) -> bool {
        !self.pending_status.is_empty()
    }

    // -------------------------------------------------------------------------
    // Retransmission
    // -------------------------------------------------------------------------

    /// Keeps a sent data message until acknowledged.
    pub fn remember(&mut self, id: SubscriptionId, message: NotificationMessage, limit: usize) {
        self.retransmission.push_back((id, message));
        while self.retransmission.len() > limit {
            if let Some((sub, dropped)) = self.retransmission.pop_front() {
                tracing::debug!(
                    subscription_id = %sub,
                    sequence_number = dropped.sequence_number,
                    "Retransmission queue full, oldest message dropped"
                );
            }
        }
    }

    /// Applies acknowledgements, one status per entry.
    pub fn acknowledge(&mut self, acks: &[SubscriptionAcknowledgement]) -> Vec<StatusCode> {
        acks.iter()
            .map(|ack| {
                if !self.owns(ack.subscription_id) {
                    return StatusCode::BAD_SUBSCRIPTION_ID_INVALID;
                }
                let position = self.retransmission.iter().position(|(id, m)| {
                    *id == ack.subscription_id && m.sequence_number == ack.sequence_number
                });
                match position {
                    Some(index) => {
                        self.retransmission.remove(index);
                        StatusCode::GOOD
                    }
                    None => StatusCode::BAD_SEQUENCE_NUMBER_UNKNOWN,
                }
            })
            .collect()
    }

    /// Sequence numbers of `id` still available for republish.
    pub fn available_sequence_numbers(&self, id: SubscriptionId) -> Vec<u32> {
        self.retransmission
            .iter()
            .filter(|(sub, _)| *sub == id)
            .map(|(_, m)| m.sequence_number)
            .collect()
    }

    /// Looks up a message for Republish.
    pub fn republish(&self, id: SubscriptionId, sequence_number: u32) -> Option<NotificationMessage> {
        self.retransmission
            .iter()
            .find(|(sub, m)| *sub == id && m.sequence_number == sequence_number)
            .map(|(_, m)| m.clone())
    }

    /// Removes and returns the unacknowledged messages of `id`.
    pub fn take_retransmissions(&mut self, id: SubscriptionId) -> Vec<NotificationMessage> {
        let (taken, kept): (Vec<_>, Vec<_>) = self
            .retransmission
            .drain(..)
            .partition(|(sub, _)| *sub == id);
        self.retransmission = kept.into();
        taken.into_iter().map(|(_, m)| m).collect()
    }

    fn drop_retransmissions(&mut self, id: SubscriptionId) {
        self.retransmission.retain(|(sub, _)| *sub != id);
    }
}

impl fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSession")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("channel", &self.channel)
            .field("identity", &self.identity)
            .field("subscriptions", &self.subscriptions)
            .field("parked_requests", &self.publish_queue.len())
            .field("unacknowledged", &self.retransmission.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> ServerSession {
        let mut s = ServerSession::new(
            SessionId(1),
            "test",
            Duration::from_secs(30),
            ChannelId(1),
            Instant::now(),
        );
        s.attach(SubscriptionId(7));
        s
    }

    fn data(seq: u32) -> NotificationMessage {
        let mut m = NotificationMessage::keep_alive(seq);
        m.notification_data.push(crate::messages::NotificationData::DataChange(
            Default::default(),
        ));
        m
    }

    fn pending(handle: u32) -> (PendingPublish, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        (
            PendingPublish {
                request_handle: handle,
                deadline: None,
                ack_results: Vec::new(),
                responder: tx,
            },
            rx,
        )
    }

    #[test]
    fn test_acknowledge() {
        let mut s = session();
        s.remember(SubscriptionId(7), data(1), 10);
        s.remember(SubscriptionId(7), data(2), 10);
        let results = s.acknowledge(&[
            SubscriptionAcknowledgement {
                subscription_id: SubscriptionId(7),
                sequence_number: 1,
            },
            SubscriptionAcknowledgement {
                subscription_id: SubscriptionId(7),
                sequence_number: 1,
            },
            SubscriptionAcknowledgement {
                subscription_id: SubscriptionId(8),
                sequence_number: 2,
            },
        ]);
        assert_eq!(
            results,
            vec![
                StatusCode::GOOD,
                StatusCode::BAD_SEQUENCE_NUMBER_UNKNOWN,
                StatusCode::BAD_SUBSCRIPTION_ID_INVALID
            ]
        );
        assert_eq!(s.available_sequence_numbers(SubscriptionId(7)), vec![2]);
    }

    #[test]
    fn test_retransmission_is_bounded() {
        let mut s = session();
        for seq in 1..=5 {
            s.remember(SubscriptionId(7), data(seq), 3);
        }
        assert_eq!(s.available_sequence_numbers(SubscriptionId(7)), vec![3, 4, 5]);
        assert!(s.republish(SubscriptionId(7), 1).is_none());
        assert!(s.republish(SubscriptionId(7), 4).is_some());
    }

    #[test]
    fn test_park_evicts_oldest() {
        let mut s = session();
        let (a, _ra) = pending(1);
        let (b, _rb) = pending(2);
        assert!(s.park(a, 1).is_none());
        let evicted = s.park(b, 1).unwrap();
        assert_eq!(evicted.request_handle, 1);
        assert_eq!(s.available_requests(), 1);
    }

    #[test]
    fn test_abandoned_requests_are_skipped() {
        let mut s = session();
        let (a, ra) = pending(1);
        let (b, _rb) = pending(2);
        s.park(a, 10);
        s.park(b, 10);
        drop(ra);
        assert_eq!(s.available_requests(), 1);
        assert_eq!(s.next_request().unwrap().request_handle, 2);
    }

    #[test]
    fn test_retire_remembers_id() {
        let mut s = session();
        s.remember(SubscriptionId(7), data(1), 10);
        s.retire(SubscriptionId(7));
        assert!(!s.owns(SubscriptionId(7)));
        assert!(s.has_retired(SubscriptionId(7)));
        assert!(s.available_sequence_numbers(SubscriptionId(7)).is_empty());
        s.attach(SubscriptionId(7));
        assert!(!s.has_retired(SubscriptionId(7)));
    }
}
