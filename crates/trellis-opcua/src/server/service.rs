// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! The subscription server: session, subscription, monitored item and
//! publish services over shared state.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     SubscriptionServer                       │
//! │  handle_request(channel, Request) ──► Mutex<ServerState>     │
//! │  notify_value_changed / notify_event (data source)           │
//! │  tick_at(now)  (driven by ServerRuntime)                     │
//! └──────────────────────────────────────────────────────────────┘
//!         │                    │                       │
//!         ▼                    ▼                       ▼
//!  ┌─────────────┐     ┌───────────────┐      ┌──────────────────┐
//!  │ServerSession│ ◄── │ Subscription  │ ───► │  MonitoredItem   │
//!  │ parked pubs │ own │ counters, seq │      │ queue, filter    │
//!  └─────────────┘     └───────────────┘      └──────────────────┘
//!         ▲                    ▲
//!         └─── NodeCatalog, IdentityValidator, PermissionResolver
//! ```
//!
//! All state lives behind one mutex that is never held across an await.
//! Publish requests park a oneshot responder and are answered by the
//! dispatcher whenever a subscription becomes ready.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use trellis_core::{
    AuthToken, ChannelId, DataValue, MonitoredItemId, MonitoringMode, NodeId, NumericRange,
    SessionId, StatusCode, SubscriptionId, TimestampsToReturn, UaResult, Variant,
};

use crate::config::{ServerConfig, ServerLimits};
use crate::filter::ResolvedFilter;
use crate::identity::{
    can_access_contained, validate_contained, AllowAll, IdentityValidator, PermissionResolver,
    StaticUserValidator, UserIdentity,
};
use crate::messages::*;

use super::catalog::{NodeCatalog, StaticCatalog};
use super::monitored_item::{ItemSettings, ItemTarget, MonitoredItem};
use super::publish::{dispatch, fail_if_idle};
use super::session::{PendingPublish, ServerSession};
use super::subscription::{Subscription, SubscriptionDiagnostics, SubscriptionParams, TickOutcome};

type ServiceResult = Result<ResponseBody, StatusCode>;

// =============================================================================
// ServerStats
// =============================================================================

/// Server counters.
#[derive(Debug, Default)]
pub struct ServerStats {
    sessions_created: AtomicU64,
    sessions_timed_out: AtomicU64,
    activations_rejected: AtomicU64,
    subscriptions_created: AtomicU64,
    subscriptions_expired: AtomicU64,
    subscriptions_transferred: AtomicU64,
    publish_requests: AtomicU64,
    data_messages_sent: AtomicU64,
    keep_alives_sent: AtomicU64,
}

impl ServerStats {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    /// Sessions created.
    pub fn sessions_created(&self) -> u64 {
        self.sessions_created.load(Ordering::Relaxed)
    }

    /// Sessions closed by timeout.
    pub fn sessions_timed_out(&self) -> u64 {
        self.sessions_timed_out.load(Ordering::Relaxed)
    }

    /// Activations rejected.
    pub fn activations_rejected(&self) -> u64 {
        self.activations_rejected.load(Ordering::Relaxed)
    }

    /// Subscriptions created.
    pub fn subscriptions_created(&self) -> u64 {
        self.subscriptions_created.load(Ordering::Relaxed)
    }

    /// Subscriptions expired by lifetime.
    pub fn subscriptions_expired(&self) -> u64 {
        self.subscriptions_expired.load(Ordering::Relaxed)
    }

    /// Subscriptions transferred between sessions.
    pub fn subscriptions_transferred(&self) -> u64 {
        self.subscriptions_transferred.load(Ordering::Relaxed)
    }

    /// Publish requests received.
    pub fn publish_requests(&self) -> u64 {
        self.publish_requests.load(Ordering::Relaxed)
    }

    /// Data or event messages sent.
    pub fn data_messages_sent(&self) -> u64 {
        self.data_messages_sent.load(Ordering::Relaxed)
    }

    /// Keep-alive messages sent.
    pub fn keep_alives_sent(&self) -> u64 {
        self.keep_alives_sent.load(Ordering::Relaxed)
    }
}

// =============================================================================
// ServerState
// =============================================================================

#[derive(Default)]
struct ServerState {
    sessions: HashMap<SessionId, ServerSession>,
    tokens: HashMap<AuthToken, SessionId>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    latest_values: HashMap<NodeId, DataValue>,
    next_session_id: u32,
    next_subscription_id: u32,
    next_item_id: u32,
    next_creation_seq: u64,
}

impl ServerState {
    fn allocate_session_id(&mut self) -> SessionId {
        self.next_session_id += 1;
        SessionId(self.next_session_id)
    }

    fn allocate_subscription_id(&mut self) -> (SubscriptionId, u64) {
        self.next_subscription_id += 1;
        self.next_creation_seq += 1;
        (
            SubscriptionId(self.next_subscription_id),
            self.next_creation_seq,
        )
    }

    /// Resolves and checks the session a request runs under.
    fn authorize(
        &mut self,
        channel: ChannelId,
        token: AuthToken,
        now: Instant,
    ) -> Result<SessionId, StatusCode> {
        let id = *self
            .tokens
            .get(&token)
            .ok_or(StatusCode::BAD_SESSION_ID_INVALID)?;
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(StatusCode::BAD_SESSION_ID_INVALID)?;
        if !session.is_activated() {
            return Err(StatusCode::BAD_SESSION_NOT_ACTIVATED);
        }
        if session.channel() != channel {
            return Err(StatusCode::BAD_SECURE_CHANNEL_ID_INVALID);
        }
        session.touch(now);
        Ok(id)
    }

    /// Looks up a subscription owned by `session`.
    fn owned_subscription(
        &mut self,
        session: SessionId,
        id: SubscriptionId,
    ) -> Result<&mut Subscription, StatusCode> {
        let owns = self
            .sessions
            .get(&session)
            .map_or(false, |s| s.owns(id));
        if !owns {
            return Err(StatusCode::BAD_SUBSCRIPTION_ID_INVALID);
        }
        self.subscriptions
            .get_mut(&id)
            .ok_or(StatusCode::BAD_SUBSCRIPTION_ID_INVALID)
    }

    fn identity_of(&self, session: SessionId) -> UserIdentity {
        self.sessions
            .get(&session)
            .and_then(|s| s.identity().cloned())
            .unwrap_or_default()
    }

    /// Removes a session, deleting or detaching its subscriptions and
    /// answering its parked requests with `parked_status`.
    fn remove_session(&mut self, id: SessionId, delete_subscriptions: bool, parked_status: StatusCode) -> bool {
        let Some(mut session) = self.sessions.remove(&id) else {
            return false;
        };
        self.tokens.remove(&session.auth_token());

        for sub_id in session.take_subscriptions() {
            if delete_subscriptions {
                if let Some(mut sub) = self.subscriptions.remove(&sub_id) {
                    sub.close();
                }
            } else if let Some(sub) = self.subscriptions.get_mut(&sub_id) {
                sub.detach();
            }
        }
        for pending in session.drain_requests() {
            pending.fail(parked_status);
        }
        tracing::info!(session_id = %id, delete_subscriptions, "Session removed");
        true
    }

    /// Drops an expired subscription and tells its owner.
    fn expire_subscription(&mut self, id: SubscriptionId) {
        let Some(sub) = self.subscriptions.remove(&id) else {
            return;
        };
        if let Some(session) = sub.owner().and_then(|o| self.sessions.get_mut(&o)) {
            session.retire(id);
            session.push_status(
                id,
                NotificationMessage::status_change(sub.next_sequence_number(), StatusCode::BAD_TIMEOUT),
            );
        }
    }
}

// =============================================================================
// SubscriptionServer
// =============================================================================

/// The server-side subscription engine.
pub struct SubscriptionServer {
    config: ServerConfig,
    state: Mutex<ServerState>,
    catalog: Arc<dyn NodeCatalog>,
    validator: Arc<dyn IdentityValidator>,
    permissions: Arc<dyn PermissionResolver>,
    wake: Notify,
    stats: ServerStats,
}

impl SubscriptionServer {
    /// Creates a builder.
    pub fn builder() -> SubscriptionServerBuilder {
        SubscriptionServerBuilder::default()
    }

    /// Configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Counters.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Woken whenever a request may have moved the next deadline.
    pub fn wake_signal(&self) -> &Notify {
        &self.wake
    }

    fn limits(&self) -> &ServerLimits {
        &self.config.limits
    }

    // -------------------------------------------------------------------------
    // Request entry point
    // -------------------------------------------------------------------------

    /// Handles one request arriving on `channel`.
    ///
    /// Publish requests complete when a notification is ready, when they
    /// expire, or when their session goes away.
    pub async fn handle_request(&self, channel: ChannelId, request: Request) -> Response {
        let Request { header, body } = request;
        let handle = header.request_handle;
        let service = body.service_name();
        let now = Instant::now();

        let outcome = match body {
            RequestBody::Publish(publish) => match self.publish(channel, &header, publish, now) {
                Ok(receiver) => {
                    self.wake.notify_one();
                    return receiver
                        .await
                        .unwrap_or_else(|_| Response::fault(handle, StatusCode::BAD_SESSION_CLOSED));
                }
                Err(status) => Err(status),
            },
            other => self.call(channel, &header, other, now),
        };
        self.wake.notify_one();

        match outcome {
            Ok(body) => Response::ok(handle, body),
            Err(status) => {
                tracing::debug!(service, status = %status, "Service fault");
                Response::fault(handle, status)
            }
        }
    }

    fn call(&self, channel: ChannelId, header: &RequestHeader, body: RequestBody, now: Instant) -> ServiceResult {
        let mut state = self.state.lock();
        match body {
            RequestBody::CreateSession(req) => self.create_session(&mut state, channel, req, now),
            RequestBody::ActivateSession(req) => {
                self.activate_session(&mut state, channel, header.auth_token, req, now)
            }
            other => {
                let session = state.authorize(channel, header.auth_token, now)?;
                match other {
                    RequestBody::CloseSession(req) => {
                        state.remove_session(session, req.delete_subscriptions, StatusCode::BAD_SESSION_CLOSED);
                        Ok(ResponseBody::CloseSession)
                    }
                    RequestBody::CreateSubscription(req) => {
                        self.create_subscription(&mut state, session, req, now)
                    }
                    RequestBody::ModifySubscription(req) => {
                        self.modify_subscription(&mut state, session, req, now)
                    }
                    RequestBody::SetPublishingMode(req) => self.set_publishing_mode(&mut state, session, req),
                    RequestBody::DeleteSubscriptions(req) => self.delete_subscriptions(&mut state, session, req),
                    RequestBody::TransferSubscriptions(req) => {
                        self.transfer_subscriptions(&mut state, session, req, now)
                    }
                    RequestBody::CreateMonitoredItems(req) => {
                        self.create_monitored_items(&mut state, session, req, now)
                    }
                    RequestBody::ModifyMonitoredItems(req) => {
                        self.modify_monitored_items(&mut state, session, req)
                    }
                    RequestBody::SetMonitoringMode(req) => {
                        self.set_monitoring_mode(&mut state, session, req, now)
                    }
                    RequestBody::SetTriggering(req) => self.set_triggering(&mut state, session, req),
                    RequestBody::DeleteMonitoredItems(req) => {
                        self.delete_monitored_items(&mut state, session, req)
                    }
                    RequestBody::Republish(req) => self.republish(&mut state, session, req),
                    RequestBody::CreateSession(_)
                    | RequestBody::ActivateSession(_)
                    | RequestBody::Publish(_) => Err(StatusCode::BAD_INTERNAL_ERROR),
                }
            }
        }
    }

    fn check_batch(&self, len: usize) -> Result<(), StatusCode> {
        if len == 0 {
            Err(StatusCode::BAD_NOTHING_TO_DO)
        } else if len > self.limits().max_operations_per_call {
            Err(StatusCode::BAD_TOO_MANY_OPERATIONS)
        } else {
            Ok(())
        }
    }

    // -------------------------------------------------------------------------
    // Session services
    // -------------------------------------------------------------------------

    fn create_session(
        &self,
        state: &mut ServerState,
        channel: ChannelId,
        req: CreateSessionRequest,
        now: Instant,
    ) -> ServiceResult {
        if state.sessions.len() >= self.limits().max_sessions {
            return Err(StatusCode::BAD_TOO_MANY_SESSIONS);
        }
        let id = state.allocate_session_id();
        let timeout = req
            .requested_timeout
            .clamp(self.config.min_session_timeout, self.config.max_session_timeout);
        let session = ServerSession::new(id, req.session_name, timeout, channel, now);
        let auth_token = session.auth_token();

        tracing::info!(session_id = %id, name = session.name(), channel = %channel, "Session created");
        state.tokens.insert(auth_token, id);
        state.sessions.insert(id, session);
        ServerStats::bump(&self.stats.sessions_created, 1);

        Ok(ResponseBody::CreateSession(CreateSessionResponse {
            session_id: id,
            auth_token,
            revised_timeout: timeout,
        }))
    }

    /// Activation is computed completely before anything is applied:
    /// the identity is validated, then access is resolved for every live
    /// item. Any failure rejects the activation and leaves the session as
    /// it was.
    fn activate_session(
        &self,
        state: &mut ServerState,
        channel: ChannelId,
        token: AuthToken,
        req: ActivateSessionRequest,
        now: Instant,
    ) -> ServiceResult {
        let session_id = *state
            .tokens
            .get(&token)
            .ok_or(StatusCode::BAD_SESSION_ID_INVALID)?;

        let plan = self.plan_activation(state, session_id, &req);
        let (identity, access) = match plan {
            Ok(plan) => plan,
            Err(status) => {
                ServerStats::bump(&self.stats.activations_rejected, 1);
                tracing::warn!(session_id = %session_id, status = %status, "Activation rejected");
                return Err(status);
            }
        };

        let ServerState {
            sessions,
            subscriptions,
            ..
        } = state;
        let session = sessions
            .get_mut(&session_id)
            .ok_or(StatusCode::BAD_SESSION_ID_INVALID)?;
        session.activate(identity.clone(), channel);
        session.touch(now);

        let mut changed = 0;
        for (sub_id, items) in access {
            if let Some(sub) = subscriptions.get_mut(&sub_id) {
                sub.set_owner_identity(identity.clone());
                changed += sub.apply_access(&items, now);
            }
        }
        tracing::info!(
            session_id = %session_id,
            user = %identity,
            items_changed = changed,
            "Session activated"
        );

        Ok(ResponseBody::ActivateSession(ActivateSessionResponse { session_id }))
    }

    #[allow(clippy::type_complexity)]
    fn plan_activation(
        &self,
        state: &ServerState,
        session_id: SessionId,
        req: &ActivateSessionRequest,
    ) -> Result<(UserIdentity, Vec<(SubscriptionId, HashMap<MonitoredItemId, bool>)>), StatusCode> {
        let identity = validate_contained(self.validator.as_ref(), &req.identity)?;
        let session = state
            .sessions
            .get(&session_id)
            .ok_or(StatusCode::BAD_SESSION_ID_INVALID)?;

        let mut plan = Vec::new();
        for sub_id in session.subscriptions() {
            let Some(sub) = state.subscriptions.get(&sub_id) else {
                continue;
            };
            let mut items = HashMap::with_capacity(sub.item_count());
            for item in sub.items() {
                let target = item.target();
                let granted = can_access_contained(
                    self.permissions.as_ref(),
                    &identity,
                    &target.node_id,
                    target.attribute_id,
                )?;
                items.insert(item.id(), granted);
            }
            plan.push((sub_id, items));
        }
        Ok((identity, plan))
    }

    /// Administratively terminates a session.
    ///
    /// Its subscriptions are detached, not deleted, and its parked publish
    /// requests are answered `BadSessionIdInvalid`.
    pub fn terminate_session(&self, id: SessionId) -> bool {
        let removed = self
            .state
            .lock()
            .remove_session(id, false, StatusCode::BAD_SESSION_ID_INVALID);
        if removed {
            tracing::warn!(session_id = %id, "Session terminated by server");
            self.wake.notify_one();
        }
        removed
    }

    // -------------------------------------------------------------------------
    // Subscription services
    // -------------------------------------------------------------------------

    fn create_subscription(
        &self,
        state: &mut ServerState,
        session_id: SessionId,
        req: CreateSubscriptionRequest,
        now: Instant,
    ) -> ServiceResult {
        let count = state
            .sessions
            .get(&session_id)
            .map_or(0, ServerSession::subscription_count);
        if count >= self.limits().max_subscriptions_per_session {
            return Err(StatusCode::BAD_TOO_MANY_SUBSCRIPTIONS);
        }

        let params = SubscriptionParams {
            publishing_interval: req.publishing_interval,
            lifetime_count: req.lifetime_count,
            max_keep_alive_count: req.max_keep_alive_count,
            max_notifications_per_publish: req.max_notifications_per_publish,
            publishing_enabled: req.publishing_enabled,
            priority: req.priority,
        }
        .revise(self.limits());

        let (id, creation_seq) = state.allocate_subscription_id();
        let identity = state.identity_of(session_id);
        let response = CreateSubscriptionResponse {
            subscription_id: id,
            revised_publishing_interval: params.publishing_interval,
            revised_lifetime_count: params.lifetime_count,
            revised_max_keep_alive_count: params.max_keep_alive_count,
        };

        let sub = Subscription::new(id, creation_seq, session_id, identity, params, now);
        state.subscriptions.insert(id, sub);
        if let Some(session) = state.sessions.get_mut(&session_id) {
            session.attach(id);
        }
        ServerStats::bump(&self.stats.subscriptions_created, 1);
        tracing::info!(
            subscription_id = %id,
            session_id = %session_id,
            interval_ms = response.revised_publishing_interval.as_millis() as u64,
            keep_alive = response.revised_max_keep_alive_count,
            lifetime = response.revised_lifetime_count,
            "Subscription created"
        );

        Ok(ResponseBody::CreateSubscription(response))
    }

    fn modify_subscription(
        &self,
        state: &mut ServerState,
        session_id: SessionId,
        req: ModifySubscriptionRequest,
        now: Instant,
    ) -> ServiceResult {
        let limits = self.limits().clone();
        let sub = state.owned_subscription(session_id, req.subscription_id)?;
        let params = SubscriptionParams {
            publishing_interval: req.publishing_interval,
            lifetime_count: req.lifetime_count,
            max_keep_alive_count: req.max_keep_alive_count,
            max_notifications_per_publish: req.max_notifications_per_publish,
            publishing_enabled: sub.params().publishing_enabled,
            priority: req.priority,
        }
        .revise(&limits);
        sub.modify(params, now);

        let revised = sub.params();
        Ok(ResponseBody::ModifySubscription(ModifySubscriptionResponse {
            revised_publishing_interval: revised.publishing_interval,
            revised_lifetime_count: revised.lifetime_count,
            revised_max_keep_alive_count: revised.max_keep_alive_count,
        }))
    }

    fn set_publishing_mode(
        &self,
        state: &mut ServerState,
        session_id: SessionId,
        req: SetPublishingModeRequest,
    ) -> ServiceResult {
        self.check_batch(req.subscription_ids.len())?;
        let results = req
            .subscription_ids
            .iter()
            .map(|id| match state.owned_subscription(session_id, *id) {
                Ok(sub) => {
                    sub.set_publishing_enabled(req.publishing_enabled);
                    StatusCode::GOOD
                }
                Err(status) => status,
            })
            .collect();
        Ok(ResponseBody::SetPublishingMode(StatusResults { results }))
    }

    fn delete_subscriptions(
        &self,
        state: &mut ServerState,
        session_id: SessionId,
        req: DeleteSubscriptionsRequest,
    ) -> ServiceResult {
        self.check_batch(req.subscription_ids.len())?;
        let ServerState {
            sessions,
            subscriptions,
            ..
        } = state;
        let session = sessions
            .get_mut(&session_id)
            .ok_or(StatusCode::BAD_SESSION_ID_INVALID)?;

        let results = req
            .subscription_ids
            .iter()
            .map(|id| {
                if !session.owns(*id) {
                    return StatusCode::BAD_SUBSCRIPTION_ID_INVALID;
                }
                if let Some(mut sub) = subscriptions.remove(id) {
                    sub.close();
                }
                session.retire(*id);
                tracing::info!(subscription_id = %id, session_id = %session_id, "Subscription deleted");
                StatusCode::GOOD
            })
            .collect();

        fail_if_idle(session);
        Ok(ResponseBody::DeleteSubscriptions(StatusResults { results }))
    }

    fn transfer_subscriptions(
        &self,
        state: &mut ServerState,
        session_id: SessionId,
        req: TransferSubscriptionsRequest,
        now: Instant,
    ) -> ServiceResult {
        if !self.config.enable_transfer {
            return Err(StatusCode::BAD_NOT_IMPLEMENTED);
        }
        self.check_batch(req.subscription_ids.len())?;

        let identity = state.identity_of(session_id);
        let retransmission_limit = self.limits().max_retransmission_queue;
        let mut previous_owners = Vec::new();
        let mut results = Vec::with_capacity(req.subscription_ids.len());

        let ServerState {
            sessions,
            subscriptions,
            ..
        } = state;

        for id in &req.subscription_ids {
            let Some(sub) = subscriptions.get_mut(id) else {
                results.push(TransferResult {
                    status: StatusCode::BAD_SUBSCRIPTION_ID_INVALID,
                    available_sequence_numbers: Vec::new(),
                });
                continue;
            };
            if !sub.owner_identity().same_user(&identity) {
                tracing::warn!(subscription_id = %id, user = %identity, "Transfer denied to different user");
                results.push(TransferResult {
                    status: StatusCode::BAD_USER_ACCESS_DENIED,
                    available_sequence_numbers: Vec::new(),
                });
                continue;
            }

            let previous = sub.owner();
            let mut moved = Vec::new();
            if previous != Some(session_id) {
                sub.begin_transfer();
                if let Some(old) = previous.and_then(|o| sessions.get_mut(&o)) {
                    moved = old.take_retransmissions(*id);
                    old.retire(*id);
                    old.push_status(
                        *id,
                        NotificationMessage::status_change(
                            sub.next_sequence_number(),
                            StatusCode::GOOD_SUBSCRIPTION_TRANSFERRED,
                        ),
                    );
                    previous_owners.push(old.id());
                }

                let access: HashMap<MonitoredItemId, bool> = sub
                    .items()
                    .map(|item| {
                        let target = item.target();
                        let granted = can_access_contained(
                            self.permissions.as_ref(),
                            &identity,
                            &target.node_id,
                            target.attribute_id,
                        )
                        .unwrap_or(false);
                        (item.id(), granted)
                    })
                    .collect();
                sub.complete_transfer(session_id, identity.clone());
                sub.apply_access(&access, now);
                ServerStats::bump(&self.stats.subscriptions_transferred, 1);
                tracing::info!(
                    subscription_id = %id,
                    from = ?previous,
                    to = %session_id,
                    "Subscription transferred"
                );
            }
            if req.send_initial_values {
                sub.resend_initial_values();
            }

            let Some(session) = sessions.get_mut(&session_id) else {
                return Err(StatusCode::BAD_SESSION_ID_INVALID);
            };
            session.attach(*id);
            for message in moved {
                session.remember(*id, message, retransmission_limit);
            }
            results.push(TransferResult {
                status: StatusCode::GOOD,
                available_sequence_numbers: session.available_sequence_numbers(*id),
            });
        }

        for old_id in previous_owners {
            if let Some(old) = sessions.get_mut(&old_id) {
                dispatch(old, subscriptions, retransmission_limit);
                fail_if_idle(old);
            }
        }

        Ok(ResponseBody::TransferSubscriptions(TransferSubscriptionsResponse { results }))
    }

    // -------------------------------------------------------------------------
    // Monitored item services
    // -------------------------------------------------------------------------

    fn revise_item(
        &self,
        params: &MonitoringParameters,
        publishing_interval: std::time::Duration,
        is_event: bool,
    ) -> (std::time::Duration, u32) {
        let limits = self.limits();
        let sampling = if is_event {
            std::time::Duration::ZERO
        } else {
            params
                .sampling_interval
                .unwrap_or(publishing_interval)
                .max(limits.min_sampling_interval)
        };
        let queue = params.queue_size.clamp(1, limits.max_queue_size.max(1));
        (sampling, queue)
    }

    fn create_monitored_items(
        &self,
        state: &mut ServerState,
        session_id: SessionId,
        req: CreateMonitoredItemsRequest,
        now: Instant,
    ) -> ServiceResult {
        let identity = state.identity_of(session_id);
        state.owned_subscription(session_id, req.subscription_id)?;
        self.check_batch(req.items_to_create.len())?;

        let mut results = Vec::with_capacity(req.items_to_create.len());
        for item in req.items_to_create {
            state.next_item_id += 1;
            let id = MonitoredItemId(state.next_item_id);
            let current = state.latest_values.get(&item.item_to_monitor.node_id).cloned();
            let sub = state.owned_subscription(session_id, req.subscription_id)?;
            let result = self
                .create_item(sub, id, item, req.timestamps_to_return, &identity, current, now)
                .unwrap_or_else(MonitoredItemCreateResult::failed);
            results.push(result);
        }

        Ok(ResponseBody::CreateMonitoredItems(CreateMonitoredItemsResponse { results }))
    }

    #[allow(clippy::too_many_arguments)]
    fn create_item(
        &self,
        sub: &mut Subscription,
        id: MonitoredItemId,
        req: MonitoredItemCreateRequest,
        timestamps: TimestampsToReturn,
        identity: &UserIdentity,
        current: Option<DataValue>,
        now: Instant,
    ) -> Result<MonitoredItemCreateResult, StatusCode> {
        if sub.item_count() >= self.limits().max_monitored_items_per_subscription {
            return Err(StatusCode::BAD_TOO_MANY_MONITORED_ITEMS);
        }
        let target_req = &req.item_to_monitor;
        let index_range = target_req
            .index_range
            .as_deref()
            .map(NumericRange::parse)
            .transpose()?;
        let descriptor = self
            .catalog
            .describe(&target_req.node_id, target_req.attribute_id)?;
        let params = &req.requested_parameters;
        let (filter, filter_result) = ResolvedFilter::resolve(
            &params.filter,
            target_req.attribute_id,
            descriptor.data_kind,
            descriptor.eu_range,
        )?;
        let is_event = matches!(filter, ResolvedFilter::Event(_));
        let (sampling_interval, queue_size) =
            self.revise_item(params, sub.params().publishing_interval, is_event);
        let granted = can_access_contained(
            self.permissions.as_ref(),
            identity,
            &target_req.node_id,
            target_req.attribute_id,
        )
        .unwrap_or(false);

        let target = ItemTarget {
            node_id: target_req.node_id.clone(),
            attribute_id: target_req.attribute_id,
            index_range,
        };
        let settings = ItemSettings {
            client_handle: params.client_handle,
            mode: req.monitoring_mode,
            sampling_interval,
            queue_size,
            discard_oldest: params.discard_oldest,
            filter,
            timestamps,
        };
        let item = MonitoredItem::new(
            id,
            target,
            settings,
            granted,
            current.or(descriptor.value),
            now,
        );
        tracing::debug!(
            subscription_id = %sub.id(),
            item = %id,
            node = %target_req.node_id,
            granted,
            "Monitored item created"
        );
        sub.add_item(item);

        Ok(MonitoredItemCreateResult {
            status: StatusCode::GOOD,
            monitored_item_id: id,
            revised_sampling_interval: sampling_interval,
            revised_queue_size: queue_size,
            filter_result,
        })
    }

    fn modify_monitored_items(
        &self,
        state: &mut ServerState,
        session_id: SessionId,
        req: ModifyMonitoredItemsRequest,
    ) -> ServiceResult {
        let sub = state.owned_subscription(session_id, req.subscription_id)?;
        self.check_batch(req.items_to_modify.len())?;
        let publishing_interval = sub.params().publishing_interval;

        let results = req
            .items_to_modify
            .iter()
            .map(|modify| {
                self.modify_item(sub, modify, req.timestamps_to_return, publishing_interval)
                    .unwrap_or_else(|status| MonitoredItemModifyResult {
                        status,
                        revised_sampling_interval: std::time::Duration::ZERO,
                        revised_queue_size: 0,
                        filter_result: None,
                    })
            })
            .collect();
        Ok(ResponseBody::ModifyMonitoredItems(ModifyMonitoredItemsResponse { results }))
    }

    fn modify_item(
        &self,
        sub: &mut Subscription,
        req: &MonitoredItemModifyRequest,
        timestamps: TimestampsToReturn,
        publishing_interval: std::time::Duration,
    ) -> Result<MonitoredItemModifyResult, StatusCode> {
        let item = sub
            .item_mut(req.monitored_item_id)
            .ok_or(StatusCode::BAD_MONITORED_ITEM_ID_INVALID)?;
        let target = item.target().clone();
        let descriptor = self.catalog.describe(&target.node_id, target.attribute_id)?;
        let params = &req.requested_parameters;
        let (filter, filter_result) = ResolvedFilter::resolve(
            &params.filter,
            target.attribute_id,
            descriptor.data_kind,
            descriptor.eu_range,
        )?;
        let is_event = matches!(filter, ResolvedFilter::Event(_));
        let (sampling_interval, queue_size) = self.revise_item(params, publishing_interval, is_event);
        item.modify(ItemSettings {
            client_handle: params.client_handle,
            mode: item.mode(),
            sampling_interval,
            queue_size,
            discard_oldest: params.discard_oldest,
            filter,
            timestamps,
        });
        Ok(MonitoredItemModifyResult {
            status: StatusCode::GOOD,
            revised_sampling_interval: sampling_interval,
            revised_queue_size: queue_size,
            filter_result,
        })
    }

    fn set_monitoring_mode(
        &self,
        state: &mut ServerState,
        session_id: SessionId,
        req: SetMonitoringModeRequest,
        now: Instant,
    ) -> ServiceResult {
        let sub = state.owned_subscription(session_id, req.subscription_id)?;
        self.check_batch(req.monitored_item_ids.len())?;
        let reporting = req.monitoring_mode == MonitoringMode::Reporting;
        let mut flush = false;
        let results = req
            .monitored_item_ids
            .iter()
            .map(|id| match sub.item_mut(*id) {
                Some(item) => {
                    let switched = item.mode() != req.monitoring_mode;
                    item.set_mode(req.monitoring_mode, now);
                    flush |= reporting && switched && item.has_queued();
                    StatusCode::GOOD
                }
                None => StatusCode::BAD_MONITORED_ITEM_ID_INVALID,
            })
            .collect();
        // Items entering Reporting report what they hold right away.
        if flush && sub.flush_reported(now) {
            tracing::debug!(subscription_id = %sub.id(), "Reporting switch flushed queued samples");
        }
        Ok(ResponseBody::SetMonitoringMode(StatusResults { results }))
    }

    fn set_triggering(
        &self,
        state: &mut ServerState,
        session_id: SessionId,
        req: SetTriggeringRequest,
    ) -> ServiceResult {
        let sub = state.owned_subscription(session_id, req.subscription_id)?;
        if req.links_to_add.is_empty() && req.links_to_remove.is_empty() {
            return Err(StatusCode::BAD_NOTHING_TO_DO);
        }
        self.check_batch(req.links_to_add.len() + req.links_to_remove.len())?;
        let (add_results, remove_results) =
            sub.set_triggering(req.triggering_item_id, &req.links_to_add, &req.links_to_remove)?;
        Ok(ResponseBody::SetTriggering(SetTriggeringResponse {
            add_results,
            remove_results,
        }))
    }

    fn delete_monitored_items(
        &self,
        state: &mut ServerState,
        session_id: SessionId,
        req: DeleteMonitoredItemsRequest,
    ) -> ServiceResult {
        let sub = state.owned_subscription(session_id, req.subscription_id)?;
        self.check_batch(req.monitored_item_ids.len())?;
        let results = req
            .monitored_item_ids
            .iter()
            .map(|id| match sub.remove_item(*id) {
                Some(_) => StatusCode::GOOD,
                None => StatusCode::BAD_MONITORED_ITEM_ID_INVALID,
            })
            .collect();
        Ok(ResponseBody::DeleteMonitoredItems(StatusResults { results }))
    }

    // -------------------------------------------------------------------------
    // Publish services
    // -------------------------------------------------------------------------

    fn publish(
        &self,
        channel: ChannelId,
        header: &RequestHeader,
        req: PublishRequest,
        now: Instant,
    ) -> Result<oneshot::Receiver<Response>, StatusCode> {
        let mut state = self.state.lock();
        let session_id = state.authorize(channel, header.auth_token, now)?;
        ServerStats::bump(&self.stats.publish_requests, 1);

        let ServerState {
            sessions,
            subscriptions,
            ..
        } = &mut *state;
        let session = sessions
            .get_mut(&session_id)
            .ok_or(StatusCode::BAD_SESSION_ID_INVALID)?;

        let ack_results = session.acknowledge(&req.subscription_acknowledgements);
        if session.subscription_count() == 0 && !session.has_status() {
            return Err(StatusCode::BAD_NO_SUBSCRIPTION);
        }
        for id in session.subscriptions() {
            if let Some(sub) = subscriptions.get_mut(&id) {
                sub.on_publish_request();
            }
        }

        let (responder, receiver) = oneshot::channel();
        let deadline = (!header.timeout_hint.is_zero()).then(|| now + header.timeout_hint);
        let pending = PendingPublish {
            request_handle: header.request_handle,
            deadline,
            ack_results,
            responder,
        };
        if let Some(evicted) = session.park(pending, self.limits().max_pending_publish_requests) {
            evicted.fail(StatusCode::BAD_TOO_MANY_PUBLISH_REQUESTS);
        }

        let summary = dispatch(session, subscriptions, self.limits().max_retransmission_queue);
        ServerStats::bump(&self.stats.data_messages_sent, summary.data_messages as u64);
        ServerStats::bump(&self.stats.keep_alives_sent, summary.keep_alives as u64);
        Ok(receiver)
    }

    fn republish(&self, state: &mut ServerState, session_id: SessionId, req: RepublishRequest) -> ServiceResult {
        let session = state
            .sessions
            .get(&session_id)
            .ok_or(StatusCode::BAD_SESSION_ID_INVALID)?;
        if !session.owns(req.subscription_id) {
            return Err(if session.has_retired(req.subscription_id) {
                StatusCode::BAD_NO_SUBSCRIPTION
            } else {
                StatusCode::BAD_SUBSCRIPTION_ID_INVALID
            });
        }
        let message = session
            .republish(req.subscription_id, req.retransmit_sequence_number)
            .ok_or(StatusCode::BAD_MESSAGE_NOT_AVAILABLE)?;
        Ok(ResponseBody::Republish(RepublishResponse {
            notification_message: message,
        }))
    }

    // -------------------------------------------------------------------------
    // Data source
    // -------------------------------------------------------------------------

    /// Feeds a value change of `node` to every item monitoring it.
    pub fn notify_value_changed(&self, node: &NodeId, value: DataValue) {
        let now = Instant::now();
        let mut state = self.state.lock();
        for sub in state.subscriptions.values_mut() {
            sub.on_value_changed(node, &value, now);
        }
        state.latest_values.insert(node.clone(), value);
    }

    /// Feeds an event raised by `node` to every event item monitoring it.
    pub fn notify_event(&self, node: &NodeId, fields: HashMap<String, Variant>) {
        let mut state = self.state.lock();
        for sub in state.subscriptions.values_mut() {
            sub.on_event(node, &fields);
        }
    }

    // -------------------------------------------------------------------------
    // Time
    // -------------------------------------------------------------------------

    /// Runs everything due at `now`: session timeouts, publish request
    /// timeouts, subscription ticks, then dispatch.
    pub fn tick_at(&self, now: Instant) {
        let mut state = self.state.lock();

        let timed_out: Vec<SessionId> = state
            .sessions
            .values()
            .filter(|s| s.expires_at() <= now)
            .map(ServerSession::id)
            .collect();
        for id in timed_out {
            tracing::info!(session_id = %id, "Session timed out");
            ServerStats::bump(&self.stats.sessions_timed_out, 1);
            state.remove_session(id, true, StatusCode::BAD_SESSION_CLOSED);
        }

        for session in state.sessions.values_mut() {
            for pending in session.expired_requests(now) {
                pending.fail(StatusCode::BAD_TIMEOUT);
            }
        }

        let mut due: Vec<_> = state
            .subscriptions
            .values()
            .filter(|s| s.next_tick_at() <= now)
            .map(|s| (s.next_tick_at(), Reverse(s.priority()), s.creation_seq(), s.id()))
            .collect();
        due.sort();

        for (_, _, _, id) in due {
            let available = state
                .subscriptions
                .get(&id)
                .and_then(Subscription::owner)
                .and_then(|owner| state.sessions.get(&owner))
                .map_or(false, |s| s.available_requests() > 0);
            let outcome = match state.subscriptions.get_mut(&id) {
                Some(sub) => sub.tick(now, available),
                None => continue,
            };
            if outcome == TickOutcome::Expired {
                ServerStats::bump(&self.stats.subscriptions_expired, 1);
                state.expire_subscription(id);
            }
        }

        let limit = self.limits().max_retransmission_queue;
        let ServerState {
            sessions,
            subscriptions,
            ..
        } = &mut *state;
        for session in sessions.values_mut() {
            let summary = dispatch(session, subscriptions, limit);
            ServerStats::bump(&self.stats.data_messages_sent, summary.data_messages as u64);
            ServerStats::bump(&self.stats.keep_alives_sent, summary.keep_alives as u64);
            fail_if_idle(session);
        }
    }

    /// Earliest instant at which [`tick_at`](Self::tick_at) has work.
    pub fn next_deadline(&self) -> Option<Instant> {
        let state = self.state.lock();
        let subscriptions = state.subscriptions.values().map(Subscription::next_tick_at);
        let sessions = state.sessions.values().flat_map(|s| {
            std::iter::once(s.expires_at()).chain(s.next_request_deadline())
        });
        subscriptions.chain(sessions).min()
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    /// Number of sessions.
    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    /// Owner of a subscription: `None` if unknown, `Some(None)` if detached.
    pub fn subscription_owner(&self, id: SubscriptionId) -> Option<Option<SessionId>> {
        self.state.lock().subscriptions.get(&id).map(Subscription::owner)
    }

    /// The subscription diagnostics inventory, ordered by id.
    pub fn subscription_diagnostics(&self) -> Vec<SubscriptionDiagnostics> {
        let state = self.state.lock();
        let mut all: Vec<_> = state
            .subscriptions
            .values()
            .map(Subscription::diagnostics)
            .collect();
        all.sort_by_key(|d| d.subscription_id);
        all
    }
}

impl fmt::Debug for SubscriptionServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SubscriptionServer")
            .field("sessions", &state.sessions.len())
            .field("subscriptions", &state.subscriptions.len())
            .field("enable_transfer", &self.config.enable_transfer)
            .finish()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`SubscriptionServer`].
#[derive(Default)]
pub struct SubscriptionServerBuilder {
    config: Option<ServerConfig>,
    catalog: Option<Arc<dyn NodeCatalog>>,
    validator: Option<Arc<dyn IdentityValidator>>,
    permissions: Option<Arc<dyn PermissionResolver>>,
}

impl SubscriptionServerBuilder {
    /// Sets the configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Sets the node catalog.
    pub fn catalog(mut self, catalog: Arc<dyn NodeCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Sets the identity validator.
    pub fn validator(mut self, validator: Arc<dyn IdentityValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Sets the permission resolver.
    pub fn permissions(mut self, permissions: Arc<dyn PermissionResolver>) -> Self {
        self.permissions = Some(permissions);
        self
    }

    /// Builds the server.
    pub fn build(self) -> UaResult<SubscriptionServer> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        Ok(SubscriptionServer {
            config,
            state: Mutex::new(ServerState::default()),
            catalog: self.catalog.unwrap_or_else(|| Arc::new(StaticCatalog::new())),
            validator: self
                .validator
                .unwrap_or_else(|| Arc::new(StaticUserValidator::new())),
            permissions: self.permissions.unwrap_or_else(|| Arc::new(AllowAll)),
            wake: Notify::new(),
            stats: ServerStats::default(),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use trellis_core::DataKind;

    use crate::identity::{IdentityToken, Role, RolePermissions};

    const CHANNEL: ChannelId = ChannelId(1);

    fn node(i: u32) -> NodeId {
        NodeId::numeric(2, i)
    }

    fn server(config: ServerConfig) -> SubscriptionServer {
        let catalog = StaticCatalog::new()
            .with_variable(node(1), DataKind::Int32, DataValue::new(0i32))
            .with_variable(node(2), DataKind::Int32, DataValue::new(0i32))
            .with_variable(node(3), DataKind::Int32, DataValue::new(0i32));
        let validator = StaticUserValidator::new()
            .with_user("op", "op", [Role::Operator])
            .with_user("eng", "eng", [Role::Engineer]);
        let permissions = RolePermissions::new().restrict(node(3), [Role::Engineer]);
        SubscriptionServer::builder()
            .config(config)
            .catalog(Arc::new(catalog))
            .validator(Arc::new(validator))
            .permissions(Arc::new(permissions))
            .build()
            .unwrap()
    }

    fn request(token: AuthToken, handle: u32, body: RequestBody) -> Request {
        Request {
            header: RequestHeader {
                auth_token: token,
                request_handle: handle,
                timeout_hint: Duration::from_secs(5),
            },
            body,
        }
    }

    async fn open(server: &SubscriptionServer, identity: IdentityToken) -> AuthToken {
        let response = server
            .handle_request(
                CHANNEL,
                request(
                    AuthToken::null(),
                    1,
                    RequestBody::CreateSession(CreateSessionRequest {
                        session_name: "t".into(),
                        requested_timeout: Duration::from_secs(60),
                    }),
                ),
            )
            .await;
        let ResponseBody::CreateSession(created) = response.body else {
            panic!("unexpected {:?}", response.body);
        };
        let response = server
            .handle_request(
                CHANNEL,
                request(
                    created.auth_token,
                    2,
                    RequestBody::ActivateSession(ActivateSessionRequest { identity }),
                ),
            )
            .await;
        assert!(response.fault_status().is_none());
        created.auth_token
    }

    async fn subscribe(server: &SubscriptionServer, token: AuthToken) -> SubscriptionId {
        let response = server
            .handle_request(
                CHANNEL,
                request(
                    token,
                    3,
                    RequestBody::CreateSubscription(CreateSubscriptionRequest {
                        publishing_interval: Duration::from_millis(100),
                        lifetime_count: 1,
                        max_keep_alive_count: 2,
                        max_notifications_per_publish: 0,
                        publishing_enabled: true,
                        priority: 0,
                    }),
                ),
            )
            .await;
        let ResponseBody::CreateSubscription(created) = response.body else {
            panic!("unexpected {:?}", response.body);
        };
        assert_eq!(created.revised_lifetime_count, 6);
        created.subscription_id
    }

    async fn monitor(
        server: &SubscriptionServer,
        token: AuthToken,
        sub: SubscriptionId,
        nodes: &[NodeId],
    ) -> Vec<MonitoredItemCreateResult> {
        let items = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| MonitoredItemCreateRequest {
                item_to_monitor: ReadValueId::value(n.clone()),
                monitoring_mode: trellis_core::MonitoringMode::Reporting,
                requested_parameters: MonitoringParameters::new(i as u32 + 1),
            })
            .collect();
        let response = server
            .handle_request(
                CHANNEL,
                request(
                    token,
                    4,
                    RequestBody::CreateMonitoredItems(CreateMonitoredItemsRequest {
                        subscription_id: sub,
                        timestamps_to_return: TimestampsToReturn::Both,
                        items_to_create: items,
                    }),
                ),
            )
            .await;
        let ResponseBody::CreateMonitoredItems(created) = response.body else {
            panic!("unexpected {:?}", response.body);
        };
        created.results
    }

    #[tokio::test]
    async fn test_unactivated_session_is_rejected() {
        let server = server(ServerConfig::default());
        let response = server
            .handle_request(
                CHANNEL,
                request(
                    AuthToken::null(),
                    1,
                    RequestBody::CreateSession(CreateSessionRequest {
                        session_name: "t".into(),
                        requested_timeout: Duration::from_secs(60),
                    }),
                ),
            )
            .await;
        let ResponseBody::CreateSession(created) = response.body else {
            panic!("unexpected");
        };
        let response = server
            .handle_request(
                CHANNEL,
                request(
                    created.auth_token,
                    2,
                    RequestBody::DeleteSubscriptions(DeleteSubscriptionsRequest {
                        subscription_ids: vec![SubscriptionId(1)],
                    }),
                ),
            )
            .await;
        assert_eq!(response.fault_status(), Some(StatusCode::BAD_SESSION_NOT_ACTIVATED));
    }

    #[tokio::test]
    async fn test_create_items_partial_failure() {
        let server = server(ServerConfig::default());
        let token = open(&server, IdentityToken::Anonymous).await;
        let sub = subscribe(&server, token).await;
        let results = monitor(&server, token, sub, &[node(1), node(99), node(3)]).await;
        assert_eq!(results[0].status, StatusCode::GOOD);
        assert_eq!(results[1].status, StatusCode::BAD_NODE_ID_UNKNOWN);
        assert_eq!(results[2].status, StatusCode::GOOD);
        assert_eq!(results[0].revised_sampling_interval, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_empty_batch_is_nothing_to_do() {
        let server = server(ServerConfig::default());
        let token = open(&server, IdentityToken::Anonymous).await;
        let sub = subscribe(&server, token).await;
        let response = server
            .handle_request(
                CHANNEL,
                request(
                    token,
                    9,
                    RequestBody::DeleteMonitoredItems(DeleteMonitoredItemsRequest {
                        subscription_id: sub,
                        monitored_item_ids: Vec::new(),
                    }),
                ),
            )
            .await;
        assert_eq!(response.fault_status(), Some(StatusCode::BAD_NOTHING_TO_DO));
    }

    #[tokio::test]
    async fn test_publish_without_subscription() {
        let server = server(ServerConfig::default());
        let token = open(&server, IdentityToken::Anonymous).await;
        let response = server
            .handle_request(
                CHANNEL,
                request(token, 5, RequestBody::Publish(PublishRequest::default())),
            )
            .await;
        assert_eq!(response.fault_status(), Some(StatusCode::BAD_NO_SUBSCRIPTION));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_removes_from_inventory() {
        let server = server(ServerConfig::default());
        let token = open(&server, IdentityToken::Anonymous).await;
        let sub = subscribe(&server, token).await;
        assert_eq!(server.subscription_diagnostics().len(), 1);

        let start = Instant::now();
        for cycle in 1..=6u64 {
            server.tick_at(start + Duration::from_millis(100 * cycle));
        }
        assert!(server.subscription_diagnostics().is_empty());
        assert_eq!(server.subscription_owner(sub), None);
        assert_eq!(server.stats().subscriptions_expired(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_timeout_removes_subscriptions() {
        let server = server(ServerConfig::default());
        let token = open(&server, IdentityToken::Anonymous).await;
        let sub = subscribe(&server, token).await;
        let expires_at = {
            let state = server.state.lock();
            state.sessions.values().next().unwrap().expires_at()
        };

        server.tick_at(expires_at - Duration::from_millis(1));
        assert_eq!(server.session_count(), 1);
        assert_eq!(server.subscription_diagnostics().len(), 1);

        server.tick_at(expires_at);
        assert_eq!(server.session_count(), 0);
        assert_eq!(server.subscription_count(), 0);
        assert!(server.subscription_diagnostics().is_empty());
        assert_eq!(server.subscription_owner(sub), None);
        assert_eq!(server.stats().sessions_timed_out(), 1);
        assert_eq!(server.stats().subscriptions_expired(), 0);

        // The token died with the session.
        let response = server
            .handle_request(
                CHANNEL,
                request(token, 9, RequestBody::Publish(PublishRequest::default())),
            )
            .await;
        assert_eq!(response.fault_status(), Some(StatusCode::BAD_SESSION_ID_INVALID));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reporting_switch_readies_message() {
        let server = server(ServerConfig::default());
        let token = open(&server, IdentityToken::Anonymous).await;
        let sub = subscribe(&server, token).await;
        let results = monitor(&server, token, sub, &[node(1)]).await;
        let item = results[0].monitored_item_id;

        let mut handle = 10;
        for mode in [MonitoringMode::Sampling, MonitoringMode::Reporting] {
            handle += 1;
            let response = server
                .handle_request(
                    CHANNEL,
                    request(
                        token,
                        handle,
                        RequestBody::SetMonitoringMode(SetMonitoringModeRequest {
                            subscription_id: sub,
                            monitoring_mode: mode,
                            monitored_item_ids: vec![item],
                        }),
                    ),
                )
                .await;
            assert!(response.fault_status().is_none());
        }

        // No tick has run; the initial sample is already a ready message.
        let state = server.state.lock();
        let subscription = &state.subscriptions[&sub];
        assert!(subscription.has_ready());
        assert!(!subscription.item(item).unwrap().has_queued());
    }

    #[tokio::test]
    async fn test_failed_activation_keeps_identity() {
        let server = server(ServerConfig::default());
        let token = open(&server, IdentityToken::user_name("op", "op")).await;
        let response = server
            .handle_request(
                CHANNEL,
                request(
                    token,
                    7,
                    RequestBody::ActivateSession(ActivateSessionRequest {
                        identity: IdentityToken::user_name("eng", "wrong"),
                    }),
                ),
            )
            .await;
        assert_eq!(response.fault_status(), Some(StatusCode::BAD_IDENTITY_TOKEN_REJECTED));
        let state = server.state.lock();
        let session = state.sessions.values().next().unwrap();
        assert_eq!(session.identity().and_then(|i| i.user_name.clone()), Some("op".into()));
        assert_eq!(server.stats().activations_rejected(), 1);
    }

    #[tokio::test]
    async fn test_access_follows_identity() {
        let server = server(ServerConfig::default());
        let token = open(&server, IdentityToken::user_name("op", "op")).await;
        let sub = subscribe(&server, token).await;
        let results = monitor(&server, token, sub, &[node(3)]).await;
        let item = results[0].monitored_item_id;
        assert_eq!(results[0].status, StatusCode::GOOD);
        {
            let state = server.state.lock();
            assert!(!state.subscriptions[&sub].item(item).unwrap().access_granted());
        }

        let response = server
            .handle_request(
                CHANNEL,
                request(
                    token,
                    8,
                    RequestBody::ActivateSession(ActivateSessionRequest {
                        identity: IdentityToken::user_name("eng", "eng"),
                    }),
                ),
            )
            .await;
        assert!(response.fault_status().is_none());
        let state = server.state.lock();
        assert!(state.subscriptions[&sub].item(item).unwrap().access_granted());
    }

    #[tokio::test]
    async fn test_transfer_disabled() {
        let server = server(ServerConfig::default().with_transfer(false));
        let token = open(&server, IdentityToken::Anonymous).await;
        let sub = subscribe(&server, token).await;
        let response = server
            .handle_request(
                CHANNEL,
                request(
                    token,
                    6,
                    RequestBody::TransferSubscriptions(TransferSubscriptionsRequest {
                        subscription_ids: vec![sub],
                        send_initial_values: true,
                    }),
                ),
            )
            .await;
        assert_eq!(response.fault_status(), Some(StatusCode::BAD_NOT_IMPLEMENTED));
    }
}
