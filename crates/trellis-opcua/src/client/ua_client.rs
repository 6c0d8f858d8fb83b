// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! The subscription client.
//!
//! [`UaClient`] owns one session on one endpoint. It keeps the session alive
//! across channel breaks, runs the publish pipeline and exposes the
//! subscription and monitored item services.
//!
//! # Example
//!
//! ```rust,ignore
//! let client = UaClient::new(config, transport)?;
//! client.connect().await?;
//!
//! let sub = client.create_subscription(SubscriptionSettings::default()).await?;
//! let (listener, mut events) = ChannelListener::with_channel(64);
//! sub.add_listener(Arc::new(listener));
//!
//! let item = client.default_item(&sub, NodeId::numeric(2, 1001));
//! client.create_monitored_items(&sub, TimestampsToReturn::Both, vec![item]).await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use trellis_core::{
    AuthToken, ChannelId, ExponentialBackoff, MonitoredItemId, MonitoringMode, NodeId,
    RetryDecision, ServiceError, SessionError, StatusCode, SubscriptionError, SubscriptionId,
    TimeoutError, TimestampsToReturn, TransportError, UaError, UaResult,
};

use super::publish_engine::{self, PublishEngine};
use super::reconnect;
use super::session::{ClientEvent, ClientStats, ConnectionState, SessionInfo};
use super::subscription::{
    ClientMonitoredItem, ClientSubscription, ClientSubscriptionState, RevisedParameters,
};
use super::transport::UaTransport;
use crate::config::{ClientConfig, SubscriptionSettings};
use crate::identity::IdentityToken;
use crate::messages::{
    ActivateSessionRequest, CloseSessionRequest, CreateMonitoredItemsRequest,
    CreateSessionRequest, CreateSubscriptionRequest, DeleteMonitoredItemsRequest,
    DeleteSubscriptionsRequest, ModifyMonitoredItemsRequest, ModifySubscriptionRequest,
    MonitoredItemCreateRequest, MonitoredItemCreateResult, MonitoredItemModifyRequest,
    MonitoredItemModifyResult, MonitoringParameters, NotificationMessage, ReadValueId,
    RepublishRequest, Request, RequestBody, RequestHeader, ResponseBody, SetMonitoringModeRequest,
    SetPublishingModeRequest, SetTriggeringRequest, TransferResult, TransferSubscriptionsRequest,
};

/// Capacity of the client event broadcast.
const EVENT_CAPACITY: usize = 256;

/// Unwraps the expected response variant or returns an unexpected-response error.
macro_rules! expect_body {
    ($body:expr, $variant:ident, $service:literal) => {
        match $body {
            ResponseBody::$variant(inner) => inner,
            other => return Err(unexpected_response($service, &other)),
        }
    };
}

pub(crate) use expect_body;

pub(crate) fn unexpected_response(service: &'static str, got: &ResponseBody) -> UaError {
    ServiceError::UnexpectedResponse {
        service,
        got: got.kind(),
    }
    .into()
}

// =============================================================================
// ClientInner
// =============================================================================

/// State shared by the client handle, the publish workers and the
/// reconnection task.
pub(crate) struct ClientInner<T: UaTransport> {
    pub(crate) config: ClientConfig,
    pub(crate) transport: Arc<T>,
    pub(crate) identity: RwLock<IdentityToken>,
    pub(crate) session: RwLock<Option<SessionInfo>>,
    pub(crate) state: watch::Sender<ConnectionState>,
    pub(crate) events: broadcast::Sender<ClientEvent>,
    pub(crate) engine: PublishEngine,
    pub(crate) stats: ClientStats,
    pub(crate) shutdown: watch::Sender<bool>,
    pub(crate) reconnecting: AtomicBool,
    request_handle: AtomicU32,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: UaTransport> ClientInner<T> {
    pub(crate) fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, to: ConnectionState) {
        let from = self.state.send_replace(to);
        if from != to {
            info!(endpoint = self.transport.endpoint(), from = %from, to = %to, "Connection state changed");
            self.emit(ClientEvent::StateChanged { from, to });
        }
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn next_request_handle(&self) -> u32 {
        self.request_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    /// Sends one request on `channel` and unwraps service faults into errors.
    pub(crate) async fn exchange(
        &self,
        channel: ChannelId,
        auth_token: AuthToken,
        body: RequestBody,
        timeout: Duration,
    ) -> UaResult<ResponseBody> {
        let service = body.service_name();
        let request_handle = self.next_request_handle();
        let request = Request {
            header: RequestHeader {
                auth_token,
                request_handle,
                timeout_hint: timeout,
            },
            body,
        };

        self.stats.record_request();
        let response = match tokio::time::timeout(timeout, self.transport.send(channel, request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.stats.record_failure();
                return Err(e.into());
            }
            Err(_) => {
                self.stats.record_failure();
                return Err(UaError::request_timeout(service, timeout));
            }
        };

        if response.header.request_handle != request_handle {
            return Err(ServiceError::UnexpectedResponse {
                service,
                got: "mismatched request handle",
            }
            .into());
        }
        if let Some(status) = response.fault_status() {
            self.stats.record_fault(status);
            return Err(UaError::service_fault(service, status));
        }
        Ok(response.body)
    }

    /// Sends a request on the current session.
    ///
    /// Transport failures and session-invalid faults start recovery before
    /// the error is returned.
    pub(crate) async fn call(self: &Arc<Self>, body: RequestBody, timeout: Duration) -> UaResult<ResponseBody> {
        let session = self
            .session
            .read()
            .clone()
            .ok_or(SessionError::NoSession)?;

        let result = self
            .exchange(session.channel, session.auth_token, body, timeout)
            .await;

        if let Err(error) = &result {
            match error {
                UaError::Transport(_) => self.connection_lost(&session, false),
                UaError::Service(ServiceError::Fault { status, .. }) if status.is_session_invalid() => {
                    let status = *status;
                    self.connection_lost(&session, true);
                    return Err(SessionError::Invalidated { status }.into());
                }
                UaError::Service(ServiceError::Fault { status, .. })
                    if *status == StatusCode::BAD_SECURE_CHANNEL_ID_INVALID =>
                {
                    self.connection_lost(&session, false)
                }
                _ => {}
            }
        }
        result
    }

    /// Waits for the connection, then sends a request on the current session.
    pub(crate) async fn request(self: &Arc<Self>, body: RequestBody) -> UaResult<ResponseBody> {
        let timeout = self.config.request_timeout;
        self.wait_connected(timeout).await?;
        self.call(body, timeout).await
    }

    async fn wait_connected(&self, timeout: Duration) -> UaResult<()> {
        let mut state = self.state.subscribe();
        let wait = async {
            loop {
                let current = *state.borrow_and_update();
                match current {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected | ConnectionState::GiveUp => {
                        return Err(UaError::not_connected())
                    }
                    ConnectionState::Connecting | ConnectionState::Reconnecting => {}
                }
                if state.changed().await.is_err() {
                    return Err(UaError::not_connected());
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(TimeoutError::Reconnect { duration: timeout }.into()),
        }
    }

    // -------------------------------------------------------------------------
    // Session establishment
    // -------------------------------------------------------------------------

    /// Opens a channel and creates and activates a fresh session on it.
    pub(crate) async fn open_session(&self) -> UaResult<SessionInfo> {
        let channel = self.transport.open_channel().await?;
        match self.create_session_on(channel).await {
            Ok(session) => Ok(session),
            Err(e) => {
                self.transport.close_channel(channel).await;
                Err(e)
            }
        }
    }

    /// Creates and activates a new session on an open channel.
    pub(crate) async fn create_session_on(&self, channel: ChannelId) -> UaResult<SessionInfo> {
        let timeout = self.config.request_timeout;
        let body = RequestBody::CreateSession(CreateSessionRequest {
            session_name: self.config.session_name.clone(),
            requested_timeout: self.config.session_timeout,
        });
        let created = match self.exchange(channel, AuthToken::null(), body, timeout).await {
            Ok(ResponseBody::CreateSession(created)) => created,
            Ok(other) => return Err(unexpected_response("CreateSession", &other)),
            Err(UaError::Service(ServiceError::Fault { status, .. })) => {
                return Err(SessionError::CreationFailed { status }.into())
            }
            Err(e) => return Err(e),
        };

        let identity = self.identity.read().clone();
        let body = RequestBody::ActivateSession(ActivateSessionRequest { identity });
        match self.exchange(channel, created.auth_token, body, timeout).await {
            Ok(ResponseBody::ActivateSession(_)) => {}
            Ok(other) => return Err(unexpected_response("ActivateSession", &other)),
            Err(UaError::Service(ServiceError::Fault { status, .. })) => {
                return Err(SessionError::ActivationRejected { status }.into())
            }
            Err(e) => return Err(e),
        }

        debug!(session_id = %created.session_id, channel = %channel, "Session created and activated");
        Ok(SessionInfo {
            session_id: created.session_id,
            auth_token: created.auth_token,
            channel,
            revised_timeout: created.revised_timeout,
            created_at: Instant::now(),
        })
    }

    /// Starts recovery for the session binding `seen`, unless the binding
    /// is stale or recovery is already running.
    pub(crate) fn connection_lost(self: &Arc<Self>, seen: &SessionInfo, session_lost: bool) {
        if self.is_shutting_down() {
            return;
        }
        let current = self.session.read().clone();
        match current {
            Some(current) if current.same_binding(seen) => {}
            _ => return,
        }
        if self.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }

        warn!(
            endpoint = self.transport.endpoint(),
            session_id = %seen.session_id,
            session_lost,
            "Connection lost"
        );
        self.emit(ClientEvent::ConnectionLost { session_lost });
        self.set_state(ConnectionState::Reconnecting);
        let task = tokio::spawn(reconnect::run(Arc::clone(self), session_lost));
        self.track(task);
    }
}

// =============================================================================
// UaClient
// =============================================================================

/// A client bound to one server endpoint.
///
/// Cloning is cheap; clones share the session and subscriptions.
pub struct UaClient<T: UaTransport> {
    inner: Arc<ClientInner<T>>,
}

impl<T: UaTransport> Clone for UaClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Outcome of one monitored item creation.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedItem {
    /// Client handle of the item.
    pub client_handle: u32,
    /// Server result.
    pub result: MonitoredItemCreateResult,
}

impl CreatedItem {
    /// Returns `true` if the item exists on the server.
    pub fn is_good(&self) -> bool {
        self.result.status.is_good()
    }
}

impl<T: UaTransport> UaClient<T> {
    /// Creates a client. The configuration is validated; no request is sent.
    pub fn new(config: ClientConfig, transport: Arc<T>) -> UaResult<Self> {
        config.validate()?;
        let identity = config.identity.clone();
        let depth = config.publish_pipeline_depth;
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                transport,
                identity: RwLock::new(identity),
                session: RwLock::new(None),
                state: watch::channel(ConnectionState::Disconnected).0,
                events: broadcast::channel(EVENT_CAPACITY).0,
                engine: PublishEngine::new(depth),
                stats: ClientStats::new(),
                shutdown: watch::channel(false).0,
                reconnecting: AtomicBool::new(false),
                request_handle: AtomicU32::new(1),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.connection_state()
    }

    /// Watches the connection state.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Subscribes to connection-level events.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Counters.
    pub fn stats(&self) -> &ClientStats {
        &self.inner.stats
    }

    /// The current session, if any.
    pub fn session(&self) -> Option<SessionInfo> {
        self.inner.session.read().clone()
    }

    /// The identity used for the next activation.
    pub fn identity(&self) -> IdentityToken {
        self.inner.identity.read().clone()
    }

    /// Live subscriptions ordered by id.
    pub fn subscriptions(&self) -> Vec<Arc<ClientSubscription>> {
        self.inner.engine.subscriptions()
    }

    /// The live subscription with `id`.
    pub fn subscription(&self, id: SubscriptionId) -> Option<Arc<ClientSubscription>> {
        self.inner.engine.subscription(id)
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Connects, creates and activates a session, and starts publishing.
    ///
    /// First contact is retried within the configured `max_retry` budget;
    /// once connected, recovery never gives up.
    pub async fn connect(&self) -> UaResult<()> {
        let inner = &self.inner;
        if inner.connection_state().is_connected() {
            return Ok(());
        }

        inner.shutdown.send_replace(false);
        inner.reconnecting.store(false, Ordering::Release);
        inner.set_state(ConnectionState::Connecting);

        let backoff = ExponentialBackoff::new(inner.config.reconnect.clone());
        let endpoint = inner.transport.endpoint().to_string();
        let mut attempt = 0u32;

        let session = loop {
            attempt += 1;
            match inner.open_session().await {
                Ok(session) => break session,
                Err(e @ (UaError::Transport(_) | UaError::Timeout(_))) => match backoff.decide(attempt) {
                    RetryDecision::Retry(delay) => {
                        warn!(
                            endpoint = %endpoint,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Connection attempt failed"
                        );
                        inner.emit(ClientEvent::Backoff { attempt, delay });
                        tokio::time::sleep(delay).await;
                    }
                    RetryDecision::DoNotRetry => {
                        warn!(endpoint = %endpoint, attempts = attempt, "Giving up on initial connection");
                        inner.emit(ClientEvent::GaveUp { attempts: attempt });
                        inner.set_state(ConnectionState::GiveUp);
                        return Err(TransportError::GaveUp {
                            endpoint,
                            attempts: attempt,
                        }
                        .into());
                    }
                },
                Err(e) => {
                    e.log("connect");
                    inner.set_state(ConnectionState::Disconnected);
                    return Err(e);
                }
            }
        };

        info!(
            endpoint = %endpoint,
            session_id = %session.session_id,
            revised_timeout_ms = session.revised_timeout.as_millis() as u64,
            "Connected"
        );
        *inner.session.write() = Some(session);
        self.spawn_workers();
        inner.set_state(ConnectionState::Connected);
        Ok(())
    }

    fn spawn_workers(&self) {
        let inner = &self.inner;
        let mut tasks = inner.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        if !tasks.is_empty() {
            return;
        }
        for worker in 0..inner.engine.depth() {
            tasks.push(tokio::spawn(publish_engine::run_worker(
                Arc::clone(inner),
                worker,
            )));
        }
    }

    /// Closes the session, deleting its subscriptions, and stops all tasks.
    pub async fn disconnect(&self) -> UaResult<()> {
        let inner = &self.inner;
        inner.shutdown.send_replace(true);

        let session = inner.session.write().take();
        if let Some(session) = session {
            let body = RequestBody::CloseSession(CloseSessionRequest {
                delete_subscriptions: true,
            });
            if let Err(e) = inner
                .exchange(session.channel, session.auth_token, body, inner.config.request_timeout)
                .await
            {
                debug!(error = %e, "CloseSession failed");
            }
            inner.transport.close_channel(session.channel).await;
        }

        let tasks: Vec<_> = inner.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        for sub in inner.engine.clear() {
            sub.set_state(ClientSubscriptionState::Terminated);
        }
        inner.reconnecting.store(false, Ordering::Release);
        inner.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    /// Changes the identity of the live session.
    ///
    /// On rejection the previous identity stays in force.
    pub async fn activate_session(&self, identity: IdentityToken) -> UaResult<()> {
        let body = RequestBody::ActivateSession(ActivateSessionRequest {
            identity: identity.clone(),
        });
        match self.inner.request(body).await {
            Ok(ResponseBody::ActivateSession(_)) => {
                *self.inner.identity.write() = identity;
                info!("Session identity changed");
                Ok(())
            }
            Ok(other) => Err(unexpected_response("ActivateSession", &other)),
            Err(UaError::Service(ServiceError::Fault { status, .. })) => {
                warn!(status = %status, "Identity change rejected");
                Err(SessionError::ActivationRejected { status }.into())
            }
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Publishing
    // =========================================================================

    /// Stops issuing Publish requests until [`resume_publishing`](Self::resume_publishing).
    pub fn suspend_publishing(&self) {
        debug!("Publishing suspended");
        self.inner.engine.suspend();
    }

    /// Resumes issuing Publish requests.
    pub fn resume_publishing(&self) {
        debug!("Publishing resumed");
        self.inner.engine.resume();
    }

    /// Returns `true` while publishing is suspended.
    pub fn is_publishing_suspended(&self) -> bool {
        self.inner.engine.is_suspended()
    }

    /// Fetches a retained notification message.
    pub async fn republish(
        &self,
        subscription: &ClientSubscription,
        sequence_number: u32,
    ) -> UaResult<NotificationMessage> {
        self.inner.stats.record_republish();
        let body = RequestBody::Republish(RepublishRequest {
            subscription_id: subscription.id(),
            retransmit_sequence_number: sequence_number,
        });
        let response = expect_body!(self.inner.request(body).await?, Republish, "Republish");
        Ok(response.notification_message)
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Creates a subscription and starts publishing for it.
    pub async fn create_subscription(
        &self,
        settings: SubscriptionSettings,
    ) -> UaResult<Arc<ClientSubscription>> {
        settings.validate()?;
        let response = self.inner.request(subscription_request(&settings)).await?;
        let (id, revised) = subscription_created(response)?;
        let sub = Arc::new(ClientSubscription::new(id, settings, revised));
        info!(
            subscription_id = %id,
            publishing_interval_ms = revised.publishing_interval.as_millis() as u64,
            lifetime_count = revised.lifetime_count,
            max_keep_alive_count = revised.max_keep_alive_count,
            "Subscription created"
        );
        self.inner.engine.register(Arc::clone(&sub));
        Ok(sub)
    }

    /// Changes the timing parameters of a subscription.
    pub async fn modify_subscription(
        &self,
        subscription: &ClientSubscription,
        settings: SubscriptionSettings,
    ) -> UaResult<RevisedParameters> {
        settings.validate()?;
        let body = RequestBody::ModifySubscription(ModifySubscriptionRequest {
            subscription_id: subscription.id(),
            publishing_interval: settings.publishing_interval,
            lifetime_count: settings.lifetime_count,
            max_keep_alive_count: settings.max_keep_alive_count,
            max_notifications_per_publish: settings.max_notifications_per_publish,
            priority: settings.priority,
        });
        let response = expect_body!(self.inner.request(body).await?, ModifySubscription, "ModifySubscription");
        let revised = RevisedParameters {
            publishing_interval: response.revised_publishing_interval,
            lifetime_count: response.revised_lifetime_count,
            max_keep_alive_count: response.revised_max_keep_alive_count,
        };
        let publishing_enabled = subscription.settings().publishing_enabled;
        subscription.set_settings(SubscriptionSettings {
            publishing_enabled,
            ..settings
        });
        subscription.set_revised(revised);
        Ok(revised)
    }

    /// Enables or disables publishing. Returns one status per subscription.
    pub async fn set_publishing_mode(
        &self,
        subscriptions: &[&ClientSubscription],
        publishing_enabled: bool,
    ) -> UaResult<Vec<StatusCode>> {
        let body = RequestBody::SetPublishingMode(SetPublishingModeRequest {
            publishing_enabled,
            subscription_ids: subscriptions.iter().map(|s| s.id()).collect(),
        });
        let response = expect_body!(self.inner.request(body).await?, SetPublishingMode, "SetPublishingMode");
        for (sub, status) in subscriptions.iter().zip(&response.results) {
            if status.is_good() {
                let mut settings = sub.settings();
                settings.publishing_enabled = publishing_enabled;
                sub.set_settings(settings);
            }
        }
        Ok(response.results)
    }

    /// Deletes a subscription. Returns the server's status for it.
    pub async fn delete_subscription(&self, subscription: &ClientSubscription) -> UaResult<StatusCode> {
        let id = subscription.id();
        let body = RequestBody::DeleteSubscriptions(DeleteSubscriptionsRequest {
            subscription_ids: vec![id],
        });
        let response = expect_body!(self.inner.request(body).await?, DeleteSubscriptions, "DeleteSubscriptions");
        let status = response
            .results
            .first()
            .copied()
            .unwrap_or(StatusCode::BAD_INTERNAL_ERROR);
        if status.is_good() {
            self.inner.engine.unregister(id);
            subscription.set_state(ClientSubscriptionState::Terminated);
            info!(subscription_id = %id, "Subscription deleted");
        }
        Ok(status)
    }

    /// Takes over subscriptions owned by another session of the same user.
    ///
    /// Every subscription the server hands over is registered with this
    /// client, using the configured default settings.
    pub async fn transfer_subscriptions(
        &self,
        subscription_ids: &[SubscriptionId],
        send_initial_values: bool,
    ) -> UaResult<Vec<TransferResult>> {
        let body = RequestBody::TransferSubscriptions(TransferSubscriptionsRequest {
            subscription_ids: subscription_ids.to_vec(),
            send_initial_values,
        });
        let response = expect_body!(
            self.inner.request(body).await?,
            TransferSubscriptions,
            "TransferSubscriptions"
        );

        let settings = self.inner.config.subscription.clone();
        for (id, result) in subscription_ids.iter().zip(&response.results) {
            if !result.status.is_good() || self.inner.engine.subscription(*id).is_some() {
                continue;
            }
            let revised = RevisedParameters {
                publishing_interval: settings.publishing_interval,
                lifetime_count: settings.lifetime_count,
                max_keep_alive_count: settings.max_keep_alive_count,
            };
            let sub = Arc::new(ClientSubscription::new(*id, settings.clone(), revised));
            self.inner.engine.register(sub);
            self.inner.stats.record_transfer();
            info!(subscription_id = %id, "Subscription adopted");
        }
        Ok(response.results)
    }

    // =========================================================================
    // Monitored items
    // =========================================================================

    /// Builds a value item request for `node` from the configured defaults.
    pub fn default_item(&self, subscription: &ClientSubscription, node: NodeId) -> MonitoredItemCreateRequest {
        let defaults = &self.inner.config.monitored_item;
        MonitoredItemCreateRequest {
            item_to_monitor: ReadValueId::value(node),
            monitoring_mode: defaults.monitoring_mode,
            requested_parameters: MonitoringParameters {
                client_handle: subscription.allocate_client_handle(),
                sampling_interval: defaults.sampling_interval,
                filter: defaults.filter(),
                queue_size: defaults.queue_size,
                discard_oldest: defaults.discard_oldest,
            },
        }
    }

    /// Creates monitored items. A zero client handle is replaced by a fresh one.
    pub async fn create_monitored_items(
        &self,
        subscription: &ClientSubscription,
        timestamps_to_return: TimestampsToReturn,
        mut items: Vec<MonitoredItemCreateRequest>,
    ) -> UaResult<Vec<CreatedItem>> {
        for item in &mut items {
            if item.requested_parameters.client_handle == 0 {
                item.requested_parameters.client_handle = subscription.allocate_client_handle();
            }
        }

        let body = RequestBody::CreateMonitoredItems(CreateMonitoredItemsRequest {
            subscription_id: subscription.id(),
            timestamps_to_return,
            items_to_create: items.clone(),
        });
        let response = expect_body!(
            self.inner.request(body).await?,
            CreateMonitoredItems,
            "CreateMonitoredItems"
        );

        let mut created = Vec::with_capacity(items.len());
        for (request, result) in items.into_iter().zip(response.results) {
            let client_handle = request.requested_parameters.client_handle;
            if result.status.is_good() {
                subscription.insert_item(ClientMonitoredItem {
                    client_handle,
                    monitored_item_id: result.monitored_item_id,
                    request,
                    revised_sampling_interval: result.revised_sampling_interval,
                    revised_queue_size: result.revised_queue_size,
                    timestamps_to_return,
                });
            } else {
                debug!(client_handle, status = %result.status, "Monitored item rejected");
            }
            created.push(CreatedItem {
                client_handle,
                result,
            });
        }
        debug!(
            subscription_id = %subscription.id(),
            created = created.iter().filter(|c| c.is_good()).count(),
            requested = created.len(),
            "Monitored items created"
        );
        Ok(created)
    }

    /// Changes sampling parameters. Items are addressed by the client handle
    /// in each entry; unknown handles fail locally.
    pub async fn modify_monitored_items(
        &self,
        subscription: &ClientSubscription,
        timestamps_to_return: TimestampsToReturn,
        parameters: Vec<MonitoringParameters>,
    ) -> UaResult<Vec<MonitoredItemModifyResult>> {
        let handles: Vec<u32> = parameters.iter().map(|p| p.client_handle).collect();
        let resolved = resolve(subscription, &handles);
        let items_to_modify: Vec<_> = parameters
            .iter()
            .zip(&resolved)
            .filter_map(|(params, id)| {
                id.map(|monitored_item_id| MonitoredItemModifyRequest {
                    monitored_item_id,
                    requested_parameters: params.clone(),
                })
            })
            .collect();

        let remote = if items_to_modify.is_empty() && !handles.is_empty() {
            Vec::new()
        } else {
            let body = RequestBody::ModifyMonitoredItems(ModifyMonitoredItemsRequest {
                subscription_id: subscription.id(),
                timestamps_to_return,
                items_to_modify,
            });
            expect_body!(
                self.inner.request(body).await?,
                ModifyMonitoredItems,
                "ModifyMonitoredItems"
            )
            .results
        };

        let results = merge(&resolved, remote, || MonitoredItemModifyResult {
            status: StatusCode::BAD_MONITORED_ITEM_ID_INVALID,
            revised_sampling_interval: Duration::ZERO,
            revised_queue_size: 0,
            filter_result: None,
        });
        for (params, result) in parameters.into_iter().zip(&results) {
            if result.status.is_good() {
                let revised_sampling_interval = result.revised_sampling_interval;
                let revised_queue_size = result.revised_queue_size;
                subscription.update_item(params.client_handle, |item| {
                    item.request.requested_parameters = params;
                    item.revised_sampling_interval = revised_sampling_interval;
                    item.revised_queue_size = revised_queue_size;
                    item.timestamps_to_return = timestamps_to_return;
                });
            }
        }
        Ok(results)
    }

    /// Changes the monitoring mode of items addressed by client handle.
    pub async fn set_monitoring_mode(
        &self,
        subscription: &ClientSubscription,
        monitoring_mode: MonitoringMode,
        client_handles: &[u32],
    ) -> UaResult<Vec<StatusCode>> {
        let resolved = resolve(subscription, client_handles);
        let monitored_item_ids: Vec<_> = resolved.iter().flatten().copied().collect();

        let remote = if monitored_item_ids.is_empty() && !client_handles.is_empty() {
            Vec::new()
        } else {
            let body = RequestBody::SetMonitoringMode(SetMonitoringModeRequest {
                subscription_id: subscription.id(),
                monitoring_mode,
                monitored_item_ids,
            });
            expect_body!(self.inner.request(body).await?, SetMonitoringMode, "SetMonitoringMode").results
        };

        let results = merge(&resolved, remote, || StatusCode::BAD_MONITORED_ITEM_ID_INVALID);
        for (handle, status) in client_handles.iter().zip(&results) {
            if status.is_good() {
                subscription.update_item(*handle, |item| item.request.monitoring_mode = monitoring_mode);
            }
        }
        Ok(results)
    }

    /// Deletes items addressed by client handle.
    pub async fn delete_monitored_items(
        &self,
        subscription: &ClientSubscription,
        client_handles: &[u32],
    ) -> UaResult<Vec<StatusCode>> {
        let resolved = resolve(subscription, client_handles);
        let monitored_item_ids: Vec<_> = resolved.iter().flatten().copied().collect();

        let remote = if monitored_item_ids.is_empty() && !client_handles.is_empty() {
            Vec::new()
        } else {
            let body = RequestBody::DeleteMonitoredItems(DeleteMonitoredItemsRequest {
                subscription_id: subscription.id(),
                monitored_item_ids,
            });
            expect_body!(
                self.inner.request(body).await?,
                DeleteMonitoredItems,
                "DeleteMonitoredItems"
            )
            .results
        };

        let results = merge(&resolved, remote, || StatusCode::BAD_MONITORED_ITEM_ID_INVALID);
        for (handle, status) in client_handles.iter().zip(&results) {
            if status.is_good() {
                subscription.remove_item(*handle);
            }
        }
        Ok(results)
    }

    /// Adds and removes triggering links of the item `trigger`.
    ///
    /// Returns the per-link statuses for the added and the removed links.
    pub async fn set_triggering(
        &self,
        subscription: &ClientSubscription,
        trigger: u32,
        links_to_add: &[u32],
        links_to_remove: &[u32],
    ) -> UaResult<(Vec<StatusCode>, Vec<StatusCode>)> {
        let triggering_item_id = subscription
            .server_item_id(trigger)
            .ok_or(SubscriptionError::MonitoredItemNotFound {
                client_handle: trigger,
            })?;
        let add = resolve(subscription, links_to_add);
        let remove = resolve(subscription, links_to_remove);

        let body = RequestBody::SetTriggering(SetTriggeringRequest {
            subscription_id: subscription.id(),
            triggering_item_id,
            links_to_add: add.iter().flatten().copied().collect(),
            links_to_remove: remove.iter().flatten().copied().collect(),
        });
        let response = expect_body!(self.inner.request(body).await?, SetTriggering, "SetTriggering");

        let add_results = merge(&add, response.add_results, || StatusCode::BAD_MONITORED_ITEM_ID_INVALID);
        let remove_results = merge(&remove, response.remove_results, || {
            StatusCode::BAD_MONITORED_ITEM_ID_INVALID
        });
        for (handle, status) in links_to_add.iter().zip(&add_results) {
            if status.is_good() {
                subscription.link(trigger, *handle);
            }
        }
        for (handle, status) in links_to_remove.iter().zip(&remove_results) {
            if status.is_good() {
                subscription.unlink(trigger, *handle);
            }
        }
        Ok((add_results, remove_results))
    }
}

impl<T: UaTransport> std::fmt::Debug for UaClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UaClient")
            .field("endpoint", &self.inner.transport.endpoint())
            .field("state", &self.state())
            .field("subscriptions", &self.inner.engine.subscriptions().len())
            .finish()
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// CreateSubscription request for `settings`.
pub(crate) fn subscription_request(settings: &SubscriptionSettings) -> RequestBody {
    RequestBody::CreateSubscription(CreateSubscriptionRequest {
        publishing_interval: settings.publishing_interval,
        lifetime_count: settings.lifetime_count,
        max_keep_alive_count: settings.max_keep_alive_count,
        max_notifications_per_publish: settings.max_notifications_per_publish,
        publishing_enabled: settings.publishing_enabled,
        priority: settings.priority,
    })
}

/// Extracts the id and revised parameters from a CreateSubscription response.
pub(crate) fn subscription_created(body: ResponseBody) -> UaResult<(SubscriptionId, RevisedParameters)> {
    let created = expect_body!(body, CreateSubscription, "CreateSubscription");
    Ok((
        created.subscription_id,
        RevisedParameters {
            publishing_interval: created.revised_publishing_interval,
            lifetime_count: created.revised_lifetime_count,
            max_keep_alive_count: created.revised_max_keep_alive_count,
        },
    ))
}

/// Maps client handles to server ids.
fn resolve(subscription: &ClientSubscription, handles: &[u32]) -> Vec<Option<MonitoredItemId>> {
    handles
        .iter()
        .map(|handle| subscription.server_item_id(*handle))
        .collect()
}

/// Interleaves server results for resolved entries with local failures.
fn merge<R>(resolved: &[Option<MonitoredItemId>], remote: Vec<R>, missing: impl Fn() -> R) -> Vec<R> {
    let mut remote = remote.into_iter();
    resolved
        .iter()
        .map(|id| match id {
            Some(_) => remote.next().unwrap_or_else(&missing),
            None => missing(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_interleaves_local_failures() {
        let resolved = vec![Some(MonitoredItemId(4)), None, Some(MonitoredItemId(9))];
        let merged = merge(&resolved, vec![StatusCode::GOOD, StatusCode::BAD_NODE_ID_UNKNOWN], || {
            StatusCode::BAD_MONITORED_ITEM_ID_INVALID
        });
        assert_eq!(
            merged,
            vec![
                StatusCode::GOOD,
                StatusCode::BAD_MONITORED_ITEM_ID_INVALID,
                StatusCode::BAD_NODE_ID_UNKNOWN,
            ]
        );
    }

    #[test]
    fn test_merge_short_remote() {
        let resolved = vec![Some(MonitoredItemId(1)), Some(MonitoredItemId(2))];
        let merged = merge(&resolved, vec![StatusCode::GOOD], || StatusCode::BAD_INTERNAL_ERROR);
        assert_eq!(merged, vec![StatusCode::GOOD, StatusCode::BAD_INTERNAL_ERROR]);
    }
}
