// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Session recovery after a channel break.
//!
//! ```text
//! open channel ──► ActivateSession(old token) ──ok──► repaired
//!                         │ rejected
//!                         ▼
//!                  CreateSession + ActivateSession
//!                         │
//!                         ▼
//!                  TransferSubscriptions(sendInitialValues)
//!                         │ per id failed / service unsupported
//!                         ▼
//!                  recreate subscription and items
//! ```
//!
//! Recovery retries without limit. The configured `max_retry` only bounds
//! first contact.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info, warn};
use trellis_core::{
    ExponentialBackoff, MonitoredItemId, RetryDecision, SubscriptionId, TimestampsToReturn,
    UaError, UaResult,
};

use super::session::{ClientEvent, ConnectionState, SessionInfo};
use super::subscription::{ClientMonitoredItem, ClientSubscription, SubscriptionEvent};
use super::transport::UaTransport;
use super::ua_client::{
    expect_body, subscription_created, subscription_request, unexpected_response, ClientInner,
};
use crate::messages::{
    ActivateSessionRequest, CreateMonitoredItemsRequest, RequestBody, ResponseBody,
    SetTriggeringRequest, TransferSubscriptionsRequest,
};

/// Progress carried between recovery attempts.
#[derive(Debug, Clone, Copy, Default)]
struct Recovery {
    /// Skip re-activation of the old session.
    force_new: bool,
    /// A new session exists but its subscriptions are not restored yet.
    transfer_pending: bool,
}

/// Restores the connection, retrying until it succeeds or the client shuts
/// down.
pub(crate) async fn run<T: UaTransport>(inner: Arc<ClientInner<T>>, session_lost: bool) {
    let backoff = ExponentialBackoff::new(inner.config.reconnect.clone()).unbounded();
    let mut shutdown = inner.shutdown.subscribe();
    let mut recovery = Recovery {
        force_new: session_lost,
        transfer_pending: false,
    };
    let mut attempt = 0u32;

    info!(endpoint = inner.transport.endpoint(), session_lost, "Reconnection started");

    loop {
        if *shutdown.borrow_and_update() {
            inner.reconnecting.store(false, Ordering::Release);
            debug!("Reconnection cancelled");
            return;
        }

        attempt += 1;
        inner.stats.record_reconnect_attempt();
        match restore(&inner, &mut recovery).await {
            Ok(()) => {
                if inner.is_shutting_down() {
                    inner.reconnecting.store(false, Ordering::Release);
                    return;
                }
                inner.reconnecting.store(false, Ordering::Release);
                inner.set_state(ConnectionState::Connected);
                info!(attempts = attempt, "Connection restored");
                return;
            }
            Err(e) => {
                let delay = match backoff.decide(attempt) {
                    RetryDecision::Retry(delay) => delay,
                    RetryDecision::DoNotRetry => backoff.delay_for(attempt),
                };
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Reconnection attempt failed"
                );
                inner.emit(ClientEvent::Backoff { attempt, delay });
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
}

/// One recovery attempt.
async fn restore<T: UaTransport>(inner: &Arc<ClientInner<T>>, recovery: &mut Recovery) -> UaResult<()> {
    let previous = inner.session.read().clone();
    if let Some(previous) = &previous {
        inner.transport.close_channel(previous.channel).await;
    }
    let channel = inner.transport.open_channel().await?;
    debug!(channel = %channel, "Channel reopened");

    if let (false, Some(previous)) = (recovery.force_new, &previous) {
        let identity = inner.identity.read().clone();
        let body = RequestBody::ActivateSession(ActivateSessionRequest { identity });
        match inner
            .exchange(channel, previous.auth_token, body, inner.config.request_timeout)
            .await
        {
            Ok(ResponseBody::ActivateSession(_)) => {
                *inner.session.write() = Some(SessionInfo {
                    channel,
                    ..previous.clone()
                });
                if recovery.transfer_pending {
                    transfer_or_recreate(inner).await?;
                    recovery.transfer_pending = false;
                } else {
                    inner.stats.record_repair();
                    inner.emit(ClientEvent::SessionRepaired {
                        session_id: previous.session_id,
                    });
                    info!(session_id = %previous.session_id, "Session re-activated on new channel");
                }
                return Ok(());
            }
            Err(e @ (UaError::Transport(_) | UaError::Timeout(_))) => {
                inner.transport.close_channel(channel).await;
                return Err(e);
            }
            Ok(other) => {
                debug!(got = other.kind(), "Unexpected re-activation response, creating new session");
            }
            Err(e) => {
                debug!(error = %e, "Session could not be re-activated, creating new session");
            }
        }
    }

    let session = match inner.create_session_on(channel).await {
        Ok(session) => session,
        Err(e) => {
            inner.transport.close_channel(channel).await;
            return Err(e);
        }
    };
    let session_id = session.session_id;
    *inner.session.write() = Some(session);
    recovery.force_new = false;
    recovery.transfer_pending = true;
    inner.stats.record_recreation();
    inner.emit(ClientEvent::SessionRecreated { session_id });
    info!(session_id = %session_id, "New session created");

    transfer_or_recreate(inner).await?;
    recovery.transfer_pending = false;
    Ok(())
}

/// Moves every live subscription to the current session.
async fn transfer_or_recreate<T: UaTransport>(inner: &Arc<ClientInner<T>>) -> UaResult<()> {
    let subscriptions = inner.engine.subscriptions();
    if subscriptions.is_empty() {
        return Ok(());
    }

    let subscription_ids: Vec<SubscriptionId> = subscriptions.iter().map(|s| s.id()).collect();
    let body = RequestBody::TransferSubscriptions(TransferSubscriptionsRequest {
        subscription_ids,
        send_initial_values: true,
    });
    let results = match inner.call(body, inner.config.request_timeout).await {
        Ok(ResponseBody::TransferSubscriptions(response)) => Some(response.results),
        Ok(other) => return Err(unexpected_response("TransferSubscriptions", &other)),
        Err(UaError::Service(e)) => {
            info!(error = %e, "Subscription transfer unavailable, recreating subscriptions");
            None
        }
        Err(e) => return Err(e),
    };

    for (index, sub) in subscriptions.iter().enumerate() {
        let status = results
            .as_ref()
            .and_then(|results| results.get(index))
            .map(|result| result.status);
        match status {
            Some(status) if status.is_good() => {
                inner.stats.record_transfer();
                inner.emit(ClientEvent::SubscriptionTransferred {
                    subscription_id: sub.id(),
                });
                debug!(subscription_id = %sub.id(), "Subscription transferred");
            }
            other => {
                if let Some(status) = other {
                    debug!(subscription_id = %sub.id(), status = %status, "Transfer rejected");
                }
                recreate_subscription(inner, sub).await?;
            }
        }
    }
    Ok(())
}

/// Creates `sub` again on the current session, with its items and
/// triggering links.
async fn recreate_subscription<T: UaTransport>(
    inner: &Arc<ClientInner<T>>,
    sub: &Arc<ClientSubscription>,
) -> UaResult<()> {
    let timeout = inner.config.request_timeout;
    let old_id = sub.id();
    let settings = sub.settings();

    let response = inner.call(subscription_request(&settings), timeout).await?;
    let (new_id, revised) = subscription_created(response)?;
    inner.engine.rekey(old_id, new_id);
    sub.set_id(new_id);
    sub.set_revised(revised);
    sub.delivery().lock().await.reset();

    let items = sub.items();
    let mut groups: Vec<(TimestampsToReturn, Vec<ClientMonitoredItem>)> = Vec::new();
    for item in items {
        match groups.iter_mut().find(|(ts, _)| *ts == item.timestamps_to_return) {
            Some((_, group)) => group.push(item),
            None => groups.push((item.timestamps_to_return, vec![item])),
        }
    }

    for (timestamps_to_return, group) in groups {
        let body = RequestBody::CreateMonitoredItems(CreateMonitoredItemsRequest {
            subscription_id: new_id,
            timestamps_to_return,
            items_to_create: group.iter().map(|item| item.request.clone()).collect(),
        });
        let created = expect_body!(
            inner.call(body, timeout).await?,
            CreateMonitoredItems,
            "CreateMonitoredItems"
        );
        for (item, result) in group.iter().zip(created.results) {
            if !result.status.is_good() {
                warn!(
                    subscription_id = %new_id,
                    client_handle = item.client_handle,
                    status = %result.status,
                    "Monitored item could not be recreated"
                );
            }
            sub.update_item(item.client_handle, |entry| {
                entry.monitored_item_id = result.monitored_item_id;
                entry.revised_sampling_interval = result.revised_sampling_interval;
                entry.revised_queue_size = result.revised_queue_size;
            });
        }
    }

    for (trigger, links) in sub.trigger_links() {
        let Some(triggering_item_id) = sub.server_item_id(trigger) else {
            continue;
        };
        let links_to_add: Vec<MonitoredItemId> = links
            .iter()
            .filter_map(|handle| sub.server_item_id(*handle))
            .collect();
        let body = RequestBody::SetTriggering(SetTriggeringRequest {
            subscription_id: new_id,
            triggering_item_id,
            links_to_add,
            links_to_remove: Vec::new(),
        });
        if let Err(e) = inner.call(body, timeout).await {
            warn!(subscription_id = %new_id, trigger, error = %e, "Triggering links not restored");
        }
    }

    inner.stats.record_subscription_recreated();
    inner.emit(ClientEvent::SubscriptionRecreated { old_id, new_id });
    info!(old_id = %old_id, new_id = %new_id, items = sub.item_count(), "Subscription recreated");
    sub.notify(SubscriptionEvent::Recreated { old_id, new_id }).await;
    Ok(())
}
