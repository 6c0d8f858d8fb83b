// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! A set of monitored items managed with one call per operation.

use std::sync::Arc;

use trellis_core::{MonitoringMode, StatusCode, TimestampsToReturn, UaResult};

use super::subscription::ClientSubscription;
use super::transport::UaTransport;
use super::ua_client::UaClient;
use crate::messages::{MonitoredItemCreateRequest, MonitoringParameters};

/// Monitored items created together and addressed as one unit.
///
/// Entries the server rejected stay in the group with their status so the
/// caller can see which ones failed; later batch operations only touch the
/// items that exist.
#[derive(Debug, Clone)]
pub struct MonitoredItemGroup {
    subscription: Arc<ClientSubscription>,
    timestamps_to_return: TimestampsToReturn,
    handles: Vec<u32>,
    statuses: Vec<StatusCode>,
}

impl MonitoredItemGroup {
    /// Creates all `requests` in one CreateMonitoredItems call.
    pub async fn create<T: UaTransport>(
        client: &UaClient<T>,
        subscription: Arc<ClientSubscription>,
        timestamps_to_return: TimestampsToReturn,
        requests: Vec<MonitoredItemCreateRequest>,
    ) -> UaResult<Self> {
        let created = client
            .create_monitored_items(&subscription, timestamps_to_return, requests)
            .await?;
        let (handles, statuses) = created
            .into_iter()
            .map(|item| (item.client_handle, item.result.status))
            .unzip();
        Ok(Self {
            subscription,
            timestamps_to_return,
            handles,
            statuses,
        })
    }

    /// The subscription the items belong to.
    pub fn subscription(&self) -> &Arc<ClientSubscription> {
        &self.subscription
    }

    /// Client handles, in creation order.
    pub fn handles(&self) -> &[u32] {
        &self.handles
    }

    /// Creation status per handle.
    pub fn statuses(&self) -> &[StatusCode] {
        &self.statuses
    }

    /// Returns `true` if every item was created.
    pub fn all_good(&self) -> bool {
        self.statuses.iter().all(StatusCode::is_good)
    }

    /// Returns `true` if `client_handle` belongs to the group.
    pub fn owns(&self, client_handle: u32) -> bool {
        self.handles.contains(&client_handle)
    }

    /// Number of items, created or not.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Returns `true` if the group is empty.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    fn live_handles(&self) -> Vec<u32> {
        self.handles
            .iter()
            .zip(&self.statuses)
            .filter(|(_, status)| status.is_good())
            .map(|(handle, _)| *handle)
            .collect()
    }

    /// Applies `template` to every live item, keeping each item's handle.
    pub async fn modify<T: UaTransport>(
        &self,
        client: &UaClient<T>,
        template: &MonitoringParameters,
    ) -> UaResult<Vec<StatusCode>> {
        let live = self.live_handles();
        if live.is_empty() {
            return Ok(Vec::new());
        }
        let parameters = live
            .iter()
            .map(|handle| MonitoringParameters {
                client_handle: *handle,
                ..template.clone()
            })
            .collect();
        let results = client
            .modify_monitored_items(&self.subscription, self.timestamps_to_return, parameters)
            .await?;
        Ok(results.into_iter().map(|r| r.status).collect())
    }

    /// Sets the monitoring mode of every live item.
    pub async fn set_monitoring_mode<T: UaTransport>(
        &self,
        client: &UaClient<T>,
        mode: MonitoringMode,
    ) -> UaResult<Vec<StatusCode>> {
        let live = self.live_handles();
        if live.is_empty() {
            return Ok(Vec::new());
        }
        client
            .set_monitoring_mode(&self.subscription, mode, &live)
            .await
    }

    /// Deletes every live item, consuming the group.
    pub async fn delete<T: UaTransport>(self, client: &UaClient<T>) -> UaResult<Vec<StatusCode>> {
        let live = self.live_handles();
        if live.is_empty() {
            return Ok(Vec::new());
        }
        client.delete_monitored_items(&self.subscription, &live).await
    }
}
