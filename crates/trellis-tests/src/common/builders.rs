// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Test Builders
//!
//! Builder for monitored item create requests.

use std::time::Duration;

use trellis_core::{MonitoringMode, NodeId};
use trellis_opcua::messages::{MonitoredItemCreateRequest, MonitoringParameters, ReadValueId};
use trellis_opcua::MonitoringFilter;

// =============================================================================
// ItemRequestBuilder
// =============================================================================

/// Builder for [`MonitoredItemCreateRequest`].
///
/// Defaults: Value attribute, Reporting, sampling interval 0, queue of one,
/// discard oldest, no filter, client handle 0 (assigned by the client).
///
/// # Example
///
/// ```rust,ignore
/// let request = ItemRequestBuilder::value(NodeFixtures::variable(1))
///     .queue_size(3)
///     .absolute_deadband(5.0)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ItemRequestBuilder {
    target: ReadValueId,
    mode: MonitoringMode,
    parameters: MonitoringParameters,
}

impl ItemRequestBuilder {
    /// Monitors the Value attribute of `node`.
    pub fn value(node: NodeId) -> Self {
        Self {
            target: ReadValueId::value(node),
            mode: MonitoringMode::Reporting,
            parameters: MonitoringParameters::new(0),
        }
    }

    /// Monitors events of `node`, selecting `fields`.
    pub fn events<I, S>(node: NodeId, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut parameters = MonitoringParameters::new(0);
        parameters.filter = MonitoringFilter::events(fields);
        parameters.queue_size = 10;
        Self {
            target: ReadValueId::events(node),
            mode: MonitoringMode::Reporting,
            parameters,
        }
    }

    /// Sets the client handle.
    pub fn handle(mut self, client_handle: u32) -> Self {
        self.parameters.client_handle = client_handle;
        self
    }

    /// Sets the monitoring mode.
    pub fn mode(mut self, mode: MonitoringMode) -> Self {
        self.mode = mode;
        self
    }

    /// Shortcut for Sampling mode.
    pub fn sampling(self) -> Self {
        self.mode(MonitoringMode::Sampling)
    }

    /// Sets the sampling interval; `None` samples at the publishing interval.
    pub fn sampling_interval(mut self, interval: Option<Duration>) -> Self {
        self.parameters.sampling_interval = interval;
        self
    }

    /// Sets the queue size.
    pub fn queue_size(mut self, size: u32) -> Self {
        self.parameters.queue_size = size;
        self
    }

    /// Sets the overflow policy.
    pub fn discard_oldest(mut self, discard_oldest: bool) -> Self {
        self.parameters.discard_oldest = discard_oldest;
        self
    }

    /// Attaches an absolute deadband.
    pub fn absolute_deadband(mut self, value: f64) -> Self {
        self.parameters.filter = MonitoringFilter::absolute_deadband(value);
        self
    }

    /// Attaches a percent deadband.
    pub fn percent_deadband(mut self, percent: f64) -> Self {
        self.parameters.filter = MonitoringFilter::percent_deadband(percent);
        self
    }

    /// Sets an index range.
    pub fn index_range(mut self, range: impl Into<String>) -> Self {
        self.target.index_range = Some(range.into());
        self
    }

    /// Builds the request.
    pub fn build(self) -> MonitoredItemCreateRequest {
        MonitoredItemCreateRequest {
            item_to_monitor: self.target,
            monitoring_mode: self.mode,
            requested_parameters: self.parameters,
        }
    }
}
