// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Logical service messages exchanged between client and server.
//!
//! These are the request/response bodies of the session, subscription,
//! monitored item and publish service sets. Encoding them onto a wire is
//! the transport's business; the runtime only ever sees these types.
//!
//! ```text
//! Request  { header: RequestHeader,  body: RequestBody  }
//! Response { header: ResponseHeader, body: ResponseBody }
//!                                      └── ServiceFault when header.service_result is Bad
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use trellis_core::{
    AttributeId, AuthToken, DataValue, MonitoredItemId, MonitoringMode, NodeId, SessionId,
    StatusCode, SubscriptionId, TimestampsToReturn, Variant,
};

use crate::filter::{FilterResult, MonitoringFilter};
use crate::identity::IdentityToken;

// =============================================================================
// Envelope
// =============================================================================

/// Common request header.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestHeader {
    /// Token binding the request to a session (null before CreateSession).
    pub auth_token: AuthToken,
    /// Client-chosen handle echoed in the response.
    pub request_handle: u32,
    /// How long the client is willing to wait.
    pub timeout_hint: Duration,
}

/// Common response header.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHeader {
    /// Handle of the request this answers.
    pub request_handle: u32,
    /// Result of the service as a whole.
    pub service_result: StatusCode,
    /// When the response was produced.
    pub timestamp: DateTime<Utc>,
}

impl ResponseHeader {
    /// Creates a header for the given request.
    pub fn new(request_handle: u32, service_result: StatusCode) -> Self {
        Self {
            request_handle,
            service_result,
            timestamp: Utc::now(),
        }
    }
}

/// A service request.
#[derive(Debug, Clone)]
pub struct Request {
    /// Request header.
    pub header: RequestHeader,
    /// Request body.
    pub body: RequestBody,
}

/// A service response.
#[derive(Debug, Clone)]
pub struct Response {
    /// Response header.
    pub header: ResponseHeader,
    /// Response body.
    pub body: ResponseBody,
}

impl Response {
    /// Creates a successful response.
    pub fn ok(request_handle: u32, body: ResponseBody) -> Self {
        Self {
            header: ResponseHeader::new(request_handle, StatusCode::GOOD),
            body,
        }
    }

    /// Creates a service fault.
    pub fn fault(request_handle: u32, status: StatusCode) -> Self {
        Self {
            header: ResponseHeader::new(request_handle, status),
            body: ResponseBody::ServiceFault,
        }
    }

    /// Returns the fault status if this is a service fault.
    pub fn fault_status(&self) -> Option<StatusCode> {
        match self.body {
            ResponseBody::ServiceFault => Some(self.header.service_result),
            _ => None,
        }
    }
}

/// All request bodies.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub enum RequestBody {
    CreateSession(CreateSessionRequest),
    ActivateSession(ActivateSessionRequest),
    CloseSession(CloseSessionRequest),
    CreateSubscription(CreateSubscriptionRequest),
    ModifySubscription(ModifySubscriptionRequest),
    SetPublishingMode(SetPublishingModeRequest),
    DeleteSubscriptions(DeleteSubscriptionsRequest),
    TransferSubscriptions(TransferSubscriptionsRequest),
    CreateMonitoredItems(CreateMonitoredItemsRequest),
    ModifyMonitoredItems(ModifyMonitoredItemsRequest),
    SetMonitoringMode(SetMonitoringModeRequest),
    SetTriggering(SetTriggeringRequest),
    DeleteMonitoredItems(DeleteMonitoredItemsRequest),
    Publish(PublishRequest),
    Republish(RepublishRequest),
}

impl RequestBody {
    /// Returns the service name.
    pub fn service_name(&self) -> &'static str {
        match self {
            Self::CreateSession(_) => "CreateSession",
            Self::ActivateSession(_) => "ActivateSession",
            Self::CloseSession(_) => "CloseSession",
            Self::CreateSubscription(_) => "CreateSubscription",
            Self::ModifySubscription(_) => "ModifySubscription",
            Self::SetPublishingMode(_) => "SetPublishingMode",
            Self::DeleteSubscriptions(_) => "DeleteSubscriptions",
            Self::TransferSubscriptions(_) => "TransferSubscriptions",
            Self::CreateMonitoredItems(_) => "CreateMonitoredItems",
            Self::ModifyMonitoredItems(_) => "ModifyMonitoredItems",
            Self::SetMonitoringMode(_) => "SetMonitoringMode",
            Self::SetTriggering(_) => "SetTriggering",
            Self::DeleteMonitoredItems(_) => "DeleteMonitoredItems",
            Self::Publish(_) => "Publish",
            Self::Republish(_) => "Republish",
        }
    }
}

/// All response bodies.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub enum ResponseBody {
    CreateSession(CreateSessionResponse),
    ActivateSession(ActivateSessionResponse),
    CloseSession,
    CreateSubscription(CreateSubscriptionResponse),
    ModifySubscription(ModifySubscriptionResponse),
    SetPublishingMode(StatusResults),
    DeleteSubscriptions(StatusResults),
    TransferSubscriptions(TransferSubscriptionsResponse),
    CreateMonitoredItems(CreateMonitoredItemsResponse),
    ModifyMonitoredItems(ModifyMonitoredItemsResponse),
    SetMonitoringMode(StatusResults),
    SetTriggering(SetTriggeringResponse),
    DeleteMonitoredItems(StatusResults),
    Publish(PublishResponse),
    Republish(RepublishResponse),
    ServiceFault,
}

impl ResponseBody {
    /// Returns the response kind, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateSession(_) => "CreateSession",
            Self::ActivateSession(_) => "ActivateSession",
            Self::CloseSession => "CloseSession",
            Self::CreateSubscription(_) => "CreateSubscription",
            Self::ModifySubscription(_) => "ModifySubscription",
            Self::SetPublishingMode(_) => "SetPublishingMode",
            Self::DeleteSubscriptions(_) => "DeleteSubscriptions",
            Self::TransferSubscriptions(_) => "TransferSubscriptions",
            Self::CreateMonitoredItems(_) => "CreateMonitoredItems",
            Self::ModifyMonitoredItems(_) => "ModifyMonitoredItems",
            Self::SetMonitoringMode(_) => "SetMonitoringMode",
            Self::SetTriggering(_) => "SetTriggering",
            Self::DeleteMonitoredItems(_) => "DeleteMonitoredItems",
            Self::Publish(_) => "Publish",
            Self::Republish(_) => "Republish",
            Self::ServiceFault => "ServiceFault",
        }
    }
}

/// Per-entry results of a batch call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatusResults {
    /// One status per input entry, in input order.
    pub results: Vec<StatusCode>,
}

// =============================================================================
// Session Service Set
// =============================================================================

/// CreateSession parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateSessionRequest {
    /// Human-readable session name.
    pub session_name: String,
    /// Requested session timeout.
    pub requested_timeout: Duration,
}

/// CreateSession result.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateSessionResponse {
    /// Server-assigned session id.
    pub session_id: SessionId,
    /// Secret token for subsequent requests.
    pub auth_token: AuthToken,
    /// Timeout granted by the server.
    pub revised_timeout: Duration,
}

/// ActivateSession parameters; may change the identity of an active session.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivateSessionRequest {
    /// Identity to activate with.
    pub identity: IdentityToken,
}

/// ActivateSession result.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivateSessionResponse {
    /// The activated session.
    pub session_id: SessionId,
}

/// CloseSession parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseSessionRequest {
    /// Delete owned subscriptions instead of detaching them.
    pub delete_subscriptions: bool,
}

// =============================================================================
// Subscription Service Set
// =============================================================================

/// CreateSubscription parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateSubscriptionRequest {
    /// Requested publishing interval.
    pub publishing_interval: Duration,
    /// Requested lifetime count.
    pub lifetime_count: u32,
    /// Requested keep-alive count.
    pub max_keep_alive_count: u32,
    /// Cap per notification message, 0 = unbounded.
    pub max_notifications_per_publish: u32,
    /// Whether publishing starts enabled.
    pub publishing_enabled: bool,
    /// Relative priority.
    pub priority: u8,
}

/// CreateSubscription result.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateSubscriptionResponse {
    /// Server-assigned id.
    pub subscription_id: SubscriptionId,
    /// Revised publishing interval.
    pub revised_publishing_interval: Duration,
    /// Revised lifetime count.
    pub revised_lifetime_count: u32,
    /// Revised keep-alive count.
    pub revised_max_keep_alive_count: u32,
}

/// ModifySubscription parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ModifySubscriptionRequest {
    /// Subscription to modify.
    pub subscription_id: SubscriptionId,
    /// Requested publishing interval.
    pub publishing_interval: Duration,
    /// Requested lifetime count.
    pub lifetime_count: u32,
    /// Requested keep-alive count.
    pub max_keep_alive_count: u32,
    /// Cap per notification message, 0 = unbounded.
    pub max_notifications_per_publish: u32,
    /// Relative priority.
    pub priority: u8,
}

/// ModifySubscription result.
#[derive(Debug, Clone, PartialEq)]
pub struct ModifySubscriptionResponse {
    /// Revised publishing interval.
    pub revised_publishing_interval: Duration,
    /// Revised lifetime count.
    pub revised_lifetime_count: u32,
    /// Revised keep-alive count.
    pub revised_max_keep_alive_count: u32,
}

/// SetPublishingMode parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SetPublishingModeRequest {
    /// New publishing flag.
    pub publishing_enabled: bool,
    /// Target subscriptions.
    pub subscription_ids: Vec<SubscriptionId>,
}

/// DeleteSubscriptions parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteSubscriptionsRequest {
    /// Subscriptions to delete.
    pub subscription_ids: Vec<SubscriptionId>,
}

/// TransferSubscriptions parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferSubscriptionsRequest {
    /// Subscriptions to move to the calling session.
    pub subscription_ids: Vec<SubscriptionId>,
    /// Re-send the current value of every reporting item.
    pub send_initial_values: bool,
}

/// Per-subscription transfer outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferResult {
    /// Outcome.
    pub status: StatusCode,
    /// Sequence numbers still available for republish.
    pub available_sequence_numbers: Vec<u32>,
}

/// TransferSubscriptions result.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransferSubscriptionsResponse {
    /// One result per requested id.
    pub results: Vec<TransferResult>,
}

// =============================================================================
// MonitoredItem Service Set
// =============================================================================

/// What a monitored item observes.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadValueId {
    /// Target node.
    pub node_id: NodeId,
    /// Target attribute.
    pub attribute_id: AttributeId,
    /// Optional index range, `"n"` or `"lo:hi"`.
    pub index_range: Option<String>,
}

impl ReadValueId {
    /// Targets the Value attribute of a node.
    pub fn value(node_id: NodeId) -> Self {
        Self {
            node_id,
            attribute_id: AttributeId::Value,
            index_range: None,
        }
    }

    /// Targets the EventNotifier attribute of a node.
    pub fn events(node_id: NodeId) -> Self {
        Self {
            node_id,
            attribute_id: AttributeId::EventNotifier,
            index_range: None,
        }
    }
}

/// Sampling and queueing parameters of a monitored item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringParameters {
    /// Client-chosen handle carried in every notification.
    pub client_handle: u32,
    /// Sampling interval; `None` samples at the publishing interval.
    pub sampling_interval: Option<Duration>,
    /// Optional filter.
    #[serde(default)]
    pub filter: MonitoringFilter,
    /// Requested queue size.
    pub queue_size: u32,
    /// Discard the oldest entry on overflow (otherwise the newest is replaced).
    pub discard_oldest: bool,
}

impl MonitoringParameters {
    /// Creates parameters with a queue of one and no filter.
    pub fn new(client_handle: u32) -> Self {
        Self {
            client_handle,
            sampling_interval: Some(Duration::ZERO),
            filter: MonitoringFilter::None,
            queue_size: 1,
            discard_oldest: true,
        }
    }
}

/// One entry of CreateMonitoredItems.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItemCreateRequest {
    /// Target.
    pub item_to_monitor: ReadValueId,
    /// Initial monitoring mode.
    pub monitoring_mode: MonitoringMode,
    /// Requested parameters.
    pub requested_parameters: MonitoringParameters,
}

/// CreateMonitoredItems parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateMonitoredItemsRequest {
    /// Owning subscription.
    pub subscription_id: SubscriptionId,
    /// Timestamps carried by notifications.
    pub timestamps_to_return: TimestampsToReturn,
    /// Items to create.
    pub items_to_create: Vec<MonitoredItemCreateRequest>,
}

/// Per-item create outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItemCreateResult {
    /// Outcome.
    pub status: StatusCode,
    /// Server-assigned id (meaningful only when Good).
    pub monitored_item_id: MonitoredItemId,
    /// Revised sampling interval.
    pub revised_sampling_interval: Duration,
    /// Revised queue size.
    pub revised_queue_size: u32,
    /// Filter outcome, for event filters.
    pub filter_result: Option<FilterResult>,
}

impl MonitoredItemCreateResult {
    /// A failed entry.
    pub fn failed(status: StatusCode) -> Self {
        Self {
            status,
            monitored_item_id: MonitoredItemId(0),
            revised_sampling_interval: Duration::ZERO,
            revised_queue_size: 0,
            filter_result: None,
        }
    }
}

/// CreateMonitoredItems result.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CreateMonitoredItemsResponse {
    /// One result per requested item.
    pub results: Vec<MonitoredItemCreateResult>,
}

/// One entry of ModifyMonitoredItems.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItemModifyRequest {
    /// Item to modify.
    pub monitored_item_id: MonitoredItemId,
    /// New parameters.
    pub requested_parameters: MonitoringParameters,
}

/// ModifyMonitoredItems parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ModifyMonitoredItemsRequest {
    /// Owning subscription.
    pub subscription_id: SubscriptionId,
    /// Timestamps carried by notifications.
    pub timestamps_to_return: TimestampsToReturn,
    /// Items to modify.
    pub items_to_modify: Vec<MonitoredItemModifyRequest>,
}

/// Per-item modify outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItemModifyResult {
    /// Outcome.
    pub status: StatusCode,
    /// Revised sampling interval.
    pub revised_sampling_interval: Duration,
    /// Revised queue size.
    pub revised_queue_size: u32,
    /// Filter outcome, for event filters.
    pub filter_result: Option<FilterResult>,
}

/// ModifyMonitoredItems result.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModifyMonitoredItemsResponse {
    /// One result per requested item.
    pub results: Vec<MonitoredItemModifyResult>,
}

/// SetMonitoringMode parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SetMonitoringModeRequest {
    /// Owning subscription.
    pub subscription_id: SubscriptionId,
    /// New mode.
    pub monitoring_mode: MonitoringMode,
    /// Target items.
    pub monitored_item_ids: Vec<MonitoredItemId>,
}

/// SetTriggering parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SetTriggeringRequest {
    /// Owning subscription.
    pub subscription_id: SubscriptionId,
    /// The triggering item.
    pub triggering_item_id: MonitoredItemId,
    /// Items to link.
    pub links_to_add: Vec<MonitoredItemId>,
    /// Items to unlink.
    pub links_to_remove: Vec<MonitoredItemId>,
}

/// SetTriggering result.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SetTriggeringResponse {
    /// One status per link to add.
    pub add_results: Vec<StatusCode>,
    /// One status per link to remove.
    pub remove_results: Vec<StatusCode>,
}

/// DeleteMonitoredItems parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteMonitoredItemsRequest {
    /// Owning subscription.
    pub subscription_id: SubscriptionId,
    /// Items to delete.
    pub monitored_item_ids: Vec<MonitoredItemId>,
}

// =============================================================================
// Publish
// =============================================================================

/// Acknowledges receipt of a notification message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionAcknowledgement {
    /// Subscription the message belongs to.
    pub subscription_id: SubscriptionId,
    /// Acknowledged sequence number.
    pub sequence_number: u32,
}

/// Publish parameters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PublishRequest {
    /// Acknowledgements for previously received messages.
    pub subscription_acknowledgements: Vec<SubscriptionAcknowledgement>,
}

/// Publish result.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishResponse {
    /// Subscription the message belongs to.
    pub subscription_id: SubscriptionId,
    /// Sequence numbers still held for republish.
    pub available_sequence_numbers: Vec<u32>,
    /// More messages are waiting.
    pub more_notifications: bool,
    /// The message.
    pub notification_message: NotificationMessage,
    /// One status per acknowledgement.
    pub results: Vec<StatusCode>,
}

/// Republish parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepublishRequest {
    /// Subscription the message belongs to.
    pub subscription_id: SubscriptionId,
    /// Sequence number to resend.
    pub retransmit_sequence_number: u32,
}

/// Republish result.
#[derive(Debug, Clone, PartialEq)]
pub struct RepublishResponse {
    /// The resent message.
    pub notification_message: NotificationMessage,
}

// =============================================================================
// Notifications
// =============================================================================

/// A sequenced batch of notifications.
///
/// An empty `notification_data` is a keep-alive. Keep-alives and status
/// changes carry the next sequence number without consuming it.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationMessage {
    /// Sequence number.
    pub sequence_number: u32,
    /// When the message was assembled.
    pub publish_time: DateTime<Utc>,
    /// Payload.
    pub notification_data: Vec<NotificationData>,
}

impl NotificationMessage {
    /// Creates a keep-alive message.
    pub fn keep_alive(next_sequence_number: u32) -> Self {
        Self {
            sequence_number: next_sequence_number,
            publish_time: Utc::now(),
            notification_data: Vec::new(),
        }
    }

    /// Creates a status change message.
    pub fn status_change(next_sequence_number: u32, status: StatusCode) -> Self {
        Self {
            sequence_number: next_sequence_number,
            publish_time: Utc::now(),
            notification_data: vec![NotificationData::StatusChange(StatusChangeNotification {
                status,
            })],
        }
    }

    /// Returns `true` for keep-alive messages.
    #[inline]
    pub fn is_keep_alive(&self) -> bool {
        self.notification_data.is_empty()
    }

    /// Returns `true` if the message consumed its sequence number.
    pub fn carries_data(&self) -> bool {
        self.notification_data.iter().any(|d| {
            matches!(
                d,
                NotificationData::DataChange(_) | NotificationData::Event(_)
            )
        })
    }

    /// Returns the status change carried by this message, if any.
    pub fn status_change_code(&self) -> Option<StatusCode> {
        self.notification_data.iter().find_map(|d| match d {
            NotificationData::StatusChange(s) => Some(s.status),
            _ => None,
        })
    }
}

/// Notification payload variants.
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationData {
    /// Data changes of value items.
    DataChange(DataChangeNotification),
    /// Events of event items.
    Event(EventNotificationList),
    /// A change in the subscription's own status.
    StatusChange(StatusChangeNotification),
}

/// Data changes of value items.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataChangeNotification {
    /// Changed items.
    pub monitored_items: Vec<MonitoredItemNotification>,
}

/// One item's value change.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItemNotification {
    /// Client handle of the item.
    pub client_handle: u32,
    /// The value.
    pub value: DataValue,
}

/// Events of event items.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EventNotificationList {
    /// Events.
    pub events: Vec<EventFieldList>,
}

/// One event, projected onto the item's select clauses.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFieldList {
    /// Client handle of the item.
    pub client_handle: u32,
    /// Selected fields in clause order.
    pub event_fields: Vec<Variant>,
}

/// A change in a subscription's status.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusChangeNotification {
    /// The new status.
    pub status: StatusCode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keep_alive_and_status_change_do_not_carry_data() {
        let ka = NotificationMessage::keep_alive(5);
        assert!(ka.is_keep_alive());
        assert!(!ka.carries_data());

        let sc = NotificationMessage::status_change(5, StatusCode::GOOD_SUBSCRIPTION_TRANSFERRED);
        assert!(!sc.is_keep_alive());
        assert!(!sc.carries_data());
        assert_eq!(
            sc.status_change_code(),
            Some(StatusCode::GOOD_SUBSCRIPTION_TRANSFERRED)
        );
    }

    #[test]
    fn test_fault_response() {
        let response = Response::fault(9, StatusCode::BAD_NO_SUBSCRIPTION);
        assert_eq!(response.header.request_handle, 9);
        assert_eq!(response.fault_status(), Some(StatusCode::BAD_NO_SUBSCRIPTION));
        assert_eq!(response.body.kind(), "ServiceFault");
    }
}
