// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Server side of the subscription service sets.
//!
//! ```text
//! server/
//! ├── catalog.rs         NodeCatalog contract, StaticCatalog
//! ├── monitored_item.rs  sampling, filtering, queueing
//! ├── subscription.rs    publishing state machine
//! ├── session.rs         parked publish requests, retransmission
//! ├── publish.rs         request/message matching
//! ├── service.rs         SubscriptionServer (service handlers)
//! └── runtime.rs         timer task
//! ```

pub mod catalog;
pub mod monitored_item;
pub mod publish;
pub mod runtime;
pub mod service;
pub mod session;
pub mod subscription;

pub use catalog::{NodeCatalog, NodeDescriptor, StaticCatalog};
pub use monitored_item::{ItemPayload, ItemSettings, ItemTarget, MonitoredItem};
pub use publish::DispatchSummary;
pub use runtime::ServerRuntime;
pub use service::{ServerStats, SubscriptionServer, SubscriptionServerBuilder};
pub use session::ServerSession;
pub use subscription::{
    Subscription, SubscriptionDiagnostics, SubscriptionParams, SubscriptionState, TickOutcome,
};
