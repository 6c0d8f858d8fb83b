// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Client side: session continuity, publish pipeline and subscriptions.
//!
//! ```text
//! client/
//! ├── transport.rs             UaTransport contract
//! ├── session.rs               ConnectionState, SessionInfo, ClientEvent, ClientStats
//! ├── subscription.rs          ClientSubscription, listeners, sequence tracking
//! ├── publish_engine.rs        publish workers, gap recovery
//! ├── reconnect.rs             repair / recreate / transfer
//! ├── ua_client.rs             UaClient services
//! └── monitored_item_group.rs  batched item operations
//! ```

pub mod monitored_item_group;
mod publish_engine;
mod reconnect;
pub mod session;
pub mod subscription;
pub mod transport;
pub mod ua_client;

pub use monitored_item_group::MonitoredItemGroup;
pub use session::{ClientEvent, ClientStats, ConnectionState, SessionInfo};
pub use subscription::{
    ChannelListener, ClientMonitoredItem, ClientSubscription, ClientSubscriptionState,
    RevisedParameters, SubscriptionEvent, SubscriptionListener,
};
pub use transport::UaTransport;
pub use ua_client::{CreatedItem, UaClient};
