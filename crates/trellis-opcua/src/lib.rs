// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! OPC UA subscription runtime.
//!
//! This crate implements the subscription and publish service sets on both
//! sides of the wire, plus the session continuity a long-running client
//! needs to keep its data flowing across network and server failures.
//!
//! # Features
//!
//! - Monitored items with sampling, bounded queues, deadband and event filters
//! - The subscription state machine (keep-alive, lifetime, late, transfer)
//! - Client publish pipeline with sequence-gap recovery via Republish
//! - Reconnection: session repair, session recreation, subscription transfer
//!   and recreation as a last resort
//! - Identity changes on a live session with all-or-nothing revalidation
//!
//! # Layout
//!
//! ```text
//! trellis-opcua
//! ├── config     ClientConfig, ServerConfig, settings, file loading
//! ├── messages   logical service requests and responses
//! ├── filter     data change and event filters
//! ├── identity   identity tokens, validator and permission contracts
//! ├── server     SubscriptionServer and its timer runtime
//! └── client     UaClient, publish engine, reconnection
//! ```
//!
//! Wire encoding is not part of this crate. The client talks through a
//! [`UaTransport`]; the server answers [`Request`]s handed to
//! [`SubscriptionServer::handle_request`].
//!
//! # Example
//!
//! ```rust,ignore
//! use trellis_opcua::{ClientConfig, UaClient};
//!
//! let config = ClientConfig::builder()
//!     .endpoint("opc.tcp://localhost:4840")
//!     .build()?;
//! let client = UaClient::new(config, transport)?;
//! client.connect().await?;
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

pub mod client;
pub mod config;
pub mod filter;
pub mod identity;
pub mod messages;
pub mod server;

pub use client::{
    ChannelListener, ClientEvent, ClientStats, ClientSubscription, ConnectionState, CreatedItem,
    MonitoredItemGroup, SubscriptionEvent, SubscriptionListener, UaClient, UaTransport,
};
pub use config::{
    load_client_config, load_server_config, ClientConfig, ClientConfigBuilder,
    MonitoredItemSettings, ServerConfig, ServerLimits, SubscriptionSettings,
};
pub use filter::{
    DataChangeFilter, DataChangeTrigger, Deadband, EuRange, EventFilter, FilterResult,
    MonitoringFilter,
};
pub use identity::{
    AllowAll, IdentityToken, IdentityValidator, PermissionResolver, Role, RolePermissions,
    StaticUserValidator, UserIdentity,
};
pub use messages::{Request, RequestBody, Response, ResponseBody};
pub use server::{NodeCatalog, ServerRuntime, StaticCatalog, SubscriptionServer};
