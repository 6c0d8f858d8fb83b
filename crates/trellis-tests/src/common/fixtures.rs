// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Test Fixtures
//!
//! Pre-built address space, users and configurations shared by the
//! integration tests.
//!
//! ## Address space
//!
//! ```text
//! ns=2;i=1..=5   Int32 variables, initial value 0
//! ns=2;i=3       readable by Engineer only
//! ns=2;i=10      Double analog variable, EU range 0..=200
//! ns=2;i=20      event notifier
//! ```

use std::time::Duration;

use trellis_core::{BackoffConfig, DataKind, DataValue, NodeId, RetryLimit};
use trellis_opcua::{
    ClientConfig, EuRange, IdentityToken, Role, RolePermissions, ServerConfig, StaticCatalog,
    StaticUserValidator, SubscriptionSettings,
};

// =============================================================================
// Node Fixtures
// =============================================================================

/// Nodes of the test address space.
pub struct NodeFixtures;

impl NodeFixtures {
    /// Namespace of every test node.
    pub const NAMESPACE: u16 = 2;

    /// Number of plain Int32 variables.
    pub const VARIABLES: u32 = 5;

    /// Variable readable by engineers only.
    pub const RESTRICTED: u32 = 3;

    /// A plain Int32 variable.
    pub fn variable(index: u32) -> NodeId {
        NodeId::numeric(Self::NAMESPACE, index)
    }

    /// The variable only engineers may read.
    pub fn restricted() -> NodeId {
        Self::variable(Self::RESTRICTED)
    }

    /// Analog variable with an engineering-units range of 0..=200.
    pub fn analog() -> NodeId {
        NodeId::numeric(Self::NAMESPACE, 10)
    }

    /// Event notifier.
    pub fn notifier() -> NodeId {
        NodeId::numeric(Self::NAMESPACE, 20)
    }

    /// A node that is not in the catalog.
    pub fn unknown() -> NodeId {
        NodeId::numeric(Self::NAMESPACE, 999)
    }

    /// Builds the catalog.
    pub fn catalog() -> StaticCatalog {
        let catalog = (1..=Self::VARIABLES).fold(StaticCatalog::new(), |catalog, i| {
            catalog.with_variable(Self::variable(i), DataKind::Int32, DataValue::new(0i32))
        });
        catalog
            .with_analog(
                Self::analog(),
                DataKind::Double,
                DataValue::new(100.0f64),
                EuRange {
                    low: 0.0,
                    high: 200.0,
                },
            )
            .with_notifier(Self::notifier())
    }
}

// =============================================================================
// Identity Fixtures
// =============================================================================

/// Users known to the test server.
pub struct IdentityFixtures;

impl IdentityFixtures {
    /// Operator: no access to the restricted node.
    pub fn operator() -> IdentityToken {
        IdentityToken::user_name("op", "op")
    }

    /// Engineer: full access.
    pub fn engineer() -> IdentityToken {
        IdentityToken::user_name("eng", "eng")
    }

    /// A known user with a wrong password.
    pub fn wrong_password() -> IdentityToken {
        IdentityToken::user_name("eng", "guess")
    }

    /// Validator holding both users.
    pub fn validator() -> StaticUserValidator {
        StaticUserValidator::new()
            .with_user("op", "op", [Role::Operator])
            .with_user("eng", "eng", [Role::Engineer])
    }

    /// Permissions restricting [`NodeFixtures::restricted`] to engineers.
    pub fn permissions() -> RolePermissions {
        RolePermissions::new().restrict(NodeFixtures::restricted(), [Role::Engineer])
    }
}

// =============================================================================
// Config Fixtures
// =============================================================================

/// Client and server configurations tuned for paused-clock tests.
pub struct ConfigFixtures;

impl ConfigFixtures {
    /// Endpoint every loopback transport reports.
    pub const ENDPOINT: &'static str = "opc.tcp://loopback:4840";

    /// Server defaults with transfer enabled.
    pub fn server() -> ServerConfig {
        ServerConfig::default()
    }

    /// Server that rejects TransferSubscriptions.
    pub fn server_without_transfer() -> ServerConfig {
        ServerConfig::default().with_transfer(false)
    }

    /// Short deterministic backoff: 50ms doubling to 400ms, no jitter, two
    /// retries on first contact.
    pub fn backoff() -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(400),
            multiplier: 2.0,
            jitter: 0.0,
            max_retry: RetryLimit::Limited(2),
        }
    }

    /// Client logging in with `identity`.
    pub fn client(identity: IdentityToken) -> ClientConfig {
        ClientConfig::builder()
            .endpoint(Self::ENDPOINT)
            .session_name("trellis-tests")
            .session_timeout(Duration::from_secs(30))
            .request_timeout(Duration::from_secs(2))
            .identity(identity)
            .reconnect(Self::backoff())
            .publish_pipeline_depth(2)
            .build()
            .expect("Fixture client config must be valid")
    }

    /// Subscription publishing every `interval_ms` with keep-alive count
    /// `keep_alive` and a lifetime of ten keep-alive periods.
    pub fn subscription(interval_ms: u64, keep_alive: u32) -> SubscriptionSettings {
        SubscriptionSettings::with_interval(Duration::from_millis(interval_ms))
            .with_counts(keep_alive, keep_alive * 10)
    }
}
