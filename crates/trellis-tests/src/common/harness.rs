// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Test Harness
//!
//! One subscription server with its timer runtime, plus the loopback
//! transports of every client created for the test.
//!
//! ```text
//! UaHarness
//! ├── StaticCatalog (shared, survives restarts)
//! ├── SubscriptionServer + ServerRuntime
//! └── LoopbackTransport per client ──► server
//! ```

use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use trellis_core::{DataValue, NodeId, Variant};
use trellis_opcua::{
    ClientConfig, IdentityToken, NodeCatalog, ServerConfig, ServerRuntime, StaticCatalog, SubscriptionServer,
    UaClient,
};

use super::fixtures::{ConfigFixtures, IdentityFixtures, NodeFixtures};
use super::mocks::LoopbackTransport;

/// Client type used throughout the tests.
pub type TestClient = UaClient<LoopbackTransport>;

// =============================================================================
// UaHarness
// =============================================================================

/// Server, runtime and transports for one test.
pub struct UaHarness {
    catalog: Arc<StaticCatalog>,
    server: Arc<SubscriptionServer>,
    runtime: Option<ServerRuntime>,
    channel_ids: Arc<AtomicU32>,
    transports: Vec<Arc<LoopbackTransport>>,
}

impl UaHarness {
    /// Starts a server over the fixture address space.
    pub fn start(config: ServerConfig) -> Self {
        super::init_test_logging();
        let catalog = Arc::new(NodeFixtures::catalog());
        let server = Self::build_server(config, &catalog);
        let runtime = ServerRuntime::spawn(Arc::clone(&server));
        Self {
            catalog,
            server,
            runtime: Some(runtime),
            channel_ids: Arc::new(AtomicU32::new(0)),
            transports: Vec::new(),
        }
    }

    fn build_server(config: ServerConfig, catalog: &Arc<StaticCatalog>) -> Arc<SubscriptionServer> {
        let server = SubscriptionServer::builder()
            .config(config)
            .catalog(Arc::clone(catalog) as Arc<dyn NodeCatalog>)
            .validator(Arc::new(IdentityFixtures::validator()))
            .permissions(Arc::new(IdentityFixtures::permissions()))
            .build()
            .expect("Fixture server config must be valid");
        Arc::new(server)
    }

    /// The running server.
    pub fn server(&self) -> &Arc<SubscriptionServer> {
        &self.server
    }

    /// The address space.
    pub fn catalog(&self) -> &Arc<StaticCatalog> {
        &self.catalog
    }

    // -------------------------------------------------------------------------
    // Clients
    // -------------------------------------------------------------------------

    /// Creates a transport to the current server.
    pub fn transport(&mut self) -> Arc<LoopbackTransport> {
        let transport = Arc::new(LoopbackTransport::with_channel_ids(
            Arc::clone(&self.server),
            Arc::clone(&self.channel_ids),
        ));
        self.transports.push(Arc::clone(&transport));
        transport
    }

    /// Creates a client that has not connected yet.
    pub fn client(&mut self, config: ClientConfig) -> (TestClient, Arc<LoopbackTransport>) {
        let transport = self.transport();
        let client = UaClient::new(config, Arc::clone(&transport)).expect("Client config must be valid");
        (client, transport)
    }

    /// Creates and connects a client logging in with `identity`.
    pub async fn connected_client(&mut self, identity: IdentityToken) -> (TestClient, Arc<LoopbackTransport>) {
        let (client, transport) = self.client(ConfigFixtures::client(identity));
        client.connect().await.expect("Client must connect");
        (client, transport)
    }

    // -------------------------------------------------------------------------
    // Data source
    // -------------------------------------------------------------------------

    /// Writes a value to `node` and reports the change to the server.
    pub fn write(&self, node: &NodeId, value: impl Into<Variant>) {
        let value = DataValue::new(value);
        self.catalog.write(node, value.clone());
        self.server.notify_value_changed(node, value);
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Replaces the server with a fresh one, as if the process restarted.
    ///
    /// Sessions and subscriptions are gone; the address space keeps its
    /// values. Every transport is cut over to the new server.
    pub async fn restart_server(&mut self, config: ServerConfig) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown().await;
        }
        self.server = Self::build_server(config, &self.catalog);
        self.runtime = Some(ServerRuntime::spawn(Arc::clone(&self.server)));
        for transport in &self.transports {
            transport.restart_server(Arc::clone(&self.server));
        }
        tracing::info!("Test server restarted");
    }

    /// Stops the server runtime.
    pub async fn shutdown(mut self) {
        for transport in &self.transports {
            transport.break_channels();
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown().await;
        }
    }
}
