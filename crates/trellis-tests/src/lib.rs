// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Trellis Integration Tests
//!
//! End-to-end tests that run a real [`UaClient`](trellis_opcua::UaClient)
//! against a real [`SubscriptionServer`](trellis_opcua::SubscriptionServer)
//! in one process. Requests travel through a loopback transport that can
//! drop channels, refuse connections and swap the server underneath the
//! client, so recovery paths run exactly as they would over a network.
//!
//! ## Module Structure
//!
//! - [`common`]: Shared test utilities, fixtures, and helpers
//!   - `fixtures`: Node catalog, users and configurations
//!   - `builders`: Builder for monitored item requests
//!   - `assertions`: Waiting helpers for subscription and client events
//!   - `mocks`: Loopback transport with fault injection
//!   - `harness`: Server runtime plus transports, torn down together
//!
//! ## Running Tests
//!
//! ```bash
//! # Run all integration tests
//! cargo test -p trellis-tests
//!
//! # Run specific test suite
//! cargo test -p trellis-tests --test integration_subscription
//! cargo test -p trellis-tests --test integration_monitored_items
//! cargo test -p trellis-tests --test integration_session
//! cargo test -p trellis-tests --test integration_reconnect
//! cargo test -p trellis-tests --test integration_config
//!
//! # Show runtime logs
//! RUST_LOG=trellis_opcua=debug cargo test -p trellis-tests -- --nocapture
//! ```
//!
//! ## Test Categories
//!
//! ### Subscription Tests (`integration_subscription.rs`)
//! - Keep-alive cadence and lifetime revision
//! - Publishing mode and parameter changes
//! - Transfer between sessions
//!
//! ### Monitored Item Tests (`integration_monitored_items.rs`)
//! - Queue overflow and the overflow bit
//! - Absolute deadband boundary
//! - Triggering links
//! - Event items and item groups
//!
//! ### Session Tests (`integration_session.rs`)
//! - Identity upgrade revalidating denied items
//! - Rejected identity changes
//!
//! ### Reconnection Tests (`integration_reconnect.rs`)
//! - Initial retry budget and give-up
//! - Repair after channel loss, unbounded after first contact
//! - Session loss followed by transfer or recreation
//! - Server restart
//!
//! ### Config Tests (`integration_config.rs`)
//! - TOML and JSON files, validation failures
//!
//! ## Writing New Tests
//!
//! Time-dependent tests run on a paused clock, so publishing intervals and
//! backoff delays elapse instantly but in order:
//!
//! ```rust,ignore
//! use trellis_tests::prelude::*;
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_something() {
//!     let mut harness = UaHarness::start(ConfigFixtures::server());
//!     let (client, _transport) = harness.connected_client(IdentityFixtures::operator()).await;
//!     let sub = client
//!         .create_subscription(ConfigFixtures::subscription(100, 3))
//!         .await
//!         .unwrap();
//!     let mut events = listen(&sub);
//!     // ... test logic
//!     harness.shutdown().await;
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod common;

/// Re-export commonly used items for convenience.
pub mod prelude {
    pub use crate::common::assertions::*;
    pub use crate::common::builders::*;
    pub use crate::common::fixtures::*;
    pub use crate::common::harness::*;
    pub use crate::common::mocks::*;
    pub use crate::common::init_test_logging;
}
