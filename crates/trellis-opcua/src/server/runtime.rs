// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Background timer driving a [`SubscriptionServer`].
//!
//! The loop sleeps until the server's next deadline, capped at
//! `max_tick_interval`, and wakes early whenever a request may have moved
//! that deadline.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use super::service::SubscriptionServer;

/// Handle to the running timer task.
#[derive(Debug)]
pub struct ServerRuntime {
    server: Arc<SubscriptionServer>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServerRuntime {
    /// Spawns the timer loop on the current tokio runtime.
    pub fn spawn(server: Arc<SubscriptionServer>) -> Self {
        let (shutdown, mut stop) = watch::channel(false);
        let driven = Arc::clone(&server);

        let task = tokio::spawn(async move {
            let max_wait = driven.config().max_tick_interval;
            info!(max_wait_ms = max_wait.as_millis() as u64, "Subscription timer started");

            loop {
                let now = Instant::now();
                let cap = now + max_wait;
                let wake_at = driven.next_deadline().map_or(cap, |d| d.min(cap));

                tokio::select! {
                    _ = sleep_until(wake_at) => {
                        driven.tick_at(Instant::now());
                    }
                    _ = driven.wake_signal().notified() => {
                        driven.tick_at(Instant::now());
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Subscription timer stopped");
        });

        Self {
            server,
            shutdown,
            task,
        }
    }

    /// The driven server.
    pub fn server(&self) -> &Arc<SubscriptionServer> {
        &self.server
    }

    /// Stops the timer and waits for the task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            if e.is_panic() {
                tracing::error!(error = %e, "Subscription timer panicked");
            }
        }
        info!("Subscription timer shut down");
    }
}
