// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Connectivity monitor: periodic health probe of the remote endpoint.
//!
//! The status struct is the one piece of cross-cutting shared mutable state
//! in the system. Its lock is held only for the duration of the read/write,
//! never across the network probe. Exactly one drain trigger fires per
//! DISCONNECTED -> CONNECTED transition; repeated connected probes while
//! already connected do not re-trigger.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// The system's current belief about reachability of the remote endpoint.
/// Not persisted: a restart resets it to disconnected until the first probe.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectivityStatus {
    pub connected: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub latency_ms: Option<u64>,
    pub failure_count: u32,
    pub last_error: Option<String>,
}

/// Shared read handle over the status; written only by the monitor task.
pub type StatusHandle = Arc<RwLock<ConnectivityStatus>>;

/// Why a drain pass is being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainTrigger {
    Reconnected,
    Manual,
}

pub struct ConnectivityMonitor {
    status: StatusHandle,
    client: reqwest::Client,
    health_url: String,
    interval: Duration,
    drain_tx: mpsc::Sender<DrainTrigger>,
}

impl ConnectivityMonitor {
    #[must_use]
    pub fn new(health_url: String, interval: Duration, drain_tx: mpsc::Sender<DrainTrigger>) -> Self {
        Self {
            status: Arc::new(RwLock::new(ConnectivityStatus::default())),
            client: reqwest::Client::new(),
            health_url,
            interval,
            drain_tx,
        }
    }

    #[must_use]
    pub fn status_handle(&self) -> StatusHandle {
        Arc::clone(&self.status)
    }

    /// One bounded-timeout probe of the health surface. Network failures and
    /// non-2xx responses are distinguished in the error cause.
    async fn probe(&self) -> Result<u64, String> {
        let started = Instant::now();
        match self
            .client
            .get(&self.health_url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                Ok(started.elapsed().as_millis() as u64)
            }
            Ok(resp) => Err(format!("health probe returned status {}", resp.status())),
            Err(e) => Err(format!("network error: {e}")),
        }
    }

    /// Apply one probe outcome to the shared status. Returns true exactly
    /// when this outcome is a DISCONNECTED -> CONNECTED transition.
    fn observe(&self, outcome: Result<u64, String>) -> bool {
        #[allow(clippy::expect_used)]
        let mut status = self.status.write().expect("status lock poisoned");
        let was_connected = status.connected;
        status.last_check = Some(Utc::now());
        match outcome {
            Ok(latency_ms) => {
                status.connected = true;
                status.latency_ms = Some(latency_ms);
                status.failure_count = 0;
                status.last_error = None;
                !was_connected
            }
            Err(cause) => {
                status.connected = false;
                status.latency_ms = None;
                status.failure_count = status.failure_count.saturating_add(1);
                status.last_error = Some(cause);
                false
            }
        }
    }

    /// Probe loop; runs for the process lifetime.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = self.probe().await;
                    if let Err(ref cause) = outcome {
                        warn!("remote endpoint unreachable: {cause}");
                    }
                    if self.observe(outcome) {
                        info!("connectivity restored, requesting drain");
                        // Capacity-1 channel: a full channel means a drain is
                        // already pending, which is exactly what we want.
                        if let Err(mpsc::error::TrySendError::Closed(_)) =
                            self.drain_tx.try_send(DrainTrigger::Reconnected)
                        {
                            debug!("drain worker gone, trigger dropped");
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!("connectivity monitor shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(monitor: &ConnectivityMonitor) -> ConnectivityStatus {
        monitor.status_handle().read().unwrap().clone()
    }

    fn monitor() -> (ConnectivityMonitor, mpsc::Receiver<DrainTrigger>) {
        let (tx, rx) = mpsc::channel(1);
        (
            ConnectivityMonitor::new(
                "http://127.0.0.1:1/health".to_string(),
                Duration::from_secs(30),
                tx,
            ),
            rx,
        )
    }

    #[test]
    fn test_starts_disconnected() {
        let (monitor, _rx) = monitor();
        let status = snapshot(&monitor);
        assert!(!status.connected);
        assert!(status.last_check.is_none());
    }

    #[test]
    fn test_transition_fires_exactly_once() {
        let (monitor, _rx) = monitor();

        assert!(!monitor.observe(Err("network error: refused".into())));
        // DISCONNECTED -> CONNECTED: fires.
        assert!(monitor.observe(Ok(12)));
        // Repeated connected probes: no re-trigger.
        assert!(!monitor.observe(Ok(9)));
        assert!(!monitor.observe(Ok(15)));
        // Drop and reconnect: fires again.
        assert!(!monitor.observe(Err("health probe returned status 502".into())));
        assert!(monitor.observe(Ok(30)));
    }

    #[test]
    fn test_failure_count_and_reset() {
        let (monitor, _rx) = monitor();
        monitor.observe(Err("a".into()));
        monitor.observe(Err("b".into()));
        assert_eq!(snapshot(&monitor).failure_count, 2);
        assert_eq!(snapshot(&monitor).last_error.as_deref(), Some("b"));

        monitor.observe(Ok(5));
        let status = snapshot(&monitor);
        assert_eq!(status.failure_count, 0);
        assert_eq!(status.latency_ms, Some(5));
        assert!(status.last_error.is_none());
        assert!(status.last_check.is_some());
    }

    #[tokio::test]
    async fn test_probe_classifies_status_vs_network() {
        let mut server = mockito::Server::new_async().await;
        let (tx, _rx) = mpsc::channel(1);

        let ok_mock = server
            .mock("GET", "/health")
            .with_status(200)
            .create_async()
            .await;
        let monitor = ConnectivityMonitor::new(
            format!("{}/health", server.url()),
            Duration::from_secs(30),
            tx.clone(),
        );
        assert!(monitor.probe().await.is_ok());
        ok_mock.remove_async().await;

        server
            .mock("GET", "/health")
            .with_status(503)
            .create_async()
            .await;
        let err = monitor.probe().await.unwrap_err();
        assert!(err.contains("status"), "{err}");

        // Nothing listens on this port.
        let dead = ConnectivityMonitor::new(
            "http://127.0.0.1:1/health".to_string(),
            Duration::from_secs(30),
            tx,
        );
        let err = dead.probe().await.unwrap_err();
        assert!(err.contains("network error"), "{err}");
    }
}
