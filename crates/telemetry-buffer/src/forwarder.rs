// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Protocol-aware delivery to the remote endpoint.
//!
//! One sender per data type, wired into a lookup table at startup. UDP
//! senders are fire-and-forget (best-effort by protocol nature); HTTP
//! senders use a short deadline and fail on any I/O error or non-2xx.
//!
//! The drain loop walks the store oldest-first and halts the pass on the
//! first delivery failure so a still-flaky link is not hammered and ordering
//! is preserved. Corrupt payloads are scoped to their own record: logged,
//! retry-bumped, skipped.

use crate::codec;
use crate::error::BufferError;
use crate::monitor::DrainTrigger;
use crate::policy::TargetConfig;
use crate::record::{DataType, TelemetryRecord};
use crate::store::BufferStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// One protocol sender. Implementations are pure delivery: no store access,
/// no retry policy of their own.
#[async_trait]
pub trait Sender: Send + Sync {
    async fn forward(&self, record: &TelemetryRecord, payload: &[u8]) -> Result<(), BufferError>;
}

/// Fire-and-forget UDP delivery to a fixed host:port (syslog, SNMP traps).
pub struct UdpSender {
    socket: UdpSocket,
    host: String,
    port: u16,
}

impl UdpSender {
    pub async fn bind(host: String, port: u16) -> Result<Self, BufferError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        Ok(Self { socket, host, port })
    }
}

#[async_trait]
impl Sender for UdpSender {
    async fn forward(&self, _record: &TelemetryRecord, payload: &[u8]) -> Result<(), BufferError> {
        self.socket
            .send_to(payload, (self.host.as_str(), self.port))
            .await?;
        Ok(())
    }
}

/// Flow records: UDP with the destination port picked from the record's own
/// `flow_type` field (NetFlow default, sFlow and IPFIX overrides).
pub struct FlowSender {
    socket: UdpSocket,
    host: String,
    netflow_port: u16,
    sflow_port: u16,
    ipfix_port: u16,
}

impl FlowSender {
    pub async fn bind(target: &TargetConfig) -> Result<Self, BufferError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        Ok(Self {
            socket,
            host: target.host.clone(),
            netflow_port: target.netflow_port,
            sflow_port: target.sflow_port,
            ipfix_port: target.ipfix_port,
        })
    }

    fn port_for(&self, payload: &[u8]) -> u16 {
        let flow_type = serde_json::from_slice::<serde_json::Value>(payload)
            .ok()
            .and_then(|v| v.get("flow_type").and_then(|t| t.as_str().map(String::from)));
        match flow_type.as_deref() {
            Some("sflow") => self.sflow_port,
            Some("ipfix") => self.ipfix_port,
            _ => self.netflow_port,
        }
    }
}

#[async_trait]
impl Sender for FlowSender {
    async fn forward(&self, _record: &TelemetryRecord, payload: &[u8]) -> Result<(), BufferError> {
        let port = self.port_for(payload);
        self.socket
            .send_to(payload, (self.host.as_str(), port))
            .await?;
        Ok(())
    }
}

/// Windows events: HTTP POST of the raw event body.
pub struct HttpEventsSender {
    client: reqwest::Client,
    url: String,
}

#[async_trait]
impl Sender for HttpEventsSender {
    async fn forward(&self, _record: &TelemetryRecord, payload: &[u8]) -> Result<(), BufferError> {
        let resp = self
            .client
            .post(&self.url)
            .timeout(SEND_TIMEOUT)
            .header("Content-Type", "application/json")
            .body(payload.to_vec())
            .send()
            .await
            .map_err(|e| BufferError::Forward(format!("events endpoint: {e}")))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(BufferError::Forward(format!(
                "events endpoint returned status {}",
                resp.status()
            )))
        }
    }
}

/// Metrics: HTTP POST to the time-series write endpoint with bearer auth.
pub struct HttpMetricsSender {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

#[async_trait]
impl Sender for HttpMetricsSender {
    async fn forward(&self, _record: &TelemetryRecord, payload: &[u8]) -> Result<(), BufferError> {
        let mut req = self
            .client
            .post(&self.url)
            .timeout(SEND_TIMEOUT)
            .header("Content-Type", "application/json")
            .body(payload.to_vec());
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| BufferError::Forward(format!("metrics endpoint: {e}")))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(BufferError::Forward(format!(
                "metrics endpoint returned status {}",
                resp.status()
            )))
        }
    }
}

/// Outcome of one drain pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct DrainReport {
    pub forwarded: usize,
    pub skipped: usize,
    pub halted: bool,
}

/// Dispatch table plus the drain loop over the store.
pub struct Forwarder {
    senders: HashMap<DataType, Arc<dyn Sender>>,
    store: BufferStore,
    batch_size: usize,
}

impl Forwarder {
    /// Build the full dispatch table against the configured target.
    pub async fn new(
        target: &TargetConfig,
        store: BufferStore,
        batch_size: usize,
    ) -> Result<Self, BufferError> {
        let client = reqwest::Client::new();
        let mut senders: HashMap<DataType, Arc<dyn Sender>> = HashMap::new();
        senders.insert(
            DataType::Syslog,
            Arc::new(UdpSender::bind(target.host.clone(), target.syslog_port).await?),
        );
        senders.insert(
            DataType::Snmp,
            Arc::new(UdpSender::bind(target.host.clone(), target.snmp_port).await?),
        );
        senders.insert(DataType::Netflow, Arc::new(FlowSender::bind(target).await?));
        senders.insert(
            DataType::WindowsEvents,
            Arc::new(HttpEventsSender {
                client: client.clone(),
                url: target.events_url.clone(),
            }),
        );
        senders.insert(
            DataType::Metrics,
            Arc::new(HttpMetricsSender {
                client,
                url: target.metrics_url.clone(),
                token: target.auth_token.clone(),
            }),
        );
        Ok(Self::with_senders(senders, store, batch_size))
    }

    /// Test seam: inject arbitrary senders.
    #[must_use]
    pub fn with_senders(
        senders: HashMap<DataType, Arc<dyn Sender>>,
        store: BufferStore,
        batch_size: usize,
    ) -> Self {
        Self {
            senders,
            store,
            batch_size,
        }
    }

    /// Deliver one record (decompress, dispatch). Used by the fast path and
    /// by the drain loop.
    pub async fn forward(&self, record: &TelemetryRecord) -> Result<(), BufferError> {
        let payload = codec::decompress(&record.payload, record.compression)?;
        self.dispatch(record, &payload).await
    }

    async fn dispatch(
        &self,
        record: &TelemetryRecord,
        payload: &[u8],
    ) -> Result<(), BufferError> {
        let sender = self
            .senders
            .get(&record.data_type)
            .ok_or_else(|| BufferError::UnsupportedDataType(record.data_type.to_string()))?;
        sender.forward(record, payload).await
    }

    /// One drain invocation: walk the backlog oldest-first in batches,
    /// marking each delivery, until the backlog is empty or a delivery
    /// fails. The next trigger resumes from the same oldest unforwarded row.
    pub async fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();
        'passes: loop {
            let batch = match self.store.query_unforwarded(self.batch_size) {
                Ok(batch) => batch,
                Err(e) => {
                    error!("drain scan failed: {e}");
                    report.halted = true;
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }
            let fetched = batch.len();
            let mut progressed = 0usize;

            for record in batch {
                let payload = match codec::decompress(&record.payload, record.compression) {
                    Ok(payload) => payload,
                    Err(e) => {
                        // Scoped to this record: leave it pending for the
                        // expiry sweep, never halt the pass over it.
                        warn!(id = record.id, service = %record.service, "skipping corrupt payload: {e}");
                        if let Err(e) = self.store.bump_retry(record.id) {
                            error!("retry bump failed: {e}");
                        }
                        report.skipped += 1;
                        continue;
                    }
                };

                match self.dispatch(&record, &payload).await {
                    Ok(()) => {
                        if let Err(e) = self.store.mark_forwarded(record.id) {
                            error!("mark_forwarded failed: {e}");
                            report.halted = true;
                            break 'passes;
                        }
                        report.forwarded += 1;
                        progressed += 1;
                    }
                    Err(e) => {
                        warn!(
                            id = record.id,
                            service = %record.service,
                            "delivery failed, halting drain pass: {e}"
                        );
                        report.halted = true;
                        break 'passes;
                    }
                }
            }

            // A short batch means the backlog is exhausted; zero progress
            // means everything left is corrupt-skipped.
            if fetched < self.batch_size || progressed == 0 {
                break;
            }
        }
        report
    }
}

/// Long-lived worker: one drain invocation per trigger (reconnection or
/// manual), serialized so concurrent triggers cannot interleave passes.
pub async fn run_drain_worker(
    forwarder: Arc<Forwarder>,
    mut drain_rx: mpsc::Receiver<DrainTrigger>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            trigger = drain_rx.recv() => {
                let Some(trigger) = trigger else { break };
                debug!("drain triggered: {trigger:?}");
                let report = forwarder.drain().await;
                info!(
                    forwarded = report.forwarded,
                    skipped = report.skipped,
                    halted = report.halted,
                    "drain pass finished"
                );
            }
            _ = shutdown.cancelled() => {
                debug!("drain worker shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CompressionMode;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pending_record(ts_offset_secs: i64, payload: &[u8]) -> TelemetryRecord {
        let now = Utc::now();
        TelemetryRecord {
            id: 0,
            service: "fluent-bit".to_string(),
            timestamp: now + ChronoDuration::seconds(ts_offset_secs),
            data_type: DataType::Syslog,
            payload: payload.to_vec(),
            data_size: payload.len(),
            source_ip: None,
            compression: CompressionMode::None,
            forwarded: false,
            retry_count: 0,
            created_at: now,
            expires_at: now + ChronoDuration::hours(1),
        }
    }

    /// Sender that fails on the k-th call (1-based), succeeds otherwise.
    struct ScriptedSender {
        calls: AtomicUsize,
        fail_at: usize,
    }

    #[async_trait]
    impl Sender for ScriptedSender {
        async fn forward(
            &self,
            _record: &TelemetryRecord,
            _payload: &[u8],
        ) -> Result<(), BufferError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == self.fail_at {
                Err(BufferError::Forward("simulated failure".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn scripted_forwarder(store: BufferStore, fail_at: usize) -> Forwarder {
        let mut senders: HashMap<DataType, Arc<dyn Sender>> = HashMap::new();
        senders.insert(
            DataType::Syslog,
            Arc::new(ScriptedSender {
                calls: AtomicUsize::new(0),
                fail_at,
            }),
        );
        Forwarder::with_senders(senders, store, 1000)
    }

    #[tokio::test]
    async fn test_drain_ordering_and_halt_on_failure() {
        let store = BufferStore::open_in_memory().unwrap();
        for offset in [10, 20, 30, 40, 50] {
            store
                .insert(&pending_record(offset, b"m"))
                .unwrap();
        }

        // Fails on the 3rd call: exactly the first two (oldest) forwarded.
        let forwarder = scripted_forwarder(store.clone(), 3);
        let report = forwarder.drain().await;

        assert_eq!(report.forwarded, 2);
        assert!(report.halted);

        let remaining = store.query_unforwarded(10).unwrap();
        assert_eq!(remaining.len(), 3);
        assert!(remaining.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn test_drain_empties_backlog_when_link_is_healthy() {
        let store = BufferStore::open_in_memory().unwrap();
        for offset in 0..5 {
            store.insert(&pending_record(offset, b"m")).unwrap();
        }

        let forwarder = scripted_forwarder(store.clone(), usize::MAX);
        let report = forwarder.drain().await;

        assert_eq!(report.forwarded, 5);
        assert!(!report.halted);
        assert!(store.query_unforwarded(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drain_skips_corrupt_record_without_halting() {
        let store = BufferStore::open_in_memory().unwrap();
        let mut corrupt = pending_record(0, b"definitely not zstd");
        corrupt.compression = CompressionMode::Zstd;
        let corrupt_id = store.insert(&corrupt).unwrap();
        store.insert(&pending_record(10, b"good")).unwrap();

        let forwarder = scripted_forwarder(store.clone(), usize::MAX);
        let report = forwarder.drain().await;

        assert_eq!(report.forwarded, 1);
        assert_eq!(report.skipped, 1);
        assert!(!report.halted);

        // The corrupt record stays pending with its retry bumped; expiry
        // will remove it eventually.
        let remaining = store.query_unforwarded(10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, corrupt_id);
        assert_eq!(remaining[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_udp_sender_delivers_datagram() {
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = sink.local_addr().unwrap().port();

        let sender = UdpSender::bind("127.0.0.1".to_string(), port).await.unwrap();
        let record = pending_record(0, b"<134>hello");
        sender.forward(&record, &record.payload).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = sink.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"<134>hello");
    }

    #[tokio::test]
    async fn test_flow_sender_port_selection() {
        let target = TargetConfig::default();
        let sender = FlowSender::bind(&target).await.unwrap();

        assert_eq!(sender.port_for(br#"{"flow_type":"sflow"}"#), target.sflow_port);
        assert_eq!(sender.port_for(br#"{"flow_type":"ipfix"}"#), target.ipfix_port);
        assert_eq!(
            sender.port_for(br#"{"flow_type":"netflow"}"#),
            target.netflow_port
        );
        // Missing field and unparseable payloads default to NetFlow.
        assert_eq!(sender.port_for(br#"{"bytes":42}"#), target.netflow_port);
        assert_eq!(sender.port_for(b"\x00\x01binary"), target.netflow_port);
    }

    #[tokio::test]
    async fn test_http_metrics_sender_bearer_and_status() {
        let mut server = mockito::Server::new_async().await;
        let ok = server
            .mock("POST", "/api/v1/write")
            .match_header("authorization", "Bearer sekrit")
            .with_status(204)
            .create_async()
            .await;

        let sender = HttpMetricsSender {
            client: reqwest::Client::new(),
            url: format!("{}/api/v1/write", server.url()),
            token: Some("sekrit".to_string()),
        };
        let record = pending_record(0, b"{}");
        sender.forward(&record, b"{}").await.unwrap();
        ok.assert_async().await;

        // Non-2xx is a delivery failure.
        ok.remove_async().await;
        server
            .mock("POST", "/api/v1/write")
            .with_status(500)
            .create_async()
            .await;
        let err = sender.forward(&record, b"{}").await.unwrap_err();
        assert!(matches!(err, BufferError::Forward(_)));
    }

    #[tokio::test]
    async fn test_http_events_sender_non_2xx_fails() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v1/events")
            .with_status(403)
            .create_async()
            .await;

        let sender = HttpEventsSender {
            client: reqwest::Client::new(),
            url: format!("{}/api/v1/events", server.url()),
        };
        let record = pending_record(0, b"{}");
        let err = sender.forward(&record, b"{}").await.unwrap_err();
        assert!(matches!(err, BufferError::Forward(_)));
    }
}
