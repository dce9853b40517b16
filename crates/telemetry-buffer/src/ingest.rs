// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ingestion boundary: the one call collectors make per telemetry event.
//!
//! `submit` never blocks on the network. While the tunnel is up, records are
//! handed to a bounded fast-path queue whose single consumer attempts
//! immediate delivery; a full queue, a downed tunnel, or a failed fast-path
//! delivery all land the record in the durable store instead. The fast path
//! is an optimization, never a point of loss.

use crate::codec;
use crate::error::BufferError;
use crate::forwarder::Forwarder;
use crate::monitor::StatusHandle;
use crate::policy::PolicyEngine;
use crate::reaper;
use crate::record::{DataType, TelemetryRecord};
use crate::store::BufferStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// A record as submitted by a collector, before store-assigned fields.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub service: String,
    pub data_type: DataType,
    pub timestamp: Option<DateTime<Utc>>,
    pub source_ip: Option<String>,
    pub payload: Vec<u8>,
}

pub struct IngestService {
    policy: Arc<PolicyEngine>,
    store: BufferStore,
    status: StatusHandle,
    fast_tx: mpsc::Sender<TelemetryRecord>,
}

impl IngestService {
    /// Build the service plus its fast-path consumer. The worker must be
    /// spawned by the caller; dropping it closes the fast path and `submit`
    /// falls back to synchronous inserts.
    pub fn new(
        policy: Arc<PolicyEngine>,
        store: BufferStore,
        status: StatusHandle,
        forwarder: Arc<Forwarder>,
    ) -> (Self, FastPathWorker) {
        let queue = policy.snapshot().fast_path_queue.max(1);
        let (fast_tx, fast_rx) = mpsc::channel(queue);
        let service = Self {
            policy,
            store: store.clone(),
            status,
            fast_tx,
        };
        let worker = FastPathWorker {
            rx: fast_rx,
            forwarder,
            store,
        };
        (service, worker)
    }

    /// Accept one telemetry event. On return the record is either delivered,
    /// queued for immediate delivery, or durably stored; an error means the
    /// caller must not assume the record was kept.
    pub async fn submit(&self, new: NewRecord) -> Result<(), BufferError> {
        let policy = self.policy.snapshot();
        if !policy.enabled {
            return Err(BufferError::Disabled);
        }
        let svc = policy.services.get(&new.service).cloned().unwrap_or_default();
        if !svc.enabled {
            return Err(BufferError::ServiceDisabled(new.service));
        }

        // Compress first so overflow math sees the stored size.
        let payload = codec::compress(&new.payload, svc.compression_mode)?;
        let data_size = payload.len();

        // Keep the cap enforced, not merely advisory: the overflow action
        // runs before this write is acknowledged.
        reaper::enforce_cap(&self.store, &policy, data_size)?;

        let now = Utc::now();
        let record = TelemetryRecord {
            id: 0,
            service: new.service.clone(),
            timestamp: new.timestamp.unwrap_or(now),
            data_type: new.data_type,
            payload,
            data_size,
            source_ip: new.source_ip,
            compression: svc.compression_mode,
            forwarded: false,
            retry_count: 0,
            created_at: now,
            expires_at: now + policy.retention_for(&new.service),
        };

        #[allow(clippy::expect_used)]
        let connected = self.status.read().expect("status lock poisoned").connected;

        if policy.fast_path_enabled && connected {
            match self.fast_tx.try_send(record) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::TrySendError::Full(record))
                | Err(mpsc::error::TrySendError::Closed(record)) => {
                    debug!("fast path unavailable, buffering record");
                    self.store.insert(&record)?;
                    return Ok(());
                }
            }
        }

        self.store.insert(&record)?;
        Ok(())
    }
}

/// Single consumer of the bounded fast-path queue. Attempts immediate
/// delivery; failures are re-queued to the store, never dropped.
pub struct FastPathWorker {
    rx: mpsc::Receiver<TelemetryRecord>,
    forwarder: Arc<Forwarder>,
    store: BufferStore,
}

impl FastPathWorker {
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                record = self.rx.recv() => {
                    let Some(record) = record else { break };
                    self.handle(record).await;
                }
                _ = shutdown.cancelled() => {
                    // Stop accepting new handoffs, then persist whatever is
                    // still queued instead of racing the network.
                    self.rx.close();
                    while let Ok(record) = self.rx.try_recv() {
                        if let Err(e) = self.store.insert(&record) {
                            error!("failed to buffer fast-path backlog on shutdown: {e}");
                        }
                    }
                    debug!("fast-path worker shutting down");
                    break;
                }
            }
        }
    }

    async fn handle(&self, record: TelemetryRecord) {
        if let Err(e) = self.forwarder.forward(&record).await {
            debug!(service = %record.service, "fast-path delivery failed, buffering: {e}");
            if let Err(e) = self.store.insert(&record) {
                // The one place a record can be lost; make it loud.
                error!(
                    service = %record.service,
                    "record lost: fast-path delivery and fallback insert both failed: {e}"
                );
            }
        }
    }
}
