// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Overflow and retention enforcement.
//!
//! Two independent, idempotent operations: a periodic expiry sweep and the
//! synchronous overflow action run from the ingestion path before a write is
//! acknowledged. Both are safe to run concurrently with ingestion and drain;
//! the store's own locking is the serialization point.

use crate::error::BufferError;
use crate::policy::{BufferConfig, OverflowAction, PolicyEngine};
use crate::store::BufferStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Rows evicted per overflow round.
pub const OVERFLOW_EVICT_BATCH: usize = 1000;

/// Enforce the global soft cap before accepting a record of `incoming`
/// (compressed) bytes. Returns an error when the write must be rejected.
pub fn enforce_cap(
    store: &BufferStore,
    policy: &BufferConfig,
    incoming: usize,
) -> Result<(), BufferError> {
    let cap = policy.cap_bytes();
    let projected = store.total_size_bytes() + incoming as u64;
    if projected <= cap {
        return Ok(());
    }

    match policy.overflow_action {
        OverflowAction::DropOldest => {
            // Lossy by policy: bounded disk usage wins over completeness.
            while store.total_size_bytes() + incoming as u64 > cap {
                let deleted = store.delete_oldest(OVERFLOW_EVICT_BATCH)?;
                if deleted == 0 {
                    break;
                }
            }
            if store.total_size_bytes() + incoming as u64 > cap {
                // Buffer is empty and the record alone does not fit.
                Err(BufferError::Overflow(format!(
                    "record of {incoming} bytes exceeds the {cap} byte cap"
                )))
            } else {
                Ok(())
            }
        }
        OverflowAction::DropNewest => Err(BufferError::Overflow(format!(
            "buffer at {projected} of {cap} bytes, rejecting incoming record"
        ))),
        OverflowAction::CompressMore => {
            // Not implemented: admit the record but keep the overflow
            // visible instead of pretending it was handled.
            warn!(
                projected,
                cap, "overflow action 'compress_more' is a no-op, buffer remains over cap"
            );
            Ok(())
        }
    }
}

/// Periodic expiry sweep over the store.
pub struct Reaper {
    store: BufferStore,
    policy: Arc<PolicyEngine>,
}

impl Reaper {
    #[must_use]
    pub fn new(store: BufferStore, policy: Arc<PolicyEngine>) -> Self {
        Self { store, policy }
    }

    /// One sweep: remove every row past its `expires_at`, forwarded or not.
    /// Also invoked out of band by the cleanup endpoint.
    pub fn sweep(&self) -> Result<usize, BufferError> {
        let deleted = self.store.delete_expired(Utc::now())?;
        if deleted > 0 {
            info!(deleted, "expiry sweep removed records");
        }
        Ok(deleted)
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mins = self.policy.snapshot().cleanup_interval_mins.max(1);
        let mut ticker = tokio::time::interval(Duration::from_secs(mins * 60));
        ticker.tick().await; // discard first tick, which is instantaneous
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep() {
                        error!("expiry sweep failed: {e}");
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!("reaper shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CompressionMode;
    use crate::record::{DataType, TelemetryRecord};
    use chrono::Duration as ChronoDuration;

    fn record_of_size(size: usize, ts_offset_secs: i64) -> TelemetryRecord {
        let now = Utc::now();
        TelemetryRecord {
            id: 0,
            service: "fluent-bit".to_string(),
            timestamp: now + ChronoDuration::seconds(ts_offset_secs),
            data_type: DataType::Syslog,
            payload: vec![0u8; size],
            data_size: size,
            source_ip: None,
            compression: CompressionMode::None,
            forwarded: false,
            retry_count: 0,
            created_at: now,
            expires_at: now + ChronoDuration::hours(1),
        }
    }

    fn policy_with(action: OverflowAction, cap_mb: u64) -> BufferConfig {
        BufferConfig {
            overflow_action: action,
            max_buffer_size_mb: cap_mb,
            ..Default::default()
        }
    }

    #[test]
    fn test_cap_not_exceeded_is_a_noop() {
        let store = BufferStore::open_in_memory().unwrap();
        store.insert(&record_of_size(100, 0)).unwrap();
        let policy = policy_with(OverflowAction::DropNewest, 1);
        assert!(enforce_cap(&store, &policy, 100).is_ok());
        assert_eq!(store.stats("fluent-bit").unwrap().total_records, 1);
    }

    #[test]
    fn test_drop_oldest_evicts_until_the_record_fits() {
        let store = BufferStore::open_in_memory().unwrap();
        // Fill right up to a 1 MB cap.
        let chunk = 256 * 1024;
        for offset in 0..4 {
            store.insert(&record_of_size(chunk, offset)).unwrap();
        }
        let policy = policy_with(OverflowAction::DropOldest, 1);

        enforce_cap(&store, &policy, chunk).unwrap();
        assert!(store.total_size_bytes() + chunk as u64 <= policy.cap_bytes());
    }

    #[test]
    fn test_drop_oldest_rejects_record_bigger_than_cap() {
        let store = BufferStore::open_in_memory().unwrap();
        let policy = policy_with(OverflowAction::DropOldest, 1);
        let err = enforce_cap(&store, &policy, 2 * 1024 * 1024).unwrap_err();
        assert!(matches!(err, BufferError::Overflow(_)));
    }

    #[test]
    fn test_drop_newest_rejects_without_touching_stored_data() {
        let store = BufferStore::open_in_memory().unwrap();
        store.insert(&record_of_size(512 * 1024, 0)).unwrap();
        let policy = policy_with(OverflowAction::DropNewest, 1);

        let err = enforce_cap(&store, &policy, 600 * 1024).unwrap_err();
        assert!(matches!(err, BufferError::Overflow(_)));
        assert_eq!(store.stats("fluent-bit").unwrap().total_records, 1);
    }

    #[test]
    fn test_compress_more_is_an_admitting_noop() {
        let store = BufferStore::open_in_memory().unwrap();
        store.insert(&record_of_size(900 * 1024, 0)).unwrap();
        let policy = policy_with(OverflowAction::CompressMore, 1);

        assert!(enforce_cap(&store, &policy, 300 * 1024).is_ok());
        // Nothing was evicted.
        assert_eq!(store.stats("fluent-bit").unwrap().total_records, 1);
    }

    #[test]
    fn test_sweep_removes_only_expired_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = BufferStore::open_in_memory().unwrap();
        let policy =
            Arc::new(PolicyEngine::load(dir.path().join("buffer_config.json")).unwrap());

        let now = Utc::now();
        let mut expired = record_of_size(10, 0);
        expired.created_at = now - ChronoDuration::hours(2);
        expired.expires_at = now - ChronoDuration::hours(1);
        store.insert(&expired).unwrap();
        store.insert(&record_of_size(10, 1)).unwrap();

        let reaper = Reaper::new(store.clone(), policy);
        assert_eq!(reaper.sweep().unwrap(), 1);
        assert_eq!(reaper.sweep().unwrap(), 0);
        assert_eq!(store.stats("fluent-bit").unwrap().total_records, 1);
    }
}
