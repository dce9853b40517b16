// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable buffer backed by embedded SQLite.
//!
//! One writer-serialized connection behind a mutex; WAL journal with
//! `synchronous=NORMAL` (this is a buffer, not a ledger — the loss window on
//! crash is bounded by the single uncommitted write). The four hot queries
//! (drain scan, per-service stats, expiry sweep, overflow sweep) are each
//! covered by an index.
//!
//! Total buffered size is kept in an in-memory counter seeded by one scan at
//! open and adjusted on every insert/delete, so the frequently polled status
//! surface never runs a full-table aggregate.

use crate::codec::CompressionMode;
use crate::error::BufferError;
use crate::record::{DataType, TelemetryRecord};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS telemetry_buffer (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    service     TEXT NOT NULL,
    timestamp   INTEGER NOT NULL,
    data_type   TEXT NOT NULL,
    payload     BLOB NOT NULL,
    data_size   INTEGER NOT NULL,
    source_ip   TEXT,
    compression TEXT NOT NULL DEFAULT 'none',
    forwarded   INTEGER NOT NULL DEFAULT 0,
    retry_count INTEGER NOT NULL DEFAULT 0,
    created_at  INTEGER NOT NULL,
    expires_at  INTEGER NOT NULL,
    CHECK (expires_at > created_at)
);
CREATE INDEX IF NOT EXISTS idx_buffer_timestamp ON telemetry_buffer (timestamp);
CREATE INDEX IF NOT EXISTS idx_buffer_service   ON telemetry_buffer (service);
CREATE INDEX IF NOT EXISTS idx_buffer_forwarded ON telemetry_buffer (forwarded);
CREATE INDEX IF NOT EXISTS idx_buffer_expires   ON telemetry_buffer (expires_at);

CREATE TABLE IF NOT EXISTS buffer_stats (
    service    TEXT PRIMARY KEY,
    received   INTEGER NOT NULL DEFAULT 0,
    bytes      INTEGER NOT NULL DEFAULT 0,
    forwarded  INTEGER NOT NULL DEFAULT 0,
    dropped    INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL
);
";

/// Point-in-time aggregation over the live buffer table for one service.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ServiceStats {
    pub total_records: u64,
    pub total_size: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub forwarded_count: u64,
    pub pending_count: u64,
}

/// Cumulative per-service counters from the stats table. Unlike
/// [`ServiceStats`] these survive reaping.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StatsCounters {
    pub received: u64,
    pub bytes: u64,
    pub forwarded: u64,
    pub dropped: u64,
}

#[derive(Clone)]
pub struct BufferStore {
    conn: Arc<Mutex<Connection>>,
    total_bytes: Arc<AtomicU64>,
}

impl BufferStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BufferError> {
        Self::init(Connection::open(path)?)
    }

    /// Ephemeral store for tests.
    pub fn open_in_memory() -> Result<Self, BufferError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, BufferError> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        conn.execute_batch(SCHEMA)?;

        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(data_size), 0) FROM telemetry_buffer",
            [],
            |row| row.get(0),
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            total_bytes: Arc::new(AtomicU64::new(total.max(0) as u64)),
        })
    }

    #[allow(clippy::expect_used)]
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store lock poisoned")
    }

    /// Insert one record; returns the store-assigned id. Commits
    /// individually so a crash loses at most the in-flight record.
    pub fn insert(&self, record: &TelemetryRecord) -> Result<i64, BufferError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO telemetry_buffer
               (service, timestamp, data_type, payload, data_size, source_ip,
                compression, forwarded, retry_count, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.service,
                record.timestamp.timestamp_millis(),
                record.data_type.as_str(),
                record.payload,
                record.data_size as i64,
                record.source_ip,
                record.compression.as_str(),
                record.forwarded,
                record.retry_count,
                record.created_at.timestamp_millis(),
                record.expires_at.timestamp_millis(),
            ],
        )?;
        let id = conn.last_insert_rowid();

        conn.execute(
            "INSERT INTO buffer_stats (service, received, bytes, updated_at)
             VALUES (?1, 1, ?2, ?3)
             ON CONFLICT (service) DO UPDATE SET
               received = received + 1,
               bytes = bytes + excluded.bytes,
               updated_at = excluded.updated_at",
            params![
                record.service,
                record.data_size as i64,
                Utc::now().timestamp_millis()
            ],
        )?;
        drop(conn);

        self.total_bytes
            .fetch_add(record.data_size as u64, Ordering::Relaxed);
        Ok(id)
    }

    /// Flip the forwarded flag. Idempotent; counts only the first flip.
    pub fn mark_forwarded(&self, id: i64) -> Result<(), BufferError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE telemetry_buffer SET forwarded = 1 WHERE id = ?1 AND forwarded = 0",
            params![id],
        )?;
        if changed > 0 {
            conn.execute(
                "UPDATE buffer_stats SET forwarded = forwarded + 1, updated_at = ?2
                 WHERE service = (SELECT service FROM telemetry_buffer WHERE id = ?1)",
                params![id, Utc::now().timestamp_millis()],
            )?;
        }
        Ok(())
    }

    /// Informational retry accounting for records whose forward attempt
    /// failed without halting the batch (corrupt payloads).
    pub fn bump_retry(&self, id: i64) -> Result<(), BufferError> {
        self.lock().execute(
            "UPDATE telemetry_buffer SET retry_count = retry_count + 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Pending records in ascending event-time order, the drain scan.
    pub fn query_unforwarded(&self, limit: usize) -> Result<Vec<TelemetryRecord>, BufferError> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, service, timestamp, data_type, payload, data_size, source_ip,
                    compression, forwarded, retry_count, created_at, expires_at
             FROM telemetry_buffer
             WHERE forwarded = 0
             ORDER BY timestamp ASC, id ASC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_record)?;
        let mut records = Vec::new();
        for row in rows {
            match row {
                Ok(record) => records.push(record),
                // Tampered or corrupted row metadata is scoped to its row;
                // the expiry sweep removes it eventually.
                Err(e) => warn!("skipping unreadable buffered row: {e}"),
            }
        }
        Ok(records)
    }

    /// Live-table aggregation for one service.
    pub fn stats(&self, service: &str) -> Result<ServiceStats, BufferError> {
        let conn = self.lock();
        let stats = conn
            .query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(data_size), 0),
                        MIN(timestamp),
                        MAX(timestamp),
                        COALESCE(SUM(forwarded), 0),
                        COALESCE(SUM(1 - forwarded), 0)
                 FROM telemetry_buffer WHERE service = ?1",
                params![service],
                |row| {
                    Ok(ServiceStats {
                        total_records: row.get::<_, i64>(0)? as u64,
                        total_size: row.get::<_, i64>(1)? as u64,
                        oldest: row.get::<_, Option<i64>>(2)?.and_then(millis_to_datetime),
                        newest: row.get::<_, Option<i64>>(3)?.and_then(millis_to_datetime),
                        forwarded_count: row.get::<_, i64>(4)? as u64,
                        pending_count: row.get::<_, i64>(5)? as u64,
                    })
                },
            )
            .optional()?
            .unwrap_or_default();
        Ok(stats)
    }

    /// Cumulative counters for one service, if any were ever recorded.
    pub fn counters(&self, service: &str) -> Result<Option<StatsCounters>, BufferError> {
        let conn = self.lock();
        let counters = conn
            .query_row(
                "SELECT received, bytes, forwarded, dropped
                 FROM buffer_stats WHERE service = ?1",
                params![service],
                |row| {
                    Ok(StatsCounters {
                        received: row.get::<_, i64>(0)? as u64,
                        bytes: row.get::<_, i64>(1)? as u64,
                        forwarded: row.get::<_, i64>(2)? as u64,
                        dropped: row.get::<_, i64>(3)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(counters)
    }

    /// Every service that ever wrote into the store (union of live rows and
    /// cumulative counters).
    pub fn service_names(&self) -> Result<Vec<String>, BufferError> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT service FROM buffer_stats
             UNION
             SELECT DISTINCT service FROM telemetry_buffer
             ORDER BY 1",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }

    /// Expiry sweep: removes rows past `expires_at` regardless of forwarded
    /// state. Returns the number of rows removed.
    pub fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, BufferError> {
        self.delete_where(
            "expires_at < ?1",
            params![now.timestamp_millis()],
            "expired",
        )
    }

    /// Overflow eviction: removes up to `n` rows, already-forwarded rows
    /// first, then pending backlog oldest-first.
    pub fn delete_oldest(&self, n: usize) -> Result<usize, BufferError> {
        self.delete_where(
            "id IN (SELECT id FROM telemetry_buffer
                    ORDER BY forwarded DESC, timestamp ASC, id ASC
                    LIMIT ?1)",
            params![n as i64],
            "overflow",
        )
    }

    fn delete_where(
        &self,
        predicate: &str,
        args: &[&dyn rusqlite::ToSql],
        cause: &str,
    ) -> Result<usize, BufferError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        // Per-service accounting of what is about to go, for the stats table
        // and the operator-visible loss log.
        let mut removed_rows = 0usize;
        let mut removed_bytes = 0u64;
        {
            let mut stmt = tx.prepare(&format!(
                "SELECT service, COUNT(*), COALESCE(SUM(data_size), 0)
                 FROM telemetry_buffer WHERE {predicate} GROUP BY service"
            ))?;
            let groups = stmt.query_map(args, |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;
            let now = Utc::now().timestamp_millis();
            for group in groups {
                let (service, count, bytes) = group?;
                tx.execute(
                    "INSERT INTO buffer_stats (service, dropped, updated_at)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT (service) DO UPDATE SET
                       dropped = dropped + excluded.dropped,
                       updated_at = excluded.updated_at",
                    params![service, count, now],
                )?;
                warn!(
                    service,
                    count,
                    bytes,
                    cause,
                    "removing buffered records"
                );
                removed_rows += count.max(0) as usize;
                removed_bytes += bytes.max(0) as u64;
            }
        }

        if removed_rows > 0 {
            tx.execute(
                &format!("DELETE FROM telemetry_buffer WHERE {predicate}"),
                args,
            )?;
        }
        tx.commit()?;
        drop(conn);

        if removed_bytes > 0 {
            self.total_bytes.fetch_sub(
                removed_bytes.min(self.total_bytes.load(Ordering::Relaxed)),
                Ordering::Relaxed,
            );
        }
        Ok(removed_rows)
    }

    /// Cached total of `data_size` across all rows, forwarded included.
    #[must_use]
    pub fn total_size_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }
}

fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<TelemetryRecord> {
    // Unknown discriminators are an error, not a default: a record with a
    // made-up data_type must never reach a sender, and a wrong compression
    // mode would forward garbage bytes.
    let data_type: String = row.get(3)?;
    let data_type = DataType::parse(&data_type).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let compression: String = row.get(7)?;
    let compression = CompressionMode::parse(&compression).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(TelemetryRecord {
        id: row.get(0)?,
        service: row.get(1)?,
        timestamp: millis_to_datetime(row.get(2)?).unwrap_or_default(),
        data_type,
        payload: row.get(4)?,
        data_size: row.get::<_, i64>(5)?.max(0) as usize,
        source_ip: row.get(6)?,
        compression,
        forwarded: row.get(8)?,
        retry_count: row.get(9)?,
        created_at: millis_to_datetime(row.get(10)?).unwrap_or_default(),
        expires_at: millis_to_datetime(row.get(11)?).unwrap_or_default(),
    })
}
