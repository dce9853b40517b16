// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Buffering policy: the single JSON document that owns every knob.
//!
//! The on-disk file is the source of truth. The in-memory copy is an `Arc`
//! snapshot swapped wholesale on update, so readers never observe a
//! half-updated config. A missing or malformed file falls back to the
//! documented defaults, which are persisted immediately.

use crate::codec::CompressionMode;
use crate::error::BufferError;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

pub const DEFAULT_MAX_RETENTION_DAYS: u32 = 14;
pub const DEFAULT_MAX_BUFFER_SIZE_MB: u64 = 1000;
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_CLEANUP_INTERVAL_MINS: u64 = 60;
pub const DEFAULT_DRAIN_BATCH_SIZE: usize = 1000;
pub const DEFAULT_FAST_PATH_QUEUE: usize = 512;

/// What to do when the buffered size crosses the global soft cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowAction {
    /// Evict the oldest rows until the incoming record fits. Lossy by design.
    #[default]
    DropOldest,
    /// Reject the incoming record instead of discarding stored data.
    DropNewest,
    /// Placeholder for denser re-encoding of old rows. Currently a no-op
    /// that leaves the overflow visible in the logs.
    CompressMore,
}

/// Where a service's records are buffered. Only the persistent store is
/// implemented; `file` is accepted in config for forward compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BufferMode {
    #[default]
    Store,
    File,
}

/// Per-source policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceCfg {
    pub enabled: bool,
    pub buffer_mode: BufferMode,
    pub max_records: u64,
    pub max_file_size_mb: u64,
    pub compression_mode: CompressionMode,
    /// Advisory, 1 (lowest) to 10 (highest).
    pub priority: u8,
    /// Overrides the global `max_retention_days` when set.
    pub retention_hours: Option<u32>,
}

impl Default for ServiceCfg {
    fn default() -> Self {
        Self {
            enabled: true,
            buffer_mode: BufferMode::Store,
            max_records: 1_000_000,
            max_file_size_mb: 100,
            compression_mode: CompressionMode::Zstd,
            priority: 5,
            retention_hours: None,
        }
    }
}

/// Remote endpoint coordinates for the protocol senders and the health probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Host receiving the UDP protocols.
    pub host: String,
    /// HTTP events intake (windows_events).
    pub events_url: String,
    /// HTTP time-series write endpoint (metrics).
    pub metrics_url: String,
    /// Health surface probed by the connectivity monitor.
    pub health_url: String,
    /// Bearer token for the metrics write endpoint.
    pub auth_token: Option<String>,
    pub syslog_port: u16,
    pub snmp_port: u16,
    pub netflow_port: u16,
    pub sflow_port: u16,
    pub ipfix_port: u16,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            events_url: "http://127.0.0.1:8428/api/v1/events".to_string(),
            metrics_url: "http://127.0.0.1:8428/api/v1/write".to_string(),
            health_url: "http://127.0.0.1:8428/health".to_string(),
            auth_token: None,
            syslog_port: 1514,
            snmp_port: 162,
            netflow_port: 2055,
            sflow_port: 6343,
            ipfix_port: 4739,
        }
    }
}

/// Global buffering policy plus the per-service map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub enabled: bool,
    /// Fallback retention when a service has no explicit `retention_hours`.
    pub max_retention_days: u32,
    /// Global soft cap, enforced before acknowledging the triggering write.
    pub max_buffer_size_mb: u64,
    pub overflow_action: OverflowAction,
    pub fast_path_enabled: bool,
    pub fast_path_queue: usize,
    /// Connectivity probe interval.
    pub check_interval_secs: u64,
    /// Expiry sweep interval.
    pub cleanup_interval_mins: u64,
    /// Rows fetched per drain pass.
    pub drain_batch_size: usize,
    pub target: TargetConfig,
    pub services: HashMap<String, ServiceCfg>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        let mut services = HashMap::new();
        services.insert(
            "fluent-bit".to_string(),
            ServiceCfg {
                priority: 5,
                retention_hours: Some(72),
                ..Default::default()
            },
        );
        services.insert(
            "netflow".to_string(),
            ServiceCfg {
                priority: 3,
                retention_hours: Some(48),
                ..Default::default()
            },
        );
        services.insert(
            "snmp-traps".to_string(),
            ServiceCfg {
                priority: 7,
                retention_hours: Some(168),
                compression_mode: CompressionMode::None,
                ..Default::default()
            },
        );
        services.insert(
            "telegraf".to_string(),
            ServiceCfg {
                priority: 4,
                retention_hours: Some(24),
                ..Default::default()
            },
        );

        Self {
            enabled: true,
            max_retention_days: DEFAULT_MAX_RETENTION_DAYS,
            max_buffer_size_mb: DEFAULT_MAX_BUFFER_SIZE_MB,
            overflow_action: OverflowAction::DropOldest,
            fast_path_enabled: true,
            fast_path_queue: DEFAULT_FAST_PATH_QUEUE,
            check_interval_secs: DEFAULT_CHECK_INTERVAL_SECS,
            cleanup_interval_mins: DEFAULT_CLEANUP_INTERVAL_MINS,
            drain_batch_size: DEFAULT_DRAIN_BATCH_SIZE,
            target: TargetConfig::default(),
            services,
        }
    }
}

impl BufferConfig {
    pub fn validate(&self) -> Result<(), BufferError> {
        if self.max_buffer_size_mb == 0 {
            return Err(BufferError::Config(
                "max_buffer_size_mb must be greater than 0".to_string(),
            ));
        }
        if self.max_retention_days == 0 {
            return Err(BufferError::Config(
                "max_retention_days must be greater than 0".to_string(),
            ));
        }
        if self.drain_batch_size == 0 {
            return Err(BufferError::Config(
                "drain_batch_size must be greater than 0".to_string(),
            ));
        }
        for (name, svc) in &self.services {
            if !(1..=10).contains(&svc.priority) {
                return Err(BufferError::Config(format!(
                    "service '{name}': priority must be between 1 and 10"
                )));
            }
            if svc.retention_hours == Some(0) {
                return Err(BufferError::Config(format!(
                    "service '{name}': retention_hours must be greater than 0"
                )));
            }
        }
        Ok(())
    }

    /// Effective retention for a service: its own `retention_hours` when set,
    /// otherwise the global `max_retention_days`.
    #[must_use]
    pub fn retention_for(&self, service: &str) -> Duration {
        match self.services.get(service).and_then(|s| s.retention_hours) {
            Some(hours) => Duration::hours(i64::from(hours)),
            None => Duration::days(i64::from(self.max_retention_days)),
        }
    }

    /// Soft cap in bytes.
    #[must_use]
    pub fn cap_bytes(&self) -> u64 {
        self.max_buffer_size_mb * 1024 * 1024
    }
}

/// Owns the policy document: loads it, persists it, serves snapshots.
///
/// Readers get an `Arc<BufferConfig>` and must not cache it across calls;
/// updates swap the whole snapshot.
pub struct PolicyEngine {
    path: PathBuf,
    current: RwLock<Arc<BufferConfig>>,
}

impl PolicyEngine {
    /// Load the policy document, creating and persisting the documented
    /// defaults when the file is missing or unreadable. Startup never fails
    /// on a malformed document.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, BufferError> {
        let path = path.into();
        let config = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<BufferConfig>(&bytes) {
                Ok(config) => match config.validate() {
                    Ok(()) => config,
                    Err(e) => {
                        warn!("policy document failed validation ({e}), reverting to defaults");
                        let defaults = BufferConfig::default();
                        Self::persist(&path, &defaults)?;
                        defaults
                    }
                },
                Err(e) => {
                    warn!("malformed policy document ({e}), reverting to defaults");
                    let defaults = BufferConfig::default();
                    Self::persist(&path, &defaults)?;
                    defaults
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no policy document at {}, writing defaults", path.display());
                let defaults = BufferConfig::default();
                Self::persist(&path, &defaults)?;
                defaults
            }
            Err(e) => return Err(BufferError::Io(e)),
        };

        Ok(Self {
            path,
            current: RwLock::new(Arc::new(config)),
        })
    }

    /// Current snapshot; cheap to clone, safe for concurrent readers.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn snapshot(&self) -> Arc<BufferConfig> {
        Arc::clone(&self.current.read().expect("policy lock poisoned"))
    }

    /// Validate, persist atomically, then swap the in-memory snapshot.
    /// Takes effect for subsequent writes and drains only.
    pub fn update(&self, config: BufferConfig) -> Result<(), BufferError> {
        config.validate()?;
        Self::persist(&self.path, &config)?;
        #[allow(clippy::expect_used)]
        let mut current = self.current.write().expect("policy lock poisoned");
        *current = Arc::new(config);
        Ok(())
    }

    /// Atomic replace: write a sibling temp file, then rename over the
    /// target. A crash mid-save leaves the previous document intact.
    fn persist(path: &Path, config: &BufferConfig) -> Result<(), BufferError> {
        let bytes = serde_json::to_vec_pretty(config)
            .map_err(|e| BufferError::Config(format!("serialize policy: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
