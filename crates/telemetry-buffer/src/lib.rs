// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Telemetry Buffer
//!
//! Store-and-forward engine for telemetry crossing an unreliable tunnel.
//! Records submitted by local collectors are delivered immediately while the
//! remote endpoint is reachable and durably buffered under per-source quotas
//! when it is not; the backlog drains automatically on reconnection.
//!
//! ## Architecture
//!
//! - [`ingest`]: the boundary collectors call once per event
//! - [`store`]: embedded SQLite buffer with per-service stats
//! - [`codec`]: payload compression, applied once at ingestion
//! - [`policy`]: the JSON policy document (global + per-service knobs)
//! - [`monitor`]: health probing and the reconnection drain trigger
//! - [`forwarder`]: protocol senders and the ordered drain loop
//! - [`reaper`]: retention expiry and overflow enforcement

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod codec;
pub mod error;
pub mod forwarder;
pub mod ingest;
pub mod monitor;
pub mod policy;
pub mod reaper;
pub mod record;
pub mod store;

pub use error::BufferError;
pub use record::{DataType, TelemetryRecord};
