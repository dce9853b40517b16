// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::codec::CompressionMode;
use crate::error::BufferError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Telemetry kinds the forwarding dispatcher knows how to deliver.
///
/// This is a closed set: every value maps to exactly one sender built at
/// startup. Strings that match no variant are rejected at the ingestion
/// boundary instead of landing in the store with no way out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Syslog,
    Netflow,
    Snmp,
    WindowsEvents,
    Metrics,
}

impl DataType {
    pub const ALL: [DataType; 5] = [
        DataType::Syslog,
        DataType::Netflow,
        DataType::Snmp,
        DataType::WindowsEvents,
        DataType::Metrics,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Syslog => "syslog",
            DataType::Netflow => "netflow",
            DataType::Snmp => "snmp",
            DataType::WindowsEvents => "windows_events",
            DataType::Metrics => "metrics",
        }
    }

    /// Parse a wire string. sFlow and IPFIX records travel as `netflow`;
    /// the per-record `flow_type` field picks the destination port later.
    pub fn parse(value: &str) -> Result<Self, BufferError> {
        match value {
            "syslog" => Ok(DataType::Syslog),
            "netflow" | "sflow" | "ipfix" => Ok(DataType::Netflow),
            "snmp" => Ok(DataType::Snmp),
            "windows_events" => Ok(DataType::WindowsEvents),
            "metrics" => Ok(DataType::Metrics),
            other => Err(BufferError::UnsupportedDataType(other.to_string())),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One buffered unit: an opaque serialized event plus the metadata the
/// dispatcher and the reaper need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Store-assigned row id; 0 until inserted.
    pub id: i64,
    /// Which collector produced the record.
    pub service: String,
    /// Producer-supplied event time; drives drain order.
    pub timestamp: DateTime<Utc>,
    pub data_type: DataType,
    /// Serialized event, compressed per `compression`.
    pub payload: Vec<u8>,
    /// Size of `payload` as stored (compressed), used for overflow math.
    pub data_size: usize,
    pub source_ip: Option<String>,
    pub compression: CompressionMode,
    pub forwarded: bool,
    pub retry_count: u32,
    /// Store-assigned ingestion time.
    pub created_at: DateTime<Utc>,
    /// `created_at` plus the service retention (or the global fallback).
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_types() {
        assert_eq!(DataType::parse("syslog").unwrap(), DataType::Syslog);
        assert_eq!(DataType::parse("netflow").unwrap(), DataType::Netflow);
        assert_eq!(DataType::parse("sflow").unwrap(), DataType::Netflow);
        assert_eq!(DataType::parse("ipfix").unwrap(), DataType::Netflow);
        assert_eq!(DataType::parse("snmp").unwrap(), DataType::Snmp);
        assert_eq!(
            DataType::parse("windows_events").unwrap(),
            DataType::WindowsEvents
        );
        assert_eq!(DataType::parse("metrics").unwrap(), DataType::Metrics);
    }

    #[test]
    fn test_parse_unknown_type_is_explicit_error() {
        let err = DataType::parse("jaeger").unwrap_err();
        assert!(matches!(err, BufferError::UnsupportedDataType(t) if t == "jaeger"));
    }

    #[test]
    fn test_display_round_trips() {
        for dt in DataType::ALL {
            assert_eq!(DataType::parse(dt.as_str()).unwrap(), dt);
        }
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&DataType::WindowsEvents).unwrap();
        assert_eq!(json, "\"windows_events\"");
    }
}
