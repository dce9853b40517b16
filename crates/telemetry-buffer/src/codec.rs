// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Payload compression, applied once at ingestion time.
//!
//! Size accounting downstream (`data_size`, overflow math) always reflects
//! the compressed size. Decompression failures are scoped to the single
//! record being forwarded.

use crate::error::BufferError;
use serde::{Deserialize, Serialize};

/// zstd level used for buffered payloads, matching the intake default.
pub const COMPRESSION_LEVEL: i32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompressionMode {
    None,
    #[default]
    Zstd,
}

impl CompressionMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionMode::None => "none",
            CompressionMode::Zstd => "zstd",
        }
    }

    pub fn parse(value: &str) -> Result<Self, BufferError> {
        match value {
            "none" => Ok(CompressionMode::None),
            "zstd" => Ok(CompressionMode::Zstd),
            other => Err(BufferError::Codec(format!(
                "unknown compression mode '{other}'"
            ))),
        }
    }
}

/// Compress `data` with the given mode. `None` is the identity.
pub fn compress(data: &[u8], mode: CompressionMode) -> Result<Vec<u8>, BufferError> {
    match mode {
        CompressionMode::None => Ok(data.to_vec()),
        CompressionMode::Zstd => zstd::stream::encode_all(data, COMPRESSION_LEVEL)
            .map_err(|e| BufferError::Codec(format!("zstd encode: {e}"))),
    }
}

/// Inverse of [`compress`]. Fails on corrupt frames.
pub fn decompress(data: &[u8], mode: CompressionMode) -> Result<Vec<u8>, BufferError> {
    match mode {
        CompressionMode::None => Ok(data.to_vec()),
        CompressionMode::Zstd => zstd::stream::decode_all(data)
            .map_err(|e| BufferError::Codec(format!("zstd decode: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_all_modes() {
        let payloads: [&[u8]; 3] = [
            b"",
            b"<134>Jan 1 00:00:00 fw01 kernel: link up",
            &[0u8; 4096],
        ];
        for mode in [CompressionMode::None, CompressionMode::Zstd] {
            for payload in payloads {
                let packed = compress(payload, mode).unwrap();
                let unpacked = decompress(&packed, mode).unwrap();
                assert_eq!(unpacked, payload, "mode {mode:?}");
            }
        }
    }

    #[test]
    fn test_none_is_identity() {
        let data = b"verbatim".to_vec();
        assert_eq!(compress(&data, CompressionMode::None).unwrap(), data);
    }

    #[test]
    fn test_zstd_shrinks_repetitive_payloads() {
        let data = vec![b'a'; 8192];
        let packed = compress(&data, CompressionMode::Zstd).unwrap();
        assert!(packed.len() < data.len());
    }

    #[test]
    fn test_corrupt_frame_is_an_error() {
        let err = decompress(b"not a zstd frame", CompressionMode::Zstd).unwrap_err();
        assert!(matches!(err, BufferError::Codec(_)));
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(
            CompressionMode::parse("zstd").unwrap(),
            CompressionMode::Zstd
        );
        assert_eq!(
            CompressionMode::parse("none").unwrap(),
            CompressionMode::None
        );
        assert!(CompressionMode::parse("lz4").is_err());
    }
}
