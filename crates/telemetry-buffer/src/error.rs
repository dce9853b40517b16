// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors produced by the buffer engine.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("buffering is disabled")]
    Disabled,

    #[error("buffering is disabled for service '{0}'")]
    ServiceDisabled(String),

    #[error("buffer overflow: {0}")]
    Overflow(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("forwarding failed: {0}")]
    Forward(String),

    #[error("remote endpoint is not reachable")]
    Disconnected,

    #[error("unsupported data type '{0}'")]
    UnsupportedDataType(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
