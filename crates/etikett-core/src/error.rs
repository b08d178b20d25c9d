// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for Etikett.

use thiserror::Error;

/// Top-level error type for all Etikett operations.
#[derive(Debug, Error)]
pub enum EtikettError {
    // -- Discovery errors --
    #[error("device discovery failed: {0}")]
    Discovery(String),

    // -- Resolution / selection errors --
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("no default device configured")]
    NoDefaultDevice,

    // -- Transfer errors --
    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("transfer payload is empty")]
    EmptyPayload,

    // -- Ingest server --
    #[error("ingest server error: {0}")]
    Server(String),

    // -- Storage / persistence --
    #[error("selection store error: {0}")]
    Store(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, EtikettError>;
