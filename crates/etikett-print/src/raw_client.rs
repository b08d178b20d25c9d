// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Raw TCP print client (JetDirect, port 9100).
//
// The simplest possible print protocol: open a TCP socket and dump bytes.
// Label printers interpret the payload natively (ZPL and friends), so there
// is no negotiation, no job tracking, no feedback. The whole send operates
// under one caller-supplied deadline.

use std::net::IpAddr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info};

use etikett_core::error::{EtikettError, Result};

/// Chunk size for progress tracking.
const CHUNK_SIZE: usize = 8192;

/// Send payload bytes directly to a printer via raw TCP.
///
/// `timeout` bounds the entire operation: connect, write, flush, shutdown.
/// Expiry surfaces as a `Transfer` error naming the printer address.
pub async fn send_raw(ip: IpAddr, port: u16, payload: &[u8], timeout: Duration) -> Result<()> {
    let addr = format!("{ip}:{port}");
    info!(addr = %addr, total = payload.len(), "connecting via raw TCP");

    tokio::time::timeout(timeout, transfer(&addr, payload))
        .await
        .map_err(|_| {
            EtikettError::Transfer(format!(
                "raw TCP transfer to {addr} timed out after {}s",
                timeout.as_secs()
            ))
        })?
}

async fn transfer(addr: &str, payload: &[u8]) -> Result<()> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| EtikettError::Transfer(format!("raw TCP connect to {addr}: {e}")))?;

    let mut sent = 0usize;
    for chunk in payload.chunks(CHUNK_SIZE) {
        stream.write_all(chunk).await.map_err(|e| {
            EtikettError::Transfer(format!("raw TCP send to {addr} failed at byte {sent}: {e}"))
        })?;
        sent += chunk.len();
        debug!(sent, total = payload.len(), "raw TCP progress");
    }

    stream
        .flush()
        .await
        .map_err(|e| EtikettError::Transfer(format!("raw TCP flush to {addr}: {e}")))?;
    stream
        .shutdown()
        .await
        .map_err(|e| EtikettError::Transfer(format!("raw TCP shutdown to {addr}: {e}")))?;

    info!(total = payload.len(), "raw TCP payload sent");
    Ok(())
}
