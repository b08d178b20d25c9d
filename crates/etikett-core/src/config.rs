// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Application configuration.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Persistent application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// TCP port the loopback ingest endpoint listens on.
    pub ingest_port: u16,
    /// Seconds a network scan browses before the result snapshot is taken.
    pub scan_timeout_secs: u64,
    /// Seconds allowed for a network transfer (connect plus write).
    pub transfer_timeout_secs: u64,
    /// Seconds allowed for a single USB bulk write.
    pub usb_timeout_secs: u64,
    /// Additional USB vendor ids admitted alongside the built-in allow-list.
    #[serde(default)]
    pub extra_usb_vendors: Vec<u16>,
    /// Printers registered by address rather than discovered.
    #[serde(default)]
    pub manual_printers: Vec<ManualPrinter>,
}

/// A network printer entered by hand, for networks where mDNS is filtered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualPrinter {
    pub name: String,
    pub ip: IpAddr,
    #[serde(default = "default_raw_port")]
    pub port: u16,
}

fn default_raw_port() -> u16 {
    9100
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ingest_port: 65533,
            scan_timeout_secs: 5,
            transfer_timeout_secs: 10,
            usb_timeout_secs: 5,
            extra_usb_vendors: Vec::new(),
            manual_printers: Vec::new(),
        }
    }
}
