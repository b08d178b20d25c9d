// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the Etikett label-print router.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Transport class of a label printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    /// Directly attached over USB (bulk transfer).
    Usb,
    /// Reachable over the local network (raw print port).
    Wifi,
}

impl ConnectionType {
    /// Key string used in the selection store and request headers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Usb => "usb",
            Self::Wifi => "wifi",
        }
    }

    /// Parse a header value. Anything other than `usb` selects the
    /// network transport, matching the default-to-wifi contract.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "usb" => Self::Usb,
            _ => Self::Wifi,
        }
    }
}

impl Default for ConnectionType {
    fn default() -> Self {
        Self::Wifi
    }
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A label printer currently attached over USB.
///
/// Ephemeral: instances describe one enumeration snapshot. Bus number and
/// address are transport locators that may change across replug; the serial
/// number is the stable identity used for persisted default matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbPrinter {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_number: u8,
    pub address: u8,
    /// Serial number from the device descriptor, when the device reports one.
    pub serial: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl UsbPrinter {
    /// Stable identity for persisted default matching.
    ///
    /// Devices without a serial number fall back to a locator-derived key
    /// that is stable within a session but not across replug.
    pub fn stable_id(&self) -> String {
        match &self.serial {
            Some(serial) if !serial.is_empty() => serial.clone(),
            _ => format!(
                "vid{:04x}:pid{:04x}:bus{}:addr{}",
                self.vendor_id, self.product_id, self.bus_number, self.address
            ),
        }
    }

    /// Human-readable name for logs and reports.
    pub fn label(&self) -> String {
        match &self.product {
            Some(product) if !product.is_empty() => product.clone(),
            _ => format!("{:04x}:{:04x}", self.vendor_id, self.product_id),
        }
    }
}

/// A label printer discovered on the local network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPrinter {
    /// Advertised service or host name.
    pub name: String,
    pub ip: IpAddr,
    /// Raw print port, normally 9100.
    pub port: u16,
    /// Hardware address in canonical lowercase `aa:bb:cc:dd:ee:ff` form.
    /// Stable identity for persisted default matching (IP may change via
    /// DHCP). Absent when the neighbor table has no entry for the IP.
    pub mac: Option<String>,
    /// Whether this printer was added manually (IP entry) rather than found
    /// by a scan. Manual entries survive cache refreshes.
    #[serde(default)]
    pub manually_added: bool,
}

impl NetworkPrinter {
    /// Stable identity for persisted default matching. Falls back to the IP
    /// string when no hardware address could be resolved.
    pub fn stable_id(&self) -> String {
        match &self.mac {
            Some(mac) if !mac.is_empty() => mac.clone(),
            _ => self.ip.to_string(),
        }
    }
}

/// Either kind of label printer, as carried by registry events and reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum LabelDevice {
    Usb(UsbPrinter),
    Network(NetworkPrinter),
}

impl LabelDevice {
    pub fn connection_type(&self) -> ConnectionType {
        match self {
            Self::Usb(_) => ConnectionType::Usb,
            Self::Network(_) => ConnectionType::Wifi,
        }
    }

    pub fn stable_id(&self) -> String {
        match self {
            Self::Usb(printer) => printer.stable_id(),
            Self::Network(printer) => printer.stable_id(),
        }
    }

    /// Human-readable name for logs.
    pub fn label(&self) -> String {
        match self {
            Self::Usb(printer) => printer.label(),
            Self::Network(printer) => printer.name.clone(),
        }
    }
}

/// An explicit transfer or selection target supplied by a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceTarget {
    /// Position in the current device list for the connection type.
    Index(usize),
    /// Stable identifier (USB serial / network MAC).
    Id(String),
}

impl std::fmt::Display for DeviceTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Index(index) => write!(f, "index {index}"),
            Self::Id(id) => write!(f, "id {id}"),
        }
    }
}

/// Device inventory delivered to observers and served by the status route.
///
/// The USB default is reported by list position and the network default by
/// hardware address; consumers of the report rely on this asymmetric shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceReport {
    pub usb: UsbReport,
    pub wifi: WifiReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbReport {
    /// List position of the current default, when visible.
    pub selected: Option<usize>,
    pub devices: Vec<UsbPrinter>,
    /// Set when enumeration failed; the device list is empty in that case.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WifiReport {
    /// Hardware address of the current default, when one is set.
    pub selected: Option<String>,
    pub devices: Vec<NetworkPrinter>,
    /// Set when the last scan failed; the cached list is served unchanged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Status of the embedded ingest server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Error,
}
