// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// mDNS discovery of network label printers.
//
// We browse for `_pdl-datastream._tcp.local.` (raw socket printing, port
// 9100) using the `mdns-sd` crate. Resolved services are converted into
// `NetworkPrinter` values and keyed by their mDNS full-name so duplicate
// events deduplicate automatically. The printer's MAC address, which serves
// as its stable identity, is read from the kernel ARP table after the
// service resolves.
//
// Manually added printers live alongside scanned ones and survive scans;
// a scanned printer at the same address supersedes the manual entry.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tracing::{debug, info, warn};

use etikett_core::error::{EtikettError, Result};
use etikett_core::types::NetworkPrinter;

/// mDNS service type for raw-socket (port 9100) printing.
const PDL_SERVICE: &str = "_pdl-datastream._tcp.local.";

/// Raw print port assumed when a service omits one.
pub const RAW_PRINT_PORT: u16 = 9100;

/// Kernel ARP table consulted for MAC resolution.
const ARP_TABLE_PATH: &str = "/proc/net/arp";

/// Scan-time state guarded by one lock.
struct ScanState {
    /// The mDNS daemon handle, created on the first scan.
    daemon: Option<ServiceDaemon>,
    /// Whether a browse is registered on the daemon.
    browsing: bool,
    /// Whether at least one scan has completed successfully.
    has_scanned: bool,
}

/// Network label-printer catalog.
///
/// Browsing starts lazily on the first scan and then keeps running; each
/// scan waits out its browse window and snapshots whatever has resolved so
/// far. A failed scan leaves previously resolved printers intact.
pub struct NetworkCatalog {
    state: Mutex<ScanState>,
    /// Resolved printers keyed by mDNS full-name.
    resolved: Arc<Mutex<HashMap<String, NetworkPrinter>>>,
    /// Operator-entered printers, keyed implicitly by IP.
    manual: Mutex<Vec<NetworkPrinter>>,
}

impl NetworkCatalog {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ScanState {
                daemon: None,
                browsing: false,
                has_scanned: false,
            }),
            resolved: Arc::new(Mutex::new(HashMap::new())),
            manual: Mutex::new(Vec::new()),
        }
    }

    /// Current merged view: everything resolved so far plus manual entries
    /// not superseded by a scanned printer at the same address.
    ///
    /// Never touches the network.
    pub fn current(&self) -> Vec<NetworkPrinter> {
        let resolved: Vec<NetworkPrinter> = self
            .resolved
            .lock()
            .expect("resolved printer map lock poisoned")
            .values()
            .cloned()
            .collect();
        let manual = self
            .manual
            .lock()
            .expect("manual printer list lock poisoned")
            .clone();
        merge_snapshot(resolved, &manual)
    }

    /// Whether at least one scan has completed.
    pub fn has_scanned(&self) -> bool {
        self.state
            .lock()
            .expect("scan state lock poisoned")
            .has_scanned
    }

    /// List printers, serving the cached view unless `force_refresh` is set
    /// or no scan has completed yet.
    pub async fn list(&self, force_refresh: bool, timeout: Duration) -> Result<Vec<NetworkPrinter>> {
        if !force_refresh && self.has_scanned() {
            return Ok(self.current());
        }
        self.scan(timeout).await
    }

    /// Browse the network for `timeout`, then snapshot.
    ///
    /// The browse keeps running afterwards; later scans reuse it. On failure
    /// the resolved map is left as it was.
    pub async fn scan(&self, timeout: Duration) -> Result<Vec<NetworkPrinter>> {
        self.ensure_browsing()?;

        tokio::time::sleep(timeout).await;

        // ARP entries appear once mDNS traffic has flowed; retry resolution
        // for printers still missing their MAC.
        self.fill_missing_macs();

        self.state
            .lock()
            .expect("scan state lock poisoned")
            .has_scanned = true;

        let snapshot = self.current();
        debug!(count = snapshot.len(), "network scan snapshot");
        Ok(snapshot)
    }

    /// Record an operator-entered printer. Replaces any manual entry at the
    /// same address.
    pub fn add_manual(&self, name: &str, ip: IpAddr, port: u16) -> NetworkPrinter {
        let printer = NetworkPrinter {
            name: name.to_owned(),
            ip,
            port,
            mac: lookup_mac(&ip),
            manually_added: true,
        };

        let mut manual = self
            .manual
            .lock()
            .expect("manual printer list lock poisoned");
        manual.retain(|p| p.ip != ip);
        manual.push(printer.clone());
        info!(name = %printer.name, ip = %printer.ip, "manual printer added");
        printer
    }

    /// Remove an operator-entered printer by address, returning it.
    pub fn remove_manual(&self, ip: IpAddr) -> Option<NetworkPrinter> {
        let mut manual = self
            .manual
            .lock()
            .expect("manual printer list lock poisoned");
        let position = manual.iter().position(|p| p.ip == ip)?;
        Some(manual.remove(position))
    }

    /// Stop browsing and shut the daemon down. The catalog can scan again
    /// afterwards; a fresh daemon is created on demand.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().expect("scan state lock poisoned");
        if let Some(daemon) = state.daemon.take() {
            if state.browsing {
                if let Err(e) = daemon.stop_browse(PDL_SERVICE) {
                    debug!(error = %e, "stop browse on shutdown");
                }
            }
            match daemon.shutdown() {
                Ok(_status_rx) => info!("mDNS daemon shut down"),
                Err(e) => warn!(error = %e, "mDNS daemon shutdown"),
            }
        }
        state.browsing = false;
    }

    // -- internal helpers ---------------------------------------------------

    /// Create the daemon and register the browse on first use.
    fn ensure_browsing(&self) -> Result<()> {
        let mut state = self.state.lock().expect("scan state lock poisoned");
        if state.browsing {
            return Ok(());
        }

        if state.daemon.is_none() {
            let daemon = ServiceDaemon::new().map_err(|e| {
                EtikettError::Discovery(format!("failed to start mDNS daemon: {e}"))
            })?;
            state.daemon = Some(daemon);
        }

        let daemon = state
            .daemon
            .as_ref()
            .ok_or_else(|| EtikettError::Discovery("mDNS daemon absent".into()))?;
        let receiver = daemon
            .browse(PDL_SERVICE)
            .map_err(|e| EtikettError::Discovery(format!("browse {PDL_SERVICE}: {e}")))?;

        Self::spawn_listener(receiver, Arc::clone(&self.resolved));
        state.browsing = true;
        info!(service = PDL_SERVICE, "mDNS printer discovery started");
        Ok(())
    }

    /// Drain the browse receiver on a dedicated thread, keeping the resolved
    /// map live as services come and go.
    fn spawn_listener(
        receiver: mdns_sd::Receiver<ServiceEvent>,
        resolved: Arc<Mutex<HashMap<String, NetworkPrinter>>>,
    ) {
        if let Err(e) = std::thread::Builder::new()
            .name("mdns-pdl".into())
            .spawn(move || {
                while let Ok(event) = receiver.recv() {
                    match event {
                        ServiceEvent::SearchStarted(stype) => {
                            debug!(service_type = %stype, "mDNS search started");
                        }
                        ServiceEvent::ServiceFound(stype, fullname) => {
                            debug!(service_type = %stype, name = %fullname, "service found");
                        }
                        ServiceEvent::ServiceResolved(info) => {
                            let fullname = info.get_fullname().to_owned();
                            match service_info_to_printer(&info) {
                                Ok(printer) => {
                                    info!(
                                        name = %printer.name,
                                        ip = %printer.ip,
                                        port = printer.port,
                                        "printer resolved"
                                    );
                                    resolved
                                        .lock()
                                        .expect("resolved printer map lock poisoned")
                                        .insert(fullname, printer);
                                }
                                Err(e) => {
                                    warn!(
                                        fullname = %fullname,
                                        error = %e,
                                        "failed to convert resolved service to printer"
                                    );
                                }
                            }
                        }
                        ServiceEvent::ServiceRemoved(stype, fullname) => {
                            info!(service_type = %stype, name = %fullname, "printer removed");
                            resolved
                                .lock()
                                .expect("resolved printer map lock poisoned")
                                .remove(&fullname);
                        }
                        ServiceEvent::SearchStopped(stype) => {
                            debug!(service_type = %stype, "mDNS search stopped");
                            break;
                        }
                    }
                }
            })
        {
            warn!(error = %e, "failed to spawn mDNS listener thread");
        }
    }

    /// Retry ARP resolution for printers that resolved without a MAC.
    fn fill_missing_macs(&self) {
        let mut resolved = self
            .resolved
            .lock()
            .expect("resolved printer map lock poisoned");
        for printer in resolved.values_mut() {
            if printer.mac.is_none() {
                printer.mac = lookup_mac(&printer.ip);
            }
        }
        drop(resolved);

        let mut manual = self
            .manual
            .lock()
            .expect("manual printer list lock poisoned");
        for printer in manual.iter_mut() {
            if printer.mac.is_none() {
                printer.mac = lookup_mac(&printer.ip);
            }
        }
    }
}

impl Default for NetworkCatalog {
    fn default() -> Self {
        Self::new()
    }
}

/// Merge resolved printers with manual entries, deduplicating by address.
/// A scanned printer supersedes the manual entry at the same IP.
fn merge_snapshot(resolved: Vec<NetworkPrinter>, manual: &[NetworkPrinter]) -> Vec<NetworkPrinter> {
    let mut merged = resolved;
    for entry in manual {
        if !merged.iter().any(|p| p.ip == entry.ip) {
            merged.push(entry.clone());
        }
    }
    merged
}

/// Convert a resolved `ServiceInfo` into a `NetworkPrinter`.
fn service_info_to_printer(info: &ServiceInfo) -> Result<NetworkPrinter> {
    let fullname = info.get_fullname();
    let name = instance_name(fullname);

    // Prefer IPv4 for wider printer compatibility.
    let ip: IpAddr = info
        .get_addresses()
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| info.get_addresses().iter().next())
        .copied()
        .ok_or_else(|| EtikettError::Discovery(format!("no address for service {fullname}")))?;

    let port = match info.get_port() {
        0 => RAW_PRINT_PORT,
        port => port,
    };

    Ok(NetworkPrinter {
        name,
        ip,
        port,
        mac: lookup_mac(&ip),
        manually_added: false,
    })
}

/// Instance label from an mDNS full-name, with the service suffix stripped.
fn instance_name(fullname: &str) -> String {
    fullname
        .strip_suffix(&format!(".{PDL_SERVICE}"))
        .unwrap_or(fullname)
        .to_owned()
}

// ---------------------------------------------------------------------------
// MAC resolution
// ---------------------------------------------------------------------------

/// Look up the MAC address for an IP in the kernel ARP table.
fn lookup_mac(ip: &IpAddr) -> Option<String> {
    let text = std::fs::read_to_string(Path::new(ARP_TABLE_PATH)).ok()?;
    parse_arp_table(&text, ip)
}

/// Find the canonical MAC for `ip` in `/proc/net/arp` text.
///
/// Incomplete entries (flags 0x0 or an all-zero hardware address) are
/// skipped; the kernel keeps those around while a resolution is pending.
fn parse_arp_table(text: &str, ip: &IpAddr) -> Option<String> {
    let needle = ip.to_string();
    for line in text.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        if fields[0] != needle {
            continue;
        }
        if fields[2] == "0x0" {
            continue;
        }
        let mac = canonical_mac(fields[3])?;
        if mac == "00:00:00:00:00:00" {
            continue;
        }
        return Some(mac);
    }
    None
}

/// Normalise a MAC address to lowercase colon-separated form.
///
/// Returns `None` unless the input is six hex octets separated by `:` or `-`.
pub fn canonical_mac(raw: &str) -> Option<String> {
    let parts: Vec<&str> = raw.split([':', '-']).collect();
    if parts.len() != 6 {
        return None;
    }
    let mut octets = Vec::with_capacity(6);
    for part in parts {
        if part.len() != 2 || !part.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        octets.push(part.to_ascii_lowercase());
    }
    Some(octets.join(":"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const ARP_FIXTURE: &str = "\
IP address       HW type     Flags       HW address            Mask     Device
192.168.1.50     0x1         0x2         A4:6B:B6:12:34:56     *        eth0
192.168.1.77     0x1         0x0         00:00:00:00:00:00     *        eth0
192.168.1.90     0x1         0x2         00:00:00:00:00:00     *        eth0
10.0.0.8         0x1         0x2         00-07-4d-aa-bb-cc     *        wlan0
";

    fn printer(name: &str, ip: [u8; 4], manual: bool) -> NetworkPrinter {
        NetworkPrinter {
            name: name.into(),
            ip: IpAddr::V4(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3])),
            port: RAW_PRINT_PORT,
            mac: None,
            manually_added: manual,
        }
    }

    #[test]
    fn arp_table_yields_canonical_mac() {
        let ip: IpAddr = "192.168.1.50".parse().unwrap();
        assert_eq!(
            parse_arp_table(ARP_FIXTURE, &ip),
            Some("a4:6b:b6:12:34:56".into())
        );
    }

    #[test]
    fn arp_table_skips_incomplete_entries() {
        let pending: IpAddr = "192.168.1.77".parse().unwrap();
        assert_eq!(parse_arp_table(ARP_FIXTURE, &pending), None);

        let zeroed: IpAddr = "192.168.1.90".parse().unwrap();
        assert_eq!(parse_arp_table(ARP_FIXTURE, &zeroed), None);
    }

    #[test]
    fn arp_table_accepts_dash_separated_hardware_addresses() {
        let ip: IpAddr = "10.0.0.8".parse().unwrap();
        assert_eq!(
            parse_arp_table(ARP_FIXTURE, &ip),
            Some("00:07:4d:aa:bb:cc".into())
        );
    }

    #[test]
    fn canonical_mac_rejects_malformed_input() {
        assert_eq!(canonical_mac("a4:6b:b6:12:34"), None);
        assert_eq!(canonical_mac("a4:6b:b6:12:34:5"), None);
        assert_eq!(canonical_mac("zz:6b:b6:12:34:56"), None);
        assert_eq!(canonical_mac("not a mac"), None);
        assert_eq!(
            canonical_mac("A4:6B:B6:12:34:56"),
            Some("a4:6b:b6:12:34:56".into())
        );
    }

    #[test]
    fn scanned_printer_supersedes_manual_entry_at_same_address() {
        let scanned = vec![printer("Zebra ZD420", [192, 168, 1, 50], false)];
        let manual = vec![
            printer("back office", [192, 168, 1, 50], true),
            printer("warehouse", [192, 168, 1, 60], true),
        ];

        let merged = merge_snapshot(scanned, &manual);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].name, "Zebra ZD420");
        assert!(!merged[0].manually_added);
        assert_eq!(merged[1].name, "warehouse");
        assert!(merged[1].manually_added);
    }

    #[test]
    fn manual_entries_replace_by_address() {
        let catalog = NetworkCatalog::new();
        let ip: IpAddr = "192.0.2.10".parse().unwrap();
        catalog.add_manual("first", ip, RAW_PRINT_PORT);
        catalog.add_manual("second", ip, 9101);

        let current = catalog.current();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].name, "second");
        assert_eq!(current[0].port, 9101);

        assert!(catalog.remove_manual(ip).is_some());
        assert!(catalog.remove_manual(ip).is_none());
        assert!(catalog.current().is_empty());
    }

    #[test]
    fn instance_name_strips_service_suffix() {
        assert_eq!(
            instance_name("Zebra ZD420._pdl-datastream._tcp.local."),
            "Zebra ZD420"
        );
        assert_eq!(instance_name("bare-name"), "bare-name");
    }
}
