// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Device registry: the one place that knows both catalogs, the selection
// store, and the event stream.
//
// Defaults are persisted by stable identity (USB serial, network MAC, with
// documented fallbacks). Rows written by earlier releases hold bare list
// indexes; those are accepted on load and rewritten with the stable id the
// first time the index resolves against a device list. A USB index resolves
// against any enumeration snapshot; a network index waits until a scan has
// produced an authoritative list.
//
// Event emission is fire-and-forget onto an unbounded channel: a slow or
// absent sink never blocks a registry operation, and emission order is
// delivery order.

use std::net::IpAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};

use etikett_core::error::{EtikettError, Result};
use etikett_core::types::{
    ConnectionType, DeviceReport, DeviceTarget, LabelDevice, NetworkPrinter, UsbPrinter,
    UsbReport, WifiReport,
};

use crate::events::{self, EventReceiver, EventSender, RegistryEvent};
use crate::lanscan::NetworkCatalog;
use crate::store::{SelectionStore, parse_legacy_index};
use crate::usb::{UsbCatalog, UsbHotplugEvent};

/// In-memory image of one persisted selection row.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StoredDefault {
    /// No row.
    Unset,
    /// Stable identity, the current row format.
    Id(String),
    /// Bare list index from an earlier release, pending migration.
    LegacyIndex(usize),
}

impl StoredDefault {
    fn from_row(row: Option<String>) -> Self {
        match row {
            None => Self::Unset,
            Some(value) => match parse_legacy_index(&value) {
                Some(index) => Self::LegacyIndex(index),
                None => Self::Id(value),
            },
        }
    }
}

/// Per-connection-type default state.
struct DefaultsState {
    usb: StoredDefault,
    wifi: StoredDefault,
}

struct RegistryInner {
    usb: UsbCatalog,
    network: NetworkCatalog,
    store: Arc<StdMutex<SelectionStore>>,
    defaults: Mutex<DefaultsState>,
    /// Last USB enumeration, kept so detach events can be matched back to
    /// the device they concern.
    last_usb: Mutex<Vec<UsbPrinter>>,
    event_tx: EventSender,
    scan_timeout: Duration,
}

/// Orchestrates catalogs, selection persistence, and the event stream.
///
/// Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<RegistryInner>,
}

impl DeviceRegistry {
    /// Build the registry, load persisted defaults, and resolve whatever can
    /// be resolved without touching the network.
    ///
    /// Returns the registry together with the receiving end of its event
    /// stream. An initial `Changed` is emitted once loading completes.
    pub async fn new(
        usb: UsbCatalog,
        network: NetworkCatalog,
        store: SelectionStore,
        scan_timeout: Duration,
    ) -> (Self, EventReceiver) {
        let (event_tx, event_rx) = events::channel();
        let store = Arc::new(StdMutex::new(store));

        let rows = {
            let store = Arc::clone(&store);
            spawn_blocking(move || {
                let store = store.lock().expect("selection store lock poisoned");
                let usb_row = store.get(ConnectionType::Usb)?;
                let wifi_row = store.get(ConnectionType::Wifi)?;
                Ok::<_, EtikettError>((usb_row, wifi_row))
            })
            .await
        };
        let (usb_row, wifi_row) = match rows {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                warn!(error = %e, "could not load persisted defaults, starting unselected");
                (None, None)
            }
            Err(e) => {
                warn!(error = %e, "default load task failed, starting unselected");
                (None, None)
            }
        };

        let registry = Self {
            inner: Arc::new(RegistryInner {
                usb,
                network,
                store,
                defaults: Mutex::new(DefaultsState {
                    usb: StoredDefault::from_row(usb_row),
                    wifi: StoredDefault::from_row(wifi_row),
                }),
                last_usb: Mutex::new(Vec::new()),
                event_tx,
                scan_timeout,
            }),
        };

        match registry.refresh_usb_snapshot().await {
            Ok(list) => registry.attempt_usb_migration(&list).await,
            Err(e) => debug!(error = %e, "usb snapshot unavailable at startup"),
        }
        let current = registry.inner.network.current();
        if !current.is_empty() {
            registry
                .attempt_wifi_migration(&current, registry.inner.network.has_scanned())
                .await;
        }

        registry.emit(RegistryEvent::Changed);
        (registry, event_rx)
    }

    // -- enumeration --------------------------------------------------------

    /// Snapshot of currently attached USB label printers.
    pub async fn usb_devices(&self) -> Result<Vec<UsbPrinter>> {
        let list = self.refresh_usb_snapshot().await?;
        self.attempt_usb_migration(&list).await;
        Ok(list)
    }

    /// Network printer list, served from cache unless `force_refresh` is set
    /// or no scan has completed yet.
    pub async fn network_devices(&self, force_refresh: bool) -> Result<Vec<NetworkPrinter>> {
        let scanning = force_refresh || !self.inner.network.has_scanned();
        let list = self
            .inner
            .network
            .list(force_refresh, self.inner.scan_timeout)
            .await?;
        if scanning {
            self.attempt_wifi_migration(&list, true).await;
            self.emit(RegistryEvent::Changed);
        }
        Ok(list)
    }

    /// Register a printer by address. Emits `Added` and `Changed`.
    pub fn add_network_printer(&self, name: &str, ip: IpAddr, port: u16) -> NetworkPrinter {
        let printer = self.inner.network.add_manual(name, ip, port);
        self.emit(RegistryEvent::Added(LabelDevice::Network(printer.clone())));
        self.emit(RegistryEvent::Changed);
        printer
    }

    /// Remove a manually registered printer. Emits `Removed` and `Changed`
    /// when an entry existed.
    pub fn remove_network_printer(&self, ip: IpAddr) -> Option<NetworkPrinter> {
        let removed = self.inner.network.remove_manual(ip)?;
        self.emit(RegistryEvent::Removed(LabelDevice::Network(removed.clone())));
        self.emit(RegistryEvent::Changed);
        Some(removed)
    }

    // -- selection ----------------------------------------------------------

    /// Position of the persisted default in the current device list.
    ///
    /// `None` means no default is set or the device is not currently
    /// present; neither case is an error. Matching is by stable identity,
    /// so the answer tracks the device across list reordering.
    pub async fn find_default_index(
        &self,
        connection_type: ConnectionType,
    ) -> Result<Option<usize>> {
        match connection_type {
            ConnectionType::Usb => {
                let list = self.refresh_usb_snapshot().await?;
                self.attempt_usb_migration(&list).await;
                match self.state_of(ConnectionType::Usb).await {
                    StoredDefault::Id(id) => {
                        Ok(list.iter().position(|p| p.stable_id() == id))
                    }
                    _ => Ok(None),
                }
            }
            ConnectionType::Wifi => {
                let list = self.inner.network.current();
                self.attempt_wifi_migration(&list, self.inner.network.has_scanned())
                    .await;
                match self.state_of(ConnectionType::Wifi).await {
                    StoredDefault::Id(id) => {
                        Ok(list.iter().position(|p| p.stable_id() == id))
                    }
                    _ => Ok(None),
                }
            }
        }
    }

    /// Make `target` the persisted default for its connection type.
    ///
    /// Emits `SelectionBlocked` on entry and `SelectionUnblocked` on exit
    /// whether the assignment committed or failed; a committed assignment
    /// additionally emits `DefaultChanged` and `Changed`, even when the same
    /// device is re-selected.
    pub async fn set_default(
        &self,
        connection_type: ConnectionType,
        target: &DeviceTarget,
    ) -> Result<LabelDevice> {
        self.emit(RegistryEvent::SelectionBlocked);
        let outcome = self.assign_default(connection_type, target).await;
        self.emit(RegistryEvent::SelectionUnblocked);
        outcome
    }

    /// Drop the persisted default for a connection type. Idempotent; emits
    /// `DefaultChanged` with no device, plus `Changed`.
    pub async fn clear_default(&self, connection_type: ConnectionType) {
        self.set_state(connection_type, StoredDefault::Unset).await;
        self.persist_clear(connection_type).await;
        info!(%connection_type, "default printer cleared");
        self.emit(RegistryEvent::DefaultChanged {
            connection_type,
            device: None,
        });
        self.emit(RegistryEvent::Changed);
    }

    /// Resolve where a transfer should go: the explicit target when given,
    /// otherwise the persisted default.
    pub async fn resolve_target(
        &self,
        connection_type: ConnectionType,
        target: Option<&DeviceTarget>,
    ) -> Result<LabelDevice> {
        if let Some(target) = target {
            return self.lookup(connection_type, target).await;
        }

        // A pending legacy index gets one more chance to resolve before we
        // conclude there is no default.
        if matches!(
            self.state_of(connection_type).await,
            StoredDefault::LegacyIndex(_)
        ) {
            match connection_type {
                ConnectionType::Usb => {
                    if let Ok(list) = self.refresh_usb_snapshot().await {
                        self.attempt_usb_migration(&list).await;
                    }
                }
                ConnectionType::Wifi => {
                    let list = self.inner.network.current();
                    self.attempt_wifi_migration(&list, self.inner.network.has_scanned())
                        .await;
                }
            }
        }

        match self.state_of(connection_type).await {
            StoredDefault::Unset | StoredDefault::LegacyIndex(_) => {
                Err(EtikettError::NoDefaultDevice)
            }
            StoredDefault::Id(id) => self
                .lookup(connection_type, &DeviceTarget::Id(id.clone()))
                .await
                .map_err(|e| match e {
                    EtikettError::DeviceNotFound(_) => EtikettError::DeviceNotFound(format!(
                        "default {connection_type} device {id} is not currently connected"
                    )),
                    other => other,
                }),
        }
    }

    // -- reporting ----------------------------------------------------------

    /// Inventory for the status route: both device lists and the resolved
    /// defaults, USB by list position and network by stable id.
    pub async fn report(&self) -> DeviceReport {
        let usb = match self.usb_devices().await {
            Ok(devices) => {
                let selected = match self.state_of(ConnectionType::Usb).await {
                    StoredDefault::Id(id) => devices.iter().position(|p| p.stable_id() == id),
                    _ => None,
                };
                UsbReport {
                    selected,
                    devices,
                    error: None,
                }
            }
            Err(e) => UsbReport {
                selected: None,
                devices: Vec::new(),
                error: Some(e.to_string()),
            },
        };

        let devices = self.inner.network.current();
        let selected = match self.state_of(ConnectionType::Wifi).await {
            StoredDefault::Id(id) => Some(id),
            _ => None,
        };
        let wifi = WifiReport {
            selected,
            devices,
            error: None,
        };

        DeviceReport { usb, wifi }
    }

    // -- hotplug ------------------------------------------------------------

    /// Start draining USB hotplug notifications into registry events.
    ///
    /// Returns `None` when hotplug is unavailable; enumeration still works.
    pub fn start_hotplug(&self) -> Option<tokio::task::JoinHandle<()>> {
        let mut watcher = match self.inner.usb.watch() {
            Ok(watcher) => watcher,
            Err(e) => {
                warn!(error = %e, "usb hotplug unavailable, relying on enumeration only");
                return None;
            }
        };
        let registry = self.clone();
        Some(tokio::spawn(async move {
            while let Some(event) = watcher.recv().await {
                registry.handle_usb_hotplug(event).await;
            }
            debug!("usb hotplug stream ended");
        }))
    }

    pub(crate) async fn handle_usb_hotplug(&self, event: UsbHotplugEvent) {
        match event {
            UsbHotplugEvent::Attached(printer) => {
                {
                    let mut last = self.inner.last_usb.lock().await;
                    last.retain(|p| {
                        p.bus_number != printer.bus_number || p.address != printer.address
                    });
                    last.push(printer.clone());
                }
                info!(
                    device = %printer.label(),
                    bus = printer.bus_number,
                    address = printer.address,
                    "usb printer attached"
                );
                self.emit(RegistryEvent::Added(LabelDevice::Usb(printer)));
                self.emit(RegistryEvent::Changed);

                if matches!(
                    self.state_of(ConnectionType::Usb).await,
                    StoredDefault::LegacyIndex(_)
                ) {
                    if let Ok(list) = self.refresh_usb_snapshot().await {
                        self.attempt_usb_migration(&list).await;
                    }
                }
            }
            UsbHotplugEvent::Detached {
                bus_number,
                address,
            } => {
                let removed = {
                    let mut last = self.inner.last_usb.lock().await;
                    last.iter()
                        .position(|p| p.bus_number == bus_number && p.address == address)
                        .map(|position| last.remove(position))
                };
                let Some(printer) = removed else {
                    debug!(bus = bus_number, address, "detach for untracked device");
                    return;
                };

                info!(device = %printer.label(), "usb printer detached");
                self.emit(RegistryEvent::Removed(LabelDevice::Usb(printer.clone())));
                self.emit(RegistryEvent::Changed);

                let state = self.state_of(ConnectionType::Usb).await;
                let was_default =
                    matches!(&state, StoredDefault::Id(id) if *id == printer.stable_id());
                if was_default {
                    self.set_state(ConnectionType::Usb, StoredDefault::Unset)
                        .await;
                    self.persist_clear(ConnectionType::Usb).await;
                    warn!(
                        device = %printer.label(),
                        "default usb printer detached, selection cleared"
                    );
                    self.emit(RegistryEvent::DefaultChanged {
                        connection_type: ConnectionType::Usb,
                        device: None,
                    });
                }
            }
        }
    }

    /// Release background resources. The registry remains usable for
    /// enumeration afterwards.
    pub fn dispose(&self) {
        self.inner.network.shutdown();
    }

    // -- internal helpers ---------------------------------------------------

    fn emit(&self, event: RegistryEvent) {
        let _ = self.inner.event_tx.send(event);
    }

    async fn refresh_usb_snapshot(&self) -> Result<Vec<UsbPrinter>> {
        let catalog = self.inner.usb.clone();
        let list = spawn_blocking(move || catalog.list())
            .await
            .map_err(|e| EtikettError::Discovery(format!("usb enumeration task: {e}")))??;
        *self.inner.last_usb.lock().await = list.clone();
        Ok(list)
    }

    async fn state_of(&self, connection_type: ConnectionType) -> StoredDefault {
        let defaults = self.inner.defaults.lock().await;
        match connection_type {
            ConnectionType::Usb => defaults.usb.clone(),
            ConnectionType::Wifi => defaults.wifi.clone(),
        }
    }

    async fn set_state(&self, connection_type: ConnectionType, value: StoredDefault) {
        let mut defaults = self.inner.defaults.lock().await;
        match connection_type {
            ConnectionType::Usb => defaults.usb = value,
            ConnectionType::Wifi => defaults.wifi = value,
        }
    }

    async fn assign_default(
        &self,
        connection_type: ConnectionType,
        target: &DeviceTarget,
    ) -> Result<LabelDevice> {
        let device = self.lookup(connection_type, target).await?;
        let id = device.stable_id();

        self.set_state(connection_type, StoredDefault::Id(id.clone()))
            .await;
        self.persist_set(connection_type, id).await;

        info!(%connection_type, device = %device.label(), "default printer set");
        self.emit(RegistryEvent::DefaultChanged {
            connection_type,
            device: Some(device.clone()),
        });
        self.emit(RegistryEvent::Changed);
        Ok(device)
    }

    /// Resolve an explicit target against the current list for its type.
    async fn lookup(
        &self,
        connection_type: ConnectionType,
        target: &DeviceTarget,
    ) -> Result<LabelDevice> {
        match connection_type {
            ConnectionType::Usb => {
                let list = self.refresh_usb_snapshot().await?;
                match target {
                    DeviceTarget::Index(index) => list
                        .get(*index)
                        .cloned()
                        .map(LabelDevice::Usb)
                        .ok_or_else(|| {
                            EtikettError::DeviceNotFound(format!(
                                "usb index {index} out of range ({} devices)",
                                list.len()
                            ))
                        }),
                    DeviceTarget::Id(id) => list
                        .iter()
                        .find(|p| p.stable_id() == *id)
                        .cloned()
                        .map(LabelDevice::Usb)
                        .ok_or_else(|| {
                            EtikettError::DeviceNotFound(format!("no usb device with id {id}"))
                        }),
                }
            }
            ConnectionType::Wifi => {
                let list = self.inner.network.current();
                match target {
                    DeviceTarget::Index(index) => list
                        .get(*index)
                        .cloned()
                        .map(LabelDevice::Network)
                        .ok_or_else(|| {
                            EtikettError::DeviceNotFound(format!(
                                "network index {index} out of range ({} devices)",
                                list.len()
                            ))
                        }),
                    DeviceTarget::Id(id) => list
                        .iter()
                        .find(|p| p.stable_id() == *id)
                        .cloned()
                        .map(LabelDevice::Network)
                        .ok_or_else(|| {
                            EtikettError::DeviceNotFound(format!(
                                "no network device with id {id}"
                            ))
                        }),
                }
            }
        }
    }

    /// Rewrite a pending legacy USB index once it resolves against an
    /// enumeration snapshot. Snapshots are authoritative, so an out-of-range
    /// index is cleared.
    async fn attempt_usb_migration(&self, list: &[UsbPrinter]) {
        let pending = match self.state_of(ConnectionType::Usb).await {
            StoredDefault::LegacyIndex(index) => index,
            _ => return,
        };

        if let Some(printer) = list.get(pending) {
            let id = printer.stable_id();
            info!(index = pending, id = %id, "migrating legacy usb default to stable id");
            self.set_state(ConnectionType::Usb, StoredDefault::Id(id.clone()))
                .await;
            self.persist_set(ConnectionType::Usb, id).await;
            self.emit(RegistryEvent::Changed);
        } else {
            warn!(
                index = pending,
                count = list.len(),
                "legacy usb default no longer resolves, clearing"
            );
            self.set_state(ConnectionType::Usb, StoredDefault::Unset)
                .await;
            self.persist_clear(ConnectionType::Usb).await;
            self.emit(RegistryEvent::Changed);
        }
    }

    /// Rewrite a pending legacy network index. Clearing only happens against
    /// an authoritative list (one produced by a completed scan); before that
    /// the index stays pending.
    async fn attempt_wifi_migration(&self, list: &[NetworkPrinter], authoritative: bool) {
        let pending = match self.state_of(ConnectionType::Wifi).await {
            StoredDefault::LegacyIndex(index) => index,
            _ => return,
        };

        if let Some(printer) = list.get(pending) {
            let id = printer.stable_id();
            info!(index = pending, id = %id, "migrating legacy network default to stable id");
            self.set_state(ConnectionType::Wifi, StoredDefault::Id(id.clone()))
                .await;
            self.persist_set(ConnectionType::Wifi, id).await;
            self.emit(RegistryEvent::Changed);
        } else if authoritative {
            warn!(
                index = pending,
                count = list.len(),
                "legacy network default no longer resolves, clearing"
            );
            self.set_state(ConnectionType::Wifi, StoredDefault::Unset)
                .await;
            self.persist_clear(ConnectionType::Wifi).await;
            self.emit(RegistryEvent::Changed);
        } else {
            debug!(index = pending, "legacy network default unresolved, awaiting scan");
        }
    }

    async fn persist_set(&self, connection_type: ConnectionType, device_id: String) {
        let store = Arc::clone(&self.inner.store);
        let outcome = spawn_blocking(move || {
            store
                .lock()
                .expect("selection store lock poisoned")
                .set(connection_type, &device_id)
        })
        .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(%connection_type, error = %e, "failed to persist default selection")
            }
            Err(e) => warn!(%connection_type, error = %e, "default persistence task failed"),
        }
    }

    async fn persist_clear(&self, connection_type: ConnectionType) {
        let store = Arc::clone(&self.inner.store);
        let outcome = spawn_blocking(move || {
            store
                .lock()
                .expect("selection store lock poisoned")
                .clear(connection_type)
        })
        .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(%connection_type, error = %e, "failed to clear persisted selection")
            }
            Err(e) => warn!(%connection_type, error = %e, "selection clear task failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry_with(manual: &[(&str, &str)]) -> (DeviceRegistry, EventReceiver) {
        let network = NetworkCatalog::new();
        for (name, ip) in manual {
            network.add_manual(name, ip.parse().unwrap(), 9100);
        }
        let store = SelectionStore::open_in_memory().unwrap();
        DeviceRegistry::new(
            UsbCatalog::new(&[]),
            network,
            store,
            Duration::from_millis(10),
        )
        .await
    }

    fn drain(rx: &mut EventReceiver) -> Vec<RegistryEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn test_usb_printer() -> UsbPrinter {
        UsbPrinter {
            vendor_id: 0x0A5F,
            product_id: 0x0100,
            bus_number: 1,
            address: 7,
            serial: Some("ZD420-XYZ".into()),
            manufacturer: Some("Zebra".into()),
            product: Some("ZD420".into()),
        }
    }

    #[tokio::test]
    async fn no_default_fails_with_no_default_device() {
        let (registry, _rx) = registry_with(&[]).await;
        match registry.resolve_target(ConnectionType::Wifi, None).await {
            Err(EtikettError::NoDefaultDevice) => {}
            other => panic!("expected NoDefaultDevice, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn default_index_follows_identity_not_position() {
        let (registry, _rx) = registry_with(&[
            ("front desk", "192.0.2.10"),
            ("warehouse", "192.0.2.20"),
        ])
        .await;

        registry
            .set_default(ConnectionType::Wifi, &DeviceTarget::Id("192.0.2.20".into()))
            .await
            .unwrap();
        assert_eq!(
            registry
                .find_default_index(ConnectionType::Wifi)
                .await
                .unwrap(),
            Some(1)
        );

        // The device keeps its index answer by identity when the list shrinks.
        registry
            .remove_network_printer("192.0.2.10".parse().unwrap())
            .unwrap();
        assert_eq!(
            registry
                .find_default_index(ConnectionType::Wifi)
                .await
                .unwrap(),
            Some(0)
        );

        // And disappears from the answer when it leaves the list.
        registry
            .remove_network_printer("192.0.2.20".parse().unwrap())
            .unwrap();
        assert_eq!(
            registry
                .find_default_index(ConnectionType::Wifi)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn assigning_same_device_twice_emits_two_default_changed() {
        let (registry, mut rx) = registry_with(&[("front desk", "192.0.2.10")]).await;
        drain(&mut rx);

        let target = DeviceTarget::Id("192.0.2.10".into());
        registry
            .set_default(ConnectionType::Wifi, &target)
            .await
            .unwrap();
        registry
            .set_default(ConnectionType::Wifi, &target)
            .await
            .unwrap();

        let events = drain(&mut rx);
        let default_changes = events
            .iter()
            .filter(|e| matches!(e, RegistryEvent::DefaultChanged { .. }))
            .count();
        assert_eq!(default_changes, 2);

        // Each assignment is bracketed by the selection lifecycle events.
        assert!(matches!(events[0], RegistryEvent::SelectionBlocked));
        assert!(matches!(events[1], RegistryEvent::DefaultChanged { .. }));
        assert!(matches!(events[2], RegistryEvent::Changed));
        assert!(matches!(events[3], RegistryEvent::SelectionUnblocked));

        // Single persisted row per type.
        let stored = {
            let store = registry.inner.store.lock().unwrap();
            store.get(ConnectionType::Wifi).unwrap()
        };
        assert_eq!(stored, Some("192.0.2.10".into()));
    }

    #[tokio::test]
    async fn unknown_target_fails_and_still_unblocks() {
        let (registry, mut rx) = registry_with(&[]).await;
        drain(&mut rx);

        let result = registry
            .set_default(ConnectionType::Wifi, &DeviceTarget::Id("absent".into()))
            .await;
        assert!(matches!(result, Err(EtikettError::DeviceNotFound(_))));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], RegistryEvent::SelectionBlocked));
        assert!(matches!(events[1], RegistryEvent::SelectionUnblocked));
    }

    #[tokio::test]
    async fn clear_default_is_idempotent() {
        let (registry, mut rx) = registry_with(&[("front desk", "192.0.2.10")]).await;
        registry
            .set_default(ConnectionType::Wifi, &DeviceTarget::Index(0))
            .await
            .unwrap();
        drain(&mut rx);

        registry.clear_default(ConnectionType::Wifi).await;
        registry.clear_default(ConnectionType::Wifi).await;

        let events = drain(&mut rx);
        let cleared = events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    RegistryEvent::DefaultChanged { device: None, .. }
                )
            })
            .count();
        assert_eq!(cleared, 2);

        let stored = {
            let store = registry.inner.store.lock().unwrap();
            store.get(ConnectionType::Wifi).unwrap()
        };
        assert_eq!(stored, None);
        assert_eq!(
            registry
                .find_default_index(ConnectionType::Wifi)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn legacy_index_row_migrates_to_stable_id() {
        let store = SelectionStore::open_in_memory().unwrap();
        store.set(ConnectionType::Wifi, "1").unwrap();

        let network = NetworkCatalog::new();
        network.add_manual("front desk", "192.0.2.10".parse().unwrap(), 9100);
        network.add_manual("warehouse", "192.0.2.20".parse().unwrap(), 9100);

        let (registry, _rx) = DeviceRegistry::new(
            UsbCatalog::new(&[]),
            network,
            store,
            Duration::from_millis(10),
        )
        .await;

        assert_eq!(
            registry
                .find_default_index(ConnectionType::Wifi)
                .await
                .unwrap(),
            Some(1)
        );
        let stored = {
            let store = registry.inner.store.lock().unwrap();
            store.get(ConnectionType::Wifi).unwrap()
        };
        assert_eq!(stored, Some("192.0.2.20".into()));
    }

    #[tokio::test]
    async fn explicit_target_overrides_default() {
        let (registry, _rx) = registry_with(&[
            ("front desk", "192.0.2.10"),
            ("warehouse", "192.0.2.20"),
        ])
        .await;

        registry
            .set_default(ConnectionType::Wifi, &DeviceTarget::Id("192.0.2.10".into()))
            .await
            .unwrap();

        let explicit = registry
            .resolve_target(ConnectionType::Wifi, Some(&DeviceTarget::Index(1)))
            .await
            .unwrap();
        assert_eq!(explicit.stable_id(), "192.0.2.20");

        let defaulted = registry
            .resolve_target(ConnectionType::Wifi, None)
            .await
            .unwrap();
        assert_eq!(defaulted.stable_id(), "192.0.2.10");

        let missing = registry
            .resolve_target(ConnectionType::Wifi, Some(&DeviceTarget::Index(9)))
            .await;
        assert!(matches!(missing, Err(EtikettError::DeviceNotFound(_))));
    }

    #[tokio::test]
    async fn detached_default_usb_printer_clears_selection() {
        let (registry, mut rx) = registry_with(&[]).await;
        let printer = test_usb_printer();

        registry.inner.last_usb.lock().await.push(printer.clone());
        registry
            .set_state(ConnectionType::Usb, StoredDefault::Id(printer.stable_id()))
            .await;
        {
            let store = registry.inner.store.lock().unwrap();
            store
                .set(ConnectionType::Usb, &printer.stable_id())
                .unwrap();
        }
        drain(&mut rx);

        registry
            .handle_usb_hotplug(UsbHotplugEvent::Detached {
                bus_number: printer.bus_number,
                address: printer.address,
            })
            .await;

        let events = drain(&mut rx);
        assert!(matches!(events[0], RegistryEvent::Removed(_)));
        assert!(matches!(events[1], RegistryEvent::Changed));
        assert!(matches!(
            events[2],
            RegistryEvent::DefaultChanged { device: None, .. }
        ));

        let stored = {
            let store = registry.inner.store.lock().unwrap();
            store.get(ConnectionType::Usb).unwrap()
        };
        assert_eq!(stored, None);
    }

    #[tokio::test]
    async fn attach_emits_added_and_tracks_snapshot() {
        let (registry, mut rx) = registry_with(&[]).await;
        drain(&mut rx);

        let printer = test_usb_printer();
        registry
            .handle_usb_hotplug(UsbHotplugEvent::Attached(printer.clone()))
            .await;

        let events = drain(&mut rx);
        match &events[0] {
            RegistryEvent::Added(device) => {
                assert_eq!(device.stable_id(), printer.stable_id());
            }
            other => panic!("expected Added, got {other:?}"),
        }
        assert!(matches!(events[1], RegistryEvent::Changed));

        let tracked = registry.inner.last_usb.lock().await;
        assert_eq!(tracked.len(), 1);
        assert_eq!(tracked[0].stable_id(), printer.stable_id());
    }
}
