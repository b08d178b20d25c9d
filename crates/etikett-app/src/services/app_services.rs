// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Central service layer — initialises all backend subsystems and owns the
// daemon lifecycle: construct, run, dispose.
//
// Construction wires store → catalogs → registry → router → ingest server
// without starting anything; `run` starts the server, the USB hotplug pump,
// and the event sink; `dispose` unwinds them in reverse. No globals.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use etikett_core::AppConfig;
use etikett_core::error::Result;
use etikett_core::types::ServerStatus;
use etikett_print::events::{EventReceiver, RegistryEvent};
use etikett_print::ingest::IngestServer;
use etikett_print::lanscan::NetworkCatalog;
use etikett_print::registry::DeviceRegistry;
use etikett_print::router::TransferRouter;
use etikett_print::store::SelectionStore;
use etikett_print::usb::UsbCatalog;

use super::data_dir;

/// Events retained for diagnostics after they have been logged.
const RECENT_EVENT_CAP: usize = 64;

/// The assembled service graph of the daemon.
pub struct AppServices {
    registry: DeviceRegistry,
    router: TransferRouter,
    ingest: IngestServer,
    config: AppConfig,
    data_dir: PathBuf,
    /// Taken by `run` when the sink starts.
    event_rx: Option<EventReceiver>,
    recent_events: Arc<Mutex<VecDeque<RegistryEvent>>>,
    sink_task: Option<JoinHandle<()>>,
    hotplug_task: Option<JoinHandle<()>>,
}

impl AppServices {
    /// Initialise all services. Call once at daemon startup.
    ///
    /// Creates the data directory, opens the selection database, seeds
    /// manually registered printers from config, and builds the registry,
    /// router, and ingest server. Nothing is listening yet until
    /// [`AppServices::run`].
    ///
    /// CLI overrides take precedence over the persisted config but are not
    /// written back to it.
    pub async fn init(
        data_dir_override: Option<PathBuf>,
        port_override: Option<u16>,
        scan_timeout_override: Option<u64>,
    ) -> Result<Self> {
        let dir = match data_dir_override {
            Some(dir) => {
                std::fs::create_dir_all(&dir)?;
                dir
            }
            None => data_dir::data_dir(),
        };
        info!(path = %dir.display(), "initialising app services");

        let mut config = load_config(&dir).unwrap_or_default();
        if let Some(port) = port_override {
            config.ingest_port = port;
        }
        if let Some(secs) = scan_timeout_override {
            config.scan_timeout_secs = secs;
        }

        // Write the defaults out on first run so operators have a file to edit.
        if !dir.join(CONFIG_FILE).exists()
            && let Err(e) = persist_config(&dir, &config)
        {
            warn!(error = %e, "could not write initial config");
        }

        let store = SelectionStore::open(dir.join("selections.db"))?;

        let usb = UsbCatalog::new(&config.extra_usb_vendors);
        let network = NetworkCatalog::new();
        for printer in &config.manual_printers {
            let added = network.add_manual(&printer.name, printer.ip, printer.port);
            debug!(name = %added.name, ip = %added.ip, "seeded manual printer from config");
        }

        let (registry, event_rx) = DeviceRegistry::new(
            usb.clone(),
            network,
            store,
            Duration::from_secs(config.scan_timeout_secs),
        )
        .await;

        let router = TransferRouter::new(
            registry.clone(),
            usb,
            Duration::from_secs(config.usb_timeout_secs),
            Duration::from_secs(config.transfer_timeout_secs),
        );

        let ingest = IngestServer::new(Some(config.ingest_port));

        info!("app services initialised");

        Ok(Self {
            registry,
            router,
            ingest,
            config,
            data_dir: dir,
            event_rx: Some(event_rx),
            recent_events: Arc::new(Mutex::new(VecDeque::new())),
            sink_task: None,
            hotplug_task: None,
        })
    }

    /// Start the running parts: ingest server, event sink, hotplug pump.
    pub async fn run(&mut self) -> Result<()> {
        self.ingest
            .start(self.router.clone(), self.registry.clone())
            .await?;

        if let Some(event_rx) = self.event_rx.take() {
            self.sink_task = Some(spawn_event_sink(
                event_rx,
                Arc::clone(&self.recent_events),
            ));
        }

        self.hotplug_task = self.registry.start_hotplug();
        Ok(())
    }

    /// Stop everything `run` started and release discovery resources.
    ///
    /// Safe to call more than once.
    pub async fn dispose(&mut self) {
        if let Err(e) = self.ingest.stop().await {
            warn!(error = %e, "ingest server stop failed");
        }
        if let Some(task) = self.hotplug_task.take() {
            task.abort();
        }
        self.registry.dispose();
        if let Some(task) = self.sink_task.take() {
            task.abort();
        }
        info!("app services disposed");
    }

    // -- Accessors -----------------------------------------------------------

    /// The device registry, for report queries and selection changes.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Current ingest server status.
    pub fn ingest_status(&self) -> ServerStatus {
        self.ingest.status()
    }

    /// Bound ingest address once running.
    pub fn ingest_addr(&self) -> Option<SocketAddr> {
        self.ingest.local_addr()
    }

    /// The effective configuration (persisted values plus CLI overrides).
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Path to the data directory.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// The most recent registry events, oldest first.
    pub fn recent_events(&self) -> Vec<RegistryEvent> {
        let held = self
            .recent_events
            .lock()
            .expect("recent events lock poisoned");
        held.iter().cloned().collect()
    }
}

/// Consume registry events: log each one, keep a bounded tail for
/// diagnostics. Events arrive in emission order and stay that way.
fn spawn_event_sink(
    mut event_rx: EventReceiver,
    recent: Arc<Mutex<VecDeque<RegistryEvent>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            log_event(&event);
            let mut held = recent.lock().expect("recent events lock poisoned");
            if held.len() == RECENT_EVENT_CAP {
                held.pop_front();
            }
            held.push_back(event);
        }
        debug!("event channel closed, sink exiting");
    })
}

fn log_event(event: &RegistryEvent) {
    match event {
        RegistryEvent::Changed => info!("device list changed"),
        RegistryEvent::Added(device) => {
            info!(kind = %device.connection_type(), device = %device.label(), "printer added");
        }
        RegistryEvent::Removed(device) => {
            info!(kind = %device.connection_type(), device = %device.label(), "printer removed");
        }
        RegistryEvent::DefaultChanged {
            connection_type,
            device,
        } => match device {
            Some(device) => {
                info!(kind = %connection_type, device = %device.label(), "default changed");
            }
            None => info!(kind = %connection_type, "default cleared"),
        },
        RegistryEvent::SelectionBlocked => info!("selection change in progress"),
        RegistryEvent::SelectionUnblocked => info!("selection change finished"),
    }
}

// -- Config file persistence -------------------------------------------------

const CONFIG_FILE: &str = "config.json";

fn load_config(data_dir: &Path) -> Option<AppConfig> {
    let path = data_dir.join(CONFIG_FILE);
    let data = std::fs::read_to_string(&path).ok()?;
    serde_json::from_str(&data).ok()
}

fn persist_config(data_dir: &Path, config: &AppConfig) -> Result<()> {
    let path = data_dir.join(CONFIG_FILE);
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, json)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use etikett_core::config::ManualPrinter;

    #[test]
    fn config_round_trips_through_the_data_dir() {
        let dir = tempfile::tempdir().unwrap();

        let config = AppConfig {
            ingest_port: 7777,
            extra_usb_vendors: vec![0x04B8],
            manual_printers: vec![ManualPrinter {
                name: "warehouse".into(),
                ip: "192.0.2.9".parse().unwrap(),
                port: 9100,
            }],
            ..AppConfig::default()
        };

        persist_config(dir.path(), &config).unwrap();
        let loaded = load_config(dir.path()).expect("config should load");

        assert_eq!(loaded.ingest_port, 7777);
        assert_eq!(loaded.extra_usb_vendors, vec![0x04B8]);
        assert_eq!(loaded.manual_printers.len(), 1);
        assert_eq!(loaded.manual_printers[0].name, "warehouse");
    }

    #[test]
    fn missing_config_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(dir.path()).is_none());
    }

    #[tokio::test]
    async fn lifecycle_starts_and_stops_cleanly() {
        let dir = tempfile::tempdir().unwrap();

        let mut services =
            AppServices::init(Some(dir.path().to_path_buf()), Some(0), Some(1))
                .await
                .unwrap();
        assert_eq!(services.ingest_status(), ServerStatus::Stopped);
        assert!(dir.path().join("config.json").exists());
        assert!(dir.path().join("selections.db").exists());

        services.run().await.unwrap();
        assert_eq!(services.ingest_status(), ServerStatus::Running);
        assert!(services.ingest_addr().is_some());

        // The registry emits an initial coarse event; the sink should have
        // drained it shortly after starting.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!services.recent_events().is_empty());

        services.dispose().await;
        assert_eq!(services.ingest_status(), ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn manual_printers_from_config_appear_in_the_report() {
        let dir = tempfile::tempdir().unwrap();

        let config = AppConfig {
            ingest_port: 0,
            manual_printers: vec![ManualPrinter {
                name: "front desk".into(),
                ip: "192.0.2.9".parse().unwrap(),
                port: 9100,
            }],
            ..AppConfig::default()
        };
        persist_config(dir.path(), &config).unwrap();

        let mut services = AppServices::init(Some(dir.path().to_path_buf()), None, None)
            .await
            .unwrap();

        let report = services.registry().report().await;
        assert_eq!(report.wifi.devices.len(), 1);
        assert_eq!(report.wifi.devices[0].name, "front desk");

        services.dispose().await;
    }
}
