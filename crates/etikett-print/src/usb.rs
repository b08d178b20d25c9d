// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// USB label-printer catalog and bulk-transfer target.
//
// Enumeration is a pure snapshot filtered to an allow-list of label-printer
// vendors; the catalog never holds a device open. Claiming happens only for
// the duration of one transfer through `UsbTransferTarget`, which releases
// the interface and reattaches the kernel driver on every exit path.
//
// Hotplug notifications arrive through `UsbWatcher`: a libusb callback posts
// raw events onto a channel while a dedicated thread drives
// `Context::handle_events`, keeping all blocking USB work off the async
// runtime.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rusb::{Context, Device, DeviceDescriptor, DeviceHandle, Direction, Hotplug, HotplugBuilder,
           Registration, TransferType, UsbContext};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use etikett_core::error::{EtikettError, Result};
use etikett_core::types::UsbPrinter;

/// Built-in vendor allow-list. Zebra Technologies is the only vendor the
/// service admits out of the box; the config file may add more.
pub const BUILTIN_VENDORS: &[u16] = &[0x0A5F];

/// The interface label printers expose their bulk OUT endpoint on.
const TRANSFER_INTERFACE: u8 = 0;

/// How long the hotplug thread waits in `handle_events` per iteration.
const HOTPLUG_POLL: Duration = Duration::from_millis(100);

/// Maximum bytes handed to a single `write_bulk` call.
const BULK_CHUNK: usize = 16 * 1024;

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Snapshot enumerator for allow-listed USB label printers.
///
/// Constructed in a degraded state when libusb cannot be initialised: every
/// enumeration then fails with a `Discovery` error while the rest of the
/// service keeps running.
#[derive(Clone)]
pub struct UsbCatalog {
    /// The libusb context, absent when initialisation failed.
    context: Option<Context>,
    /// Admitted vendor ids (built-in list plus configured extras).
    allow: Vec<u16>,
}

impl UsbCatalog {
    /// Create a catalog admitting the built-in vendors plus `extra_vendors`.
    pub fn new(extra_vendors: &[u16]) -> Self {
        let mut allow: Vec<u16> = BUILTIN_VENDORS.to_vec();
        for vendor in extra_vendors {
            if !allow.contains(vendor) {
                allow.push(*vendor);
            }
        }

        let context = match Context::new() {
            Ok(context) => Some(context),
            Err(e) => {
                warn!(error = %e, "USB facility unavailable, enumeration disabled");
                None
            }
        };

        Self { context, allow }
    }

    /// Whether the USB facility initialised successfully.
    pub fn available(&self) -> bool {
        self.context.is_some()
    }

    /// Enumerate currently attached label printers.
    ///
    /// Pure snapshot: no caching, no open handles kept. Descriptor strings
    /// are read best-effort; a device that refuses to report them is still
    /// listed.
    pub fn list(&self) -> Result<Vec<UsbPrinter>> {
        let context = self
            .context
            .as_ref()
            .ok_or_else(|| EtikettError::Discovery("usb facility unavailable".into()))?;

        let devices = context
            .devices()
            .map_err(|e| EtikettError::Discovery(format!("usb enumeration: {e}")))?;

        let mut printers = Vec::new();
        for device in devices.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    debug!(
                        bus = device.bus_number(),
                        address = device.address(),
                        error = %e,
                        "skipping device without readable descriptor"
                    );
                    continue;
                }
            };
            if !vendor_allowed(descriptor.vendor_id(), &self.allow) {
                continue;
            }
            printers.push(describe(&device, &descriptor));
        }

        debug!(count = printers.len(), "usb enumeration snapshot");
        Ok(printers)
    }

    /// Open a printer for one transfer: open, detach any kernel driver,
    /// claim the transfer interface, and locate its bulk OUT endpoint.
    ///
    /// The returned target holds the claim until dropped or released.
    pub fn open_target(&self, printer: &UsbPrinter) -> Result<UsbTransferTarget> {
        let context = self
            .context
            .as_ref()
            .ok_or_else(|| EtikettError::Discovery("usb facility unavailable".into()))?;

        let devices = context
            .devices()
            .map_err(|e| EtikettError::Discovery(format!("usb enumeration: {e}")))?;

        let device = devices
            .iter()
            .find(|d| d.bus_number() == printer.bus_number && d.address() == printer.address)
            .ok_or_else(|| {
                EtikettError::DeviceUnavailable(format!(
                    "{} is no longer attached",
                    printer.label()
                ))
            })?;

        UsbTransferTarget::open(device, printer.label())
    }

    /// Subscribe to attach/detach notifications.
    ///
    /// Fails with a `Discovery` error on platforms without hotplug support;
    /// enumeration keeps working in that case.
    pub fn watch(&self) -> Result<UsbWatcher> {
        let context = self
            .context
            .as_ref()
            .ok_or_else(|| EtikettError::Discovery("usb facility unavailable".into()))?;

        if !rusb::has_hotplug() {
            return Err(EtikettError::Discovery(
                "usb hotplug not supported on this platform".into(),
            ));
        }

        UsbWatcher::register(context.clone(), self.allow.clone())
    }
}

/// Whether a vendor id is admitted by the allow-list.
fn vendor_allowed(vendor_id: u16, allow: &[u16]) -> bool {
    allow.contains(&vendor_id)
}

/// Convert a device plus cached descriptor into a `UsbPrinter`.
///
/// Opens the device briefly to read string descriptors; failure to open or
/// read leaves the strings absent.
fn describe(device: &Device<Context>, descriptor: &DeviceDescriptor) -> UsbPrinter {
    let strings = device
        .open()
        .ok()
        .map(|handle| read_string_descriptors(&handle, descriptor));
    let (manufacturer, product, serial) = strings.unwrap_or((None, None, None));

    UsbPrinter {
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        bus_number: device.bus_number(),
        address: device.address(),
        serial,
        manufacturer,
        product,
    }
}

/// Read manufacturer/product/serial strings from an open handle.
fn read_string_descriptors(
    handle: &DeviceHandle<Context>,
    descriptor: &DeviceDescriptor,
) -> (Option<String>, Option<String>, Option<String>) {
    let manufacturer = descriptor
        .manufacturer_string_index()
        .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());
    let product = descriptor
        .product_string_index()
        .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());
    let serial = descriptor
        .serial_number_string_index()
        .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());

    (manufacturer, product, serial)
}

// ---------------------------------------------------------------------------
// Transfer target
// ---------------------------------------------------------------------------

/// An exclusively claimed bulk OUT route to one printer.
///
/// Dropping the target releases the interface and reattaches the kernel
/// driver, so a claim can never outlive a transfer call.
pub struct UsbTransferTarget {
    handle: Option<DeviceHandle<Context>>,
    endpoint: u8,
    detached_kernel_driver: bool,
    label: String,
}

impl UsbTransferTarget {
    fn open(device: Device<Context>, label: String) -> Result<Self> {
        let handle = device.open().map_err(|e| match e {
            rusb::Error::Access => EtikettError::DeviceUnavailable(format!(
                "open {label}: access denied (check USB permissions)"
            )),
            rusb::Error::Busy => {
                EtikettError::DeviceUnavailable(format!("open {label}: device busy"))
            }
            other => EtikettError::DeviceUnavailable(format!("open {label}: {other}")),
        })?;

        // Linux binds usblp to printers; the claim fails until it lets go.
        let mut detached = false;
        match handle.kernel_driver_active(TRANSFER_INTERFACE) {
            Ok(true) => {
                if let Err(e) = handle.detach_kernel_driver(TRANSFER_INTERFACE) {
                    warn!(%label, error = %e, "failed to detach kernel driver");
                } else {
                    debug!(%label, "kernel driver detached");
                    detached = true;
                }
            }
            Ok(false) => {}
            Err(e) => {
                debug!(%label, error = %e, "kernel driver state unknown");
            }
        }

        if let Err(e) = handle.claim_interface(TRANSFER_INTERFACE) {
            if detached {
                let _ = handle.attach_kernel_driver(TRANSFER_INTERFACE);
            }
            return Err(match e {
                rusb::Error::Busy => EtikettError::DeviceUnavailable(format!(
                    "claim {label}: interface {TRANSFER_INTERFACE} already claimed"
                )),
                other => EtikettError::DeviceUnavailable(format!(
                    "claim {label}: {other}"
                )),
            });
        }

        let endpoint = match find_bulk_out_endpoint(&device) {
            Some(endpoint) => endpoint,
            None => {
                let _ = handle.release_interface(TRANSFER_INTERFACE);
                if detached {
                    let _ = handle.attach_kernel_driver(TRANSFER_INTERFACE);
                }
                return Err(EtikettError::DeviceUnavailable(format!(
                    "{label}: no bulk OUT endpoint on interface {TRANSFER_INTERFACE}"
                )));
            }
        };

        debug!(%label, endpoint, "transfer target claimed");
        Ok(Self {
            handle: Some(handle),
            endpoint,
            detached_kernel_driver: detached,
            label,
        })
    }

    /// Write the whole payload through the bulk OUT endpoint.
    ///
    /// Blocking; run inside `spawn_blocking`. The per-call timeout applies to
    /// each chunk submitted to the device.
    pub fn write(&mut self, payload: &[u8], timeout: Duration) -> Result<()> {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| EtikettError::Transfer("transfer target already released".into()))?;

        let mut sent = 0usize;
        while sent < payload.len() {
            let end = usize::min(sent + BULK_CHUNK, payload.len());
            let chunk = &payload[sent..end];
            let written = handle
                .write_bulk(self.endpoint, chunk, timeout)
                .map_err(|e| match e {
                    rusb::Error::Timeout => EtikettError::Transfer(format!(
                        "bulk write to {} timed out after {}s at byte {sent}",
                        self.label,
                        timeout.as_secs()
                    )),
                    other => EtikettError::Transfer(format!(
                        "bulk write to {} failed at byte {sent}: {other}",
                        self.label
                    )),
                })?;
            if written == 0 {
                return Err(EtikettError::Transfer(format!(
                    "bulk write to {} stalled at byte {sent}",
                    self.label
                )));
            }
            sent += written;
            debug!(sent, total = payload.len(), "bulk write progress");
        }

        Ok(())
    }

    /// Release the claim and restore kernel control. Idempotent.
    pub fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.release_interface(TRANSFER_INTERFACE) {
                warn!(label = %self.label, error = %e, "failed to release interface");
            }
            if self.detached_kernel_driver {
                if let Err(e) = handle.attach_kernel_driver(TRANSFER_INTERFACE) {
                    debug!(label = %self.label, error = %e, "could not reattach kernel driver");
                }
            }
            debug!(label = %self.label, "transfer target released");
        }
    }
}

impl Drop for UsbTransferTarget {
    fn drop(&mut self) {
        self.release();
    }
}

/// First bulk OUT endpoint on the transfer interface, if any.
fn find_bulk_out_endpoint(device: &Device<Context>) -> Option<u8> {
    let config = device.active_config_descriptor().ok()?;
    for interface in config.interfaces() {
        if interface.number() != TRANSFER_INTERFACE {
            continue;
        }
        for interface_descriptor in interface.descriptors() {
            for endpoint in interface_descriptor.endpoint_descriptors() {
                if endpoint.direction() == Direction::Out
                    && endpoint.transfer_type() == TransferType::Bulk
                {
                    return Some(endpoint.address());
                }
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Hotplug watcher
// ---------------------------------------------------------------------------

/// A physical topology notification from the USB catalog.
#[derive(Debug, Clone)]
pub enum UsbHotplugEvent {
    /// An allow-listed printer was plugged in.
    Attached(UsbPrinter),
    /// A device left the bus. Carries only its locator; descriptors are not
    /// readable once the device is gone.
    Detached { bus_number: u8, address: u8 },
}

/// Raw notification as delivered by the libusb callback.
enum RawHotplug {
    Arrived(Device<Context>),
    Left { bus_number: u8, address: u8 },
}

/// Posts raw hotplug notifications onto the channel from the libusb callback.
struct HotplugSink {
    raw_tx: mpsc::UnboundedSender<RawHotplug>,
}

impl Hotplug<Context> for HotplugSink {
    fn device_arrived(&mut self, device: Device<Context>) {
        debug!(
            bus = device.bus_number(),
            address = device.address(),
            "hotplug: device arrived"
        );
        let _ = self.raw_tx.send(RawHotplug::Arrived(device));
    }

    fn device_left(&mut self, device: Device<Context>) {
        debug!(
            bus = device.bus_number(),
            address = device.address(),
            "hotplug: device left"
        );
        let _ = self.raw_tx.send(RawHotplug::Left {
            bus_number: device.bus_number(),
            address: device.address(),
        });
    }
}

/// Live hotplug subscription.
///
/// A dedicated thread drives `Context::handle_events` so callbacks fire
/// without an async runtime involved; dropping the watcher stops the thread
/// and unregisters the callback.
pub struct UsbWatcher {
    raw_rx: mpsc::UnboundedReceiver<RawHotplug>,
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
    _registration: Registration<Context>,
    allow: Vec<u16>,
}

impl UsbWatcher {
    fn register(context: Context, allow: Vec<u16>) -> Result<Self> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();

        let registration = HotplugBuilder::new()
            .enumerate(false)
            .register(&context, Box::new(HotplugSink { raw_tx }))
            .map_err(|e| EtikettError::Discovery(format!("hotplug registration: {e}")))?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("usb-hotplug".into())
            .spawn(move || {
                while !stop_flag.load(Ordering::Relaxed) {
                    match context.handle_events(Some(HOTPLUG_POLL)) {
                        Ok(()) => {}
                        Err(rusb::Error::Interrupted) => {
                            debug!("usb event handling interrupted");
                        }
                        Err(e) => {
                            warn!(error = %e, "usb event handling error");
                            std::thread::sleep(HOTPLUG_POLL);
                        }
                    }
                }
                debug!("usb hotplug thread stopped");
            })
            .map_err(|e| EtikettError::Discovery(format!("hotplug thread spawn: {e}")))?;

        info!("usb hotplug watcher registered");
        Ok(Self {
            raw_rx,
            stop,
            thread: Some(thread),
            _registration: registration,
            allow,
        })
    }

    /// Receive the next notification, filtering arrivals to the allow-list.
    ///
    /// Returns `None` once the watcher has stopped.
    pub async fn recv(&mut self) -> Option<UsbHotplugEvent> {
        loop {
            match self.raw_rx.recv().await? {
                RawHotplug::Arrived(device) => {
                    let descriptor = match device.device_descriptor() {
                        Ok(descriptor) => descriptor,
                        Err(e) => {
                            debug!(error = %e, "arrived device without readable descriptor");
                            continue;
                        }
                    };
                    if !vendor_allowed(descriptor.vendor_id(), &self.allow) {
                        continue;
                    }
                    // String descriptor reads are control transfers; keep
                    // them off the async threads.
                    let printer = tokio::task::spawn_blocking(move || {
                        describe(&device, &descriptor)
                    })
                    .await
                    .ok()?;
                    return Some(UsbHotplugEvent::Attached(printer));
                }
                RawHotplug::Left {
                    bus_number,
                    address,
                } => {
                    return Some(UsbHotplugEvent::Detached {
                        bus_number,
                        address,
                    });
                }
            }
        }
    }

    /// Stop the event thread and unregister the callback.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("usb hotplug thread panicked");
            }
        }
    }
}

impl Drop for UsbWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
