// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Transfer router: forwards one payload to one resolved printer.
//
// Exactly one attempt per call, no queueing, no retry. USB transfers hold an
// in-process claim keyed by bus/address; a second transfer to the same
// device fails fast instead of waiting. The claim entry, the interface
// claim, and the kernel driver state are all restored on every exit path.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::task::spawn_blocking;
use tracing::info;

use etikett_core::error::{EtikettError, Result};
use etikett_core::types::{ConnectionType, DeviceTarget, LabelDevice, UsbPrinter};

use crate::raw_client;
use crate::registry::DeviceRegistry;
use crate::usb::UsbCatalog;

type ClaimSet = Arc<StdMutex<HashSet<(u8, u8)>>>;

/// Routes payloads to USB or network printers.
///
/// Cheap to clone; clones share the claim set.
#[derive(Clone)]
pub struct TransferRouter {
    registry: DeviceRegistry,
    usb: UsbCatalog,
    claims: ClaimSet,
    usb_timeout: Duration,
    network_timeout: Duration,
}

impl TransferRouter {
    pub fn new(
        registry: DeviceRegistry,
        usb: UsbCatalog,
        usb_timeout: Duration,
        network_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            usb,
            claims: Arc::new(StdMutex::new(HashSet::new())),
            usb_timeout,
            network_timeout,
        }
    }

    /// Forward `payload` to the explicit target, or to the persisted default
    /// for the connection type (absent type means network).
    ///
    /// Returns the device the payload went to. An empty payload is rejected
    /// before any device work happens.
    pub async fn transfer(
        &self,
        payload: &[u8],
        connection_type: Option<ConnectionType>,
        target: Option<&DeviceTarget>,
    ) -> Result<LabelDevice> {
        if payload.is_empty() {
            return Err(EtikettError::EmptyPayload);
        }

        let connection_type = connection_type.unwrap_or_default();
        let device = self.registry.resolve_target(connection_type, target).await?;

        match &device {
            LabelDevice::Usb(printer) => self.send_usb(printer, payload).await?,
            LabelDevice::Network(printer) => {
                raw_client::send_raw(printer.ip, printer.port, payload, self.network_timeout)
                    .await?
            }
        }

        info!(
            device = %device.label(),
            bytes = payload.len(),
            "payload forwarded"
        );
        Ok(device)
    }

    /// One claimed bulk transfer. The claim guard travels into the blocking
    /// task so it is released only after the write finishes or fails.
    async fn send_usb(&self, printer: &UsbPrinter, payload: &[u8]) -> Result<()> {
        let claim = ClaimGuard::acquire(&self.claims, printer)?;

        let catalog = self.usb.clone();
        let printer = printer.clone();
        let payload = payload.to_vec();
        let timeout = self.usb_timeout;

        spawn_blocking(move || {
            let _claim = claim;
            let mut target = catalog.open_target(&printer)?;
            target.write(&payload, timeout)?;
            target.release();
            Ok::<(), EtikettError>(())
        })
        .await
        .map_err(|e| EtikettError::Transfer(format!("usb transfer task: {e}")))??;

        Ok(())
    }
}

/// Membership in the claim set for one device, removed on drop.
#[derive(Debug)]
struct ClaimGuard {
    claims: ClaimSet,
    key: (u8, u8),
}

impl ClaimGuard {
    fn acquire(claims: &ClaimSet, printer: &UsbPrinter) -> Result<Self> {
        let key = (printer.bus_number, printer.address);
        let mut held = claims.lock().expect("claim set lock poisoned");
        if !held.insert(key) {
            return Err(EtikettError::DeviceUnavailable(format!(
                "{}: transfer already in progress",
                printer.label()
            )));
        }
        Ok(Self {
            claims: Arc::clone(claims),
            key,
        })
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if let Ok(mut held) = self.claims.lock() {
            held.remove(&self.key);
        }
    }
}
