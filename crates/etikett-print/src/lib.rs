// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Etikett Print — USB and network label-printer discovery, default-device
// bookkeeping, raw payload transfer, and the loopback ingest endpoint.  This
// crate bridges between the core domain types defined in `etikett-core` and
// the actual printing hardware.

pub mod events;
pub mod ingest;
pub mod lanscan;
pub mod raw_client;
pub mod registry;
pub mod router;
pub mod store;
pub mod usb;

pub use events::{EventReceiver, RegistryEvent};
pub use ingest::IngestServer;
pub use lanscan::NetworkCatalog;
pub use registry::DeviceRegistry;
pub use router::TransferRouter;
pub use store::SelectionStore;
pub use usb::UsbCatalog;
