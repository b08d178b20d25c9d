// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified event stream for the device registry.
//
// All registry activity (topology changes, selection changes, assignment
// lifecycle) is emitted through a single channel so that one process-local
// sink observes everything in emission order. Emission is fire-and-forget:
// a missing or slow sink never blocks or fails a registry operation.

use etikett_core::types::{ConnectionType, LabelDevice};
use tokio::sync::mpsc;

/// Closed set of events emitted by the device registry.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    // -----------------------------------------------------------------------
    // Topology and selection changes
    // -----------------------------------------------------------------------
    /// Coarse signal that the device set or a selection changed.
    ///
    /// Emitted alongside every specific event below so a sink may treat any
    /// `Changed` as "refresh everything" without tracking the finer variants.
    Changed,

    /// A printer appeared: USB attach or manual registration.
    Added(LabelDevice),

    /// A printer went away: USB detach or manual removal.
    Removed(LabelDevice),

    /// The default selection for a connection type changed.
    ///
    /// Emitted once per committed assignment, including re-assignment of the
    /// same device. `device` is `None` when the default was cleared.
    DefaultChanged {
        connection_type: ConnectionType,
        device: Option<LabelDevice>,
    },

    // -----------------------------------------------------------------------
    // Assignment lifecycle
    // -----------------------------------------------------------------------
    /// A default assignment is in flight; conflicting UI actions should be
    /// disabled until `SelectionUnblocked` arrives.
    SelectionBlocked,

    /// The in-flight default assignment finished (committed or failed).
    SelectionUnblocked,
}

impl RegistryEvent {
    /// Whether this event reports a physical topology change.
    pub fn is_topology(&self) -> bool {
        matches!(self, Self::Added(_) | Self::Removed(_))
    }

    /// Whether this event reports selection state or its lifecycle.
    pub fn is_selection(&self) -> bool {
        matches!(
            self,
            Self::DefaultChanged { .. } | Self::SelectionBlocked | Self::SelectionUnblocked
        )
    }

    /// The device carried by this event, if any.
    pub fn device(&self) -> Option<&LabelDevice> {
        match self {
            Self::Added(device) | Self::Removed(device) => Some(device),
            Self::DefaultChanged { device, .. } => device.as_ref(),
            _ => None,
        }
    }
}

/// Receiving side of the registry event stream.
pub type EventReceiver = mpsc::UnboundedReceiver<RegistryEvent>;

/// Sending side of the registry event stream.
pub(crate) type EventSender = mpsc::UnboundedSender<RegistryEvent>;

/// Create the registry event channel.
///
/// Unbounded so that emission never waits on the sink; ordering follows
/// emission order on the single sender.
pub(crate) fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn network_device() -> LabelDevice {
        LabelDevice::Network(etikett_core::types::NetworkPrinter {
            name: "zebra-1".into(),
            ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
            port: 9100,
            mac: Some("aa:bb:cc:dd:ee:ff".into()),
            manually_added: false,
        })
    }

    #[test]
    fn topology_classification() {
        assert!(RegistryEvent::Added(network_device()).is_topology());
        assert!(RegistryEvent::Removed(network_device()).is_topology());
        assert!(!RegistryEvent::Changed.is_topology());
        assert!(!RegistryEvent::SelectionBlocked.is_topology());
    }

    #[test]
    fn selection_classification() {
        let event = RegistryEvent::DefaultChanged {
            connection_type: ConnectionType::Wifi,
            device: Some(network_device()),
        };
        assert!(event.is_selection());
        assert!(RegistryEvent::SelectionBlocked.is_selection());
        assert!(RegistryEvent::SelectionUnblocked.is_selection());
        assert!(!RegistryEvent::Changed.is_selection());
    }

    #[test]
    fn device_accessor_returns_carried_device() {
        let event = RegistryEvent::Added(network_device());
        assert_eq!(
            event.device().map(|d| d.stable_id()).as_deref(),
            Some("aa:bb:cc:dd:ee:ff")
        );
        assert!(RegistryEvent::Changed.device().is_none());

        let cleared = RegistryEvent::DefaultChanged {
            connection_type: ConnectionType::Usb,
            device: None,
        };
        assert!(cleared.device().is_none());
    }

    #[test]
    fn channel_preserves_emission_order() {
        let (tx, mut rx) = channel();
        let _ = tx.send(RegistryEvent::SelectionBlocked);
        let _ = tx.send(RegistryEvent::DefaultChanged {
            connection_type: ConnectionType::Wifi,
            device: Some(network_device()),
        });
        let _ = tx.send(RegistryEvent::Changed);
        let _ = tx.send(RegistryEvent::SelectionUnblocked);

        assert!(matches!(
            rx.try_recv().expect("first event"),
            RegistryEvent::SelectionBlocked
        ));
        assert!(matches!(
            rx.try_recv().expect("second event"),
            RegistryEvent::DefaultChanged { .. }
        ));
        assert!(matches!(
            rx.try_recv().expect("third event"),
            RegistryEvent::Changed
        ));
        assert!(matches!(
            rx.try_recv().expect("fourth event"),
            RegistryEvent::SelectionUnblocked
        ));
    }

    #[test]
    fn emission_succeeds_without_receiver_backpressure() {
        // The sink may lag arbitrarily; senders never wait.
        let (tx, mut rx) = channel();
        for _ in 0..1000 {
            let _ = tx.send(RegistryEvent::Changed);
        }
        let mut seen = 0;
        while rx.try_recv().is_ok() {
            seen += 1;
        }
        assert_eq!(seen, 1000);
    }
}
