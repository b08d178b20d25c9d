// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Human-readable error messages for operators at the label station.
//
// Every technical error is mapped to plain English with a clear suggestion.
// The taxonomy uses four severity levels that drive UI presentation.

use crate::error::EtikettError;

/// Severity of an error from the operator's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Network blip, timeout, busy printer — safe to retry automatically.
    Transient,
    /// Operator must do something (pick a printer, reconnect a cable).
    ActionRequired,
    /// Cannot be fixed by retrying or operator action.
    Permanent,
    /// A physical purchase is needed (cable, labels, ribbon).
    BuyRequired,
}

/// A human-readable error with plain English message and actionable suggestion.
#[derive(Debug, Clone)]
pub struct HumanError {
    /// Plain English summary (shown as a heading).
    pub message: String,
    /// What the operator should try (shown as body text).
    pub suggestion: String,
    /// Whether the system should auto-retry.
    pub retriable: bool,
    /// Severity level (drives icon/colour in UI).
    pub severity: Severity,
}

/// Convert an `EtikettError` into a `HumanError` anyone at the label
/// station can act on.
pub fn humanize_error(err: &EtikettError) -> HumanError {
    match err {
        // -- Discovery --
        EtikettError::Discovery(detail) => {
            let lower = detail.to_ascii_lowercase();
            if lower.contains("usb") {
                HumanError {
                    message: "We can't see USB printers right now.".into(),
                    suggestion: "Check the printer cable is plugged in, then try again. On Linux you may need permission to access USB devices.".into(),
                    retriable: true,
                    severity: Severity::Transient,
                }
            } else {
                HumanError {
                    message: "We can't search for network printers right now.".into(),
                    suggestion: "Make sure you're connected to the same network as the printer, then try again.".into(),
                    retriable: true,
                    severity: Severity::Transient,
                }
            }
        }

        // -- Resolution / selection --
        EtikettError::DeviceNotFound(_) => HumanError {
            message: "That printer isn't in the list any more.".into(),
            suggestion: "Refresh the printer list and choose the printer again.".into(),
            retriable: false,
            severity: Severity::ActionRequired,
        },

        EtikettError::DeviceUnavailable(detail) => {
            let lower = detail.to_ascii_lowercase();
            if lower.contains("permission") || lower.contains("access") {
                HumanError {
                    message: "We don't have permission to use that printer.".into(),
                    suggestion: "Another program may own the printer, or USB permissions need adjusting. Close other label software and try again.".into(),
                    retriable: false,
                    severity: Severity::ActionRequired,
                }
            } else if lower.contains("endpoint") {
                HumanError {
                    message: "That device doesn't accept label data.".into(),
                    suggestion: "The USB device doesn't look like a label printer. Check you picked the right device in the list.".into(),
                    retriable: false,
                    severity: Severity::Permanent,
                }
            } else {
                HumanError {
                    message: "The printer is busy.".into(),
                    suggestion: "A label is already being sent. Wait a moment and try again.".into(),
                    retriable: true,
                    severity: Severity::Transient,
                }
            }
        }

        EtikettError::NoDefaultDevice => HumanError {
            message: "No printer selected.".into(),
            suggestion: "Please choose a printer from the list, then try again.".into(),
            retriable: false,
            severity: Severity::ActionRequired,
        },

        // -- Transfer --
        EtikettError::Transfer(detail) => humanize_transfer_error(detail),

        EtikettError::EmptyPayload => HumanError {
            message: "There was nothing to print.".into(),
            suggestion: "The label data was empty. Check the program that sent the label and try again.".into(),
            retriable: false,
            severity: Severity::ActionRequired,
        },

        // -- Ingest server --
        EtikettError::Server(detail) => HumanError {
            message: "The local print service had a problem.".into(),
            suggestion: format!("Try restarting the service. ({detail})"),
            retriable: true,
            severity: Severity::Transient,
        },

        // -- Storage --
        EtikettError::Store(_) => HumanError {
            message: "The app's settings storage had a problem.".into(),
            suggestion: "Printing still works, but your printer choice may not stick after a restart. Try restarting the service.".into(),
            retriable: true,
            severity: Severity::Transient,
        },

        EtikettError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::PermissionDenied {
                HumanError {
                    message: "The app doesn't have permission for a file it needs.".into(),
                    suggestion: "Check the data directory permissions, or run the service as the right user.".into(),
                    retriable: false,
                    severity: Severity::ActionRequired,
                }
            } else {
                HumanError {
                    message: "There was a problem reading or writing a file.".into(),
                    suggestion: "Try again. If this keeps happening, your device's storage may be full.".into(),
                    retriable: true,
                    severity: Severity::Transient,
                }
            }
        }

        EtikettError::Serialization(_) => HumanError {
            message: "The app had an internal data problem.".into(),
            suggestion: "Try again. If this keeps happening, please report it.".into(),
            retriable: true,
            severity: Severity::Transient,
        },
    }
}

/// Parse transfer error details into human-readable messages.
fn humanize_transfer_error(detail: &str) -> HumanError {
    let lower = detail.to_ascii_lowercase();

    if lower.contains("timed out") {
        HumanError {
            message: "The printer didn't respond in time.".into(),
            suggestion: "The printer might be busy or turned off. Check it's on and connected, then try again.".into(),
            retriable: true,
            severity: Severity::Transient,
        }
    } else if lower.contains("connection refused") {
        HumanError {
            message: "The printer refused our connection.".into(),
            suggestion: "The printer may be turned off or still starting up. Try turning it off and on again.".into(),
            retriable: true,
            severity: Severity::Transient,
        }
    } else if lower.contains("connection reset") || lower.contains("broken pipe") {
        HumanError {
            message: "The connection to the printer was interrupted.".into(),
            suggestion: "This sometimes happens with Wi-Fi. Try sending the label again.".into(),
            retriable: true,
            severity: Severity::Transient,
        }
    } else if lower.contains("endpoint") {
        HumanError {
            message: "That device doesn't accept label data.".into(),
            suggestion: "The USB device doesn't look like a label printer. Check you picked the right device in the list.".into(),
            retriable: false,
            severity: Severity::Permanent,
        }
    } else {
        // Generic transfer fallback
        HumanError {
            message: "The label didn't reach the printer.".into(),
            suggestion: format!("Try again. If this keeps happening, try turning the printer off and on again. (Detail: {detail})"),
            retriable: true,
            severity: Severity::Transient,
        }
    }
}
