//! Error Taxonomy
//!
//! Every platform/native failure is translated into exactly one of these
//! kinds at the coordinator boundary; no platform-specific representation
//! crosses it.
//!
//! The taxonomy is a single flat enum. The handful of is-a relationships
//! callers rely on ("is this a NotConnected-style failure?") are served by
//! [`Error::category`] and the `is_*` helpers instead of subtype checks.

use thiserror::Error;

/// Failure kinds surfaced by every caller-facing operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Generic failure of the underlying Bluetooth system.
    #[error("bluetooth failure: {0}")]
    Bluetooth(String),

    /// The Bluetooth adapter is powered off or unavailable.
    #[error("bluetooth adapter is disabled")]
    BluetoothDisabled,

    /// Failure during an active operation.
    #[error("i/o failure: {0}")]
    Io(String),

    /// Operation attempted with no established session.
    #[error("no connection established")]
    NotConnected,

    /// Read/write/rssi called before `connect()` completed.
    #[error("peripheral is not ready")]
    NotReady,

    /// The physical link dropped mid-operation. Carries the originating
    /// loss as `source` so the caller's error chain reflects the call site.
    #[error("connection lost")]
    ConnectionLost(#[source] Option<Box<Error>>),

    /// The platform refused the connect attempt.
    #[error("connection rejected: {0}")]
    ConnectionRejected(String),

    /// The peripheral returned a specific GATT protocol status code.
    #[error("gatt status 0x{status:02x}: {description}")]
    GattStatus { status: u8, description: String },
}

/// Coarse grouping mirroring the parent relationships of the taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Underlying Bluetooth-system failures.
    Bluetooth,
    /// Failures during an active operation.
    Io,
    /// No established session (a sub-category of `Io`).
    NotConnected,
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Bluetooth(_) | Error::BluetoothDisabled => ErrorCategory::Bluetooth,
            Error::Io(_) | Error::ConnectionRejected(_) | Error::GattStatus { .. } => {
                ErrorCategory::Io
            }
            Error::NotConnected | Error::NotReady | Error::ConnectionLost(_) => {
                ErrorCategory::NotConnected
            }
        }
    }

    /// True for every failure raised during an active operation, including
    /// the NotConnected sub-category.
    pub fn is_io(&self) -> bool {
        matches!(self.category(), ErrorCategory::Io | ErrorCategory::NotConnected)
    }

    pub fn is_not_connected(&self) -> bool {
        self.category() == ErrorCategory::NotConnected
    }

    pub fn is_bluetooth(&self) -> bool {
        self.category() == ErrorCategory::Bluetooth
    }
}
