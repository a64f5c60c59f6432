//! Client-side coordinator for one BLE GATT connection.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       Peripheral                         │
//! │   (state machine — public API, owns the lifecycle)       │
//! └───────────┬───────────────────────────┬─────────────────┘
//!             │                           │
//!             ▼                           ▼
//! ┌──────────────────────┐   ┌──────────────────────────┐
//! │ Connection           │   │ Observation Registry      │
//! │ Coordinator          │   │                           │
//! │ - serialized execute │   │ - per-characteristic      │
//! │ - single-slot        │   │   broadcast streams       │
//! │   response channel   │   │ - survives reconnects     │
//! └──────────┬───────────┘   └─────────────┬────────────┘
//!            │                             │
//!            └──────────────┬──────────────┘
//!                           ▼
//!              ┌─────────────────────────┐
//!              │   Platform (trait)       │
//!              │   native BLE stack       │
//!              └─────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`peripheral`] - connect/disconnect lifecycle, read/write/rssi/observe
//! - `connection` - serialized operation execution (internal)
//! - `observation` - notification subscription registry (internal)
//! - [`platform`] - the contract a native backend implements
//! - [`adapter`] - process-wide adapter power-state monitor
//! - [`error`] - the failure taxonomy shared by every operation
//! - [`mock`] - scripted backend for tests and hardware-free consumers
//!
//! Device discovery, GATT topology resolution, and bonding are out of
//! scope: callers supply already-resolved characteristic and descriptor
//! handles.

pub mod adapter;
mod connection;
pub mod error;
pub mod mock;
mod observation;
pub mod peripheral;
pub mod platform;
pub mod types;

pub use adapter::{AdapterBackend, AdapterListenerHandle, AdapterSink, AdapterState, AdapterStateMonitor};
pub use error::{Error, ErrorCategory};
pub use peripheral::{Configuration, Peripheral, PeripheralState};
pub use platform::{
    ConnectionEvents, ConnectionHooks, Platform, PlatformError, PlatformErrorKind, PlatformLink,
    CLIENT_CHARACTERISTIC_CONFIG,
};
pub use types::{
    Characteristic, Descriptor, Notification, OperationRequest, OperationResponse,
    OperationTarget, WriteType,
};
