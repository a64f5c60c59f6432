//! Platform Collaborator Contract
//!
//! The native Bluetooth stack sits behind these traits. A backend must
//! deliver exactly one response per issued read/write/rssi action, push
//! notification events for activated subscriptions, and report connection
//! loss out of band. [`ConnectionEvents::pair`] builds the channel set a
//! backend feeds for one connection's lifetime.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::Error;
use crate::types::{Characteristic, Notification, OperationRequest, OperationResponse};

/// The standard client characteristic configuration descriptor (0x2902),
/// written to enable/disable notifications unless disabled by configuration.
pub const CLIENT_CHARACTERISTIC_CONFIG: Uuid =
    Uuid::from_u128(0x0000_2902_0000_1000_8000_00805f_9b34fb);

/// Failure reported by a platform backend, before translation into the
/// caller-facing [`Error`] taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?}: {description}")]
pub struct PlatformError {
    pub kind: PlatformErrorKind,
    pub description: String,
}

impl PlatformError {
    pub fn new(kind: PlatformErrorKind, description: impl Into<String>) -> Self {
        Self { kind, description: description.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformErrorKind {
    /// The adapter is powered off or unavailable.
    AdapterDisabled,
    /// The platform refused the request (e.g. connect rejected).
    Rejected,
    /// A GATT status code was returned.
    Gatt(u8),
    /// The physical link dropped.
    ConnectionLost,
    /// Any other stack failure.
    Io,
}

impl From<PlatformError> for Error {
    fn from(error: PlatformError) -> Self {
        match error.kind {
            PlatformErrorKind::AdapterDisabled => Error::BluetoothDisabled,
            PlatformErrorKind::Rejected => Error::ConnectionRejected(error.description),
            PlatformErrorKind::Gatt(status) => Error::GattStatus {
                status,
                description: error.description,
            },
            PlatformErrorKind::ConnectionLost => {
                Error::ConnectionLost(Some(Box::new(Error::Io(error.description))))
            }
            PlatformErrorKind::Io => Error::Io(error.description),
        }
    }
}

/// Event channels scoped to exactly one connection's lifetime.
///
/// `responses` is deliberately a single-slot channel: at most one operation
/// is in flight per connection, so a second buffered response would mean the
/// coordinator's serialization invariant was broken.
pub struct ConnectionEvents {
    pub responses: mpsc::Receiver<OperationResponse>,
    pub notifications: mpsc::UnboundedReceiver<Notification>,
    pub loss: oneshot::Receiver<PlatformError>,
}

/// Sending half handed to the platform backend.
pub struct ConnectionHooks {
    pub responses: mpsc::Sender<OperationResponse>,
    pub notifications: mpsc::UnboundedSender<Notification>,
    pub loss: oneshot::Sender<PlatformError>,
}

impl ConnectionEvents {
    /// Create the hook/event pair for a new connection.
    pub fn pair() -> (ConnectionHooks, ConnectionEvents) {
        let (response_tx, response_rx) = mpsc::channel(1);
        let (notification_tx, notification_rx) = mpsc::unbounded_channel();
        let (loss_tx, loss_rx) = oneshot::channel();
        (
            ConnectionHooks {
                responses: response_tx,
                notifications: notification_tx,
                loss: loss_tx,
            },
            ConnectionEvents {
                responses: response_rx,
                notifications: notification_rx,
                loss: loss_rx,
            },
        )
    }
}

/// Entry point of a platform backend: drives the native connect handshake.
#[async_trait]
pub trait Platform: Send + Sync + 'static {
    /// Perform the platform connection handshake, returning the established
    /// link and the event channels its callbacks feed.
    async fn connect(&self) -> Result<(Box<dyn PlatformLink>, ConnectionEvents), PlatformError>;
}

/// An established native connection.
///
/// The link is exclusively owned by the connection coordinator; `close`
/// releases the native resource and is invoked exactly once.
#[async_trait]
pub trait PlatformLink: Send + Sync {
    /// Fire the native action for a request. The response arrives
    /// asynchronously on the connection's response channel.
    ///
    /// Returning an error means the action was never fired and no response
    /// will be delivered for it. A failure detected after the action
    /// reached the peripheral must instead arrive as an
    /// [`OperationResponse::Failure`] on the response channel.
    async fn issue(&self, request: &OperationRequest) -> Result<(), PlatformError>;

    /// Enable notifications for a characteristic. When `write_descriptor`
    /// is set, the standard notification-enable descriptor (0x2902) is
    /// written as part of activation.
    async fn start_observation(
        &self,
        characteristic: &Characteristic,
        write_descriptor: bool,
    ) -> Result<(), PlatformError>;

    /// Release the native connection resource.
    async fn close(&self) -> Result<(), PlatformError>;
}
