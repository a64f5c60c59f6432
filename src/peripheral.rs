//! Peripheral State Machine
//!
//! Drives one logical connection to a single remote peripheral:
//!
//! ```text
//!     connect()
//!         :
//!         v
//!   .------------.       .-----------.
//!   | Connecting | ----> | Connected |
//!   '------------'       '-----------'
//!                              :
//!                       disconnect() or
//!                       connection drop
//!                              :
//!                              v
//!                      .---------------.       .--------------.
//!                      | Disconnecting | ----> | Disconnected |
//!                      '---------------'       '--------------'
//! ```
//!
//! `connect()` is idempotent and single-flight: concurrent callers join one
//! platform handshake and share its outcome. On success the state machine
//! constructs a connection coordinator scoped to exactly that connection's
//! lifetime and the observation registry attaches its pending
//! subscriptions. Read/write/rssi route through the coordinator's
//! serialized execution path.

use std::sync::Arc;

use futures::stream::{self, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::Error;
use crate::observation::{ObservationEvent, ObservationRegistry};
use crate::platform::{ConnectionEvents, Platform, PlatformError, PlatformErrorKind};
use crate::types::{
    Characteristic, Descriptor, Notification, OperationRequest, OperationResponse,
    OperationTarget, WriteType,
};

/// Caller-facing configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Configuration {
    /// When an observation is spun up, the standard notification-enable
    /// descriptor (0x2902) is written as part of activation. Some remote
    /// peripherals mishandle that write; set this to `false` to skip it.
    pub write_observe_descriptors: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Self { write_observe_descriptors: true }
    }
}

/// Connection lifecycle state, published as a conflated broadcast: late
/// subscribers see the current value, never history.
#[derive(Debug, Clone, PartialEq)]
pub enum PeripheralState {
    Disconnected { reason: Option<Error> },
    Connecting,
    Connected,
    Disconnecting,
}

type ConnectOutcome = Option<Result<(), Error>>;

struct ConnectAttempt {
    outcome_tx: Arc<watch::Sender<ConnectOutcome>>,
    outcome_rx: watch::Receiver<ConnectOutcome>,
    task: JoinHandle<()>,
}

struct Session {
    connection: Arc<Connection>,
    supervisor: JoinHandle<()>,
}

enum Lifecycle {
    Disconnected,
    Connecting(ConnectAttempt),
    Connected(Session),
}

/// Handle to one logical peripheral connection. Cheap to clone; all clones
/// share the same state machine.
#[derive(Clone)]
pub struct Peripheral {
    inner: Arc<PeripheralInner>,
}

struct PeripheralInner {
    platform: Arc<dyn Platform>,
    configuration: Configuration,
    lifecycle: Mutex<Lifecycle>,
    state_tx: watch::Sender<PeripheralState>,
    observations: ObservationRegistry,
}

impl Peripheral {
    pub fn new<P: Platform>(platform: P) -> Self {
        Self::with_configuration(platform, Configuration::default())
    }

    pub fn with_configuration<P: Platform>(platform: P, configuration: Configuration) -> Self {
        let (state_tx, _) = watch::channel(PeripheralState::Disconnected { reason: None });
        Self {
            inner: Arc::new(PeripheralInner {
                platform: Arc::new(platform),
                configuration,
                lifecycle: Mutex::new(Lifecycle::Disconnected),
                state_tx,
                observations: ObservationRegistry::new(),
            }),
        }
    }

    /// Conflated stream of the current [`PeripheralState`].
    pub fn state(&self) -> watch::Receiver<PeripheralState> {
        self.inner.state_tx.subscribe()
    }

    /// Initiate a connection, waiting until connected or failure.
    ///
    /// If already connected, returns immediately. If an attempt is already
    /// underway, joins it: every concurrent caller observes the identical
    /// terminal outcome. On failure every waiting caller receives
    /// [`Error::ConnectionRejected`] (or [`Error::BluetoothDisabled`] when
    /// the adapter is off) and the machine returns to `Disconnected`.
    pub async fn connect(&self) -> Result<(), Error> {
        let mut outcome_rx = {
            let mut lifecycle = self.inner.lifecycle.lock().await;
            match &*lifecycle {
                Lifecycle::Connected(_) => return Ok(()),
                Lifecycle::Connecting(attempt) => attempt.outcome_rx.clone(),
                Lifecycle::Disconnected => {
                    let (outcome_tx, outcome_rx) = watch::channel(None);
                    let outcome_tx = Arc::new(outcome_tx);
                    self.inner.publish(PeripheralState::Connecting);
                    let task = tokio::spawn(drive_connect(
                        Arc::clone(&self.inner),
                        Arc::clone(&outcome_tx),
                    ));
                    *lifecycle = Lifecycle::Connecting(ConnectAttempt {
                        outcome_tx,
                        outcome_rx: outcome_rx.clone(),
                        task,
                    });
                    outcome_rx
                }
            }
        };

        loop {
            if let Some(result) = outcome_rx.borrow_and_update().clone() {
                return result;
            }
            if outcome_rx.changed().await.is_err() {
                // The attempt vanished without settling.
                return Err(Error::ConnectionLost(None));
            }
        }
    }

    /// Disconnect the active connection, or cancel an in-flight connect
    /// attempt, waiting until the machine settles on `Disconnected`.
    ///
    /// No-op when already disconnected. Always settles; teardown errors are
    /// logged, never surfaced.
    pub async fn disconnect(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        match std::mem::replace(&mut *lifecycle, Lifecycle::Disconnected) {
            Lifecycle::Disconnected => {
                debug!("disconnect on an already-disconnected peripheral");
            }
            Lifecycle::Connecting(attempt) => {
                info!("cancelling in-flight connect attempt");
                let _ = attempt.outcome_tx.send(Some(Err(Error::ConnectionRejected(
                    "connection attempt cancelled".into(),
                ))));
                attempt.task.abort();
                self.inner
                    .publish(PeripheralState::Disconnected { reason: None });
            }
            Lifecycle::Connected(session) => {
                self.inner.publish(PeripheralState::Disconnecting);
                session.supervisor.abort();
                self.inner.observations.deactivate();
                session.connection.close(None).await;
                self.inner
                    .publish(PeripheralState::Disconnected { reason: None });
                info!("peripheral disconnected");
            }
        }
    }

    /// Read the signal strength of the connection, in dBm.
    pub async fn rssi(&self) -> Result<i16, Error> {
        let connection = self.inner.connection().await?;
        match connection.execute(OperationRequest::ReadRssi).await? {
            OperationResponse::Rssi(rssi) => Ok(rssi),
            other => Err(unexpected(other)),
        }
    }

    /// Read a characteristic's value.
    pub async fn read(&self, characteristic: &Characteristic) -> Result<Vec<u8>, Error> {
        self.read_target((*characteristic).into()).await
    }

    /// Read a descriptor's value.
    pub async fn read_descriptor(&self, descriptor: &Descriptor) -> Result<Vec<u8>, Error> {
        self.read_target((*descriptor).into()).await
    }

    /// Write to a characteristic.
    pub async fn write(
        &self,
        characteristic: &Characteristic,
        payload: &[u8],
        write_type: WriteType,
    ) -> Result<(), Error> {
        self.write_target((*characteristic).into(), payload, write_type)
            .await
    }

    /// Write to a descriptor.
    pub async fn write_descriptor(
        &self,
        descriptor: &Descriptor,
        payload: &[u8],
    ) -> Result<(), Error> {
        self.write_target((*descriptor).into(), payload, WriteType::WithResponse)
            .await
    }

    async fn read_target(&self, target: OperationTarget) -> Result<Vec<u8>, Error> {
        let connection = self.inner.connection().await?;
        match connection.execute(OperationRequest::Read { target }).await? {
            OperationResponse::Value(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    async fn write_target(
        &self,
        target: OperationTarget,
        payload: &[u8],
        write_type: WriteType,
    ) -> Result<(), Error> {
        let connection = self.inner.connection().await?;
        let request = OperationRequest::Write {
            target,
            payload: payload.to_vec(),
            write_type,
        };
        match connection.execute(request).await? {
            OperationResponse::WriteComplete => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Observe value-change notifications for a characteristic.
    ///
    /// The stream may be requested before a connection exists; once
    /// connected it starts emitting automatically. If the connection is
    /// lost the stream stays open and resumes on the next connected
    /// period. Subscription-setup failures are delivered through the
    /// pending `connect()` call when no collector is active yet, and as an
    /// `Err` item on this stream otherwise.
    pub fn observe(
        &self,
        characteristic: &Characteristic,
    ) -> impl Stream<Item = Result<Vec<u8>, Error>> + Send + 'static {
        let collector = self.inner.observations.register(characteristic);
        let inner = Arc::clone(&self.inner);
        let characteristic = *characteristic;

        // Activation for streams requested while already connected happens
        // at first poll, so failures land on the stream itself.
        let setup = stream::once(async move { inner.ensure_active(&characteristic).await })
            .filter_map(|result| async move { result.err().map(Err) });

        let events = BroadcastStream::new(collector).filter_map(|event| async move {
            match event {
                Ok(ObservationEvent::Data(payload)) => Some(Ok(payload)),
                Ok(ObservationEvent::Error(error)) => Some(Err(error)),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "observation collector lagged, events skipped");
                    None
                }
            }
        });

        setup.chain(events)
    }

    /// Diagnostic counter: stale responses drained and discarded by the
    /// current connection's coordinator. Zero when disconnected.
    pub async fn discarded_responses(&self) -> u64 {
        match self.inner.connection().await {
            Ok(connection) => connection.discarded_responses(),
            Err(_) => 0,
        }
    }
}

impl PeripheralInner {
    fn publish(&self, state: PeripheralState) {
        debug!(?state, "peripheral state");
        self.state_tx.send_replace(state);
    }

    async fn connection(&self) -> Result<Arc<Connection>, Error> {
        let lifecycle = self.lifecycle.lock().await;
        match &*lifecycle {
            Lifecycle::Connected(session) => Ok(Arc::clone(&session.connection)),
            _ => Err(Error::NotReady),
        }
    }

    async fn ensure_active(&self, characteristic: &Characteristic) -> Result<(), Error> {
        let connection = loop {
            let mut outcome_rx = {
                let lifecycle = self.lifecycle.lock().await;
                match &*lifecycle {
                    Lifecycle::Connected(session) => break Arc::clone(&session.connection),
                    // An attempt underway may already have walked the
                    // registry before this subscription existed; wait for
                    // it to settle, then look again.
                    Lifecycle::Connecting(attempt) => attempt.outcome_rx.clone(),
                    // Disconnected: activation happens on the next connect.
                    Lifecycle::Disconnected => return Ok(()),
                }
            };
            loop {
                if outcome_rx.borrow_and_update().is_some() {
                    break;
                }
                if outcome_rx.changed().await.is_err() {
                    break;
                }
            }
        };
        self.observations
            .activate_one(
                &connection,
                characteristic,
                self.configuration.write_observe_descriptors,
            )
            .await
    }
}

impl Drop for PeripheralInner {
    fn drop(&mut self) {
        // Owner dropped without an explicit disconnect: the native resource
        // must still be released exactly once.
        match std::mem::replace(self.lifecycle.get_mut(), Lifecycle::Disconnected) {
            Lifecycle::Disconnected => {}
            Lifecycle::Connecting(attempt) => attempt.task.abort(),
            Lifecycle::Connected(session) => {
                session.supervisor.abort();
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let connection = session.connection;
                    handle.spawn(async move {
                        connection.close(Some(Error::ConnectionLost(None))).await;
                    });
                } else {
                    warn!("peripheral dropped outside a runtime; native connection leak");
                }
            }
        }
    }
}

fn unexpected(response: OperationResponse) -> Error {
    Error::Io(format!("unexpected response: {response:?}"))
}

fn handshake_error(error: PlatformError) -> Error {
    match error.kind {
        PlatformErrorKind::AdapterDisabled => Error::BluetoothDisabled,
        _ => Error::ConnectionRejected(error.description),
    }
}

/// Closes an established link if its owner is cancelled before the link is
/// handed over to the lifecycle.
struct PendingLink(Option<Arc<Connection>>);

impl PendingLink {
    fn disarm(&mut self) {
        self.0.take();
    }
}

impl Drop for PendingLink {
    fn drop(&mut self) {
        if let Some(connection) = self.0.take() {
            tokio::spawn(async move {
                connection.close(None).await;
            });
        }
    }
}

/// One connect attempt: handshake, coordinator construction, subscription
/// activation. Runs as its own task so caller cancellation does not abort
/// the shared attempt; only `disconnect()` does.
async fn drive_connect(inner: Arc<PeripheralInner>, outcome_tx: Arc<watch::Sender<ConnectOutcome>>) {
    match establish(&inner).await {
        Ok((connection, notifications, loss)) => {
            let mut guard = PendingLink(Some(Arc::clone(&connection)));
            let mut lifecycle = inner.lifecycle.lock().await;
            let supervisor = tokio::spawn(supervise(
                Arc::downgrade(&inner),
                Arc::clone(&connection),
                notifications,
                loss,
            ));
            *lifecycle = Lifecycle::Connected(Session { connection, supervisor });
            guard.disarm();
            inner.publish(PeripheralState::Connected);
            drop(lifecycle);
            info!("peripheral connected");
            let _ = outcome_tx.send(Some(Ok(())));
        }
        Err(error) => {
            let mut lifecycle = inner.lifecycle.lock().await;
            *lifecycle = Lifecycle::Disconnected;
            inner.publish(PeripheralState::Disconnected { reason: Some(error.clone()) });
            drop(lifecycle);
            warn!(%error, "connect attempt failed");
            let _ = outcome_tx.send(Some(Err(error)));
        }
    }
}

async fn establish(
    inner: &Arc<PeripheralInner>,
) -> Result<
    (
        Arc<Connection>,
        mpsc::UnboundedReceiver<Notification>,
        oneshot::Receiver<PlatformError>,
    ),
    Error,
> {
    let (link, events) = inner.platform.connect().await.map_err(handshake_error)?;
    let ConnectionEvents { responses, notifications, loss } = events;
    let connection = Arc::new(Connection::new(link, responses));

    // If this task is aborted mid-activation the link is still released.
    let mut guard = PendingLink(Some(Arc::clone(&connection)));
    if let Err(error) = inner
        .observations
        .activate(&connection, inner.configuration.write_observe_descriptors)
        .await
    {
        guard.disarm();
        connection.close(Some(error.clone())).await;
        return Err(error);
    }
    guard.disarm();

    Ok((connection, notifications, loss))
}

/// Listens on a connection's notification and loss channels for its whole
/// lifetime: routes payloads into the observation registry and, on detected
/// loss, forces Connected -> Disconnecting -> Disconnected and fails every
/// pending operation with `ConnectionLost`.
async fn supervise(
    inner: std::sync::Weak<PeripheralInner>,
    connection: Arc<Connection>,
    mut notifications: mpsc::UnboundedReceiver<Notification>,
    mut loss: oneshot::Receiver<PlatformError>,
) {
    let reason = loop {
        tokio::select! {
            notification = notifications.recv() => match notification {
                Some(notification) => match inner.upgrade() {
                    Some(inner) => inner.observations.dispatch(notification),
                    None => break Error::ConnectionLost(None),
                },
                // Backend dropped its channels: the link is gone.
                None => break Error::ConnectionLost(None),
            },
            lost = &mut loss => {
                break match lost {
                    Ok(platform_error) => match Error::from(platform_error) {
                        lost @ Error::ConnectionLost(_) => lost,
                        cause => Error::ConnectionLost(Some(Box::new(cause))),
                    },
                    Err(_) => Error::ConnectionLost(None),
                };
            }
        }
    };

    let Some(inner) = inner.upgrade() else {
        connection.close(Some(reason)).await;
        return;
    };

    let mut lifecycle = inner.lifecycle.lock().await;
    let current = matches!(
        &*lifecycle,
        Lifecycle::Connected(session) if Arc::ptr_eq(&session.connection, &connection)
    );
    if current {
        warn!(%reason, "connection lost");
        inner.publish(PeripheralState::Disconnecting);
        inner.observations.deactivate();
        connection.close(Some(reason.clone())).await;
        *lifecycle = Lifecycle::Disconnected;
        inner.publish(PeripheralState::Disconnected { reason: Some(reason) });
    }
}
