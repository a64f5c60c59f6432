//! Scripted in-memory platform backend.
//!
//! Stands in for the native Bluetooth stack in tests and downstream
//! consumers that need a peripheral without hardware: handshakes can be
//! held open or failed, responses and notifications are injected by hand,
//! and link loss is triggered on demand.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch, Mutex};

use crate::platform::{
    ConnectionEvents, Platform, PlatformError, PlatformErrorKind, PlatformLink,
};
use crate::types::{Characteristic, Notification, OperationRequest, OperationResponse};

struct LiveHooks {
    responses: mpsc::Sender<OperationResponse>,
    notifications: mpsc::UnboundedSender<Notification>,
    loss: Option<oneshot::Sender<PlatformError>>,
}

struct MockState {
    connect_count: AtomicUsize,
    close_count: AtomicUsize,
    gate_tx: watch::Sender<bool>,
    gate_rx: watch::Receiver<bool>,
    issue_gate_tx: watch::Sender<bool>,
    issue_gate_rx: watch::Receiver<bool>,
    observe_gate_tx: watch::Sender<bool>,
    observe_gate_rx: watch::Receiver<bool>,
    next_connect_failure: StdMutex<Option<PlatformError>>,
    observation_failures: StdMutex<HashMap<Characteristic, PlatformError>>,
    observation_starts: StdMutex<Vec<(Characteristic, bool)>>,
    issued_log: StdMutex<Vec<OperationRequest>>,
    issued_tx: mpsc::UnboundedSender<OperationRequest>,
    issued_rx: Mutex<mpsc::UnboundedReceiver<OperationRequest>>,
    hooks: StdMutex<Option<LiveHooks>>,
}

/// Cloneable scripted platform; all clones share one backend state.
#[derive(Clone)]
pub struct MockPlatform {
    inner: Arc<MockState>,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPlatform {
    pub fn new() -> Self {
        let (gate_tx, gate_rx) = watch::channel(true);
        let (issue_gate_tx, issue_gate_rx) = watch::channel(true);
        let (observe_gate_tx, observe_gate_rx) = watch::channel(true);
        let (issued_tx, issued_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(MockState {
                connect_count: AtomicUsize::new(0),
                close_count: AtomicUsize::new(0),
                gate_tx,
                gate_rx,
                issue_gate_tx,
                issue_gate_rx,
                observe_gate_tx,
                observe_gate_rx,
                next_connect_failure: StdMutex::new(None),
                observation_failures: StdMutex::new(HashMap::new()),
                observation_starts: StdMutex::new(Vec::new()),
                issued_log: StdMutex::new(Vec::new()),
                issued_tx,
                issued_rx: Mutex::new(issued_rx),
                hooks: StdMutex::new(None),
            }),
        }
    }

    /// Keep subsequent handshakes suspended until [`release_handshake`].
    ///
    /// [`release_handshake`]: MockPlatform::release_handshake
    pub fn hold_handshake(&self) {
        self.inner.gate_tx.send_replace(false);
    }

    /// Let every held handshake proceed.
    pub fn release_handshake(&self) {
        self.inner.gate_tx.send_replace(true);
    }

    /// Keep issued actions suspended inside the backend call, after the
    /// action has fired, until [`release_issue`].
    ///
    /// [`release_issue`]: MockPlatform::release_issue
    pub fn hold_issue(&self) {
        self.inner.issue_gate_tx.send_replace(false);
    }

    /// Let every held issue call return.
    pub fn release_issue(&self) {
        self.inner.issue_gate_tx.send_replace(true);
    }

    /// Keep observation activations suspended until [`release_observation`].
    ///
    /// [`release_observation`]: MockPlatform::release_observation
    pub fn hold_observation(&self) {
        self.inner.observe_gate_tx.send_replace(false);
    }

    /// Let every held observation activation proceed.
    pub fn release_observation(&self) {
        self.inner.observe_gate_tx.send_replace(true);
    }

    /// Fail the next handshake with `error` (after any hold is released).
    pub fn fail_next_connect(&self, error: PlatformError) {
        *self.inner.next_connect_failure.lock().unwrap() = Some(error);
    }

    /// Fail the next observation activation for `characteristic`.
    pub fn fail_observation(&self, characteristic: &Characteristic, error: PlatformError) {
        self.inner
            .observation_failures
            .lock()
            .unwrap()
            .insert(*characteristic, error);
    }

    /// Deliver the response for the operation currently in flight.
    pub async fn respond(&self, response: OperationResponse) {
        let sender = {
            let hooks = self.inner.hooks.lock().unwrap();
            hooks.as_ref().expect("mock link not connected").responses.clone()
        };
        sender.send(response).await.expect("response channel closed");
    }

    /// Inject a value-change notification. No-op when not connected.
    pub fn notify(&self, characteristic: &Characteristic, payload: impl Into<Vec<u8>>) {
        let hooks = self.inner.hooks.lock().unwrap();
        if let Some(hooks) = hooks.as_ref() {
            let _ = hooks.notifications.send(Notification {
                characteristic: *characteristic,
                payload: payload.into(),
            });
        }
    }

    /// Report asynchronous link loss to the coordinator.
    pub fn drop_link(&self, error: PlatformError) {
        let mut hooks = self.inner.hooks.lock().unwrap();
        if let Some(loss) = hooks.as_mut().and_then(|hooks| hooks.loss.take()) {
            let _ = loss.send(error);
        }
    }

    /// Convenience loss error for tests.
    pub fn loss_error() -> PlatformError {
        PlatformError::new(PlatformErrorKind::ConnectionLost, "link dropped")
    }

    /// Await the next issued platform action.
    pub async fn next_issued(&self) -> OperationRequest {
        self.inner
            .issued_rx
            .lock()
            .await
            .recv()
            .await
            .expect("mock state dropped")
    }

    pub fn connect_count(&self) -> usize {
        self.inner.connect_count.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.inner.close_count.load(Ordering::SeqCst)
    }

    /// Every request issued so far, in submission order.
    pub fn issued(&self) -> Vec<OperationRequest> {
        self.inner.issued_log.lock().unwrap().clone()
    }

    /// Every observation activation so far, with its descriptor-write flag.
    pub fn observation_starts(&self) -> Vec<(Characteristic, bool)> {
        self.inner.observation_starts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Platform for MockPlatform {
    async fn connect(&self) -> Result<(Box<dyn PlatformLink>, ConnectionEvents), PlatformError> {
        self.inner.connect_count.fetch_add(1, Ordering::SeqCst);

        wait_open(self.inner.gate_rx.clone()).await?;

        if let Some(error) = self.inner.next_connect_failure.lock().unwrap().take() {
            return Err(error);
        }

        let (hooks, events) = ConnectionEvents::pair();
        *self.inner.hooks.lock().unwrap() = Some(LiveHooks {
            responses: hooks.responses,
            notifications: hooks.notifications,
            loss: Some(hooks.loss),
        });
        Ok((Box::new(MockLink { inner: Arc::clone(&self.inner) }), events))
    }
}

/// Block until a hold gate is open again.
async fn wait_open(mut gate: watch::Receiver<bool>) -> Result<(), PlatformError> {
    loop {
        if *gate.borrow_and_update() {
            return Ok(());
        }
        if gate.changed().await.is_err() {
            return Err(PlatformError::new(PlatformErrorKind::Io, "mock dropped"));
        }
    }
}

struct MockLink {
    inner: Arc<MockState>,
}

#[async_trait]
impl PlatformLink for MockLink {
    async fn issue(&self, request: &OperationRequest) -> Result<(), PlatformError> {
        // The action fires before any hold: a held issue models a backend
        // call still suspended after the hardware request went out.
        self.inner.issued_log.lock().unwrap().push(request.clone());
        let _ = self.inner.issued_tx.send(request.clone());
        wait_open(self.inner.issue_gate_rx.clone()).await
    }

    async fn start_observation(
        &self,
        characteristic: &Characteristic,
        write_descriptor: bool,
    ) -> Result<(), PlatformError> {
        wait_open(self.inner.observe_gate_rx.clone()).await?;
        if let Some(error) = self
            .inner
            .observation_failures
            .lock()
            .unwrap()
            .remove(characteristic)
        {
            return Err(error);
        }
        self.inner
            .observation_starts
            .lock()
            .unwrap()
            .push((*characteristic, write_descriptor));
        Ok(())
    }

    async fn close(&self) -> Result<(), PlatformError> {
        self.inner.close_count.fetch_add(1, Ordering::SeqCst);
        // Dropping the hooks closes the connection's channels.
        *self.inner.hooks.lock().unwrap() = None;
        Ok(())
    }
}
