//! Connection Coordinator
//!
//! Owns one physical connection's single operation/response channel and
//! serializes logical operations against it. A mutual-exclusion lock around
//! issuance guarantees at most one pending operation per connection, and
//! the lock's FIFO fairness serves callers strictly in submission order.
//!
//! If a previous `execute` was cancelled after its platform action fired
//! but before the response arrived, the orphaned response still occupies
//! the single-slot channel. The next `execute` drains and discards it
//! (logged, counted) before issuing its own action, so no response is ever
//! delivered against the wrong request.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

use crate::error::Error;
use crate::platform::PlatformLink;
use crate::types::{Characteristic, OperationRequest, OperationResponse};

/// State guarded by the coordinator lock.
struct ResponseSlot {
    responses: mpsc::Receiver<OperationResponse>,
    /// True while an issued action's response has not been consumed.
    pending: bool,
}

pub(crate) struct Connection {
    link: Arc<dyn PlatformLink>,
    guard: Mutex<ResponseSlot>,
    lost_tx: watch::Sender<Option<Error>>,
    lost_rx: watch::Receiver<Option<Error>>,
    closed: AtomicBool,
    discarded: AtomicU64,
}

impl Connection {
    pub(crate) fn new(
        link: Box<dyn PlatformLink>,
        responses: mpsc::Receiver<OperationResponse>,
    ) -> Self {
        let (lost_tx, lost_rx) = watch::channel(None);
        Self {
            link: Arc::from(link),
            guard: Mutex::new(ResponseSlot { responses, pending: false }),
            lost_tx,
            lost_rx,
            closed: AtomicBool::new(false),
            discarded: AtomicU64::new(0),
        }
    }

    /// Issue one logical operation and await its single response.
    ///
    /// Cancelling the returned future before the lock is acquired has no
    /// externally visible effect. Any later cancellation, including one
    /// landing while the backend's `issue` call is still suspended, leaves
    /// the slot marked pending: the issue step runs on a detached task that
    /// completes regardless, and its eventual response is drained by the
    /// next call.
    pub(crate) async fn execute(
        &self,
        request: OperationRequest,
    ) -> Result<OperationResponse, Error> {
        let mut slot = self.guard.lock().await;

        if slot.pending {
            // A previous execute was cancelled between issuing its action
            // and receiving the response. The hardware action itself cannot
            // be cancelled, so consume the orphan to free the slot.
            let stale = self.await_response(&mut slot).await?;
            slot.pending = false;
            self.discarded.fetch_add(1, Ordering::Relaxed);
            warn!(response = ?stale, "discarded stale response");
        }

        debug!(?request, "issuing operation");
        slot.pending = true;
        let link = Arc::clone(&self.link);
        let issued = tokio::spawn(async move { link.issue(&request).await });
        match issued.await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                // The issue contract: an error means the action never
                // fired, so no response is owed for this slot.
                slot.pending = false;
                return Err(Error::from(error));
            }
            Err(join_error) => {
                warn!(%join_error, "platform issue task failed");
                return Err(Error::Io(format!("platform issue task failed: {join_error}")));
            }
        }

        let response = self.await_response(&mut slot).await?;
        slot.pending = false;

        match response {
            OperationResponse::Failure { status: Some(status), description } => {
                Err(Error::GattStatus { status, description })
            }
            OperationResponse::Failure { status: None, description } => {
                Err(Error::Io(description))
            }
            response => Ok(response),
        }
    }

    /// Await exactly one response, resolving with `ConnectionLost` (carrying
    /// the original loss as cause) if the link drops while waiting.
    async fn await_response(&self, slot: &mut ResponseSlot) -> Result<OperationResponse, Error> {
        let mut lost = self.lost_rx.clone();
        loop {
            if let Some(reason) = lost.borrow_and_update().clone() {
                return Err(Error::ConnectionLost(Some(Box::new(reason))));
            }
            tokio::select! {
                response = slot.responses.recv() => {
                    return match response {
                        Some(response) => Ok(response),
                        // Backend dropped its sending half: the link is gone.
                        None => Err(Error::ConnectionLost(None)),
                    };
                }
                changed = lost.changed() => {
                    if changed.is_err() {
                        return Err(Error::ConnectionLost(None));
                    }
                    // Loop re-reads the watch value.
                }
            }
        }
    }

    pub(crate) async fn start_observation(
        &self,
        characteristic: &Characteristic,
        write_descriptor: bool,
    ) -> Result<(), Error> {
        self.link
            .start_observation(characteristic, write_descriptor)
            .await
            .map_err(Error::from)
    }

    /// Release the native connection resource.
    ///
    /// Idempotent: explicit disconnect and detected loss may race, but the
    /// resource is released exactly once. Pending operations resolve with
    /// `ConnectionLost` carrying `reason`. Teardown failures are logged,
    /// never surfaced.
    pub(crate) async fn close(&self, reason: Option<Error>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let reason = reason.unwrap_or(Error::NotConnected);
        let _ = self.lost_tx.send(Some(reason));
        if let Err(error) = self.link.close().await {
            warn!(%error, "error while releasing native connection");
        }
    }

    /// Number of stale responses drained and discarded so far.
    pub(crate) fn discarded_responses(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}
