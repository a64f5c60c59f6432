//! Observation Registry
//!
//! Tracks per-characteristic notification subscriptions. A subscription is
//! created at the first `observe()` call for a handle and lives for the
//! peripheral's whole lifetime; only its activation flag toggles with
//! connect/disconnect. Payloads fan out through a broadcast channel, so
//! every concurrent collector sees the same live events and late joiners
//! get no replay.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::Error;
use crate::types::{Characteristic, Notification};

/// Fan-out capacity per characteristic. Collectors that fall further behind
/// than this observe a lag gap, not back-pressure on delivery.
const EVENT_CAPACITY: usize = 32;

/// A single live event on an observation stream.
#[derive(Debug, Clone)]
pub(crate) enum ObservationEvent {
    Data(Vec<u8>),
    /// Subscription setup failed while a collector was already active.
    Error(Error),
}

struct Subscription {
    events: broadcast::Sender<ObservationEvent>,
    active: bool,
}

#[derive(Default)]
pub(crate) struct ObservationRegistry {
    subscriptions: Mutex<HashMap<Characteristic, Subscription>>,
}

impl ObservationRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register (or re-use) the subscription for a characteristic and
    /// attach a new collector to its event fan-out.
    pub(crate) fn register(
        &self,
        characteristic: &Characteristic,
    ) -> broadcast::Receiver<ObservationEvent> {
        let mut subscriptions = self.subscriptions.lock().expect("registry lock poisoned");
        subscriptions
            .entry(*characteristic)
            .or_insert_with(|| {
                debug!(?characteristic, "observation subscription created");
                Subscription { events: broadcast::channel(EVENT_CAPACITY).0, active: false }
            })
            .events
            .subscribe()
    }

    /// Activate every registered subscription against a fresh connection.
    ///
    /// Activation failures take one of two paths, because subscription
    /// setup is interleaved with connection establishment: if the failing
    /// subscription already has an active collector the error is delivered
    /// on its stream and activation continues; otherwise the error is
    /// returned so the pending `connect()` call surfaces it.
    pub(crate) async fn activate(
        &self,
        connection: &Connection,
        write_descriptors: bool,
    ) -> Result<(), Error> {
        let registered: Vec<Characteristic> = {
            let subscriptions = self.subscriptions.lock().expect("registry lock poisoned");
            subscriptions.keys().copied().collect()
        };

        for characteristic in registered {
            match connection.start_observation(&characteristic, write_descriptors).await {
                Ok(()) => {
                    let mut subscriptions =
                        self.subscriptions.lock().expect("registry lock poisoned");
                    if let Some(subscription) = subscriptions.get_mut(&characteristic) {
                        subscription.active = true;
                    }
                    debug!(?characteristic, "observation activated");
                }
                Err(error) => {
                    let collector_active = {
                        let subscriptions =
                            self.subscriptions.lock().expect("registry lock poisoned");
                        subscriptions
                            .get(&characteristic)
                            .map(|subscription| subscription.events.receiver_count() > 0)
                            .unwrap_or(false)
                    };
                    if collector_active {
                        warn!(?characteristic, %error, "observation activation failed, delivering on stream");
                        self.send(&characteristic, ObservationEvent::Error(error));
                    } else {
                        return Err(error);
                    }
                }
            }
        }
        Ok(())
    }

    /// Activate a single subscription, for `observe()` calls made while
    /// already connected.
    pub(crate) async fn activate_one(
        &self,
        connection: &Connection,
        characteristic: &Characteristic,
        write_descriptors: bool,
    ) -> Result<(), Error> {
        let already_active = {
            let subscriptions = self.subscriptions.lock().expect("registry lock poisoned");
            subscriptions
                .get(characteristic)
                .map(|subscription| subscription.active)
                .unwrap_or(false)
        };
        if already_active {
            return Ok(());
        }
        connection.start_observation(characteristic, write_descriptors).await?;
        let mut subscriptions = self.subscriptions.lock().expect("registry lock poisoned");
        if let Some(subscription) = subscriptions.get_mut(characteristic) {
            subscription.active = true;
        }
        Ok(())
    }

    /// Mark every subscription inactive. Streams stay open and silent until
    /// the next connected period re-activates them.
    pub(crate) fn deactivate(&self) {
        let mut subscriptions = self.subscriptions.lock().expect("registry lock poisoned");
        for subscription in subscriptions.values_mut() {
            subscription.active = false;
        }
    }

    /// Route an inbound notification to every active collector of the
    /// matching stream.
    pub(crate) fn dispatch(&self, notification: Notification) {
        let subscriptions = self.subscriptions.lock().expect("registry lock poisoned");
        match subscriptions.get(&notification.characteristic) {
            Some(subscription) if subscription.active => {
                // Send fails only when no collector is attached; events are
                // live-only, so that is not an error.
                let _ = subscription
                    .events
                    .send(ObservationEvent::Data(notification.payload));
            }
            _ => debug!(
                characteristic = ?notification.characteristic,
                "notification for inactive or unknown subscription dropped"
            ),
        }
    }

    fn send(&self, characteristic: &Characteristic, event: ObservationEvent) {
        let subscriptions = self.subscriptions.lock().expect("registry lock poisoned");
        if let Some(subscription) = subscriptions.get(characteristic) {
            let _ = subscription.events.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn characteristic() -> Characteristic {
        Characteristic::new(Uuid::new_v4(), Uuid::new_v4())
    }

    #[test]
    fn test_subscription_reused_across_collectors() {
        let registry = ObservationRegistry::new();
        let characteristic = characteristic();
        let _first = registry.register(&characteristic);
        let _second = registry.register(&characteristic);
        let subscriptions = registry.subscriptions.lock().unwrap();
        assert_eq!(subscriptions.len(), 1);
        assert_eq!(subscriptions[&characteristic].events.receiver_count(), 2);
    }

    #[test]
    fn test_dispatch_only_while_active() {
        let registry = ObservationRegistry::new();
        let characteristic = characteristic();
        let mut collector = registry.register(&characteristic);

        // Inactive: payload dropped.
        registry.dispatch(Notification { characteristic, payload: vec![1] });
        assert!(collector.try_recv().is_err());

        registry
            .subscriptions
            .lock()
            .unwrap()
            .get_mut(&characteristic)
            .unwrap()
            .active = true;
        registry.dispatch(Notification { characteristic, payload: vec![2] });
        match collector.try_recv().unwrap() {
            ObservationEvent::Data(payload) => assert_eq!(payload, vec![2]),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_deactivate_keeps_subscriptions() {
        let registry = ObservationRegistry::new();
        let characteristic = characteristic();
        let _collector = registry.register(&characteristic);
        registry.subscriptions.lock().unwrap().get_mut(&characteristic).unwrap().active = true;
        registry.deactivate();
        let subscriptions = registry.subscriptions.lock().unwrap();
        assert_eq!(subscriptions.len(), 1);
        assert!(!subscriptions[&characteristic].active);
    }
}
