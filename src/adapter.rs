//! Adapter State Monitor
//!
//! Process-wide service over OS Bluetooth power-state broadcasts with a
//! defined lifecycle: the OS registration is activated when the first
//! listener subscribes and deactivated when the last listener handle is
//! dropped. The listener set is guarded by a mutual-exclusion lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

/// Power state of the local Bluetooth adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    PoweredOn,
    PoweredOff,
    Unavailable,
}

/// Callback invoked by the backend when the adapter's power state changes.
pub type AdapterSink = Arc<dyn Fn(AdapterState) + Send + Sync>;

/// OS-facing half of the monitor: registers for (and unregisters from)
/// platform power-state broadcasts.
pub trait AdapterBackend: Send + Sync + 'static {
    /// Register with the OS; `sink` receives every subsequent state change.
    fn activate(&self, sink: AdapterSink);
    /// Unregister from the OS.
    fn deactivate(&self);
}

type Listener = Box<dyn Fn(AdapterState) + Send + Sync>;

struct MonitorInner {
    backend: Box<dyn AdapterBackend>,
    listeners: Mutex<HashMap<u64, Listener>>,
    next_id: AtomicU64,
}

/// Reference-counted monitor over adapter power-state events.
#[derive(Clone)]
pub struct AdapterStateMonitor {
    inner: Arc<MonitorInner>,
}

/// Keeps one listener registered; dropping it unsubscribes, deactivating
/// the backend when it was the last listener.
pub struct AdapterListenerHandle {
    id: u64,
    inner: Weak<MonitorInner>,
}

impl AdapterStateMonitor {
    pub fn new<B: AdapterBackend>(backend: B) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                backend: Box::new(backend),
                listeners: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Add a listener for adapter state changes. The backend is activated
    /// when this is the first listener.
    pub fn subscribe<F>(&self, listener: F) -> AdapterListenerHandle
    where
        F: Fn(AdapterState) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let first = {
            let mut listeners = self.inner.listeners.lock().expect("listener lock poisoned");
            listeners.insert(id, Box::new(listener));
            listeners.len() == 1
        };
        if first {
            debug!("first adapter listener added, activating backend");
            let inner = Arc::downgrade(&self.inner);
            self.inner.backend.activate(Arc::new(move |state| {
                if let Some(inner) = inner.upgrade() {
                    let listeners = inner.listeners.lock().expect("listener lock poisoned");
                    for listener in listeners.values() {
                        (**listener)(state);
                    }
                }
            }));
        }
        AdapterListenerHandle { id, inner: Arc::downgrade(&self.inner) }
    }
}

impl Drop for AdapterListenerHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let empty = {
                let mut listeners = inner.listeners.lock().expect("listener lock poisoned");
                listeners.remove(&self.id);
                listeners.is_empty()
            };
            if empty {
                debug!("last adapter listener removed, deactivating backend");
                inner.backend.deactivate();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct FakeBackend {
        activations: AtomicUsize,
        deactivations: AtomicUsize,
        sink: Mutex<Option<AdapterSink>>,
    }

    impl AdapterBackend for Arc<FakeBackend> {
        fn activate(&self, sink: AdapterSink) {
            self.activations.fetch_add(1, Ordering::SeqCst);
            *self.sink.lock().unwrap() = Some(sink);
        }

        fn deactivate(&self) {
            self.deactivations.fetch_add(1, Ordering::SeqCst);
            *self.sink.lock().unwrap() = None;
        }
    }

    #[test]
    fn test_activates_on_first_listener_only() {
        let backend = Arc::new(FakeBackend::default());
        let monitor = AdapterStateMonitor::new(Arc::clone(&backend));

        let first = monitor.subscribe(|_| {});
        let second = monitor.subscribe(|_| {});
        assert_eq!(backend.activations.load(Ordering::SeqCst), 1);

        drop(first);
        assert_eq!(backend.deactivations.load(Ordering::SeqCst), 0);
        drop(second);
        assert_eq!(backend.deactivations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_events_fan_out_to_all_listeners() {
        let backend = Arc::new(FakeBackend::default());
        let monitor = AdapterStateMonitor::new(Arc::clone(&backend));

        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_b = Arc::new(Mutex::new(Vec::new()));
        let a = Arc::clone(&seen_a);
        let b = Arc::clone(&seen_b);
        let _first = monitor.subscribe(move |state| a.lock().unwrap().push(state));
        let _second = monitor.subscribe(move |state| b.lock().unwrap().push(state));

        let sink = backend.sink.lock().unwrap().clone().unwrap();
        (*sink)(AdapterState::PoweredOff);
        (*sink)(AdapterState::PoweredOn);

        assert_eq!(
            *seen_a.lock().unwrap(),
            vec![AdapterState::PoweredOff, AdapterState::PoweredOn]
        );
        assert_eq!(*seen_a.lock().unwrap(), *seen_b.lock().unwrap());
    }

    #[test]
    fn test_reactivates_after_going_idle() {
        let backend = Arc::new(FakeBackend::default());
        let monitor = AdapterStateMonitor::new(Arc::clone(&backend));

        drop(monitor.subscribe(|_| {}));
        drop(monitor.subscribe(|_| {}));
        assert_eq!(backend.activations.load(Ordering::SeqCst), 2);
        assert_eq!(backend.deactivations.load(Ordering::SeqCst), 2);
    }
}
