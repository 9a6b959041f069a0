//! Service-change fan-out
//!
//! A single consumer task drains a rendezvous channel of service snapshots
//! and invokes the listeners registered for each snapshot's key, in insertion
//! order. The bounded channel backpressures the merge path instead of
//! dropping or re-ordering events.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use registry_types::ServiceInfo;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Receives service snapshots for subscribed keys.
///
/// Callbacks run on the dispatcher's consumer task and must return promptly;
/// they must not call back into subscription APIs.
pub trait EventListener: Send + Sync {
    fn on_event(&self, service: &ServiceInfo);
}

type ListenerMap = HashMap<String, Vec<Arc<dyn EventListener>>>;

/// Bounded fan-out of service-change events to subscribers.
pub struct ChangeDispatcher {
    tx: mpsc::Sender<Arc<ServiceInfo>>,
    listeners: Arc<Mutex<ListenerMap>>,
}

impl ChangeDispatcher {
    /// Create the dispatcher and start its consumer task.
    pub fn new(cancel: CancellationToken) -> Self {
        let (tx, mut rx) = mpsc::channel::<Arc<ServiceInfo>>(1);
        let listeners: Arc<Mutex<ListenerMap>> = Arc::new(Mutex::new(HashMap::new()));

        let map = Arc::clone(&listeners);
        tokio::spawn(async move {
            loop {
                let service = tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = rx.recv() => match event {
                        Some(s) => s,
                        None => return,
                    },
                };
                let key = service.key();
                let guard = map.lock();
                let Some(targets) = guard.get(&key) else { continue };
                for listener in targets {
                    let result =
                        catch_unwind(AssertUnwindSafe(|| listener.on_event(&service)));
                    if result.is_err() {
                        error!(
                            service = %service.name,
                            clusters = %service.clusters,
                            "subscriber panicked during dispatch"
                        );
                    }
                }
            }
        });

        Self { tx, listeners }
    }

    pub fn add_listener(&self, key: impl Into<String>, listener: Arc<dyn EventListener>) {
        self.listeners.lock().entry(key.into()).or_default().push(listener);
    }

    /// Remove a listener by identity; a no-op for unknown keys or listeners.
    pub fn remove_listener(&self, key: &str, listener: &Arc<dyn EventListener>) {
        let mut map = self.listeners.lock();
        if let Some(entries) = map.get_mut(key) {
            entries.retain(|l| !Arc::ptr_eq(l, listener));
            if entries.is_empty() {
                map.remove(key);
            }
        }
    }

    pub fn is_subscribed(&self, key: &str) -> bool {
        self.listeners.lock().contains_key(key)
    }

    /// Queue a snapshot for dispatch; blocks while the consumer is busy.
    pub async fn publish(&self, service: Arc<ServiceInfo>) {
        if self.tx.send(service).await.is_err() {
            debug!("dispatcher consumer is gone, dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Recorder {
        calls: AtomicUsize,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self { calls: AtomicUsize::new(0) })
        }
    }

    impl EventListener for Recorder {
        fn on_event(&self, _service: &ServiceInfo) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicker;

    impl EventListener for Panicker {
        fn on_event(&self, _service: &ServiceInfo) {
            panic!("listener exploded");
        }
    }

    fn snapshot(name: &str) -> Arc<ServiceInfo> {
        Arc::new(ServiceInfo::new(name, ""))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn listeners_receive_events_for_their_key() {
        let dispatcher = ChangeDispatcher::new(CancellationToken::new());
        let recorder = Recorder::new();
        dispatcher.add_listener("g@@s", recorder.clone() as Arc<dyn EventListener>);

        dispatcher.publish(snapshot("g@@s")).await;
        dispatcher.publish(snapshot("g@@other")).await;
        settle().await;

        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn removed_listener_is_not_invoked_again() {
        let dispatcher = ChangeDispatcher::new(CancellationToken::new());
        let recorder = Recorder::new();
        let handle = recorder.clone() as Arc<dyn EventListener>;
        dispatcher.add_listener("g@@s", handle.clone());

        dispatcher.publish(snapshot("g@@s")).await;
        settle().await;
        dispatcher.remove_listener("g@@s", &handle);
        dispatcher.publish(snapshot("g@@s")).await;
        settle().await;

        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
        assert!(!dispatcher.is_subscribed("g@@s"));
    }

    #[tokio::test]
    async fn remove_is_idempotent_on_missing_entries() {
        let dispatcher = ChangeDispatcher::new(CancellationToken::new());
        let handle = Recorder::new() as Arc<dyn EventListener>;
        dispatcher.remove_listener("never-added", &handle);
    }

    #[tokio::test]
    async fn panicking_listener_does_not_disturb_the_rest() {
        let dispatcher = ChangeDispatcher::new(CancellationToken::new());
        let recorder = Recorder::new();
        dispatcher.add_listener("g@@s", Arc::new(Panicker) as Arc<dyn EventListener>);
        dispatcher.add_listener("g@@s", recorder.clone() as Arc<dyn EventListener>);

        dispatcher.publish(snapshot("g@@s")).await;
        settle().await;
        // The loop must survive the panic and keep delivering.
        dispatcher.publish(snapshot("g@@s")).await;
        settle().await;

        assert_eq!(recorder.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_stops_delivery() {
        let cancel = CancellationToken::new();
        let dispatcher = ChangeDispatcher::new(cancel.clone());
        let recorder = Recorder::new();
        dispatcher.add_listener("g@@s", recorder.clone() as Arc<dyn EventListener>);

        cancel.cancel();
        settle().await;
        dispatcher.publish(snapshot("g@@s")).await;
        settle().await;

        assert_eq!(recorder.calls.load(Ordering::SeqCst), 0);
    }
}
