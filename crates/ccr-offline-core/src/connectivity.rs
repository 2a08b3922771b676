//! Connectivity observer.
//!
//! Normalizes the platform's stream of online/offline reports into state
//! transitions. Duplicate reports are suppressed and bursts that arrive
//! within the debounce window are coalesced to their final value, so a
//! flapping radio yields at most one transition per settled state.
//!
//! On every offline -> online transition the observer itself asks the sync
//! engine for one drain, before any listener is notified.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use tracing::{debug, info, warn};

/// Callback run on every connectivity transition with the new status.
pub type Listener = Arc<dyn Fn(bool) + Send + Sync>;

/// Receiver of "we are back online" notifications.
pub trait SyncTrigger: Send + Sync {
    fn trigger_sync(&self);
}

/// Token returned by `subscribe` and `init`. Consuming it detaches whatever it
/// was handed out for; dropping it without calling `unsubscribe` keeps the
/// registration alive.
pub struct Unsubscribe {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Unsubscribe {
    fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    fn noop() -> Self {
        Self { cancel: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

struct ObserverState {
    is_online: bool,
    /// Kept in registration order; ids are never reused.
    listeners: Vec<(u64, Listener)>,
    next_listener_id: u64,
}

struct ObserverInner {
    state: Mutex<ObserverState>,
    sync_trigger: Option<Arc<dyn SyncTrigger>>,
}

impl ObserverInner {
    fn report(&self, online: bool) -> bool {
        let listeners: Vec<Listener> = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.is_online == online {
                debug!(online, "Duplicate connectivity report suppressed");
                return false;
            }
            state.is_online = online;
            state.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
        };

        info!(online, "Connectivity changed");
        if online {
            if let Some(ref trigger) = self.sync_trigger {
                trigger.trigger_sync();
            }
        }
        for listener in listeners {
            listener(online);
        }
        true
    }
}

pub struct ConnectivityObserver {
    inner: Arc<ObserverInner>,
    debounce: Duration,
}

impl ConnectivityObserver {
    /// New observer that assumes it is online until told otherwise.
    pub fn new(debounce: Duration, sync_trigger: Option<Arc<dyn SyncTrigger>>) -> Self {
        Self {
            inner: Arc::new(ObserverInner {
                state: Mutex::new(ObserverState {
                    is_online: true,
                    listeners: Vec::new(),
                    next_listener_id: 0,
                }),
                sync_trigger,
            }),
            debounce,
        }
    }

    /// Attach to the platform signal. With no signal the observer degrades to
    /// "online" so remote calls are still attempted.
    pub fn init(&self, signal: Option<BoxStream<'static, bool>>) -> Unsubscribe {
        let Some(mut events) = signal else {
            warn!("Connectivity signal unavailable, assuming online");
            self.inner.report(true);
            return Unsubscribe::noop();
        };

        let inner = Arc::clone(&self.inner);
        let debounce = self.debounce;
        let handle = tokio::spawn(async move {
            while let Some(mut online) = events.next().await {
                if !debounce.is_zero() {
                    // Settle: keep taking newer reports until the signal is quiet
                    loop {
                        match tokio::time::timeout(debounce, events.next()).await {
                            Ok(Some(next)) => online = next,
                            Ok(None) => {
                                inner.report(online);
                                debug!("Connectivity signal ended");
                                return;
                            }
                            Err(_) => break,
                        }
                    }
                }
                inner.report(online);
            }
            debug!("Connectivity signal ended");
        });

        Unsubscribe::new(move || handle.abort())
    }

    /// Last known status. Never blocks on the platform.
    pub fn status(&self) -> bool {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner()).is_online
    }

    /// Feed one platform report. Returns whether it changed the state.
    pub fn report(&self, online: bool) -> bool {
        self.inner.report(online)
    }

    pub fn subscribe(&self, listener: impl Fn(bool) + Send + Sync + 'static) -> Unsubscribe {
        let id = {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            let id = state.next_listener_id;
            state.next_listener_id += 1;
            state.listeners.push((id, Arc::new(listener)));
            id
        };

        let weak: Weak<ObserverInner> = Arc::downgrade(&self.inner);
        Unsubscribe::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
                state.listeners.retain(|(listener_id, _)| *listener_id != id);
            }
        })
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .listeners
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct CountingTrigger {
        calls: AtomicUsize,
    }

    impl SyncTrigger for CountingTrigger {
        fn trigger_sync(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn observer(debounce: Duration) -> (ConnectivityObserver, Arc<CountingTrigger>) {
        let trigger = Arc::new(CountingTrigger::default());
        let observer = ConnectivityObserver::new(debounce, Some(trigger.clone()));
        (observer, trigger)
    }

    fn channel_signal() -> (mpsc::UnboundedSender<bool>, BoxStream<'static, bool>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|value| (value, rx))
        });
        (tx, stream.boxed())
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_duplicates_suppressed_and_one_trigger_per_transition() {
        let (observer, trigger) = observer(Duration::ZERO);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = observer.subscribe(move |online| sink.lock().unwrap().push(online));

        assert!(!observer.report(true));
        assert!(observer.report(false));
        assert!(!observer.report(false));
        assert!(observer.report(true));
        assert!(!observer.report(true));
        assert!(!observer.report(true));

        assert_eq!(*seen.lock().unwrap(), vec![false, true]);
        assert_eq!(trigger.calls.load(Ordering::SeqCst), 1);
        assert!(observer.status());
    }

    #[test]
    fn test_listeners_notified_in_registration_order() {
        let (observer, _) = observer(Duration::ZERO);
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut subs = Vec::new();
        for n in 0..4 {
            let order = order.clone();
            subs.push(observer.subscribe(move |_| order.lock().unwrap().push(n)));
        }

        // Drop the second listener; the rest keep their order
        subs.remove(1).unsubscribe();
        let late = order.clone();
        let _late = observer.subscribe(move |_| late.lock().unwrap().push(9));

        observer.report(false);
        assert_eq!(*order.lock().unwrap(), vec![0, 2, 3, 9]);
        assert_eq!(observer.listener_count(), 4);
    }

    #[test]
    fn test_unsubscribed_listeners_are_reclaimed() {
        let (observer, _) = observer(Duration::ZERO);
        for _ in 0..1000 {
            observer.subscribe(|_| {}).unsubscribe();
        }
        assert_eq!(observer.listener_count(), 0);

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let _sub = observer.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        observer.report(false);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_trigger_fires_before_listeners() {
        let trigger = Arc::new(CountingTrigger::default());
        let observer = ConnectivityObserver::new(Duration::ZERO, Some(trigger.clone()));
        observer.report(false);

        let seen_trigger_calls = Arc::new(AtomicUsize::new(0));
        let probe = trigger.clone();
        let seen = seen_trigger_calls.clone();
        let _sub = observer.subscribe(move |_| {
            seen.store(probe.calls.load(Ordering::SeqCst), Ordering::SeqCst);
        });

        observer.report(true);
        assert_eq!(seen_trigger_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_signal_assumes_online() {
        let (observer, trigger) = observer(Duration::ZERO);
        observer.report(false);

        let _handle = observer.init(None);
        assert!(observer.status());
        assert_eq!(trigger.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_redundant_online_events_trigger_once() {
        let (observer, trigger) = observer(Duration::from_millis(20));
        let (tx, signal) = channel_signal();
        let handle = observer.init(Some(signal));

        tx.send(false).unwrap();
        wait_for(|| !observer.status()).await;

        for _ in 0..5 {
            tx.send(true).unwrap();
        }
        wait_for(|| observer.status()).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(trigger.calls.load(Ordering::SeqCst), 1);
        handle.unsubscribe();
    }

    #[tokio::test]
    async fn test_flap_inside_debounce_window_is_coalesced() {
        let (observer, trigger) = observer(Duration::from_millis(50));
        let transitions = Arc::new(AtomicUsize::new(0));
        let counter = transitions.clone();
        let _sub = observer.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let (tx, signal) = channel_signal();
        let _handle = observer.init(Some(signal));

        // Brief drop while already online settles back to online: no transition
        tx.send(false).unwrap();
        tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(observer.status());
        assert_eq!(transitions.load(Ordering::SeqCst), 0);
        assert_eq!(trigger.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_signal_processing() {
        let (observer, _) = observer(Duration::ZERO);
        let (tx, signal) = channel_signal();
        let handle = observer.init(Some(signal));

        handle.unsubscribe();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let _ = tx.send(false);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(observer.status());
    }
}
