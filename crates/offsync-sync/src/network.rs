//! Debounced online/offline state.
//!
//! Raw reports from the platform (or from the daemon's reachability probe) go
//! into a watch channel. A driver task commits a transition only after the
//! raw state has held for `min_interval`, so a link that flaps faster than
//! that produces no events at all.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    Online,
    Offline,
}

impl NetworkEvent {
    fn from_online(online: bool) -> Self {
        if online {
            NetworkEvent::Online
        } else {
            NetworkEvent::Offline
        }
    }
}

pub type TransitionCallback = Arc<dyn Fn(NetworkEvent) + Send + Sync>;

pub struct NetworkMonitor {
    raw: watch::Sender<bool>,
    committed: AtomicBool,
    events: broadcast::Sender<NetworkEvent>,
    callbacks: Mutex<Vec<TransitionCallback>>,
    min_interval: Duration,
}

impl NetworkMonitor {
    pub fn new(initially_online: bool, min_interval: Duration) -> Arc<Self> {
        let (raw, _) = watch::channel(initially_online);
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            raw,
            committed: AtomicBool::new(initially_online),
            events,
            callbacks: Mutex::new(Vec::new()),
            min_interval,
        })
    }

    /// Last committed (debounced) state.
    pub fn is_online(&self) -> bool {
        self.committed.load(Ordering::SeqCst)
    }

    /// Feed a raw reachability observation.
    pub fn report(&self, online: bool) {
        let previous = self.raw.send_replace(online);
        if previous != online {
            debug!(online, "raw network state changed");
        }
    }

    pub fn on_transition(&self, callback: impl Fn(NetworkEvent) + Send + Sync + 'static) {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    /// Start the debounce driver. It stops when `cancel` fires.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move { monitor.run(cancel).await })
    }

    async fn run(&self, cancel: CancellationToken) {
        let mut rx = self.raw.subscribe();
        loop {
            let target = *rx.borrow_and_update();

            if target == self.is_online() {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        continue;
                    }
                }
            }

            // Raw state differs from committed: wait for it to hold.
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep(self.min_interval) => self.commit(target),
            }
        }
    }

    fn commit(&self, online: bool) {
        self.committed.store(online, Ordering::SeqCst);
        let event = NetworkEvent::from_online(online);
        info!(?event, "network transition");

        let callbacks: Vec<TransitionCallback> = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            callback(event);
        }
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
