//! Real-time fan-out to operator clients. The hub owns the subscriber
//! registry; the WebSocket layer bridges sockets onto it. Delivery is
//! best-effort over bounded per-subscriber queues so a slow client never
//! blocks a producer.

use common::{MacAddr, ServerEvent};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

pub type SubscriberId = u64;

/// What a subscriber wants from the log stream: everything, or named MACs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogTarget {
    All,
    Device(MacAddr),
}

struct Subscriber {
    tx: mpsc::Sender<ServerEvent>,
    all_logs: bool,
    log_devices: HashSet<MacAddr>,
    console_devices: HashSet<MacAddr>,
}

pub struct Hub {
    subscribers: Mutex<HashMap<SubscriberId, Subscriber>>,
    next_id: AtomicU64,
    queue_depth: usize,
}

impl Hub {
    pub fn new(queue_depth: usize) -> Self {
        Hub {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_depth,
        }
    }

    pub async fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<ServerEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_depth);
        self.subscribers.lock().await.insert(
            id,
            Subscriber {
                tx,
                all_logs: false,
                log_devices: HashSet::new(),
                console_devices: HashSet::new(),
            },
        );
        (id, rx)
    }

    pub async fn unsubscribe(&self, id: SubscriberId) {
        self.subscribers.lock().await.remove(&id);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    pub async fn set_log_subscription(&self, id: SubscriberId, target: LogTarget, on: bool) {
        let mut subs = self.subscribers.lock().await;
        if let Some(sub) = subs.get_mut(&id) {
            match target {
                LogTarget::All => sub.all_logs = on,
                LogTarget::Device(mac) => {
                    if on {
                        sub.log_devices.insert(mac);
                    } else {
                        sub.log_devices.remove(&mac);
                    }
                }
            }
        }
    }

    pub async fn set_console_subscription(&self, id: SubscriberId, mac: MacAddr, on: bool) {
        let mut subs = self.subscribers.lock().await;
        if let Some(sub) = subs.get_mut(&id) {
            if on {
                sub.console_devices.insert(mac);
            } else {
                sub.console_devices.remove(&mac);
            }
        }
    }

    /// Direct reply to one subscriber (`pong`).
    pub async fn send_to(&self, id: SubscriberId, event: ServerEvent) {
        let tx = {
            let subs = self.subscribers.lock().await;
            subs.get(&id).map(|s| s.tx.clone())
        };
        if let Some(tx) = tx {
            Self::deliver(id, &tx, event);
        }
    }

    /// Fan out to every subscriber.
    pub async fn broadcast(&self, event: ServerEvent) {
        let targets = self.snapshot(|_| true).await;
        self.dispatch(targets, event);
    }

    /// `device-log` events: `subscribedToAll` plus matching device sets.
    pub async fn broadcast_log(&self, mac: &MacAddr, event: ServerEvent) {
        let targets = self
            .snapshot(|s| s.all_logs || s.log_devices.contains(mac))
            .await;
        self.dispatch(targets, event);
    }

    /// Console output and command acks: matching console subscribers only.
    pub async fn broadcast_console(&self, mac: &MacAddr, event: ServerEvent) {
        let targets = self.snapshot(|s| s.console_devices.contains(mac)).await;
        self.dispatch(targets, event);
    }

    /// Senders are cloned out under the lock; the sends happen after it is
    /// released so a full queue can't stall other subscribers.
    async fn snapshot(
        &self,
        mut filter: impl FnMut(&Subscriber) -> bool,
    ) -> Vec<(SubscriberId, mpsc::Sender<ServerEvent>)> {
        let subs = self.subscribers.lock().await;
        subs.iter()
            .filter(|(_, s)| filter(s))
            .map(|(id, s)| (*id, s.tx.clone()))
            .collect()
    }

    fn dispatch(&self, targets: Vec<(SubscriberId, mpsc::Sender<ServerEvent>)>, event: ServerEvent) {
        for (id, tx) in &targets {
            Self::deliver(*id, tx, event.clone());
        }
    }

    fn deliver(id: SubscriberId, tx: &mpsc::Sender<ServerEvent>, event: ServerEvent) {
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("subscriber {id} queue full, dropping frame");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // The WebSocket task unsubscribes on close; nothing to do.
                debug!("subscriber {id} channel closed");
            }
        }
    }
}
