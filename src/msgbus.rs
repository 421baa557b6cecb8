//! Topic-keyed rendezvous between the engine event loop and blocked callers.
//!
//! Topics are 64-bit ids: change ids for proposals, log indices for applied
//! notifications, read-request ids for linearizable reads. A subscription is
//! single-shot unless created with [`MsgBus::subscribe`]; either way it is
//! removed when the handle drops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Value delivered on a topic: an index/id on success, the failure otherwise.
pub(crate) type Payload = Result<u64>;

struct Entry {
    token: u64,
    once: bool,
    tx: mpsc::UnboundedSender<Payload>,
}

#[derive(Default)]
struct Topics {
    closed: bool,
    subs: HashMap<u64, Vec<Entry>>,
}

/// One-shot and broadcast rendezvous keyed by a 64-bit id.
pub(crate) struct MsgBus {
    topics: Mutex<Topics>,
    tokens: AtomicU64,
}

impl MsgBus {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(MsgBus {
            topics: Mutex::new(Topics::default()),
            tokens: AtomicU64::new(0),
        })
    }

    /// Subscribes to `id` for a single delivery.
    pub(crate) fn subscribe_once(self: &Arc<Self>, id: u64) -> Subscription {
        self.subscribe_inner(id, true)
    }

    /// Subscribes to `id` until the handle drops.
    pub(crate) fn subscribe(self: &Arc<Self>, id: u64) -> Subscription {
        self.subscribe_inner(id, false)
    }

    fn subscribe_inner(self: &Arc<Self>, id: u64, once: bool) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.tokens.fetch_add(1, Ordering::Relaxed);

        let mut topics = self.topics.lock().unwrap();
        if topics.closed {
            // Deliver the stop right away; the entry is never registered.
            let _ = tx.send(Err(Error::Stopped));
        } else {
            topics
                .subs
                .entry(id)
                .or_default()
                .push(Entry { token, once, tx });
        }

        Subscription {
            id,
            token,
            rx,
            bus: Arc::clone(self),
        }
    }

    /// Delivers `v` to every subscriber of `id`; single-shot subscribers are
    /// dropped after delivery.
    pub(crate) fn broadcast(&self, id: u64, v: Payload) {
        let mut topics = self.topics.lock().unwrap();
        if topics.closed {
            return;
        }

        if let Some(entries) = topics.subs.get_mut(&id) {
            entries.retain(|e| {
                let delivered = e.tx.send(v.clone()).is_ok();
                delivered && !e.once
            });
            if entries.is_empty() {
                topics.subs.remove(&id);
            }
        }
    }

    /// Delivers `v` to every subscriber of every topic.
    pub(crate) fn broadcast_all(&self, v: Payload) {
        let mut topics = self.topics.lock().unwrap();
        if topics.closed {
            return;
        }

        topics.subs.retain(|_, entries| {
            entries.retain(|e| {
                let delivered = e.tx.send(v.clone()).is_ok();
                delivered && !e.once
            });
            !entries.is_empty()
        });
    }

    /// Stops the bus; pending and future subscribers observe `Stopped`.
    pub(crate) fn close(&self) {
        let mut topics = self.topics.lock().unwrap();
        topics.closed = true;
        for entries in topics.subs.values() {
            for e in entries {
                let _ = e.tx.send(Err(Error::Stopped));
            }
        }
        topics.subs.clear();
    }

    fn unsubscribe(&self, id: u64, token: u64) {
        let mut topics = self.topics.lock().unwrap();
        if let Some(entries) = topics.subs.get_mut(&id) {
            entries.retain(|e| e.token != token);
            if entries.is_empty() {
                topics.subs.remove(&id);
            }
        }
    }
}

/// Receiving side of a bus subscription; unsubscribes on drop.
pub(crate) struct Subscription {
    id: u64,
    token: u64,
    rx: mpsc::UnboundedReceiver<Payload>,
    bus: Arc<MsgBus>,
}

impl Subscription {
    /// Waits for the next delivery. `None` means the bus is gone.
    pub(crate) async fn recv(&mut self) -> Option<Payload> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id, self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_once_single_delivery() {
        let bus = MsgBus::new();
        let mut sub = bus.subscribe_once(7);

        bus.broadcast(7, Ok(1));
        bus.broadcast(7, Ok(2));

        assert_eq!(sub.recv().await, Some(Ok(1)));
        // The second broadcast found no subscriber.
        assert!(sub.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_subscribers() {
        let bus = MsgBus::new();
        let mut a = bus.subscribe_once(1);
        let mut b = bus.subscribe_once(1);

        bus.broadcast(1, Err(Error::NoLeader));

        assert_eq!(a.recv().await, Some(Err(Error::NoLeader)));
        assert_eq!(b.recv().await, Some(Err(Error::NoLeader)));
    }

    #[tokio::test]
    async fn test_broadcast_all() {
        let bus = MsgBus::new();
        let mut a = bus.subscribe_once(1);
        let mut b = bus.subscribe_once(2);

        bus.broadcast_all(Err(Error::NoLeader));

        assert_eq!(a.recv().await, Some(Err(Error::NoLeader)));
        assert_eq!(b.recv().await, Some(Err(Error::NoLeader)));
    }

    #[tokio::test]
    async fn test_unsubscribe_on_drop() {
        let bus = MsgBus::new();
        {
            let _sub = bus.subscribe(9);
        }
        assert!(bus.topics.lock().unwrap().subs.is_empty());
    }

    #[tokio::test]
    async fn test_close_notifies_pending() {
        let bus = MsgBus::new();
        let mut sub = bus.subscribe_once(3);
        bus.close();
        assert_eq!(sub.recv().await, Some(Err(Error::Stopped)));

        // Late subscribers observe the stop immediately.
        let mut late = bus.subscribe_once(4);
        assert_eq!(late.recv().await, Some(Err(Error::Stopped)));
    }
}
