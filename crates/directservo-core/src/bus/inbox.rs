//! Per-address reply queues

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::protocol::{Address, Reply};

/// Unbounded FIFO of replies for one address
///
/// The reader thread pushes without blocking; callers pop with a timeout.
/// Several handles bound to the same address share one inbox and take turns
/// receiving from it.
pub struct Inbox {
    tx: UnboundedSender<Reply>,
    rx: tokio::sync::Mutex<UnboundedReceiver<Reply>>,
    queued: AtomicUsize,
}

impl Inbox {
    /// Empty inbox
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            queued: AtomicUsize::new(0),
        }
    }

    /// Queue a reply. Never blocks.
    pub fn push(&self, reply: Reply) {
        // Count first so a concurrent receive never observes zero
        self.queued.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(reply).is_err() {
            self.queued.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Wait for the next reply, giving up after `timeout`
    pub async fn recv_timeout(&self, timeout: Duration) -> Option<Reply> {
        let received = tokio::time::timeout(timeout, async {
            let mut rx = self.rx.lock().await;
            rx.recv().await
        })
        .await
        .ok()
        .flatten();

        if received.is_some() {
            self.queued.fetch_sub(1, Ordering::Relaxed);
        }
        received
    }

    /// Remove every queued reply without waiting.
    ///
    /// Returns nothing if another caller is currently waiting on this inbox.
    pub fn drain(&self) -> Vec<Reply> {
        let mut drained = Vec::new();
        if let Ok(mut rx) = self.rx.try_lock() {
            while let Ok(reply) = rx.try_recv() {
                drained.push(reply);
            }
        }
        self.queued.fetch_sub(drained.len(), Ordering::Relaxed);
        drained
    }

    /// Number of replies waiting to be read
    pub fn len(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    /// True when nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Inbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Lazily populated map from address to inbox, always holding the broadcast inbox
pub struct InboxMap {
    inboxes: Mutex<HashMap<Address, Arc<Inbox>>>,
}

impl InboxMap {
    /// Map holding only the broadcast inbox
    pub fn new() -> Self {
        let mut inboxes = HashMap::new();
        inboxes.insert(Address::BROADCAST, Arc::new(Inbox::new()));
        Self {
            inboxes: Mutex::new(inboxes),
        }
    }

    /// Get the inbox for `address`, creating it on first use
    pub fn get_or_create(&self, address: Address) -> Arc<Inbox> {
        let mut inboxes = self.inboxes.lock().unwrap_or_else(PoisonError::into_inner);
        inboxes
            .entry(address)
            .or_insert_with(|| Arc::new(Inbox::new()))
            .clone()
    }

    /// Inbox for `address`, if one exists
    pub fn get(&self, address: Address) -> Option<Arc<Inbox>> {
        let inboxes = self.inboxes.lock().unwrap_or_else(PoisonError::into_inner);
        inboxes.get(&address).cloned()
    }

    /// The broadcast inbox, which mirrors every reply
    pub fn broadcast(&self) -> Arc<Inbox> {
        self.get_or_create(Address::BROADCAST)
    }

    /// Snapshot of every device address seen so far, broadcast excluded
    pub fn known_addresses(&self) -> Vec<Address> {
        let inboxes = self.inboxes.lock().unwrap_or_else(PoisonError::into_inner);
        let mut addresses: Vec<Address> = inboxes
            .keys()
            .copied()
            .filter(|a| !a.is_broadcast())
            .collect();
        addresses.sort();
        addresses
    }
}

impl Default for InboxMap {
    fn default() -> Self {
        Self::new()
    }
}
