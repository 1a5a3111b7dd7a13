//! Lifecycle events and the bus that delivers them.
//!
//! `EventBus` is a small observer registry: subscribers register a callback
//! and get a `Subscription` back that unsubscribes when dropped. The node
//! emits [`NodeEvent`]s on one bus and relayed application messages on
//! another, so callers never need to inherit from anything to listen.

use crate::membership::Peer;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// What happened to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeEventKind {
    /// First accepted handshake from this address.
    Found,
    /// Handshake with a different name or group set.
    PropertyChanged,
    /// Removed by a Disconnect message, `disconnect()` or `disconnect_from()`.
    Disconnected,
    /// Heartbeat timeout expired.
    Lost,
    /// Heard from a Lost peer again.
    Reconnected,
}

/// A lifecycle event with the peer's state after the transition.
///
/// For `Disconnected` the peer is the entry as it was before removal.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeEvent {
    pub kind: NodeEventKind,
    pub peer: Peer,
}

impl NodeEvent {
    pub fn new(kind: NodeEventKind, peer: Peer) -> Self {
        Self { kind, peer }
    }
}

type Callback<E> = Arc<dyn Fn(E) + Send + Sync>;

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Hold this value to keep receiving events, drop it to unsubscribe.
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

/// Event bus for publishing events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus<E> {
    callbacks: RwLock<Vec<(usize, Callback<E>)>>,
    next_id: AtomicUsize,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl<E: Clone + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(E) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));

        let bus: Weak<Self> = Arc::downgrade(self);
        Subscription {
            unsubscribe: Some(Box::new(move || {
                if let Some(bus) = bus.upgrade() {
                    bus.unsubscribe(id);
                }
            })),
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run while emit holds a read lock during unwinding
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: E) {
        // Clone the list so a callback may subscribe without deadlocking
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}
