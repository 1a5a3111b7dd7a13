//! Relay for application traffic.
//!
//! Any message whose address is outside the protocol namespace is handed to
//! subscribers unchanged, together with its sender. Applications built on
//! top (chat, parameter replication, file transfer) only ever see address
//! strings and arguments, never the membership table.

use crate::events::{EventBus, Subscription};
use crate::message::Arg;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// An application message received from a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayedMessage {
    /// Address exactly as received
    pub address: String,
    /// Arguments exactly as received
    pub args: Vec<Arg>,
    /// Source address of the datagram
    pub sender: Ipv4Addr,
}

/// Subscription point for relayed messages.
#[derive(Default)]
pub struct MessageRelay {
    bus: Arc<EventBus<RelayedMessage>>,
    delivered: u64,
}

impl MessageRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every relayed message until the subscription is dropped.
    pub fn subscribe(
        &self,
        callback: impl Fn(RelayedMessage) + Send + Sync + 'static,
    ) -> Subscription {
        self.bus.subscribe(callback)
    }

    /// Receive relayed messages sent to exactly `address`.
    pub fn subscribe_address(
        &self,
        address: impl Into<String>,
        callback: impl Fn(RelayedMessage) + Send + Sync + 'static,
    ) -> Subscription {
        let address = address.into();
        self.bus.subscribe(move |msg| {
            if msg.address == address {
                callback(msg);
            }
        })
    }

    /// Hand a message to subscribers.
    pub fn deliver(&mut self, message: RelayedMessage) {
        self.delivered += 1;
        tracing::trace!(
            "relaying {} from {} ({} args)",
            message.address,
            message.sender,
            message.args.len()
        );
        self.bus.emit(message);
    }

    /// Number of messages relayed so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }
}
