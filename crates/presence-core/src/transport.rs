//! Transport trait for addressed datagrams.
//!
//! Implementations:
//! - UDP: one long-lived broadcast-capable socket (presence-daemon)
//! - Memory: [`MemoryNetwork`], a simulated subnet for tests
//!
//! Sends are fire-and-forget; receiving is a non-blocking poll that the node
//! drains once per tick.

use crate::interfaces::{InterfaceDirectory, SelfInterface};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Transport closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// One received datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Source address
    pub from: Ipv4Addr,
    /// Raw payload
    pub data: Vec<u8>,
}

/// Datagram transport used by the discovery engine.
///
/// The destination port is owned by the implementation; every node of a
/// deployment listens on the same port.
pub trait Transport {
    /// Queue a datagram for `to`. Never blocks, never retries.
    fn send_to(&mut self, to: Ipv4Addr, data: &[u8]) -> Result<()>;

    /// Next queued inbound datagram, in arrival order.
    fn try_recv(&mut self) -> Option<Datagram>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send_to(&mut self, to: Ipv4Addr, data: &[u8]) -> Result<()> {
        (**self).send_to(to, data)
    }

    fn try_recv(&mut self) -> Option<Datagram> {
        (**self).try_recv()
    }
}

/// A datagram recorded by [`MemoryNetwork`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentDatagram {
    pub from: Ipv4Addr,
    pub to: Ipv4Addr,
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct NetworkState {
    netmask: Ipv4Addr,
    inboxes: BTreeMap<Ipv4Addr, VecDeque<Datagram>>,
    unplugged: BTreeSet<Ipv4Addr>,
    sent: Vec<SentDatagram>,
}

impl NetworkState {
    fn broadcast_of(&self, ip: Ipv4Addr) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(ip) | !u32::from(self.netmask))
    }

    fn deliver(&mut self, from: Ipv4Addr, to: Ipv4Addr, data: &[u8]) {
        self.sent.push(SentDatagram {
            from,
            to,
            data: data.to_vec(),
        });

        if self.unplugged.contains(&from) {
            return;
        }

        let recipients: Vec<Ipv4Addr> = self
            .inboxes
            .keys()
            .copied()
            .filter(|ip| *ip == to || self.broadcast_of(*ip) == to)
            .filter(|ip| !self.unplugged.contains(ip))
            .collect();

        for ip in recipients {
            if let Some(inbox) = self.inboxes.get_mut(&ip) {
                inbox.push_back(Datagram {
                    from,
                    data: data.to_vec(),
                });
            }
        }
    }
}

/// Simulated broadcast subnet.
///
/// Broadcasts reach every attached node in the subnet, the sender included,
/// as they do on a real interface. Unplugging a node silently drops
/// everything it sends or would receive.
#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new(Ipv4Addr::new(255, 255, 255, 0))
    }
}

impl MemoryNetwork {
    pub fn new(netmask: Ipv4Addr) -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState {
                netmask,
                inboxes: BTreeMap::new(),
                unplugged: BTreeSet::new(),
                sent: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach a node with address `ip`.
    pub fn attach(&self, ip: Ipv4Addr) -> MemoryTransport {
        self.lock().inboxes.entry(ip).or_default();
        MemoryTransport {
            network: self.clone(),
            ip,
        }
    }

    /// Interface list a node at `ip` would enumerate.
    pub fn interfaces(&self, ip: Ipv4Addr) -> InterfaceDirectory {
        let state = self.lock();
        InterfaceDirectory::new(vec![SelfInterface::new(
            "mem0",
            ip,
            state.netmask,
            Some(state.broadcast_of(ip)),
        )])
    }

    /// Broadcast address of the subnet containing `ip`.
    pub fn broadcast_address(&self, ip: Ipv4Addr) -> Ipv4Addr {
        self.lock().broadcast_of(ip)
    }

    pub fn unplug(&self, ip: Ipv4Addr) {
        self.lock().unplugged.insert(ip);
    }

    pub fn plug(&self, ip: Ipv4Addr) {
        self.lock().unplugged.remove(&ip);
    }

    /// Every datagram sent so far, including dropped ones.
    pub fn sent(&self) -> Vec<SentDatagram> {
        self.lock().sent.clone()
    }

    /// Take and clear the sent log.
    pub fn take_sent(&self) -> Vec<SentDatagram> {
        std::mem::take(&mut self.lock().sent)
    }

    /// Datagrams waiting in `ip`'s inbox.
    pub fn pending(&self, ip: Ipv4Addr) -> usize {
        self.lock().inboxes.get(&ip).map(VecDeque::len).unwrap_or(0)
    }
}

/// One node's endpoint on a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    ip: Ipv4Addr,
}

impl MemoryTransport {
    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

impl Transport for MemoryTransport {
    fn send_to(&mut self, to: Ipv4Addr, data: &[u8]) -> Result<()> {
        self.network.lock().deliver(self.ip, to, data);
        Ok(())
    }

    fn try_recv(&mut self) -> Option<Datagram> {
        self.network
            .lock()
            .inboxes
            .get_mut(&self.ip)
            .and_then(VecDeque::pop_front)
    }
}
