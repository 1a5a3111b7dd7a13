//! Membership table: the authoritative set of known peers.
//!
//! Peers are keyed by their source address. An entry exists only after a
//! successful handshake and until it is explicitly removed; there is no
//! "unknown" state in the table. Liveness is either Active or Lost.

use crate::events::{NodeEvent, NodeEventKind};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

/// Address that identifies a peer.
pub type PeerAddress = Ipv4Addr;

/// Liveness of a known peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LivenessState {
    /// Heard from within the heartbeat timeout
    Active,
    /// Heartbeat timeout expired
    Lost,
}

/// A known peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    /// Source address of the peer's datagrams
    pub address: PeerAddress,
    /// Advertised display name
    pub name: String,
    /// Advertised groups
    pub groups: BTreeSet<String>,
    /// Current liveness
    pub state: LivenessState,
}

impl Peer {
    pub fn is_active(&self) -> bool {
        self.state == LivenessState::Active
    }

    pub fn is_lost(&self) -> bool {
        self.state == LivenessState::Lost
    }

    fn same_properties(&self, name: &str, groups: &BTreeSet<String>) -> bool {
        self.name == name && &self.groups == groups
    }
}

/// Known peers indexed by address.
#[derive(Debug, Default)]
pub struct MembershipTable {
    peers: BTreeMap<PeerAddress, Peer>,
}

impl MembershipTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a peer after an accepted handshake.
    ///
    /// Returns the lifecycle event this causes, if any:
    /// - absent: inserted Active, `Found`
    /// - Lost: fields overwritten, Active again, `Reconnected`
    /// - Active with different name or groups: overwritten, `PropertyChanged`
    /// - Active and unchanged: no event
    pub fn register(
        &mut self,
        address: PeerAddress,
        name: &str,
        groups: BTreeSet<String>,
    ) -> Option<NodeEvent> {
        match self.peers.get_mut(&address) {
            None => {
                let peer = Peer {
                    address,
                    name: name.to_string(),
                    groups,
                    state: LivenessState::Active,
                };
                self.peers.insert(address, peer.clone());
                Some(NodeEvent::new(NodeEventKind::Found, peer))
            }
            Some(existing) if existing.is_lost() => {
                existing.name = name.to_string();
                existing.groups = groups;
                existing.state = LivenessState::Active;
                Some(NodeEvent::new(NodeEventKind::Reconnected, existing.clone()))
            }
            Some(existing) => {
                if existing.same_properties(name, &groups) {
                    return None;
                }
                existing.name = name.to_string();
                existing.groups = groups;
                Some(NodeEvent::new(NodeEventKind::PropertyChanged, existing.clone()))
            }
        }
    }

    /// Mark a peer Lost. Returns `Lost` only on the Active → Lost transition.
    pub fn mark_lost(&mut self, address: PeerAddress) -> Option<NodeEvent> {
        let peer = self.peers.get_mut(&address)?;
        if peer.is_lost() {
            return None;
        }
        peer.state = LivenessState::Lost;
        Some(NodeEvent::new(NodeEventKind::Lost, peer.clone()))
    }

    /// Mark a Lost peer Active again. Returns `Reconnected` only on the
    /// Lost → Active transition.
    pub fn mark_reconnected(&mut self, address: PeerAddress) -> Option<NodeEvent> {
        let peer = self.peers.get_mut(&address)?;
        if peer.is_active() {
            return None;
        }
        peer.state = LivenessState::Active;
        Some(NodeEvent::new(NodeEventKind::Reconnected, peer.clone()))
    }

    /// Remove a peer. Returns `Disconnected` carrying the removed entry.
    pub fn remove(&mut self, address: PeerAddress) -> Option<NodeEvent> {
        self.peers
            .remove(&address)
            .map(|peer| NodeEvent::new(NodeEventKind::Disconnected, peer))
    }

    /// Remove every peer. Returns one `Disconnected` per removed entry.
    pub fn drain(&mut self) -> Vec<NodeEvent> {
        std::mem::take(&mut self.peers)
            .into_values()
            .map(|peer| NodeEvent::new(NodeEventKind::Disconnected, peer))
            .collect()
    }

    pub fn get(&self, address: &PeerAddress) -> Option<&Peer> {
        self.peers.get(address)
    }

    pub fn contains(&self, address: &PeerAddress) -> bool {
        self.peers.contains_key(address)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn addresses(&self) -> impl Iterator<Item = PeerAddress> + '_ {
        self.peers.keys().copied()
    }

    pub fn active_peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values().filter(|p| p.is_active())
    }

    /// Owned copy of the table, ordered by address.
    pub fn snapshot(&self) -> Vec<Peer> {
        self.peers.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
