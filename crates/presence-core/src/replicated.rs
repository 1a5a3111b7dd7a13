//! A value replicated to every peer.
//!
//! Built only from the public node surface: lifecycle events tell it who to
//! push to, and the relay carries the value under
//! `/ofxSNNParamSync/<name>/set` as a single bincode blob.

use crate::discovery::DiscoveryEngine;
use crate::events::{NodeEventKind, Subscription};
use crate::membership::PeerAddress;
use crate::message::{Arg, CodecError, Message};
use crate::transport::Transport;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Relay address for a replicated value called `name`.
pub fn param_address(name: &str) -> String {
    format!("/ofxSNNParamSync/{}/set", name)
}

#[derive(Debug)]
struct State<T> {
    local: T,
    dirty: bool,
    /// Last value received from each peer
    remotes: BTreeMap<PeerAddress, T>,
    /// Peers that have not been sent our current value yet
    pending: BTreeSet<PeerAddress>,
}

/// One named value, kept in sync with every peer running the same name.
///
/// Dropping it unsubscribes from the node.
pub struct ReplicatedValue<T> {
    address: String,
    state: Arc<RwLock<State<T>>>,
    _events: Subscription,
    _messages: Subscription,
}

impl<T> ReplicatedValue<T>
where
    T: Serialize + DeserializeOwned + Clone + Default + Send + Sync + 'static,
{
    /// Start replicating `initial` under `name` on `engine`.
    ///
    /// Peers already known get a slot and are queued for the next `sync`.
    pub fn attach<X: Transport>(engine: &DiscoveryEngine<X>, name: &str, initial: T) -> Self {
        let address = param_address(name);

        let known: Vec<PeerAddress> = engine.membership().addresses().collect();
        let state = Arc::new(RwLock::new(State {
            local: initial,
            dirty: false,
            remotes: known.iter().map(|a| (*a, T::default())).collect(),
            pending: known.into_iter().collect(),
        }));

        let events = {
            let state = Arc::clone(&state);
            engine.subscribe(move |event| {
                let mut state = state.write().unwrap_or_else(|e| e.into_inner());
                let address = event.peer.address;
                match event.kind {
                    NodeEventKind::Found | NodeEventKind::Reconnected => {
                        state.remotes.entry(address).or_default();
                        state.pending.insert(address);
                    }
                    NodeEventKind::Disconnected => {
                        state.remotes.remove(&address);
                        state.pending.remove(&address);
                    }
                    NodeEventKind::PropertyChanged | NodeEventKind::Lost => {}
                }
            })
        };

        let messages = {
            let state = Arc::clone(&state);
            engine.subscribe_address(address.clone(), move |msg| {
                let value = match msg.args.first() {
                    Some(Arg::Blob(bytes)) => bincode::deserialize::<T>(bytes),
                    _ => {
                        warn!("Ignoring {} from {}: expected one blob", msg.address, msg.sender);
                        return;
                    }
                };
                match value {
                    Ok(value) => {
                        let mut state = state.write().unwrap_or_else(|e| e.into_inner());
                        match state.remotes.get_mut(&msg.sender) {
                            Some(slot) => *slot = value,
                            None => debug!("Ignoring {} from non-peer {}", msg.address, msg.sender),
                        }
                    }
                    Err(e) => warn!("Ignoring {} from {}: {}", msg.address, msg.sender, e),
                }
            })
        };

        Self {
            address,
            state,
            _events: events,
            _messages: messages,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Our current value.
    pub fn get(&self) -> T {
        self.read().local.clone()
    }

    /// Change our value. Peers see it after the next `sync`.
    pub fn set(&self, value: T) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.local = value;
        state.dirty = true;
    }

    /// Last value received from `peer`, or the default if it has a slot but
    /// sent nothing yet.
    pub fn remote(&self, peer: &PeerAddress) -> Option<T> {
        self.read().remotes.get(peer).cloned()
    }

    pub fn remotes(&self) -> BTreeMap<PeerAddress, T> {
        self.read().remotes.clone()
    }

    /// Push our value: to every known peer if it changed, otherwise only to
    /// peers that have not seen it. Returns the number of datagrams sent.
    pub fn sync<X: Transport>(&self, engine: &mut DiscoveryEngine<X>) -> Result<usize, CodecError> {
        let (bytes, targets) = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            let targets: Vec<PeerAddress> = if state.dirty {
                engine.membership().addresses().collect()
            } else {
                state.pending.iter().copied().collect()
            };
            if targets.is_empty() {
                state.dirty = false;
                return Ok(0);
            }
            let bytes =
                bincode::serialize(&state.local).map_err(|e| CodecError::Encode(e.to_string()))?;
            state.dirty = false;
            state.pending.clear();
            (bytes, targets)
        };

        let message = Message::new(self.address.clone()).with_arg(bytes);
        for target in &targets {
            engine.send_message(*target, &message);
        }
        Ok(targets.len())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, State<T>> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::transport::{MemoryNetwork, MemoryTransport};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    const A: Ipv4Addr = Ipv4Addr::new(10, 1, 1, 1);
    const B: Ipv4Addr = Ipv4Addr::new(10, 1, 1, 2);

    fn node(net: &MemoryNetwork, ip: Ipv4Addr) -> DiscoveryEngine<MemoryTransport> {
        let config = NodeConfig {
            name: ip.to_string(),
            ..NodeConfig::default()
        };
        DiscoveryEngine::new(config, net.interfaces(ip), net.attach(ip))
    }

    #[test]
    fn test_param_address() {
        assert_eq!(param_address("speed"), "/ofxSNNParamSync/speed/set");
    }

    #[test]
    fn test_found_peer_gets_slot_and_value() {
        let net = MemoryNetwork::default();
        let mut a = node(&net, A);
        let mut b = node(&net, B);
        let va = ReplicatedValue::attach(&a, "speed", 1.5f32);
        let vb = ReplicatedValue::attach(&b, "speed", 0.0f32);

        a.request(None);
        b.tick(Duration::ZERO);
        a.tick(Duration::ZERO);
        assert_eq!(va.remote(&B), Some(0.0));
        assert_eq!(vb.remote(&A), Some(0.0));

        assert_eq!(va.sync(&mut a).unwrap(), 1);
        assert_eq!(va.sync(&mut a).unwrap(), 0);
        b.tick(Duration::ZERO);
        assert_eq!(vb.remote(&A), Some(1.5));
    }

    #[test]
    fn test_set_pushes_to_all_peers() {
        let net = MemoryNetwork::default();
        let mut a = node(&net, A);
        let mut b = node(&net, B);
        let va = ReplicatedValue::attach(&a, "label", String::from("x"));
        let vb = ReplicatedValue::attach(&b, "label", String::new());

        a.request(None);
        b.tick(Duration::ZERO);
        a.tick(Duration::ZERO);
        va.sync(&mut a).unwrap();

        va.set("hello".into());
        assert_eq!(va.get(), "hello");
        assert_eq!(va.sync(&mut a).unwrap(), 1);
        b.tick(Duration::ZERO);
        assert_eq!(vb.remote(&A).as_deref(), Some("hello"));
    }

    #[test]
    fn test_disconnect_drops_slot() {
        let net = MemoryNetwork::default();
        let mut a = node(&net, A);
        let mut b = node(&net, B);
        a.request(None);
        b.tick(Duration::ZERO);
        a.tick(Duration::ZERO);

        // attached after the handshake: seeded from the table
        let va = ReplicatedValue::attach(&a, "n", 7u32);
        assert_eq!(va.remotes().len(), 1);

        b.disconnect();
        a.tick(Duration::ZERO);
        assert!(va.remote(&B).is_none());
        assert_eq!(va.sync(&mut a).unwrap(), 0);
    }

    #[test]
    fn test_value_from_non_peer_ignored() {
        let net = MemoryNetwork::default();
        let mut a = node(&net, A);
        let mut stranger = node(&net, B);
        let va = ReplicatedValue::attach(&a, "p", 0u32);

        let blob = bincode::serialize(&7u32).unwrap();
        stranger.send_message(A, &Message::new(param_address("p")).with_arg(blob));
        a.tick(Duration::ZERO);

        assert!(a.peers().is_empty());
        assert!(va.remotes().is_empty());
    }

    #[test]
    fn test_late_value_after_disconnect_ignored() {
        let net = MemoryNetwork::default();
        let mut a = node(&net, A);
        let mut b = node(&net, B);
        let va = ReplicatedValue::attach(&a, "p", 0u32);
        let vb = ReplicatedValue::attach(&b, "p", 5u32);

        a.request(None);
        b.tick(Duration::ZERO);
        a.tick(Duration::ZERO);
        assert!(va.remote(&B).is_some());

        // b queues its value, then leaves; the value arrives after the Disconnect
        b.disconnect();
        vb.set(9);
        let blob = bincode::serialize(&9u32).unwrap();
        b.send_message(A, &Message::new(param_address("p")).with_arg(blob));
        a.tick(Duration::ZERO);

        assert!(va.remote(&B).is_none());
        assert!(va.remotes().is_empty());
    }

    #[test]
    fn test_malformed_payload_ignored() {
        let net = MemoryNetwork::default();
        let mut a = node(&net, A);
        let mut b = node(&net, B);
        let va = ReplicatedValue::attach(&a, "n", 7u32);

        b.send_message(A, &Message::new(param_address("n")).with_arg("seven"));
        a.tick(Duration::ZERO);
        assert!(va.remote(&B).is_none());
    }
}
