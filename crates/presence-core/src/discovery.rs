//! Discovery engine: handshake, secret mode, group filtering, liveness.
//!
//! # Protocol
//!
//! 1. `request()` sends a Request to every target (broadcast addresses by
//!    default) carrying the groups we are looking for and our advertisement.
//! 2. A node that accepts the Request (not itself, hash valid, groups
//!    overlap) registers the sender and answers with a unicast Response.
//! 3. The requester registers the responder on a valid Response.
//! 4. Each side that asked for heartbeats arms a recv timer per peer; each
//!    side that was asked arms a send timer and heartbeats immediately.
//! 5. Silence past the timeout makes a peer Lost; any later heartbeat or
//!    handshake brings it back (Reconnected).
//! 6. Disconnect removes the sender.
//!
//! Anything outside the protocol namespace goes to the relay.
//!
//! # Ticking
//!
//! The engine does nothing on its own. The host calls [`DiscoveryEngine::tick`]
//! periodically: all queued datagrams are dispatched first, in arrival order,
//! then heartbeat timers advance. A heartbeat received during a tick therefore
//! always resets its timer before that tick's timeout check.
//!
//! Remote input never produces an error. Rejected handshakes are dropped
//! without a reply; unexpected disconnects and heartbeats are logged.

use crate::auth::AuthConfig;
use crate::config::{ConfigError, NodeConfig, parse_targets, split_list};
use crate::events::{EventBus, NodeEvent, Subscription};
use crate::heartbeat::{HeartbeatAction, HeartbeatConfig, HeartbeatScheduler};
use crate::interfaces::InterfaceDirectory;
use crate::membership::{MembershipTable, Peer, PeerAddress};
use crate::message::{Advertisement, CodecError, Message, Namespace, ProtocolMessage};
use crate::relay::{MessageRelay, RelayedMessage};
use crate::transport::{Datagram, Transport};
use std::collections::{BTreeSet, VecDeque};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lifecycle events kept for [`DiscoveryEngine::drain_events`].
const MAX_PENDING_EVENTS: usize = 1024;

/// A discovery node bound to a transport.
pub struct DiscoveryEngine<T: Transport> {
    transport: T,
    interfaces: InterfaceDirectory,
    namespace: Namespace,
    name: String,
    groups: Vec<String>,
    targets: Vec<Ipv4Addr>,
    allow_loopback: bool,
    auth: AuthConfig,
    heartbeat: HeartbeatScheduler,
    membership: MembershipTable,
    relay: MessageRelay,
    events: Arc<EventBus<NodeEvent>>,
    pending_events: VecDeque<NodeEvent>,
    sleeping: bool,
}

impl<T: Transport> DiscoveryEngine<T> {
    /// Create an awake node.
    ///
    /// Without explicit targets, requests go to the broadcast address of
    /// every interface in `interfaces`.
    pub fn new(config: NodeConfig, interfaces: InterfaceDirectory, transport: T) -> Self {
        let targets = config
            .targets
            .clone()
            .unwrap_or_else(|| interfaces.broadcast_targets());
        if targets.is_empty() {
            warn!("No request targets: no broadcast interface found and none configured");
        }

        let mut auth = AuthConfig::default();
        if let Some(secret) = &config.secret {
            auth.enable(secret.clone());
        }

        let mut engine = Self {
            transport,
            interfaces,
            namespace: Namespace::new(config.prefix.clone()),
            name: config.resolved_name(),
            groups: Vec::new(),
            targets,
            allow_loopback: config.allow_loopback,
            auth,
            heartbeat: HeartbeatScheduler::new(config.heartbeat.clone()),
            membership: MembershipTable::new(),
            relay: MessageRelay::new(),
            events: Arc::new(EventBus::new()),
            pending_events: VecDeque::new(),
            sleeping: false,
        };
        engine.set_groups(config.groups);
        engine
    }

    // ==================== Configuration ====================

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Takes effect on the next Request or Response we send.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    /// Replace our groups. Duplicates and empty names are dropped.
    pub fn set_groups<I, S>(&mut self, groups: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups.clear();
        for group in groups {
            self.push_group(group.into());
        }
    }

    /// Add groups from a comma-separated list.
    pub fn add_groups(&mut self, list: &str) {
        for group in split_list(list) {
            self.push_group(group);
        }
    }

    fn push_group(&mut self, group: String) {
        if !group.is_empty() && !self.groups.contains(&group) {
            self.groups.push(group);
        }
    }

    pub fn targets(&self) -> &[Ipv4Addr] {
        &self.targets
    }

    /// Replace the request targets with a comma-separated address list.
    ///
    /// On error the current targets are kept.
    pub fn set_targets(&mut self, list: &str) -> Result<(), ConfigError> {
        self.targets = parse_targets(list)?;
        Ok(())
    }

    pub fn set_target_addrs(&mut self, targets: Vec<Ipv4Addr>) {
        self.targets = targets;
    }

    pub fn prefix(&self) -> &str {
        self.namespace.prefix()
    }

    pub fn set_prefix(&mut self, prefix: impl Into<String>) {
        self.namespace = Namespace::new(prefix);
    }

    pub fn allow_loopback(&self) -> bool {
        self.allow_loopback
    }

    pub fn set_allow_loopback(&mut self, allow: bool) {
        self.allow_loopback = allow;
    }

    pub fn enable_secret_mode(&mut self, key: impl Into<String>) {
        self.auth.enable(key);
    }

    pub fn disable_secret_mode(&mut self) {
        self.auth.disable();
    }

    pub fn is_secret_mode(&self) -> bool {
        self.auth.is_enabled()
    }

    pub fn heartbeat_config(&self) -> &HeartbeatConfig {
        self.heartbeat.config()
    }

    /// Change the heartbeat policy. Applies to peers registered from now on;
    /// recv timers freeze while `required` is false.
    pub fn set_heartbeat(&mut self, config: HeartbeatConfig) {
        self.heartbeat.set_config(config);
    }

    /// Stop participating in ticks. State and queued datagrams are kept.
    pub fn sleep(&mut self) {
        if !self.sleeping {
            debug!("Node sleeping");
            self.sleeping = true;
        }
    }

    pub fn awake(&mut self) {
        if self.sleeping {
            debug!("Node awake");
            self.sleeping = false;
        }
    }

    pub fn set_sleep(&mut self, sleep: bool) {
        if sleep { self.sleep() } else { self.awake() }
    }

    pub fn is_sleeping(&self) -> bool {
        self.sleeping
    }

    // ==================== Queries ====================

    pub fn interfaces(&self) -> &InterfaceDirectory {
        &self.interfaces
    }

    pub fn is_self_ip(&self, ip: Ipv4Addr) -> bool {
        self.interfaces.is_self_ip(ip)
    }

    /// Our address on `hint`'s subnet.
    pub fn self_ip_for(&self, hint: Ipv4Addr) -> Option<Ipv4Addr> {
        self.interfaces.self_ip_for(hint)
    }

    pub fn membership(&self) -> &MembershipTable {
        &self.membership
    }

    /// Snapshot of the peer table.
    pub fn peers(&self) -> Vec<Peer> {
        self.membership.snapshot()
    }

    pub fn peer(&self, address: &PeerAddress) -> Option<&Peer> {
        self.membership.get(address)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    // ==================== Events ====================

    /// Receive lifecycle events until the subscription is dropped.
    pub fn subscribe(
        &self,
        callback: impl Fn(NodeEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.events.subscribe(callback)
    }

    /// Receive relayed application messages.
    pub fn subscribe_messages(
        &self,
        callback: impl Fn(RelayedMessage) + Send + Sync + 'static,
    ) -> Subscription {
        self.relay.subscribe(callback)
    }

    /// Receive relayed application messages sent to `address`.
    pub fn subscribe_address(
        &self,
        address: impl Into<String>,
        callback: impl Fn(RelayedMessage) + Send + Sync + 'static,
    ) -> Subscription {
        self.relay.subscribe_address(address, callback)
    }

    pub fn relay(&self) -> &MessageRelay {
        &self.relay
    }

    /// Lifecycle events fired since the last drain, oldest first.
    pub fn drain_events(&mut self) -> Vec<NodeEvent> {
        self.pending_events.drain(..).collect()
    }

    fn emit(&mut self, event: NodeEvent) {
        info!(
            "Node {:?}: {} ({})",
            event.kind, event.peer.address, event.peer.name
        );
        if self.pending_events.len() >= MAX_PENDING_EVENTS {
            self.pending_events.pop_front();
        }
        self.pending_events.push_back(event.clone());
        self.events.emit(event);
    }

    // ==================== Sending ====================

    fn send_raw(&mut self, to: Ipv4Addr, message: &Message) {
        let bytes = match message.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode {} for {}: {}", message.address, to, e);
                return;
            }
        };
        if let Err(e) = self.transport.send_to(to, &bytes) {
            warn!("Failed to send {} to {}: {}", message.address, to, e);
        }
    }

    fn send_protocol(&mut self, to: Ipv4Addr, message: &ProtocolMessage) {
        let wire = self.namespace.encode(message);
        self.send_raw(to, &wire);
    }

    /// What we tell `target` about ourselves.
    fn advertisement(&self, target: Ipv4Addr) -> Advertisement {
        let config = self.heartbeat.config();
        Advertisement {
            hash: self.auth.outgoing_hash(&self.interfaces, target),
            name: self.name.clone(),
            groups: self.groups.clone(),
            heartbeat_required: config.required,
            heartbeat_interval: config.request_interval.as_secs_f32(),
        }
    }

    /// Send an application message to one address.
    pub fn send_message(&mut self, to: Ipv4Addr, message: &Message) {
        self.send_raw(to, message);
    }

    /// Send an application message to every known peer, Lost ones included.
    pub fn broadcast_message(&mut self, message: &Message) {
        let addresses: Vec<_> = self.membership.addresses().collect();
        for address in addresses {
            self.send_raw(address, message);
        }
    }

    // ==================== Handshake ====================

    /// Ask every target for peers in `groups` (our own groups if `None`).
    pub fn request(&mut self, groups: Option<&[String]>) {
        let filter = groups.map(<[String]>::to_vec).unwrap_or_else(|| self.groups.clone());
        let targets = self.targets.clone();
        debug!("Requesting groups {:?} from {} target(s)", filter, targets.len());
        for target in targets {
            self.send_request(target, filter.clone());
        }
    }

    /// Ask a single address, filtering by our own groups.
    pub fn request_to(&mut self, address: Ipv4Addr) {
        let filter = self.groups.clone();
        self.send_request(address, filter);
    }

    fn send_request(&mut self, target: Ipv4Addr, filter_groups: Vec<String>) {
        let message = ProtocolMessage::Request {
            filter_groups,
            advertisement: self.advertisement(target),
        };
        self.send_protocol(target, &message);
    }

    /// Groups match when they share a name or both sides have none.
    fn groups_match(&self, filter_groups: &[String]) -> bool {
        if filter_groups.is_empty() && self.groups.is_empty() {
            return true;
        }
        filter_groups.iter().any(|g| self.groups.contains(g))
    }

    fn on_request(&mut self, sender: Ipv4Addr, filter_groups: Vec<String>, adv: Advertisement) {
        if !self.allow_loopback && self.is_self_ip(sender) {
            debug!("Ignoring own request from {}", sender);
            return;
        }
        if !self.auth.accepts(adv.hash, sender) {
            debug!("Dropping request from {}: hash mismatch", sender);
            return;
        }
        if !self.groups_match(&filter_groups) {
            debug!(
                "Dropping request from {}: groups {:?} do not match {:?}",
                sender, filter_groups, self.groups
            );
            return;
        }

        // The Response must go out ahead of our first heartbeat.
        let response = ProtocolMessage::Response(self.advertisement(sender));
        self.send_protocol(sender, &response);
        self.register_node(sender, adv);
    }

    fn on_response(&mut self, sender: Ipv4Addr, adv: Advertisement) {
        if !self.auth.accepts(adv.hash, sender) {
            debug!("Dropping response from {}: hash mismatch", sender);
            return;
        }
        self.register_node(sender, adv);
    }

    fn register_node(&mut self, address: PeerAddress, adv: Advertisement) {
        let groups: BTreeSet<String> = adv.groups.into_iter().collect();
        if let Some(event) = self.membership.register(address, &adv.name, groups) {
            self.emit(event);
        }

        if self.heartbeat.config().required {
            self.heartbeat.arm_recv(address);
        }

        if adv.heartbeat_required {
            match Duration::try_from_secs_f32(adv.heartbeat_interval) {
                Ok(interval) => {
                    self.heartbeat.arm_send(address, interval);
                    self.send_protocol(address, &ProtocolMessage::Heartbeat);
                }
                Err(_) => warn!(
                    "Ignoring heartbeat request from {}: invalid interval {}",
                    address, adv.heartbeat_interval
                ),
            }
        }
    }

    // ==================== Leaving ====================

    fn on_disconnect(&mut self, sender: Ipv4Addr) {
        match self.membership.remove(sender) {
            Some(event) => {
                self.heartbeat.remove(&sender);
                self.emit(event);
            }
            None => warn!("received disconnect message from unknown node: {}", sender),
        }
    }

    /// Tell every known peer we are leaving, then forget them all.
    ///
    /// Local state is cleared whether or not the datagrams arrive.
    pub fn disconnect(&mut self) {
        let addresses: Vec<_> = self.membership.addresses().collect();
        info!("Disconnecting from {} peer(s)", addresses.len());
        for address in addresses {
            self.send_protocol(address, &ProtocolMessage::Disconnect);
        }
        self.flush();
    }

    /// Forget one peer and tell it we are leaving.
    pub fn disconnect_from(&mut self, address: Ipv4Addr) {
        match self.membership.remove(address) {
            Some(event) => {
                self.heartbeat.remove(&address);
                self.emit(event);
                self.send_protocol(address, &ProtocolMessage::Disconnect);
            }
            None => warn!("disconnect requested for unknown node: {}", address),
        }
    }

    /// Forget every peer and timer without telling anyone.
    ///
    /// Fires Disconnected for each removed peer.
    pub fn flush(&mut self) {
        for event in self.membership.drain() {
            self.emit(event);
        }
        self.heartbeat.clear();
    }

    // ==================== Liveness ====================

    fn on_heartbeat(&mut self, sender: Ipv4Addr) {
        if !self.heartbeat.reset_recv(&sender) {
            warn!("received heartbeat message from unknown node: {}", sender);
            return;
        }
        if let Some(event) = self.membership.mark_reconnected(sender) {
            self.emit(event);
        }
    }

    // ==================== Tick ====================

    /// Drain and dispatch every queued datagram, then advance heartbeat
    /// timers by `elapsed`. No-op while sleeping.
    pub fn tick(&mut self, elapsed: Duration) {
        if self.sleeping {
            return;
        }

        while let Some(datagram) = self.transport.try_recv() {
            self.dispatch(datagram);
        }

        for action in self.heartbeat.advance(elapsed) {
            match action {
                HeartbeatAction::Send(address) => {
                    self.send_protocol(address, &ProtocolMessage::Heartbeat);
                }
                HeartbeatAction::Expired(address) => {
                    if let Some(event) = self.membership.mark_lost(address) {
                        self.emit(event);
                    }
                }
            }
        }
    }

    /// Classify one datagram and run its handler to completion.
    pub fn dispatch(&mut self, datagram: Datagram) {
        let Datagram { from, data } = datagram;

        let message = match Message::from_bytes(&data) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping undecodable datagram from {}: {}", from, e);
                return;
            }
        };

        let address = message.address.clone();
        let classified = match self.namespace.decode(message, from) {
            Ok(classified) => classified,
            Err(CodecError::UnknownMethod(method)) => {
                debug!("Ignoring unknown method {:?} from {}", method, from);
                return;
            }
            Err(e) => {
                warn!("Dropping malformed {} from {}: {}", address, from, e);
                return;
            }
        };

        match classified {
            ProtocolMessage::Request {
                filter_groups,
                advertisement,
            } => self.on_request(from, filter_groups, advertisement),
            ProtocolMessage::Response(advertisement) => self.on_response(from, advertisement),
            ProtocolMessage::Disconnect => self.on_disconnect(from),
            ProtocolMessage::Heartbeat => self.on_heartbeat(from),
            ProtocolMessage::Application(relayed) => self.relay.deliver(relayed),
        }
    }
}
