//! Multi-node scenarios over the in-memory network.
//!
//! Every node is ticked in lockstep with explicit elapsed times, so heartbeat
//! timing is exact: a datagram sent during one step is handled on the next.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use presence_core::{
    Arg, DiscoveryEngine, HeartbeatConfig, LivenessState, MemoryNetwork, MemoryTransport, Message,
    NodeConfig, NodeEventKind, ReplicatedValue,
};

const A: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 1);
const B: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 2);
const C: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 3);

const STEP: Duration = Duration::from_millis(100);

type Node = DiscoveryEngine<MemoryTransport>;

struct Cluster {
    net: MemoryNetwork,
    nodes: Vec<Node>,
}

impl Cluster {
    fn new() -> Self {
        Self {
            net: MemoryNetwork::default(),
            nodes: Vec::new(),
        }
    }

    fn add(&mut self, ip: Ipv4Addr, config: NodeConfig) -> usize {
        let node = DiscoveryEngine::new(config, self.net.interfaces(ip), self.net.attach(ip));
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    fn add_named(&mut self, ip: Ipv4Addr, name: &str, groups: &[&str]) -> usize {
        self.add(ip, config(name, groups))
    }

    /// Tick every node once with `elapsed`.
    fn step(&mut self, elapsed: Duration) {
        for node in &mut self.nodes {
            node.tick(elapsed);
        }
    }

    /// Run for `total` in fixed steps.
    fn run(&mut self, total: Duration) {
        let mut t = Duration::ZERO;
        while t < total {
            self.step(STEP);
            t += STEP;
        }
    }

    /// Let the handshake settle without advancing time.
    fn settle(&mut self) {
        for _ in 0..3 {
            self.step(Duration::ZERO);
        }
    }

    fn kinds(&mut self, index: usize) -> Vec<NodeEventKind> {
        self.nodes[index]
            .drain_events()
            .into_iter()
            .map(|e| e.kind)
            .collect()
    }
}

fn config(name: &str, groups: &[&str]) -> NodeConfig {
    NodeConfig {
        name: name.to_string(),
        groups: groups.iter().map(|g| g.to_string()).collect(),
        ..NodeConfig::default()
    }
}

fn state_of(node: &Node, address: Ipv4Addr) -> Option<LivenessState> {
    node.peer(&address).map(|p| p.state)
}

// ==================== Group Filtering ====================

#[test]
fn test_request_finds_only_matching_groups() {
    let mut cluster = Cluster::new();
    let a = cluster.add_named(A, "a", &["g1"]);
    let b = cluster.add_named(B, "b", &["g1", "g2"]);
    let c = cluster.add_named(C, "c", &["g3"]);

    cluster.nodes[a].request(None);
    cluster.settle();

    let peers_a: Vec<_> = cluster.nodes[a].peers().into_iter().map(|p| p.address).collect();
    assert_eq!(peers_a, [B]);
    assert_eq!(cluster.nodes[a].peer(&B).map(|p| p.name.clone()), Some("b".into()));
    assert!(cluster.nodes[b].peer(&A).is_some());
    assert!(cluster.nodes[c].peers().is_empty());

    assert_eq!(cluster.kinds(a), [NodeEventKind::Found]);
    assert_eq!(cluster.kinds(b), [NodeEventKind::Found]);
    assert!(cluster.kinds(c).is_empty());
}

#[test]
fn test_empty_groups_match_each_other() {
    let mut cluster = Cluster::new();
    let a = cluster.add_named(A, "a", &[]);
    let b = cluster.add_named(B, "b", &[]);
    let c = cluster.add_named(C, "c", &["g1"]);

    cluster.nodes[a].request(None);
    cluster.settle();

    assert!(cluster.nodes[a].peer(&B).is_some());
    assert!(cluster.nodes[a].peer(&C).is_none());
    assert!(cluster.nodes[b].peer(&A).is_some());
    assert!(cluster.nodes[c].peers().is_empty());
}

#[test]
fn test_mutual_requests_answered_exactly_once() {
    let mut cluster = Cluster::new();
    let a = cluster.add_named(A, "a", &["g1"]);
    let b = cluster.add_named(B, "b", &["g1"]);
    let c = cluster.add_named(C, "c", &["g2"]);

    for node in &mut cluster.nodes {
        node.request(None);
    }
    cluster.settle();

    let responses: Vec<(Ipv4Addr, Ipv4Addr)> = cluster
        .net
        .sent()
        .into_iter()
        .filter(|d| {
            Message::from_bytes(&d.data)
                .map(|m| m.address == "/ofxSearchNetworkNode/response")
                .unwrap_or(false)
        })
        .map(|d| (d.from, d.to))
        .collect();
    let count = |from, to| responses.iter().filter(|r| **r == (from, to)).count();

    assert_eq!(count(A, B), 1);
    assert_eq!(count(B, A), 1);
    assert_eq!(responses.len(), 2);
    assert!(responses.iter().all(|(from, to)| *from != C && *to != C));

    assert_eq!(cluster.kinds(a), [NodeEventKind::Found]);
    assert_eq!(cluster.kinds(b), [NodeEventKind::Found]);
    assert!(cluster.kinds(c).is_empty());
    assert!(cluster.nodes[c].peers().is_empty());
}

#[test]
fn test_group_change_seen_as_property_change() {
    let mut cluster = Cluster::new();
    let a = cluster.add_named(A, "a", &["g1"]);
    let b = cluster.add_named(B, "b", &["g1"]);

    cluster.nodes[a].request(None);
    cluster.settle();
    cluster.kinds(a);
    cluster.kinds(b);

    cluster.nodes[a].add_groups("g2");
    cluster.nodes[a].request(None);
    cluster.settle();

    assert_eq!(cluster.kinds(b), [NodeEventKind::PropertyChanged]);
    let groups: Vec<String> = cluster.nodes[b]
        .peer(&A)
        .map(|p| p.groups.iter().cloned().collect())
        .unwrap_or_default();
    assert_eq!(groups, ["g1", "g2"]);
    // b's own advertisement did not change
    assert!(cluster.kinds(a).is_empty());
}

// ==================== Secret Mode ====================

#[test]
fn test_wrong_secret_is_silent() {
    let mut cluster = Cluster::new();
    let a = cluster.add(
        A,
        NodeConfig {
            secret: Some("alpha".into()),
            ..config("a", &[])
        },
    );
    let b = cluster.add(
        B,
        NodeConfig {
            secret: Some("beta".into()),
            ..config("b", &[])
        },
    );

    cluster.nodes[a].request(None);
    cluster.net.take_sent();
    cluster.settle();

    // b sends nothing back: indistinguishable from a lost request
    assert!(cluster.net.sent().is_empty());
    assert!(cluster.nodes[a].peers().is_empty());
    assert!(cluster.nodes[b].peers().is_empty());
}

#[test]
fn test_shared_secret_handshake() {
    let mut cluster = Cluster::new();
    let secret = NodeConfig {
        secret: Some("s3cret".into()),
        ..NodeConfig::default()
    };
    let a = cluster.add(A, NodeConfig { name: "a".into(), ..secret.clone() });
    let b = cluster.add(B, NodeConfig { name: "b".into(), ..secret });

    cluster.nodes[a].request(None);
    cluster.settle();

    assert!(cluster.nodes[a].peer(&B).is_some());
    assert!(cluster.nodes[b].peer(&A).is_some());
}

// ==================== Heartbeats ====================

#[test]
fn test_heartbeats_keep_peer_active() {
    let mut cluster = Cluster::new();
    let a = cluster.add_named(A, "a", &[]);
    let b = cluster.add_named(B, "b", &[]);

    cluster.nodes[a].request(None);
    cluster.settle();
    cluster.kinds(a);
    cluster.kinds(b);

    cluster.run(Duration::from_secs(30));

    assert_eq!(state_of(&cluster.nodes[a], B), Some(LivenessState::Active));
    assert_eq!(state_of(&cluster.nodes[b], A), Some(LivenessState::Active));
    assert!(cluster.kinds(a).is_empty());
    assert!(cluster.kinds(b).is_empty());
}

#[test]
fn test_silence_past_timeout_loses_peer_once() {
    let mut cluster = Cluster::new();
    let a = cluster.add_named(A, "a", &[]);
    let _b = cluster.add_named(B, "b", &[]);

    cluster.nodes[a].request(None);
    cluster.settle();
    cluster.run(Duration::from_secs(2));
    cluster.kinds(a);

    cluster.net.unplug(B);

    // last heartbeat is at most ~1.1s old here
    cluster.run(Duration::from_millis(1500));
    assert_eq!(state_of(&cluster.nodes[a], B), Some(LivenessState::Active));

    cluster.run(Duration::from_millis(2000));
    assert_eq!(state_of(&cluster.nodes[a], B), Some(LivenessState::Lost));

    cluster.run(Duration::from_secs(10));
    assert_eq!(cluster.kinds(a), [NodeEventKind::Lost]);
    // Lost peers stay in the table
    assert_eq!(cluster.nodes[a].peers().len(), 1);
    assert_eq!(cluster.nodes[a].membership().active_peers().count(), 0);
}

#[test]
fn test_lost_peer_reconnects_on_heartbeat() {
    let mut cluster = Cluster::new();
    let a = cluster.add_named(A, "a", &[]);
    let b = cluster.add_named(B, "b", &[]);

    cluster.nodes[a].request(None);
    cluster.settle();
    cluster.net.unplug(B);
    cluster.run(Duration::from_secs(5));
    assert_eq!(state_of(&cluster.nodes[a], B), Some(LivenessState::Lost));
    assert_eq!(state_of(&cluster.nodes[b], A), Some(LivenessState::Lost));
    cluster.kinds(a);
    cluster.kinds(b);

    cluster.net.plug(B);
    cluster.run(Duration::from_secs(2));

    assert_eq!(state_of(&cluster.nodes[a], B), Some(LivenessState::Active));
    assert_eq!(state_of(&cluster.nodes[b], A), Some(LivenessState::Active));
    assert_eq!(cluster.kinds(a), [NodeEventKind::Reconnected]);
    assert_eq!(cluster.kinds(b), [NodeEventKind::Reconnected]);
}

#[test]
fn test_lost_peer_reconnects_on_handshake() {
    let mut cluster = Cluster::new();
    let a = cluster.add_named(A, "a", &[]);
    let b = cluster.add(
        B,
        NodeConfig {
            heartbeat: HeartbeatConfig::disabled(),
            ..config("b", &[])
        },
    );

    cluster.nodes[a].request(None);
    cluster.settle();
    cluster.net.unplug(B);
    cluster.run(Duration::from_secs(5));
    assert_eq!(state_of(&cluster.nodes[a], B), Some(LivenessState::Lost));
    cluster.kinds(a);

    cluster.net.plug(B);
    cluster.nodes[b].request(None);
    cluster.settle();

    assert_eq!(cluster.kinds(a), [NodeEventKind::Reconnected]);
    assert_eq!(state_of(&cluster.nodes[a], B), Some(LivenessState::Active));
}

#[test]
fn test_heartbeats_off_never_lose_peers() {
    let mut cluster = Cluster::new();
    let off = NodeConfig {
        heartbeat: HeartbeatConfig::disabled(),
        ..NodeConfig::default()
    };
    let a = cluster.add(A, NodeConfig { name: "a".into(), ..off.clone() });
    let b = cluster.add(B, NodeConfig { name: "b".into(), ..off });

    cluster.nodes[a].request(None);
    cluster.settle();
    cluster.net.take_sent();
    cluster.net.unplug(B);
    cluster.run(Duration::from_secs(10));

    // nobody asked for heartbeats, so nothing is sent
    assert!(cluster.net.sent().is_empty());
    assert_eq!(state_of(&cluster.nodes[a], B), Some(LivenessState::Active));
    assert_eq!(state_of(&cluster.nodes[b], A), Some(LivenessState::Active));
}

#[test]
fn test_custom_heartbeat_interval() {
    let mut cluster = Cluster::new();
    let a = cluster.add(
        A,
        NodeConfig {
            heartbeat: HeartbeatConfig {
                required: true,
                request_interval: Duration::from_millis(500),
                timeout: Duration::from_secs(1),
            },
            ..config("a", &[])
        },
    );
    let _b = cluster.add_named(B, "b", &[]);

    cluster.nodes[a].request(None);
    cluster.settle();
    cluster.run(Duration::from_secs(10));

    // b heartbeats a every 500ms, well inside a's 1s timeout
    assert_eq!(state_of(&cluster.nodes[a], B), Some(LivenessState::Active));
}

// ==================== Disconnect ====================

#[test]
fn test_disconnect_notifies_every_peer() {
    let mut cluster = Cluster::new();
    let a = cluster.add_named(A, "a", &[]);
    let b = cluster.add_named(B, "b", &[]);
    let c = cluster.add_named(C, "c", &[]);

    cluster.nodes[a].request(None);
    cluster.settle();
    assert_eq!(cluster.nodes[a].peers().len(), 2);
    for i in [a, b, c] {
        cluster.kinds(i);
    }

    cluster.nodes[a].disconnect();
    assert!(cluster.nodes[a].peers().is_empty());
    cluster.settle();

    assert!(cluster.nodes[b].peer(&A).is_none());
    assert!(cluster.nodes[c].peer(&A).is_none());
    assert_eq!(cluster.kinds(b), [NodeEventKind::Disconnected]);
    assert_eq!(cluster.kinds(c), [NodeEventKind::Disconnected]);

    // no timers left behind on either side
    cluster.run(Duration::from_secs(10));
    assert!(cluster.kinds(b).is_empty());
    assert!(cluster.kinds(c).is_empty());
}

#[test]
fn test_disconnect_while_unplugged_still_clears_locally() {
    let mut cluster = Cluster::new();
    let a = cluster.add_named(A, "a", &[]);
    let b = cluster.add_named(B, "b", &[]);

    cluster.nodes[a].request(None);
    cluster.settle();
    cluster.net.unplug(A);

    cluster.nodes[a].disconnect();
    cluster.settle();

    assert!(cluster.nodes[a].peers().is_empty());
    assert!(cluster.nodes[b].peer(&A).is_some());
}

// ==================== Relay ====================

#[test]
fn test_application_messages_are_relayed() {
    let mut cluster = Cluster::new();
    let a = cluster.add_named(A, "a", &[]);
    let b = cluster.add_named(B, "b", &[]);

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let _sub = cluster.nodes[b].subscribe_address("/message", move |msg| {
        sink.lock().unwrap().push((msg.sender, msg.args));
    });

    cluster.nodes[a].request(None);
    cluster.settle();

    cluster.nodes[a].broadcast_message(&Message::new("/message").with_arg("hello"));
    cluster.nodes[a].broadcast_message(&Message::new("/other").with_arg(1));
    cluster.settle();

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0, A);
    assert_eq!(received[0].1, vec![Arg::Str("hello".into())]);
    assert_eq!(cluster.nodes[b].relay().delivered(), 2);
}

#[test]
fn test_relay_does_not_require_membership() {
    let mut cluster = Cluster::new();
    let a = cluster.add_named(A, "a", &[]);
    let b = cluster.add_named(B, "b", &[]);

    let count = Arc::new(Mutex::new(0));
    let sink = Arc::clone(&count);
    let _sub = cluster.nodes[b].subscribe_messages(move |_| *sink.lock().unwrap() += 1);

    cluster.nodes[a].send_message(B, &Message::new("/ping"));
    cluster.settle();

    assert_eq!(*count.lock().unwrap(), 1);
    assert!(cluster.nodes[b].peers().is_empty());
}

// ==================== Sleep ====================

#[test]
fn test_sleeping_node_resumes_where_it_left_off() {
    let mut cluster = Cluster::new();
    let a = cluster.add_named(A, "a", &[]);
    let b = cluster.add_named(B, "b", &[]);

    cluster.nodes[a].request(None);
    cluster.settle();
    cluster.kinds(a);

    cluster.nodes[a].sleep();
    cluster.run(Duration::from_secs(10));
    // asleep: no timers advanced, so b is not lost
    assert_eq!(state_of(&cluster.nodes[a], B), Some(LivenessState::Active));
    // b did lose a while it was silent
    assert_eq!(state_of(&cluster.nodes[b], A), Some(LivenessState::Lost));

    // queued heartbeats from b are drained before a's timers advance
    cluster.nodes[a].awake();
    cluster.step(STEP);
    assert_eq!(state_of(&cluster.nodes[a], B), Some(LivenessState::Active));
    assert!(cluster.kinds(a).is_empty());
}

// ==================== Replication ====================

#[test]
fn test_replicated_value_across_three_nodes() {
    let mut cluster = Cluster::new();
    let a = cluster.add_named(A, "a", &[]);
    let b = cluster.add_named(B, "b", &[]);
    let c = cluster.add_named(C, "c", &[]);

    let va = ReplicatedValue::attach(&cluster.nodes[a], "volume", 0.8f32);
    let vb = ReplicatedValue::attach(&cluster.nodes[b], "volume", 0.0f32);
    let vc = ReplicatedValue::attach(&cluster.nodes[c], "volume", 0.0f32);

    cluster.nodes[a].request(None);
    cluster.settle();

    assert_eq!(va.sync(&mut cluster.nodes[a]).unwrap(), 2);
    cluster.settle();
    assert_eq!(vb.remote(&A), Some(0.8));
    assert_eq!(vc.remote(&A), Some(0.8));

    va.set(0.25);
    va.sync(&mut cluster.nodes[a]).unwrap();
    cluster.settle();
    assert_eq!(vb.remote(&A), Some(0.25));
    assert_eq!(vc.remote(&A), Some(0.25));
}
