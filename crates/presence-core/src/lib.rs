//! presence-core: zero-configuration LAN peer discovery and presence.
//!
//! This crate provides:
//! - The request/response handshake with group filtering and secret mode
//! - A membership table with lifecycle events (found, lost, reconnected, ...)
//! - Per-peer heartbeat timers for liveness
//! - A relay that hands non-protocol messages to applications
//! - A Transport trait with an in-memory network for tests
//!
//! The engine is sans-IO: the host drives it with [`DiscoveryEngine::tick`].

pub mod auth;
pub mod checksum;
pub mod config;
pub mod discovery;
pub mod events;
pub mod heartbeat;
pub mod interfaces;
pub mod membership;
pub mod message;
pub mod relay;
pub mod replicated;
pub mod transport;

pub use auth::AuthConfig;
pub use config::{ConfigError, NodeConfig};
pub use discovery::DiscoveryEngine;
pub use events::{EventBus, NodeEvent, NodeEventKind, Subscription};
pub use heartbeat::{HeartbeatConfig, HeartbeatScheduler};
pub use interfaces::{InterfaceDirectory, SelfInterface};
pub use membership::{LivenessState, MembershipTable, Peer, PeerAddress};
pub use message::{Arg, CodecError, Message, Namespace, ProtocolMessage, DEFAULT_PREFIX};
pub use relay::{MessageRelay, RelayedMessage};
pub use replicated::ReplicatedValue;
pub use transport::{Datagram, MemoryNetwork, MemoryTransport, Transport, TransportError};
