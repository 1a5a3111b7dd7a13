//! presence-daemon library: exposes the native pieces for testing.
//!
//! The binary wires these to a [`presence_core::DiscoveryEngine`] and a tick
//! loop; integration tests use them directly.

pub mod chat;
pub mod interfaces;
pub mod udp;

pub use chat::{ChatCommand, CHAT_ADDRESS};
pub use udp::UdpTransport;

/// Port consuming applications listen on unless told otherwise.
pub const DEFAULT_PORT: u16 = 9000;
