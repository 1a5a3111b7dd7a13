//! Secret mode: weak shared-secret authentication.
//!
//! The hash a node sends is `crc32(secret + our_ip)`, where `our_ip` is our
//! address on the subnet of the peer we are talking to. The receiver checks it
//! by computing `crc32(secret + sender_ip)` from the datagram's source
//! address, so both sides agree without exchanging addresses.
//!
//! A hash of `0` means "not attempted". This is a checksum, not a keyed MAC,
//! and must stay that way to interoperate with existing nodes.

use crate::checksum::crc32;
use crate::interfaces::InterfaceDirectory;
use std::net::Ipv4Addr;

/// Process-wide secret mode settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthConfig {
    enabled: bool,
    secret: String,
}

impl AuthConfig {
    /// Secret mode with the given key.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            enabled: true,
            secret: secret.into(),
        }
    }

    pub fn enable(&mut self, secret: impl Into<String>) {
        self.enabled = true;
        self.secret = secret.into();
    }

    /// Turn secret mode off. The key is kept for verifying peers that still
    /// send a non-zero hash.
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Checksum of `secret + address`.
    ///
    /// `address` is the dotted-quad text, or empty when unknown.
    pub fn make_hash(&self, address: &str) -> u32 {
        let mut src = String::with_capacity(self.secret.len() + address.len());
        src.push_str(&self.secret);
        src.push_str(address);
        crc32(src.as_bytes())
    }

    /// Hash to put in a Request or Response sent towards `target`.
    ///
    /// Zero when secret mode is off.
    pub fn outgoing_hash(&self, interfaces: &InterfaceDirectory, target: Ipv4Addr) -> u32 {
        if !self.enabled {
            return 0;
        }
        let self_ip = interfaces
            .self_ip_for(target)
            .map(|ip| ip.to_string())
            .unwrap_or_default();
        self.make_hash(&self_ip)
    }

    /// Whether a handshake carrying `hash` from `remote` passes.
    ///
    /// Checked whenever secret mode is on or the peer attempted a hash.
    pub fn accepts(&self, hash: u32, remote: Ipv4Addr) -> bool {
        if !self.enabled && hash == 0 {
            return true;
        }
        hash == self.make_hash(&remote.to_string())
    }
}
