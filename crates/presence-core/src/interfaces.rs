//! Snapshot of this host's IPv4 interfaces.
//!
//! Enumeration itself is platform work done by the embedding application
//! (the daemon uses `get_if_addrs`). The core only needs the resulting list to
//! answer "is this address mine?" and "which of my addresses shares a subnet
//! with that peer?".

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// One local IPv4 interface, captured once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfInterface {
    /// Interface name (e.g. "en0")
    pub name: String,
    /// Address assigned to the interface
    pub ip: Ipv4Addr,
    /// Subnet mask
    pub netmask: Ipv4Addr,
    /// Broadcast address, if the interface supports broadcast
    pub broadcast: Option<Ipv4Addr>,
}

impl SelfInterface {
    pub fn new(
        name: impl Into<String>,
        ip: Ipv4Addr,
        netmask: Ipv4Addr,
        broadcast: Option<Ipv4Addr>,
    ) -> Self {
        Self {
            name: name.into(),
            ip,
            netmask,
            broadcast,
        }
    }

    /// Check whether `hint` lies in this interface's subnet.
    pub fn is_in_same_network(&self, hint: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask);
        u32::from(self.ip) & mask == u32::from(hint) & mask
    }
}

/// Read-only list of local interfaces.
///
/// An empty directory is valid: it is what enumeration failure degrades to.
/// Self-filtering and secret mode then lose their self-knowledge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceDirectory {
    interfaces: Vec<SelfInterface>,
}

impl InterfaceDirectory {
    pub fn new(interfaces: Vec<SelfInterface>) -> Self {
        Self { interfaces }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn interfaces(&self) -> &[SelfInterface] {
        &self.interfaces
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }

    /// True iff `ip` is the address of one of our interfaces.
    pub fn is_self_ip(&self, ip: Ipv4Addr) -> bool {
        self.interfaces.iter().any(|i| i.ip == ip)
    }

    /// Our address on the subnet that `hint` belongs to.
    ///
    /// The first interface (in enumeration order) whose subnet contains
    /// `hint` wins.
    pub fn self_ip_for(&self, hint: Ipv4Addr) -> Option<Ipv4Addr> {
        self.interfaces
            .iter()
            .find(|i| i.is_in_same_network(hint))
            .map(|i| i.ip)
    }

    /// Broadcast addresses of every interface that has one.
    pub fn broadcast_targets(&self) -> Vec<Ipv4Addr> {
        self.interfaces.iter().filter_map(|i| i.broadcast).collect()
    }
}

impl From<Vec<SelfInterface>> for InterfaceDirectory {
    fn from(interfaces: Vec<SelfInterface>) -> Self {
        Self::new(interfaces)
    }
}
