//! Local interface enumeration.

use get_if_addrs::{IfAddr, Interface};
use presence_core::{InterfaceDirectory, SelfInterface};
use tracing::{debug, warn};

/// IPv4 interfaces of this host. Empty (with a warning) if enumeration fails.
pub fn enumerate() -> InterfaceDirectory {
    match get_if_addrs::get_if_addrs() {
        Ok(interfaces) => from_interfaces(interfaces),
        Err(e) => {
            warn!("Failed to enumerate network interfaces: {}", e);
            InterfaceDirectory::empty()
        }
    }
}

fn from_interfaces(interfaces: Vec<Interface>) -> InterfaceDirectory {
    let entries: Vec<SelfInterface> = interfaces
        .into_iter()
        .filter_map(|iface| match iface.addr {
            IfAddr::V4(v4) => {
                debug!(
                    "Interface {}: {}/{} broadcast {:?}",
                    iface.name, v4.ip, v4.netmask, v4.broadcast
                );
                Some(SelfInterface::new(iface.name, v4.ip, v4.netmask, v4.broadcast))
            }
            IfAddr::V6(_) => None,
        })
        .collect();
    InterfaceDirectory::new(entries)
}
