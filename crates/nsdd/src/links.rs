//! Link-property provider: interface lookup and Wi-Fi link enumeration.
//!
//! The state machine consults this to turn a client-requested `Network`
//! into an OS interface index, and the lock manager feeds on the set of
//! Wi-Fi networks that need the multicast lock held. The shipped
//! implementation reads host interfaces via `netdev`; netIds have no
//! host-OS meaning, so a `Network(id)` is equated with the interface whose
//! OS index is `id`.

use nsd_core::types::Network;
use std::collections::HashSet;
use tracing::{debug, info};

/// What the state machine needs to know about the host's links.
pub trait LinkProvider: Send {
    /// Maps a network to its interface index, or `None` if the network has
    /// no usable interface (the request then fails immediately; a service
    /// registered there would be unreachable).
    fn interface_for(&mut self, network: Network) -> Option<u32>;

    /// The last modern request is gone; the provider may release its
    /// sockets once it observes no further activity.
    fn stop_when_inactive(&mut self);
}

/// Host-backed provider over `netdev`.
#[derive(Debug, Default)]
pub struct NetdevLinkProvider;

impl LinkProvider for NetdevLinkProvider {
    fn interface_for(&mut self, network: Network) -> Option<u32> {
        let wanted = u32::try_from(network.net_id()).ok()?;
        netdev::get_interfaces()
            .into_iter()
            .find(|iface| iface.index == wanted)
            .map(|iface| iface.index)
    }

    fn stop_when_inactive(&mut self) {
        debug!("socket monitor asked to stop when inactive");
    }
}

/// Scans host interfaces for Wi-Fi links that need the multicast lock:
/// wireless, up, and named (nameless tethering links need no lock, and
/// tunnel links are not Wi-Fi transports). The periodic watcher task
/// posts the result onto the state-machine queue.
pub fn scan_wifi_lock_required() -> HashSet<Network> {
    netdev::get_interfaces()
        .into_iter()
        .filter(|iface| {
            iface.is_up()
                && iface.if_type == netdev::interface::types::InterfaceType::Wireless80211
                && !iface.name.is_empty()
        })
        .map(|iface| Network::new(iface.index as i32))
        .collect()
}

/// Logs the Wi-Fi set once at startup so operators can see what the lock
/// manager will consider.
pub fn log_wifi_links(networks: &HashSet<Network>) {
    if networks.is_empty() {
        info!("no Wi-Fi links present, multicast lock will stay released");
    } else {
        info!(count = networks.len(), "Wi-Fi links requiring the multicast lock");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_netid_never_maps() {
        let mut provider = NetdevLinkProvider;
        assert_eq!(provider.interface_for(Network::new(-5)), None);
    }
}
