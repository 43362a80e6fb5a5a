//! Modern in-process mDNS engine adapter.
//!
//! The state machine consumes the [`DiscoveryEngine`] trait; the shipped
//! implementation wraps the `mdns-sd` crate, which runs its own background
//! thread for multicast networking. Engine callbacks arrive on blocking
//! channels and are bridged into state-machine messages via
//! `spawn_blocking` pumps — nothing in this module mutates daemon state
//! directly.
//!
//! Event lowering lives here too: engine-level service descriptions carry
//! a label sequence that **must** terminate in `local`; anything else is
//! rejected loudly. The user-visible service-type string keeps historical
//! affordances: found/lost carry a trailing dot, resolution success a
//! leading dot, everything else the bare type.

use crate::app::AppMessage;
use mdns_sd::{IfKind, ServiceDaemon, ServiceEvent};
use nsd_core::escape::split_fullname;
use nsd_core::types::{
    attribute_network, Network, ServiceInfo, TransactionId, NETID_UNSET,
};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Opaque handle to one engine listener, stored on the request for
/// cancel-time dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

impl ListenerHandle {
    pub fn new(token: u64) -> Self {
        Self(token)
    }
}

/// Counters reported by the advertising side of the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdvertiserMetrics {
    pub registered_services: u32,
    pub conflicts: u32,
}

/// Engine-level description of a service, before lowering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdnsServiceInfo {
    /// Unescaped instance name.
    pub instance_name: String,
    /// Service-type labels including the terminal domain label, e.g.
    /// `["_ipp", "_tcp", "local"]`.
    pub type_labels: Vec<String>,
    pub port: u16,
    pub addresses: Vec<IpAddr>,
    pub txt: BTreeMap<String, Vec<u8>>,
    pub net_id: i32,
    pub interface_index: Option<u32>,
    /// Whether this answer was served from the engine's cache rather than
    /// fresh network traffic.
    pub is_from_cache: bool,
}

/// Events posted by the engine adapter onto the state-machine queue.
#[derive(Debug)]
pub enum EngineEvent {
    ServiceFound {
        tx: TransactionId,
        service: MdnsServiceInfo,
    },
    ServiceLost {
        tx: TransactionId,
        service: MdnsServiceInfo,
    },
    RegisterSucceeded {
        tx: TransactionId,
        /// Final (possibly conflict-renamed) instance name.
        service_name: String,
        hostname: String,
        /// Interface the advertisement went out on; keys the offload
        /// broadcast.
        interface: String,
    },
    RegisterFailed {
        tx: TransactionId,
    },
    /// The engine sent a query for this listener's selector.
    QuerySent {
        tx: TransactionId,
    },
}

/// Which callback an event is being lowered for; picks the historical
/// dot affordance on the type string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoweringKind {
    Found,
    Lost,
    ResolveSucceeded,
    Updated,
}

/// Lowers an engine-level service description into the user-visible form.
///
/// Returns `None` (logging loudly) when the label sequence does not
/// terminate in `local` — such records are malformed and never reach
/// clients.
pub fn lower_service_info(kind: LoweringKind, service: &MdnsServiceInfo) -> Option<ServiceInfo> {
    match service.type_labels.last().map(String::as_str) {
        Some("local") => {}
        other => {
            error!(
                labels = ?service.type_labels,
                terminal = ?other,
                "engine supplied a service type not terminating in 'local', dropping"
            );
            return None;
        }
    }
    let joined = service.type_labels[..service.type_labels.len() - 1].join(".");
    let service_type = match kind {
        LoweringKind::Found | LoweringKind::Lost => format!("{joined}."),
        LoweringKind::ResolveSucceeded => format!(".{joined}"),
        LoweringKind::Updated => joined,
    };

    let (network, interface_index) =
        attribute_network(service.net_id, service.interface_index);

    // Prefer an IPv4 address; fall back to the first IPv6.
    let host = service
        .addresses
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| service.addresses.first())
        .copied();

    Some(ServiceInfo {
        service_name: service.instance_name.clone(),
        service_type,
        port: service.port,
        host,
        network,
        interface_index,
        txt: service.txt.clone(),
    })
}

/// Errors from the engine; mapped to `INTERNAL_ERROR` at the client
/// boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("mdns engine error: {0}")]
    Engine(String),
}

/// The operations the state machine issues against the modern engine.
pub trait DiscoveryEngine: Send {
    /// Starts a listener for `selector` (a bare or subtype-qualified type)
    /// and associates its events with `tx`.
    fn register_listener(
        &mut self,
        selector: &str,
        network: Option<Network>,
        tx: TransactionId,
    ) -> Result<ListenerHandle, EngineError>;

    /// Tears a listener down; its events stop flowing.
    fn unregister_listener(&mut self, handle: ListenerHandle);

    /// Starts advertising a service; completion arrives as a
    /// `RegisterSucceeded`/`RegisterFailed` event.
    fn add_service(
        &mut self,
        tx: TransactionId,
        service: &ServiceInfo,
        interface_index: Option<u32>,
    ) -> Result<(), EngineError>;

    /// Withdraws an advertisement.
    fn remove_service(&mut self, tx: TransactionId);

    fn advertiser_metrics(&self) -> AdvertiserMetrics;

    /// Final teardown on daemon shutdown: withdraw everything still
    /// advertised and stop the engine's background machinery.
    fn shutdown(&mut self) {}
}

struct ListenerState {
    /// The `<selector>.local.` domain this listener browses.
    browse_domain: String,
}

/// Shipped engine over `mdns-sd`.
pub struct MdnsSdEngine {
    daemon: ServiceDaemon,
    event_tx: mpsc::UnboundedSender<AppMessage>,
    listeners: HashMap<u64, ListenerState>,
    /// tx -> fullname of the advertised service, for removal.
    registered: HashMap<u32, String>,
    next_handle: u64,
    interface_name: String,
    conflicts: u32,
}

impl MdnsSdEngine {
    /// Creates the engine, restricted to one network interface.
    ///
    /// Without filtering, mDNS probes on ALL interfaces (including Docker
    /// bridges, VPNs, etc.) which causes conflicts and unreachable
    /// addresses. If `interface` is `None`, the default-route interface is
    /// auto-detected.
    pub fn new(
        event_tx: mpsc::UnboundedSender<AppMessage>,
        interface: Option<&str>,
    ) -> Result<Self, EngineError> {
        let daemon = ServiceDaemon::new().map_err(|e| EngineError::Engine(e.to_string()))?;

        let interface_name = match interface {
            Some(name) => name.to_string(),
            None => netdev::get_default_interface()
                .map(|iface| iface.name)
                .unwrap_or_else(|e| {
                    warn!(error = %e, "could not detect default network interface, using all");
                    String::new()
                }),
        };

        if !interface_name.is_empty() {
            info!(interface = %interface_name, "restricting mDNS engine to interface");
            daemon
                .disable_interface(IfKind::All)
                .map_err(|e| EngineError::Engine(e.to_string()))?;
            daemon
                .enable_interface(IfKind::Name(interface_name.clone()))
                .map_err(|e| EngineError::Engine(e.to_string()))?;
            // The interface selections are an ordered list where the last
            // matching rule wins, so the IPv6 disable must come after the
            // named enable to take precedence for that interface's v6
            // addresses.
            daemon
                .disable_interface(IfKind::IPv6)
                .map_err(|e| EngineError::Engine(e.to_string()))?;
        }

        Ok(Self {
            daemon,
            event_tx,
            listeners: HashMap::new(),
            registered: HashMap::new(),
            next_handle: 1,
            interface_name,
            conflicts: 0,
        })
    }

    /// Background loop converting one browse channel into engine events.
    /// Runs on a blocking thread because `mdns-sd` uses synchronous
    /// channels.
    fn browse_loop(
        receiver: mdns_sd::Receiver<ServiceEvent>,
        event_tx: mpsc::UnboundedSender<AppMessage>,
        tx: TransactionId,
        requested_network: Option<Network>,
    ) {
        let net_id = requested_network.map_or(NETID_UNSET, |n| n.net_id());
        while let Ok(event) = receiver.recv() {
            let message = match event {
                ServiceEvent::ServiceResolved(info) => {
                    let Some((instance_name, _)) = split_fullname(info.get_fullname()) else {
                        warn!(fullname = info.get_fullname(), "unparsable fullname, ignoring");
                        continue;
                    };
                    let type_labels = type_labels_of(info.get_type());
                    let txt = info
                        .get_properties()
                        .iter()
                        .map(|p| (p.key().to_string(), p.val().unwrap_or_default().to_vec()))
                        .collect();
                    AppMessage::Engine(EngineEvent::ServiceFound {
                        tx,
                        service: MdnsServiceInfo {
                            instance_name,
                            type_labels,
                            port: info.get_port(),
                            addresses: info.get_addresses().iter().copied().collect(),
                            txt,
                            net_id,
                            interface_index: None,
                            is_from_cache: false,
                        },
                    })
                }
                ServiceEvent::ServiceRemoved(ty_domain, fullname) => {
                    let Some((instance_name, _)) = split_fullname(&fullname) else {
                        warn!(fullname, "unparsable fullname on removal, ignoring");
                        continue;
                    };
                    AppMessage::Engine(EngineEvent::ServiceLost {
                        tx,
                        service: MdnsServiceInfo {
                            instance_name,
                            type_labels: type_labels_of(&ty_domain),
                            port: 0,
                            addresses: Vec::new(),
                            txt: BTreeMap::new(),
                            net_id,
                            interface_index: None,
                            is_from_cache: false,
                        },
                    })
                }
                ServiceEvent::SearchStarted(_) => {
                    AppMessage::Engine(EngineEvent::QuerySent { tx })
                }
                ServiceEvent::ServiceFound(service_type, fullname) => {
                    debug!(service_type, fullname, "service found, pending resolution");
                    continue;
                }
                ServiceEvent::SearchStopped(_) => break,
            };
            if event_tx.send(message).is_err() {
                break;
            }
        }
        debug!(%tx, "browse loop exited");
    }
}

/// Splits `"_ipp._tcp.local."` into `["_ipp", "_tcp", "local"]`.
fn type_labels_of(ty_domain: &str) -> Vec<String> {
    ty_domain
        .split('.')
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

impl DiscoveryEngine for MdnsSdEngine {
    fn register_listener(
        &mut self,
        selector: &str,
        network: Option<Network>,
        tx: TransactionId,
    ) -> Result<ListenerHandle, EngineError> {
        let browse_domain = format!("{selector}.local.");
        let receiver = self
            .daemon
            .browse(&browse_domain)
            .map_err(|e| EngineError::Engine(e.to_string()))?;

        let handle = ListenerHandle(self.next_handle);
        self.next_handle += 1;
        self.listeners.insert(handle.0, ListenerState { browse_domain });

        let event_tx = self.event_tx.clone();
        tokio::task::spawn_blocking(move || {
            Self::browse_loop(receiver, event_tx, tx, network);
        });

        Ok(handle)
    }

    fn unregister_listener(&mut self, handle: ListenerHandle) {
        let Some(state) = self.listeners.remove(&handle.0) else {
            debug!(?handle, "unregister for unknown listener");
            return;
        };
        // Only stop the browse when no other listener shares the domain;
        // stop_browse tears down every browser of that type at once.
        let shared = self
            .listeners
            .values()
            .any(|l| l.browse_domain == state.browse_domain);
        if !shared {
            if let Err(e) = self.daemon.stop_browse(&state.browse_domain) {
                warn!(domain = %state.browse_domain, error = %e, "failed to stop browse");
            }
        }
    }

    fn add_service(
        &mut self,
        tx: TransactionId,
        service: &ServiceInfo,
        _interface_index: Option<u32>,
    ) -> Result<(), EngineError> {
        let ty_domain = format!("{}.local.", service.service_type);
        let host = format!(
            "{}.local.",
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "nsdd".to_string())
        );
        let properties: HashMap<String, String> = service
            .txt
            .iter()
            .map(|(k, v)| (k.clone(), String::from_utf8_lossy(v).to_string()))
            .collect();

        let info = mdns_sd::ServiceInfo::new(
            &ty_domain,
            &service.service_name,
            &host,
            "", // No explicit addrs — addr_auto lets the lib find them
            service.port,
            properties,
        )
        .map_err(|e| EngineError::Engine(e.to_string()))?
        .enable_addr_auto();

        let fullname = info.get_fullname().to_string();
        self.daemon
            .register(info)
            .map_err(|e| EngineError::Engine(e.to_string()))?;
        self.registered.insert(tx.value(), fullname);

        // mdns-sd probes and resolves conflicts internally; a successful
        // submission is the registration confirmation at this layer.
        let _ = self.event_tx.send(AppMessage::Engine(EngineEvent::RegisterSucceeded {
            tx,
            service_name: service.service_name.clone(),
            hostname: host,
            interface: self.interface_name.clone(),
        }));
        Ok(())
    }

    fn remove_service(&mut self, tx: TransactionId) {
        let Some(fullname) = self.registered.remove(&tx.value()) else {
            debug!(%tx, "remove for unknown advertisement");
            return;
        };
        match self.daemon.unregister(&fullname) {
            Ok(receiver) => {
                // Wait out the confirmation on a blocking thread so the
                // library does not log closed-channel errors.
                tokio::task::spawn_blocking(move || {
                    let _ = receiver.recv();
                });
            }
            Err(e) => {
                warn!(fullname, error = %e, "failed to unregister advertisement");
            }
        }
    }

    fn advertiser_metrics(&self) -> AdvertiserMetrics {
        AdvertiserMetrics {
            registered_services: self.registered.len() as u32,
            conflicts: self.conflicts,
        }
    }

    /// Withdraws everything still advertised and stops the engine's
    /// background thread. Confirmations are not awaited: this only runs on
    /// daemon shutdown, right before the process exits.
    fn shutdown(&mut self) {
        for fullname in self.registered.values() {
            if let Err(e) = self.daemon.unregister(fullname) {
                warn!(fullname, error = %e, "failed to unregister on shutdown");
            }
        }
        self.registered.clear();
        if let Err(e) = self.daemon.shutdown() {
            warn!(error = %e, "failed to shut down mdns engine");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn info_with_labels(labels: &[&str]) -> MdnsServiceInfo {
        MdnsServiceInfo {
            instance_name: "printer1".to_string(),
            type_labels: labels.iter().map(|s| s.to_string()).collect(),
            port: 631,
            addresses: vec!["192.0.2.7".parse().unwrap(), "2001:db8::1".parse().unwrap()],
            txt: BTreeMap::new(),
            net_id: 42,
            interface_index: Some(2),
            is_from_cache: false,
        }
    }

    #[test]
    fn lowering_rejects_non_local_terminal() {
        let info = info_with_labels(&["_ipp", "_tcp", "example"]);
        assert!(lower_service_info(LoweringKind::Found, &info).is_none());

        let empty = info_with_labels(&[]);
        assert!(lower_service_info(LoweringKind::Found, &empty).is_none());
    }

    #[test]
    fn lowering_found_appends_trailing_dot() {
        let info = info_with_labels(&["_ipp", "_tcp", "local"]);
        let lowered = lower_service_info(LoweringKind::Found, &info).unwrap();
        assert_eq!(lowered.service_type, "_ipp._tcp.");
        let lost = lower_service_info(LoweringKind::Lost, &info).unwrap();
        assert_eq!(lost.service_type, "_ipp._tcp.");
    }

    #[test]
    fn lowering_resolve_prepends_leading_dot() {
        let info = info_with_labels(&["_ipp", "_tcp", "local"]);
        let lowered = lower_service_info(LoweringKind::ResolveSucceeded, &info).unwrap();
        assert_eq!(lowered.service_type, "._ipp._tcp");
    }

    #[test]
    fn lowering_updated_uses_bare_type() {
        let info = info_with_labels(&["_ipp", "_tcp", "local"]);
        let lowered = lower_service_info(LoweringKind::Updated, &info).unwrap();
        assert_eq!(lowered.service_type, "_ipp._tcp");
    }

    #[test]
    fn lowering_prefers_ipv4_host() {
        let info = info_with_labels(&["_ipp", "_tcp", "local"]);
        let lowered = lower_service_info(LoweringKind::Found, &info).unwrap();
        assert_eq!(lowered.host, Some("192.0.2.7".parse().unwrap()));
    }

    #[test]
    fn lowering_attributes_network() {
        let mut info = info_with_labels(&["_ipp", "_tcp", "local"]);
        let lowered = lower_service_info(LoweringKind::Found, &info).unwrap();
        assert_eq!(lowered.network, Some(Network::new(42)));
        assert_eq!(lowered.interface_index, Some(2));

        info.net_id = NETID_UNSET;
        let lowered = lower_service_info(LoweringKind::Found, &info).unwrap();
        assert_eq!(lowered.network, None);
        assert_eq!(lowered.interface_index, None);
    }

    #[test]
    fn type_labels_split() {
        assert_eq!(
            type_labels_of("_ipp._tcp.local."),
            vec!["_ipp", "_tcp", "local"]
        );
    }
}
