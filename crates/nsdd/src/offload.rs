//! Offload engine registry and broadcast.
//!
//! Hardware offload engines take over answering mDNS queries for advertised
//! services on one interface. The daemon keeps the current advertised set
//! per interface; engines get a snapshot on registration and incremental
//! updates afterwards. An update reaches an engine iff its interface name
//! matches and its offload-type bits intersect the service's.
//!
//! Dispatch results are returned as `(connector, callback)` pairs rather
//! than sent directly, so the state machine stays the only place that
//! talks to client channels.

use nsd_core::ipc::DaemonCallback;
use nsd_core::types::{ConnectorId, OffloadServiceInfo};
use std::collections::HashMap;
use tracing::debug;

/// One registered offload engine.
#[derive(Debug, Clone)]
pub struct OffloadEntry {
    pub connector: ConnectorId,
    pub engine_id: u16,
    pub interface: String,
    /// Capability bits, passed through for the engine's own use.
    pub capabilities: u64,
    /// The engine receives a service iff these bits intersect the
    /// service's `offload_type`.
    pub offload_types: u64,
}

/// A callback to deliver to one client channel.
pub type Dispatch = (ConnectorId, DaemonCallback);

#[derive(Debug, Default)]
pub struct OffloadManager {
    entries: Vec<OffloadEntry>,
    /// interface name -> (service key -> advertised info)
    advertised: HashMap<String, HashMap<(String, String), OffloadServiceInfo>>,
}

impl OffloadManager {
    /// Registers an engine and returns the snapshot replay for its
    /// interface.
    pub fn register_engine(&mut self, entry: OffloadEntry) -> Vec<Dispatch> {
        let mut replay = Vec::new();
        if let Some(services) = self.advertised.get(&entry.interface) {
            for info in services.values() {
                if entry.offload_types & info.offload_type != 0 {
                    replay.push((
                        entry.connector.clone(),
                        DaemonCallback::OnOffloadServiceUpdated {
                            engine_id: entry.engine_id,
                            service: info.clone(),
                        },
                    ));
                }
            }
        }
        debug!(
            interface = %entry.interface,
            engine_id = entry.engine_id,
            capabilities = entry.capabilities,
            replayed = replay.len(),
            "offload engine registered"
        );
        self.entries.push(entry);
        replay
    }

    pub fn unregister_engine(&mut self, connector: &ConnectorId, engine_id: u16) {
        self.entries
            .retain(|e| !(e.connector == *connector && e.engine_id == engine_id));
    }

    /// Drops every engine registered by a departed client.
    pub fn remove_client(&mut self, connector: &ConnectorId) {
        self.entries.retain(|e| e.connector != *connector);
    }

    /// An advertised service appeared or changed on `interface`.
    pub fn service_updated(
        &mut self,
        interface: &str,
        info: OffloadServiceInfo,
    ) -> Vec<Dispatch> {
        self.advertised
            .entry(interface.to_string())
            .or_default()
            .insert(info.key(), info.clone());
        self.dispatches_for(interface, &info, |engine_id, service| {
            DaemonCallback::OnOffloadServiceUpdated { engine_id, service }
        })
    }

    /// An advertised service was withdrawn from `interface`.
    pub fn service_removed(
        &mut self,
        interface: &str,
        info: OffloadServiceInfo,
    ) -> Vec<Dispatch> {
        if let Some(services) = self.advertised.get_mut(interface) {
            services.remove(&info.key());
            if services.is_empty() {
                self.advertised.remove(interface);
            }
        }
        self.dispatches_for(interface, &info, |engine_id, service| {
            DaemonCallback::OnOffloadServiceRemoved { engine_id, service }
        })
    }

    fn dispatches_for(
        &self,
        interface: &str,
        info: &OffloadServiceInfo,
        make: impl Fn(u16, OffloadServiceInfo) -> DaemonCallback,
    ) -> Vec<Dispatch> {
        self.entries
            .iter()
            .filter(|e| e.interface == interface && e.offload_types & info.offload_type != 0)
            .map(|e| (e.connector.clone(), make(e.engine_id, info.clone())))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
