//! Client and request registries.
//!
//! One [`ClientInfo`] exists per connected client channel, holding its
//! outstanding requests keyed by the caller-chosen request id. The
//! [`ClientRegistry`] additionally maintains the transaction index mapping
//! every live backend transaction id back to its owning client, so backend
//! events can be demultiplexed in O(1).
//!
//! Invariant: a transaction id is present in the index **iff** some client
//! holds a request with that id. All mutation goes through the registry
//! methods below, which maintain both sides together; the registry is only
//! ever touched from the state-machine task.

use crate::engine::ListenerHandle;
use crate::eventlog::EventLog;
use nsd_core::ipc::DaemonCallback;
use nsd_core::types::{
    ClientRequestId, ConnectorId, Network, ServiceInfo, TransactionId,
    MAX_OUTSTANDING_PER_CLIENT, MAX_UNIQUE_SERVICE_NAMES,
};
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Allocates transaction ids: monotone, starting at 1, wrapping only to
/// skip the sentinel 0.
#[derive(Debug)]
pub struct TransactionIdAllocator {
    next: u32,
}

impl Default for TransactionIdAllocator {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl TransactionIdAllocator {
    pub fn allocate(&mut self) -> TransactionId {
        let id = self.next;
        self.next = self.next.checked_add(1).unwrap_or(1);
        TransactionId::new(id)
    }
}

/// Which verb started a legacy request; cleanup dispatches on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyVerb {
    Discover,
    Register,
    Resolve,
}

/// What a modern-engine listener request is for. Browse streams found/lost,
/// resolve completes once for the named instance, watch streams updates for
/// the named instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryPurpose {
    Browse,
    Resolve { instance_name: String },
    Watch { instance_name: String },
}

/// Counters and identity shared by every request variant.
#[derive(Debug)]
pub struct RequestHeader {
    pub transaction_id: TransactionId,
    pub request_id: ClientRequestId,
    /// The service type as the client requested it (echoed in callbacks).
    pub service_type: String,
    pub start_time: Instant,
    pub found_count: u32,
    pub lost_count: u32,
    pub sent_query_count: u32,
    unique_names: HashSet<String>,
    is_service_from_cache: bool,
}

impl RequestHeader {
    pub fn new(
        transaction_id: TransactionId,
        request_id: ClientRequestId,
        service_type: impl Into<String>,
    ) -> Self {
        Self {
            transaction_id,
            request_id,
            service_type: service_type.into(),
            start_time: Instant::now(),
            found_count: 0,
            lost_count: 0,
            sent_query_count: 0,
            unique_names: HashSet::new(),
            is_service_from_cache: false,
        }
    }

    /// Header for a request migrated to a new transaction (the legacy
    /// resolve chain): keeps the request id, start time, and counters.
    pub fn migrated(self, transaction_id: TransactionId) -> Self {
        Self {
            transaction_id,
            ..self
        }
    }

    pub fn note_found(&mut self, service_name: &str) {
        self.found_count += 1;
        self.note_name(service_name);
    }

    pub fn note_lost(&mut self, service_name: &str) {
        self.lost_count += 1;
        self.note_name(service_name);
    }

    fn note_name(&mut self, service_name: &str) {
        if self.unique_names.len() < MAX_UNIQUE_SERVICE_NAMES {
            self.unique_names.insert(service_name.to_string());
        }
    }

    pub fn note_query_sent(&mut self) {
        self.sent_query_count += 1;
    }

    /// Sticky: once a request has served anything from cache it stays
    /// marked, later live answers never clear it.
    pub fn mark_from_cache(&mut self, from_cache: bool) {
        self.is_service_from_cache |= from_cache;
    }

    pub fn is_from_cache(&self) -> bool {
        self.is_service_from_cache
    }

    pub fn unique_name_count(&self) -> usize {
        self.unique_names.len()
    }
}

/// One outstanding operation.
#[derive(Debug)]
pub enum ClientRequest {
    /// Runs on the legacy helper daemon.
    Legacy {
        header: RequestHeader,
        verb: LegacyVerb,
    },
    /// An advertisement on the modern engine. `offload` is filled in once
    /// the registration succeeds and feeds the offload broadcast on
    /// removal.
    Advertiser {
        header: RequestHeader,
        requested_network: Option<Network>,
        offload: Option<(String, nsd_core::types::OffloadServiceInfo)>,
    },
    /// A listener on the modern engine (browse, resolve, or watch).
    Discovery {
        header: RequestHeader,
        listener: ListenerHandle,
        requested_network: Option<Network>,
        purpose: DiscoveryPurpose,
    },
}

impl ClientRequest {
    pub fn header(&self) -> &RequestHeader {
        match self {
            ClientRequest::Legacy { header, .. }
            | ClientRequest::Advertiser { header, .. }
            | ClientRequest::Discovery { header, .. } => header,
        }
    }

    pub fn header_mut(&mut self) -> &mut RequestHeader {
        match self {
            ClientRequest::Legacy { header, .. }
            | ClientRequest::Advertiser { header, .. }
            | ClientRequest::Discovery { header, .. } => header,
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.header().transaction_id
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, ClientRequest::Legacy { .. })
    }

    /// For modern requests, the network the client asked for (`None` inside
    /// the option meaning "any"). `None` overall for legacy requests.
    pub fn modern_requested_network(&self) -> Option<Option<Network>> {
        match self {
            ClientRequest::Legacy { .. } => None,
            ClientRequest::Advertiser {
                requested_network, ..
            }
            | ClientRequest::Discovery {
                requested_network, ..
            } => Some(*requested_network),
        }
    }
}

/// Per-client state for one connected channel.
#[derive(Debug)]
pub struct ClientInfo {
    pub connector: ConnectorId,
    pub uid: u32,
    /// Client hint: prefer the modern backend for this client's requests.
    pub uses_modern_backend: bool,
    /// Set only when the client issues the legacy daemon-startup message;
    /// such clients keep the helper daemon alive while connected.
    pub is_pre_s: bool,
    pub requests: HashMap<ClientRequestId, ClientRequest>,
    /// Scratchpad for the legacy two-phase resolve. Non-empty only between
    /// a resolve acceptance and its terminal event.
    pub resolved_service: Option<ServiceInfo>,
    callback: mpsc::UnboundedSender<DaemonCallback>,
    pub log: EventLog,
}

impl ClientInfo {
    pub fn new(
        connector: ConnectorId,
        uid: u32,
        uses_modern_backend: bool,
        callback: mpsc::UnboundedSender<DaemonCallback>,
    ) -> Self {
        let log = EventLog::new(format!("client {connector} (uid {uid})"));
        Self {
            connector,
            uid,
            uses_modern_backend,
            is_pre_s: false,
            requests: HashMap::new(),
            resolved_service: None,
            callback,
            log,
        }
    }

    /// Delivers a callback to the client. A send failure means the channel
    /// died; the pending death notification performs the cleanup.
    pub fn send(&self, callback: DaemonCallback) {
        if self.callback.send(callback).is_err() {
            debug!(connector = %self.connector, "callback channel closed, awaiting death notification");
        }
    }

    /// A clone of the callback sender, for delivery after `self` is gone.
    pub fn callback_sender(&self) -> mpsc::UnboundedSender<DaemonCallback> {
        self.callback.clone()
    }
}

/// Why a request could not be stored.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("client has reached the outstanding-request limit")]
    QuotaReached,
    #[error("request id is already in use by this client")]
    DuplicateRequestId,
    #[error("unknown client")]
    UnknownClient,
}

/// All connected clients plus the transaction index.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<ConnectorId, ClientInfo>,
    transaction_index: HashMap<TransactionId, ConnectorId>,
    ids: TransactionIdAllocator,
}

impl ClientRegistry {
    pub fn insert_client(&mut self, client: ClientInfo) {
        if self
            .clients
            .insert(client.connector.clone(), client)
            .is_some()
        {
            warn!("replaced an existing client registration");
        }
    }

    /// Removes a client and every index entry for its requests. The caller
    /// expunges the returned requests in their backends.
    pub fn remove_client(&mut self, connector: &ConnectorId) -> Option<ClientInfo> {
        let client = self.clients.remove(connector)?;
        for request in client.requests.values() {
            self.transaction_index.remove(&request.transaction_id());
        }
        Some(client)
    }

    pub fn client(&self, connector: &ConnectorId) -> Option<&ClientInfo> {
        self.clients.get(connector)
    }

    pub fn client_mut(&mut self, connector: &ConnectorId) -> Option<&mut ClientInfo> {
        self.clients.get_mut(connector)
    }

    pub fn clients(&self) -> impl Iterator<Item = &ClientInfo> {
        self.clients.values()
    }

    /// Checks the storing preconditions without touching any state.
    pub fn can_store(
        &self,
        connector: &ConnectorId,
        request_id: ClientRequestId,
    ) -> Result<(), StoreError> {
        let client = self.clients.get(connector).ok_or(StoreError::UnknownClient)?;
        if client.requests.len() >= MAX_OUTSTANDING_PER_CLIENT {
            return Err(StoreError::QuotaReached);
        }
        if client.requests.contains_key(&request_id) {
            return Err(StoreError::DuplicateRequestId);
        }
        Ok(())
    }

    pub fn allocate_transaction_id(&mut self) -> TransactionId {
        self.ids.allocate()
    }

    /// Inserts a request into both maps. The caller has already verified
    /// `can_store` and performed the backend call.
    pub fn insert_request(
        &mut self,
        connector: &ConnectorId,
        request_id: ClientRequestId,
        request: ClientRequest,
    ) {
        let tx = request.transaction_id();
        let Some(client) = self.clients.get_mut(connector) else {
            warn!(%tx, "dropping request insert for unknown client");
            return;
        };
        debug_assert!(!client.requests.contains_key(&request_id));
        client.requests.insert(request_id, request);
        self.transaction_index.insert(tx, connector.clone());
    }

    /// Removes a request by its client-chosen id, clearing the index entry.
    pub fn remove_request(
        &mut self,
        connector: &ConnectorId,
        request_id: ClientRequestId,
    ) -> Option<ClientRequest> {
        let client = self.clients.get_mut(connector)?;
        let request = client.requests.remove(&request_id)?;
        self.transaction_index.remove(&request.transaction_id());
        Some(request)
    }

    /// Removes a request by transaction id (backend-event side).
    pub fn remove_by_transaction(
        &mut self,
        tx: TransactionId,
    ) -> Option<(ConnectorId, ClientRequestId, ClientRequest)> {
        let connector = self.transaction_index.remove(&tx)?;
        let client = self.clients.get_mut(&connector)?;
        let request_id = client
            .requests
            .values()
            .find(|r| r.transaction_id() == tx)
            .map(|r| r.header().request_id)?;
        let request = client.requests.remove(&request_id)?;
        Some((connector, request_id, request))
    }

    /// Resolves a transaction id to its owner without removing anything.
    pub fn owner_of(&self, tx: TransactionId) -> Option<(ConnectorId, ClientRequestId)> {
        let connector = self.transaction_index.get(&tx)?;
        let client = self.clients.get(connector)?;
        let request_id = client
            .requests
            .values()
            .find(|r| r.transaction_id() == tx)
            .map(|r| r.header().request_id)?;
        Some((connector.clone(), request_id))
    }

    pub fn request(&self, connector: &ConnectorId, request_id: ClientRequestId) -> Option<&ClientRequest> {
        self.clients.get(connector)?.requests.get(&request_id)
    }

    pub fn request_mut(
        &mut self,
        connector: &ConnectorId,
        request_id: ClientRequestId,
    ) -> Option<&mut ClientRequest> {
        self.clients.get_mut(connector)?.requests.get_mut(&request_id)
    }

    /// (transaction, owning client) pairs, for the multicast-lock scan.
    pub fn transactions(&self) -> impl Iterator<Item = (TransactionId, &ConnectorId)> {
        self.transaction_index.iter().map(|(tx, c)| (*tx, c))
    }

    pub fn outstanding_count(&self) -> usize {
        self.transaction_index.len()
    }

    pub fn any_legacy_requests(&self) -> bool {
        self.clients
            .values()
            .any(|c| c.requests.values().any(ClientRequest::is_legacy))
    }

    pub fn any_pre_s_client(&self) -> bool {
        self.clients.values().any(|c| c.is_pre_s)
    }

    /// Checks the index invariant by walking every request. Test-only;
    /// far too slow for the event loop.
    #[cfg(test)]
    pub fn index_is_consistent(&self) -> bool {
        let mut from_clients = HashSet::new();
        for client in self.clients.values() {
            for request in client.requests.values() {
                from_clients.insert(request.transaction_id());
            }
        }
        let from_index: HashSet<_> = self.transaction_index.keys().copied().collect();
        from_clients == from_index
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
