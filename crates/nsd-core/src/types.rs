//! Domain types for the service discovery daemon.
//!
//! The identifier types are **newtypes** — thin wrappers around primitive
//! types that give them distinct identities in the type system. A
//! `TransactionId` (daemon-assigned backend handle) can never be confused
//! with a `ClientRequestId` (caller-chosen key), even though both are
//! integers on the wire.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

/// Maximum number of outstanding requests a single client may hold.
pub const MAX_OUTSTANDING_PER_CLIENT: usize = 10;

/// Cap on the per-request set of distinct service names seen.
pub const MAX_UNIQUE_SERVICE_NAMES: usize = 100;

/// Instance names are limited to 63 UTF-8 bytes (RFC 6763 §4.1.1).
pub const MAX_INSTANCE_NAME_BYTES: usize = 63;

/// netId value meaning "no network attached".
pub const NETID_UNSET: i32 = 0;

/// netId sentinel for the local-advertisement loopback network. Events on
/// this network have no user-visible `Network`, but keep their interface
/// index so a caller can still target the same link.
pub const LOCAL_NET_ID: i32 = 99;

/// Offload-type bit for plain query-reply offload of an advertised
/// service.
pub const OFFLOAD_TYPE_REPLY: u64 = 1 << 0;

// ---------------------------------------------------------------------------
// TransactionId — daemon-assigned handle for one backend operation
// ---------------------------------------------------------------------------

/// Stable handle the daemon assigns to one backend operation.
///
/// Allocated from a monotone counter that starts at 1 and never yields 0
/// (the unset sentinel), so a zero id can be used as "no transaction" in
/// wire messages without ambiguity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(u32);

impl TransactionId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ClientRequestId — caller-chosen key within one client connection
// ---------------------------------------------------------------------------

/// Caller-chosen opaque key identifying a request within one client
/// connection. 16 bits, chosen by the client; the daemon never interprets
/// it beyond equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientRequestId(u16);

impl ClientRequestId {
    pub fn new(id: u16) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for ClientRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ConnectorId — identity of one connected client channel
// ---------------------------------------------------------------------------

/// Unique identifier for one connected client channel.
///
/// Generated by the daemon (UUID v4) when the connection is accepted.
/// Two connections from the same process get different `ConnectorId`s.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectorId(String);

impl ConnectorId {
    /// Creates a `ConnectorId` from an existing string (e.g. parsed from a
    /// dump).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a new random `ConnectorId` using UUID v4.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Network — a platform network handle (netId)
// ---------------------------------------------------------------------------

/// A platform network, identified by its netId.
///
/// `NETID_UNSET` and `LOCAL_NET_ID` are sentinels and never appear inside a
/// `Network` handed to clients; see `attribute_network`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Network(i32);

impl Network {
    pub fn new(net_id: i32) -> Self {
        Self(net_id)
    }

    pub fn net_id(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Network({})", self.0)
    }
}

/// Network attribution for outbound callbacks carrying a raw netId.
///
/// Returns `(network, interface_index)` to attach to the callback:
/// - `NETID_UNSET` clears both,
/// - the local-network sentinel clears the network but keeps the interface
///   index,
/// - anything else attaches `Network(net_id)`.
pub fn attribute_network(
    net_id: i32,
    interface_index: Option<u32>,
) -> (Option<Network>, Option<u32>) {
    match net_id {
        NETID_UNSET => (None, None),
        LOCAL_NET_ID => (None, interface_index),
        other => (Some(Network::new(other)), interface_index),
    }
}

// ---------------------------------------------------------------------------
// ErrorCode — failures surfaced to clients
// ---------------------------------------------------------------------------

/// Error kinds surfaced to clients in failure callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Backend failures, unparsable types, interface-lookup failures.
    InternalError,
    /// A second in-flight legacy resolve on the same client.
    AlreadyActive,
    /// Per-client outstanding-request quota exceeded.
    MaxLimit,
    /// Malformed parameters on callback registration.
    BadParameters,
    /// Stop verb issued with no matching outstanding operation.
    OperationNotRunning,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::AlreadyActive => "ALREADY_ACTIVE",
            ErrorCode::MaxLimit => "MAX_LIMIT",
            ErrorCode::BadParameters => "BAD_PARAMETERS",
            ErrorCode::OperationNotRunning => "OPERATION_NOT_RUNNING",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// ServiceInfo — the user-visible description of a service
// ---------------------------------------------------------------------------

/// Description of a discovered, resolved, or advertised service.
///
/// This is the payload clients send with register/resolve requests and the
/// daemon returns in found/lost/resolved callbacks. Fields that are unknown
/// at a given stage (e.g. `host` before resolution) are simply `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// Instance name (left-most label), unescaped. At most 63 UTF-8 bytes
    /// when registering.
    pub service_name: String,
    /// Service type selector, e.g. `_ipp._tcp`. The exact dot affordances on
    /// callbacks depend on the event kind.
    pub service_type: String,
    /// TCP/UDP port, 0 when not yet known.
    #[serde(default)]
    pub port: u16,
    /// Resolved host address, if any.
    #[serde(default)]
    pub host: Option<IpAddr>,
    /// The network the service was seen on, if it has a user-visible one.
    #[serde(default)]
    pub network: Option<Network>,
    /// OS interface index the service was seen on, if known.
    #[serde(default)]
    pub interface_index: Option<u32>,
    /// TXT attributes. A key with an empty value is a boolean attribute.
    #[serde(default)]
    pub txt: BTreeMap<String, Vec<u8>>,
}

impl fmt::Display for ServiceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service_name, self.service_type)?;
        if self.port != 0 {
            write!(f, ":{}", self.port)?;
        }
        if let Some(host) = &self.host {
            write!(f, " @{host}")?;
        }
        if let Some(network) = &self.network {
            write!(f, " on {network}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// OffloadServiceInfo — opaque payload routed to offload engines
// ---------------------------------------------------------------------------

/// An advertised service as handed to hardware offload engines.
///
/// The daemon only inspects `offload_type` (for routing by bitmask) and the
/// interface name it travels with; everything else is passed through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffloadServiceInfo {
    /// Instance name of the advertised service.
    pub service_name: String,
    /// Service type selector, e.g. `_airplay._tcp`.
    pub service_type: String,
    /// Hostname the records point at.
    pub hostname: String,
    /// Subtypes the service is advertised under.
    #[serde(default)]
    pub subtypes: Vec<String>,
    /// Offload kind bitmask; an engine receives the update iff its own type
    /// bits intersect this mask.
    pub offload_type: u64,
    /// Relative priority among offloaded services (lower is better).
    #[serde(default)]
    pub priority: u32,
}

impl OffloadServiceInfo {
    /// Key identifying the advertised service within one interface.
    pub fn key(&self) -> (String, String) {
        (self.service_name.clone(), self.service_type.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connector_id_generate_is_unique() {
        let a = ConnectorId::generate();
        let b = ConnectorId::generate();
        assert_ne!(a, b, "two generated ConnectorIds should be different");
    }

    #[test]
    fn transaction_id_display() {
        assert_eq!(TransactionId::new(7).to_string(), "7");
    }

    #[test]
    fn attribute_network_unset_clears_both() {
        assert_eq!(attribute_network(NETID_UNSET, Some(3)), (None, None));
    }

    #[test]
    fn attribute_network_local_keeps_interface() {
        assert_eq!(attribute_network(LOCAL_NET_ID, Some(3)), (None, Some(3)));
    }

    #[test]
    fn attribute_network_real_netid() {
        assert_eq!(
            attribute_network(42, Some(3)),
            (Some(Network::new(42)), Some(3))
        );
    }

    #[test]
    fn error_code_display() {
        assert_eq!(ErrorCode::MaxLimit.to_string(), "MAX_LIMIT");
        assert_eq!(ErrorCode::OperationNotRunning.to_string(), "OPERATION_NOT_RUNNING");
    }

    #[test]
    fn service_info_serde_json_roundtrip() {
        let info = ServiceInfo {
            service_name: "My Printer".to_string(),
            service_type: "_ipp._tcp".to_string(),
            port: 631,
            host: Some("192.0.2.7".parse().unwrap()),
            network: Some(Network::new(42)),
            interface_index: Some(2),
            txt: BTreeMap::from([("paper".to_string(), b"a4".to_vec())]),
        };
        let json = serde_json::to_string(&info).unwrap();
        let parsed: ServiceInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(info, parsed);
    }

    #[test]
    fn service_info_display() {
        let info = ServiceInfo {
            service_name: "printer1".to_string(),
            service_type: "_ipp._tcp".to_string(),
            port: 631,
            ..Default::default()
        };
        assert_eq!(info.to_string(), "printer1._ipp._tcp:631");
    }
}
