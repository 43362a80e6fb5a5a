//! IPC protocol between the daemon and its clients.
//!
//! Communication happens over a Unix domain socket using JSON lines
//! (one JSON object per line, terminated by '\n'). JSON is chosen over
//! MessagePack here for easier debugging with tools like `socat`; the
//! high-rate legacy daemon wire uses binary frames instead (see
//! [`crate::mdnsd`]).
//!
//! The first message on a fresh connection must be [`ClientVerb::Connect`];
//! every later verb carries the caller-chosen `request_id` that callbacks
//! echo back. Closing the socket is the death notification: the daemon
//! expunges every outstanding request of that connection.

use crate::types::{ErrorCode, OffloadServiceInfo, ServiceInfo};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from encoding or decoding IPC lines.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("failed to encode IPC message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode IPC message: {0}")]
    Decode(#[source] serde_json::Error),
}

/// A request from a client to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "snake_case")]
pub enum ClientVerb {
    /// Must be the first message on a connection. `use_modern_backend` is
    /// the client's routing hint.
    Connect { use_modern_backend: bool },

    /// Start discovering services of a type. `network` limits discovery to
    /// one network; `None` means all.
    DiscoverServices {
        request_id: u16,
        service_type: String,
        #[serde(default)]
        network: Option<i32>,
    },

    /// Stop a discovery previously started with the same `request_id`.
    StopDiscovery { request_id: u16 },

    /// Advertise a service. The daemon truncates the instance name to
    /// 63 UTF-8 bytes before registering.
    RegisterService {
        request_id: u16,
        service: ServiceInfo,
    },

    /// Withdraw an advertisement.
    UnregisterService { request_id: u16 },

    /// Resolve one service instance to host, port, and TXT attributes.
    ResolveService {
        request_id: u16,
        service: ServiceInfo,
    },

    /// Cancel an in-flight resolution.
    StopResolution { request_id: u16 },

    /// Watch one service instance for updates (modern engine only).
    RegisterServiceCallback {
        request_id: u16,
        service: ServiceInfo,
    },

    /// Stop watching.
    UnregisterServiceCallback { request_id: u16 },

    /// Legacy clients call this to start the helper daemon eagerly and to
    /// keep it alive while they are connected.
    StartDaemon,

    /// Register a hardware offload engine for one interface.
    RegisterOffloadEngine {
        engine_id: u16,
        interface: String,
        capabilities: u64,
        offload_types: u64,
    },

    /// Remove a previously registered offload engine.
    UnregisterOffloadEngine { engine_id: u16 },

    /// Feed a process-importance change into the daemon (privileged).
    SetUidImportance { uid: u32, importance: i32 },

    /// Request a plain-text dump of daemon state.
    Dump,
}

/// A callback from the daemon to a client. Each echoes the `request_id`
/// of the request it belongs to (offload callbacks echo `engine_id`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DaemonCallback {
    /// Emitted to every client when the daemon enters the enabled state,
    /// and replayed to clients that connect while enabled.
    OnDaemonStateChanged { enabled: bool },

    OnDiscoverServicesStarted {
        request_id: u16,
        service_type: String,
    },
    OnDiscoverServicesFailed {
        request_id: u16,
        error: ErrorCode,
    },
    OnServiceFound {
        request_id: u16,
        service: ServiceInfo,
    },
    OnServiceLost {
        request_id: u16,
        service: ServiceInfo,
    },
    OnStopDiscoverySucceeded { request_id: u16 },
    OnStopDiscoveryFailed {
        request_id: u16,
        error: ErrorCode,
    },

    OnRegisterServiceSucceeded {
        request_id: u16,
        service: ServiceInfo,
    },
    OnRegisterServiceFailed {
        request_id: u16,
        error: ErrorCode,
    },
    OnUnregisterServiceSucceeded { request_id: u16 },
    OnUnregisterServiceFailed {
        request_id: u16,
        error: ErrorCode,
    },

    OnResolveServiceSucceeded {
        request_id: u16,
        service: ServiceInfo,
    },
    OnResolveServiceFailed {
        request_id: u16,
        error: ErrorCode,
    },
    OnStopResolutionSucceeded { request_id: u16 },
    OnStopResolutionFailed {
        request_id: u16,
        error: ErrorCode,
    },

    OnServiceInfoCallbackRegistered { request_id: u16 },
    OnServiceInfoCallbackRegistrationFailed {
        request_id: u16,
        error: ErrorCode,
    },
    OnServiceUpdated {
        request_id: u16,
        service: ServiceInfo,
    },
    OnServiceUpdatedLost { request_id: u16 },
    OnServiceInfoCallbackUnregistered { request_id: u16 },

    /// An advertised service appeared or changed on the engine's interface.
    OnOffloadServiceUpdated {
        engine_id: u16,
        service: OffloadServiceInfo,
    },
    /// An advertised service was withdrawn from the engine's interface.
    OnOffloadServiceRemoved {
        engine_id: u16,
        service: OffloadServiceInfo,
    },

    /// Response to [`ClientVerb::Dump`].
    DumpOutput { text: String },

    /// Protocol-level error (malformed request line, verb before Connect).
    Error { message: String },
}

/// Decodes one request line from a client.
pub fn decode_request(line: &str) -> Result<ClientVerb, IpcError> {
    serde_json::from_str(line.trim_end()).map_err(IpcError::Decode)
}

/// Encodes a callback as a JSON line (newline included).
pub fn encode_callback(cb: &DaemonCallback) -> Result<String, IpcError> {
    let mut line = serde_json::to_string(cb).map_err(IpcError::Encode)?;
    line.push('\n');
    Ok(line)
}

/// Encodes a request as a JSON line (newline included). Used by clients.
pub fn encode_request(verb: &ClientVerb) -> Result<String, IpcError> {
    let mut line = serde_json::to_string(verb).map_err(IpcError::Encode)?;
    line.push('\n');
    Ok(line)
}

/// Decodes one callback line. Used by clients.
pub fn decode_callback(line: &str) -> Result<DaemonCallback, IpcError> {
    serde_json::from_str(line.trim_end()).map_err(IpcError::Decode)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
