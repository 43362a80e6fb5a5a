//! Wire protocol spoken to the legacy mdnsd helper daemon.
//!
//! The helper is an external process reached over a Unix socket. Each
//! message is transmitted as a **length-prefixed frame**:
//!
//! ```text
//! +-------------------+------------------------------+
//! | Length (4 bytes)   | MessagePack Payload          |
//! | big-endian u32     | (variable length)            |
//! +-------------------+------------------------------+
//! ```
//!
//! Requests flow daemon-ward, events flow back on the same socket. Every
//! operation is tagged with the transaction id the orchestrator assigned,
//! and every event echoes it, so the event demultiplexer needs no other
//! state.
//!
//! # Operations and events
//!
//! The helper understands four operation verbs (`Discover`, `Register`,
//! `Resolve`, `GetAddrInfo`) plus `Stop`, and emits four event kinds plus a
//! terminal failure for each verb. A `Resolve` terminates in a single
//! `ServiceResolved`; discovery streams `ServiceFound`/`ServiceLost` until
//! stopped.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Maximum frame size: 1 MB. Any frame larger than this is rejected
/// to prevent memory exhaustion from malformed data.
const MAX_FRAME_SIZE: u32 = 1_048_576;

/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("MessagePack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("MessagePack decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("frame too large: {size} bytes (max {MAX_FRAME_SIZE})")]
    FrameTooLarge { size: u32 },

    #[error("connection closed by daemon")]
    ConnectionClosed,
}

/// An operation sent to the helper daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DaemonRequest {
    /// Browse for services of a type on one interface (0 = all).
    Discover {
        tx: u32,
        service_type: String,
        interface_index: u32,
    },

    /// Advertise a service.
    Register {
        tx: u32,
        service_name: String,
        service_type: String,
        port: u16,
        txt: BTreeMap<String, Vec<u8>>,
        interface_index: u32,
    },

    /// Resolve one instance to hostname, port, and TXT attributes.
    Resolve {
        tx: u32,
        service_name: String,
        service_type: String,
        interface_index: u32,
    },

    /// Look up addresses for a hostname learned from a `ServiceResolved`.
    GetAddrInfo {
        tx: u32,
        hostname: String,
        interface_index: u32,
    },

    /// Terminate the operation with this transaction id, whatever its verb.
    Stop { tx: u32 },
}

/// An event received from the helper daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DaemonEvent {
    /// A service matching a `Discover` appeared. The name is fully escaped.
    ServiceFound {
        tx: u32,
        service_name: String,
        service_type: String,
        net_id: i32,
        interface_index: u32,
    },

    /// A previously found service disappeared.
    ServiceLost {
        tx: u32,
        service_name: String,
        service_type: String,
        net_id: i32,
        interface_index: u32,
    },

    /// A `Register` completed. `service_name` is the final (possibly
    /// conflict-renamed) instance name.
    ServiceRegistered { tx: u32, service_name: String },

    /// A `Resolve` completed. `fullname` is the fully-escaped service name
    /// including type and domain; `hostname` feeds the follow-up
    /// `GetAddrInfo`.
    ServiceResolved {
        tx: u32,
        fullname: String,
        hostname: String,
        port: u16,
        txt: BTreeMap<String, Vec<u8>>,
        interface_index: u32,
    },

    /// A `GetAddrInfo` produced an address.
    AddressResolved {
        tx: u32,
        address: String,
        net_id: i32,
        interface_index: u32,
    },

    /// Terminal failure for the operation with this transaction id.
    OperationFailed { tx: u32, kind: FailureKind },
}

/// Which verb a terminal failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Discovery,
    Registration,
    Resolution,
    AddressLookup,
}

/// Encodes a value into a length-prefixed frame.
fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, WireError> {
    let payload = rmp_serde::to_vec_named(msg)?;
    let length = payload.len() as u32;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Reads one length-prefixed payload from an async reader.
///
/// Returns `WireError::ConnectionClosed` if the daemon closes the socket
/// (EOF while expecting the length prefix).
async fn read_payload<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>, WireError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }
    let length = u32::from_be_bytes(len_buf);

    if length > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge { size: length });
    }

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Writes a request frame to the helper daemon socket.
pub async fn write_request<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    req: &DaemonRequest,
) -> Result<(), WireError> {
    let frame = encode_frame(req)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one event frame from the helper daemon socket.
pub async fn read_event<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<DaemonEvent, WireError> {
    let payload = read_payload(reader).await?;
    Ok(rmp_serde::from_slice(&payload)?)
}

/// Writes an event frame. Only used by test doubles standing in for the
/// helper daemon.
pub async fn write_event<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    event: &DaemonEvent,
) -> Result<(), WireError> {
    let frame = encode_frame(event)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one request frame. Only used by test doubles standing in for the
/// helper daemon.
pub async fn read_request<R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<DaemonRequest, WireError> {
    let payload = read_payload(reader).await?;
    Ok(rmp_serde::from_slice(&payload)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_frame_roundtrip() {
        let (mut writer, mut reader) = tokio::io::duplex(1024);

        let req = DaemonRequest::Resolve {
            tx: 12,
            service_name: "My".to_string(),
            service_type: "_foo._tcp".to_string(),
            interface_index: 2,
        };

        write_request(&mut writer, &req).await.unwrap();
        let received = read_request(&mut reader).await.unwrap();
        assert_eq!(received, req);
    }

    #[tokio::test]
    async fn event_frame_roundtrip() {
        let (mut writer, mut reader) = tokio::io::duplex(1024);

        let event = DaemonEvent::ServiceResolved {
            tx: 12,
            fullname: "My._foo._tcp.local.".to_string(),
            hostname: "host.local.".to_string(),
            port: 515,
            txt: BTreeMap::new(),
            interface_index: 2,
        };

        write_event(&mut writer, &event).await.unwrap();
        let received = read_event(&mut reader).await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn multiple_events_in_sequence() {
        let (mut writer, mut reader) = tokio::io::duplex(4096);

        let events = vec![
            DaemonEvent::ServiceFound {
                tx: 1,
                service_name: "printer1".to_string(),
                service_type: "_ipp._tcp".to_string(),
                net_id: 42,
                interface_index: 2,
            },
            DaemonEvent::ServiceLost {
                tx: 1,
                service_name: "printer1".to_string(),
                service_type: "_ipp._tcp".to_string(),
                net_id: 42,
                interface_index: 2,
            },
            DaemonEvent::OperationFailed {
                tx: 1,
                kind: FailureKind::Discovery,
            },
        ];

        for event in &events {
            write_event(&mut writer, event).await.unwrap();
        }
        for expected in &events {
            let received = read_event(&mut reader).await.unwrap();
            assert_eq!(&received, expected);
        }
    }

    #[tokio::test]
    async fn closed_socket_reports_connection_closed() {
        let (writer, mut reader) = tokio::io::duplex(64);
        drop(writer);
        match read_event(&mut reader).await {
            Err(WireError::ConnectionClosed) => {}
            other => panic!("expected ConnectionClosed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        // Hand-craft a frame header claiming 2 MB.
        let length: u32 = 2 * 1024 * 1024;
        writer.write_all(&length.to_be_bytes()).await.unwrap();
        match read_event(&mut reader).await {
            Err(WireError::FrameTooLarge { size }) => assert_eq!(size, length),
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }
}
