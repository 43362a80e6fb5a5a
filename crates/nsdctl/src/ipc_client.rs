//! IPC client for connecting to the nsdd daemon.
//!
//! Connects to the daemon's Unix domain socket, performs the `Connect`
//! handshake, and provides typed send/recv over the JSON-lines protocol.

use nsd_core::config::DaemonConfig;
use nsd_core::ipc::{self, ClientVerb, DaemonCallback};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::UnixStream;
use tracing::debug;

/// Errors that can occur in the IPC client.
#[derive(Debug, Error)]
pub enum IpcClientError {
    #[error("could not connect to daemon at {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("daemon is not running (socket not found at {0})")]
    DaemonNotRunning(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IPC protocol error: {0}")]
    Protocol(String),

    #[error("connection to daemon closed")]
    Disconnected,
}

/// Client connection to the daemon.
///
/// The connection is split into a reader and writer so callbacks can be
/// streamed while further verbs are sent.
pub struct IpcClient {
    reader: BufReader<ReadHalf<UnixStream>>,
    writer: WriteHalf<UnixStream>,
    line_buf: String,
}

impl IpcClient {
    /// Connects and performs the `Connect` handshake. `socket` overrides
    /// the default socket path; `use_modern_backend` is the routing hint
    /// attached to every request of this connection.
    pub async fn connect(
        socket: Option<&Path>,
        use_modern_backend: bool,
    ) -> Result<Self, IpcClientError> {
        let path = socket
            .map(Path::to_path_buf)
            .unwrap_or_else(DaemonConfig::default_socket_path);
        if !path.exists() {
            return Err(IpcClientError::DaemonNotRunning(path));
        }

        let stream = UnixStream::connect(&path)
            .await
            .map_err(|e| IpcClientError::Connect {
                path: path.clone(),
                source: e,
            })?;

        let (reader, writer) = tokio::io::split(stream);
        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
            line_buf: String::with_capacity(4096),
        };
        debug!(path = %path.display(), "connected to daemon");

        client
            .send(&ClientVerb::Connect { use_modern_backend })
            .await?;
        Ok(client)
    }

    /// Sends one verb to the daemon.
    pub async fn send(&mut self, verb: &ClientVerb) -> Result<(), IpcClientError> {
        let line =
            ipc::encode_request(verb).map_err(|e| IpcClientError::Protocol(e.to_string()))?;
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Reads the next callback from the daemon. Returns
    /// `Err(Disconnected)` when the daemon closes the connection.
    pub async fn recv(&mut self) -> Result<DaemonCallback, IpcClientError> {
        self.line_buf.clear();
        let bytes_read = self.reader.read_line(&mut self.line_buf).await?;
        if bytes_read == 0 {
            return Err(IpcClientError::Disconnected);
        }
        ipc::decode_callback(&self.line_buf).map_err(|e| IpcClientError::Protocol(e.to_string()))
    }
}
