//! Unix socket IPC server for client connections.
//!
//! Each connected client speaks the JSON-lines protocol from
//! [`nsd_core::ipc`]. The first line must be `Connect`; afterwards the
//! connection handler forwards verbs to the state machine and streams
//! callbacks back. Closing the socket (or any read error) is the client's
//! death notification — the state machine then expunges every outstanding
//! request of that connection.
//!
//! The client's uid is taken from the socket peer credentials
//! (`SO_PEERCRED`), not from anything the client sends.

use crate::app::AppMessage;
use nsd_core::ipc::{self, ClientVerb, DaemonCallback};
use nsd_core::types::ConnectorId;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Pause after a failed accept so a persistent error condition (EMFILE
/// and friends) cannot spin the loop hot.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(250);

/// The IPC server managing the Unix socket.
pub struct IpcServer {
    /// Path to the Unix socket file.
    socket_path: PathBuf,
    /// The underlying Unix listener.
    listener: UnixListener,
}

impl IpcServer {
    /// Binds the client socket at `socket_path`.
    ///
    /// Only one nsdd owns this path at a time, so a file already sitting
    /// there can only be the leftover of a run that died without cleanup;
    /// it is replaced rather than treated as a bind conflict.
    pub async fn bind(socket_path: &Path) -> Result<Self, std::io::Error> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::remove_file(socket_path) {
            Ok(()) => {
                warn!(socket = %socket_path.display(), "replaced leftover socket from a previous run");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let listener = UnixListener::bind(socket_path)?;
        info!(socket = %socket_path.display(), "accepting client connections");

        Ok(Self {
            socket_path: socket_path.to_owned(),
            listener,
        })
    }

    /// Runs the accept loop. Each connection gets its own handler task
    /// that posts messages onto the state-machine queue.
    pub async fn accept_loop(self, app_tx: mpsc::UnboundedSender<AppMessage>) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    let uid = match stream.peer_cred() {
                        Ok(cred) => cred.uid(),
                        Err(e) => {
                            warn!(error = %e, "rejecting connection without peer credentials");
                            continue;
                        }
                    };
                    debug!(uid, "accepted IPC client connection");
                    let tx = app_tx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, uid, tx).await {
                            debug!(error = %e, "IPC client connection ended");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed, backing off");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }
}

/// Best-effort removal of the socket path, so clients probing for the
/// daemon see "not running" rather than a dead socket they can connect to
/// and get nothing from.
impl Drop for IpcServer {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(socket = %self.socket_path.display(), error = %e, "socket cleanup failed");
            }
        }
    }
}

/// Handles a single client connection: handshake, then a select loop
/// interleaving inbound verbs and outbound callbacks.
async fn handle_client(
    stream: UnixStream,
    uid: u32,
    app_tx: mpsc::UnboundedSender<AppMessage>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (reader, mut writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let mut line_buf = String::new();

    // Handshake: the first line must be Connect.
    if buf_reader.read_line(&mut line_buf).await? == 0 {
        return Ok(());
    }
    let use_modern_backend = match ipc::decode_request(&line_buf) {
        Ok(ClientVerb::Connect { use_modern_backend }) => use_modern_backend,
        Ok(other) => {
            warn!(uid, verb = ?other, "first message was not Connect, closing");
            let line = ipc::encode_callback(&DaemonCallback::Error {
                message: "first message must be connect".to_string(),
            })?;
            writer.write_all(line.as_bytes()).await?;
            return Ok(());
        }
        Err(e) => {
            warn!(uid, error = %e, "malformed connect line, closing");
            return Ok(());
        }
    };
    line_buf.clear();

    let connector = ConnectorId::generate();
    let (callback_tx, mut callback_rx) = mpsc::unbounded_channel::<DaemonCallback>();
    if app_tx
        .send(AppMessage::RegisterClient {
            connector: connector.clone(),
            uid,
            use_modern_backend,
            callback: callback_tx,
        })
        .is_err()
    {
        error!("state machine queue closed");
        return Ok(());
    }

    let result: Result<(), Box<dyn std::error::Error>> = loop {
        tokio::select! {
            // Next verb from the client
            read_result = buf_reader.read_line(&mut line_buf) => {
                match read_result {
                    Ok(0) => {
                        debug!(%connector, "IPC client disconnected (EOF)");
                        break Ok(());
                    }
                    Ok(_) => {
                        match ipc::decode_request(&line_buf) {
                            Ok(request) => {
                                if app_tx
                                    .send(AppMessage::Verb {
                                        connector: connector.clone(),
                                        verb: request,
                                    })
                                    .is_err()
                                {
                                    break Ok(());
                                }
                            }
                            Err(e) => {
                                warn!(%connector, error = %e, line = %line_buf.trim(), "invalid IPC request");
                                let line = ipc::encode_callback(&DaemonCallback::Error {
                                    message: format!("failed to parse request: {e}"),
                                })?;
                                writer.write_all(line.as_bytes()).await?;
                            }
                        }
                        line_buf.clear();
                    }
                    Err(e) => break Err(e.into()),
                }
            }

            // Next callback from the state machine
            callback = callback_rx.recv() => {
                match callback {
                    Some(callback) => {
                        let line = ipc::encode_callback(&callback)?;
                        writer.write_all(line.as_bytes()).await?;
                    }
                    None => {
                        // The daemon dropped us (client was expunged).
                        debug!(%connector, "callback channel closed by daemon");
                        break Ok(());
                    }
                }
            }
        }
    };

    // Death notification: whatever ended the loop, the state machine must
    // clean up this connection's requests.
    let _ = app_tx.send(AppMessage::UnregisterClient {
        connector: connector.clone(),
    });
    result
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn connect_handshake_registers_and_eof_unregisters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nsdd.sock");
        let server = IpcServer::bind(&path).await.unwrap();

        let (app_tx, mut app_rx) = mpsc::unbounded_channel();
        tokio::spawn(server.accept_loop(app_tx));

        let mut stream = UnixStream::connect(&path).await.unwrap();
        let connect = ipc::encode_request(&ClientVerb::Connect {
            use_modern_backend: true,
        })
        .unwrap();
        stream.write_all(connect.as_bytes()).await.unwrap();

        let (connector, callback) = match app_rx.recv().await.unwrap() {
            AppMessage::RegisterClient {
                connector,
                uid: _,
                use_modern_backend,
                callback,
            } => {
                assert!(use_modern_backend);
                // A callback posted by the daemon reaches the client as a
                // JSON line.
                callback
                    .send(DaemonCallback::OnDaemonStateChanged { enabled: true })
                    .unwrap();
                (connector, callback)
            }
            other => panic!("expected RegisterClient, got {other:?}"),
        };

        let mut buf = vec![0u8; 256];
        let n = stream.read(&mut buf).await.unwrap();
        let line = String::from_utf8_lossy(&buf[..n]).to_string();
        assert!(line.contains("on_daemon_state_changed"), "line was {line}");

        // A verb flows through tagged with the connector.
        let discover = ipc::encode_request(&ClientVerb::DiscoverServices {
            request_id: 1,
            service_type: "_ipp._tcp".to_string(),
            network: None,
        })
        .unwrap();
        stream.write_all(discover.as_bytes()).await.unwrap();
        match app_rx.recv().await.unwrap() {
            AppMessage::Verb {
                connector: c,
                verb: ClientVerb::DiscoverServices { request_id, .. },
            } => {
                assert_eq!(c, connector);
                assert_eq!(request_id, 1);
            }
            other => panic!("expected DiscoverServices, got {other:?}"),
        }

        // EOF is the death notification.
        drop(stream);
        match app_rx.recv().await.unwrap() {
            AppMessage::UnregisterClient { connector: c } => assert_eq!(c, connector),
            other => panic!("expected UnregisterClient, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn first_message_must_be_connect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nsdd.sock");
        let server = IpcServer::bind(&path).await.unwrap();

        let (app_tx, mut app_rx) = mpsc::unbounded_channel();
        tokio::spawn(server.accept_loop(app_tx));

        let mut stream = UnixStream::connect(&path).await.unwrap();
        let line = ipc::encode_request(&ClientVerb::Dump).unwrap();
        stream.write_all(line.as_bytes()).await.unwrap();

        let mut buf = vec![0u8; 256];
        let n = stream.read(&mut buf).await.unwrap();
        let reply = String::from_utf8_lossy(&buf[..n]).to_string();
        assert!(reply.contains("must be connect"), "reply was {reply}");
        assert!(app_rx.try_recv().is_err(), "no client was registered");
    }
}
