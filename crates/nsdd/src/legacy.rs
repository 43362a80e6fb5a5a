//! Legacy helper-daemon adapter.
//!
//! The legacy backend is an external mdnsd-style helper process reached
//! over a Unix socket speaking length-prefixed MessagePack frames (see
//! [`nsd_core::mdnsd`]). This module wraps its verbs behind the
//! [`LegacyBackend`] trait and pumps its events onto the state-machine
//! queue; the state machine itself never performs socket I/O.
//!
//! The helper is started lazily on the first legacy request and stopped
//! again after the cleanup delay once it has been idle; both decisions are
//! made by the state machine, this adapter just actuates them.

use crate::app::AppMessage;
use nsd_core::mdnsd::{self, DaemonRequest};
use nsd_core::types::{ServiceInfo, TransactionId};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// How long to wait for the helper's control socket to accept.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors surfaced to the state machine; all of them map to
/// `INTERNAL_ERROR` at the client boundary.
#[derive(Debug, Error)]
pub enum LegacyError {
    #[error("helper daemon is not running")]
    NotRunning,
    #[error("helper daemon connection lost")]
    ConnectionLost,
}

/// The verbs the orchestrator issues against the legacy backend.
pub trait LegacyBackend: Send {
    /// Ensures the helper daemon is up. Idempotent; called before every
    /// legacy verb so a stopped daemon is restarted first.
    fn start_daemon(&mut self);

    /// Tears the helper down after quiescence.
    fn stop_daemon(&mut self);

    fn discover(
        &mut self,
        tx: TransactionId,
        selector: &str,
        interface_index: u32,
    ) -> Result<(), LegacyError>;

    fn register_service(
        &mut self,
        tx: TransactionId,
        service: &ServiceInfo,
        interface_index: u32,
    ) -> Result<(), LegacyError>;

    fn resolve(
        &mut self,
        tx: TransactionId,
        service_name: &str,
        service_type: &str,
        interface_index: u32,
    ) -> Result<(), LegacyError>;

    fn get_addr_info(
        &mut self,
        tx: TransactionId,
        hostname: &str,
        interface_index: u32,
    ) -> Result<(), LegacyError>;

    /// Terminates the operation with this transaction id.
    fn stop(&mut self, tx: TransactionId) -> Result<(), LegacyError>;
}

/// Shipped implementation: frames over the helper's Unix control socket.
pub struct MdnsdBackend {
    socket_path: PathBuf,
    event_tx: mpsc::UnboundedSender<AppMessage>,
    /// Present while the helper connection is up (or being established).
    /// Requests sent before the connect completes are queued in the
    /// channel and flushed once the writer task starts.
    cmd_tx: Option<mpsc::UnboundedSender<DaemonRequest>>,
}

impl MdnsdBackend {
    pub fn new(socket_path: PathBuf, event_tx: mpsc::UnboundedSender<AppMessage>) -> Self {
        Self {
            socket_path,
            event_tx,
            cmd_tx: None,
        }
    }

    fn send(&mut self, request: DaemonRequest) -> Result<(), LegacyError> {
        let cmd_tx = self.cmd_tx.as_ref().ok_or(LegacyError::NotRunning)?;
        cmd_tx.send(request).map_err(|_| LegacyError::ConnectionLost)
    }
}

impl LegacyBackend for MdnsdBackend {
    fn start_daemon(&mut self) {
        // A closed sender means the previous connection died (or never
        // came up); reconnect in that case.
        if self.cmd_tx.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return;
        }
        info!(path = %self.socket_path.display(), "starting legacy helper daemon connection");

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        self.cmd_tx = Some(cmd_tx);

        let path = self.socket_path.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            match timeout(CONNECT_TIMEOUT, UnixStream::connect(&path)).await {
                Ok(Ok(stream)) => run_connection(stream, cmd_rx, event_tx).await,
                Ok(Err(e)) => {
                    error!(path = %path.display(), error = %e, "failed to connect to helper daemon");
                    let _ = event_tx.send(AppMessage::LegacyDaemonExited);
                }
                Err(_) => {
                    error!(path = %path.display(), "helper daemon connect timed out");
                    let _ = event_tx.send(AppMessage::LegacyDaemonExited);
                }
            }
        });
    }

    fn stop_daemon(&mut self) {
        if self.cmd_tx.take().is_some() {
            // Dropping the sender ends the writer task, which closes the
            // socket; the helper treats that as its stop signal.
            info!("stopping legacy helper daemon connection");
        }
    }

    fn discover(
        &mut self,
        tx: TransactionId,
        selector: &str,
        interface_index: u32,
    ) -> Result<(), LegacyError> {
        self.send(DaemonRequest::Discover {
            tx: tx.value(),
            service_type: selector.to_string(),
            interface_index,
        })
    }

    fn register_service(
        &mut self,
        tx: TransactionId,
        service: &ServiceInfo,
        interface_index: u32,
    ) -> Result<(), LegacyError> {
        self.send(DaemonRequest::Register {
            tx: tx.value(),
            service_name: service.service_name.clone(),
            service_type: service.service_type.clone(),
            port: service.port,
            txt: service.txt.clone(),
            interface_index,
        })
    }

    fn resolve(
        &mut self,
        tx: TransactionId,
        service_name: &str,
        service_type: &str,
        interface_index: u32,
    ) -> Result<(), LegacyError> {
        self.send(DaemonRequest::Resolve {
            tx: tx.value(),
            service_name: service_name.to_string(),
            service_type: service_type.to_string(),
            interface_index,
        })
    }

    fn get_addr_info(
        &mut self,
        tx: TransactionId,
        hostname: &str,
        interface_index: u32,
    ) -> Result<(), LegacyError> {
        self.send(DaemonRequest::GetAddrInfo {
            tx: tx.value(),
            hostname: hostname.to_string(),
            interface_index,
        })
    }

    fn stop(&mut self, tx: TransactionId) -> Result<(), LegacyError> {
        self.send(DaemonRequest::Stop { tx: tx.value() })
    }
}

/// Owns the helper socket: writes queued requests, reads events, posts
/// them to the state machine. Ends when either side closes.
async fn run_connection(
    stream: UnixStream,
    mut cmd_rx: mpsc::UnboundedReceiver<DaemonRequest>,
    event_tx: mpsc::UnboundedSender<AppMessage>,
) {
    let (mut reader, mut writer) = stream.into_split();

    let write_task = tokio::spawn(async move {
        while let Some(request) = cmd_rx.recv().await {
            if let Err(e) = mdnsd::write_request(&mut writer, &request).await {
                warn!(error = %e, "failed to write to helper daemon");
                break;
            }
        }
    });

    loop {
        match mdnsd::read_event(&mut reader).await {
            Ok(event) => {
                if event_tx.send(AppMessage::Legacy(event)).is_err() {
                    break;
                }
            }
            Err(mdnsd::WireError::ConnectionClosed) => {
                debug!("helper daemon closed the connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "error reading from helper daemon");
                break;
            }
        }
    }

    write_task.abort();
    let _ = event_tx.send(AppMessage::LegacyDaemonExited);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn verbs_fail_when_daemon_not_started() {
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let mut backend = MdnsdBackend::new(PathBuf::from("/nonexistent.sock"), event_tx);
        assert!(matches!(
            backend.discover(TransactionId::new(1), "_ipp._tcp", 0),
            Err(LegacyError::NotRunning)
        ));
        assert!(matches!(
            backend.stop(TransactionId::new(1)),
            Err(LegacyError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn failed_connect_posts_daemon_exited() {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut backend = MdnsdBackend::new(PathBuf::from("/nonexistent/mdnsd.sock"), event_tx);
        backend.start_daemon();
        match event_rx.recv().await {
            Some(AppMessage::LegacyDaemonExited) => {}
            other => panic!("expected LegacyDaemonExited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn requests_reach_a_fake_helper() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mdnsd.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut backend = MdnsdBackend::new(path, event_tx);
        backend.start_daemon();
        backend
            .discover(TransactionId::new(3), "_ipp._tcp", 2)
            .unwrap();

        let (stream, _) = listener.accept().await.unwrap();
        let (mut reader, mut writer) = stream.into_split();

        let request = mdnsd::read_request(&mut reader).await.unwrap();
        assert_eq!(
            request,
            DaemonRequest::Discover {
                tx: 3,
                service_type: "_ipp._tcp".to_string(),
                interface_index: 2,
            }
        );

        // The fake helper answers; the pump forwards it as a message.
        mdnsd::write_event(
            &mut writer,
            &mdnsd::DaemonEvent::ServiceFound {
                tx: 3,
                service_name: "printer1".to_string(),
                service_type: "_ipp._tcp".to_string(),
                net_id: 42,
                interface_index: 2,
            },
        )
        .await
        .unwrap();

        match event_rx.recv().await {
            Some(AppMessage::Legacy(mdnsd::DaemonEvent::ServiceFound { tx, .. })) => {
                assert_eq!(tx, 3);
            }
            other => panic!("expected ServiceFound, got {other:?}"),
        }
    }
}
