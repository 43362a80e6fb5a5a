//! The orchestrator state machine.
//!
//! `NsdService` owns every registry and is driven by exactly one task: all
//! client verbs, backend events, death notifications, and timer firings
//! are normalized into [`AppMessage`]s and consumed strictly serially from
//! a single queue. Handlers run to completion and never block on I/O;
//! backend adapters either act synchronously or post their results back as
//! messages.
//!
//! # States
//!
//! Dispatch is two-level. The **Enabled** child state handles the
//! operational verbs and backend events; anything it does not handle falls
//! through to the **Default** parent, which manages client registration,
//! daemon startup/cleanup, and answers operational verbs received outside
//! Enabled with an immediate failure (stop verbs get
//! `OPERATION_NOT_RUNNING`, the rest `INTERNAL_ERROR`). Entering Enabled
//! broadcasts the state change to every client; leaving it schedules a
//! helper-daemon stop.

use crate::clients::{
    ClientInfo, ClientRegistry, ClientRequest, DiscoveryPurpose, LegacyVerb, RequestHeader,
    StoreError,
};
use crate::engine::{lower_service_info, DiscoveryEngine, EngineEvent, LoweringKind};
use crate::eventlog::EventLog;
use crate::legacy::LegacyBackend;
use crate::links::LinkProvider;
use crate::lock::LockManager;
use crate::offload::{Dispatch, OffloadEntry, OffloadManager};
use crate::router::{Backend, BackendRouter, OperationKind};
use nsd_core::config::DaemonConfig;
use nsd_core::escape::{split_fullname, truncate_instance_name, unescape};
use nsd_core::ipc::{ClientVerb, DaemonCallback};
use nsd_core::mdnsd::{DaemonEvent, FailureKind};
use nsd_core::service_type::parse_type_and_subtype;
use nsd_core::types::{
    attribute_network, ClientRequestId, ConnectorId, ErrorCode, Network, OffloadServiceInfo,
    ServiceInfo, TransactionId, LOCAL_NET_ID, NETID_UNSET, OFFLOAD_TYPE_REPLY,
};
use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Everything the state machine consumes, from every source.
#[derive(Debug)]
pub enum AppMessage {
    /// A client channel completed its connect handshake.
    RegisterClient {
        connector: ConnectorId,
        uid: u32,
        use_modern_backend: bool,
        callback: mpsc::UnboundedSender<DaemonCallback>,
    },
    /// A client channel went away (explicit close or death).
    UnregisterClient { connector: ConnectorId },
    /// A verb received on an established client channel.
    Verb {
        connector: ConnectorId,
        verb: ClientVerb,
    },
    /// An event from the legacy helper daemon.
    Legacy(DaemonEvent),
    /// The legacy helper connection dropped.
    LegacyDaemonExited,
    /// An event from the modern engine.
    Engine(EngineEvent),
    /// The socket provider re-reported the Wi-Fi link set.
    NetworksChanged {
        wifi_lock_required: HashSet<Network>,
    },
    /// The idle-daemon cleanup timer fired.
    DaemonCleanup { generation: u64 },
    /// Enter the enabled state.
    Enable,
    /// Leave the enabled state.
    Disable,
    /// Stop the event loop.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Default,
    Enabled,
}

/// A child state either consumes a message or passes it to the parent.
enum Outcome {
    Handled,
    NotHandled(AppMessage),
}

/// The orchestrator.
pub struct NsdService {
    state: State,
    registry: ClientRegistry,
    router: BackendRouter,
    lock: LockManager,
    offload: OffloadManager,
    legacy: Box<dyn LegacyBackend>,
    engine: Box<dyn DiscoveryEngine>,
    links: Box<dyn LinkProvider>,
    log: EventLog,
    importance_cutoff: i32,
    cleanup_delay: Duration,
    /// Bumped on every arm/cancel; a firing with a stale generation is
    /// ignored, which is how the timer is cancelled.
    cleanup_generation: u64,
    cleanup_armed: bool,
    self_tx: mpsc::UnboundedSender<AppMessage>,
}

impl NsdService {
    pub fn new(
        config: &DaemonConfig,
        legacy: Box<dyn LegacyBackend>,
        engine: Box<dyn DiscoveryEngine>,
        links: Box<dyn LinkProvider>,
        lock: LockManager,
        self_tx: mpsc::UnboundedSender<AppMessage>,
    ) -> Self {
        Self {
            state: State::Default,
            registry: ClientRegistry::default(),
            router: BackendRouter::from_flags(&config.flags),
            lock,
            offload: OffloadManager::default(),
            legacy,
            engine,
            links,
            log: EventLog::new("state machine"),
            importance_cutoff: config.flags.running_app_active_importance_cutoff,
            cleanup_delay: Duration::from_millis(config.cleanup_delay_ms),
            cleanup_generation: 0,
            cleanup_armed: false,
            self_tx,
        }
    }

    /// Runs the event loop until `Shutdown`.
    pub async fn run(&mut self, mut rx: mpsc::UnboundedReceiver<AppMessage>) {
        info!("state machine started");
        while let Some(message) = rx.recv().await {
            if matches!(message, AppMessage::Shutdown) {
                info!("shutdown requested");
                self.transition(State::Default);
                self.engine.shutdown();
                break;
            }
            self.handle_message(message);
        }
        info!("state machine stopped");
    }

    /// Two-level dispatch: the Enabled child first, then the Default
    /// parent for whatever fell through.
    pub fn handle_message(&mut self, message: AppMessage) {
        let outcome = match self.state {
            State::Enabled => self.handle_enabled(message),
            State::Default => Outcome::NotHandled(message),
        };
        if let Outcome::NotHandled(message) = outcome {
            self.handle_default(message);
        }
    }

    // -- state transitions --------------------------------------------------

    fn transition(&mut self, next: State) {
        if self.state == next {
            return;
        }
        match (self.state, next) {
            (State::Default, State::Enabled) => {
                self.state = State::Enabled;
                self.log.record("entered Enabled");
                info!("service enabled");
                self.broadcast(DaemonCallback::OnDaemonStateChanged { enabled: true });
            }
            (State::Enabled, State::Default) => {
                self.state = State::Default;
                self.log.record("left Enabled");
                info!("service disabled");
                self.broadcast(DaemonCallback::OnDaemonStateChanged { enabled: false });
                // Exit hook: the helper daemon is no longer needed soon.
                self.schedule_daemon_cleanup();
            }
            _ => unreachable!(),
        }
    }

    fn broadcast(&mut self, callback: DaemonCallback) {
        for client in self.registry.clients() {
            client.send(callback.clone());
        }
    }

    // -- enabled state ------------------------------------------------------

    fn handle_enabled(&mut self, message: AppMessage) -> Outcome {
        match message {
            AppMessage::Verb { connector, verb } => match verb {
                ClientVerb::DiscoverServices {
                    request_id,
                    service_type,
                    network,
                } => {
                    self.handle_discover(connector, request_id, service_type, network);
                    Outcome::Handled
                }
                ClientVerb::StopDiscovery { request_id } => {
                    self.handle_stop_discovery(connector, request_id);
                    Outcome::Handled
                }
                ClientVerb::RegisterService {
                    request_id,
                    service,
                } => {
                    self.handle_register_service(connector, request_id, service);
                    Outcome::Handled
                }
                ClientVerb::UnregisterService { request_id } => {
                    self.handle_unregister_service(connector, request_id);
                    Outcome::Handled
                }
                ClientVerb::ResolveService {
                    request_id,
                    service,
                } => {
                    self.handle_resolve(connector, request_id, service);
                    Outcome::Handled
                }
                ClientVerb::StopResolution { request_id } => {
                    self.handle_stop_resolution(connector, request_id);
                    Outcome::Handled
                }
                ClientVerb::RegisterServiceCallback {
                    request_id,
                    service,
                } => {
                    self.handle_register_callback(connector, request_id, service);
                    Outcome::Handled
                }
                ClientVerb::UnregisterServiceCallback { request_id } => {
                    self.handle_unregister_callback(connector, request_id);
                    Outcome::Handled
                }
                ClientVerb::RegisterOffloadEngine {
                    engine_id,
                    interface,
                    capabilities,
                    offload_types,
                } => {
                    let dispatches = self.offload.register_engine(OffloadEntry {
                        connector,
                        engine_id,
                        interface,
                        capabilities,
                        offload_types,
                    });
                    self.send_dispatches(dispatches);
                    Outcome::Handled
                }
                ClientVerb::UnregisterOffloadEngine { engine_id } => {
                    self.offload.unregister_engine(&connector, engine_id);
                    Outcome::Handled
                }
                other => Outcome::NotHandled(AppMessage::Verb {
                    connector,
                    verb: other,
                }),
            },
            AppMessage::Legacy(event) => {
                self.handle_legacy_event(event);
                Outcome::Handled
            }
            AppMessage::Engine(event) => {
                self.handle_engine_event(event);
                Outcome::Handled
            }
            AppMessage::Disable => {
                self.transition(State::Default);
                Outcome::Handled
            }
            other => Outcome::NotHandled(other),
        }
    }

    // -- default (parent) state ---------------------------------------------

    fn handle_default(&mut self, message: AppMessage) {
        match message {
            AppMessage::RegisterClient {
                connector,
                uid,
                use_modern_backend,
                callback,
            } => {
                let client = ClientInfo::new(connector.clone(), uid, use_modern_backend, callback);
                if self.state == State::Enabled {
                    // The state broadcast is sticky: late connectors get it
                    // immediately.
                    client.send(DaemonCallback::OnDaemonStateChanged { enabled: true });
                }
                info!(%connector, uid, use_modern_backend, "client registered");
                self.log.record(format!("client {connector} connected (uid {uid})"));
                self.registry.insert_client(client);
            }
            AppMessage::UnregisterClient { connector } => {
                self.expunge_client(&connector);
            }
            AppMessage::Verb { connector, verb } => match verb {
                ClientVerb::StartDaemon => self.handle_start_daemon(connector),
                ClientVerb::SetUidImportance { uid, importance } => {
                    let active = importance <= self.importance_cutoff;
                    info!(uid, importance, active, "uid importance changed");
                    self.lock.set_uid_active(uid, active);
                    self.lock.evaluate(&self.registry);
                }
                ClientVerb::Dump => self.handle_dump(connector),
                ClientVerb::Connect { .. } => {
                    debug!(%connector, "duplicate connect, ignoring");
                }
                other => self.reject_outside_enabled(&connector, other),
            },
            AppMessage::NetworksChanged { wifi_lock_required } => {
                self.lock.set_required_networks(wifi_lock_required);
                self.lock.evaluate(&self.registry);
            }
            AppMessage::DaemonCleanup { generation } => {
                self.handle_daemon_cleanup(generation);
            }
            AppMessage::LegacyDaemonExited => {
                // The adapter reconnects on the next start_daemon; nothing
                // to tear down here (a stale notice must not touch a fresh
                // connection).
                warn!("legacy helper daemon connection dropped");
            }
            AppMessage::Enable => self.transition(State::Enabled),
            AppMessage::Disable => {}
            AppMessage::Legacy(event) => {
                debug!(?event, "legacy event outside Enabled, dropped");
            }
            AppMessage::Engine(event) => {
                debug!(?event, "engine event outside Enabled, dropped");
            }
            AppMessage::Shutdown => {}
        }
    }

    /// Default-state answers for operational verbs: stop verbs get
    /// `OPERATION_NOT_RUNNING`, everything else `INTERNAL_ERROR`.
    fn reject_outside_enabled(&mut self, connector: &ConnectorId, verb: ClientVerb) {
        let callback = match verb {
            ClientVerb::DiscoverServices { request_id, .. } => {
                Some(DaemonCallback::OnDiscoverServicesFailed {
                    request_id,
                    error: ErrorCode::InternalError,
                })
            }
            ClientVerb::RegisterService { request_id, .. } => {
                Some(DaemonCallback::OnRegisterServiceFailed {
                    request_id,
                    error: ErrorCode::InternalError,
                })
            }
            ClientVerb::ResolveService { request_id, .. } => {
                Some(DaemonCallback::OnResolveServiceFailed {
                    request_id,
                    error: ErrorCode::InternalError,
                })
            }
            ClientVerb::RegisterServiceCallback { request_id, .. } => {
                Some(DaemonCallback::OnServiceInfoCallbackRegistrationFailed {
                    request_id,
                    error: ErrorCode::InternalError,
                })
            }
            ClientVerb::StopDiscovery { request_id } => {
                Some(DaemonCallback::OnStopDiscoveryFailed {
                    request_id,
                    error: ErrorCode::OperationNotRunning,
                })
            }
            ClientVerb::UnregisterService { request_id } => {
                Some(DaemonCallback::OnUnregisterServiceFailed {
                    request_id,
                    error: ErrorCode::OperationNotRunning,
                })
            }
            ClientVerb::StopResolution { request_id } => {
                Some(DaemonCallback::OnStopResolutionFailed {
                    request_id,
                    error: ErrorCode::OperationNotRunning,
                })
            }
            other => {
                debug!(%connector, verb = ?other, "verb outside Enabled, dropped");
                None
            }
        };
        if let Some(callback) = callback {
            self.send_to(connector, callback);
        }
    }

    // -- daemon lifecycle ---------------------------------------------------

    fn handle_start_daemon(&mut self, connector: ConnectorId) {
        if let Some(client) = self.registry.client_mut(&connector) {
            client.is_pre_s = true;
            client.log.record("daemon startup requested");
        }
        self.cancel_daemon_cleanup();
        self.legacy.start_daemon();
    }

    /// Arms the idle-stop timer. Any later legacy activity or pre-S client
    /// cancels it by bumping the generation.
    fn schedule_daemon_cleanup(&mut self) {
        self.cleanup_generation += 1;
        self.cleanup_armed = true;
        let generation = self.cleanup_generation;
        let delay = self.cleanup_delay;
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(AppMessage::DaemonCleanup { generation });
        });
    }

    fn cancel_daemon_cleanup(&mut self) {
        self.cleanup_generation += 1;
        self.cleanup_armed = false;
    }

    /// Schedules the stop iff the helper has nothing left to serve.
    fn maybe_schedule_daemon_cleanup(&mut self) {
        if !self.registry.any_legacy_requests() && !self.registry.any_pre_s_client() {
            self.schedule_daemon_cleanup();
        }
    }

    fn handle_daemon_cleanup(&mut self, generation: u64) {
        if !self.cleanup_armed || generation != self.cleanup_generation {
            debug!(generation, "stale cleanup timer, ignoring");
            return;
        }
        self.cleanup_armed = false;
        if self.registry.any_legacy_requests() || self.registry.any_pre_s_client() {
            debug!("cleanup fired but the helper is busy again, ignoring");
            return;
        }
        self.log.record("stopping idle helper daemon");
        self.legacy.stop_daemon();
    }

    // -- operational verbs --------------------------------------------------

    fn handle_discover(
        &mut self,
        connector: ConnectorId,
        request_id: u16,
        service_type: String,
        network: Option<i32>,
    ) {
        let request_id = ClientRequestId::new(request_id);
        let Some(client) = self.registry.client(&connector) else {
            warn!(%connector, "discover from unknown client");
            return;
        };
        let reply = client.callback_sender();
        let opts_in = client.uses_modern_backend;

        if let Err(e) = self.registry.can_store(&connector, request_id) {
            let error = store_error_code(&e);
            warn!(%connector, %request_id, %error, "rejecting discovery");
            let _ = reply.send(DaemonCallback::OnDiscoverServicesFailed {
                request_id: request_id.value(),
                error,
            });
            return;
        }
        let Some(parsed) = parse_type_and_subtype(&service_type) else {
            warn!(%connector, service_type, "unparsable service type");
            let _ = reply.send(DaemonCallback::OnDiscoverServicesFailed {
                request_id: request_id.value(),
                error: ErrorCode::InternalError,
            });
            return;
        };
        let requested_network = network.map(Network::new);
        let interface_index = match self.resolve_interface(requested_network) {
            Ok(index) => index,
            Err(()) => {
                let _ = reply.send(DaemonCallback::OnDiscoverServicesFailed {
                    request_id: request_id.value(),
                    error: ErrorCode::InternalError,
                });
                return;
            }
        };

        let backend = self
            .router
            .pick(OperationKind::Discovery, &parsed.service_type, opts_in);
        let tx = self.registry.allocate_transaction_id();

        match backend {
            Backend::Modern => {
                let listener = match self.engine.register_listener(
                    &parsed.listen_selector(),
                    requested_network,
                    tx,
                ) {
                    Ok(listener) => listener,
                    Err(e) => {
                        warn!(%connector, error = %e, "engine rejected discovery listener");
                        let _ = reply.send(DaemonCallback::OnDiscoverServicesFailed {
                            request_id: request_id.value(),
                            error: ErrorCode::InternalError,
                        });
                        return;
                    }
                };
                self.registry.insert_request(
                    &connector,
                    request_id,
                    ClientRequest::Discovery {
                        header: RequestHeader::new(tx, request_id, &service_type),
                        listener,
                        requested_network,
                        purpose: DiscoveryPurpose::Browse,
                    },
                );
                self.lock.evaluate(&self.registry);
            }
            Backend::Legacy => {
                self.legacy.start_daemon();
                if let Err(e) =
                    self.legacy
                        .discover(tx, &parsed.listen_selector(), interface_index)
                {
                    warn!(%connector, error = %e, "legacy discover failed");
                    let _ = reply.send(DaemonCallback::OnDiscoverServicesFailed {
                        request_id: request_id.value(),
                        error: ErrorCode::InternalError,
                    });
                    return;
                }
                self.registry.insert_request(
                    &connector,
                    request_id,
                    ClientRequest::Legacy {
                        header: RequestHeader::new(tx, request_id, &service_type),
                        verb: LegacyVerb::Discover,
                    },
                );
                self.cancel_daemon_cleanup();
            }
        }

        if let Some(client) = self.registry.client_mut(&connector) {
            client
                .log
                .record(format!("discover {service_type} as tx {tx} ({backend:?})"));
        }
        let _ = reply.send(DaemonCallback::OnDiscoverServicesStarted {
            request_id: request_id.value(),
            service_type,
        });
    }

    fn handle_stop_discovery(&mut self, connector: ConnectorId, request_id: u16) {
        let request_id = ClientRequestId::new(request_id);
        let Some(request) = self.registry.remove_request(&connector, request_id) else {
            debug!(%connector, %request_id, "stop for unknown discovery, dropped");
            return;
        };
        self.log_request_metrics(&connector, request_id, &request);

        let stopped = match request {
            ClientRequest::Legacy { header, .. } => {
                let result = self.legacy.stop(header.transaction_id);
                self.maybe_schedule_daemon_cleanup();
                result.is_ok()
            }
            ClientRequest::Discovery { listener, .. } => {
                self.engine.unregister_listener(listener);
                self.after_modern_removed();
                true
            }
            ClientRequest::Advertiser { header, .. } => {
                warn!(%connector, tx = %header.transaction_id, "stop-discovery on an advertiser request");
                self.engine.remove_service(header.transaction_id);
                self.after_modern_removed();
                true
            }
        };

        let callback = if stopped {
            DaemonCallback::OnStopDiscoverySucceeded {
                request_id: request_id.value(),
            }
        } else {
            DaemonCallback::OnStopDiscoveryFailed {
                request_id: request_id.value(),
                error: ErrorCode::InternalError,
            }
        };
        self.send_to(&connector, callback);
    }

    fn handle_register_service(
        &mut self,
        connector: ConnectorId,
        request_id: u16,
        mut service: ServiceInfo,
    ) {
        let request_id = ClientRequestId::new(request_id);
        let Some(client) = self.registry.client(&connector) else {
            warn!(%connector, "register from unknown client");
            return;
        };
        let reply = client.callback_sender();
        let opts_in = client.uses_modern_backend;

        if let Err(e) = self.registry.can_store(&connector, request_id) {
            let _ = reply.send(DaemonCallback::OnRegisterServiceFailed {
                request_id: request_id.value(),
                error: store_error_code(&e),
            });
            return;
        }
        let Some(parsed) = parse_type_and_subtype(&service.service_type) else {
            let _ = reply.send(DaemonCallback::OnRegisterServiceFailed {
                request_id: request_id.value(),
                error: ErrorCode::InternalError,
            });
            return;
        };
        // RFC 6763 §4.1.1: instance names carry at most 63 UTF-8 bytes.
        service.service_name = truncate_instance_name(&service.service_name).to_string();
        service.service_type = parsed.service_type.clone();

        let requested_network = service.network;
        let interface_index = match self.resolve_interface(requested_network) {
            Ok(index) => index,
            Err(()) => {
                let _ = reply.send(DaemonCallback::OnRegisterServiceFailed {
                    request_id: request_id.value(),
                    error: ErrorCode::InternalError,
                });
                return;
            }
        };

        let backend =
            self.router
                .pick(OperationKind::Advertising, &parsed.service_type, opts_in);
        let tx = self.registry.allocate_transaction_id();

        match backend {
            Backend::Modern => {
                if let Err(e) = self.engine.add_service(tx, &service, Some(interface_index)) {
                    warn!(%connector, error = %e, "engine rejected advertisement");
                    let _ = reply.send(DaemonCallback::OnRegisterServiceFailed {
                        request_id: request_id.value(),
                        error: ErrorCode::InternalError,
                    });
                    return;
                }
                self.registry.insert_request(
                    &connector,
                    request_id,
                    ClientRequest::Advertiser {
                        header: RequestHeader::new(tx, request_id, &service.service_type),
                        requested_network,
                        offload: None,
                    },
                );
                self.lock.evaluate(&self.registry);
            }
            Backend::Legacy => {
                self.legacy.start_daemon();
                if let Err(e) = self.legacy.register_service(tx, &service, interface_index) {
                    warn!(%connector, error = %e, "legacy register failed");
                    let _ = reply.send(DaemonCallback::OnRegisterServiceFailed {
                        request_id: request_id.value(),
                        error: ErrorCode::InternalError,
                    });
                    return;
                }
                self.registry.insert_request(
                    &connector,
                    request_id,
                    ClientRequest::Legacy {
                        header: RequestHeader::new(tx, request_id, &service.service_type),
                        verb: LegacyVerb::Register,
                    },
                );
                self.cancel_daemon_cleanup();
            }
        }
        // No immediate success: the backend confirms (or renames) first.
        if let Some(client) = self.registry.client_mut(&connector) {
            client.log.record(format!(
                "register {}.{} as tx {tx} ({backend:?})",
                service.service_name, service.service_type
            ));
        }
    }

    fn handle_unregister_service(&mut self, connector: ConnectorId, request_id: u16) {
        let request_id = ClientRequestId::new(request_id);
        let Some(request) = self.registry.remove_request(&connector, request_id) else {
            debug!(%connector, %request_id, "unregister for unknown advertisement, dropped");
            return;
        };
        self.log_request_metrics(&connector, request_id, &request);

        let unregistered = match request {
            ClientRequest::Legacy { header, .. } => {
                let result = self.legacy.stop(header.transaction_id);
                self.maybe_schedule_daemon_cleanup();
                result.is_ok()
            }
            ClientRequest::Advertiser {
                header, offload, ..
            } => {
                self.engine.remove_service(header.transaction_id);
                if let Some((interface, info)) = offload {
                    let dispatches = self.offload.service_removed(&interface, info);
                    self.send_dispatches(dispatches);
                }
                self.after_modern_removed();
                true
            }
            ClientRequest::Discovery { listener, header, .. } => {
                warn!(%connector, tx = %header.transaction_id, "unregister-service on a listener request");
                self.engine.unregister_listener(listener);
                self.after_modern_removed();
                true
            }
        };

        let callback = if unregistered {
            DaemonCallback::OnUnregisterServiceSucceeded {
                request_id: request_id.value(),
            }
        } else {
            DaemonCallback::OnUnregisterServiceFailed {
                request_id: request_id.value(),
                error: ErrorCode::InternalError,
            }
        };
        self.send_to(&connector, callback);
    }

    fn handle_resolve(&mut self, connector: ConnectorId, request_id: u16, service: ServiceInfo) {
        let request_id = ClientRequestId::new(request_id);
        let Some(client) = self.registry.client(&connector) else {
            warn!(%connector, "resolve from unknown client");
            return;
        };
        let reply = client.callback_sender();
        let opts_in = client.uses_modern_backend;
        let resolve_in_flight = client.resolved_service.is_some();

        if let Err(e) = self.registry.can_store(&connector, request_id) {
            let _ = reply.send(DaemonCallback::OnResolveServiceFailed {
                request_id: request_id.value(),
                error: store_error_code(&e),
            });
            return;
        }
        let Some(parsed) = parse_type_and_subtype(&service.service_type) else {
            let _ = reply.send(DaemonCallback::OnResolveServiceFailed {
                request_id: request_id.value(),
                error: ErrorCode::InternalError,
            });
            return;
        };
        let requested_network = service.network;
        let interface_index = match self.resolve_interface(requested_network) {
            Ok(index) => index,
            Err(()) => {
                let _ = reply.send(DaemonCallback::OnResolveServiceFailed {
                    request_id: request_id.value(),
                    error: ErrorCode::InternalError,
                });
                return;
            }
        };

        let backend = self
            .router
            .pick(OperationKind::Discovery, &parsed.service_type, opts_in);
        let tx = self.registry.allocate_transaction_id();

        match backend {
            Backend::Modern => {
                let listener = match self.engine.register_listener(
                    &parsed.listen_selector(),
                    requested_network,
                    tx,
                ) {
                    Ok(listener) => listener,
                    Err(e) => {
                        warn!(%connector, error = %e, "engine rejected resolve listener");
                        let _ = reply.send(DaemonCallback::OnResolveServiceFailed {
                            request_id: request_id.value(),
                            error: ErrorCode::InternalError,
                        });
                        return;
                    }
                };
                self.registry.insert_request(
                    &connector,
                    request_id,
                    ClientRequest::Discovery {
                        header: RequestHeader::new(tx, request_id, &service.service_type),
                        listener,
                        requested_network,
                        purpose: DiscoveryPurpose::Resolve {
                            instance_name: service.service_name.clone(),
                        },
                    },
                );
                self.lock.evaluate(&self.registry);
            }
            Backend::Legacy => {
                // One legacy resolve at a time per client: the scratchpad
                // can only chain a single resolution.
                if resolve_in_flight {
                    let _ = reply.send(DaemonCallback::OnResolveServiceFailed {
                        request_id: request_id.value(),
                        error: ErrorCode::AlreadyActive,
                    });
                    return;
                }
                self.legacy.start_daemon();
                if let Err(e) = self.legacy.resolve(
                    tx,
                    &service.service_name,
                    &parsed.service_type,
                    interface_index,
                ) {
                    warn!(%connector, error = %e, "legacy resolve failed");
                    let _ = reply.send(DaemonCallback::OnResolveServiceFailed {
                        request_id: request_id.value(),
                        error: ErrorCode::InternalError,
                    });
                    return;
                }
                if let Some(client) = self.registry.client_mut(&connector) {
                    client.resolved_service = Some(ServiceInfo {
                        service_name: service.service_name.clone(),
                        service_type: parsed.service_type.clone(),
                        ..Default::default()
                    });
                }
                self.registry.insert_request(
                    &connector,
                    request_id,
                    ClientRequest::Legacy {
                        header: RequestHeader::new(tx, request_id, &service.service_type),
                        verb: LegacyVerb::Resolve,
                    },
                );
                self.cancel_daemon_cleanup();
            }
        }
    }

    fn handle_stop_resolution(&mut self, connector: ConnectorId, request_id: u16) {
        let request_id = ClientRequestId::new(request_id);
        let Some(request) = self.registry.remove_request(&connector, request_id) else {
            self.send_to(
                &connector,
                DaemonCallback::OnStopResolutionFailed {
                    request_id: request_id.value(),
                    error: ErrorCode::OperationNotRunning,
                },
            );
            return;
        };

        let stopped = match request {
            ClientRequest::Legacy { header, .. } => {
                let result = self.legacy.stop(header.transaction_id);
                if let Some(client) = self.registry.client_mut(&connector) {
                    client.resolved_service = None;
                }
                self.maybe_schedule_daemon_cleanup();
                result.is_ok()
            }
            ClientRequest::Discovery { listener, .. } => {
                self.engine.unregister_listener(listener);
                self.after_modern_removed();
                true
            }
            ClientRequest::Advertiser { header, .. } => {
                warn!(%connector, tx = %header.transaction_id, "stop-resolution on an advertiser request");
                self.engine.remove_service(header.transaction_id);
                self.after_modern_removed();
                true
            }
        };

        let callback = if stopped {
            DaemonCallback::OnStopResolutionSucceeded {
                request_id: request_id.value(),
            }
        } else {
            DaemonCallback::OnStopResolutionFailed {
                request_id: request_id.value(),
                error: ErrorCode::InternalError,
            }
        };
        self.send_to(&connector, callback);
    }

    fn handle_register_callback(
        &mut self,
        connector: ConnectorId,
        request_id: u16,
        service: ServiceInfo,
    ) {
        let request_id = ClientRequestId::new(request_id);
        let Some(client) = self.registry.client(&connector) else {
            warn!(%connector, "watch from unknown client");
            return;
        };
        let reply = client.callback_sender();

        if let Err(e) = self.registry.can_store(&connector, request_id) {
            let _ = reply.send(DaemonCallback::OnServiceInfoCallbackRegistrationFailed {
                request_id: request_id.value(),
                error: store_error_code(&e),
            });
            return;
        }
        let Some(parsed) = parse_type_and_subtype(&service.service_type) else {
            let _ = reply.send(DaemonCallback::OnServiceInfoCallbackRegistrationFailed {
                request_id: request_id.value(),
                error: ErrorCode::BadParameters,
            });
            return;
        };
        let requested_network = service.network;
        if self.resolve_interface(requested_network).is_err() {
            let _ = reply.send(DaemonCallback::OnServiceInfoCallbackRegistrationFailed {
                request_id: request_id.value(),
                error: ErrorCode::InternalError,
            });
            return;
        }

        // Watches always run on the modern engine.
        let tx = self.registry.allocate_transaction_id();
        let listener = match self.engine.register_listener(
            &parsed.listen_selector(),
            requested_network,
            tx,
        ) {
            Ok(listener) => listener,
            Err(e) => {
                warn!(%connector, error = %e, "engine rejected watch listener");
                let _ = reply.send(DaemonCallback::OnServiceInfoCallbackRegistrationFailed {
                    request_id: request_id.value(),
                    error: ErrorCode::InternalError,
                });
                return;
            }
        };
        self.registry.insert_request(
            &connector,
            request_id,
            ClientRequest::Discovery {
                header: RequestHeader::new(tx, request_id, &service.service_type),
                listener,
                requested_network,
                purpose: DiscoveryPurpose::Watch {
                    instance_name: service.service_name.clone(),
                },
            },
        );
        self.lock.evaluate(&self.registry);
        let _ = reply.send(DaemonCallback::OnServiceInfoCallbackRegistered {
            request_id: request_id.value(),
        });
    }

    fn handle_unregister_callback(&mut self, connector: ConnectorId, request_id: u16) {
        let request_id = ClientRequestId::new(request_id);
        let is_watch = matches!(
            self.registry.request(&connector, request_id),
            Some(ClientRequest::Discovery {
                purpose: DiscoveryPurpose::Watch { .. },
                ..
            })
        );
        if !is_watch {
            debug!(%connector, %request_id, "unregister-callback without a watch request, ignored");
            return;
        }
        let Some(ClientRequest::Discovery { listener, .. }) =
            self.registry.remove_request(&connector, request_id)
        else {
            return;
        };
        self.engine.unregister_listener(listener);
        self.after_modern_removed();
        self.send_to(
            &connector,
            DaemonCallback::OnServiceInfoCallbackUnregistered {
                request_id: request_id.value(),
            },
        );
    }

    fn handle_dump(&mut self, connector: ConnectorId) {
        let metrics = self.engine.advertiser_metrics();
        let mut text = String::new();
        text.push_str(&format!(
            "clients: {}, outstanding transactions: {}, multicast lock held: {}\n",
            self.registry.clients().count(),
            self.registry.outstanding_count(),
            self.lock.is_held(),
        ));
        text.push_str(&format!(
            "advertiser: {} registered, {} conflicts\n",
            metrics.registered_services, metrics.conflicts,
        ));
        self.log.dump_into(&mut text);
        for client in self.registry.clients() {
            client.log.dump_into(&mut text);
        }
        self.send_to(&connector, DaemonCallback::DumpOutput { text });
    }

    // -- legacy backend events ----------------------------------------------

    fn handle_legacy_event(&mut self, event: DaemonEvent) {
        match event {
            DaemonEvent::ServiceFound {
                tx,
                service_name,
                service_type,
                net_id,
                interface_index,
            } => {
                self.legacy_service_event(tx, service_name, service_type, net_id, interface_index, true);
            }
            DaemonEvent::ServiceLost {
                tx,
                service_name,
                service_type,
                net_id,
                interface_index,
            } => {
                self.legacy_service_event(tx, service_name, service_type, net_id, interface_index, false);
            }
            DaemonEvent::ServiceRegistered { tx, service_name } => {
                let tx = TransactionId::new(tx);
                let Some((connector, request_id)) = self.registry.owner_of(tx) else {
                    debug!(%tx, "registered event for unknown transaction");
                    return;
                };
                let service_type = self
                    .registry
                    .request(&connector, request_id)
                    .map(|r| r.header().service_type.clone())
                    .unwrap_or_default();
                self.send_to(
                    &connector,
                    DaemonCallback::OnRegisterServiceSucceeded {
                        request_id: request_id.value(),
                        service: ServiceInfo {
                            service_name: unescape(&service_name),
                            service_type,
                            ..Default::default()
                        },
                    },
                );
            }
            DaemonEvent::ServiceResolved {
                tx,
                fullname,
                hostname,
                port,
                txt,
                interface_index,
            } => {
                self.legacy_service_resolved(tx, fullname, hostname, port, txt, interface_index);
            }
            DaemonEvent::AddressResolved {
                tx,
                address,
                net_id,
                interface_index,
            } => {
                self.legacy_address_resolved(tx, address, net_id, interface_index);
            }
            DaemonEvent::OperationFailed { tx, kind } => {
                self.legacy_operation_failed(tx, kind);
            }
        }
    }

    /// SERVICE_FOUND / SERVICE_LOST with the dummy-net filter: events with
    /// no backing network or on the local-advertisement loopback never
    /// reach clients.
    fn legacy_service_event(
        &mut self,
        tx: u32,
        service_name: String,
        service_type: String,
        net_id: i32,
        interface_index: u32,
        found: bool,
    ) {
        if net_id == NETID_UNSET || net_id == LOCAL_NET_ID {
            debug!(tx, net_id, "discarding service event without usable network");
            return;
        }
        let tx = TransactionId::new(tx);
        let Some((connector, request_id)) = self.registry.owner_of(tx) else {
            debug!(%tx, "service event for unknown transaction");
            return;
        };
        let name = unescape(&service_name);
        if let Some(request) = self.registry.request_mut(&connector, request_id) {
            if found {
                request.header_mut().note_found(&name);
            } else {
                request.header_mut().note_lost(&name);
            }
        }
        let (network, iface) = attribute_network(net_id, Some(interface_index));
        let service = ServiceInfo {
            service_name: name,
            service_type,
            network,
            interface_index: iface,
            ..Default::default()
        };
        let callback = if found {
            DaemonCallback::OnServiceFound {
                request_id: request_id.value(),
                service,
            }
        } else {
            DaemonCallback::OnServiceLost {
                request_id: request_id.value(),
                service,
            }
        };
        self.send_to(&connector, callback);
    }

    /// First phase of the legacy resolve done: capture name/port/txt in the
    /// scratchpad, then chain into the address lookup under a fresh
    /// transaction that keeps the caller's request id and start time.
    fn legacy_service_resolved(
        &mut self,
        tx: u32,
        fullname: String,
        hostname: String,
        port: u16,
        txt: std::collections::BTreeMap<String, Vec<u8>>,
        interface_index: u32,
    ) {
        let tx1 = TransactionId::new(tx);
        let Some((connector, request_id)) = self.registry.owner_of(tx1) else {
            debug!(%tx1, "resolved event for unknown transaction");
            return;
        };

        let Some((instance_name, service_type)) = split_fullname(&fullname) else {
            warn!(fullname, "unparsable resolved name");
            self.fail_legacy_resolve(tx1, &connector, request_id);
            return;
        };

        if let Some(client) = self.registry.client_mut(&connector) {
            client.resolved_service = Some(ServiceInfo {
                service_name: instance_name,
                service_type,
                port,
                txt,
                ..Default::default()
            });
        }

        let _ = self.legacy.stop(tx1);
        let Some((_, _, old_request)) = self.registry.remove_by_transaction(tx1) else {
            return;
        };
        let ClientRequest::Legacy { header, .. } = old_request else {
            warn!(%tx1, "resolved event on a non-legacy request");
            return;
        };

        let tx2 = self.registry.allocate_transaction_id();
        if let Err(e) = self.legacy.get_addr_info(tx2, &hostname, interface_index) {
            warn!(error = %e, "address lookup failed to start");
            if let Some(client) = self.registry.client_mut(&connector) {
                client.resolved_service = None;
            }
            self.send_to(
                &connector,
                DaemonCallback::OnResolveServiceFailed {
                    request_id: request_id.value(),
                    error: ErrorCode::InternalError,
                },
            );
            self.maybe_schedule_daemon_cleanup();
            return;
        }
        self.registry.insert_request(
            &connector,
            request_id,
            ClientRequest::Legacy {
                header: header.migrated(tx2),
                verb: LegacyVerb::Resolve,
            },
        );
        debug!(%tx1, %tx2, "resolve chained into address lookup");
    }

    /// Second phase done: attach host and network and finish, or fail if
    /// the daemon produced nothing usable.
    fn legacy_address_resolved(
        &mut self,
        tx: u32,
        address: String,
        net_id: i32,
        interface_index: u32,
    ) {
        let tx2 = TransactionId::new(tx);
        let Some((connector, request_id)) = self.registry.owner_of(tx2) else {
            debug!(%tx2, "address event for unknown transaction");
            return;
        };
        let scratch = self
            .registry
            .client_mut(&connector)
            .and_then(|c| c.resolved_service.take());

        let callback = match (net_id != NETID_UNSET, address.parse::<IpAddr>().ok(), scratch) {
            (true, Some(host), Some(mut service)) => {
                let (network, iface) = attribute_network(net_id, Some(interface_index));
                service.host = Some(host);
                service.network = network;
                service.interface_index = iface;
                DaemonCallback::OnResolveServiceSucceeded {
                    request_id: request_id.value(),
                    service,
                }
            }
            _ => {
                warn!(%tx2, address, net_id, "address lookup yielded nothing usable");
                DaemonCallback::OnResolveServiceFailed {
                    request_id: request_id.value(),
                    error: ErrorCode::InternalError,
                }
            }
        };

        let _ = self.legacy.stop(tx2);
        self.registry.remove_by_transaction(tx2);
        self.send_to(&connector, callback);
        self.maybe_schedule_daemon_cleanup();
    }

    fn legacy_operation_failed(&mut self, tx: u32, kind: FailureKind) {
        let tx = TransactionId::new(tx);
        let Some((connector, request_id)) = self.registry.owner_of(tx) else {
            debug!(%tx, ?kind, "failure for unknown transaction");
            return;
        };
        match kind {
            FailureKind::Resolution | FailureKind::AddressLookup => {
                self.fail_legacy_resolve(tx, &connector, request_id);
            }
            FailureKind::Discovery => {
                let _ = self.legacy.stop(tx);
                self.registry.remove_by_transaction(tx);
                self.send_to(
                    &connector,
                    DaemonCallback::OnDiscoverServicesFailed {
                        request_id: request_id.value(),
                        error: ErrorCode::InternalError,
                    },
                );
                self.maybe_schedule_daemon_cleanup();
            }
            FailureKind::Registration => {
                let _ = self.legacy.stop(tx);
                self.registry.remove_by_transaction(tx);
                self.send_to(
                    &connector,
                    DaemonCallback::OnRegisterServiceFailed {
                        request_id: request_id.value(),
                        error: ErrorCode::InternalError,
                    },
                );
                self.maybe_schedule_daemon_cleanup();
            }
        }
    }

    /// Common failure path for either resolve phase: stop the transaction,
    /// drop the request, clear the scratchpad, tell the caller.
    fn fail_legacy_resolve(
        &mut self,
        tx: TransactionId,
        connector: &ConnectorId,
        request_id: ClientRequestId,
    ) {
        let _ = self.legacy.stop(tx);
        self.registry.remove_by_transaction(tx);
        if let Some(client) = self.registry.client_mut(connector) {
            client.resolved_service = None;
        }
        self.send_to(
            connector,
            DaemonCallback::OnResolveServiceFailed {
                request_id: request_id.value(),
                error: ErrorCode::InternalError,
            },
        );
        self.maybe_schedule_daemon_cleanup();
    }

    // -- modern engine events -----------------------------------------------

    fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::ServiceFound { tx, service } => {
                let Some((connector, request_id)) = self.registry.owner_of(tx) else {
                    debug!(%tx, "engine found for unknown transaction");
                    return;
                };
                let (purpose, listener) = {
                    let Some(request) = self.registry.request_mut(&connector, request_id) else {
                        return;
                    };
                    let header = request.header_mut();
                    header.note_found(&service.instance_name);
                    header.mark_from_cache(service.is_from_cache);
                    match request {
                        ClientRequest::Discovery {
                            purpose, listener, ..
                        } => (purpose.clone(), *listener),
                        _ => {
                            debug!(%tx, "found event on a non-listener request");
                            return;
                        }
                    }
                };
                match purpose {
                    DiscoveryPurpose::Browse => {
                        if let Some(info) = lower_service_info(LoweringKind::Found, &service) {
                            self.send_to(
                                &connector,
                                DaemonCallback::OnServiceFound {
                                    request_id: request_id.value(),
                                    service: info,
                                },
                            );
                        }
                    }
                    DiscoveryPurpose::Resolve { instance_name } => {
                        if service.instance_name != instance_name {
                            return;
                        }
                        let Some(info) =
                            lower_service_info(LoweringKind::ResolveSucceeded, &service)
                        else {
                            return;
                        };
                        // One-shot: the listener has done its job.
                        self.send_to(
                            &connector,
                            DaemonCallback::OnResolveServiceSucceeded {
                                request_id: request_id.value(),
                                service: info,
                            },
                        );
                        self.engine.unregister_listener(listener);
                        self.registry.remove_by_transaction(tx);
                        self.after_modern_removed();
                    }
                    DiscoveryPurpose::Watch { instance_name } => {
                        if service.instance_name != instance_name {
                            return;
                        }
                        if let Some(info) = lower_service_info(LoweringKind::Updated, &service) {
                            self.send_to(
                                &connector,
                                DaemonCallback::OnServiceUpdated {
                                    request_id: request_id.value(),
                                    service: info,
                                },
                            );
                        }
                    }
                }
            }
            EngineEvent::ServiceLost { tx, service } => {
                let Some((connector, request_id)) = self.registry.owner_of(tx) else {
                    debug!(%tx, "engine lost for unknown transaction");
                    return;
                };
                let purpose = {
                    let Some(request) = self.registry.request_mut(&connector, request_id) else {
                        return;
                    };
                    request.header_mut().note_lost(&service.instance_name);
                    match request {
                        ClientRequest::Discovery { purpose, .. } => purpose.clone(),
                        _ => return,
                    }
                };
                match purpose {
                    DiscoveryPurpose::Browse => {
                        if let Some(info) = lower_service_info(LoweringKind::Lost, &service) {
                            self.send_to(
                                &connector,
                                DaemonCallback::OnServiceLost {
                                    request_id: request_id.value(),
                                    service: info,
                                },
                            );
                        }
                    }
                    DiscoveryPurpose::Watch { instance_name } => {
                        if service.instance_name == instance_name {
                            self.send_to(
                                &connector,
                                DaemonCallback::OnServiceUpdatedLost {
                                    request_id: request_id.value(),
                                },
                            );
                        }
                    }
                    DiscoveryPurpose::Resolve { .. } => {}
                }
            }
            EngineEvent::RegisterSucceeded {
                tx,
                service_name,
                hostname,
                interface,
            } => {
                let Some((connector, request_id)) = self.registry.owner_of(tx) else {
                    debug!(%tx, "register-succeeded for unknown transaction");
                    return;
                };
                let offload_info = {
                    let Some(request) = self.registry.request_mut(&connector, request_id) else {
                        return;
                    };
                    let service_type = request.header().service_type.clone();
                    let ClientRequest::Advertiser { offload, .. } = request else {
                        debug!(%tx, "register-succeeded on a non-advertiser request");
                        return;
                    };
                    let info = OffloadServiceInfo {
                        service_name: service_name.clone(),
                        service_type: service_type.clone(),
                        hostname,
                        subtypes: Vec::new(),
                        offload_type: OFFLOAD_TYPE_REPLY,
                        priority: 0,
                    };
                    *offload = Some((interface.clone(), info.clone()));
                    info
                };
                let service_type = offload_info.service_type.clone();
                self.send_to(
                    &connector,
                    DaemonCallback::OnRegisterServiceSucceeded {
                        request_id: request_id.value(),
                        service: ServiceInfo {
                            service_name,
                            service_type,
                            ..Default::default()
                        },
                    },
                );
                let dispatches = self.offload.service_updated(&interface, offload_info);
                self.send_dispatches(dispatches);
            }
            EngineEvent::RegisterFailed { tx } => {
                let Some((connector, request_id, _)) = self.registry.remove_by_transaction(tx)
                else {
                    debug!(%tx, "register-failed for unknown transaction");
                    return;
                };
                self.after_modern_removed();
                self.send_to(
                    &connector,
                    DaemonCallback::OnRegisterServiceFailed {
                        request_id: request_id.value(),
                        error: ErrorCode::InternalError,
                    },
                );
            }
            EngineEvent::QuerySent { tx } => {
                if let Some((connector, request_id)) = self.registry.owner_of(tx) {
                    if let Some(request) = self.registry.request_mut(&connector, request_id) {
                        request.header_mut().note_query_sent();
                    }
                }
            }
        }
    }

    // -- client lifecycle ---------------------------------------------------

    /// Full cleanup after a channel death or explicit unregister: every
    /// outstanding operation is cancelled in the backend that runs it, the
    /// registries drop all traces, and the derived state (offload set,
    /// socket monitor, helper daemon, multicast lock) is recomputed.
    fn expunge_client(&mut self, connector: &ConnectorId) {
        let Some(client) = self.registry.remove_client(connector) else {
            debug!(%connector, "unregister for unknown client");
            return;
        };
        let mut had_modern = false;
        let mut had_legacy = client.is_pre_s;
        let mut dispatches: Vec<Dispatch> = Vec::new();

        for (request_id, request) in client.requests {
            self.log_request_metrics(connector, request_id, &request);
            match request {
                ClientRequest::Legacy { header, verb } => {
                    had_legacy = true;
                    debug!(tx = %header.transaction_id, ?verb, "expunging legacy request");
                    let _ = self.legacy.stop(header.transaction_id);
                }
                ClientRequest::Advertiser {
                    header, offload, ..
                } => {
                    had_modern = true;
                    self.engine.remove_service(header.transaction_id);
                    if let Some((interface, info)) = offload {
                        dispatches.extend(self.offload.service_removed(&interface, info));
                    }
                }
                ClientRequest::Discovery { listener, .. } => {
                    had_modern = true;
                    self.engine.unregister_listener(listener);
                }
            }
        }

        self.offload.remove_client(connector);
        if had_modern {
            self.links.stop_when_inactive();
        }
        if had_legacy {
            self.maybe_schedule_daemon_cleanup();
        }
        self.lock.evaluate(&self.registry);
        self.send_dispatches(dispatches);

        info!(%connector, uid = client.uid, "client expunged");
        self.log.record(format!("client {connector} disconnected"));
    }

    // -- helpers ------------------------------------------------------------

    /// Maps a requested network to an interface index (0 = any). A network
    /// with no interface fails the request: a service there would be
    /// unreachable.
    fn resolve_interface(&mut self, network: Option<Network>) -> Result<u32, ()> {
        match network {
            None => Ok(0),
            Some(network) => match self.links.interface_for(network) {
                Some(index) => Ok(index),
                None => {
                    warn!(%network, "requested network has no usable interface");
                    Err(())
                }
            },
        }
    }

    /// Removal side effects shared by every modern-request teardown.
    fn after_modern_removed(&mut self) {
        self.links.stop_when_inactive();
        self.lock.evaluate(&self.registry);
    }

    fn send_to(&self, connector: &ConnectorId, callback: DaemonCallback) {
        match self.registry.client(connector) {
            Some(client) => client.send(callback),
            None => debug!(%connector, "callback for departed client dropped"),
        }
    }

    fn send_dispatches(&mut self, dispatches: Vec<Dispatch>) {
        for (connector, callback) in dispatches {
            self.send_to(&connector, callback);
        }
    }

    fn log_request_metrics(
        &self,
        connector: &ConnectorId,
        request_id: ClientRequestId,
        request: &ClientRequest,
    ) {
        let header = request.header();
        info!(
            %connector,
            %request_id,
            tx = %header.transaction_id,
            service_type = %header.service_type,
            found = header.found_count,
            lost = header.lost_count,
            queries = header.sent_query_count,
            unique_names = header.unique_name_count(),
            from_cache = header.is_from_cache(),
            elapsed_ms = header.start_time.elapsed().as_millis() as u64,
            "request finished"
        );
    }

    #[cfg(test)]
    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    #[cfg(test)]
    pub fn lock_held(&self) -> bool {
        self.lock.is_held()
    }
}

fn store_error_code(error: &StoreError) -> ErrorCode {
    match error {
        StoreError::QuotaReached => ErrorCode::MaxLimit,
        StoreError::DuplicateRequestId | StoreError::UnknownClient => ErrorCode::InternalError,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
