//! nsdctl — command-line client for the nsdd daemon.
//!
//! ```bash
//! nsdctl discover _ipp._tcp             # Stream found/lost until Ctrl+C
//! nsdctl resolve "My Printer" _ipp._tcp
//! nsdctl register kitchen _http._tcp 8080 --txt path=/api
//! nsdctl watch "My Printer" _ipp._tcp   # Stream updates until Ctrl+C
//! nsdctl dump                           # Daemon state dump
//! nsdctl set-importance 1000 100        # Feed an importance change
//! ```
//!
//! Streaming subcommands keep the request open and print callbacks as
//! human-readable lines; Ctrl+C sends the matching stop verb before
//! exiting so the daemon's registries drain cleanly.

mod ipc_client;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ipc_client::IpcClient;
use nsd_core::ipc::{ClientVerb, DaemonCallback};
use nsd_core::types::ServiceInfo;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// The request id used for the single operation each invocation issues.
const REQUEST_ID: u16 = 1;

/// nsdctl — talk to the service discovery daemon.
#[derive(Parser, Debug)]
#[command(name = "nsdctl", about = "Command-line client for nsdd")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to the daemon's Unix socket.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Ask for the modern in-process mDNS backend.
    #[arg(long)]
    modern: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Discover services of a type, streaming found/lost events.
    Discover {
        /// Service type selector, e.g. `_ipp._tcp` or `_ipp._tcp,_sub`.
        service_type: String,
        /// Limit discovery to one netId.
        #[arg(long)]
        network: Option<i32>,
    },
    /// Resolve one service instance to host, port, and TXT attributes.
    Resolve {
        name: String,
        service_type: String,
    },
    /// Advertise a service until Ctrl+C.
    Register {
        name: String,
        service_type: String,
        port: u16,
        /// TXT attributes as key=value, repeatable.
        #[arg(long = "txt")]
        txt: Vec<String>,
    },
    /// Watch one service instance for updates.
    Watch {
        name: String,
        service_type: String,
    },
    /// Print the daemon's plain-text state dump.
    Dump,
    /// Feed a process-importance change into the daemon.
    SetImportance { uid: u32, importance: i32 },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("NSDCTL_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut client = IpcClient::connect(cli.socket.as_deref(), cli.modern)
        .await
        .context("could not reach the daemon")?;

    match cli.command {
        Command::Discover {
            service_type,
            network,
        } => {
            client
                .send(&ClientVerb::DiscoverServices {
                    request_id: REQUEST_ID,
                    service_type,
                    network,
                })
                .await?;
            stream_until_interrupt(&mut client, ClientVerb::StopDiscovery {
                request_id: REQUEST_ID,
            })
            .await
        }
        Command::Resolve { name, service_type } => {
            client
                .send(&ClientVerb::ResolveService {
                    request_id: REQUEST_ID,
                    service: ServiceInfo {
                        service_name: name,
                        service_type,
                        ..Default::default()
                    },
                })
                .await?;
            wait_for_terminal(&mut client).await
        }
        Command::Register {
            name,
            service_type,
            port,
            txt,
        } => {
            client
                .send(&ClientVerb::RegisterService {
                    request_id: REQUEST_ID,
                    service: ServiceInfo {
                        service_name: name,
                        service_type,
                        port,
                        txt: parse_txt(&txt)?,
                        ..Default::default()
                    },
                })
                .await?;
            stream_until_interrupt(&mut client, ClientVerb::UnregisterService {
                request_id: REQUEST_ID,
            })
            .await
        }
        Command::Watch { name, service_type } => {
            client
                .send(&ClientVerb::RegisterServiceCallback {
                    request_id: REQUEST_ID,
                    service: ServiceInfo {
                        service_name: name,
                        service_type,
                        ..Default::default()
                    },
                })
                .await?;
            stream_until_interrupt(&mut client, ClientVerb::UnregisterServiceCallback {
                request_id: REQUEST_ID,
            })
            .await
        }
        Command::Dump => {
            client.send(&ClientVerb::Dump).await?;
            wait_for_terminal(&mut client).await
        }
        Command::SetImportance { uid, importance } => {
            client
                .send(&ClientVerb::SetUidImportance { uid, importance })
                .await?;
            println!("importance change submitted");
            Ok(())
        }
    }
}

/// Parses repeated `key=value` TXT arguments.
fn parse_txt(entries: &[String]) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut txt = BTreeMap::new();
    for entry in entries {
        let Some((key, value)) = entry.split_once('=') else {
            bail!("TXT attribute '{entry}' is not key=value");
        };
        txt.insert(key.to_string(), value.as_bytes().to_vec());
    }
    Ok(txt)
}

/// Streams callbacks until Ctrl+C, then sends `stop_verb` and drains the
/// acknowledgement.
async fn stream_until_interrupt(client: &mut IpcClient, stop_verb: ClientVerb) -> Result<()> {
    loop {
        tokio::select! {
            callback = client.recv() => {
                let callback = callback?;
                let done = is_terminal_failure(&callback);
                print_callback(&callback);
                if done {
                    return Ok(());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                client.send(&stop_verb).await?;
                // Print whatever is still queued, ending on the stop ack.
                while let Ok(callback) = client.recv().await {
                    let stop_ack = matches!(
                        callback,
                        DaemonCallback::OnStopDiscoverySucceeded { .. }
                            | DaemonCallback::OnStopDiscoveryFailed { .. }
                            | DaemonCallback::OnUnregisterServiceSucceeded { .. }
                            | DaemonCallback::OnUnregisterServiceFailed { .. }
                            | DaemonCallback::OnServiceInfoCallbackUnregistered { .. }
                    );
                    print_callback(&callback);
                    if stop_ack {
                        break;
                    }
                }
                return Ok(());
            }
        }
    }
}

/// Reads callbacks until one terminal (success or failure) arrives.
async fn wait_for_terminal(client: &mut IpcClient) -> Result<()> {
    loop {
        let callback = client.recv().await?;
        let terminal = matches!(
            callback,
            DaemonCallback::OnResolveServiceSucceeded { .. }
                | DaemonCallback::OnResolveServiceFailed { .. }
                | DaemonCallback::DumpOutput { .. }
                | DaemonCallback::Error { .. }
        );
        print_callback(&callback);
        if terminal {
            return Ok(());
        }
    }
}

/// True for failures that end a streaming subcommand.
fn is_terminal_failure(callback: &DaemonCallback) -> bool {
    matches!(
        callback,
        DaemonCallback::OnDiscoverServicesFailed { .. }
            | DaemonCallback::OnRegisterServiceFailed { .. }
            | DaemonCallback::OnServiceInfoCallbackRegistrationFailed { .. }
            | DaemonCallback::Error { .. }
    )
}

fn print_callback(callback: &DaemonCallback) {
    match callback {
        DaemonCallback::OnDaemonStateChanged { enabled } => {
            if !enabled {
                println!("! daemon disabled");
            }
        }
        DaemonCallback::OnDiscoverServicesStarted { service_type, .. } => {
            println!("discovery started for {service_type}");
        }
        DaemonCallback::OnServiceFound { service, .. } => println!("+ {service}"),
        DaemonCallback::OnServiceLost { service, .. } => println!("- {service}"),
        DaemonCallback::OnResolveServiceSucceeded { service, .. } => {
            println!("resolved: {service}");
            for (key, value) in &service.txt {
                println!("    txt {key}={}", String::from_utf8_lossy(value));
            }
        }
        DaemonCallback::OnRegisterServiceSucceeded { service, .. } => {
            println!("registered as {service}");
        }
        DaemonCallback::OnServiceUpdated { service, .. } => println!("~ {service}"),
        DaemonCallback::OnServiceUpdatedLost { .. } => println!("~ service gone"),
        DaemonCallback::DumpOutput { text } => print!("{text}"),
        DaemonCallback::Error { message } => eprintln!("daemon error: {message}"),
        other => {
            if let Some(error) = failure_of(other) {
                eprintln!("failed: {error}");
            } else {
                println!("{other:?}");
            }
        }
    }
}

/// Extracts the error code from any failure callback.
fn failure_of(callback: &DaemonCallback) -> Option<nsd_core::types::ErrorCode> {
    match callback {
        DaemonCallback::OnDiscoverServicesFailed { error, .. }
        | DaemonCallback::OnStopDiscoveryFailed { error, .. }
        | DaemonCallback::OnRegisterServiceFailed { error, .. }
        | DaemonCallback::OnUnregisterServiceFailed { error, .. }
        | DaemonCallback::OnResolveServiceFailed { error, .. }
        | DaemonCallback::OnStopResolutionFailed { error, .. }
        | DaemonCallback::OnServiceInfoCallbackRegistrationFailed { error, .. } => Some(*error),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn txt_arguments_parse() {
        let txt = parse_txt(&["path=/api".to_string(), "v=1".to_string()]).unwrap();
        assert_eq!(txt.get("path"), Some(&b"/api".to_vec()));
        assert_eq!(txt.get("v"), Some(&b"1".to_vec()));
        assert!(parse_txt(&["malformed".to_string()]).is_err());
    }
}
