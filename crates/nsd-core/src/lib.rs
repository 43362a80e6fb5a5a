//! # nsd-core
//!
//! Shared library for the nsdd network service discovery daemon.
//! Contains domain types, the DNS-SD service-type grammar, name escaping,
//! the client IPC protocol, the legacy helper-daemon wire protocol, and
//! configuration.
//!
//! This crate is used by both the daemon (`nsdd`) and the CLI client
//! (`nsdctl`).

pub mod config;
pub mod escape;
pub mod ipc;
pub mod mdnsd;
pub mod service_type;
pub mod types;
