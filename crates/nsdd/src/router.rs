//! Per-request choice between the legacy helper daemon and the modern
//! in-process engine.
//!
//! A request goes to the modern engine when the client opted in, when the
//! global flag for that operation kind is on, or when its service type is
//! allowlisted for that kind. Watch requests (service-info callbacks)
//! always use the modern engine and never consult the router.

use nsd_core::config::FeatureFlags;
use std::collections::HashSet;
use tracing::warn;

/// Which backend serves a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Legacy,
    Modern,
}

/// The two flag families: discovery/resolution vs. advertising.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Discovery,
    Advertising,
}

#[derive(Debug, Default)]
pub struct BackendRouter {
    discovery_default_modern: bool,
    advertiser_default_modern: bool,
    discovery_allowlist: HashSet<String>,
    advertiser_allowlist: HashSet<String>,
}

impl BackendRouter {
    /// Builds the routing table from the configured flags.
    ///
    /// `mdns_type_allowlist_flags` maps service types to tags
    /// (`_foo._tcp:foo,...`); a type lands in an allowlist when its tag's
    /// per-kind entry is true. Malformed pairs are skipped with a warning.
    pub fn from_flags(flags: &FeatureFlags) -> Self {
        let mut discovery_allowlist = HashSet::new();
        let mut advertiser_allowlist = HashSet::new();

        for pair in flags
            .mdns_type_allowlist_flags
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
        {
            let Some((service_type, tag)) = pair.split_once(':') else {
                warn!(pair, "malformed type allowlist entry, skipping");
                continue;
            };
            if flags.discovery_allowlist.get(tag).copied().unwrap_or(false) {
                discovery_allowlist.insert(service_type.to_string());
            }
            if flags.advertiser_allowlist.get(tag).copied().unwrap_or(false) {
                advertiser_allowlist.insert(service_type.to_string());
            }
        }

        Self {
            discovery_default_modern: flags.mdns_discovery_manager_version,
            advertiser_default_modern: flags.mdns_advertiser_version,
            discovery_allowlist,
            advertiser_allowlist,
        }
    }

    /// Picks the backend for one request. `service_type` is the bare parsed
    /// type (`_foo._tcp`), `client_opts_in` the per-client hint.
    pub fn pick(
        &self,
        kind: OperationKind,
        service_type: &str,
        client_opts_in: bool,
    ) -> Backend {
        if client_opts_in {
            return Backend::Modern;
        }
        let (default_modern, allowlist) = match kind {
            OperationKind::Discovery => (self.discovery_default_modern, &self.discovery_allowlist),
            OperationKind::Advertising => {
                (self.advertiser_default_modern, &self.advertiser_allowlist)
            }
        };
        if default_modern || allowlist.contains(service_type) {
            Backend::Modern
        } else {
            Backend::Legacy
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
