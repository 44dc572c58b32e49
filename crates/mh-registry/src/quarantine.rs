//! ---
//! mh_section: "04-session-pool-registry"
//! mh_subsection: "module"
//! mh_type: "source"
//! mh_scope: "code"
//! mh_description: "Shared quarantine set filtering hosts out of resolver results."
//! mh_version: "v0.1.0"
//! mh_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use mh_topology::HostId;

/// Hosts excluded from allocation for the remainder of the run.
///
/// Written by the isolation manager when a restore hook fails, read by the
/// role resolver on every query. Cheap to clone; all clones share state.
#[derive(Debug, Clone, Default)]
pub struct QuarantineSet {
    inner: Arc<RwLock<HashSet<HostId>>>,
}

impl QuarantineSet {
    /// Empty quarantine set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Quarantine `host` for the remainder of the run. Emits the
    /// suite-level warning carrying the diagnostic context.
    pub fn quarantine(&self, host: HostId, last_command: Option<&str>) {
        warn!(
            host = %host,
            last_command = last_command.unwrap_or("<none>"),
            "host quarantined: state restore failed; excluded from further allocation"
        );
        self.inner.write().insert(host);
    }

    /// Whether `host` is quarantined.
    pub fn contains(&self, host: &HostId) -> bool {
        self.inner.read().contains(host)
    }

    /// Quarantined hosts, for the run report.
    pub fn snapshot(&self) -> Vec<HostId> {
        let mut hosts: Vec<HostId> = self.inner.read().iter().cloned().collect();
        hosts.sort();
        hosts
    }

    /// Number of quarantined hosts.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether no host is quarantined.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
