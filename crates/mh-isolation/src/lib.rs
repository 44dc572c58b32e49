//! ---
//! mh_section: "05-test-isolation"
//! mh_subsection: "module"
//! mh_type: "source"
//! mh_scope: "code"
//! mh_description: "Per-host condition ledger enforcing state isolation between tests."
//! mh_version: "v0.1.0"
//! mh_owner: "tbd"
//! ---
//! Test isolation manager.
//!
//! State changes made by one test must not leak into the next test sharing
//! the same host. Each host walks a per-test-boundary state machine:
//! Clean → InUse → DirtyPendingRestore → Clean on successful restore, or
//! Quarantined on failure. A quarantined host is excluded from further
//! allocation but keeps its session connected for postmortem diagnostics;
//! a single bad host never sinks the whole suite.

pub mod hooks;

use std::collections::HashMap;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use mh_registry::{HostLease, QuarantineSet};
use mh_session::SessionError;
use mh_topology::HostId;

pub use hooks::{ExecRestoreHook, HookRegistry, RestoreHook};

/// Failure of a host-role restore hook.
#[derive(Debug, Error)]
#[error("restore failed: {detail}")]
pub struct RestoreError {
    /// Human-readable failure detail for the suite-level warning.
    pub detail: String,
}

impl RestoreError {
    /// Restore failure with the given detail.
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

impl From<SessionError> for RestoreError {
    fn from(err: SessionError) -> Self {
        Self::new(err.to_string())
    }
}

/// Isolation condition of one host, scoped to a test boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostCondition {
    /// Known-good state; initial, and re-entered after successful restore.
    #[default]
    Clean,
    /// A test's context currently holds the host.
    InUse,
    /// Test finished (or was interrupted); state unknown until restored.
    DirtyPendingRestore,
    /// Restore failed; excluded from allocation for the rest of the run.
    Quarantined,
}

/// Tracks host conditions across test boundaries and drives restore hooks.
pub struct IsolationManager {
    ledger: Mutex<HashMap<HostId, HostCondition>>,
    hooks: HookRegistry,
    quarantine: QuarantineSet,
}

impl IsolationManager {
    /// Manager over `hooks`, publishing quarantines into `quarantine`.
    pub fn new(hooks: HookRegistry, quarantine: QuarantineSet) -> Self {
        Self {
            ledger: Mutex::new(HashMap::new()),
            hooks,
            quarantine,
        }
    }

    /// Current condition of `host`. Hosts never touched are Clean.
    pub fn condition(&self, host: &HostId) -> HostCondition {
        self.ledger.lock().get(host).copied().unwrap_or_default()
    }

    /// A test context has touched the host.
    pub fn mark_in_use(&self, host: &HostId) {
        debug!(%host, "host in use");
        self.ledger.lock().insert(host.clone(), HostCondition::InUse);
    }

    /// Test boundary reached (teardown or cancellation): the host's state
    /// is unknown until a restore succeeds. Interrupted operations land
    /// here too, never directly back in Clean.
    pub fn mark_dirty(&self, host: &HostId) {
        let mut ledger = self.ledger.lock();
        let condition = ledger.entry(host.clone()).or_default();
        if *condition != HostCondition::Quarantined {
            *condition = HostCondition::DirtyPendingRestore;
        }
    }

    /// Restore `lease`'s host via its role's hook and update the ledger.
    ///
    /// On failure the host is quarantined (with the last executed command
    /// attached to the warning) and the error is returned for suite-level
    /// reporting; the caller must not abort the run over it.
    pub async fn restore(&self, lease: &mut HostLease) -> Result<(), RestoreError> {
        let host_id = lease.host_id().clone();
        let role = lease.host().role;
        self.mark_dirty(&host_id);

        let Some(hook) = self.hooks.hook_for(role) else {
            debug!(host = %host_id, %role, "no restore hook registered; host considered clean");
            self.ledger
                .lock()
                .insert(host_id, HostCondition::Clean);
            return Ok(());
        };

        let result = match lease.session().await {
            Ok(session) => hook.restore(session).await,
            Err(err) => Err(RestoreError::from(err)),
        };

        match result {
            Ok(()) => {
                info!(host = %host_id, %role, "host restored");
                self.ledger
                    .lock()
                    .insert(host_id, HostCondition::Clean);
                Ok(())
            }
            Err(err) => {
                self.ledger
                    .lock()
                    .insert(host_id.clone(), HostCondition::Quarantined);
                self.quarantine
                    .quarantine(host_id, lease.last_command().as_deref());
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for IsolationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolationManager")
            .field("hooks", &self.hooks)
            .field("quarantined", &self.quarantine.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use mh_common::RetryPolicy;
    use mh_registry::{ScriptedTransportFactory, SessionPool};
    use mh_topology::{Role, Topology};

    const TOPOLOGY: &str = r#"
domains:
- id: idm
  hosts:
  - name: client1
    hostname: client1.idm.test
    role: client
    ssh: { password_env: MH_PASSWORD }
  - name: kdc1
    hostname: kdc1.idm.test
    role: kdc
    ssh: { password_env: MH_PASSWORD }
"#;

    /// Transports whose restore command exits nonzero on client hosts.
    fn failing_client_factory() -> Arc<ScriptedTransportFactory> {
        Arc::new(ScriptedTransportFactory::with_configure(
            |host, transport| {
                if host.role == Role::Client {
                    transport.fail_exec_on("reset-failed")
                } else {
                    transport
                }
            },
        ))
    }

    fn hooks() -> HookRegistry {
        let mut registry = HookRegistry::new();
        let hook = Arc::new(ExecRestoreHook::new(
            "systemctl reset-failed && sss_cache -E",
            Duration::from_secs(5),
        ));
        registry.register(Role::Client, hook.clone());
        registry.register(Role::Kdc, hook);
        registry
    }

    #[tokio::test]
    async fn failed_restore_quarantines_host_only() {
        let topology = Topology::from_str(TOPOLOGY).unwrap();
        let pool = SessionPool::new(
            &topology,
            failing_client_factory(),
            RetryPolicy::immediate(),
        );
        let manager = IsolationManager::new(hooks(), pool.quarantine());
        let resolver = pool.resolver();

        let client = HostId::new("idm", "client1");
        let kdc = HostId::new("idm", "kdc1");

        let mut lease = pool.acquire(&client).await.unwrap();
        manager.mark_in_use(&client);
        lease
            .session()
            .await
            .unwrap()
            .execute("echo dirty", Duration::from_secs(1))
            .await
            .unwrap();
        let err = manager.restore(&mut lease).await.expect_err("hook fails");
        assert!(err.detail.contains("exited 1"));
        drop(lease);

        assert_eq!(manager.condition(&client), HostCondition::Quarantined);
        assert!(resolver.hosts_with_role(Role::Client).is_err());
        assert!(resolver.hosts_with_role_opt(Role::Client).is_empty());

        // The unrelated host restores fine and stays allocatable.
        let mut kdc_lease = pool.acquire(&kdc).await.unwrap();
        manager.mark_in_use(&kdc);
        manager.restore(&mut kdc_lease).await.expect("kdc restores");
        assert_eq!(manager.condition(&kdc), HostCondition::Clean);
        assert_eq!(resolver.hosts_with_role(Role::Kdc).unwrap(), vec![kdc]);
    }

    #[tokio::test]
    async fn host_without_hook_restores_vacuously() {
        let topology = Topology::from_str(TOPOLOGY).unwrap();
        let pool = SessionPool::new(
            &topology,
            failing_client_factory(),
            RetryPolicy::immediate(),
        );
        // Empty registry: no hooks at all.
        let manager = IsolationManager::new(HookRegistry::new(), pool.quarantine());
        let client = HostId::new("idm", "client1");

        let mut lease = pool.acquire(&client).await.unwrap();
        manager.mark_in_use(&client);
        assert_eq!(manager.condition(&client), HostCondition::InUse);
        manager.restore(&mut lease).await.expect("vacuous restore");
        assert_eq!(manager.condition(&client), HostCondition::Clean);
    }

    #[tokio::test]
    async fn mark_dirty_never_unquarantines() {
        let manager = IsolationManager::new(HookRegistry::new(), QuarantineSet::new());
        let host = HostId::new("idm", "client1");
        manager
            .ledger
            .lock()
            .insert(host.clone(), HostCondition::Quarantined);
        manager.mark_dirty(&host);
        assert_eq!(manager.condition(&host), HostCondition::Quarantined);
    }
}
