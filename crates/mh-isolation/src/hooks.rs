//! ---
//! mh_section: "05-test-isolation"
//! mh_subsection: "module"
//! mh_type: "source"
//! mh_scope: "code"
//! mh_description: "Per-role restore hooks invoked at test teardown."
//! mh_version: "v0.1.0"
//! mh_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use mh_session::RemoteSession;
use mh_topology::Role;

use crate::RestoreError;

/// Resets a host of one role back to its pre-test state.
///
/// Hooks are supplied externally per role (e.g. "reset identity-management
/// daemon configuration") and invoked by the isolation manager with the
/// host's pooled session; the core never implements the reset itself.
#[async_trait]
pub trait RestoreHook: Send + Sync {
    /// Restore `session`'s host. Failure quarantines the host.
    async fn restore(&self, session: &mut RemoteSession) -> Result<(), RestoreError>;
}

/// Hook running a fixed remote command and requiring exit code zero.
///
/// Adapter for the common case where a role's reset procedure is a single
/// script already present on the host.
pub struct ExecRestoreHook {
    command: String,
    budget: Duration,
}

impl ExecRestoreHook {
    /// Hook executing `command` with the given wall-clock budget.
    pub fn new(command: impl Into<String>, budget: Duration) -> Self {
        Self {
            command: command.into(),
            budget,
        }
    }
}

#[async_trait]
impl RestoreHook for ExecRestoreHook {
    async fn restore(&self, session: &mut RemoteSession) -> Result<(), RestoreError> {
        let output = session.execute(&self.command, self.budget).await?;
        if output.success() {
            Ok(())
        } else {
            Err(RestoreError::new(format!(
                "restore command exited {}: {}",
                output.exit_code,
                output.stderr.trim()
            )))
        }
    }
}

/// Per-role hook registry, populated at run start and immutable afterwards.
///
/// Hosts whose role has no registered hook restore vacuously.
#[derive(Default)]
pub struct HookRegistry {
    hooks: HashMap<Role, Arc<dyn RestoreHook>>,
}

impl HookRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `hook` for `role`, replacing any previous registration.
    pub fn register(&mut self, role: Role, hook: Arc<dyn RestoreHook>) -> &mut Self {
        self.hooks.insert(role, hook);
        self
    }

    /// Hook registered for `role`, if any.
    pub fn hook_for(&self, role: Role) -> Option<Arc<dyn RestoreHook>> {
        self.hooks.get(&role).cloned()
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("roles", &self.hooks.keys().collect::<Vec<_>>())
            .finish()
    }
}
