//! ---
//! mh_section: "06-run-orchestration"
//! mh_subsection: "module"
//! mh_type: "source"
//! mh_scope: "code"
//! mh_description: "Per-test context: role requirements, host leases, teardown."
//! mh_version: "v0.1.0"
//! mh_owner: "tbd"
//! ---
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use mh_isolation::IsolationManager;
use mh_registry::{RoleResolver, SessionPool};
use mh_session::{ExecOutput, TransferRequest};
use mh_topology::{Capability, HostId, Role};

use crate::fs::RemoteFs;
use crate::RunnerError;

const ROLLBACK_BUDGET: Duration = Duration::from_secs(60);
const DEFAULT_FS_BUDGET: Duration = Duration::from_secs(30);

/// One role requirement declared by a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleRequest {
    /// Requested role.
    pub role: Role,
    /// Whether absence of the role fails the test.
    pub required: bool,
}

impl RoleRequest {
    /// The test cannot run without hosts of `role`.
    pub fn required(role: Role) -> Self {
        Self {
            role,
            required: true,
        }
    }

    /// The test adapts when `role` is absent.
    pub fn optional(role: Role) -> Self {
        Self {
            role,
            required: false,
        }
    }
}

/// Outcome of a test teardown.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    /// Hosts restored to Clean.
    pub restored: Vec<HostId>,
    /// Hosts quarantined by a failed restore.
    pub quarantined: Vec<HostId>,
}

/// Ephemeral per-test view over the run.
///
/// Holds exclusive leases for every host the test's role requirements
/// resolve to; references into the session pool, never ownership of the
/// sessions themselves. Destroyed at teardown, which replays the rollback
/// log and drives the isolation restore before releasing the hosts.
pub struct TestContext {
    leases: BTreeMap<HostId, mh_registry::HostLease>,
    role_hosts: HashMap<Role, Vec<HostId>>,
    isolation: Arc<IsolationManager>,
    shutdown: broadcast::Receiver<()>,
    rollback: HashMap<HostId, Vec<String>>,
    fs_budget: Duration,
}

impl TestContext {
    pub(crate) async fn build(
        requests: &[RoleRequest],
        pool: Arc<SessionPool>,
        resolver: &RoleResolver,
        isolation: Arc<IsolationManager>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<Self, RunnerError> {
        let mut role_hosts: HashMap<Role, Vec<HostId>> = HashMap::new();
        let mut wanted: Vec<HostId> = Vec::new();
        for request in requests {
            let hosts = if request.required {
                resolver.hosts_with_role(request.role)?
            } else {
                resolver.hosts_with_role_opt(request.role)
            };
            wanted.extend(hosts.iter().cloned());
            role_hosts.entry(request.role).or_default().extend(hosts);
        }

        let leases = pool.acquire_many(&wanted).await?;
        let mut held = BTreeMap::new();
        for lease in leases {
            isolation.mark_in_use(lease.host_id());
            held.insert(lease.host_id().clone(), lease);
        }
        debug!(hosts = held.len(), "test context built");

        Ok(Self {
            leases: held,
            role_hosts,
            isolation,
            shutdown,
            rollback: HashMap::new(),
            fs_budget: DEFAULT_FS_BUDGET,
        })
    }

    /// All hosts held by this context, in canonical order.
    pub fn hosts(&self) -> Vec<HostId> {
        self.leases.keys().cloned().collect()
    }

    /// Hosts resolved for `role`, empty when an optional role was absent.
    pub fn hosts_for_role(&self, role: Role) -> &[HostId] {
        self.role_hosts
            .get(&role)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// First host resolved for `role`, the common single-host case.
    pub fn host_for_role(&self, role: Role) -> Option<&HostId> {
        self.hosts_for_role(role).first()
    }

    /// Run a command on a held host, blocking until completion, failure,
    /// timeout, or run cancellation. Within one host operations execute in
    /// issuance order; no ordering holds across hosts.
    pub async fn execute(
        &mut self,
        host: &HostId,
        command: &str,
        budget: Duration,
    ) -> Result<ExecOutput, RunnerError> {
        let lease = self
            .leases
            .get_mut(host)
            .ok_or_else(|| RunnerError::HostNotHeld(host.clone()))?;

        tokio::select! {
            biased;
            _ = self.shutdown.recv() => {
                warn!(%host, %command, "execute interrupted by run cancellation");
                self.isolation.mark_dirty(host);
                Err(RunnerError::Cancelled)
            }
            result = async {
                let session = lease.session().await?;
                session.execute(command, budget).await
            } => Ok(result?),
        }
    }

    /// Copy a file to or from a held host, subject to the same
    /// cancellation rules as [`execute`](Self::execute).
    pub async fn transfer(
        &mut self,
        host: &HostId,
        request: &TransferRequest,
        budget: Duration,
    ) -> Result<(), RunnerError> {
        let lease = self
            .leases
            .get_mut(host)
            .ok_or_else(|| RunnerError::HostNotHeld(host.clone()))?;

        tokio::select! {
            biased;
            _ = self.shutdown.recv() => {
                self.isolation.mark_dirty(host);
                Err(RunnerError::Cancelled)
            }
            result = async {
                let session = lease.session().await?;
                session.transfer(request, budget).await
            } => Ok(result?),
        }
    }

    /// Remote filesystem utility for a held host. Every mutation pushes an
    /// inverse command onto the rollback log replayed at teardown. Requires
    /// the host's role to grant the FileSystem capability.
    pub fn fs(&mut self, host: &HostId) -> Result<RemoteFs<'_>, RunnerError> {
        let lease = self
            .leases
            .get_mut(host)
            .ok_or_else(|| RunnerError::HostNotHeld(host.clone()))?;
        let role = lease.host().role;
        if !role.grants(Capability::FileSystem) {
            return Err(RunnerError::CapabilityDenied {
                role,
                capability: Capability::FileSystem,
            });
        }
        let rollback = self.rollback.entry(host.clone()).or_default();
        Ok(RemoteFs::new(lease, rollback, self.fs_budget))
    }

    /// Tear the context down: replay rollback logs in reverse, drive the
    /// per-role restore hooks, and release every host.
    ///
    /// Restore failures quarantine the affected host and are reported in
    /// the returned [`TeardownReport`]; they never abort the run.
    pub async fn teardown(mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        let leases = std::mem::take(&mut self.leases);

        for (host, mut lease) in leases {
            if let Some(commands) = self.rollback.remove(&host) {
                if !commands.is_empty() {
                    let script: Vec<String> = commands.into_iter().rev().collect();
                    let script = script.join("\n");
                    let result = async {
                        let session = lease.session().await?;
                        session.execute(&script, ROLLBACK_BUDGET).await
                    }
                    .await;
                    if let Err(err) = result {
                        warn!(%host, error = %err, "rollback replay failed");
                    }
                }
            }

            match self.isolation.restore(&mut lease).await {
                Ok(()) => report.restored.push(host),
                Err(err) => {
                    // Quarantine already recorded by the isolation manager;
                    // surface the detail at suite level and keep going.
                    warn!(%host, error = %err, "restore failed during teardown");
                    report.quarantined.push(host);
                }
            }
        }

        report
    }
}

impl std::fmt::Debug for TestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestContext")
            .field("hosts", &self.hosts())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use mh_common::RetryPolicy;
    use mh_isolation::{HookRegistry, HostCondition};
    use mh_registry::ScriptedTransportFactory;
    use mh_topology::Topology;

    use crate::{RunContext, RunnerError};

    const TOPOLOGY: &str = r#"
domains:
- id: idm
  hosts:
  - name: client1
    hostname: client1.idm.test
    role: client
    ssh: { password_env: MH_PASSWORD }
  - name: dc1
    hostname: dc1.idm.test
    role: ad
    ssh: { user: Administrator, password_env: MH_AD_PASSWORD }
"#;

    fn run_context(factory: Arc<ScriptedTransportFactory>) -> RunContext {
        let topology = Topology::from_str(TOPOLOGY).expect("valid topology");
        RunContext::new(
            &topology,
            factory,
            RetryPolicy::immediate(),
            HookRegistry::new(),
        )
    }

    #[tokio::test]
    async fn context_resolves_required_and_optional_roles() {
        let factory = Arc::new(ScriptedTransportFactory::new());
        let run = run_context(factory.clone());

        let mut ctx = run
            .test_context(&[
                RoleRequest::required(Role::Client),
                RoleRequest::optional(Role::Nfs),
            ])
            .await
            .expect("client present, nfs optional");

        let client = HostId::new("idm", "client1");
        assert_eq!(ctx.hosts(), vec![client.clone()]);
        assert_eq!(ctx.host_for_role(Role::Client), Some(&client));
        assert!(ctx.hosts_for_role(Role::Nfs).is_empty());

        let output = ctx
            .execute(&client, "id testuser", Duration::from_secs(1))
            .await
            .expect("scripted exec succeeds");
        assert!(output.success());
        let transport = factory.transport("idm/client1").expect("created");
        assert_eq!(transport.executed(), vec!["id testuser"]);

        ctx.teardown().await;
    }

    #[tokio::test]
    async fn execute_outside_held_hosts_is_rejected() {
        let run = run_context(Arc::new(ScriptedTransportFactory::new()));
        let mut ctx = run
            .test_context(&[RoleRequest::required(Role::Client)])
            .await
            .unwrap();

        let stranger = HostId::new("idm", "dc1");
        let err = ctx
            .execute(&stranger, "whoami", Duration::from_secs(1))
            .await
            .expect_err("dc1 was never requested");
        assert!(matches!(err, RunnerError::HostNotHeld(_)));
        ctx.teardown().await;
    }

    #[tokio::test]
    async fn fs_is_gated_on_the_filesystem_capability() {
        let factory = Arc::new(ScriptedTransportFactory::new());
        let run = run_context(factory.clone());
        let mut ctx = run
            .test_context(&[
                RoleRequest::required(Role::Client),
                RoleRequest::required(Role::Ad),
            ])
            .await
            .unwrap();

        let dc = HostId::new("idm", "dc1");
        let err = ctx.fs(&dc).expect_err("ad role has no posix fs");
        assert!(matches!(
            err,
            RunnerError::CapabilityDenied {
                capability: Capability::FileSystem,
                ..
            }
        ));

        let client = HostId::new("idm", "client1");
        ctx.fs(&client)
            .expect("client grants fs")
            .write("/etc/sssd/sssd.conf", "[sssd]\n")
            .await
            .expect("scripted write succeeds");

        let report = ctx.teardown().await;
        assert_eq!(report.restored.len(), 2);
        assert!(report.quarantined.is_empty());

        // Teardown replayed the inverse command for the written file.
        let transport = factory.transport("idm/client1").expect("created");
        let replayed = transport.executed().pop().expect("rollback ran last");
        assert!(replayed.contains("rm --force '/etc/sssd/sssd.conf'"));
    }

    #[tokio::test]
    async fn fs_upload_goes_base64_over_the_exec_channel() {
        let factory = Arc::new(ScriptedTransportFactory::new());
        let run = run_context(factory.clone());
        let mut ctx = run
            .test_context(&[RoleRequest::required(Role::Client)])
            .await
            .unwrap();
        let client = HostId::new("idm", "client1");

        let dir = tempfile::tempdir().expect("scratch dir");
        let local = dir.path().join("payload.keytab");
        std::fs::write(&local, b"keytab bytes").expect("write payload");

        ctx.fs(&client)
            .unwrap()
            .upload(&local, "/etc/krb5.keytab")
            .await
            .expect("scripted upload succeeds");

        let transport = factory.transport("idm/client1").unwrap();
        let decode = transport
            .executed()
            .into_iter()
            .find(|command| command.contains("base64 --decode"))
            .expect("decode command issued");
        assert!(decode.contains("'/etc/krb5.keytab'"));

        let fetched = dir.path().join("fetched.keytab");
        ctx.fs(&client)
            .unwrap()
            .download("/etc/krb5.keytab", &fetched)
            .await
            .expect("scripted download succeeds");
        assert!(fetched.exists());

        ctx.teardown().await;
    }

    #[tokio::test]
    async fn cancellation_interrupts_execute_and_dirties_the_host() {
        let factory = Arc::new(ScriptedTransportFactory::with_configure(
            |_, transport| transport.hang_on("sleep"),
        ));
        let run = run_context(factory);
        let mut ctx = run
            .test_context(&[RoleRequest::required(Role::Client)])
            .await
            .unwrap();
        let client = HostId::new("idm", "client1");

        run.cancel();
        let err = ctx
            .execute(&client, "sleep 600", Duration::from_secs(30))
            .await
            .expect_err("cancelled mid-flight");
        assert!(matches!(err, RunnerError::Cancelled));
        assert_eq!(
            run.isolation().condition(&client),
            HostCondition::DirtyPendingRestore
        );
    }
}
