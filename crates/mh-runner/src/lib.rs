//! ---
//! mh_section: "06-run-orchestration"
//! mh_subsection: "module"
//! mh_type: "source"
//! mh_scope: "code"
//! mh_description: "Run context wiring topology, pool, resolver, and isolation together."
//! mh_version: "v0.1.0"
//! mh_owner: "tbd"
//! ---
//! Run-level orchestration.
//!
//! A [`RunContext`] is the explicit value threaded through every component
//! for one test run: the sealed topology, the session pool, the role
//! resolver, the isolation manager, and the run-wide shutdown channel.
//! There are no ambient singletons; everything a test needs arrives through
//! its [`TestContext`].

pub mod context;
pub mod fs;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use mh_common::RetryPolicy;
use mh_isolation::{HookRegistry, IsolationManager};
use mh_registry::{
    RegistryError, RoleResolver, SessionPool, SshTransportFactory, TransportFactory,
};
use mh_session::SessionError;
use mh_topology::{Capability, HostId, Role, Topology};

pub use context::{RoleRequest, TeardownReport, TestContext};
pub use fs::RemoteFs;

/// Errors surfaced to individual tests by the runner layer.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Registry/resolver failure (unknown host, required role absent).
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Session-level failure (connect, timeout, transfer).
    #[error(transparent)]
    Session(#[from] SessionError),
    /// The run was cancelled while the operation was in flight. The host's
    /// state is unknown, so it is left pending restore.
    #[error("run cancelled")]
    Cancelled,
    /// A test asked for an operation its host's role does not grant.
    #[error("role '{role}' does not grant {capability:?}")]
    CapabilityDenied {
        /// Role of the host.
        role: Role,
        /// Capability that was requested.
        capability: Capability,
    },
    /// A test addressed a host outside its declared requirements.
    #[error("host '{0}' is not held by this test context")]
    HostNotHeld(HostId),
    /// Remote filesystem operation failed.
    #[error("remote fs failure on {host}: {detail}")]
    Fs {
        /// Host the operation targeted.
        host: String,
        /// Failure detail.
        detail: String,
    },
    /// Local filesystem failure during upload/download.
    #[error("local file error")]
    Io(#[from] std::io::Error),
}

/// Summary of one finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Unique run identifier.
    pub run_id: Uuid,
    /// Run start time.
    pub started_at: DateTime<Utc>,
    /// Run end time.
    pub finished_at: DateTime<Utc>,
    /// Hosts quarantined during the run, if any.
    pub quarantined: Vec<HostId>,
}

/// Explicit per-run state threaded through every component.
pub struct RunContext {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    pool: Arc<SessionPool>,
    resolver: RoleResolver,
    isolation: Arc<IsolationManager>,
    shutdown: broadcast::Sender<()>,
}

impl RunContext {
    /// Wire up a run from a validated topology. Constructing the session
    /// pool seals the topology; structural edits must happen before this.
    pub fn new(
        topology: &Topology,
        factory: Arc<dyn TransportFactory>,
        retry: RetryPolicy,
        hooks: HookRegistry,
    ) -> Self {
        let run_id = Uuid::new_v4();
        let pool = Arc::new(SessionPool::new(topology, factory, retry));
        let resolver = pool.resolver();
        let isolation = Arc::new(IsolationManager::new(hooks, pool.quarantine()));
        let (shutdown, _) = broadcast::channel(4);
        info!(%run_id, hosts = topology.host_count(), "run context created");
        Self {
            run_id,
            started_at: Utc::now(),
            pool,
            resolver,
            isolation,
            shutdown,
        }
    }

    /// Run context over the default SSH transport with no restore hooks.
    pub fn with_defaults(topology: &Topology) -> Self {
        Self::new(
            topology,
            Arc::new(SshTransportFactory),
            RetryPolicy::default(),
            HookRegistry::new(),
        )
    }

    /// Unique identifier of this run.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Session pool backing this run.
    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    /// Role capability resolver for this run.
    pub fn resolver(&self) -> &RoleResolver {
        &self.resolver
    }

    /// Isolation manager for this run.
    pub fn isolation(&self) -> &Arc<IsolationManager> {
        &self.isolation
    }

    /// Build the per-test context for the given role requirements: resolve
    /// roles, acquire per-host leases in canonical order, and mark every
    /// held host in use.
    pub async fn test_context(
        &self,
        requests: &[RoleRequest],
    ) -> Result<TestContext, RunnerError> {
        TestContext::build(
            requests,
            self.pool.clone(),
            &self.resolver,
            self.isolation.clone(),
            self.shutdown.subscribe(),
        )
        .await
    }

    /// Cancel the run: in-flight execute/transfer calls are interrupted,
    /// locks are released, and affected hosts are left pending restore
    /// since their state after an interrupted operation is unknown.
    pub fn cancel(&self) {
        info!(run_id = %self.run_id, "run cancellation requested");
        let _ = self.shutdown.send(());
    }

    /// Disconnect pooled sessions (quarantined hosts excepted) and emit
    /// the run report.
    pub async fn shutdown(&self) -> RunReport {
        self.pool.shutdown().await;
        let report = RunReport {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            quarantined: self.pool.quarantine().snapshot(),
        };
        info!(
            run_id = %report.run_id,
            quarantined = report.quarantined.len(),
            "run finished"
        );
        report
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("started_at", &self.started_at)
            .finish()
    }
}
