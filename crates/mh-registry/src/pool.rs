//! ---
//! mh_section: "04-session-pool-registry"
//! mh_subsection: "module"
//! mh_type: "source"
//! mh_scope: "code"
//! mh_description: "Per-host session slots guarded by test-scoped leases."
//! mh_version: "v0.1.0"
//! mh_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use mh_common::RetryPolicy;
use mh_session::{RemoteSession, ScriptedTransport, SessionError, SshTransport, Transport};
use mh_topology::{Host, HostId, Role, Topology};

use crate::quarantine::QuarantineSet;
use crate::resolver::RoleResolver;
use crate::RegistryError;

/// Produces a transport for a host. Tests inject scripted fakes here.
pub trait TransportFactory: Send + Sync {
    /// Build the transport carrying `host`'s connection parameters.
    fn create(&self, host: &Host) -> Arc<dyn Transport>;
}

/// Default factory driving the system ssh/scp binaries.
#[derive(Debug, Default)]
pub struct SshTransportFactory;

impl TransportFactory for SshTransportFactory {
    fn create(&self, host: &Host) -> Arc<dyn Transport> {
        Arc::new(SshTransport::new(host))
    }
}

type ConfigureFn = dyn Fn(&Host, ScriptedTransport) -> ScriptedTransport + Send + Sync;

/// Factory handing out scripted in-memory transports, for tests.
///
/// Keeps every created transport reachable by host identifier so tests can
/// assert on open counts and executed commands after the fact. A configure
/// closure customises behavior per host (connect failures, hangs, recorded
/// ordering).
pub struct ScriptedTransportFactory {
    configure: Box<ConfigureFn>,
    created: parking_lot::Mutex<HashMap<String, Arc<ScriptedTransport>>>,
}

impl Default for ScriptedTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransportFactory {
    /// Factory producing plain always-succeeding transports.
    pub fn new() -> Self {
        Self::with_configure(|_, transport| transport)
    }

    /// Factory applying `configure` to every transport it creates.
    pub fn with_configure<F>(configure: F) -> Self
    where
        F: Fn(&Host, ScriptedTransport) -> ScriptedTransport + Send + Sync + 'static,
    {
        Self {
            configure: Box::new(configure),
            created: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Transport created for `host_id`, if any.
    pub fn transport(&self, host_id: &str) -> Option<Arc<ScriptedTransport>> {
        self.created.lock().get(host_id).cloned()
    }
}

impl TransportFactory for ScriptedTransportFactory {
    fn create(&self, host: &Host) -> Arc<dyn Transport> {
        let transport = ScriptedTransport::new(host.id.to_string());
        let transport = Arc::new((self.configure)(host, transport));
        self.created
            .lock()
            .insert(host.id.to_string(), transport.clone());
        transport
    }
}

#[derive(Debug, Default)]
struct SessionSlot {
    session: Option<RemoteSession>,
}

struct HostEntry {
    host: Host,
    slot: Arc<Mutex<SessionSlot>>,
}

/// Single point of truth mapping host identifier to its pooled session.
///
/// Construction seals the topology: structural transforms are rejected
/// afterwards, so no host can be removed while a session may exist for it.
pub struct SessionPool {
    entries: HashMap<HostId, Arc<HostEntry>>,
    role_index: HashMap<Role, Vec<HostId>>,
    factory: Arc<dyn TransportFactory>,
    retry: RetryPolicy,
    quarantine: QuarantineSet,
}

impl SessionPool {
    /// Build the pool from a validated topology. Seals the topology and
    /// builds the Role→[Host] index; both are immutable for the run.
    pub fn new(
        topology: &Topology,
        factory: Arc<dyn TransportFactory>,
        retry: RetryPolicy,
    ) -> Self {
        topology.seal();

        let mut entries = HashMap::new();
        let mut role_index: HashMap<Role, Vec<HostId>> = HashMap::new();
        for host in topology.hosts() {
            role_index
                .entry(host.role)
                .or_default()
                .push(host.id.clone());
            entries.insert(
                host.id.clone(),
                Arc::new(HostEntry {
                    host: host.clone(),
                    slot: Arc::new(Mutex::new(SessionSlot::default())),
                }),
            );
        }

        info!(hosts = entries.len(), "session pool constructed; topology sealed");
        Self {
            entries,
            role_index,
            factory,
            retry,
            quarantine: QuarantineSet::new(),
        }
    }

    /// Quarantine set shared with the isolation manager and resolver.
    pub fn quarantine(&self) -> QuarantineSet {
        self.quarantine.clone()
    }

    /// Role capability resolver over this pool's index.
    pub fn resolver(&self) -> RoleResolver {
        RoleResolver::new(self.role_index.clone(), self.quarantine.clone())
    }

    /// Host record by identifier.
    pub fn host(&self, id: &HostId) -> Result<&Host, RegistryError> {
        self.entries
            .get(id)
            .map(|entry| &entry.host)
            .ok_or_else(|| RegistryError::UnknownHost(id.clone()))
    }

    /// Acquire the exclusive per-host lease for one test.
    ///
    /// Blocks until any test currently holding the host releases it; tests
    /// touching disjoint host sets proceed without coordination.
    pub async fn acquire(&self, id: &HostId) -> Result<HostLease, RegistryError> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| RegistryError::UnknownHost(id.clone()))?;
        debug!(host = %id, "acquiring host lease");
        let guard = entry.slot.clone().lock_owned().await;
        Ok(HostLease {
            host: entry.host.clone(),
            guard,
            factory: self.factory.clone(),
            retry: self.retry.clone(),
        })
    }

    /// Acquire leases for several hosts in canonical (sorted) order,
    /// preventing lock-order inversion between tests with overlapping
    /// host sets.
    pub async fn acquire_many(&self, ids: &[HostId]) -> Result<Vec<HostLease>, RegistryError> {
        let mut ordered: Vec<HostId> = ids.to_vec();
        ordered.sort();
        ordered.dedup();
        let mut leases = Vec::with_capacity(ordered.len());
        for id in &ordered {
            leases.push(self.acquire(id).await?);
        }
        Ok(leases)
    }

    /// Forcibly disconnect and drop the pooled session for `id`, so the
    /// next access re-establishes cleanly. Used after an unrecoverable
    /// transport error.
    pub async fn invalidate(&self, id: &HostId) -> Result<(), RegistryError> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| RegistryError::UnknownHost(id.clone()))?;
        let mut slot = entry.slot.lock().await;
        if let Some(mut session) = slot.session.take() {
            session.disconnect().await;
            info!(host = %id, "session invalidated");
        }
        Ok(())
    }

    /// Disconnect every pooled session. Quarantined hosts keep their
    /// session alive so diagnostic commands can still be issued.
    pub async fn shutdown(&self) {
        for (id, entry) in &self.entries {
            if self.quarantine.contains(id) {
                debug!(host = %id, "leaving quarantined session connected for postmortem");
                continue;
            }
            let mut slot = entry.slot.lock().await;
            if let Some(session) = slot.session.as_mut() {
                session.disconnect().await;
            }
        }
        info!("session pool shut down");
    }
}

/// Exclusive capability to use one host for the duration of a test.
///
/// Holds the per-host lock; dropping the lease releases the host. The
/// pooled session stays in the slot across leases, so the same underlying
/// session serves the whole run.
pub struct HostLease {
    host: Host,
    guard: OwnedMutexGuard<SessionSlot>,
    factory: Arc<dyn TransportFactory>,
    retry: RetryPolicy,
}

impl HostLease {
    /// Host this lease covers.
    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Host identifier.
    pub fn host_id(&self) -> &HostId {
        &self.host.id
    }

    /// Pooled session for the host, created and connected on first use
    /// within the run and reused thereafter.
    pub async fn session(&mut self) -> Result<&mut RemoteSession, SessionError> {
        if self.guard.session.is_none() {
            debug!(host = %self.host.id, "creating pooled session on first use");
            let transport = self.factory.create(&self.host);
            self.guard.session = Some(RemoteSession::new(
                self.host.clone(),
                transport,
                self.retry.clone(),
            ));
        }
        let session = self
            .guard
            .session
            .as_mut()
            .expect("slot populated above");
        session.connect().await?;
        Ok(session)
    }

    /// Last command issued through the pooled session, if any.
    pub fn last_command(&self) -> Option<String> {
        self.guard
            .session
            .as_ref()
            .and_then(|s| s.last_command().map(str::to_owned))
    }
}
