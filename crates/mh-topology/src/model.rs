//! ---
//! mh_section: "02-topology-model"
//! mh_subsection: "module"
//! mh_type: "source"
//! mh_scope: "code"
//! mh_description: "Immutable typed topology graph and pre-run transforms."
//! mh_version: "v0.1.0"
//! mh_owner: "tbd"
//! ---
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use crate::config::{ConnectionConfig, TopologyConfig};
use crate::role::Role;
use crate::ConfigurationError;

/// Run-wide unique host identifier of the form `domain/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct HostId(String);

impl HostId {
    /// Compose an identifier from domain and host name.
    pub fn new(domain: &str, name: &str) -> Self {
        Self(format!("{}/{}", domain, name))
    }

    /// Identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One addressable machine inside a domain.
#[derive(Debug, Clone, PartialEq)]
pub struct Host {
    /// Run-wide unique identifier (`domain/name`).
    pub id: HostId,
    /// Owning domain identifier.
    pub domain: String,
    /// Short name, unique within the domain.
    pub name: String,
    /// Fully qualified host name.
    pub hostname: String,
    /// Function of the host. Exactly one role per topology snapshot.
    pub role: Role,
    /// Connection parameters carrying credential references.
    pub connection: ConnectionConfig,
}

impl Host {
    /// Address to dial: the explicit `ssh.host` override or the hostname.
    pub fn address(&self) -> &str {
        self.connection.host.as_deref().unwrap_or(&self.hostname)
    }
}

/// Named grouping of hosts forming one coherent test environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Domain {
    /// Domain identifier, unique within the topology.
    pub id: String,
    /// Hosts keyed by short name, in declaration order.
    pub hosts: IndexMap<String, Host>,
}

/// Immutable typed topology graph.
///
/// Constructed once per run from a [`TopologyConfig`]; role views are
/// derived on demand rather than stored as live relationships. Structural
/// transforms return a new value and are rejected once the topology has
/// been sealed by session pool construction.
#[derive(Debug, Clone)]
pub struct Topology {
    domains: IndexMap<String, Domain>,
    sealed: Arc<AtomicBool>,
}

impl PartialEq for Topology {
    // Structural equality only; the seal marker is runtime bookkeeping.
    fn eq(&self, other: &Self) -> bool {
        self.domains == other.domains
    }
}

impl Topology {
    /// Load and validate a topology from a file on disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        debug!(topology_path = %path.display(), "loading topology");
        let contents =
            std::fs::read_to_string(path).map_err(|source| ConfigurationError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_str(&contents)
    }

    /// Parse and validate a topology from a YAML description.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(description: &str) -> Result<Self, ConfigurationError> {
        let config: TopologyConfig = serde_yaml::from_str(description)?;
        Self::from_config(config)
    }

    /// Promote a raw config into the typed graph, checking invariants.
    pub fn from_config(config: TopologyConfig) -> Result<Self, ConfigurationError> {
        if config.domains.iter().all(|d| d.hosts.is_empty()) {
            return Err(ConfigurationError::Empty);
        }

        let mut domains = IndexMap::with_capacity(config.domains.len());
        for domain_config in config.domains {
            if domains.contains_key(&domain_config.id) {
                return Err(ConfigurationError::DuplicateDomain(domain_config.id));
            }
            let mut hosts = IndexMap::with_capacity(domain_config.hosts.len());
            for host_config in domain_config.hosts {
                let id = HostId::new(&domain_config.id, &host_config.name);
                if hosts.contains_key(&host_config.name) {
                    return Err(ConfigurationError::DuplicateHost {
                        domain: domain_config.id,
                        host: host_config.name,
                    });
                }
                if host_config.ssh.user.trim().is_empty() {
                    return Err(ConfigurationError::MissingUser {
                        host: id.to_string(),
                    });
                }
                if !host_config.ssh.has_credentials() {
                    return Err(ConfigurationError::MissingCredentials {
                        host: id.to_string(),
                    });
                }
                hosts.insert(
                    host_config.name.clone(),
                    Host {
                        id,
                        domain: domain_config.id.clone(),
                        name: host_config.name,
                        hostname: host_config.hostname,
                        role: host_config.role,
                        connection: host_config.ssh,
                    },
                );
            }
            domains.insert(
                domain_config.id.clone(),
                Domain {
                    id: domain_config.id,
                    hosts,
                },
            );
        }

        Ok(Self {
            domains,
            sealed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Domains in declaration order.
    pub fn domains(&self) -> impl Iterator<Item = &Domain> {
        self.domains.values()
    }

    /// Look up a domain by identifier.
    pub fn domain(&self, id: &str) -> Option<&Domain> {
        self.domains.get(id)
    }

    /// All hosts across all domains, in declaration order.
    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.domains.values().flat_map(|d| d.hosts.values())
    }

    /// Look up a host by its run-wide identifier.
    pub fn host(&self, id: &HostId) -> Option<&Host> {
        self.hosts().find(|host| &host.id == id)
    }

    /// Hosts currently holding `role`, in declaration order.
    pub fn hosts_with_role(&self, role: Role) -> Vec<&Host> {
        self.hosts().filter(|host| host.role == role).collect()
    }

    /// Total number of hosts.
    pub fn host_count(&self) -> usize {
        self.domains.values().map(|d| d.hosts.len()).sum()
    }

    /// Mark the topology as sealed. Called by session pool construction;
    /// subsequent structural transforms fail with
    /// [`ConfigurationError::Sealed`].
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
    }

    /// Whether a session pool has been constructed from this topology.
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    /// Return a new topology keeping only hosts matching `predicate`.
    ///
    /// Idempotent; domains emptied by the transform are retained so that
    /// domain-level lookups keep working. Clones of a topology share the
    /// seal marker, so no copy of a sealed topology can be edited either.
    pub fn retain_hosts<F>(&self, predicate: F) -> Result<Self, ConfigurationError>
    where
        F: Fn(&Host) -> bool,
    {
        if self.is_sealed() {
            return Err(ConfigurationError::Sealed);
        }
        let mut domains = IndexMap::with_capacity(self.domains.len());
        for domain in self.domains.values() {
            let hosts: IndexMap<String, Host> = domain
                .hosts
                .iter()
                .filter(|(_, host)| predicate(host))
                .map(|(name, host)| (name.clone(), host.clone()))
                .collect();
            domains.insert(
                domain.id.clone(),
                Domain {
                    id: domain.id.clone(),
                    hosts,
                },
            );
        }
        Ok(Self {
            domains,
            sealed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Return a new topology with every host holding `role` removed.
    pub fn exclude_role(&self, role: Role) -> Result<Self, ConfigurationError> {
        debug!(%role, "excluding role from topology");
        self.retain_hosts(|host| host.role != role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
domains:
- id: idm
  hosts:
  - name: client1
    hostname: client1.idm.test
    role: client
    ssh:
      password_env: MH_PASSWORD
  - name: dc1
    hostname: dc1.idm.test
    role: ad
    ssh:
      user: Administrator
      password_env: MH_AD_PASSWORD
- id: secondary
  hosts:
  - name: ldap1
    hostname: ldap1.secondary.test
    role: ldap
    ssh:
      private_key: /etc/mh/keys/ldap1
"#;

    fn sample() -> Topology {
        Topology::from_str(SAMPLE).expect("sample topology is valid")
    }

    #[test]
    fn parsing_is_deterministic() {
        assert_eq!(sample(), sample());
    }

    #[test]
    fn host_ids_are_domain_scoped() {
        let topology = sample();
        let client = topology
            .host(&HostId::new("idm", "client1"))
            .expect("client1 exists");
        assert_eq!(client.role, Role::Client);
        assert_eq!(client.address(), "client1.idm.test");
        assert_eq!(topology.host_count(), 3);
    }

    #[test]
    fn duplicate_host_in_domain_is_rejected() {
        let description = r#"
domains:
- id: idm
  hosts:
  - name: client1
    hostname: a.idm.test
    role: client
    ssh: { password_env: P }
  - name: client1
    hostname: b.idm.test
    role: client
    ssh: { password_env: P }
"#;
        match Topology::from_str(description) {
            Err(ConfigurationError::DuplicateHost { domain, host }) => {
                assert_eq!(domain, "idm");
                assert_eq!(host, "client1");
            }
            other => panic!("expected duplicate host error, got {:?}", other),
        }
    }

    #[test]
    fn duplicate_domain_is_rejected() {
        let description = r#"
domains:
- id: idm
  hosts:
  - { name: a, hostname: a.test, role: client, ssh: { password_env: P } }
- id: idm
  hosts:
  - { name: b, hostname: b.test, role: client, ssh: { password_env: P } }
"#;
        assert!(matches!(
            Topology::from_str(description),
            Err(ConfigurationError::DuplicateDomain(id)) if id == "idm"
        ));
    }

    #[test]
    fn missing_credentials_are_rejected() {
        let description = r#"
domains:
- id: idm
  hosts:
  - name: client1
    hostname: client1.idm.test
    role: client
"#;
        assert!(matches!(
            Topology::from_str(description),
            Err(ConfigurationError::MissingCredentials { .. })
        ));
    }

    #[test]
    fn empty_topology_is_rejected() {
        assert!(matches!(
            Topology::from_str("domains: []"),
            Err(ConfigurationError::Empty)
        ));
        assert!(matches!(
            Topology::from_str("domains: [{ id: idm, hosts: [] }]"),
            Err(ConfigurationError::Empty)
        ));
    }

    #[test]
    fn exclude_role_is_idempotent() {
        let topology = sample();
        let without_ad = topology.exclude_role(Role::Ad).expect("unsealed");
        let twice = without_ad.exclude_role(Role::Ad).expect("unsealed");
        assert_eq!(without_ad, twice);
        assert!(without_ad.hosts_with_role(Role::Ad).is_empty());
        assert_eq!(without_ad.host_count(), 2);
        // The original value is untouched.
        assert_eq!(topology.host_count(), 3);
    }

    #[test]
    fn sealed_topology_rejects_transforms() {
        let topology = sample();
        topology.seal();
        assert!(matches!(
            topology.exclude_role(Role::Ad),
            Err(ConfigurationError::Sealed)
        ));
        // Clones share the marker.
        let clone = topology.clone();
        assert!(matches!(
            clone.retain_hosts(|_| true),
            Err(ConfigurationError::Sealed)
        ));
    }

    #[test]
    fn load_reads_a_topology_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().expect("scratch file");
        file.write_all(SAMPLE.as_bytes()).expect("write sample");
        let topology = Topology::load(file.path()).expect("loads from disk");
        assert_eq!(topology, sample());
    }

    #[test]
    fn load_surfaces_io_errors_with_path() {
        let err = Topology::load("/nonexistent/mhc.yaml").expect_err("missing file");
        assert!(matches!(err, ConfigurationError::Io { .. }));
    }
}
