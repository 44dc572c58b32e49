//! ---
//! mh_section: "02-topology-model"
//! mh_subsection: "module"
//! mh_type: "source"
//! mh_scope: "code"
//! mh_description: "Serde schema for the mhc.yaml topology description."
//! mh_version: "v0.1.0"
//! mh_owner: "tbd"
//! ---
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::role::Role;

fn default_port() -> u16 {
    22
}

fn default_user() -> String {
    "root".to_owned()
}

/// Raw deserialized form of an `mhc.yaml` file.
///
/// This is the wire schema only; invariants (unique identifiers, credential
/// presence) are checked when the raw config is promoted to a
/// [`Topology`](crate::Topology).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopologyConfig {
    /// Declared domains, in file order.
    #[serde(default)]
    pub domains: Vec<DomainConfig>,
}

/// One domain entry: a named grouping of hosts forming a test environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainConfig {
    /// Stable domain identifier, unique within the topology.
    pub id: String,
    /// Hosts belonging to the domain, in file order.
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

/// One host entry inside a domain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostConfig {
    /// Short host name, unique within the domain.
    pub name: String,
    /// Fully qualified host name used for remote access and reporting.
    pub hostname: String,
    /// Function of the host inside the domain.
    pub role: Role,
    /// Connection parameters. Optional in the file; validation requires a
    /// usable credential reference before the host is accepted.
    #[serde(default)]
    pub ssh: ConnectionConfig,
}

/// Connection parameters for one host.
///
/// Credentials are held as references (an environment variable name or a
/// key file path), never as inline secrets that would outlive session setup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    /// Address to dial; falls back to the host's `hostname` when unset.
    #[serde(default)]
    pub host: Option<String>,
    /// SSH port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Remote user.
    #[serde(default = "default_user")]
    pub user: String,
    /// Name of the environment variable holding the password.
    #[serde(default)]
    pub password_env: Option<String>,
    /// Path to a private key file.
    #[serde(default)]
    pub private_key: Option<PathBuf>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_port(),
            user: default_user(),
            password_env: None,
            private_key: None,
        }
    }
}

impl ConnectionConfig {
    /// Whether at least one credential reference is present.
    pub fn has_credentials(&self) -> bool {
        self.password_env.is_some() || self.private_key.is_some()
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
      user: root
      password_env: MH_PASSWORD
  - name: dc1
    hostname: dc1.idm.test
    role: ad
    ssh:
      host: 172.16.0.20
      port: 2222
      user: Administrator
      private_key: /etc/mh/keys/dc1
"#;

    #[test]
    fn sample_schema_deserializes() {
        let config: TopologyConfig = serde_yaml::from_str(SAMPLE).expect("valid schema");
        assert_eq!(config.domains.len(), 1);
        let hosts = &config.domains[0].hosts;
        assert_eq!(hosts[0].role, Role::Client);
        assert_eq!(hosts[0].ssh.port, 22);
        assert_eq!(hosts[0].ssh.user, "root");
        assert_eq!(hosts[1].ssh.host.as_deref(), Some("172.16.0.20"));
        assert_eq!(hosts[1].ssh.port, 2222);
        assert!(hosts[1].ssh.has_credentials());
    }

    #[test]
    fn unknown_role_is_rejected_at_parse_time() {
        let description = SAMPLE.replace("role: ad", "role: mainframe");
        assert!(serde_yaml::from_str::<TopologyConfig>(&description).is_err());
    }

    #[test]
    fn missing_ssh_block_defaults_to_empty_credentials() {
        let description = r#"
domains:
- id: bare
  hosts:
  - name: probe
    hostname: probe.bare.test
    role: client
"#;
        let config: TopologyConfig = serde_yaml::from_str(description).expect("parses");
        assert!(!config.domains[0].hosts[0].ssh.has_credentials());
    }
}
