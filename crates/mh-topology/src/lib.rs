//! ---
//! mh_section: "02-topology-model"
//! mh_subsection: "module"
//! mh_type: "source"
//! mh_scope: "code"
//! mh_description: "Declarative topology parsing and the typed domain/host model."
//! mh_version: "v0.1.0"
//! mh_owner: "tbd"
//! ---
//! Topology model for multi-host test runs.
//!
//! An `mhc.yaml` file describes domains and the hosts inside them; this
//! crate parses it into an immutable typed graph, validates its structural
//! invariants, and supports pre-run transforms such as excluding every host
//! holding a given role. Parsing is pure: the same description always yields
//! a structurally equal topology.
#![warn(missing_docs)]

pub mod config;
pub mod model;
pub mod role;

use std::path::PathBuf;

use thiserror::Error;

pub use config::{ConnectionConfig, DomainConfig, HostConfig, TopologyConfig};
pub use model::{Domain, Host, HostId, Topology};
pub use role::{Capability, Role};

/// Errors raised while loading or transforming a topology.
///
/// All variants are fatal for the run: a malformed or ambiguous topology is
/// rejected before any remote session is created.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// Topology file could not be read.
    #[error("unable to read topology file {path}")]
    Io {
        /// Path that failed to open.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// Topology description failed to deserialize. Unknown role strings
    /// surface here since [`Role`] is a closed enumeration.
    #[error("failed to parse topology description")]
    Parse(#[from] serde_yaml::Error),
    /// The description contains no domains or no hosts at all.
    #[error("topology must declare at least one domain with at least one host")]
    Empty,
    /// Two domains share one identifier.
    #[error("duplicate domain id '{0}'")]
    DuplicateDomain(String),
    /// Two hosts within one domain share one name.
    #[error("duplicate host '{host}' in domain '{domain}'")]
    DuplicateHost {
        /// Domain owning both entries.
        domain: String,
        /// Colliding host name.
        host: String,
    },
    /// A host declares no usable credential reference.
    #[error("host '{host}' is missing connection credentials (password_env or private_key)")]
    MissingCredentials {
        /// Host without credentials.
        host: String,
    },
    /// A host declares an empty user.
    #[error("host '{host}' declares an empty ssh user")]
    MissingUser {
        /// Host without a user.
        host: String,
    },
    /// Structural transforms are rejected once a session pool has been
    /// constructed from the topology.
    #[error("topology is sealed: structural transforms are pre-run only")]
    Sealed,
}
