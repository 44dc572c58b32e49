//! ---
//! mh_section: "04-session-pool-registry"
//! mh_subsection: "module"
//! mh_type: "source"
//! mh_scope: "code"
//! mh_description: "Session pool, per-host leases, and the role capability resolver."
//! mh_version: "v0.1.0"
//! mh_owner: "tbd"
//! ---
//! Session pool / host registry.
//!
//! The pool is the single point of truth mapping host identifier to
//! [`RemoteSession`](mh_session::RemoteSession): at most one live session
//! per host per run, created lazily on first use and reused thereafter so
//! that connection setup is amortised across the whole run. Access is gated
//! by a per-host lock held for the duration of a test, which serialises
//! tests with overlapping host sets without coordinating disjoint ones.
#![warn(missing_docs)]

pub mod pool;
pub mod quarantine;
pub mod resolver;

use thiserror::Error;

use mh_topology::{HostId, Role};

pub use pool::{
    HostLease, ScriptedTransportFactory, SessionPool, SshTransportFactory, TransportFactory,
};
pub use quarantine::QuarantineSet;
pub use resolver::RoleResolver;

/// Errors raised by the registry and resolver.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A test requested a host the topology does not contain.
    #[error("host '{0}' is not part of the topology")]
    UnknownHost(HostId),
    /// A test required a role with no usable hosts. Hard failure for the
    /// requesting test: it signals a topology/test mismatch that must not
    /// be silently skipped.
    #[error("no usable host holds required role '{0}'")]
    RoleNotPresent(Role),
}
