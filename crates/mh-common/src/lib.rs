//! ---
//! mh_section: "01-core-functionality"
//! mh_subsection: "module"
//! mh_type: "source"
//! mh_scope: "code"
//! mh_description: "Shared primitives for the multihost workspace."
//! mh_version: "v0.1.0"
//! mh_owner: "tbd"
//! ---
//! Shared primitives for the multihost orchestration workspace.
//! This crate exposes tracing initialisation and the retry/backoff
//! policy consumed by the session layer.

pub mod backoff;
pub mod logging;

pub use backoff::RetryPolicy;
pub use logging::{init_tracing, LogFormat, LoggingConfig};
