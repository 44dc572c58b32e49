//! ---
//! mh_section: "03-remote-session"
//! mh_subsection: "module"
//! mh_type: "source"
//! mh_scope: "code"
//! mh_description: "Remote session layer: transports and the session state machine."
//! mh_version: "v0.1.0"
//! mh_owner: "tbd"
//! ---
//! Remote session layer.
//!
//! A [`RemoteSession`] wraps exactly one live connection to one host and
//! offers command execution and file transfer with bounded-backoff connects
//! and conservative timeout handling: a timed-out remote process is not
//! guaranteed to have terminated, so the session is treated as contaminated
//! and reconnects before further use.

pub mod cli;
pub mod session;
pub mod transport;

use std::time::Duration;

use thiserror::Error;

pub use cli::{shell_quote, CommandArg, CommandBuilder, ShellFlavor};
pub use session::{RemoteSession, SessionState};
pub use transport::{
    Direction, ExecOutput, Recorder, ScriptedTransport, SshTransport, Transport, TransferRequest,
};

/// Errors raised by sessions and transports.
///
/// All variants are scoped to a single host and never abort unrelated
/// tests; the registry reconnects Broken sessions lazily on next use.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Transport setup failed for every allowed attempt.
    #[error("failed to connect to {host} after {attempts} attempts: {detail}")]
    Connection {
        /// Host that could not be reached.
        host: String,
        /// Number of attempts made.
        attempts: u32,
        /// Last transport-level failure.
        detail: String,
    },
    /// A command exceeded its wall-clock budget. The session is Broken and
    /// requires a reconnect before further use.
    #[error("command on {host} timed out after {timeout:?}: {command}")]
    CommandTimeout {
        /// Host the command ran on.
        host: String,
        /// The command that overran.
        command: String,
        /// The budget that elapsed.
        timeout: Duration,
    },
    /// A file transfer failed on I/O or authentication.
    #[error("transfer failed on {host}: {detail}")]
    Transfer {
        /// Host involved in the transfer.
        host: String,
        /// Failure detail.
        detail: String,
    },
    /// Transport-level execution failure other than a timeout.
    #[error("transport failure on {host}: {detail}")]
    Transport {
        /// Host the operation targeted.
        host: String,
        /// Failure detail.
        detail: String,
    },
}

/// Convenience result alias for the session layer.
pub type Result<T> = std::result::Result<T, SessionError>;
