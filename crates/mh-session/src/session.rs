//! ---
//! mh_section: "03-remote-session"
//! mh_subsection: "module"
//! mh_type: "source"
//! mh_scope: "code"
//! mh_description: "Per-host session state machine with retried connects and timed execution."
//! mh_version: "v0.1.0"
//! mh_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;
use tracing::{debug, warn};

use mh_common::RetryPolicy;
use mh_topology::{Host, HostId};

use crate::transport::{ExecOutput, Transport, TransferRequest};
use crate::SessionError;

/// Connection state of a [`RemoteSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No live channel.
    Disconnected,
    /// Channel established and usable.
    Connected,
    /// Channel contaminated by a timeout or transport failure; must
    /// reconnect before further use.
    Broken,
}

/// One live connection to one host.
///
/// Owned exclusively by the session pool; callers receive transient
/// borrowed access gated by the per-host lock. The session hides
/// transport-level retries and tracks the last executed command for
/// postmortem reporting.
#[derive(Debug)]
pub struct RemoteSession {
    host: Host,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    state: SessionState,
    last_used: Option<Instant>,
    last_command: Option<String>,
}

impl RemoteSession {
    /// Create a disconnected session for `host` over `transport`.
    pub fn new(host: Host, transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self {
            host,
            transport,
            retry,
            state: SessionState::Disconnected,
            last_used: None,
            last_command: None,
        }
    }

    /// Host this session is bound to.
    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Host identifier, for registry keys and reporting.
    pub fn host_id(&self) -> &HostId {
        &self.host.id
    }

    /// Current connection state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Last command handed to the transport, for postmortem reports.
    pub fn last_command(&self) -> Option<&str> {
        self.last_command.as_deref()
    }

    /// Instant of the most recent operation.
    pub fn last_used(&self) -> Option<Instant> {
        self.last_used
    }

    /// Establish the transport with bounded attempts and exponential
    /// backoff. A no-op when already Connected.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Connected {
            return Ok(());
        }
        let mut last_detail = String::new();
        for attempt in 1..=self.retry.max_attempts {
            match self.transport.open().await {
                Ok(()) => {
                    debug!(host = %self.host.id, attempt, transport = self.transport.name(), "session connected");
                    self.state = SessionState::Connected;
                    self.last_used = Some(Instant::now());
                    return Ok(());
                }
                Err(err) => {
                    last_detail = err.to_string();
                    warn!(host = %self.host.id, attempt, error = %err, "connect attempt failed");
                    if attempt < self.retry.max_attempts {
                        tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    }
                }
            }
        }
        self.state = SessionState::Disconnected;
        Err(SessionError::Connection {
            host: self.host.id.to_string(),
            attempts: self.retry.max_attempts,
            detail: last_detail,
        })
    }

    /// Reconnect a Broken session, connect a Disconnected one.
    async fn ensure_connected(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Broken {
            self.disconnect().await;
        }
        self.connect().await
    }

    /// Run a command on the remote host, blocking the calling test until
    /// completion or `budget`. On timeout the session is marked Broken:
    /// the remote process may still be running, so the channel is treated
    /// as contaminated.
    pub async fn execute(
        &mut self,
        command: &str,
        budget: Duration,
    ) -> Result<ExecOutput, SessionError> {
        self.execute_with_input(command, None, budget).await
    }

    /// [`execute`](Self::execute) with bytes fed to the remote stdin, used
    /// by file transfers that stream base64 over the exec channel.
    pub async fn execute_with_input(
        &mut self,
        command: &str,
        stdin: Option<&[u8]>,
        budget: Duration,
    ) -> Result<ExecOutput, SessionError> {
        self.ensure_connected().await?;
        self.last_command = Some(command.to_owned());
        self.last_used = Some(Instant::now());

        match timeout(budget, self.transport.exec(command, stdin)).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => {
                self.state = SessionState::Broken;
                Err(err)
            }
            Err(_elapsed) => {
                warn!(host = %self.host.id, %command, ?budget, "command timed out; marking session broken");
                self.state = SessionState::Broken;
                Err(SessionError::CommandTimeout {
                    host: self.host.id.to_string(),
                    command: command.to_owned(),
                    timeout: budget,
                })
            }
        }
    }

    /// Copy a file to or from the host within `budget`.
    pub async fn transfer(
        &mut self,
        request: &TransferRequest,
        budget: Duration,
    ) -> Result<(), SessionError> {
        self.ensure_connected().await?;
        self.last_used = Some(Instant::now());

        match timeout(budget, self.transport.copy(request)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.state = SessionState::Broken;
                Err(err)
            }
            Err(_elapsed) => {
                self.state = SessionState::Broken;
                Err(SessionError::Transfer {
                    host: self.host.id.to_string(),
                    detail: format!("transfer exceeded {:?}", budget),
                })
            }
        }
    }

    /// Release the transport. Idempotent: safe on an already-Disconnected
    /// session.
    pub async fn disconnect(&mut self) {
        self.transport.close().await;
        self.state = SessionState::Disconnected;
    }
}
