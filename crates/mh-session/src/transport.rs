//! ---
//! mh_section: "03-remote-session"
//! mh_subsection: "module"
//! mh_type: "source"
//! mh_scope: "code"
//! mh_description: "Transport abstraction, SSH process transport, and scripted fakes."
//! mh_version: "v0.1.0"
//! mh_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

use mh_topology::Host;

use crate::SessionError;

/// Captured result of one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Remote process exit code.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl ExecOutput {
    /// Successful empty output, the default for scripted fakes.
    pub fn ok() -> Self {
        Self {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// Successful output with the given stdout.
    pub fn with_stdout(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Whether the remote process exited zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Direction of a file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local file copied to the remote host.
    Upload,
    /// Remote file copied to the local machine.
    Download,
}

/// One file transfer between the local machine and a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Path on the local machine.
    pub local: PathBuf,
    /// Path on the remote host.
    pub remote: String,
    /// Copy direction.
    pub direction: Direction,
}

/// Transport abstraction used by [`RemoteSession`](crate::RemoteSession).
///
/// A transport performs exactly one attempt per call; retry and backoff
/// live in the session layer. Implementations confine their side effects
/// to the remote host and the underlying channel.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the underlying channel. One attempt, no internal retries.
    async fn open(&self) -> Result<(), SessionError>;

    /// Run a command on the remote host, optionally feeding `stdin`.
    async fn exec(&self, command: &str, stdin: Option<&[u8]>) -> Result<ExecOutput, SessionError>;

    /// Copy a file to or from the remote host.
    async fn copy(&self, request: &TransferRequest) -> Result<(), SessionError>;

    /// Release the channel. Must be safe to call repeatedly.
    async fn close(&self);

    /// Human-readable transport name for logging.
    fn name(&self) -> &'static str;
}

impl std::fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Transport({})", self.name())
    }
}

const SSH_BASE_OPTS: &[&str] = &[
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "LogLevel=ERROR",
    "-o",
    "BatchMode=no",
];

/// Transport driving the system `ssh`/`scp` binaries via `tokio::process`.
///
/// Credentials are resolved at spawn time from the host's credential
/// reference (a password environment variable handed to `sshpass -e`, or a
/// private key path passed with `-i`); no secret is stored on the struct.
#[derive(Debug, Clone)]
pub struct SshTransport {
    address: String,
    port: u16,
    user: String,
    password_env: Option<String>,
    private_key: Option<PathBuf>,
}

impl SshTransport {
    /// Build a transport for `host` from its connection parameters.
    pub fn new(host: &Host) -> Self {
        Self {
            address: host.address().to_owned(),
            port: host.connection.port,
            user: host.connection.user.clone(),
            password_env: host.connection.password_env.clone(),
            private_key: host.connection.private_key.clone(),
        }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }

    /// Assemble the process for an ssh/scp invocation, wrapping it in
    /// `sshpass -e` when the credential reference is a password variable.
    fn command(&self, program: &str) -> Result<Command, SessionError> {
        match &self.password_env {
            Some(var) => {
                let password =
                    std::env::var(var).map_err(|_| SessionError::Connection {
                        host: self.address.clone(),
                        attempts: 1,
                        detail: format!("credential variable {} is not set", var),
                    })?;
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e");
                cmd.arg(program);
                cmd.env("SSHPASS", password);
                Ok(cmd)
            }
            None => Ok(Command::new(program)),
        }
    }

    fn ssh_command(&self, remote_command: &str) -> Result<Command, SessionError> {
        let mut cmd = self.command("ssh")?;
        cmd.args(SSH_BASE_OPTS);
        cmd.arg("-p").arg(self.port.to_string());
        if let Some(key) = &self.private_key {
            cmd.arg("-i").arg(key);
        }
        cmd.arg(self.destination());
        cmd.arg(remote_command);
        Ok(cmd)
    }

    fn scp_command(&self, request: &TransferRequest) -> Result<Command, SessionError> {
        let mut cmd = self.command("scp")?;
        cmd.args(SSH_BASE_OPTS);
        cmd.arg("-P").arg(self.port.to_string());
        if let Some(key) = &self.private_key {
            cmd.arg("-i").arg(key);
        }
        let remote = format!("{}:{}", self.destination(), request.remote);
        match request.direction {
            Direction::Upload => {
                cmd.arg(&request.local).arg(remote);
            }
            Direction::Download => {
                cmd.arg(remote).arg(&request.local);
            }
        }
        Ok(cmd)
    }

    async fn run(&self, mut cmd: Command, stdin: Option<&[u8]>) -> Result<ExecOutput, SessionError> {
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| SessionError::Transport {
            host: self.address.clone(),
            detail: format!("failed to spawn: {}", err),
        })?;

        if let Some(bytes) = stdin {
            let mut pipe = child.stdin.take().ok_or_else(|| SessionError::Transport {
                host: self.address.clone(),
                detail: "stdin pipe unavailable".to_owned(),
            })?;
            pipe.write_all(bytes)
                .await
                .map_err(|err| SessionError::Transport {
                    host: self.address.clone(),
                    detail: format!("failed to write stdin: {}", err),
                })?;
            drop(pipe);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|err| SessionError::Transport {
                host: self.address.clone(),
                detail: format!("failed to collect output: {}", err),
            })?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn open(&self) -> Result<(), SessionError> {
        debug!(host = %self.address, port = self.port, "probing ssh connectivity");
        let cmd = self.ssh_command("true")?;
        let output = self.run(cmd, None).await?;
        if output.success() {
            Ok(())
        } else {
            Err(SessionError::Connection {
                host: self.address.clone(),
                attempts: 1,
                detail: output.stderr.trim().to_owned(),
            })
        }
    }

    async fn exec(&self, command: &str, stdin: Option<&[u8]>) -> Result<ExecOutput, SessionError> {
        trace!(host = %self.address, %command, "executing remote command");
        let cmd = self.ssh_command(command)?;
        self.run(cmd, stdin).await
    }

    async fn copy(&self, request: &TransferRequest) -> Result<(), SessionError> {
        debug!(host = %self.address, remote = %request.remote, direction = ?request.direction, "copying file");
        let cmd = self.scp_command(request)?;
        let output = self.run(cmd, None).await?;
        if output.success() {
            Ok(())
        } else {
            Err(SessionError::Transfer {
                host: self.address.clone(),
                detail: output.stderr.trim().to_owned(),
            })
        }
    }

    async fn close(&self) {
        // Process-per-command transport: nothing persistent to release.
    }

    fn name(&self) -> &'static str {
        "ssh"
    }
}

/// Shared call recorder used by tests to assert command ordering across
/// sessions. Records `(host, command)` pairs in global issue order.
pub type Recorder = Arc<Mutex<Vec<(String, String)>>>;

#[derive(Debug, Default)]
struct ScriptState {
    connect_failures: u32,
    opens: u32,
    responses: VecDeque<ExecOutput>,
    hang_on: Vec<String>,
    fail_on: Vec<String>,
    fail_transfers: bool,
    executed: Vec<String>,
    transfers: Vec<TransferRequest>,
    closed: u32,
}

/// In-memory transport with scripted behavior, for unit and integration
/// tests. Commands succeed with empty output unless a response was queued;
/// matching commands can be made to hang past any timeout, and the first
/// `n` connection attempts can be made to fail to exercise backoff.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    host: String,
    state: Mutex<ScriptState>,
    recorder: Option<Recorder>,
    exec_delay: Option<Duration>,
}

impl ScriptedTransport {
    /// Fake transport for the named host.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    /// Record every executed command into `recorder` in global order.
    pub fn with_recorder(mut self, recorder: Recorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Sleep inside every exec, widening windows for interleaving checks.
    pub fn with_exec_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = Some(delay);
        self
    }

    /// Fail the first `n` open attempts.
    pub fn fail_connects(self, n: u32) -> Self {
        self.state.lock().connect_failures = n;
        self
    }

    /// Queue a response for the next unmatched command.
    pub fn push_response(&self, output: ExecOutput) {
        self.state.lock().responses.push_back(output);
    }

    /// Make any command containing `needle` hang until cancelled.
    pub fn hang_on(self, needle: impl Into<String>) -> Self {
        self.state.lock().hang_on.push(needle.into());
        self
    }

    /// Make any command containing `needle` exit nonzero.
    pub fn fail_exec_on(self, needle: impl Into<String>) -> Self {
        self.state.lock().fail_on.push(needle.into());
        self
    }

    /// Fail all transfer attempts.
    pub fn fail_transfers(self) -> Self {
        self.state.lock().fail_transfers = true;
        self
    }

    /// Commands executed so far, in order.
    pub fn executed(&self) -> Vec<String> {
        self.state.lock().executed.clone()
    }

    /// Number of successful opens observed.
    pub fn open_count(&self) -> u32 {
        self.state.lock().opens
    }

    /// Number of close calls observed.
    pub fn close_count(&self) -> u32 {
        self.state.lock().closed
    }

    /// Transfers attempted so far.
    pub fn transfers(&self) -> Vec<TransferRequest> {
        self.state.lock().transfers.clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(SessionError::Connection {
                host: self.host.clone(),
                attempts: 1,
                detail: "scripted connect failure".to_owned(),
            });
        }
        state.opens += 1;
        Ok(())
    }

    async fn exec(&self, command: &str, _stdin: Option<&[u8]>) -> Result<ExecOutput, SessionError> {
        let hang = {
            let state = self.state.lock();
            state.hang_on.iter().any(|needle| command.contains(needle))
        };
        if hang {
            // Outlive any realistic test timeout; the caller's timeout fires first.
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if let Some(delay) = self.exec_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(recorder) = &self.recorder {
            recorder
                .lock()
                .push((self.host.clone(), command.to_owned()));
        }
        let mut state = self.state.lock();
        state.executed.push(command.to_owned());
        if state.fail_on.iter().any(|needle| command.contains(needle)) {
            return Ok(ExecOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "scripted command failure".to_owned(),
            });
        }
        Ok(state.responses.pop_front().unwrap_or_else(ExecOutput::ok))
    }

    async fn copy(&self, request: &TransferRequest) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        if state.fail_transfers {
            return Err(SessionError::Transfer {
                host: self.host.clone(),
                detail: "scripted transfer failure".to_owned(),
            });
        }
        state.transfers.push(request.clone());
        Ok(())
    }

    async fn close(&self) {
        self.state.lock().closed += 1;
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_transport_pops_queued_responses() {
        let transport = ScriptedTransport::new("client1");
        transport.push_response(ExecOutput::with_stdout("hello"));
        transport.open().await.expect("open succeeds");

        let first = transport.exec("echo hello", None).await.unwrap();
        assert_eq!(first.stdout, "hello");
        let second = transport.exec("true", None).await.unwrap();
        assert!(second.success());
        assert_eq!(transport.executed(), vec!["echo hello", "true"]);
    }

    #[tokio::test]
    async fn scripted_transport_fails_first_connects() {
        let transport = ScriptedTransport::new("client1").fail_connects(2);
        assert!(transport.open().await.is_err());
        assert!(transport.open().await.is_err());
        assert!(transport.open().await.is_ok());
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test]
    async fn scripted_transport_records_transfers_and_closes() {
        let transport = ScriptedTransport::new("client1");
        let request = TransferRequest {
            local: PathBuf::from("/tmp/artifact"),
            remote: "/var/tmp/artifact".to_owned(),
            direction: Direction::Upload,
        };
        transport.copy(&request).await.expect("copy succeeds");
        assert_eq!(transport.transfers(), vec![request]);

        transport.close().await;
        transport.close().await;
        assert_eq!(transport.close_count(), 2);
    }
}
