//! ---
//! mh_section: "06-run-orchestration"
//! mh_subsection: "module"
//! mh_type: "source"
//! mh_scope: "code"
//! mh_description: "Remote filesystem utility with automatic rollback at teardown."
//! mh_version: "v0.1.0"
//! mh_owner: "tbd"
//! ---
use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::debug;

use mh_registry::HostLease;
use mh_session::{shell_quote, ExecOutput};

use crate::RunnerError;

/// Remote filesystem operations on one held host.
///
/// Every mutation first backs up the affected path and pushes an inverse
/// command onto the test's rollback log; the log is replayed in reverse at
/// teardown, so all changes are reverted when the test finishes. File
/// content moves base64-encoded over the exec channel, keeping the
/// transport requirements to plain command execution.
pub struct RemoteFs<'a> {
    lease: &'a mut HostLease,
    rollback: &'a mut Vec<String>,
    budget: Duration,
}

impl std::fmt::Debug for RemoteFs<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteFs")
            .field("budget", &self.budget)
            .finish_non_exhaustive()
    }
}

impl<'a> RemoteFs<'a> {
    pub(crate) fn new(
        lease: &'a mut HostLease,
        rollback: &'a mut Vec<String>,
        budget: Duration,
    ) -> Self {
        Self {
            lease,
            rollback,
            budget,
        }
    }

    async fn run(&mut self, script: &str, stdin: Option<&[u8]>) -> Result<ExecOutput, RunnerError> {
        let session = self.lease.session().await?;
        let output = session
            .execute_with_input(script, stdin, self.budget)
            .await?;
        if !output.success() {
            return Err(RunnerError::Fs {
                host: self.lease.host_id().to_string(),
                detail: output.stderr.trim().to_owned(),
            });
        }
        Ok(output)
    }

    /// Back up `path` if it exists; the backup is moved back over the path
    /// at teardown. Returns whether a backup was taken.
    pub async fn backup(&mut self, path: &str) -> Result<bool, RunnerError> {
        debug!(host = %self.lease.host_id(), path, "backing up remote path");
        let quoted = shell_quote(path);
        let script = format!(
            "set -ex\n\
             if [ -f {quoted} ]; then\n\
                 tmp=`mktemp /tmp/mh.fs.rollback.XXXXXXXXX`\n\
                 cp --force --archive {quoted} \"$tmp\"\n\
                 echo \"$tmp\"\n\
             elif [ -d {quoted} ]; then\n\
                 tmp=`mktemp -d /tmp/mh.fs.rollback.XXXXXXXXX`\n\
                 cp --force --archive {quoted}/. \"$tmp\"\n\
                 echo \"$tmp\"\n\
             fi"
        );
        let output = self.run(&script, None).await?;
        let tmpfile = output.stdout.trim();
        if tmpfile.is_empty() {
            return Ok(false);
        }
        self.rollback
            .push(format!("mv --force {} {}", shell_quote(tmpfile), quoted));
        Ok(true)
    }

    /// Write `contents` to a remote file, replacing any previous content.
    pub async fn write(&mut self, path: &str, contents: &str) -> Result<(), RunnerError> {
        self.backup(path).await?;
        debug!(host = %self.lease.host_id(), path, "writing remote file");
        let quoted = shell_quote(path);
        let script = format!("set -ex\nrm -rf {quoted}\ncat > {quoted}");
        self.run(&script, Some(contents.as_bytes())).await?;
        self.rollback.push(format!("rm --force {}", quoted));
        Ok(())
    }

    /// Read a remote file.
    pub async fn read(&mut self, path: &str) -> Result<String, RunnerError> {
        let output = self.run(&format!("cat {}", shell_quote(path)), None).await?;
        Ok(output.stdout)
    }

    /// Create a remote directory.
    pub async fn mkdir(&mut self, path: &str) -> Result<(), RunnerError> {
        self.backup(path).await?;
        debug!(host = %self.lease.host_id(), path, "creating remote directory");
        let quoted = shell_quote(path);
        let script = format!("set -ex\nrm -fr {quoted}\nmkdir {quoted}");
        self.run(&script, None).await?;
        self.rollback.push(format!("rm -fr {}", quoted));
        Ok(())
    }

    /// Create a remote temporary file, removed at teardown.
    pub async fn mktemp(&mut self) -> Result<String, RunnerError> {
        let script = "set -ex\ntmp=`mktemp /tmp/mh.fs.tmp.XXXXXXXXX`\necho \"$tmp\"";
        let output = self.run(script, None).await?;
        let tmpfile = output.stdout.trim().to_owned();
        if tmpfile.is_empty() {
            return Err(RunnerError::Fs {
                host: self.lease.host_id().to_string(),
                detail: "temporary file was not created".to_owned(),
            });
        }
        self.rollback
            .push(format!("rm --force {}", shell_quote(&tmpfile)));
        Ok(tmpfile)
    }

    /// Upload a local file, base64-encoded over the exec channel.
    pub async fn upload(&mut self, local: &Path, remote: &str) -> Result<(), RunnerError> {
        self.backup(remote).await?;
        debug!(host = %self.lease.host_id(), local = %local.display(), remote, "uploading file");
        let bytes = tokio::fs::read(local).await?;
        let encoded = BASE64.encode(&bytes);
        let quoted = shell_quote(remote);
        let script = format!("set -ex\nrm -rf {quoted}\nbase64 --decode > {quoted}");
        self.run(&script, Some(encoded.as_bytes())).await?;
        self.rollback.push(format!("rm --force {}", quoted));
        Ok(())
    }

    /// Download a remote file to the local machine.
    pub async fn download(&mut self, remote: &str, local: &Path) -> Result<(), RunnerError> {
        debug!(host = %self.lease.host_id(), remote, local = %local.display(), "downloading file");
        let output = self.run(&format!("base64 {}", shell_quote(remote)), None).await?;
        let cleaned: String = output
            .stdout
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let bytes = BASE64.decode(cleaned.as_bytes()).map_err(|err| RunnerError::Fs {
            host: self.lease.host_id().to_string(),
            detail: format!("invalid base64 payload: {}", err),
        })?;
        tokio::fs::write(local, bytes).await?;
        Ok(())
    }
}
