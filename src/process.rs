//! Child process execution with cooperative cancellation.
//!
//! Output is drained concurrently with the wait so a chatty child never
//! blocks on a full pipe. When the cancellation token fires first the child
//! is killed and reaped before returning.

use std::ffi::OsStr;
use std::process::{ExitStatus, Stdio};

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::error::{MapDiffError, Result};

/// Captured result of a finished child process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Stdout followed by stderr.
    pub fn combined(&self) -> String {
        let mut output = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str(&self.stderr);
        }
        output
    }
}

/// Render a program and its arguments as one diagnostic string.
pub fn command_line<S: AsRef<OsStr>>(program: impl AsRef<OsStr>, args: &[S]) -> String {
    let mut parts = vec![quote(program.as_ref())];
    parts.extend(args.iter().map(|arg| quote(arg.as_ref())));
    parts.join(" ")
}

fn quote(part: &OsStr) -> String {
    let part = part.to_string_lossy();
    if part.is_empty() || part.contains(char::is_whitespace) {
        format!("\"{}\"", part)
    } else {
        part.into_owned()
    }
}

/// Spawn `command` and wait for it, killing it if `cancel` fires first.
pub async fn run_cancellable(mut command: Command, cancel: &CancellationToken) -> Result<ProcessOutput> {
    if cancel.is_cancelled() {
        return Err(MapDiffError::Cancelled);
    }

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        result = collect_output(&mut child) => Some(result),
    };

    match outcome {
        Some(result) => result,
        None => {
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "Failed to kill cancelled child process");
            }
            Err(MapDiffError::Cancelled)
        }
    }
}

async fn collect_output(child: &mut Child) -> Result<ProcessOutput> {
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let read_stdout = async {
        let mut buf = Vec::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            pipe.read_to_end(&mut buf).await?;
        }
        Ok::<_, std::io::Error>(buf)
    };
    let read_stderr = async {
        let mut buf = Vec::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            pipe.read_to_end(&mut buf).await?;
        }
        Ok::<_, std::io::Error>(buf)
    };

    let (stdout, stderr) = tokio::try_join!(read_stdout, read_stderr)?;
    let status = child.wait().await?;

    Ok(ProcessOutput {
        status,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}
