//! Thin async wrapper over the `git` binary for one working copy.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{MapDiffError, Result};
use crate::process::{ProcessOutput, command_line, run_cancellable};

/// Author/committer identity used for local merge commits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

/// A git working copy at a fixed path
#[derive(Debug, Clone)]
pub struct GitRepository {
    path: PathBuf,
    identity: GitIdentity,
}

fn git_command(cwd: Option<&Path>, args: &[&str]) -> Command {
    let mut command = Command::new("git");
    command.args(args).env("GIT_TERMINAL_PROMPT", "0");
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }
    command
}

fn map_git_error(e: MapDiffError, args: &[&str]) -> MapDiffError {
    match e {
        MapDiffError::Cancelled => MapDiffError::Cancelled,
        other => MapDiffError::Git(format!("Failed to execute `{}`: {}", command_line("git", args), other)),
    }
}

impl GitRepository {
    pub fn new(path: impl Into<PathBuf>, identity: GitIdentity) -> Self {
        Self {
            path: path.into(),
            identity,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn identity(&self) -> &GitIdentity {
        &self.identity
    }

    /// Clone `url` into `path`.
    pub async fn clone_from(url: &str, path: &Path, identity: GitIdentity, cancel: &CancellationToken) -> Result<Self> {
        let target = path.to_string_lossy();
        let args = ["clone", "--quiet", url, target.as_ref()];
        let output = run_cancellable(git_command(None, &args), cancel).await.map_err(|e| match e {
            MapDiffError::Cancelled => MapDiffError::Cancelled,
            other => MapDiffError::Clone(format!("Failed to execute git clone: {}", other)),
        })?;

        if !output.success() {
            return Err(MapDiffError::Clone(format!("git clone {} failed: {}", url, output.stderr.trim())));
        }

        Ok(Self::new(path, identity))
    }

    /// Whether `path` holds a `.git` directory or gitfile.
    pub async fn exists_at(path: &Path) -> bool {
        tokio::fs::try_exists(path.join(".git")).await.unwrap_or(false)
    }

    /// Run git, returning output regardless of exit status.
    pub async fn run(&self, args: &[&str], cancel: &CancellationToken) -> Result<ProcessOutput> {
        run_cancellable(git_command(Some(&self.path), args), cancel)
            .await
            .map_err(|e| map_git_error(e, args))
    }

    /// Run git, failing on a non-zero exit status. Returns trimmed stdout.
    pub async fn run_checked(&self, args: &[&str], cancel: &CancellationToken) -> Result<String> {
        let output = self.run(args, cancel).await?;
        if !output.success() {
            return Err(MapDiffError::Git(format!(
                "`{}` failed in {}: {}",
                command_line("git", args),
                self.path.display(),
                output.stderr.trim()
            )));
        }
        Ok(output.stdout.trim().to_string())
    }

    /// Confirm the repository metadata is readable.
    pub async fn verify(&self, cancel: &CancellationToken) -> Result<()> {
        self.run_checked(&["rev-parse", "--git-dir"], cancel).await.map(|_| ())
    }

    /// Resolve `commitish` to a commit SHA, or `None` if unknown.
    pub async fn resolve_commit(&self, commitish: &str, cancel: &CancellationToken) -> Result<Option<String>> {
        let rev = format!("{}^{{commit}}", commitish);
        let output = self.run(&["rev-parse", "--verify", "--quiet", &rev], cancel).await?;
        if output.success() {
            Ok(Some(output.stdout.trim().to_string()))
        } else {
            Ok(None)
        }
    }

    pub async fn head_sha(&self, cancel: &CancellationToken) -> Result<String> {
        self.run_checked(&["rev-parse", "HEAD"], cancel).await
    }

    /// Discard tracked modifications and untracked files.
    ///
    /// Only valid while the caller has exclusive access: a leftover
    /// `index.lock` is taken to belong to a killed git process and removed.
    pub async fn clean(&self, cancel: &CancellationToken) -> Result<()> {
        self.remove_stale_index_lock(cancel).await?;

        // an empty clone has no HEAD to reset to
        if self.resolve_commit("HEAD", cancel).await?.is_some() {
            self.run_checked(&["reset", "--hard", "--quiet"], cancel).await?;
        } else {
            debug!(path = %self.path.display(), "Unborn HEAD, reset skipped");
        }
        self.run_checked(&["clean", "-fdx", "--quiet"], cancel).await.map(|_| ())
    }

    async fn remove_stale_index_lock(&self, cancel: &CancellationToken) -> Result<()> {
        let lock = self.run_checked(&["rev-parse", "--git-path", "index.lock"], cancel).await?;
        let lock = self.path.join(lock);
        match tokio::fs::remove_file(&lock).await {
            Ok(()) => {
                warn!(path = %lock.display(), "Removed stale index lock");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Paths with unresolved merge conflicts.
    pub async fn conflicted_paths(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        let stdout = self.run_checked(&["diff", "--name-only", "--diff-filter=U"], cancel).await?;
        Ok(stdout.lines().map(str::to_string).filter(|l| !l.is_empty()).collect())
    }

    /// Identity flags for commands that create commits.
    pub fn identity_args(&self) -> Vec<String> {
        vec![
            "-c".to_string(),
            format!("user.name={}", self.identity.name),
            "-c".to_string(),
            format!("user.email={}", self.identity.email),
            "-c".to_string(),
            "commit.gpgsign=false".to_string(),
        ]
    }
}
