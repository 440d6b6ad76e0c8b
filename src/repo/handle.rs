//! Exclusive handle on one repository working copy.

use std::fmt;
use std::path::Path;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::git::GitRepository;
use super::manager::RepositoryLease;
use crate::domain::RepositoryKey;
use crate::error::{MapDiffError, Result};

/// A checked-out working copy held exclusively by one caller.
///
/// Dropping the handle releases the repository to the next queued caller.
pub struct RepositoryHandle {
    key: RepositoryKey,
    repo: GitRepository,
    _lease: RepositoryLease,
}

impl RepositoryHandle {
    pub(super) fn new(key: RepositoryKey, repo: GitRepository, lease: RepositoryLease) -> Self {
        Self {
            key,
            repo,
            _lease: lease,
        }
    }

    pub fn key(&self) -> &RepositoryKey {
        &self.key
    }

    pub fn path(&self) -> &Path {
        self.repo.path()
    }

    pub fn git(&self) -> &GitRepository {
        &self.repo
    }

    pub async fn head_sha(&self, cancel: &CancellationToken) -> Result<String> {
        self.repo.head_sha(cancel).await
    }

    /// Whether `sha` names a commit present in the local object store.
    pub async fn contains_commit(&self, sha: &str, cancel: &CancellationToken) -> Result<bool> {
        let object = format!("{}^{{commit}}", sha);
        let output = self.repo.run(&["cat-file", "-e", &object], cancel).await?;
        Ok(output.success())
    }

    /// Hard-reset the working tree to `commitish` with a detached HEAD.
    pub async fn checkout(&mut self, commitish: &str, cancel: &CancellationToken) -> Result<String> {
        let sha = self
            .repo
            .resolve_commit(commitish, cancel)
            .await?
            .ok_or_else(|| MapDiffError::RevisionNotFound(commitish.to_string()))?;

        self.repo
            .run_checked(&["checkout", "--quiet", "--force", "--detach", &sha], cancel)
            .await?;
        debug!(repository = %self.key, sha = %sha, "Checked out");
        Ok(sha)
    }

    /// Fetch the default remote's configured refspecs.
    pub async fn fetch(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.repo.run_checked(&["fetch", "--quiet", "origin"], cancel).await?;
        debug!(repository = %self.key, "Fetched origin");
        Ok(())
    }

    /// Fetch a pull request head into `pr-<number>`; returns the branch name.
    pub async fn fetch_pull_request(&mut self, number: u64, cancel: &CancellationToken) -> Result<String> {
        let branch = format!("pr-{}", number);
        let refspec = format!("+refs/pull/{}/head:refs/heads/{}", number, branch);
        self.repo
            .run_checked(&["fetch", "--quiet", "origin", &refspec], cancel)
            .await?;
        debug!(repository = %self.key, branch = %branch, "Fetched pull request");
        Ok(branch)
    }

    /// Merge `commitish` into HEAD.
    ///
    /// A conflicted merge is aborted and the tree hard-reset before returning
    /// [`MapDiffError::MergeConflict`].
    pub async fn merge(&mut self, commitish: &str, cancel: &CancellationToken) -> Result<()> {
        let mut args = self.repo.identity_args();
        args.extend(
            ["merge", "--no-ff", "--no-edit", "--quiet", commitish]
                .iter()
                .map(|s| s.to_string()),
        );
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        let output = self.repo.run(&args, cancel).await?;
        if output.success() {
            debug!(repository = %self.key, commitish = %commitish, "Merged");
            return Ok(());
        }

        let conflicts = self.repo.conflicted_paths(cancel).await?;
        self.abort_merge(cancel).await?;

        if !conflicts.is_empty() || output.combined().contains("CONFLICT") {
            warn!(repository = %self.key, commitish = %commitish, files = ?conflicts, "Merge conflict");
            return Err(MapDiffError::MergeConflict(commitish.to_string()));
        }

        Err(MapDiffError::Git(format!(
            "Merge of {} into {} failed: {}",
            commitish,
            self.key,
            output.combined().trim()
        )))
    }

    async fn abort_merge(&mut self, cancel: &CancellationToken) -> Result<()> {
        let abort = self.repo.run(&["merge", "--abort"], cancel).await?;
        if !abort.success() {
            debug!(repository = %self.key, stderr = %abort.stderr.trim(), "No merge to abort");
        }
        self.repo.run_checked(&["reset", "--hard", "--quiet", "HEAD"], cancel).await?;
        Ok(())
    }

    /// Give the working copy back to the access manager.
    pub fn release(self) {
        drop(self);
    }
}

impl fmt::Debug for RepositoryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepositoryHandle")
            .field("key", &self.key)
            .field("path", &self.repo.path())
            .finish_non_exhaustive()
    }
}

impl Drop for RepositoryHandle {
    fn drop(&mut self) {
        debug!(repository = %self.key, "Repository released");
    }
}
