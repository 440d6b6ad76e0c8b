//! Per-repository FIFO access to shared working copies.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::git::{GitIdentity, GitRepository};
use super::handle::RepositoryHandle;
use crate::config::RepositoriesConfig;
use crate::domain::RepositoryKey;
use crate::error::{MapDiffError, Result};

type SlotMap = Arc<Mutex<HashMap<RepositoryKey, Arc<Semaphore>>>>;

fn lock_slots(slots: &SlotMap) -> MutexGuard<'_, HashMap<RepositoryKey, Arc<Semaphore>>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One participant (holder or waiter) in a key's queue.
///
/// The key's entry is removed when the last participant goes away.
struct SlotRef {
    key: RepositoryKey,
    semaphore: Arc<Semaphore>,
    slots: SlotMap,
}

impl Drop for SlotRef {
    fn drop(&mut self) {
        let mut slots = lock_slots(&self.slots);
        // owners left: the map entry and this reference
        let last = Arc::strong_count(&self.semaphore) == 2;
        let current = slots.get(&self.key).is_some_and(|s| Arc::ptr_eq(s, &self.semaphore));
        if last && current {
            slots.remove(&self.key);
        }
    }
}

/// Exclusive access to one key, released on drop.
pub(super) struct RepositoryLease {
    // declaration order is drop order: free the permit before pruning
    _permit: OwnedSemaphorePermit,
    _slot: SlotRef,
}

/// Grants serialized access to repository working copies
pub struct RepositoryAccessManager {
    config: RepositoriesConfig,
    slots: SlotMap,
}

impl RepositoryAccessManager {
    pub fn new(config: RepositoriesConfig) -> Self {
        Self {
            config,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &RepositoriesConfig {
        &self.config
    }

    /// Working copy location for `key`.
    pub fn path_for(&self, key: &RepositoryKey) -> PathBuf {
        self.config.root.join(key.relative_path())
    }

    /// Number of keys currently held or waited on.
    pub fn tracked_keys(&self) -> usize {
        lock_slots(&self.slots).len()
    }

    fn identity(&self) -> GitIdentity {
        GitIdentity {
            name: self.config.committer_name.clone(),
            email: self.config.committer_email.clone(),
        }
    }

    /// Wait for exclusive access to `key`, cloning the repository if there is no working copy.
    ///
    /// `on_clone_required` is called once, before the clone starts. The returned handle
    /// always sees a clean tree.
    pub async fn acquire<F>(
        &self,
        key: &RepositoryKey,
        on_clone_required: F,
        cancel: &CancellationToken,
    ) -> Result<RepositoryHandle>
    where
        F: FnOnce() + Send,
    {
        key.validate().map_err(MapDiffError::InvalidRepository)?;
        let lease = self.wait_for_turn(key, cancel).await?;
        debug!(repository = %key, "Repository access granted");

        let path = self.path_for(key);
        let repo = self.open_or_clone(key, &path, on_clone_required, cancel).await?;
        repo.clean(cancel).await?;

        Ok(RepositoryHandle::new(key.clone(), repo, lease))
    }

    async fn wait_for_turn(&self, key: &RepositoryKey, cancel: &CancellationToken) -> Result<RepositoryLease> {
        let slot = {
            let mut slots = lock_slots(&self.slots);
            let semaphore = slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone();
            SlotRef {
                key: key.clone(),
                semaphore,
                slots: self.slots.clone(),
            }
        };

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(repository = %key, "Cancelled while waiting for repository");
                return Err(MapDiffError::Cancelled);
            }
            permit = slot.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| MapDiffError::Cancelled)?
            }
        };

        Ok(RepositoryLease {
            _permit: permit,
            _slot: slot,
        })
    }

    async fn open_or_clone<F>(
        &self,
        key: &RepositoryKey,
        path: &Path,
        on_clone_required: F,
        cancel: &CancellationToken,
    ) -> Result<GitRepository>
    where
        F: FnOnce() + Send,
    {
        if GitRepository::exists_at(path).await {
            let repo = GitRepository::new(path, self.identity());
            repo.verify(cancel).await?;
            return Ok(repo);
        }

        info!(repository = %key, path = %path.display(), "No working copy, cloning");
        on_clone_required();

        if tokio::fs::try_exists(path).await? {
            tokio::fs::remove_dir_all(path).await?;
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let url = self.config.remote_url_for(key);
        match GitRepository::clone_from(&url, path, self.identity(), cancel).await {
            Ok(repo) => {
                info!(repository = %key, "Clone complete");
                Ok(repo)
            }
            Err(e) => {
                match tokio::fs::remove_dir_all(path).await {
                    Err(cleanup) if cleanup.kind() != std::io::ErrorKind::NotFound => {
                        warn!(path = %path.display(), error = %cleanup, "Failed to remove partial clone");
                    }
                    _ => {}
                }
                Err(e)
            }
        }
    }
}
