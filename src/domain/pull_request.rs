//! Pull request identity as supplied by the event source.

use serde::{Deserialize, Serialize};

use super::keys::{JobKey, RepositoryKey};

/// A pull request event the pipeline acts on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestRef {
    /// Owner of the base repository
    pub owner: String,
    /// Name of the base repository
    pub name: String,
    pub number: u64,
    pub base_sha: String,
    pub head_sha: String,
    /// Mergeable flag from the event; `None` while the host is still computing it
    pub mergeable: Option<bool>,
}

impl PullRequestRef {
    pub fn repository(&self) -> RepositoryKey {
        RepositoryKey::new(&self.owner, &self.name)
    }

    pub fn job_key(&self) -> JobKey {
        JobKey::new(&self.owner, &self.name, self.number)
    }

    /// Local branch the pull request head is fetched into.
    pub fn local_branch(&self) -> String {
        format!("pr-{}", self.number)
    }
}
