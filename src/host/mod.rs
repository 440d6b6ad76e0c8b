//! Revision hosting collaborator.
//!
//! The pipeline only needs three things from the hosting service: the changed
//! files of a pull request, its mergeable status, and a place to post the
//! report. Transport and authentication live behind this trait.

mod memory;

pub use memory::{HostComment, InMemoryHost};

use async_trait::async_trait;

use crate::domain::PullRequestRef;
use crate::error::Result;

/// Pull request queries and comment publishing
#[async_trait]
pub trait PullRequestHost: Send + Sync {
    /// Paths changed by the pull request, relative to the repository root
    async fn changed_files(&self, pr: &PullRequestRef) -> Result<Vec<String>>;

    /// Current mergeable status; `None` while the host is still computing it
    async fn mergeable(&self, pr: &PullRequestRef) -> Result<Option<bool>>;

    /// Create the bot's comment on the pull request, or replace its body if one exists
    async fn post_singleton_comment(&self, pr: &PullRequestRef, body: &str) -> Result<()>;
}
