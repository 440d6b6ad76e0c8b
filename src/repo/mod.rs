//! On-disk repository working copies.
//!
//! Many diff jobs share one working copy per repository. The
//! [`RepositoryAccessManager`] hands out at most one [`RepositoryHandle`]
//! per key at a time, queuing later callers in arrival order.

mod git;
mod handle;
mod manager;

pub use git::{GitIdentity, GitRepository};
pub use handle::RepositoryHandle;
pub use manager::RepositoryAccessManager;
