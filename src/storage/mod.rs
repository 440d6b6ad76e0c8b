//! Persistence of rendered map diffs.
//!
//! - **DiffStore**: what the service needs from storage
//! - **SqliteDiffStore**: SQLite implementation keeping images as blobs

mod sqlite;

pub use sqlite::SqliteDiffStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{FileId, ImageSide, MapDiffEntry, Region, RepositoryKey};
use crate::error::Result;

/// Summary of a stored entry, without image data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDiff {
    pub file_id: FileId,
    pub file_path: String,
    pub region: Option<Region>,
    pub has_before: bool,
    pub has_after: bool,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait DiffStore: Send + Sync {
    /// Persist `entries`, replacing everything previously stored for their pull requests
    async fn save(&self, entries: &[MapDiffEntry]) -> Result<()>;

    /// Image bytes for one file and side, if stored
    async fn load_image(
        &self,
        repository: &RepositoryKey,
        number: u64,
        file_id: &FileId,
        side: ImageSide,
    ) -> Result<Option<Vec<u8>>>;

    /// Entries stored for a pull request, ordered by file path
    async fn list(&self, repository: &RepositoryKey, number: u64) -> Result<Vec<StoredDiff>>;
}
