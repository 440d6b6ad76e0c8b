//! Per-file results of a pipeline run.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::keys::{FileId, RepositoryKey};
use super::region::Region;

/// Which side of the diff an image shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageSide {
    Before,
    After,
}

impl ImageSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Before => "before",
            Self::After => "after",
        }
    }
}

impl fmt::Display for ImageSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "before" => Ok(Self::Before),
            "after" => Ok(Self::After),
            other => Err(format!("unknown image side: {}", other)),
        }
    }
}

/// One changed map file's rendered result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapDiffEntry {
    pub repository: RepositoryKey,
    pub pull_request: u64,
    pub file_id: FileId,
    /// Repository-relative path of the changed file
    pub file_path: String,
    /// Resolved path of the map inside the working copy
    pub map_path: PathBuf,
    /// `None` renders the whole map
    pub region: Option<Region>,
    /// `None` when the file was created by the pull request
    pub before: Option<Vec<u8>>,
    /// `None` when the file was deleted by the pull request
    pub after: Option<Vec<u8>>,
}

impl MapDiffEntry {
    pub fn image(&self, side: ImageSide) -> Option<&[u8]> {
        match side {
            ImageSide::Before => self.before.as_deref(),
            ImageSide::After => self.after.as_deref(),
        }
    }

    pub fn is_new_file(&self) -> bool {
        self.before.is_none() && self.after.is_some()
    }

    pub fn is_deleted_file(&self) -> bool {
        self.before.is_some() && self.after.is_none()
    }
}
