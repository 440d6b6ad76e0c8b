//! Error types for mapdiffbot
//!
//! Centralized error handling using thiserror.

use std::fmt;

use thiserror::Error;

/// Pipeline stage a per-file failure happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Snapshot,
    Diff,
    Bounds,
    RenderAfter,
    RenderBefore,
    Assemble,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Snapshot => "snapshot",
            Self::Diff => "diff",
            Self::Bounds => "bounds",
            Self::RenderAfter => "render after",
            Self::RenderBefore => "render before",
            Self::Assemble => "assemble",
        };
        f.write_str(name)
    }
}

/// A tool or filesystem failure isolated to one changed map file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFailure {
    pub file: String,
    pub stage: FailureStage,
    pub message: String,
}

impl FileFailure {
    pub fn new(file: impl Into<String>, stage: FailureStage, message: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            stage,
            message: message.into(),
        }
    }
}

impl fmt::Display for FileFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.file, self.stage, self.message)
    }
}

/// All error types that can occur in mapdiffbot
#[derive(Debug, Error)]
pub enum MapDiffError {
    /// The job was cancelled or superseded
    #[error("Operation cancelled")]
    Cancelled,

    /// Merging the pull request head into the base conflicted
    #[error("Merge conflict merging {0}")]
    MergeConflict(String),

    /// A commit or ref could not be resolved in the working copy
    #[error("Revision not found: {0}")]
    RevisionNotFound(String),

    /// No manifest file exists in the repository root
    #[error("No {extension} manifest found in {root}")]
    MissingManifest { extension: String, root: String },

    /// Git command failure
    #[error("Git error: {0}")]
    Git(String),

    /// Cloning a repository failed
    #[error("Clone error: {0}")]
    Clone(String),

    /// External map tool failure
    #[error("Tool error: {0}")]
    Tool(String),

    /// Pull request host collaborator failure
    #[error("Host error: {0}")]
    Host(String),

    /// Storage/persistence error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid configuration or arguments
    #[error("Config error: {0}")]
    Config(String),

    /// Repository owner or name that cannot name a working copy
    #[error("Invalid repository: {0}")]
    InvalidRepository(String),

    /// Every changed map file failed
    #[error("All {} map file(s) failed: {}", .0.len(), join_failures(.0))]
    AllFilesFailed(Vec<FileFailure>),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl MapDiffError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MapDiffError::Cancelled)
    }
}

fn join_failures(failures: &[FileFailure]) -> String {
    failures.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

/// Result type alias for mapdiffbot operations
pub type Result<T> = std::result::Result<T, MapDiffError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_error() {
        let err = MapDiffError::Cancelled;
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "Operation cancelled");
    }

    #[test]
    fn test_merge_conflict_error() {
        let err = MapDiffError::MergeConflict("pr-12".to_string());
        assert!(!err.is_cancelled());
        assert_eq!(err.to_string(), "Merge conflict merging pr-12");
    }

    #[test]
    fn test_missing_manifest_error() {
        let err = MapDiffError::MissingManifest {
            extension: "dme".to_string(),
            root: "/repos/tg/station".to_string(),
        };
        assert_eq!(err.to_string(), "No dme manifest found in /repos/tg/station");
    }

    #[test]
    fn test_all_files_failed_lists_each_failure() {
        let err = MapDiffError::AllFilesFailed(vec![
            FileFailure::new("maps/a.dmm", FailureStage::Diff, "exit code 1"),
            FileFailure::new("maps/b.dmm", FailureStage::RenderAfter, "no output"),
        ]);
        let msg = err.to_string();
        assert!(msg.starts_with("All 2 map file(s) failed"));
        assert!(msg.contains("maps/a.dmm (diff): exit code 1"));
        assert!(msg.contains("maps/b.dmm (render after): no output"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: MapDiffError = io_err.into();
        assert!(matches!(err, MapDiffError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }
}
