//! Domain types for mapdiffbot
//!
//! - Region: bounding box of interest on a map, and its adaptive expansion
//! - Keys: repository, job and file identifiers
//! - PullRequestRef: the event payload the pipeline acts on
//! - MapDiffEntry: per-file before/after result of a run

pub mod entry;
pub mod keys;
pub mod pull_request;
pub mod region;

pub use entry::{ImageSide, MapDiffEntry};
pub use keys::{FileId, JobKey, RepositoryKey};
pub use pull_request::PullRequestRef;
pub use region::{Region, RegionAccumulator};
