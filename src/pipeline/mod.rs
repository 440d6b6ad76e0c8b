//! Map diff pipeline
//!
//! This module provides:
//! - **DiffPipeline**: fetch, merge, diff and render the map files one pull request changes
//! - **JobRegistry**: one cancellation scope per pull request, newer runs supersede older ones
//! - Workspace helpers for scratch directories, manifests and base snapshots

mod registry;
mod runner;
pub mod workspace;

pub use registry::{JobRegistry, JobScope};
pub use runner::{DiffPipeline, PipelineOutcome};
