//! mapdiffbot - visual diffs of map files changed in pull requests
//!
//! Each pull request event fetches and merges the change into a shared
//! working copy, then renders before/after minimaps of every changed map
//! file through an external tool and reports them back.

pub mod config;
pub mod domain;
pub mod error;
pub mod host;
pub mod pipeline;
pub mod process;
pub mod repo;
pub mod report;
pub mod service;
pub mod storage;
pub mod tool;

pub use error::{MapDiffError, Result};
