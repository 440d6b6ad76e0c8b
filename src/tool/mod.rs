//! Map tool system - external render/diff binary invocation
//!
//! This module provides:
//! - **ProcessThrottle**: global cap on concurrently running tool processes
//! - **ToolInvoker**: runs the binary as a cancellable child process
//! - **MapTool**: the three call shapes the pipeline needs (diff, render, size query)
//! - Output parsing for coordinate triples, saved images and map bounds

mod invoker;
mod output;
mod throttle;

pub use invoker::ToolInvoker;
pub use output::{parse_diff_region, parse_map_size, parse_saved_image};
pub use throttle::{ProcessThrottle, ThrottlePermit};

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::Region;
use crate::error::Result;

/// Working directory and manifest a tool call runs against
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Repository working copy; relative paths resolve here
    pub workdir: PathBuf,
    /// Manifest file telling the tool which codebase to load
    pub manifest: PathBuf,
}

impl ToolContext {
    pub fn new(workdir: impl Into<PathBuf>, manifest: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            manifest: manifest.into(),
        }
    }

    /// Resolve a tool-reported path against the working directory
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() { path.to_path_buf() } else { self.workdir.join(path) }
    }
}

/// Outcome of one tool invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    /// Literal command line, for diagnostics
    pub command_line: String,
    /// Combined stdout and stderr
    pub output: String,
    pub exit_code: Option<i32>,
    pub region: Option<Region>,
}

impl ToolResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Outcome of a render invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderResult {
    pub tool: ToolResult,
    pub input_path: PathBuf,
    /// Where the image was moved to; `None` when the tool saved nothing
    pub output_path: Option<PathBuf>,
}

/// The three tool operations the diff pipeline relies on
#[async_trait]
pub trait MapTool: Send + Sync {
    /// Compare two map files; `region` is `None` when no difference was reported
    async fn diff(&self, ctx: &ToolContext, before: &Path, after: &Path, cancel: &CancellationToken)
    -> Result<ToolResult>;

    /// Render a minimap of `input`, cropped to `region` when given, into `output`
    async fn render(
        &self,
        ctx: &ToolContext,
        input: &Path,
        region: Option<Region>,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<RenderResult>;

    /// Query the full bounds of `input`; `region` is `None` if unparseable
    async fn map_size(&self, ctx: &ToolContext, input: &Path, cancel: &CancellationToken) -> Result<ToolResult>;
}
