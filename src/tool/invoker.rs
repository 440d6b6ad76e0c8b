//! Runs the external map tool as a throttled, cancellable child process.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::output::{parse_diff_region, parse_map_size, parse_saved_image};
use super::{MapTool, ProcessThrottle, RenderResult, ToolContext, ToolResult};
use crate::config::ToolConfig;
use crate::domain::Region;
use crate::error::{MapDiffError, Result};
use crate::process::{command_line, run_cancellable};

/// Longest output tail quoted in an error message
const ERROR_OUTPUT_TAIL: usize = 2_000;

/// Process-backed [`MapTool`].
pub struct ToolInvoker {
    config: ToolConfig,
    throttle: ProcessThrottle,
}

impl ToolInvoker {
    pub fn new(config: ToolConfig, throttle: ProcessThrottle) -> Self {
        Self { config, throttle }
    }

    pub fn config(&self) -> &ToolConfig {
        &self.config
    }

    pub fn throttle(&self) -> &ProcessThrottle {
        &self.throttle
    }

    /// Run the tool with `args` in `ctx.workdir`.
    ///
    /// A non-zero exit is not an error here; the call shapes decide.
    pub async fn invoke(&self, args: &[String], ctx: &ToolContext, cancel: &CancellationToken) -> Result<ToolResult> {
        let _permit = self.throttle.enter(cancel).await?;

        let mut full_args = self.config.base_args.clone();
        full_args.extend_from_slice(args);
        let line = command_line(&self.config.binary, &full_args);
        debug!(command = %line, workdir = %ctx.workdir.display(), "Running map tool");

        let mut command = Command::new(&self.config.binary);
        command.args(&full_args).current_dir(&ctx.workdir);

        let output = run_cancellable(command, cancel).await.map_err(|e| match e {
            MapDiffError::Cancelled => MapDiffError::Cancelled,
            other => MapDiffError::Tool(format!("Failed to run `{}`: {}", line, other)),
        })?;

        Ok(ToolResult {
            command_line: line,
            output: output.combined(),
            exit_code: output.status.code(),
            region: None,
        })
    }

    fn manifest_args(&self, ctx: &ToolContext, subcommand: &str) -> Vec<String> {
        vec!["-e".to_string(), path_arg(&ctx.manifest), subcommand.to_string()]
    }
}

#[async_trait]
impl MapTool for ToolInvoker {
    async fn diff(
        &self,
        ctx: &ToolContext,
        before: &Path,
        after: &Path,
        cancel: &CancellationToken,
    ) -> Result<ToolResult> {
        let args = vec![self.config.diff_command.clone(), path_arg(before), path_arg(after)];
        let mut result = self.invoke(&args, ctx, cancel).await?;

        if !result.succeeded() {
            return Err(MapDiffError::Tool(failure_message(&result)));
        }

        result.region = parse_diff_region(&result.output);
        if result.region.is_none() {
            debug!(command = %result.command_line, "No coordinates in diff output");
        }
        Ok(result)
    }

    async fn render(
        &self,
        ctx: &ToolContext,
        input: &Path,
        region: Option<Region>,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<RenderResult> {
        let mut args = self.manifest_args(ctx, &self.config.render_command);
        if let Some(region) = region {
            args.extend(["--min".to_string(), region.min_arg(), "--max".to_string(), region.max_arg()]);
        }
        args.push(path_arg(input));

        let tool = self.invoke(&args, ctx, cancel).await?;

        let output_path = match parse_saved_image(&tool.output, &self.config.image_extension) {
            Some(saved) => {
                relocate(&ctx.resolve(&saved), output).await?;
                Some(output.to_path_buf())
            }
            None => {
                warn!(command = %tool.command_line, exit_code = ?tool.exit_code, "Render saved no image");
                None
            }
        };

        Ok(RenderResult {
            tool,
            input_path: input.to_path_buf(),
            output_path,
        })
    }

    async fn map_size(&self, ctx: &ToolContext, input: &Path, cancel: &CancellationToken) -> Result<ToolResult> {
        let mut args = self.manifest_args(ctx, &self.config.size_command);
        args.extend(["-j".to_string(), path_arg(input)]);

        let mut result = self.invoke(&args, ctx, cancel).await?;
        result.region = parse_map_size(&result.output, &path_arg(input));
        Ok(result)
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn failure_message(result: &ToolResult) -> String {
    let output = result.output.trim();
    let start = output
        .char_indices()
        .rev()
        .nth(ERROR_OUTPUT_TAIL)
        .map(|(i, _)| i)
        .unwrap_or(0);
    format!(
        "`{}` exited with {}: {}",
        result.command_line,
        result.exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
        &output[start..]
    )
}

/// Move a saved image to the caller's output path.
async fn relocate(source: &Path, destination: &Path) -> Result<()> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::rename(source, destination).await.is_err() {
        // rename fails across filesystems
        tokio::fs::copy(source, destination).await.map_err(|e| {
            MapDiffError::Tool(format!("Failed to move {} to {}: {}", source.display(), destination.display(), e))
        })?;
        tokio::fs::remove_file(source).await?;
    }
    Ok(())
}
