//! Comment bodies posted back to the pull request.

use std::fmt::Write;

use crate::domain::{ImageSide, MapDiffEntry, PullRequestRef};
use crate::error::{FailureStage, FileFailure, MapDiffError};

const HEADER: &str = "## Map diffs";

/// Interim body posted while a repository is cloned for the first time.
pub fn clone_notice() -> String {
    format!(
        "{}\n\nThis repository is being cloned for the first time. Map diffs will follow once it is ready.\n",
        HEADER
    )
}

/// Address of a stored image, when a public base URL is configured.
pub fn image_url(public_url: &str, entry: &MapDiffEntry, side: ImageSide) -> String {
    format!(
        "{}/{}/{}/{}/{}/{}",
        public_url.trim_end_matches('/'),
        entry.repository.owner,
        entry.repository.name,
        entry.pull_request,
        entry.file_id,
        side
    )
}

/// Whether a missing image is explained by a failure rather than by the file's absence.
fn side_failed(entry: &MapDiffEntry, side: ImageSide, failures: &[FileFailure]) -> bool {
    failures.iter().filter(|f| f.file == entry.file_path).any(|f| match side {
        ImageSide::Before => matches!(f.stage, FailureStage::Snapshot | FailureStage::RenderBefore),
        ImageSide::After => f.stage == FailureStage::RenderAfter,
    })
}

fn image_cell(entry: &MapDiffEntry, side: ImageSide, failures: &[FileFailure], public_url: Option<&str>) -> String {
    match (entry.image(side), public_url) {
        (None, _) if side_failed(entry, side, failures) => "*render failed*".to_string(),
        (None, _) => match side {
            ImageSide::Before => "*new file*".to_string(),
            ImageSide::After => "*deleted*".to_string(),
        },
        (Some(_), Some(url)) => format!("![{}]({})", side, image_url(url, entry, side)),
        (Some(bytes), None) => format!("{} bytes", bytes.len()),
    }
}

/// Report body for a finished run.
pub fn render_report(
    pr: &PullRequestRef,
    entries: &[MapDiffEntry],
    failures: &[FileFailure],
    public_url: Option<&str>,
) -> String {
    let mut body = String::new();
    let _ = writeln!(body, "{}\n", HEADER);
    let _ = writeln!(
        body,
        "Rendered {} map file(s) for {} merged into {}.\n",
        entries.len(),
        short_sha(&pr.head_sha),
        short_sha(&pr.base_sha)
    );

    if !entries.is_empty() {
        body.push_str("| File | Region | Before | After |\n");
        body.push_str("| --- | --- | --- | --- |\n");
        for entry in entries {
            let region = entry
                .region
                .map_or_else(|| "whole map".to_string(), |r| r.to_string());
            let _ = writeln!(
                body,
                "| `{}` | {} | {} | {} |",
                entry.file_path,
                region,
                image_cell(entry, ImageSide::Before, failures, public_url),
                image_cell(entry, ImageSide::After, failures, public_url)
            );
        }
    }

    if !failures.is_empty() {
        let _ = writeln!(body, "\n### Failed\n");
        for failure in failures {
            let _ = writeln!(body, "- `{}` ({}): {}", failure.file, failure.stage, first_line(&failure.message));
        }
    }
    body
}

/// Report body for a run that failed outright.
pub fn failure_report(pr: &PullRequestRef, error: &MapDiffError) -> String {
    let reason = match error {
        MapDiffError::MergeConflict(_) => "the pull request does not merge cleanly into its base".to_string(),
        MapDiffError::MissingManifest { extension, .. } => {
            format!("no `.{}` manifest was found in the repository root", extension)
        }
        other => first_line(&other.to_string()).to_string(),
    };
    format!(
        "{}\n\nMap diffs could not be generated for {}: {}.\n",
        HEADER,
        short_sha(&pr.head_sha),
        reason
    )
}

fn short_sha(sha: &str) -> &str {
    sha.get(..7).unwrap_or(sha)
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("").trim()
}
