//! Filesystem helpers for one pipeline run.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use glob::MatchOptions;
use tracing::warn;

use crate::domain::{FileId, ImageSide};
use crate::error::{MapDiffError, Result};

/// Infix marking the pre-merge copy of a map file
const SNAPSHOT_INFIX: &str = "mapdiff-before";

/// Remove and recreate the job's scratch directory.
pub async fn prepare_scratch(dir: &Path) -> Result<()> {
    if tokio::fs::try_exists(dir).await? {
        tokio::fs::remove_dir_all(dir).await?;
    }
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}

/// Pick the manifest file in `root` to hand the map tool.
///
/// Candidates are `*.<extension>` files directly under `root`, sorted by name.
/// One whose name contains `repository_name` wins; otherwise the first.
pub fn find_manifest(root: &Path, extension: &str, repository_name: &str) -> Result<PathBuf> {
    let pattern = format!(
        "{}/*.{}",
        glob::Pattern::escape(&root.to_string_lossy()),
        glob::Pattern::escape(extension.trim_start_matches('.'))
    );
    let options = MatchOptions {
        case_sensitive: false,
        ..MatchOptions::new()
    };

    let missing = || MapDiffError::MissingManifest {
        extension: extension.to_string(),
        root: root.display().to_string(),
    };

    let mut candidates: Vec<PathBuf> = glob::glob_with(&pattern, options)
        .map_err(|e| MapDiffError::Config(format!("Invalid manifest pattern {}: {}", pattern, e)))?
        .filter_map(|entry| entry.ok())
        .filter(|path| path.is_file())
        .filter_map(|path| path.file_name().map(PathBuf::from))
        .collect();
    candidates.sort();

    let wanted = repository_name.to_lowercase();
    let preferred = candidates
        .iter()
        .position(|name| name.to_string_lossy().to_lowercase().contains(&wanted));

    match preferred {
        Some(index) => Ok(candidates.swap_remove(index)),
        None => candidates.into_iter().next().ok_or_else(missing),
    }
}

/// Whether `path` has the map extension (case-insensitive).
pub fn is_map_file(path: &str, extension: &str) -> bool {
    Path::new(path)
        .extension()
        .is_some_and(|ext| ext.to_string_lossy().eq_ignore_ascii_case(extension.trim_start_matches('.')))
}

/// Map files among `changed`, deduplicated, in their original order.
///
/// Paths that could escape the working copy are dropped.
pub fn select_map_files(changed: &[String], extension: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    changed
        .iter()
        .filter(|path| is_map_file(path, extension))
        .filter(|path| {
            let safe = Path::new(path.as_str())
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
            if !safe {
                warn!(path = %path, "Ignoring changed file outside the repository");
            }
            safe
        })
        .filter(|path| seen.insert(path.as_str()))
        .cloned()
        .collect()
}

/// Sibling path holding the base revision of `path`: `a/b.dmm` -> `a/b.mapdiff-before.dmm`.
pub fn snapshot_path(path: &str) -> PathBuf {
    let path = Path::new(path);
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}.{}.{}", stem, SNAPSHOT_INFIX, ext.to_string_lossy()),
        None => format!("{}.{}", stem, SNAPSHOT_INFIX),
    };
    path.with_file_name(name)
}

/// Where the rendered image for one file and side lands in the scratch directory.
pub fn image_path(scratch: &Path, file_id: &FileId, side: ImageSide, image_extension: &str) -> PathBuf {
    scratch.join(format!(
        "{}.{}.{}",
        file_id,
        side,
        image_extension.trim_start_matches('.')
    ))
}
