//! The per pull request diff workflow.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::JobRegistry;
use super::workspace;
use crate::config::{Config, PipelineConfig};
use crate::domain::{FileId, ImageSide, JobKey, MapDiffEntry, PullRequestRef, Region};
use crate::error::{FailureStage, FileFailure, MapDiffError, Result};
use crate::host::PullRequestHost;
use crate::repo::{RepositoryAccessManager, RepositoryHandle};
use crate::report;
use crate::tool::{MapTool, ToolContext};

/// Everything a finished run produced.
#[derive(Debug, Default)]
pub struct PipelineOutcome {
    pub entries: Vec<MapDiffEntry>,
    /// Per-file failures that did not stop the run
    pub failures: Vec<FileFailure>,
    /// Whether the repository had to be cloned first
    pub cloned: bool,
}

impl PipelineOutcome {
    /// A run that stopped before touching the repository
    pub fn is_noop(&self) -> bool {
        self.entries.is_empty() && self.failures.is_empty()
    }
}

/// Per-file state carried between stages
#[derive(Debug)]
struct ChangedMap {
    id: FileId,
    path: String,
    /// Base revision copy; `None` for files the pull request creates
    snapshot: Option<PathBuf>,
    /// Whether the file still exists after the merge
    merged: bool,
    region: Option<Region>,
    before: Option<Vec<u8>>,
    after: Option<Vec<u8>>,
}

impl ChangedMap {
    fn new(path: &str) -> Self {
        Self {
            id: FileId::for_path(path),
            path: path.to_string(),
            snapshot: None,
            merged: false,
            region: None,
            before: None,
            after: None,
        }
    }
}

type StageResult<T> = std::result::Result<T, (FailureStage, MapDiffError)>;

fn at(stage: FailureStage) -> impl FnOnce(MapDiffError) -> (FailureStage, MapDiffError) {
    move |e| (stage, e)
}

/// Splits fan-out results into values and failures; cancellation wins over everything.
fn gather<T>(
    files: &[ChangedMap],
    indices: &[usize],
    results: Vec<StageResult<T>>,
    failures: &mut Vec<FileFailure>,
) -> Result<Vec<(usize, Option<T>)>> {
    let mut gathered = Vec::with_capacity(results.len());
    let mut stage_failures = Vec::new();
    for (&index, result) in indices.iter().zip(results) {
        match result {
            Ok(value) => gathered.push((index, Some(value))),
            Err((_, MapDiffError::Cancelled)) => return Err(MapDiffError::Cancelled),
            Err((stage, e)) => {
                warn!(file = %files[index].path, stage = %stage, error = %e, "Map file failed");
                stage_failures.push(FileFailure::new(&files[index].path, stage, e.to_string()));
                gathered.push((index, None));
            }
        }
    }
    failures.extend(stage_failures);
    Ok(gathered)
}

async fn sleep_cancellable(delay: std::time::Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(MapDiffError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Computes before/after minimaps for the map files a pull request changes
pub struct DiffPipeline {
    host: Arc<dyn PullRequestHost>,
    repositories: Arc<RepositoryAccessManager>,
    tool: Arc<dyn MapTool>,
    registry: Arc<JobRegistry>,
    config: PipelineConfig,
    map_extension: String,
    manifest_extension: String,
    image_extension: String,
}

impl DiffPipeline {
    pub fn new(
        config: &Config,
        host: Arc<dyn PullRequestHost>,
        repositories: Arc<RepositoryAccessManager>,
        tool: Arc<dyn MapTool>,
        registry: Arc<JobRegistry>,
    ) -> Self {
        Self {
            host,
            repositories,
            tool,
            registry,
            config: config.pipeline.clone(),
            map_extension: config.tool.map_extension.clone(),
            manifest_extension: config.tool.manifest_extension.clone(),
            image_extension: config.tool.image_extension.clone(),
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn host(&self) -> &Arc<dyn PullRequestHost> {
        &self.host
    }

    /// Run the workflow and return the produced entries.
    pub async fn run(
        &self,
        pr: &PullRequestRef,
        job_key: &JobKey,
        cancel: &CancellationToken,
    ) -> Result<Vec<MapDiffEntry>> {
        self.run_detailed(pr, job_key, cancel).await.map(|outcome| outcome.entries)
    }

    /// Run the workflow, also reporting per-file failures.
    ///
    /// Starting a run supersedes any run already in flight for `job_key`.
    /// A superseded or cancelled run always ends in [`MapDiffError::Cancelled`].
    pub async fn run_detailed(
        &self,
        pr: &PullRequestRef,
        job_key: &JobKey,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome> {
        let scope = self.registry.begin(job_key, cancel);
        let token = scope.token().clone();
        info!(job = %job_key, base = %pr.base_sha, head = %pr.head_sha, "Starting map diff");

        let result = self.execute(pr, job_key, &token).await;

        if token.is_cancelled() {
            debug!(job = %job_key, "Run cancelled");
            return Err(MapDiffError::Cancelled);
        }
        result
    }

    async fn execute(
        &self,
        pr: &PullRequestRef,
        job_key: &JobKey,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome> {
        if !self.await_mergeable(pr, cancel).await? {
            return Ok(PipelineOutcome::default());
        }

        let changed = self.host.changed_files(pr).await?;
        let maps = workspace::select_map_files(&changed, &self.map_extension);
        if maps.is_empty() {
            info!(job = %job_key, changed = changed.len(), "No map files changed");
            return Ok(PipelineOutcome::default());
        }
        info!(job = %job_key, maps = maps.len(), "Map files changed");

        // posted while the clone runs, joined before anything else is posted
        let notice: Mutex<Option<JoinHandle<()>>> = Mutex::new(None);
        let on_clone = || {
            let host = self.host.clone();
            let pr = pr.clone();
            let task = tokio::spawn(async move {
                if let Err(e) = host.post_singleton_comment(&pr, &report::clone_notice()).await {
                    warn!(error = %e, "Failed to post clone notice");
                }
            });
            *notice.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        };

        let acquired = self.repositories.acquire(&pr.repository(), on_clone, cancel).await;
        let notice = notice.into_inner().unwrap_or_else(PoisonError::into_inner);
        let cloned = notice.is_some();
        if let Some(task) = notice {
            if let Err(e) = task.await {
                warn!(error = %e, "Clone notice task failed");
            }
        }

        let mut handle = acquired?;
        let result = self.process(&mut handle, pr, job_key, &maps, cancel).await;
        handle.release();

        let mut outcome = result?;
        outcome.cloned = cloned;
        Ok(outcome)
    }

    /// Wait for the host to decide mergeability.
    ///
    /// The event's flag is used when present. Otherwise the host is polled,
    /// waiting `attempt * mergeable_delay` before each poll.
    async fn await_mergeable(&self, pr: &PullRequestRef, cancel: &CancellationToken) -> Result<bool> {
        let mut status = pr.mergeable;
        let mut attempt = 0;
        while status.is_none() && attempt < self.config.mergeable_attempts {
            sleep_cancellable(self.config.mergeable_delay() * attempt, cancel).await?;
            status = self.host.mergeable(pr).await?;
            attempt += 1;
        }

        match status {
            Some(true) => Ok(true),
            Some(false) => {
                info!(owner = %pr.owner, repo = %pr.name, number = pr.number, "Pull request is not mergeable");
                Ok(false)
            }
            None => {
                info!(owner = %pr.owner, repo = %pr.name, number = pr.number, attempts = attempt, "Mergeable status never resolved");
                Ok(false)
            }
        }
    }

    async fn process(
        &self,
        handle: &mut RepositoryHandle,
        pr: &PullRequestRef,
        job_key: &JobKey,
        maps: &[String],
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome> {
        let scratch = self.config.work_dir.join(job_key.relative_path());
        workspace::prepare_scratch(&scratch).await?;

        let manifest = workspace::find_manifest(handle.path(), &self.manifest_extension, &pr.name)?;
        debug!(job = %job_key, manifest = %manifest.display(), "Using manifest");
        let ctx = ToolContext::new(handle.path(), manifest);

        if !handle.contains_commit(&pr.base_sha, cancel).await? {
            handle.fetch(cancel).await?;
        }
        handle.checkout(&pr.base_sha, cancel).await?;

        let mut failures = Vec::new();
        let mut files: Vec<ChangedMap> = maps.iter().map(|path| ChangedMap::new(path)).collect();
        self.snapshot(handle.path(), &mut files, &mut failures).await;

        let branch = handle.fetch_pull_request(pr.number, cancel).await?;
        handle.merge(&branch, cancel).await?;
        for file in &mut files {
            file.merged = tokio::fs::try_exists(handle.path().join(&file.path)).await?;
        }

        self.resolve_regions(&ctx, &mut files, &mut failures, cancel).await?;
        self.render_side(&ctx, &scratch, ImageSide::After, &mut files, &mut failures, cancel)
            .await?;

        handle.checkout(&pr.base_sha, cancel).await?;
        self.render_side(&ctx, &scratch, ImageSide::Before, &mut files, &mut failures, cancel)
            .await?;

        let entries = self.assemble(pr, handle.path(), files, &mut failures);

        if cancel.is_cancelled() {
            return Err(MapDiffError::Cancelled);
        }
        if entries.is_empty() && !failures.is_empty() {
            return Err(MapDiffError::AllFilesFailed(failures));
        }
        if !failures.is_empty() {
            warn!(
                job = %job_key,
                failed = failures.len(),
                succeeded = entries.len(),
                "Map diff finished with failures"
            );
        }
        info!(job = %job_key, entries = entries.len(), "Map diff complete");

        Ok(PipelineOutcome {
            entries,
            failures,
            cloned: false,
        })
    }

    /// Copy each changed file that exists at base aside before the merge.
    async fn snapshot(&self, root: &Path, files: &mut [ChangedMap], failures: &mut Vec<FileFailure>) {
        for file in files.iter_mut() {
            let source = root.join(&file.path);
            match tokio::fs::try_exists(&source).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(file = %file.path, "New file, no snapshot");
                    continue;
                }
                Err(e) => {
                    failures.push(FileFailure::new(&file.path, FailureStage::Snapshot, e.to_string()));
                    continue;
                }
            }

            let snapshot = workspace::snapshot_path(&file.path);
            match tokio::fs::copy(&source, root.join(&snapshot)).await {
                Ok(_) => file.snapshot = Some(snapshot),
                Err(e) => {
                    warn!(file = %file.path, error = %e, "Snapshot failed");
                    failures.push(FileFailure::new(&file.path, FailureStage::Snapshot, e.to_string()));
                }
            }
        }
    }

    /// Diff each surviving file against its snapshot and widen small regions.
    async fn resolve_regions(
        &self,
        ctx: &ToolContext,
        files: &mut [ChangedMap],
        failures: &mut Vec<FileFailure>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let indices: Vec<usize> = files
            .iter()
            .enumerate()
            .filter(|(_, f)| f.snapshot.is_some() && f.merged)
            .map(|(i, _)| i)
            .collect();

        let results = join_all(indices.iter().map(|&i| {
            let file = &files[i];
            let snapshot = file.snapshot.as_deref().unwrap_or(Path::new(&file.path));
            self.resolve_region(ctx, snapshot, Path::new(&file.path), cancel)
        }))
        .await;

        for (index, region) in gather(files, &indices, results, failures)? {
            files[index].region = region.flatten();
        }
        Ok(())
    }

    async fn resolve_region(
        &self,
        ctx: &ToolContext,
        before: &Path,
        after: &Path,
        cancel: &CancellationToken,
    ) -> StageResult<Option<Region>> {
        let diff = self
            .tool
            .diff(ctx, before, after, cancel)
            .await
            .map_err(at(FailureStage::Diff))?;

        let Some(region) = diff.region else {
            debug!(file = %after.display(), "No localized difference");
            return Ok(None);
        };

        let min = self.config.min_view_diameter;
        if region.span_x() >= min && region.span_y() >= min {
            return Ok(Some(region));
        }

        let size = self
            .tool
            .map_size(ctx, after, cancel)
            .await
            .map_err(at(FailureStage::Bounds))?;
        match size.region {
            Some(bounds) => Ok(Some(region.expand_to_minimum(min, &bounds))),
            None => {
                debug!(file = %after.display(), "Map bounds unknown, region left as diffed");
                Ok(Some(region))
            }
        }
    }

    /// Render one side of every file that has that side.
    async fn render_side(
        &self,
        ctx: &ToolContext,
        scratch: &Path,
        side: ImageSide,
        files: &mut [ChangedMap],
        failures: &mut Vec<FileFailure>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let stage = match side {
            ImageSide::Before => FailureStage::RenderBefore,
            ImageSide::After => FailureStage::RenderAfter,
        };

        let mut indices = Vec::new();
        let mut jobs = Vec::new();
        for (index, file) in files.iter().enumerate() {
            let input = match side {
                ImageSide::Before => file.snapshot.clone(),
                ImageSide::After => file.merged.then(|| PathBuf::from(&file.path)),
            };
            let Some(input) = input else { continue };
            let output = workspace::image_path(scratch, &file.id, side, &self.image_extension);
            indices.push(index);
            jobs.push(self.render_one(ctx, input, file.region, output, stage, cancel));
        }

        let results = join_all(jobs).await;
        for (index, image) in gather(files, &indices, results, failures)? {
            match side {
                ImageSide::Before => files[index].before = image,
                ImageSide::After => files[index].after = image,
            }
        }
        Ok(())
    }

    async fn render_one(
        &self,
        ctx: &ToolContext,
        input: PathBuf,
        region: Option<Region>,
        output: PathBuf,
        stage: FailureStage,
        cancel: &CancellationToken,
    ) -> StageResult<Vec<u8>> {
        let rendered = self
            .tool
            .render(ctx, &input, region, &output, cancel)
            .await
            .map_err(at(stage))?;

        let Some(path) = rendered.output_path else {
            return Err((
                stage,
                MapDiffError::Tool(format!("`{}` saved no image", rendered.tool.command_line)),
            ));
        };
        tokio::fs::read(&path).await.map_err(|e| (stage, e.into()))
    }

    fn assemble(
        &self,
        pr: &PullRequestRef,
        root: &Path,
        files: Vec<ChangedMap>,
        failures: &mut Vec<FileFailure>,
    ) -> Vec<MapDiffEntry> {
        let mut entries = Vec::with_capacity(files.len());
        for file in files {
            if file.before.is_none() && file.after.is_none() {
                if !failures.iter().any(|f| f.file == file.path) {
                    failures.push(FileFailure::new(&file.path, FailureStage::Assemble, "no image was produced"));
                }
                continue;
            }
            entries.push(MapDiffEntry {
                repository: pr.repository(),
                pull_request: pr.number,
                file_id: file.id,
                map_path: root.join(&file.path),
                file_path: file.path,
                region: file.region,
                before: file.before,
                after: file.after,
            });
        }
        entries
    }
}
