//! Diff pipeline integration tests
//!
//! Drives the full pipeline against real temporary git repositories, with a
//! scripted map tool standing in for the external renderer.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use mapdiffbot::config::Config;
use mapdiffbot::domain::{ImageSide, MapDiffEntry, PullRequestRef, Region};
use mapdiffbot::error::{FailureStage, MapDiffError, Result};
use mapdiffbot::host::{InMemoryHost, PullRequestHost};
use mapdiffbot::pipeline::{DiffPipeline, JobRegistry};
use mapdiffbot::repo::RepositoryAccessManager;
use mapdiffbot::service::DiffService;
use mapdiffbot::storage::{DiffStore, SqliteDiffStore};
use mapdiffbot::tool::{MapTool, RenderResult, ToolContext, ToolResult};
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(30);

/// Map tool double.
///
/// - diff reports one changed tile at (5, 5) when the files differ
/// - paths containing `broken` fail to diff
/// - paths containing `unrenderable` fail to render
/// - the first render of a path containing `blocking` waits for cancellation
/// - renders write `<input contents>|<region>` to the output
struct ScriptedTool {
    diffs: AtomicUsize,
    renders: AtomicUsize,
    blocked_once: AtomicBool,
    render_blocked: Notify,
}

impl ScriptedTool {
    fn new() -> Self {
        Self {
            diffs: AtomicUsize::new(0),
            renders: AtomicUsize::new(0),
            blocked_once: AtomicBool::new(false),
            render_blocked: Notify::new(),
        }
    }

    fn result(command_line: String, region: Option<Region>) -> ToolResult {
        ToolResult {
            command_line,
            output: String::new(),
            exit_code: Some(0),
            region,
        }
    }
}

#[async_trait]
impl MapTool for ScriptedTool {
    async fn diff(&self, ctx: &ToolContext, before: &Path, after: &Path, _cancel: &CancellationToken) -> Result<ToolResult> {
        self.diffs.fetch_add(1, Ordering::SeqCst);
        let name = after.to_string_lossy();
        if name.contains("broken") {
            return Err(MapDiffError::Tool(format!("cannot parse {}", name)));
        }
        let old = tokio::fs::read_to_string(ctx.resolve(before)).await?;
        let new = tokio::fs::read_to_string(ctx.resolve(after)).await?;
        let region = (old != new).then(|| Region::new(5, 5, 5, 5));
        Ok(Self::result(format!("diff {} {}", before.display(), after.display()), region))
    }

    async fn render(
        &self,
        ctx: &ToolContext,
        input: &Path,
        region: Option<Region>,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<RenderResult> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        let command_line = format!("render {}", input.display());
        if input.to_string_lossy().contains("blocking") && !self.blocked_once.swap(true, Ordering::SeqCst) {
            self.render_blocked.notify_one();
            cancel.cancelled().await;
            return Err(MapDiffError::Cancelled);
        }
        if input.to_string_lossy().contains("unrenderable") {
            return Ok(RenderResult {
                tool: Self::result(command_line, None),
                input_path: input.to_path_buf(),
                output_path: None,
            });
        }

        let contents = tokio::fs::read_to_string(ctx.resolve(input)).await?;
        let region = region.map_or_else(|| "whole".to_string(), |r| r.to_string());
        tokio::fs::write(output, format!("{}|{}", contents.trim(), region)).await?;
        Ok(RenderResult {
            tool: Self::result(command_line, None),
            input_path: input.to_path_buf(),
            output_path: Some(output.to_path_buf()),
        })
    }

    async fn map_size(&self, _ctx: &ToolContext, input: &Path, _cancel: &CancellationToken) -> Result<ToolResult> {
        Ok(Self::result(format!("size {}", input.display()), Some(Region::from_size(10, 10))))
    }
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git").args(args).current_dir(dir).output().unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

enum Change<'a> {
    Write(&'a str, &'a str),
    Delete(&'a str),
}

fn apply(repo: &Path, changes: &[Change<'_>], message: &str) -> String {
    for change in changes {
        match change {
            Change::Write(path, content) => {
                let target = repo.join(path);
                std::fs::create_dir_all(target.parent().unwrap()).unwrap();
                std::fs::write(target, content).unwrap();
            }
            Change::Delete(path) => std::fs::remove_file(repo.join(path)).unwrap(),
        }
    }
    git(repo, &["add", "--all"]);
    git(repo, &["commit", "--quiet", "-m", message]);
    git(repo, &["rev-parse", "HEAD"])
}

struct Fixture {
    temp: TempDir,
    remote: PathBuf,
    base: String,
    config: Config,
    host: Arc<InMemoryHost>,
    tool: Arc<ScriptedTool>,
    pipeline: Arc<DiffPipeline>,
}

impl Fixture {
    /// Remote `station` with a manifest and three maps at `base`.
    fn new() -> Self {
        Self::with_manifest(true)
    }

    fn with_manifest(manifest: bool) -> Self {
        let temp = TempDir::new().unwrap();
        let remote = temp.path().join("station");
        std::fs::create_dir_all(&remote).unwrap();
        git(&remote, &["init", "--quiet"]);
        git(&remote, &["config", "user.email", "test@test.com"]);
        git(&remote, &["config", "user.name", "Test"]);
        git(&remote, &["config", "commit.gpgsign", "false"]);

        let mut changes = vec![
            Change::Write("maps/alpha.dmm", "a0"),
            Change::Write("maps/broken.dmm", "b0"),
            Change::Write("maps/gamma.dmm", "g0"),
            Change::Write("code/thing.dm", "code"),
        ];
        if manifest {
            changes.push(Change::Write("station.dme", "#include \"code/thing.dm\""));
        }
        let base = apply(&remote, &changes, "base");

        let mut config = Config::default();
        config.repositories.root = temp.path().join("repos");
        config.repositories.remote_url = format!("{}/{{name}}", temp.path().display());
        config.pipeline.work_dir = temp.path().join("work");
        config.pipeline.mergeable_delay_ms = 5;

        let host = Arc::new(InMemoryHost::new("mapdiffbot"));
        let tool = Arc::new(ScriptedTool::new());
        let pipeline = Arc::new(DiffPipeline::new(
            &config,
            host.clone() as Arc<dyn PullRequestHost>,
            Arc::new(RepositoryAccessManager::new(config.repositories.clone())),
            tool.clone() as Arc<dyn MapTool>,
            Arc::new(JobRegistry::new()),
        ));

        Self {
            temp,
            remote,
            base,
            config,
            host,
            tool,
            pipeline,
        }
    }

    /// Publish `changes` on top of `base` as pull request `number`, replacing any earlier head.
    fn pull_request(&self, number: u64, changes: &[Change<'_>]) -> PullRequestRef {
        let original = git(&self.remote, &["rev-parse", "--abbrev-ref", "HEAD"]);
        let branch = format!("feature-{}", number);
        git(&self.remote, &["checkout", "--quiet", "-B", &branch, &self.base]);
        let head = apply(&self.remote, changes, &format!("pull request {}", number));
        git(&self.remote, &["update-ref", &format!("refs/pull/{}/head", number), &head]);
        git(&self.remote, &["checkout", "--quiet", &original]);

        let pr = PullRequestRef {
            owner: "owner".to_string(),
            name: "station".to_string(),
            number,
            base_sha: self.base.clone(),
            head_sha: head,
            mergeable: Some(true),
        };
        let files: Vec<&str> = changes
            .iter()
            .map(|c| match c {
                Change::Write(path, _) | Change::Delete(path) => *path,
            })
            .collect();
        self.host.set_changed_files(&pr.job_key(), files);
        pr
    }

    fn working_copy(&self) -> PathBuf {
        self.config.repositories.root.join("owner/station")
    }
}

fn entry<'a>(entries: &'a [MapDiffEntry], path: &str) -> &'a MapDiffEntry {
    entries
        .iter()
        .find(|e| e.file_path == path)
        .unwrap_or_else(|| panic!("no entry for {}", path))
}

fn image(bytes: &Option<Vec<u8>>) -> Option<String> {
    bytes.as_ref().map(|b| String::from_utf8(b.clone()).unwrap())
}

/// Integration test: per-file diff failure leaves sibling files complete
#[tokio::test]
async fn test_partial_failure_isolation() {
    let fx = Fixture::new();
    let pr = fx.pull_request(
        1,
        &[
            Change::Write("maps/alpha.dmm", "a1"),
            Change::Write("maps/broken.dmm", "b1"),
            Change::Write("maps/gamma.dmm", "g1"),
        ],
    );

    let outcome = fx
        .pipeline
        .run_detailed(&pr, &pr.job_key(), &CancellationToken::new())
        .await
        .unwrap();

    let expanded = Region::new(4, 4, 7, 7);
    for (path, before, after) in [("maps/alpha.dmm", "a0", "a1"), ("maps/gamma.dmm", "g0", "g1")] {
        let e = entry(&outcome.entries, path);
        assert_eq!(e.region, Some(expanded));
        assert_eq!(image(&e.before), Some(format!("{}|{}", before, expanded)));
        assert_eq!(image(&e.after), Some(format!("{}|{}", after, expanded)));
        assert_eq!(e.map_path, fx.working_copy().join(path));
    }

    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].file, "maps/broken.dmm");
    assert_eq!(outcome.failures[0].stage, FailureStage::Diff);

    // the failed diff still gets whole-map renders
    let broken = entry(&outcome.entries, "maps/broken.dmm");
    assert_eq!(broken.region, None);
    assert_eq!(image(&broken.after).as_deref(), Some("b1|whole"));
    assert!(outcome.cloned);
}

/// Integration test: created and deleted maps only get the side that exists
#[tokio::test]
async fn test_new_and_deleted_files() {
    let fx = Fixture::new();
    let pr = fx.pull_request(
        2,
        &[Change::Write("maps/new.dmm", "n1"), Change::Delete("maps/alpha.dmm")],
    );

    let entries = fx.pipeline.run(&pr, &pr.job_key(), &CancellationToken::new()).await.unwrap();
    assert_eq!(entries.len(), 2);

    let created = entry(&entries, "maps/new.dmm");
    assert!(created.is_new_file());
    assert_eq!(image(&created.after).as_deref(), Some("n1|whole"));

    let deleted = entry(&entries, "maps/alpha.dmm");
    assert!(deleted.is_deleted_file());
    assert_eq!(image(&deleted.before).as_deref(), Some("a0|whole"));

    assert_eq!(fx.tool.diffs.load(Ordering::SeqCst), 0);
}

/// Integration test: a newer run for the same pull request cancels the older one
#[tokio::test]
async fn test_superseding_cancels_previous_run() {
    let fx = Fixture::new();
    let pr = fx.pull_request(3, &[Change::Write("maps/blocking.dmm", "x1")]);
    let key = pr.job_key();

    let first = {
        let pipeline = fx.pipeline.clone();
        let pr = pr.clone();
        let key = key.clone();
        tokio::spawn(async move { pipeline.run(&pr, &key, &CancellationToken::new()).await })
    };
    tokio::time::timeout(WAIT, fx.tool.render_blocked.notified()).await.unwrap();

    let cancel = CancellationToken::new();
    let second = tokio::time::timeout(WAIT, fx.pipeline.run(&pr, &key, &cancel))
        .await
        .unwrap()
        .unwrap();
    let first = tokio::time::timeout(WAIT, first).await.unwrap().unwrap();

    assert!(matches!(first, Err(MapDiffError::Cancelled)));
    assert_eq!(second.len(), 1);
    assert_eq!(fx.tool.renders.load(Ordering::SeqCst), 2);
    assert_eq!(fx.pipeline.registry().active_jobs(), 0);
}

/// Integration test: mergeable status that never resolves is a silent no-op
#[tokio::test]
async fn test_unresolved_mergeable_is_noop() {
    let fx = Fixture::new();
    let mut pr = fx.pull_request(4, &[Change::Write("maps/alpha.dmm", "a1")]);
    pr.mergeable = None;
    fx.host.set_mergeable_sequence(&pr.job_key(), [None]);

    let entries = fx.pipeline.run(&pr, &pr.job_key(), &CancellationToken::new()).await.unwrap();

    assert!(entries.is_empty());
    assert_eq!(fx.host.mergeable_queries(&pr.job_key()), 5);
    assert!(!fx.working_copy().exists());
}

/// Integration test: mergeable status resolving on a later poll proceeds
#[tokio::test]
async fn test_mergeable_resolves_after_retry() {
    let fx = Fixture::new();
    let mut pr = fx.pull_request(5, &[Change::Write("maps/alpha.dmm", "a1")]);
    pr.mergeable = None;
    fx.host.set_mergeable_sequence(&pr.job_key(), [None, None, Some(true)]);

    let entries = fx.pipeline.run(&pr, &pr.job_key(), &CancellationToken::new()).await.unwrap();

    assert_eq!(entries.len(), 1);
    assert_eq!(fx.host.mergeable_queries(&pr.job_key()), 3);
}

/// Integration test: not mergeable and no map files both end without output
#[tokio::test]
async fn test_noop_paths() {
    let fx = Fixture::new();
    let mut pr = fx.pull_request(6, &[Change::Write("maps/alpha.dmm", "a1")]);
    pr.mergeable = Some(false);
    assert!(fx.pipeline.run(&pr, &pr.job_key(), &CancellationToken::new()).await.unwrap().is_empty());
    assert_eq!(fx.host.mergeable_queries(&pr.job_key()), 0);

    let pr = fx.pull_request(7, &[Change::Write("code/thing.dm", "changed")]);
    assert!(fx.pipeline.run(&pr, &pr.job_key(), &CancellationToken::new()).await.unwrap().is_empty());
    assert!(!fx.working_copy().exists());
}

/// Integration test: a repository without a manifest fails the run
#[tokio::test]
async fn test_missing_manifest_is_fatal() {
    let fx = Fixture::with_manifest(false);
    let pr = fx.pull_request(8, &[Change::Write("maps/alpha.dmm", "a1")]);

    let err = fx.pipeline.run(&pr, &pr.job_key(), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, MapDiffError::MissingManifest { .. }));

    // the working copy was released
    let again = tokio::time::timeout(WAIT, fx.pipeline.run(&pr, &pr.job_key(), &CancellationToken::new()))
        .await
        .unwrap();
    assert!(matches!(again, Err(MapDiffError::MissingManifest { .. })));
}

/// Integration test: a conflicting pull request fails and leaves a clean working copy
#[tokio::test]
async fn test_merge_conflict_is_fatal() {
    let fx = Fixture::new();
    let mut pr = fx.pull_request(9, &[Change::Write("maps/alpha.dmm", "from pull request")]);
    pr.base_sha = apply(&fx.remote, &[Change::Write("maps/alpha.dmm", "from main")], "diverge");

    let err = fx.pipeline.run(&pr, &pr.job_key(), &CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, MapDiffError::MergeConflict(_)));
    assert_eq!(git(&fx.working_copy(), &["status", "--porcelain", "--untracked-files=no"]), "");
}

/// Integration test: every file failing surfaces one aggregate error
#[tokio::test]
async fn test_all_files_failed() {
    let fx = Fixture::new();
    let pr = fx.pull_request(10, &[Change::Write("maps/unrenderable.dmm", "u1")]);

    let err = fx.pipeline.run(&pr, &pr.job_key(), &CancellationToken::new()).await.unwrap_err();
    match err {
        MapDiffError::AllFilesFailed(failures) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].stage, FailureStage::RenderAfter);
        }
        other => panic!("unexpected error: {}", other),
    }
}

/// Integration test: the service stores results and posts one report
#[tokio::test]
async fn test_service_publishes_report() {
    let fx = Fixture::new();
    let store = Arc::new(SqliteDiffStore::open(&fx.temp.path().join("db/diffs.sqlite3")).unwrap());
    let service = DiffService::new(fx.pipeline.clone(), store.clone() as Arc<dyn DiffStore>, &fx.config.report);
    let pr = fx.pull_request(
        11,
        &[Change::Write("maps/alpha.dmm", "a1"), Change::Write("maps/broken.dmm", "b1")],
    );

    let outcome = tokio::time::timeout(WAIT, service.handle_event(pr.clone()))
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome.entries.len(), 2);

    // run again to exercise the singleton update
    service.process_event(&pr).await.unwrap();

    let stored = store.list(&pr.repository(), pr.number).await.unwrap();
    assert_eq!(stored.len(), 2);
    let alpha = entry(&outcome.entries, "maps/alpha.dmm");
    let after = store
        .load_image(&pr.repository(), pr.number, &alpha.file_id, ImageSide::After)
        .await
        .unwrap();
    assert_eq!(after, alpha.after);

    let comments = fx.host.comments(&pr.job_key());
    let bot: Vec<_> = comments.iter().filter(|c| c.author == "mapdiffbot").collect();
    assert_eq!(bot.len(), 1);
    assert!(bot[0].body.contains("`maps/alpha.dmm`"));
    assert!(bot[0].body.contains("- `maps/broken.dmm` (diff)"));
}

/// Integration test: a failed run posts a failure report
#[tokio::test]
async fn test_service_reports_failure() {
    let fx = Fixture::with_manifest(false);
    let store = Arc::new(SqliteDiffStore::open_in_memory().unwrap());
    let service = DiffService::new(fx.pipeline.clone(), store as Arc<dyn DiffStore>, &fx.config.report);
    let pr = fx.pull_request(12, &[Change::Write("maps/alpha.dmm", "a1")]);

    let err = service.process_event(&pr).await.unwrap_err();
    assert!(matches!(err, MapDiffError::MissingManifest { .. }));

    let body = fx.host.bot_comment(&pr.job_key()).unwrap();
    assert!(body.contains("manifest"));
}

/// Integration test: a service run superseded by a newer event stores and posts nothing
#[tokio::test]
async fn test_service_discards_superseded_run() {
    let fx = Fixture::new();
    let store = Arc::new(SqliteDiffStore::open_in_memory().unwrap());
    let service = DiffService::new(fx.pipeline.clone(), store.clone() as Arc<dyn DiffStore>, &fx.config.report);

    let first = fx.pull_request(13, &[Change::Write("maps/blocking.dmm", "first")]);
    let first_task = service.handle_event(first.clone());
    tokio::time::timeout(WAIT, fx.tool.render_blocked.notified()).await.unwrap();

    let second = fx.pull_request(13, &[Change::Write("maps/blocking.dmm", "second")]);
    assert_ne!(first.head_sha, second.head_sha);
    let second_task = service.handle_event(second.clone());

    let first_result = tokio::time::timeout(WAIT, first_task).await.unwrap().unwrap();
    assert!(matches!(first_result, Err(MapDiffError::Cancelled)));
    let outcome = tokio::time::timeout(WAIT, second_task).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome.entries.len(), 1);

    let stored = store.list(&second.repository(), second.number).await.unwrap();
    assert_eq!(stored.len(), 1);
    let after = store
        .load_image(&second.repository(), second.number, &stored[0].file_id, ImageSide::After)
        .await
        .unwrap();
    assert_eq!(after, Some(b"second|whole".to_vec()));

    // clone notice from the first run, report from the second
    assert_eq!(fx.host.singleton_posts(&second.job_key()), 2);
    assert!(fx.host.bot_comment(&second.job_key()).unwrap().contains("`maps/blocking.dmm`"));
    assert_eq!(fx.pipeline.registry().active_jobs(), 0);
}

/// Integration test: a slow clone notice lands before the report, never after
#[tokio::test]
async fn test_clone_notice_precedes_report() {
    let fx = Fixture::new();
    let store = Arc::new(SqliteDiffStore::open_in_memory().unwrap());
    let service = DiffService::new(fx.pipeline.clone(), store as Arc<dyn DiffStore>, &fx.config.report);
    let pr = fx.pull_request(14, &[Change::Write("maps/alpha.dmm", "a1")]);
    fx.host.set_comment_delays(&pr.job_key(), [Duration::from_millis(500)]);

    let outcome = service.process_event(&pr).await.unwrap();
    assert!(outcome.cloned);

    let body = fx.host.bot_comment(&pr.job_key()).unwrap();
    assert!(body.contains("`maps/alpha.dmm`"), "{}", body);
    assert!(!body.contains("cloned for the first time"));
    assert_eq!(fx.host.singleton_posts(&pr.job_key()), 2);
}

/// Integration test: a failing host read fails the run and is reported
#[tokio::test]
async fn test_host_failure_is_reported() {
    let fx = Fixture::new();
    let store = Arc::new(SqliteDiffStore::open_in_memory().unwrap());
    let service = DiffService::new(fx.pipeline.clone(), store as Arc<dyn DiffStore>, &fx.config.report);
    let pr = fx.pull_request(15, &[Change::Write("maps/alpha.dmm", "a1")]);
    fx.host.set_unavailable(&pr.job_key(), "rate limited");

    let err = service.process_event(&pr).await.unwrap_err();
    assert!(matches!(err, MapDiffError::Host(_)));
    assert!(!fx.working_copy().exists());

    let body = fx.host.bot_comment(&pr.job_key()).unwrap();
    assert!(body.contains("rate limited"));
}
