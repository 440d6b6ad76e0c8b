use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod cli;

use cli::Cli;
use cli::commands::Commands;
use mapdiffbot::config::Config;
use mapdiffbot::domain::{PullRequestRef, Region, RepositoryKey};
use mapdiffbot::host::{InMemoryHost, PullRequestHost};
use mapdiffbot::pipeline::{DiffPipeline, JobRegistry, PipelineOutcome, workspace};
use mapdiffbot::repo::RepositoryAccessManager;
use mapdiffbot::report;
use mapdiffbot::service::DiffService;
use mapdiffbot::storage::{DiffStore, SqliteDiffStore};
use mapdiffbot::tool::{MapTool, ProcessThrottle, ToolContext, ToolInvoker};
use tokio_util::sync::CancellationToken;

fn setup_logging() -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mapdiffbot")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("mapdiffbot.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn tool_invoker(config: &Config) -> ToolInvoker {
    ToolInvoker::new(config.tool.clone(), ProcessThrottle::new(config.tool.max_concurrent))
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("{}", "Interrupted, cancelling...".yellow());
            token.cancel();
        }
    });
}

async fn run_application(cli: &Cli, config: &Config) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        Commands::Diff {
            repository,
            number,
            base,
            head,
            files,
            save,
        } => handle_diff_command(repository, *number, base, head, files, *save, config).await,
        Commands::Render {
            workdir,
            map,
            output,
            region,
        } => handle_render_command(workdir, map, output, region.as_deref(), config).await,
        Commands::Bounds { workdir, map } => handle_bounds_command(workdir, map, config).await,
        Commands::Show { repository, number } => handle_show_command(repository, *number, config).await,
    }
}

async fn handle_diff_command(
    repository: &str,
    number: u64,
    base: &str,
    head: &str,
    files: &[String],
    save: bool,
    config: &Config,
) -> Result<()> {
    let key: RepositoryKey = repository.parse().map_err(|e: String| eyre!(e))?;
    let pr = PullRequestRef {
        owner: key.owner.clone(),
        name: key.name.clone(),
        number,
        base_sha: base.to_string(),
        head_sha: head.to_string(),
        mergeable: Some(true),
    };
    info!("Running one-shot diff for {}", pr.job_key());
    println!("{} {}", "Diffing:".green(), pr.job_key());

    let host = Arc::new(InMemoryHost::new(env!("CARGO_PKG_NAME")));
    host.set_changed_files(&pr.job_key(), files.iter().cloned());

    let registry = Arc::new(JobRegistry::new());
    let pipeline = Arc::new(DiffPipeline::new(
        config,
        host.clone() as Arc<dyn PullRequestHost>,
        Arc::new(RepositoryAccessManager::new(config.repositories.clone())),
        Arc::new(tool_invoker(config)) as Arc<dyn MapTool>,
        registry.clone(),
    ));
    cancel_on_interrupt(registry.shutdown_token());

    if save {
        let store = SqliteDiffStore::open(&config.storage.database).context("Failed to open database")?;
        let service = DiffService::new(pipeline, Arc::new(store) as Arc<dyn DiffStore>, &config.report);
        let outcome = service.handle_event(pr.clone()).await.context("Diff task panicked")??;
        print_outcome(&outcome);
        if let Some(body) = host.bot_comment(&pr.job_key()) {
            println!("\n{}", body);
        }
        return Ok(());
    }

    let outcome = pipeline
        .run_detailed(&pr, &pr.job_key(), &registry.shutdown_token())
        .await
        .context("Diff failed")?;
    print_outcome(&outcome);
    if !outcome.is_noop() {
        let scratch = config.pipeline.work_dir.join(pr.job_key().relative_path());
        println!("{} {}", "Images in:".cyan(), scratch.display());
        println!(
            "\n{}",
            report::render_report(&pr, &outcome.entries, &outcome.failures, config.report.public_url.as_deref())
        );
    }
    Ok(())
}

fn print_outcome(outcome: &PipelineOutcome) {
    if outcome.is_noop() {
        println!("{}", "No map files to diff".yellow());
        return;
    }
    for entry in &outcome.entries {
        let region = entry.region.map_or_else(|| "whole map".to_string(), |r| r.to_string());
        println!("  {} {} [{}]", "✓".green(), entry.file_path, region);
    }
    for failure in &outcome.failures {
        println!("  {} {}", "✗".red(), failure);
    }
}

fn tool_context(workdir: &Path, config: &Config) -> Result<ToolContext> {
    let workdir = workdir.canonicalize().context("Failed to resolve working directory")?;
    let name = workdir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let manifest = workspace::find_manifest(&workdir, &config.tool.manifest_extension, &name)?;
    Ok(ToolContext::new(workdir, manifest))
}

async fn handle_render_command(
    workdir: &Path,
    map: &Path,
    output: &Path,
    region: Option<&str>,
    config: &Config,
) -> Result<()> {
    let region: Option<Region> = region
        .map(|r| r.parse::<Region>().map_err(|e| eyre!(e)))
        .transpose()?;
    let ctx = tool_context(workdir, config)?;
    let output = std::env::current_dir()?.join(output);
    info!("Rendering {} to {}", map.display(), output.display());

    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());
    let result = tool_invoker(config).render(&ctx, map, region, &output, &cancel).await?;

    match result.output_path {
        Some(path) => println!("{} {}", "Saved:".green(), path.display()),
        None => {
            println!("{} {}", "No image produced:".red(), result.tool.command_line);
            println!("{}", result.tool.output);
        }
    }
    Ok(())
}

async fn handle_bounds_command(workdir: &Path, map: &Path, config: &Config) -> Result<()> {
    let ctx = tool_context(workdir, config)?;
    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());
    let result = tool_invoker(config).map_size(&ctx, map, &cancel).await?;

    match result.region {
        Some(bounds) => println!(
            "{} {} ({} x {})",
            map.display().to_string().cyan(),
            bounds,
            bounds.span_x(),
            bounds.span_y()
        ),
        None => {
            println!("{} {}", "Could not read bounds:".red(), result.command_line);
            println!("{}", result.output);
        }
    }
    Ok(())
}

async fn handle_show_command(repository: &str, number: u64, config: &Config) -> Result<()> {
    let key: RepositoryKey = repository.parse().map_err(|e: String| eyre!(e))?;
    let store = SqliteDiffStore::open(&config.storage.database).context("Failed to open database")?;
    let diffs = store.list(&key, number).await?;

    if diffs.is_empty() {
        println!("{} {}#{}", "No stored diffs for".yellow(), key, number);
        return Ok(());
    }

    println!("{} {}#{}", "Stored diffs for".green(), key, number);
    for diff in diffs {
        let region = diff.region.map_or_else(|| "whole map".to_string(), |r| r.to_string());
        let sides = match (diff.has_before, diff.has_after) {
            (true, true) => "before+after",
            (false, true) => "after only",
            (true, false) => "before only",
            (false, false) => "no images",
        };
        println!(
            "  {} {} [{}] {} {}",
            diff.file_id.to_string().dimmed(),
            diff.file_path,
            region,
            sides,
            diff.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup logging first
    setup_logging().context("Failed to setup logging")?;

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    run_application(&cli, &config).await.context("Application failed")?;

    Ok(())
}
