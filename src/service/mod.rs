//! Event handling service
//!
//! DiffService schedules each pull request event as its own tokio task,
//! runs the pipeline, then persists and reports the outcome.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ReportConfig;
use crate::domain::PullRequestRef;
use crate::error::{MapDiffError, Result};
use crate::pipeline::{DiffPipeline, PipelineOutcome};
use crate::report;
use crate::storage::DiffStore;

/// Runs the pipeline for incoming events and publishes the results
#[derive(Clone)]
pub struct DiffService {
    pipeline: Arc<DiffPipeline>,
    store: Arc<dyn DiffStore>,
    public_url: Option<String>,
}

impl DiffService {
    pub fn new(pipeline: Arc<DiffPipeline>, store: Arc<dyn DiffStore>, report: &ReportConfig) -> Self {
        Self {
            pipeline,
            store,
            public_url: report.public_url.clone(),
        }
    }

    pub fn pipeline(&self) -> &Arc<DiffPipeline> {
        &self.pipeline
    }

    /// Handle a pull request event in the background.
    ///
    /// An event for a pull request that already has a run in flight supersedes it.
    pub fn handle_event(&self, pr: PullRequestRef) -> JoinHandle<Result<PipelineOutcome>> {
        let service = self.clone();
        tokio::spawn(async move { service.process_event(&pr).await })
    }

    /// Run the pipeline for `pr` and publish what it produced.
    pub async fn process_event(&self, pr: &PullRequestRef) -> Result<PipelineOutcome> {
        let job_key = pr.job_key();
        let parent = self.pipeline.registry().shutdown_token();

        match self.pipeline.run_detailed(pr, &job_key, &parent).await {
            Ok(outcome) if outcome.is_noop() => {
                debug!(job = %job_key, "Nothing to report");
                Ok(outcome)
            }
            Ok(outcome) => {
                // the run's scope is gone; an active job here is a newer one
                if self.pipeline.registry().is_active(&job_key) {
                    debug!(job = %job_key, "Superseded before publishing, discarding results");
                    return Err(MapDiffError::Cancelled);
                }
                self.publish(pr, &outcome).await?;
                Ok(outcome)
            }
            Err(MapDiffError::Cancelled) => {
                debug!(job = %job_key, "Run cancelled");
                Err(MapDiffError::Cancelled)
            }
            Err(e) => {
                error!(
                    owner = %pr.owner,
                    repo = %pr.name,
                    number = pr.number,
                    base = %pr.base_sha,
                    head = %pr.head_sha,
                    error = %e,
                    "Map diff failed"
                );
                let body = match &e {
                    MapDiffError::AllFilesFailed(failures) => {
                        report::render_report(pr, &[], failures, self.public_url.as_deref())
                    }
                    other => report::failure_report(pr, other),
                };
                if let Err(post_error) = self.pipeline.host().post_singleton_comment(pr, &body).await {
                    warn!(job = %job_key, error = %post_error, "Failed to post failure report");
                }
                Err(e)
            }
        }
    }

    async fn publish(&self, pr: &PullRequestRef, outcome: &PipelineOutcome) -> Result<()> {
        self.store.save(&outcome.entries).await?;
        let body = report::render_report(pr, &outcome.entries, &outcome.failures, self.public_url.as_deref());
        self.pipeline.host().post_singleton_comment(pr, &body).await?;
        info!(
            job = %pr.job_key(),
            entries = outcome.entries.len(),
            failures = outcome.failures.len(),
            "Published map diff report"
        );
        Ok(())
    }

    /// Cancel every in-flight run.
    pub fn shutdown(&self) {
        info!("Shutting down map diff service");
        self.pipeline.registry().shutdown();
    }
}
