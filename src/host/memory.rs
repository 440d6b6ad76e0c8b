//! In-process [`PullRequestHost`] backed by plain maps.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::PullRequestHost;
use crate::domain::{JobKey, PullRequestRef};
use crate::error::{MapDiffError, Result};

/// A comment on a pull request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostComment {
    pub id: u64,
    pub author: String,
    pub body: String,
}

#[derive(Default)]
struct HostState {
    changed_files: HashMap<JobKey, Vec<String>>,
    /// Answers handed out in order; the last one repeats
    mergeable: HashMap<JobKey, VecDeque<Option<bool>>>,
    mergeable_queries: HashMap<JobKey, usize>,
    comments: HashMap<JobKey, Vec<HostComment>>,
    /// Latency applied to successive singleton posts
    comment_delays: HashMap<JobKey, VecDeque<Duration>>,
    singleton_posts: HashMap<JobKey, usize>,
    /// Reads for these pull requests fail with the given message
    unavailable: HashMap<JobKey, String>,
    next_comment_id: u64,
}

/// Host that keeps pull request state in memory.
///
/// Unknown pull requests have no changed files and an unknown mergeable status.
pub struct InMemoryHost {
    author: String,
    state: Mutex<HostState>,
}

impl InMemoryHost {
    pub fn new(author: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            state: Mutex::new(HostState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_changed_files<I, S>(&self, job: &JobKey, files: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let files = files.into_iter().map(Into::into).collect();
        self.state().changed_files.insert(job.clone(), files);
    }

    /// Queue the answers returned by successive mergeable queries.
    pub fn set_mergeable_sequence(&self, job: &JobKey, answers: impl IntoIterator<Item = Option<bool>>) {
        self.state().mergeable.insert(job.clone(), answers.into_iter().collect());
    }

    pub fn mergeable_queries(&self, job: &JobKey) -> usize {
        self.state().mergeable_queries.get(job).copied().unwrap_or(0)
    }

    /// Post a comment as someone other than the bot.
    pub fn add_comment(&self, job: &JobKey, author: &str, body: &str) -> u64 {
        let mut state = self.state();
        state.next_comment_id += 1;
        let id = state.next_comment_id;
        state.comments.entry(job.clone()).or_default().push(HostComment {
            id,
            author: author.to_string(),
            body: body.to_string(),
        });
        id
    }

    /// Delay successive singleton posts by `delays`, in order.
    pub fn set_comment_delays(&self, job: &JobKey, delays: impl IntoIterator<Item = Duration>) {
        self.state().comment_delays.insert(job.clone(), delays.into_iter().collect());
    }

    /// Number of singleton posts made, creations and updates alike.
    pub fn singleton_posts(&self, job: &JobKey) -> usize {
        self.state().singleton_posts.get(job).copied().unwrap_or(0)
    }

    /// Make changed-file and mergeable queries fail.
    pub fn set_unavailable(&self, job: &JobKey, message: impl Into<String>) {
        self.state().unavailable.insert(job.clone(), message.into());
    }

    fn check_available(&self, job: &JobKey) -> Result<()> {
        match self.state().unavailable.get(job) {
            Some(message) => Err(MapDiffError::Host(format!("{}: {}", job, message))),
            None => Ok(()),
        }
    }

    pub fn comments(&self, job: &JobKey) -> Vec<HostComment> {
        self.state().comments.get(job).cloned().unwrap_or_default()
    }

    /// Body of the bot's own comment, if posted.
    pub fn bot_comment(&self, job: &JobKey) -> Option<String> {
        self.comments(job)
            .into_iter()
            .find(|c| c.author == self.author)
            .map(|c| c.body)
    }
}

#[async_trait]
impl PullRequestHost for InMemoryHost {
    async fn changed_files(&self, pr: &PullRequestRef) -> Result<Vec<String>> {
        self.check_available(&pr.job_key())?;
        Ok(self.state().changed_files.get(&pr.job_key()).cloned().unwrap_or_default())
    }

    async fn mergeable(&self, pr: &PullRequestRef) -> Result<Option<bool>> {
        let job = pr.job_key();
        self.check_available(&job)?;
        let mut state = self.state();
        *state.mergeable_queries.entry(job.clone()).or_default() += 1;

        let Some(answers) = state.mergeable.get_mut(&job) else {
            return Ok(None);
        };
        let answer = if answers.len() > 1 {
            answers.pop_front().flatten()
        } else {
            answers.front().copied().flatten()
        };
        Ok(answer)
    }

    async fn post_singleton_comment(&self, pr: &PullRequestRef, body: &str) -> Result<()> {
        let job = pr.job_key();
        let delay = self
            .state()
            .comment_delays
            .get_mut(&job)
            .and_then(VecDeque::pop_front);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        *state.singleton_posts.entry(job.clone()).or_default() += 1;
        state.next_comment_id += 1;
        let next_id = state.next_comment_id;
        let comments = state.comments.entry(job.clone()).or_default();

        match comments.iter_mut().find(|c| c.author == self.author) {
            Some(existing) => {
                debug!(job = %job, comment = existing.id, "Updating singleton comment");
                existing.body = body.to_string();
            }
            None => {
                debug!(job = %job, comment = next_id, "Creating singleton comment");
                comments.push(HostComment {
                    id: next_id,
                    author: self.author.clone(),
                    body: body.to_string(),
                });
            }
        }
        Ok(())
    }
}
