//! Jobs: units of CI work created from webhook events.
//!
//! A job carries its triggering event and runs the core pipeline against a
//! target commit. The closed set of job kinds mirrors the event kinds:
//! [`PushJob`] for pushes, [`CommentJob`] for pull-request comments. The
//! manager owns job lifecycles; a job only reports through its state cell.

pub mod comment;
pub mod core;
pub mod push;

pub use comment::CommentJob;
pub use core::CoreJob;
pub use push::PushJob;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::events::Event;
use crate::forge::ForgeApi;
use crate::repo::ObjectCache;

/// Lifecycle states of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Complete,
    Cancelled,
    TimedOut,
}

/// Shared handle to a job's lifecycle state.
///
/// The manager writes transitions; tests and observers read them.
#[derive(Debug, Clone)]
pub struct StateCell(Arc<Mutex<JobState>>);

impl StateCell {
    pub fn new() -> Self {
        StateCell(Arc::new(Mutex::new(JobState::Queued)))
    }

    pub fn get(&self) -> JobState {
        *self.0.lock().expect("job state lock poisoned")
    }

    pub fn set(&self, state: JobState) {
        *self.0.lock().expect("job state lock poisoned") = state;
    }
}

impl Default for StateCell {
    fn default() -> Self {
        StateCell::new()
    }
}

/// Cancellation scopes handed to a running job.
#[derive(Debug, Clone)]
pub struct JobScope {
    /// The job's own scope: cancelled on preemption, deadline or shutdown.
    pub cancel: CancellationToken,

    /// The process root scope. The after-script derives from this one so
    /// cleanup still runs when the job scope is already cancelled.
    pub process: CancellationToken,
}

impl JobScope {
    pub fn new(cancel: CancellationToken, process: CancellationToken) -> Self {
        JobScope { cancel, process }
    }
}

/// Collaborators a job needs to run.
#[derive(Clone)]
pub struct JobDeps {
    pub forge: Arc<ForgeApi>,
    pub cache: Arc<ObjectCache>,

    /// Workspaces are created under `<workspace_root>/<commit-hash>/`.
    pub workspace_root: PathBuf,

    /// Users permitted to trigger comment jobs.
    pub authorized_users: Arc<Vec<String>>,
}

/// A runnable unit of CI work.
#[async_trait]
pub trait Job: Send + Sync {
    fn repo_name(&self) -> &str;
    fn ref_name(&self) -> &str;
    fn state(&self) -> StateCell;

    /// Runs the job to completion, observing `scope.cancel` cooperatively.
    async fn run(&self, scope: JobScope);
}

/// Builds the job for an event.
pub fn factory(event: Event, deps: JobDeps) -> Box<dyn Job> {
    match event {
        Event::Push(event) => Box::new(PushJob::new(event, deps)),
        Event::Comment(event) => Box::new(CommentJob::new(event, deps)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CommentEvent, PushEvent};
    use crate::repo::{Reference, RepoSummary};

    fn deps() -> JobDeps {
        JobDeps {
            forge: Arc::new(ForgeApi::new("http://unused.invalid", "me", "tok")),
            cache: Arc::new(ObjectCache::new()),
            workspace_root: std::env::temp_dir(),
            authorized_users: Arc::new(vec!["octocat".to_string()]),
        }
    }

    #[test]
    fn state_cell_starts_queued() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), JobState::Queued);
        cell.set(JobState::Running);
        assert_eq!(cell.get(), JobState::Running);
    }

    #[test]
    fn factory_builds_matching_job_kind() {
        let push = Event::Push(PushEvent {
            repo: RepoSummary::new("example", "owner"),
            ref_name: "refs/heads/main".into(),
            reference: Reference {
                name: "refs/heads/main".into(),
                head: Some("abc".into()),
            },
            sender: "octocat".into(),
        });
        let job = factory(push, deps());
        assert_eq!(job.repo_name(), "example");
        assert_eq!(job.ref_name(), "refs/heads/main");

        let comment = Event::Comment(CommentEvent {
            repo: RepoSummary::new("example", "owner"),
            ref_name: "refs/heads/feature".into(),
            reference: Reference {
                name: "refs/heads/feature".into(),
                head: Some("abc".into()),
            },
            sha: "abc".into(),
            body: "/runtest".into(),
            user: "octocat".into(),
            action: "created".into(),
        });
        let job = factory(comment, deps());
        assert_eq!(job.ref_name(), "refs/heads/feature");
    }
}
