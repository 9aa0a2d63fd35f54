//! Comment jobs.
//!
//! A pull-request comment whose body contains the `/runtest` trigger, made
//! by a user on the authorized list, runs the same pipeline as a push
//! against the PR's head commit. Anything else returns without side
//! effects.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::events::CommentEvent;
use crate::repo::commit::{CommitStatus, StatusState};

use super::core::CoreJob;
use super::{Job, JobDeps, JobScope, StateCell};

/// The comment token that triggers a run.
const TRIGGER: &str = "/runtest";

/// CI run triggered by a pull-request comment.
pub struct CommentJob {
    event: CommentEvent,
    deps: JobDeps,
    state: StateCell,
}

impl CommentJob {
    pub fn new(event: CommentEvent, deps: JobDeps) -> Self {
        CommentJob {
            event,
            deps,
            state: StateCell::new(),
        }
    }

    /// Whether this comment asks for a run and the commenter may have one.
    fn should_execute(&self) -> bool {
        let triggered = self
            .event
            .body
            .split_whitespace()
            .any(|token| token == TRIGGER);
        if !triggered {
            return false;
        }
        if !self
            .deps
            .authorized_users
            .iter()
            .any(|user| user == &self.event.user)
        {
            info!(
                user = %self.event.user,
                "user not authorized to run jobs, ignoring"
            );
            return false;
        }
        true
    }
}

#[async_trait]
impl Job for CommentJob {
    fn repo_name(&self) -> &str {
        &self.event.repo.name
    }

    fn ref_name(&self) -> &str {
        &self.event.ref_name
    }

    fn state(&self) -> StateCell {
        self.state.clone()
    }

    async fn run(&self, scope: JobScope) {
        if !self.should_execute() {
            return;
        }
        info!(
            user = %self.event.user,
            sha = %self.event.sha,
            repo = %self.event.repo.name,
            ref_name = %self.event.ref_name,
            "authorized user requested a run"
        );

        // Acknowledge the request before the tree download starts.
        let queued = CommitStatus::new(StatusState::Pending, "queued");
        if let Err(err) = self
            .deps
            .forge
            .post_status(
                &self.event.repo.owner,
                &self.event.repo.name,
                &self.event.sha,
                &queued,
            )
            .await
        {
            warn!(error = %err, "failed to post queued status");
        }

        let mut core = CoreJob::new(
            self.deps.forge.clone(),
            self.deps.cache.clone(),
            self.event.repo.clone(),
            self.event.sha.clone(),
            self.event.ref_name.clone(),
            &self.deps.workspace_root,
        );
        let _ = core.run(&scope).await;
    }
}
