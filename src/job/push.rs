//! Push jobs.

use async_trait::async_trait;
use tracing::{debug, error};

use crate::events::PushEvent;

use super::core::CoreJob;
use super::{Job, JobDeps, JobScope, StateCell};

/// CI run triggered by a push: targets the pushed reference's head commit.
pub struct PushJob {
    event: PushEvent,
    deps: JobDeps,
    state: StateCell,
}

impl PushJob {
    pub fn new(event: PushEvent, deps: JobDeps) -> Self {
        PushJob {
            event,
            deps,
            state: StateCell::new(),
        }
    }
}

#[async_trait]
impl Job for PushJob {
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
        let Some(sha) = self.event.reference.head.clone() else {
            error!(
                repo = %self.event.repo.name,
                ref_name = %self.event.ref_name,
                "push job has no head commit"
            );
            return;
        };
        debug!(repo = %self.event.repo.name, sha = %sha, "running push job");

        let mut core = CoreJob::new(
            self.deps.forge.clone(),
            self.deps.cache.clone(),
            self.event.repo.clone(),
            sha,
            self.event.ref_name.clone(),
            &self.deps.workspace_root,
        );
        let _ = core.run(&scope).await;
    }
}
