//! The core job pipeline.
//!
//! Every job kind funnels into this sequence: fetch the tree into a
//! workspace, load `ci.yml`, open the report sinks (local log file plus a
//! remote paste), stream the main script, stream the after-script, and
//! reconcile the commit status on the forge after each stage.
//!
//! The main script runs under the job's cancellation scope and the spec's
//! deadline. The after-script deliberately runs under a scope derived from
//! the process root, so a preempted or timed-out job still gets its cleanup,
//! bounded by the same deadline.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::forge::{ForgeApi, ForgeError, PasteDocument};
use crate::parser::{Spec, SpecError};
use crate::repo::commit::{CommitStatus, StatusState};
use crate::repo::tree::{self, TreeError};
use crate::repo::{ObjectCache, RepoSummary};
use crate::report::{FileSink, PasteSink, ReportWriter};

use super::JobScope;

/// How often the report is pushed to the paste while a script streams.
const FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Errors surfaced by pipeline stages.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error("workspace io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Forge(#[from] ForgeError),
}

/// How a streamed script ended.
#[derive(Debug)]
enum ScriptOutcome {
    /// Exit status zero.
    Completed,
    /// Non-zero exit (or no observable status after a kill).
    Failed(Option<i32>),
    /// The stage deadline elapsed.
    TimedOut,
    /// The ambient scope was cancelled.
    Cancelled,
    /// The shell could not be started.
    SpawnFailed(String),
}

/// One run of the pipeline against a target commit.
pub struct CoreJob {
    forge: Arc<ForgeApi>,
    cache: Arc<ObjectCache>,
    repo: RepoSummary,
    sha: String,
    ref_name: String,
    workspace: PathBuf,
    spec: Option<Spec>,
    status: CommitStatus,
    target_url: String,
}

impl CoreJob {
    /// Creates a pipeline run. The workspace is partitioned per commit so
    /// concurrent jobs cannot collide.
    pub fn new(
        forge: Arc<ForgeApi>,
        cache: Arc<ObjectCache>,
        repo: RepoSummary,
        sha: impl Into<String>,
        ref_name: impl Into<String>,
        workspace_root: &std::path::Path,
    ) -> Self {
        let sha = sha.into();
        let workspace = workspace_root.join(&sha);
        CoreJob {
            forge,
            cache,
            repo,
            sha,
            ref_name: ref_name.into(),
            workspace,
            spec: None,
            status: CommitStatus::default(),
            target_url: String::new(),
        }
    }

    /// Runs the full pipeline. All outcomes are reported as commit statuses;
    /// the returned error is for the caller's log only.
    pub async fn run(&mut self, scope: &JobScope) -> Result<(), CoreError> {
        if let Err(err) = self.fetch_resources().await {
            warn!(sha = %self.sha, error = %err, "failed preparing job resources");
            self.set_status(StatusState::Error, format!("failed preparing job: {err}"));
            self.post_status().await?;
            return Err(err);
        }

        let writer = match self.open_sinks().await {
            Ok(writer) => writer,
            Err(err) => {
                warn!(sha = %self.sha, error = %err, "failed opening report sinks");
                self.set_status(StatusState::Error, format!("error logging: {err}"));
                self.post_status().await?;
                return Err(err);
            }
        };

        let main_result = self.run_main_script(scope, &writer).await;
        if let Err(err) = &main_result {
            warn!(sha = %self.sha, error = %err, "main script stage aborted");
        }

        let after_result = self.run_after_script(scope, &writer).await;
        if let Err(err) = &after_result {
            warn!(sha = %self.sha, error = %err, "after script stage aborted");
        }

        if let Err(err) = writer.flush().await {
            warn!(sha = %self.sha, error = %err, "failed flushing final report");
        }

        main_result.and(after_result)
    }

    /// Stage 1 + 2: fetch the tree into the workspace and load `ci.yml`.
    pub async fn fetch_resources(&mut self) -> Result<(), CoreError> {
        debug!(sha = %self.sha, repo = %self.repo.name, "downloading tree");
        let tree = tree::fetch(&self.forge, &self.cache, &self.repo, &self.sha).await?;
        tree::materialise(&self.cache, &tree.sha, &self.workspace)?;

        let mut spec = Spec::load(self.workspace.join("ci.yml"))?;
        self.register_meta_vars(&mut spec);
        self.spec = Some(spec);
        Ok(())
    }

    fn register_meta_vars(&self, spec: &mut Spec) {
        spec.set_meta_var("__commit__", &self.sha);
        spec.set_meta_var("__ref__", &self.ref_name);
        let branch = self.ref_name.rsplit('/').next().unwrap_or(&self.ref_name);
        spec.set_meta_var("__branch__", branch);
    }

    /// Stage 3: open the local log file and the remote paste, multiplexed
    /// behind one report writer. The paste URL becomes the status target.
    pub async fn open_sinks(&mut self) -> Result<Arc<ReportWriter>, CoreError> {
        std::fs::create_dir_all(&self.workspace)?;
        let log_path = self.workspace.join(format!("{}.log", self.sha));
        let file = FileSink::create(&log_path).await?;

        let doc = PasteDocument::create(
            Arc::clone(&self.forge),
            format!(
                "CI Results for repository '{}' commit '{}'",
                self.repo.name, self.sha
            ),
            format!("{}_{}.md", self.repo.name, self.sha),
        )
        .await?;
        self.target_url = doc.url();

        Ok(Arc::new(ReportWriter::new(vec![
            Box::new(file),
            Box::new(PasteSink::new(doc)),
        ])))
    }

    /// Stage 4: run the main script under the job scope and the spec
    /// deadline, streaming output into the report.
    pub async fn run_main_script(
        &mut self,
        scope: &JobScope,
        writer: &Arc<ReportWriter>,
    ) -> Result<(), CoreError> {
        let (cmd, deadline) = match self.spec.as_ref() {
            Some(spec) => (spec.script_cmd(&self.workspace), spec.timeout()),
            None => {
                self.set_status(StatusState::Error, "job resources were not prepared");
                self.post_status().await?;
                return Ok(());
            }
        };

        self.set_status(StatusState::Pending, "running main script");
        self.post_status().await?;

        let _ = writer.title("Main Script").await;
        let _ = writer.open_block().await;
        let outcome = stream_script(cmd, deadline, &scope.cancel, writer).await;
        let _ = writer.close_block().await;
        let _ = writer.flush().await;

        match outcome {
            ScriptOutcome::Completed => {
                self.set_status(StatusState::Success, "main script successful");
            }
            ScriptOutcome::Failed(code) => {
                debug!(sha = %self.sha, code = ?code, "main script failed");
                self.set_status(StatusState::Failure, "main script failed");
            }
            ScriptOutcome::TimedOut => {
                self.set_status(StatusState::Failure, "main script timed out");
            }
            ScriptOutcome::Cancelled => {
                self.set_status(StatusState::Error, "main script canceled");
            }
            ScriptOutcome::SpawnFailed(err) => {
                self.set_status(StatusState::Failure, format!("failed launching script: {err}"));
            }
        }

        // A broken paste takes precedence: the report is the user-visible
        // artefact, so losing it is reported as the status.
        if let Some(err) = writer.err().await {
            self.set_status(StatusState::Error, format!("error logging: {err}"));
        }

        self.post_status().await?;
        Ok(())
    }

    /// Stage 5: run the after-script.
    ///
    /// Always runs, on a scope derived from the process root rather than the
    /// (possibly cancelled) job scope, bounded by the spec deadline. Its
    /// outcome is posted only when it fails; a successful cleanup never
    /// downgrades the main stage's status.
    pub async fn run_after_script(
        &mut self,
        scope: &JobScope,
        writer: &Arc<ReportWriter>,
    ) -> Result<(), CoreError> {
        let (cmd, deadline) = match self.spec.as_ref() {
            Some(spec) => (spec.after_script_cmd(&self.workspace), spec.timeout()),
            None => return Ok(()),
        };

        let after_scope = scope.process.child_token();
        let _ = writer.title("After Script").await;
        let _ = writer.open_block().await;
        let outcome = stream_script(cmd, deadline, &after_scope, writer).await;
        let _ = writer.close_block().await;
        let _ = writer.flush().await;

        match outcome {
            ScriptOutcome::Completed => {
                info!(sha = %self.sha, "after script completed");
                Ok(())
            }
            ScriptOutcome::Failed(code) => {
                debug!(sha = %self.sha, code = ?code, "after script failed");
                self.set_status(StatusState::Failure, "after script failed");
                self.post_status().await
            }
            ScriptOutcome::TimedOut => {
                self.set_status(StatusState::Failure, "after script timed out");
                self.post_status().await
            }
            ScriptOutcome::Cancelled => {
                self.set_status(StatusState::Error, "after script canceled");
                self.post_status().await
            }
            ScriptOutcome::SpawnFailed(err) => {
                self.set_status(
                    StatusState::Failure,
                    format!("failed launching after script: {err}"),
                );
                self.post_status().await
            }
        }
    }

    fn set_status(&mut self, state: StatusState, description: impl Into<String>) {
        self.status = CommitStatus::new(state, description);
        self.status.target_url = self.target_url.clone();
    }

    async fn post_status(&self) -> Result<(), CoreError> {
        self.forge
            .post_status(&self.repo.owner, &self.repo.name, &self.sha, &self.status)
            .await?;
        Ok(())
    }
}

/// Streams a script to the report writer.
///
/// Three actors cooperate: line forwarders reading the child's stdout and
/// stderr, a ticker flushing the report every [`FLUSH_INTERVAL`] so the
/// remote paste updates incrementally, and this future waiting on the child.
/// All of them are joined before the function returns, whatever the outcome.
async fn stream_script(
    mut cmd: Command,
    deadline: Duration,
    cancel: &CancellationToken,
    writer: &Arc<ReportWriter>,
) -> ScriptOutcome {
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => return ScriptOutcome::SpawnFailed(err.to_string()),
    };

    let mut forwarders = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        forwarders.push(tokio::spawn(forward_lines(stdout, Arc::clone(writer))));
    }
    if let Some(stderr) = child.stderr.take() {
        forwarders.push(tokio::spawn(forward_lines(stderr, Arc::clone(writer))));
    }

    let ticker_stop = CancellationToken::new();
    let ticker = tokio::spawn({
        let writer = Arc::clone(writer);
        let stop = ticker_stop.clone();
        async move {
            let mut interval = tokio::time::interval(FLUSH_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {
                        let _ = writer.flush().await;
                    }
                }
            }
        }
    });

    let mut timed_out = false;
    let mut cancelled = false;
    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = tokio::time::sleep(deadline) => {
            timed_out = true;
            None
        }
        _ = cancel.cancelled() => {
            cancelled = true;
            None
        }
    };

    let exit = match waited {
        Some(status) => status.ok(),
        None => {
            let _ = child.start_kill();
            child.wait().await.ok()
        }
    };

    for forwarder in forwarders {
        let _ = forwarder.await;
    }
    ticker_stop.cancel();
    let _ = ticker.await;

    if timed_out {
        let _ = writer.write("error: deadline exceeded").await;
        return ScriptOutcome::TimedOut;
    }
    if cancelled {
        let _ = writer.write("error: script canceled").await;
        return ScriptOutcome::Cancelled;
    }
    match exit {
        Some(status) if status.success() => ScriptOutcome::Completed,
        Some(status) => ScriptOutcome::Failed(status.code()),
        None => ScriptOutcome::Failed(None),
    }
}

async fn forward_lines(stream: impl tokio::io::AsyncRead + Unpin, writer: Arc<ReportWriter>) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        // Report errors are sticky; keep draining so the child never blocks
        // on a full pipe.
        let _ = writer.write(&line).await;
    }
}
