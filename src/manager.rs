//! The job manager: bounded parallelism with per-reference preemption.
//!
//! Jobs flow intake → queue → worker. The intake loop forwards arrivals and
//! cancels any live job for the same `(repo, ref)` key; the dispatch loop
//! dequeues, derives a per-job cancellation scope from the manager scope,
//! records a [`JobContext`] keyed by `(repo, ref)`, and hands the job to the
//! fixed worker pool. At most `num_workers` jobs run simultaneously and at
//! most one `JobContext` exists per key at any instant.
//!
//! Cancellation is cooperative: a preempted job observes its scope and winds
//! down; its after-script still runs because that stage derives from the
//! process root scope, not the job scope.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::job::{Job, JobScope, JobState};

/// Buffered queue between intake and dispatch.
const QUEUE_CAPACITY: usize = 100;

/// Default hard deadline for one job.
pub const DEFAULT_JOB_TIME: Duration = Duration::from_secs(300);

/// Manager tuning.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Size of the worker pool.
    pub num_workers: usize,

    /// Hard deadline for one job, preemption aside.
    pub job_time: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            num_workers: 4,
            job_time: DEFAULT_JOB_TIME,
        }
    }
}

/// The deduplication key: one live job per reference per repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub repo: String,
    pub ref_name: String,
}

impl JobKey {
    fn of(job: &dyn Job) -> Self {
        JobKey {
            repo: job.repo_name().to_string(),
            ref_name: job.ref_name().to_string(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.repo, self.ref_name)
    }
}

/// A live job's cancel handle.
///
/// The generation lets a finishing job remove its own entry without evicting
/// a successor that has already replaced it.
struct JobContext {
    cancel: CancellationToken,
    generation: u64,
}

struct WorkItem {
    job: Box<dyn Job>,
    key: JobKey,
    cancel: CancellationToken,
    generation: u64,
}

/// Runs jobs with bounded parallelism, per-reference deduplication and
/// deadlines.
pub struct JobManager {
    config: ManagerConfig,
    running: DashMap<JobKey, JobContext>,
    generation: AtomicU64,

    /// Root for after-script scopes. Deliberately not tied to the shutdown
    /// scope: cleanup runs even while the process drains, bounded by its own
    /// timeout.
    root: CancellationToken,
}

impl JobManager {
    pub fn new(config: ManagerConfig) -> Arc<Self> {
        Arc::new(JobManager {
            config,
            running: DashMap::new(),
            generation: AtomicU64::new(0),
            root: CancellationToken::new(),
        })
    }

    /// Number of live job contexts.
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Main manager process. Returns after the scope is cancelled and all
    /// workers have drained.
    pub async fn run(
        self: Arc<Self>,
        scope: CancellationToken,
        mut intake: mpsc::Receiver<Box<dyn Job>>,
    ) {
        let (queue_tx, queue_rx) = mpsc::channel::<Box<dyn Job>>(QUEUE_CAPACITY);
        let (work_tx, work_rx) = mpsc::channel::<WorkItem>(1);
        let work_rx = Arc::new(Mutex::new(work_rx));

        let mut workers = Vec::new();
        for id in 0..self.config.num_workers {
            debug!(worker = id, "created worker");
            workers.push(tokio::spawn(Arc::clone(&self).worker(
                id,
                scope.clone(),
                Arc::clone(&work_rx),
            )));
        }

        let dispatcher =
            tokio::spawn(Arc::clone(&self).dispatch(scope.clone(), queue_rx, work_tx));

        loop {
            tokio::select! {
                _ = scope.cancelled() => break,
                job = intake.recv() => {
                    let Some(job) = job else { break };
                    let key = JobKey::of(job.as_ref());
                    // Preempt as early as possible so an in-flight run stops
                    // doing work that is about to be superseded.
                    if let Some(context) = self.running.get(&key) {
                        info!(key = %key, "conflicting job arrived, cancelling running job");
                        context.cancel.cancel();
                    }
                    tokio::select! {
                        _ = scope.cancelled() => break,
                        sent = queue_tx.send(job) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        drop(queue_tx);
        let _ = dispatcher.await;
        for worker in workers {
            let _ = worker.await;
        }
        info!("job manager exited");
    }

    async fn dispatch(
        self: Arc<Self>,
        scope: CancellationToken,
        mut queue_rx: mpsc::Receiver<Box<dyn Job>>,
        work_tx: mpsc::Sender<WorkItem>,
    ) {
        loop {
            let job = tokio::select! {
                _ = scope.cancelled() => break,
                job = queue_rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let key = JobKey::of(job.as_ref());
            // Re-check here as well: the intake-side cancel races with this
            // loop recording the context, and the two loops together must
            // guarantee a superseded job is cancelled before its successor
            // starts.
            if let Some(context) = self.running.get(&key) {
                context.cancel.cancel();
            }

            let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
            let cancel = scope.child_token();
            self.running.insert(
                key.clone(),
                JobContext {
                    cancel: cancel.clone(),
                    generation,
                },
            );

            let item = WorkItem {
                job,
                key,
                cancel,
                generation,
            };
            tokio::select! {
                _ = scope.cancelled() => break,
                sent = work_tx.send(item) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("job queue disposed");
    }

    async fn worker(
        self: Arc<Self>,
        id: usize,
        scope: CancellationToken,
        work_rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    ) {
        loop {
            let item = tokio::select! {
                _ = scope.cancelled() => {
                    debug!(worker = id, "worker exited");
                    return;
                }
                item = async { work_rx.lock().await.recv().await } => match item {
                    Some(item) => item,
                    None => return,
                },
            };
            info!(worker = id, key = %item.key, "worker running job");
            self.execute(item).await;
            info!(worker = id, "worker completed job");
        }
    }

    /// Runs one job under its deadline and records the terminal state.
    async fn execute(&self, item: WorkItem) {
        let state = item.job.state();
        state.set(JobState::Running);

        let job_scope = JobScope::new(item.cancel.clone(), self.root.clone());
        let run = item.job.run(job_scope);
        tokio::pin!(run);

        let final_state = tokio::select! {
            _ = &mut run => {
                if item.cancel.is_cancelled() {
                    JobState::Cancelled
                } else {
                    JobState::Complete
                }
            }
            _ = tokio::time::sleep(self.config.job_time) => {
                item.cancel.cancel();
                // Let the job observe the cancel and finish its cleanup
                // stage before the context is released.
                run.await;
                JobState::TimedOut
            }
        };
        // Only remove the entry this job created; a successor may already
        // hold the key. Removal happens before the terminal state becomes
        // visible so observers never see a finished job still in the map.
        self.running
            .remove_if(&item.key, |_, context| context.generation == item.generation);
        state.set(final_state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::StateCell;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Tracks how many jobs run at once, and the peak.
    #[derive(Default)]
    struct Concurrency {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Concurrency {
        fn enter(&self) {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }

        fn exit(&self) {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }

        fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    struct TestJob {
        repo: String,
        ref_name: String,
        state: StateCell,
        duration: Duration,
        concurrency: Option<Arc<Concurrency>>,
    }

    impl TestJob {
        fn new(repo: &str, ref_name: &str, duration: Duration) -> Self {
            TestJob {
                repo: repo.to_string(),
                ref_name: ref_name.to_string(),
                state: StateCell::new(),
                duration,
                concurrency: None,
            }
        }

        fn with_concurrency(mut self, concurrency: Arc<Concurrency>) -> Self {
            self.concurrency = Some(concurrency);
            self
        }
    }

    #[async_trait]
    impl Job for TestJob {
        fn repo_name(&self) -> &str {
            &self.repo
        }

        fn ref_name(&self) -> &str {
            &self.ref_name
        }

        fn state(&self) -> StateCell {
            self.state.clone()
        }

        async fn run(&self, scope: JobScope) {
            if let Some(c) = &self.concurrency {
                c.enter();
            }
            tokio::select! {
                _ = scope.cancel.cancelled() => {}
                _ = tokio::time::sleep(self.duration) => {}
            }
            if let Some(c) = &self.concurrency {
                c.exit();
            }
        }
    }

    async fn wait_for_state(cell: &StateCell, expected: JobState) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while cell.get() != expected {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {expected:?}, state is {:?}",
                cell.get()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn start_manager(
        config: ManagerConfig,
    ) -> (
        Arc<JobManager>,
        mpsc::Sender<Box<dyn Job>>,
        CancellationToken,
        tokio::task::JoinHandle<()>,
    ) {
        let manager = JobManager::new(config);
        let scope = CancellationToken::new();
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let handle = tokio::spawn(Arc::clone(&manager).run(scope.clone(), rx));
        (manager, tx, scope, handle)
    }

    #[tokio::test]
    async fn interfering_jobs_preempt_the_running_one() {
        let (manager, tx, scope, handle) = start_manager(ManagerConfig {
            num_workers: 1,
            job_time: Duration::from_secs(5),
        });

        let job_a = TestJob::new("example", "refs/heads/master", Duration::from_secs(3));
        let state_a = job_a.state();
        let job_b = TestJob::new("example", "refs/heads/master", Duration::from_millis(10));
        let state_b = job_b.state();

        tx.send(Box::new(job_a)).await.unwrap();
        tx.send(Box::new(job_b)).await.unwrap();

        wait_for_state(&state_a, JobState::Cancelled).await;
        wait_for_state(&state_b, JobState::Complete).await;
        assert_eq!(manager.running_count(), 0);

        scope.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn more_jobs_than_workers_all_complete() {
        let (_manager, tx, scope, handle) = start_manager(ManagerConfig {
            num_workers: 2,
            job_time: Duration::from_secs(5),
        });

        let jobs: Vec<TestJob> = ["master", "bee", "cee"]
            .iter()
            .map(|r| {
                TestJob::new(
                    "example",
                    &format!("refs/heads/{r}"),
                    Duration::from_millis(10),
                )
            })
            .collect();
        let states: Vec<StateCell> = jobs.iter().map(|j| j.state()).collect();

        for job in jobs {
            tx.send(Box::new(job)).await.unwrap();
        }
        for state in &states {
            wait_for_state(state, JobState::Complete).await;
        }

        scope.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn worker_pool_bounds_parallelism() {
        let (_manager, tx, scope, handle) = start_manager(ManagerConfig {
            num_workers: 1,
            job_time: Duration::from_secs(5),
        });

        let concurrency = Arc::new(Concurrency::default());
        let jobs: Vec<TestJob> = (0..3)
            .map(|i| {
                TestJob::new(
                    "example",
                    &format!("refs/heads/branch-{i}"),
                    Duration::from_millis(50),
                )
                .with_concurrency(Arc::clone(&concurrency))
            })
            .collect();
        let states: Vec<StateCell> = jobs.iter().map(|j| j.state()).collect();

        for job in jobs {
            tx.send(Box::new(job)).await.unwrap();
        }
        for state in &states {
            wait_for_state(state, JobState::Complete).await;
        }
        assert_eq!(concurrency.peak(), 1);

        scope.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn deadline_marks_job_timed_out() {
        let (manager, tx, scope, handle) = start_manager(ManagerConfig {
            num_workers: 1,
            job_time: Duration::from_millis(50),
        });

        let job = TestJob::new("example", "refs/heads/master", Duration::from_secs(10));
        let state = job.state();
        tx.send(Box::new(job)).await.unwrap();

        wait_for_state(&state, JobState::TimedOut).await;
        assert_eq!(manager.running_count(), 0);

        scope.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_drains_and_exits() {
        let (_manager, tx, scope, handle) = start_manager(ManagerConfig {
            num_workers: 2,
            job_time: Duration::from_secs(5),
        });

        let job = TestJob::new("example", "refs/heads/master", Duration::from_secs(10));
        let state = job.state();
        tx.send(Box::new(job)).await.unwrap();
        wait_for_state(&state, JobState::Running).await;

        scope.cancel();
        // The running job observes its scope (a child of the manager scope)
        // and drains; the manager then exits.
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("manager failed to drain")
            .unwrap();
        assert_eq!(state.get(), JobState::Cancelled);
    }
}
