//! HTTP listener surface.
//!
//! Two routes: `POST /webhook` accepts forge deliveries (event type in the
//! `X-Github-Event` header, raw JSON body) and `GET /` answers a liveness
//! string. The webhook route always returns 200: decode failures are logged
//! and the delivery is dropped, since the forge retries nothing useful on
//! error responses.

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::events;
use crate::job::{self, Job, JobDeps};
use crate::repo::Repositories;

/// Header carrying the event-type label.
const HEADER_EVENT: &str = "x-github-event";

/// Shared application state, passed to handlers via axum's `State`.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    repos: Arc<Repositories>,
    deps: JobDeps,
    jobs: mpsc::Sender<Box<dyn Job>>,
}

impl AppState {
    pub fn new(repos: Arc<Repositories>, deps: JobDeps, jobs: mpsc::Sender<Box<dyn Job>>) -> Self {
        AppState {
            inner: Arc::new(AppStateInner { repos, deps, jobs }),
        }
    }
}

/// Builds the axum router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/webhook", post(webhook_handler))
        .route("/", get(liveness_handler))
        .with_state(state)
}

/// Liveness probe.
pub async fn liveness_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ci-server alive")
}

/// Webhook intake.
///
/// Decodes the delivery, builds a job and hands it to the manager. Returns
/// 200 regardless of handling outcome; failures are logged.
pub async fn webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let Some(label) = headers.get(HEADER_EVENT).and_then(|v| v.to_str().ok()) else {
        warn!("webhook delivery without {HEADER_EVENT} header");
        return StatusCode::OK;
    };
    debug!(label = %label, bytes = body.len(), "received webhook");

    let inner = &state.inner;
    let event = match events::decode(
        label,
        &body,
        &inner.repos,
        &inner.deps.cache,
        &inner.deps.forge,
    )
    .await
    {
        Ok(event) => event,
        Err(err) => {
            warn!(label = %label, error = %err, "failed decoding webhook event");
            return StatusCode::OK;
        }
    };

    info!(
        repo = %event.repo_name(),
        ref_name = %event.ref_name(),
        "decoded webhook event"
    );
    let job = job::factory(event, inner.deps.clone());
    if inner.jobs.send(job).await.is_err() {
        warn!("job manager is not accepting jobs, dropping event");
    }

    StatusCode::OK
}
