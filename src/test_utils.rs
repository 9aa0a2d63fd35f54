//! Shared test fixtures.
//!
//! `MockForge` is a small in-process forge: an axum server on an ephemeral
//! port implementing the handful of endpoints the client consumes, recording
//! what it is sent so tests can assert on posted statuses and paste content.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use base64::Engine;
use serde_json::{Value, json};

#[derive(Default)]
struct MockState {
    trees: HashMap<String, Value>,
    blobs: HashMap<String, Value>,
    pulls: HashMap<String, Value>,
    statuses: HashMap<String, Vec<Value>>,
    pastes: HashMap<String, Value>,
    next_paste: usize,
}

type Shared = Arc<Mutex<MockState>>;

/// An in-process forge for tests.
pub struct MockForge {
    base_url: String,
    state: Shared,
}

impl MockForge {
    /// Binds an ephemeral port and serves the mock routes on it.
    pub async fn spawn() -> Self {
        let state: Shared = Arc::new(Mutex::new(MockState::default()));

        let router = Router::new()
            .route("/", get(|| async { "ok" }))
            .route("/repos/{owner}/{repo}/git/trees/{sha}", get(get_tree))
            .route("/repos/{owner}/{repo}/git/blobs/{sha}", get(get_blob))
            .route("/repos/{owner}/{repo}/statuses/{sha}", post(post_status))
            .route("/gists", post(create_paste))
            .route("/gists/{id}", patch(update_paste))
            .route("/pulls/{number}", get(get_pull))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock forge");
        let addr = listener.local_addr().expect("mock forge addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        MockForge {
            base_url: format!("http://{addr}"),
            state,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Serves raw tree JSON under the given sha.
    pub fn put_tree(&self, sha: &str, body: Value) {
        self.state.lock().unwrap().trees.insert(sha.to_string(), body);
    }

    /// Serves a blob with plain-text content (base64-encoded on the wire).
    pub fn put_blob(&self, sha: &str, content: &str) {
        let encoded = base64::engine::general_purpose::STANDARD.encode(content);
        self.state.lock().unwrap().blobs.insert(
            sha.to_string(),
            json!({"sha": sha, "encoding": "base64", "content": encoded}),
        );
    }

    /// Serves a pull request under `/pulls/{number}`.
    pub fn put_pull_request(&self, number: &str, head_sha: &str, head_ref: &str) {
        self.state.lock().unwrap().pulls.insert(
            number.to_string(),
            json!({"head": {"sha": head_sha, "ref": head_ref}}),
        );
    }

    /// URL of a stored pull request, as it would appear in a comment payload.
    pub fn pull_request_url(&self, number: &str) -> String {
        format!("{}/pulls/{number}", self.base_url)
    }

    /// Statuses posted for a commit, oldest first.
    pub fn statuses(&self, sha: &str) -> Vec<Value> {
        self.state
            .lock()
            .unwrap()
            .statuses
            .get(sha)
            .cloned()
            .unwrap_or_default()
    }

    /// Content of the single file of a paste.
    pub fn paste_content(&self, id: &str) -> String {
        let state = self.state.lock().unwrap();
        let Some(paste) = state.pastes.get(id) else {
            return String::new();
        };
        paste["files"]
            .as_object()
            .and_then(|files| files.values().next())
            .and_then(|file| file["content"].as_str())
            .unwrap_or_default()
            .to_string()
    }

    /// Ids of all pastes created so far.
    pub fn paste_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().pastes.keys().cloned().collect()
    }

    /// Seeds a one-blob repository tree: `{sha}` containing only `ci.yml`.
    pub fn seed_repo_tree(&self, sha: &str, ci_yml: &str) {
        self.put_tree(
            sha,
            json!({
                "sha": sha,
                "tree": [{"path": "ci.yml", "type": "blob", "sha": format!("{sha}-ci")}]
            }),
        );
        self.put_blob(&format!("{sha}-ci"), ci_yml);
    }
}

async fn get_tree(
    State(state): State<Shared>,
    Path((_owner, _repo, sha)): Path<(String, String, String)>,
) -> Response {
    match state.lock().unwrap().trees.get(&sha) {
        Some(body) => axum::Json(body.clone()).into_response(),
        None => (StatusCode::NOT_FOUND, "tree not found").into_response(),
    }
}

async fn get_blob(
    State(state): State<Shared>,
    Path((_owner, _repo, sha)): Path<(String, String, String)>,
) -> Response {
    match state.lock().unwrap().blobs.get(&sha) {
        Some(body) => axum::Json(body.clone()).into_response(),
        None => (StatusCode::NOT_FOUND, "blob not found").into_response(),
    }
}

async fn post_status(
    State(state): State<Shared>,
    Path((_owner, _repo, sha)): Path<(String, String, String)>,
    axum::Json(body): axum::Json<Value>,
) -> Response {
    state
        .lock()
        .unwrap()
        .statuses
        .entry(sha)
        .or_default()
        .push(body);
    (StatusCode::CREATED, "{}").into_response()
}

async fn create_paste(State(state): State<Shared>, axum::Json(body): axum::Json<Value>) -> Response {
    let mut state = state.lock().unwrap();
    state.next_paste += 1;
    let id = format!("paste-{}", state.next_paste);
    state.pastes.insert(id.clone(), body);
    (StatusCode::CREATED, axum::Json(json!({"id": id}))).into_response()
}

async fn update_paste(
    State(state): State<Shared>,
    Path(id): Path<String>,
    axum::Json(body): axum::Json<Value>,
) -> Response {
    let mut state = state.lock().unwrap();
    match state.pastes.get_mut(&id) {
        Some(existing) => {
            *existing = body;
            (StatusCode::OK, axum::Json(json!({"id": id}))).into_response()
        }
        None => (StatusCode::NOT_FOUND, "paste not found").into_response(),
    }
}

async fn get_pull(State(state): State<Shared>, Path(number): Path<String>) -> Response {
    match state.lock().unwrap().pulls.get(&number) {
        Some(body) => axum::Json(body.clone()).into_response(),
        None => (StatusCode::NOT_FOUND, "pull request not found").into_response(),
    }
}
