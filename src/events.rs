//! Webhook event decoding.
//!
//! Turns raw payload bytes plus the forge's event-type label into a typed
//! [`Event`], updating repository state and the object cache along the way.
//! Only `push` and `issue_comment` are recognised; anything else is an
//! unknown-event error and the delivery is dropped by the caller.

use serde::Deserialize;
use thiserror::Error;

use crate::forge::{ForgeApi, ForgeError};
use crate::repo::commit::{Author, Commit};
use crate::repo::{ObjectCache, Reference, RepoSummary, Repositories};

/// Errors raised while decoding a webhook delivery.
#[derive(Debug, Error)]
pub enum EventError {
    /// The event-type label is not one this server handles.
    #[error("received unknown event type {0:?}")]
    UnknownEvent(String),

    /// The payload is not valid JSON of the expected shape.
    #[error("failed parsing event payload: {0}")]
    Json(#[from] serde_json::Error),

    /// A field the event cannot be handled without is absent.
    #[error("event payload missing required field {0}")]
    MissingField(&'static str),

    /// A comment arrived for a repository this server has never seen push
    /// events for.
    #[error("comment event for unregistered repository {0:?}")]
    UnknownRepository(String),

    /// Resolving the pull-request head failed.
    #[error(transparent)]
    Forge(#[from] ForgeError),
}

/// A decoded webhook event.
#[derive(Debug, Clone)]
pub enum Event {
    Push(PushEvent),
    Comment(CommentEvent),
}

impl Event {
    pub fn repo_name(&self) -> &str {
        match self {
            Event::Push(e) => &e.repo.name,
            Event::Comment(e) => &e.repo.name,
        }
    }

    pub fn ref_name(&self) -> &str {
        match self {
            Event::Push(e) => &e.ref_name,
            Event::Comment(e) => &e.ref_name,
        }
    }
}

/// A push delivery: new commits on a reference.
#[derive(Debug, Clone)]
pub struct PushEvent {
    pub repo: RepoSummary,
    pub ref_name: String,
    /// Snapshot of the reference after registration.
    pub reference: Reference,
    pub sender: String,
}

/// A pull-request comment delivery, resolved to the PR's head commit.
#[derive(Debug, Clone)]
pub struct CommentEvent {
    pub repo: RepoSummary,
    pub ref_name: String,
    pub reference: Reference,
    /// The PR head commit the job will run against.
    pub sha: String,
    pub body: String,
    pub user: String,
    pub action: String,
}

// ─── Wire shapes ───

#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    ref_name: String,
    #[serde(default)]
    commits: Vec<WireCommit>,
    head_commit: Option<WireCommit>,
    repository: WireRepo,
    sender: Option<WireUser>,
}

#[derive(Debug, Deserialize)]
struct WireCommit {
    /// Push payloads carry the hash under `id`; some forges use `sha`.
    #[serde(alias = "sha")]
    id: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    author: WireAuthor,
}

#[derive(Debug, Default, Deserialize)]
struct WireAuthor {
    #[serde(default)]
    name: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    username: String,
}

#[derive(Debug, Deserialize)]
struct WireRepo {
    name: String,
    #[serde(default)]
    fork: bool,
    owner: WireOwner,
}

#[derive(Debug, Deserialize)]
struct WireOwner {
    login: String,
}

#[derive(Debug, Deserialize)]
struct WireUser {
    login: String,
}

#[derive(Debug, Default, Deserialize)]
struct CommentPayload {
    action: Option<String>,
    issue: Option<WireIssue>,
    comment: Option<WireComment>,
    repository: Option<WireRepo>,
}

#[derive(Debug, Default, Deserialize)]
struct WireIssue {
    pull_request: Option<WirePullLink>,
}

#[derive(Debug, Default, Deserialize)]
struct WirePullLink {
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireComment {
    body: Option<String>,
    user: Option<WireUser>,
}

#[derive(Debug, Deserialize)]
struct PullData {
    head: PullHead,
}

#[derive(Debug, Deserialize)]
struct PullHead {
    sha: String,
    #[serde(rename = "ref")]
    ref_name: String,
}

/// Decodes a delivery into a typed event, registering commits as a side
/// effect.
pub async fn decode(
    label: &str,
    payload: &[u8],
    repos: &Repositories,
    cache: &ObjectCache,
    forge: &ForgeApi,
) -> Result<Event, EventError> {
    match label {
        "push" => decode_push(payload, repos, cache),
        "issue_comment" => decode_comment(payload, repos, cache, forge).await,
        other => Err(EventError::UnknownEvent(other.to_string())),
    }
}

fn decode_push(
    payload: &[u8],
    repos: &Repositories,
    cache: &ObjectCache,
) -> Result<Event, EventError> {
    let push: PushPayload = serde_json::from_slice(payload)?;

    let repo = RepoSummary {
        name: push.repository.name,
        owner: push.repository.owner.login,
        fork: push.repository.fork,
    };
    let ref_name = canonical_ref(&push.ref_name);

    // Pushes to a fresh branch arrive with an empty commit list and the head
    // under `head_commit`.
    let wire_commits = if push.commits.is_empty() {
        vec![push.head_commit.ok_or(EventError::MissingField("commits"))?]
    } else {
        push.commits
    };

    // Received order: element i is the child of element i + 1.
    let chain: Vec<Commit> = wire_commits
        .into_iter()
        .map(|c| Commit {
            sha: c.id,
            message: c.message,
            author: Author {
                name: c.author.name,
                email: c.author.email,
                login: c.author.username,
            },
            parent: None,
            child: None,
            status: Default::default(),
        })
        .collect();

    let reference = repos
        .register_commits(cache, &repo, &ref_name, chain)
        .ok_or(EventError::MissingField("commits"))?;

    Ok(Event::Push(PushEvent {
        repo,
        ref_name,
        reference,
        sender: push.sender.map(|s| s.login).unwrap_or_default(),
    }))
}

async fn decode_comment(
    payload: &[u8],
    repos: &Repositories,
    cache: &ObjectCache,
    forge: &ForgeApi,
) -> Result<Event, EventError> {
    let comment: CommentPayload = serde_json::from_slice(payload)?;

    let action = comment.action.ok_or(EventError::MissingField("action"))?;
    let pr_url = comment
        .issue
        .and_then(|i| i.pull_request)
        .and_then(|p| p.url)
        .ok_or(EventError::MissingField("issue.pull_request.url"))?;
    let wire_comment = comment.comment.ok_or(EventError::MissingField("comment"))?;
    let body = wire_comment
        .body
        .ok_or(EventError::MissingField("comment.body"))?;
    let user = wire_comment
        .user
        .map(|u| u.login)
        .ok_or(EventError::MissingField("comment.user.login"))?;
    let repository = comment
        .repository
        .ok_or(EventError::MissingField("repository.name"))?;

    let repo = RepoSummary {
        name: repository.name,
        owner: repository.owner.login,
        fork: repository.fork,
    };
    if !repos.contains(&repo.name) {
        return Err(EventError::UnknownRepository(repo.name));
    }

    // Resolve the PR head from the linked pull-request document.
    let pull_bytes = forge.get_url(&pr_url).await?;
    let pull: PullData = serde_json::from_slice(&pull_bytes)?;
    let ref_name = format!("refs/heads/{}", pull.head.ref_name.trim_matches('"'));

    // A PR branch never pushed while this server was up has no reference
    // yet; seed one at the PR head so the job has a commit to run against.
    let reference = match repos.reference(&repo.name, &ref_name) {
        Some(reference) => reference,
        None => repos
            .register_commits(cache, &repo, &ref_name, vec![Commit::new(&pull.head.sha)])
            .ok_or(EventError::MissingField("head.sha"))?,
    };

    Ok(Event::Comment(CommentEvent {
        repo,
        ref_name,
        reference,
        sha: pull.head.sha,
        body,
        user,
        action,
    }))
}

/// Canonical reference names carry no surrounding quotes.
fn canonical_ref(raw: &str) -> String {
    raw.trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockForge;
    use serde_json::json;
    use std::sync::Arc;

    fn push_payload() -> serde_json::Value {
        json!({
            "ref": "refs/heads/master",
            "commits": [
                {
                    "id": "new-1",
                    "message": "newer",
                    "author": {"name": "my-name", "email": "me@example.com", "username": "Codertocat"}
                },
                {
                    "id": "new-0",
                    "message": "older",
                    "author": {"name": "my-name", "email": "me@example.com", "username": "Codertocat"}
                }
            ],
            "repository": {
                "name": "example-repo",
                "fork": false,
                "owner": {"login": "Codertocat"}
            },
            "sender": {"login": "Codertocat"}
        })
    }

    fn decode_push_sync(payload: &serde_json::Value, repos: &Repositories, cache: &ObjectCache) -> Event {
        decode_push(&serde_json::to_vec(payload).unwrap(), repos, cache).unwrap()
    }

    #[tokio::test]
    async fn unknown_label_is_rejected() {
        let repos = Repositories::new();
        let cache = ObjectCache::new();
        let forge = ForgeApi::new("http://unused.invalid", "me", "tok");

        let err = decode("deployment", b"{}", &repos, &cache, &forge)
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::UnknownEvent(_)));
    }

    #[test]
    fn push_registers_repository_and_chain() {
        let repos = Repositories::new();
        let cache = ObjectCache::new();

        let event = decode_push_sync(&push_payload(), &repos, &cache);
        let Event::Push(push) = event else {
            panic!("expected push event");
        };

        assert_eq!(push.repo.name, "example-repo");
        assert_eq!(push.repo.owner, "Codertocat");
        assert_eq!(push.ref_name, "refs/heads/master");
        assert_eq!(push.sender, "Codertocat");
        assert_eq!(push.reference.ancestry(&cache), vec!["new-1", "new-0"]);

        let head = cache.get_commit("new-1").unwrap();
        assert_eq!(head.message, "newer");
        assert_eq!(head.author.login, "Codertocat");
        assert_eq!(head.parent.as_deref(), Some("new-0"));
    }

    #[test]
    fn push_is_idempotent_across_redelivery() {
        let repos = Repositories::new();
        let cache = ObjectCache::new();

        decode_push_sync(&push_payload(), &repos, &cache);
        let event = decode_push_sync(&push_payload(), &repos, &cache);

        let Event::Push(push) = event else {
            panic!("expected push event");
        };
        assert_eq!(push.reference.ancestry(&cache), vec!["new-1", "new-0"]);
    }

    #[test]
    fn push_with_empty_commits_uses_head_commit() {
        let repos = Repositories::new();
        let cache = ObjectCache::new();

        let mut payload = push_payload();
        payload["commits"] = json!([]);
        payload["head_commit"] = json!({"sha": "h", "message": "fresh branch"});

        let event = decode_push_sync(&payload, &repos, &cache);
        let Event::Push(push) = event else {
            panic!("expected push event");
        };
        assert_eq!(push.reference.head.as_deref(), Some("h"));
        assert_eq!(push.reference.ancestry(&cache), vec!["h"]);
    }

    #[test]
    fn push_without_commits_or_head_fails() {
        let repos = Repositories::new();
        let cache = ObjectCache::new();

        let mut payload = push_payload();
        payload["commits"] = json!([]);

        let err = decode_push(&serde_json::to_vec(&payload).unwrap(), &repos, &cache).unwrap_err();
        assert!(matches!(err, EventError::MissingField("commits")));
    }

    #[test]
    fn quoted_ref_names_are_canonicalised() {
        let repos = Repositories::new();
        let cache = ObjectCache::new();

        let mut payload = push_payload();
        payload["ref"] = json!("\"refs/heads/master\"");

        let event = decode_push_sync(&payload, &repos, &cache);
        assert_eq!(event.ref_name(), "refs/heads/master");
        assert!(repos.reference("example-repo", "refs/heads/master").is_some());
    }

    fn comment_payload(pr_url: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "action": "created",
            "issue": {"pull_request": {"url": pr_url}},
            "comment": {"body": "/runtest\n", "user": {"login": "testuser"}},
            "repository": {"name": "example-repo", "owner": {"login": "Codertocat"}}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn comment_resolves_pull_request_head() {
        let mock = MockForge::spawn().await;
        mock.put_pull_request("7", "headsha", "changes");
        let forge = Arc::new(ForgeApi::new(mock.base_url(), "me", "tok"));

        let repos = Repositories::new();
        let cache = ObjectCache::new();
        decode_push_sync(&push_payload(), &repos, &cache);

        let event = decode(
            "issue_comment",
            &comment_payload(&mock.pull_request_url("7")),
            &repos,
            &cache,
            &forge,
        )
        .await
        .unwrap();

        let Event::Comment(comment) = event else {
            panic!("expected comment event");
        };
        assert_eq!(comment.action, "created");
        assert_eq!(comment.user, "testuser");
        assert_eq!(comment.body, "/runtest\n");
        assert_eq!(comment.sha, "headsha");
        assert_eq!(comment.ref_name, "refs/heads/changes");
        // An unseen PR branch is seeded with the head commit.
        assert_eq!(comment.reference.head.as_deref(), Some("headsha"));
    }

    #[tokio::test]
    async fn comment_for_unknown_repository_fails() {
        let mock = MockForge::spawn().await;
        mock.put_pull_request("7", "headsha", "changes");
        let forge = ForgeApi::new(mock.base_url(), "me", "tok");

        let repos = Repositories::new();
        let cache = ObjectCache::new();

        let err = decode(
            "issue_comment",
            &comment_payload(&mock.pull_request_url("7")),
            &repos,
            &cache,
            &forge,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EventError::UnknownRepository(_)));
    }

    #[tokio::test]
    async fn comment_without_pull_request_link_fails() {
        let forge = ForgeApi::new("http://unused.invalid", "me", "tok");
        let repos = Repositories::new();
        let cache = ObjectCache::new();

        let payload = serde_json::to_vec(&json!({
            "action": "created",
            "issue": {},
            "comment": {"body": "hi", "user": {"login": "u"}},
            "repository": {"name": "r", "owner": {"login": "o"}}
        }))
        .unwrap();

        let err = decode("issue_comment", &payload, &repos, &cache, &forge)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EventError::MissingField("issue.pull_request.url")
        ));
    }
}
