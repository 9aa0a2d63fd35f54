//! Commit and commit-status types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The status context this server reports under.
pub const STATUS_CONTEXT: &str = "ci-server";

/// Commit status states recognised by the forge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusState {
    Error,
    Failure,
    Pending,
    Success,
    None,
}

impl fmt::Display for StatusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusState::Error => "error",
            StatusState::Failure => "failure",
            StatusState::Pending => "pending",
            StatusState::Success => "success",
            StatusState::None => "none",
        };
        write!(f, "{s}")
    }
}

/// A commit status as posted to the forge statuses endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStatus {
    pub state: StatusState,
    pub description: String,
    pub target_url: String,
    pub context: String,
}

impl CommitStatus {
    pub fn new(state: StatusState, description: impl Into<String>) -> Self {
        CommitStatus {
            state,
            description: description.into(),
            target_url: String::new(),
            context: STATUS_CONTEXT.to_string(),
        }
    }
}

impl Default for CommitStatus {
    fn default() -> Self {
        CommitStatus::new(StatusState::None, "")
    }
}

/// The author of a commit, as carried in push payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    pub email: String,
    pub login: String,
}

/// A commit known to the server.
///
/// Commits form a singly linked chain through `parent`/`child` hash links;
/// the links are resolved through the object cache rather than owned
/// pointers. After construction the only mutations are the status (updated
/// as jobs run) and the links (updated while a reference is being
/// registered, which is single-writer per reference).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub sha: String,
    pub message: String,
    pub author: Author,

    /// Hash of the next-older commit, if known.
    pub parent: Option<String>,

    /// Hash of the next-newer commit, if known.
    pub child: Option<String>,

    /// Last status this server assigned to the commit.
    pub status: CommitStatus,
}

impl Commit {
    pub fn new(sha: impl Into<String>) -> Self {
        Commit {
            sha: sha.into(),
            message: String::new(),
            author: Author::default(),
            parent: None,
            child: None,
            status: CommitStatus::default(),
        }
    }

    /// Replaces the status, keeping the fixed reporting context.
    pub fn set_status(
        &mut self,
        state: StatusState,
        description: impl Into<String>,
        target_url: impl Into<String>,
    ) {
        self.status = CommitStatus {
            state,
            description: description.into(),
            target_url: target_url.into(),
            context: STATUS_CONTEXT.to_string(),
        };
    }
}

impl fmt::Display for Commit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sha)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_state_serialises_lowercase() {
        assert_eq!(
            serde_json::to_string(&StatusState::Pending).unwrap(),
            "\"pending\""
        );
        assert_eq!(
            serde_json::to_string(&StatusState::Failure).unwrap(),
            "\"failure\""
        );
    }

    #[test]
    fn status_body_shape() {
        let mut commit = Commit::new("abc");
        commit.set_status(StatusState::Success, "main script successful", "http://x");
        let body = serde_json::to_value(&commit.status).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "state": "success",
                "description": "main script successful",
                "target_url": "http://x",
                "context": "ci-server",
            })
        );
    }

    #[test]
    fn set_status_keeps_context() {
        let mut commit = Commit::new("abc");
        commit.set_status(StatusState::Error, "boom", "");
        assert_eq!(commit.status.context, STATUS_CONTEXT);
    }
}
