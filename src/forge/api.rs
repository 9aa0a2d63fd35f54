//! The typed forge REST operations.

use serde::Deserialize;

use crate::repo::commit::CommitStatus;
use crate::repo::tree::TreeEntry;

use super::error::ForgeError;
use super::gist::Paste;

/// Default forge API base.
pub const DEFAULT_BASE_URL: &str = "https://api.github.com";

/// Tree wire shape: `GET /repos/{owner}/{repo}/git/trees/{sha}`.
#[derive(Debug, Clone, Deserialize)]
pub struct TreeData {
    pub sha: String,
    #[serde(default, rename = "tree")]
    pub entries: Vec<TreeEntry>,
}

/// Blob wire shape: `GET /repos/{owner}/{repo}/git/blobs/{sha}`.
#[derive(Debug, Clone, Deserialize)]
pub struct BlobData {
    pub sha: String,
    pub encoding: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct PasteCreated {
    #[serde(default)]
    id: String,
}

/// The forge client. Stateless per call beyond its token; cheap to share.
pub struct ForgeApi {
    http: reqwest::Client,
    base_url: String,
    user: String,
    oauth: String,
}

impl ForgeApi {
    /// Creates a client against a base URL. The user login is only used to
    /// construct published paste URLs.
    pub fn new(base_url: impl Into<String>, user: impl Into<String>, oauth: impl Into<String>) -> Self {
        ForgeApi {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user: user.into(),
            oauth: oauth.into(),
        }
    }

    /// Verifies the OAuth token with a ping against the API base.
    ///
    /// Anything but 200 is an authentication failure, which is fatal at
    /// startup.
    pub async fn authenticate(&self) -> Result<(), ForgeError> {
        let res = self.get(&self.base_url).await?;
        if res.status().as_u16() != 200 {
            return Err(ForgeError::unexpected("authenticate", 200, res.status()));
        }
        Ok(())
    }

    /// Fetches one tree level.
    pub async fn get_tree(&self, owner: &str, repo: &str, sha: &str) -> Result<TreeData, ForgeError> {
        let url = self.url(&["repos", owner, repo, "git", "trees", sha]);
        let res = self.get(&url).await?;
        if res.status().as_u16() != 200 {
            return Err(ForgeError::unexpected("get_tree", 200, res.status()));
        }
        res.json().await.map_err(|e| ForgeError::Decode {
            operation: "get_tree",
            message: e.to_string(),
        })
    }

    /// Fetches one blob.
    pub async fn get_blob(&self, owner: &str, repo: &str, sha: &str) -> Result<BlobData, ForgeError> {
        let url = self.url(&["repos", owner, repo, "git", "blobs", sha]);
        let res = self.get(&url).await?;
        if res.status().as_u16() != 200 {
            return Err(ForgeError::unexpected("get_blob", 200, res.status()));
        }
        res.json().await.map_err(|e| ForgeError::Decode {
            operation: "get_blob",
            message: e.to_string(),
        })
    }

    /// Posts a commit status. The forge answers 201 on success.
    pub async fn post_status(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
        status: &CommitStatus,
    ) -> Result<(), ForgeError> {
        let url = self.url(&["repos", owner, repo, "statuses", sha]);
        let res = self
            .http
            .post(&url)
            .header("Authorization", self.auth_header())
            .json(status)
            .send()
            .await?;
        if res.status().as_u16() != 201 {
            return Err(ForgeError::unexpected("post_status", 201, res.status()));
        }
        Ok(())
    }

    /// Creates a paste document. Returns the paste id.
    pub async fn create_paste(&self, paste: &Paste) -> Result<String, ForgeError> {
        let url = self.url(&["gists"]);
        let res = self
            .http
            .post(&url)
            .header("Authorization", self.auth_header())
            .json(paste)
            .send()
            .await?;
        if res.status().as_u16() != 201 {
            return Err(ForgeError::unexpected("create_paste", 201, res.status()));
        }
        let created: PasteCreated = res.json().await.map_err(|e| ForgeError::Decode {
            operation: "create_paste",
            message: e.to_string(),
        })?;
        if created.id.is_empty() {
            return Err(ForgeError::MissingPasteId);
        }
        Ok(created.id)
    }

    /// Updates an existing paste document.
    pub async fn update_paste(&self, id: &str, paste: &Paste) -> Result<(), ForgeError> {
        let url = self.url(&["gists", id]);
        let res = self
            .http
            .patch(&url)
            .header("Authorization", self.auth_header())
            .json(paste)
            .send()
            .await?;
        if res.status().as_u16() != 200 {
            return Err(ForgeError::unexpected("update_paste", 200, res.status()));
        }
        Ok(())
    }

    /// Fetches an arbitrary URL with the usual authentication, returning the
    /// body bytes. Used to resolve pull-request heads from comment events.
    pub async fn get_url(&self, url: &str) -> Result<Vec<u8>, ForgeError> {
        let res = self.get(url).await?;
        if !res.status().is_success() {
            return Err(ForgeError::unexpected("get_url", 200, res.status()));
        }
        Ok(res.bytes().await?.to_vec())
    }

    /// The user-visible URL of a published paste.
    pub fn paste_url(&self, id: &str) -> String {
        format!("https://gist.github.com/{}/{}", self.user, id)
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, ForgeError> {
        Ok(self
            .http
            .get(url)
            .header("Authorization", self.auth_header())
            .send()
            .await?)
    }

    fn auth_header(&self) -> String {
        format!("token {}", self.oauth)
    }

    fn url(&self, items: &[&str]) -> String {
        let mut url = self.base_url.clone();
        for item in items {
            url.push('/');
            url.push_str(item);
        }
        url
    }
}

impl std::fmt::Debug for ForgeApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The oauth token stays out of logs.
        f.debug_struct("ForgeApi")
            .field("base_url", &self.base_url)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::commit::{StatusState, CommitStatus};
    use crate::test_utils::MockForge;

    #[test]
    fn builds_urls_from_segments() {
        let api = ForgeApi::new("https://forge.example/", "me", "tok");
        assert_eq!(
            api.url(&["repos", "owner", "repo", "git", "trees", "abc"]),
            "https://forge.example/repos/owner/repo/git/trees/abc"
        );
        assert_eq!(api.url(&["gists"]), "https://forge.example/gists");
    }

    #[test]
    fn paste_url_uses_configured_user() {
        let api = ForgeApi::new(DEFAULT_BASE_URL, "octocat", "tok");
        assert_eq!(api.paste_url("abc123"), "https://gist.github.com/octocat/abc123");
    }

    #[tokio::test]
    async fn authenticate_accepts_200_only() {
        let mock = MockForge::spawn().await;
        let api = ForgeApi::new(mock.base_url(), "me", "tok");
        api.authenticate().await.unwrap();

        let bad = ForgeApi::new(format!("{}/missing", mock.base_url()), "me", "tok");
        let err = bad.authenticate().await.unwrap_err();
        assert!(matches!(err, ForgeError::UnexpectedStatus { .. }));
    }

    #[tokio::test]
    async fn get_tree_decodes_response() {
        let mock = MockForge::spawn().await;
        mock.put_tree(
            "t0",
            serde_json::json!({
                "sha": "t0",
                "tree": [{"path": "ci.yml", "type": "blob", "sha": "b0"}]
            }),
        );

        let api = ForgeApi::new(mock.base_url(), "me", "tok");
        let tree = api.get_tree("owner", "repo", "t0").await.unwrap();
        assert_eq!(tree.sha, "t0");
        assert_eq!(tree.entries.len(), 1);

        let err = api.get_tree("owner", "repo", "unknown").await.unwrap_err();
        assert!(matches!(err, ForgeError::UnexpectedStatus { received: 404, .. }));
    }

    #[tokio::test]
    async fn post_status_requires_201() {
        let mock = MockForge::spawn().await;
        let api = ForgeApi::new(mock.base_url(), "me", "tok");

        let status = CommitStatus::new(StatusState::Pending, "running main script");
        api.post_status("owner", "repo", "abc", &status).await.unwrap();

        let posted = mock.statuses("abc");
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0]["state"], "pending");
        assert_eq!(posted[0]["context"], "ci-server");
    }

    #[tokio::test]
    async fn paste_round_trip() {
        let mock = MockForge::spawn().await;
        let api = ForgeApi::new(mock.base_url(), "me", "tok");

        let mut paste = Paste::new("CI Results for repository 'r' commit 'c'");
        paste.set_file("r_c.md", "pending...");
        let id = api.create_paste(&paste).await.unwrap();
        assert!(!id.is_empty());

        paste.set_file("r_c.md", "## Main Script\n");
        api.update_paste(&id, &paste).await.unwrap();
        assert!(mock.paste_content(&id).contains("Main Script"));

        let err = api.update_paste("no-such-id", &paste).await.unwrap_err();
        assert!(matches!(err, ForgeError::UnexpectedStatus { .. }));
    }

    #[tokio::test]
    async fn get_url_returns_body_bytes() {
        let mock = MockForge::spawn().await;
        mock.put_pull_request("42", "featurehead", "feature");

        let api = ForgeApi::new(mock.base_url(), "me", "tok");
        let body = api
            .get_url(&format!("{}/pulls/42", mock.base_url()))
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["head"]["sha"], "featurehead");
    }
}
