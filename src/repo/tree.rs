//! Trees and blobs: the content-addressed snapshot of a repository.
//!
//! Trees are fetched on demand from the forge, consulting the object cache
//! at every node, and materialised into a workspace directory for script
//! execution. Nodes are cached once per hash and shared by all parents; the
//! graph is a DAG, so materialisation recurses without cycle tracking.

use std::io::Write;
use std::path::Path;

use base64::Engine;
use serde::Deserialize;
use thiserror::Error;

use crate::forge::{ForgeApi, ForgeError};

use super::cache::ObjectCache;
use super::state::RepoSummary;

/// Errors raised while fetching or materialising a tree.
#[derive(Debug, Error)]
pub enum TreeError {
    /// Forge call failed.
    #[error(transparent)]
    Forge(#[from] ForgeError),

    /// Workspace file-system operation failed.
    #[error("workspace io error: {0}")]
    Io(#[from] std::io::Error),

    /// A node referenced by a tree entry is not in the cache.
    #[error("object {sha} missing from cache")]
    MissingObject { sha: String },

    /// Blob content is not valid base64.
    #[error("failed decoding blob {sha} content: {source}")]
    Decode {
        sha: String,
        source: base64::DecodeError,
    },
}

/// The kind of a tree entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Tree,
    Blob,
    /// Anything else the forge may report (e.g. submodule commits); skipped.
    #[serde(other)]
    Other,
}

/// One child of a tree: a path segment plus the hash of the referenced node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TreeEntry {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub sha: String,
}

/// A directory node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    pub sha: String,
    /// Path segment under the parent; empty for a fetch root.
    pub path: String,
    pub entries: Vec<TreeEntry>,
}

/// A file node. Content is kept in its transport encoding and decoded at
/// materialisation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub sha: String,
    pub path: String,
    pub content: String,
    pub encoding: String,
}

impl Blob {
    /// Decodes the base64 content payload. The forge wraps base64 lines, so
    /// whitespace is stripped first.
    pub fn decoded(&self) -> Result<Vec<u8>, TreeError> {
        let compact: String = self.content.chars().filter(|c| !c.is_whitespace()).collect();
        base64::engine::general_purpose::STANDARD
            .decode(compact.as_bytes())
            .map_err(|source| TreeError::Decode {
                sha: self.sha.clone(),
                source,
            })
    }
}

/// Fetches the tree rooted at `sha`, consulting the cache at every node and
/// caching everything fetched. Returns the root.
pub async fn fetch(
    forge: &ForgeApi,
    cache: &ObjectCache,
    repo: &RepoSummary,
    sha: &str,
) -> Result<Tree, TreeError> {
    let root = match cache.get_tree(sha) {
        Some(tree) => tree,
        None => {
            let data = forge.get_tree(&repo.owner, &repo.name, sha).await?;
            let tree = Tree {
                sha: data.sha,
                path: String::new(),
                entries: data.entries,
            };
            cache.put_tree(tree.clone());
            tree
        }
    };

    // Worklist descent: cached subtrees are descended too, since an earlier
    // interrupted fetch may have cached a tree before its children.
    let mut pending: Vec<TreeEntry> = root.entries.clone();
    while let Some(entry) = pending.pop() {
        match entry.kind {
            EntryKind::Blob => {
                if cache.get_blob(&entry.sha).is_none() {
                    let data = forge.get_blob(&repo.owner, &repo.name, &entry.sha).await?;
                    cache.put_blob(Blob {
                        sha: data.sha,
                        path: entry.path,
                        content: data.content,
                        encoding: data.encoding,
                    });
                }
            }
            EntryKind::Tree => match cache.get_tree(&entry.sha) {
                Some(tree) => pending.extend(tree.entries),
                None => {
                    let data = forge.get_tree(&repo.owner, &repo.name, &entry.sha).await?;
                    let tree = Tree {
                        sha: data.sha,
                        path: entry.path,
                        entries: data.entries,
                    };
                    cache.put_tree(tree.clone());
                    pending.extend(tree.entries);
                }
            },
            EntryKind::Other => {}
        }
    }

    Ok(root)
}

/// Materialises the cached tree `sha` into `dest`.
///
/// Directories are created for trees and files for blobs, with decoded
/// content. Blobs whose path ends in `.sh` get execute permission; all other
/// files are owner read-write.
pub fn materialise(cache: &ObjectCache, sha: &str, dest: &Path) -> Result<(), TreeError> {
    let tree = cache.get_tree(sha).ok_or_else(|| TreeError::MissingObject {
        sha: sha.to_string(),
    })?;
    std::fs::create_dir_all(dest)?;
    write_children(cache, &tree, dest)
}

fn write_children(cache: &ObjectCache, tree: &Tree, dir: &Path) -> Result<(), TreeError> {
    for entry in &tree.entries {
        let path = dir.join(&entry.path);
        match entry.kind {
            EntryKind::Tree => {
                let child = cache
                    .get_tree(&entry.sha)
                    .ok_or_else(|| TreeError::MissingObject {
                        sha: entry.sha.clone(),
                    })?;
                std::fs::create_dir_all(&path)?;
                write_children(cache, &child, &path)?;
            }
            EntryKind::Blob => {
                let blob = cache
                    .get_blob(&entry.sha)
                    .ok_or_else(|| TreeError::MissingObject {
                        sha: entry.sha.clone(),
                    })?;
                let contents = blob.decoded()?;
                let mut file = std::fs::File::create(&path)?;
                file.write_all(&contents)?;

                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let mode = if entry.path.ends_with(".sh") { 0o755 } else { 0o644 };
                    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))?;
                }
            }
            EntryKind::Other => {}
        }
    }
    Ok(())
}
