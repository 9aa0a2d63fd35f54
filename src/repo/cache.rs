//! Concurrent content-addressed object cache.
//!
//! Three maps keyed by hash hold every commit, tree and blob the server has
//! seen. Writes are idempotent, a `put` is visible to subsequent `get`s on
//! all threads, and nothing is evicted for the lifetime of the process.
//! Objects shared by several parents (a blob reachable from two trees, a
//! commit on two references) appear exactly once.

use dashmap::DashMap;

use super::commit::Commit;
use super::tree::{Blob, Tree};

/// The object cache. Cheap to share behind an `Arc`.
#[derive(Debug, Default)]
pub struct ObjectCache {
    commits: DashMap<String, Commit>,
    trees: DashMap<String, Tree>,
    blobs: DashMap<String, Blob>,
}

impl ObjectCache {
    pub fn new() -> Self {
        ObjectCache::default()
    }

    pub fn get_commit(&self, sha: &str) -> Option<Commit> {
        self.commits.get(sha).map(|c| c.clone())
    }

    pub fn get_tree(&self, sha: &str) -> Option<Tree> {
        self.trees.get(sha).map(|t| t.clone())
    }

    pub fn get_blob(&self, sha: &str) -> Option<Blob> {
        self.blobs.get(sha).map(|b| b.clone())
    }

    pub fn put_commit(&self, commit: Commit) {
        self.commits.insert(commit.sha.clone(), commit);
    }

    pub fn put_tree(&self, tree: Tree) {
        self.trees.insert(tree.sha.clone(), tree);
    }

    pub fn put_blob(&self, blob: Blob) {
        self.blobs.insert(blob.sha.clone(), blob);
    }

    /// Inserts every commit of a stitched chain that the cache does not
    /// already hold. Existing entries are left untouched so their links to
    /// older history survive.
    pub fn write_commits(&self, chain: &[Commit]) {
        for commit in chain {
            if !self.commits.contains_key(&commit.sha) {
                self.commits.insert(commit.sha.clone(), commit.clone());
            }
        }
    }

    /// Applies a mutation to a cached commit in place.
    ///
    /// Returns false when the commit is unknown. Used during reference
    /// registration to re-link chains; callers hold the single-writer
    /// invariant for the reference being updated.
    pub fn update_commit(&self, sha: &str, f: impl FnOnce(&mut Commit)) -> bool {
        match self.commits.get_mut(sha) {
            Some(mut entry) => {
                f(&mut entry);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::tree::{Blob, EntryKind, Tree, TreeEntry};

    #[test]
    fn put_then_get_round_trips() {
        let cache = ObjectCache::new();
        cache.put_commit(Commit::new("c1"));
        cache.put_tree(Tree {
            sha: "t1".into(),
            path: "src".into(),
            entries: vec![TreeEntry {
                path: "lib.rs".into(),
                kind: EntryKind::Blob,
                sha: "b1".into(),
            }],
        });
        cache.put_blob(Blob {
            sha: "b1".into(),
            path: "lib.rs".into(),
            content: String::new(),
            encoding: "base64".into(),
        });

        assert_eq!(cache.get_commit("c1").unwrap().sha, "c1");
        assert_eq!(cache.get_tree("t1").unwrap().entries.len(), 1);
        assert_eq!(cache.get_blob("b1").unwrap().path, "lib.rs");
        assert!(cache.get_commit("missing").is_none());
    }

    #[test]
    fn puts_are_idempotent() {
        let cache = ObjectCache::new();
        let commit = Commit::new("c1");
        cache.put_commit(commit.clone());
        cache.put_commit(commit.clone());
        assert_eq!(cache.get_commit("c1").unwrap(), commit);
    }

    #[test]
    fn write_commits_preserves_existing_links() {
        let cache = ObjectCache::new();
        let mut old = Commit::new("c1");
        old.parent = Some("c0".into());
        cache.put_commit(old);

        // A re-delivered chain carries c1 without its parent link.
        cache.write_commits(&[Commit::new("c2"), Commit::new("c1")]);

        assert_eq!(cache.get_commit("c1").unwrap().parent.as_deref(), Some("c0"));
        assert!(cache.get_commit("c2").is_some());
    }

    #[test]
    fn update_commit_mutates_in_place() {
        let cache = ObjectCache::new();
        cache.put_commit(Commit::new("c1"));
        assert!(cache.update_commit("c1", |c| c.child = Some("c2".into())));
        assert_eq!(cache.get_commit("c1").unwrap().child.as_deref(), Some("c2"));
        assert!(!cache.update_commit("missing", |_| {}));
    }
}
