//! Per-repository reference state.
//!
//! A repository maps reference names to references; a reference holds only
//! the hash of its head commit. Chains are walked through the object cache
//! via parent links. `register_commits` accumulates history across webhook
//! deliveries: when an incoming chain overlaps the known one, the overlap is
//! spliced so ancestors survive; otherwise the old chain is discarded.
//!
//! Mutation of a commit's links happens only here, and deliveries for one
//! reference are processed one at a time, so a reference has a single writer
//! at any instant.

use std::collections::{HashMap, HashSet};

use dashmap::DashMap;

use super::cache::ObjectCache;
use super::commit::Commit;

/// The identifying attributes of a repository, as carried in webhook
/// payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoSummary {
    pub name: String,
    pub owner: String,
    pub fork: bool,
}

impl RepoSummary {
    pub fn new(name: impl Into<String>, owner: impl Into<String>) -> Self {
        RepoSummary {
            name: name.into(),
            owner: owner.into(),
            fork: false,
        }
    }
}

/// A named pointer to a head commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub name: String,
    pub head: Option<String>,
}

impl Reference {
    /// Walks parent links from the head through the cache, returning the
    /// chain hashes newest-first. Stops on the first unknown or repeated
    /// hash, so a corrupt link can never loop forever.
    pub fn ancestry(&self, cache: &ObjectCache) -> Vec<String> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = self.head.clone();
        while let Some(sha) = cursor {
            if !seen.insert(sha.clone()) {
                break;
            }
            cursor = cache.get_commit(&sha).and_then(|c| c.parent);
            chain.push(sha);
        }
        chain
    }

    /// Returns the head commit, if the cache knows it.
    pub fn head_commit(&self, cache: &ObjectCache) -> Option<Commit> {
        self.head.as_deref().and_then(|sha| cache.get_commit(sha))
    }
}

/// A repository the server has observed, with its known references.
#[derive(Debug, Clone)]
pub struct Repository {
    pub name: String,
    pub owner: String,
    pub fork: bool,
    pub refs: HashMap<String, Reference>,
}

impl Repository {
    fn new(summary: &RepoSummary) -> Self {
        Repository {
            name: summary.name.clone(),
            owner: summary.owner.clone(),
            fork: summary.fork,
            refs: HashMap::new(),
        }
    }
}

/// All repositories known to the server, keyed by name.
///
/// Repositories are created on first observation and never destroyed.
#[derive(Debug, Default)]
pub struct Repositories {
    inner: DashMap<String, Repository>,
}

impl Repositories {
    pub fn new() -> Self {
        Repositories::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    /// Returns a snapshot of a repository.
    pub fn get(&self, name: &str) -> Option<Repository> {
        self.inner.get(name).map(|r| r.clone())
    }

    /// Returns a snapshot of one reference of a repository.
    pub fn reference(&self, repo: &str, ref_name: &str) -> Option<Reference> {
        self.inner
            .get(repo)
            .and_then(|r| r.refs.get(ref_name).cloned())
    }

    /// Registers an incoming commit chain for `(repo, ref_name)`.
    ///
    /// `chain` is ordered newest-first: element `i` is the child of element
    /// `i + 1`. The repository and reference are created on first sight.
    /// When the oldest incoming commit is already on the known chain, the
    /// incoming commits are stitched above it and older history survives;
    /// when there is no overlap the old chain is discarded. The head always
    /// becomes the incoming head. An empty chain is a no-op.
    ///
    /// Returns a snapshot of the reference after registration.
    pub fn register_commits(
        &self,
        cache: &ObjectCache,
        repo: &RepoSummary,
        ref_name: &str,
        mut chain: Vec<Commit>,
    ) -> Option<Reference> {
        if chain.is_empty() {
            return self.reference(&repo.name, ref_name);
        }
        stitch(&mut chain);

        let incoming_head = chain[0].sha.clone();
        let incoming_tail = chain[chain.len() - 1].sha.clone();

        let mut entry = self
            .inner
            .entry(repo.name.clone())
            .or_insert_with(|| Repository::new(repo));

        match entry.refs.get(ref_name) {
            None => {
                cache.write_commits(&chain);
            }
            Some(existing) => {
                if self.find_on_chain(cache, existing, &incoming_tail) {
                    // Overlap: the incoming tail is already known. Splice the
                    // commit above it onto the existing node so the tail's
                    // ancestors are preserved, and insert only the new part.
                    if chain.len() > 1 {
                        let above = chain[chain.len() - 2].sha.clone();
                        cache.update_commit(&incoming_tail, |c| c.child = Some(above));
                        cache.write_commits(&chain[..chain.len() - 1]);
                    }
                } else {
                    cache.write_commits(&chain);
                }
            }
        }

        let reference = entry
            .refs
            .entry(ref_name.to_string())
            .or_insert_with(|| Reference {
                name: ref_name.to_string(),
                head: None,
            });
        reference.head = Some(incoming_head);
        Some(reference.clone())
    }

    /// Walks an existing chain from its head looking for `target`.
    fn find_on_chain(&self, cache: &ObjectCache, reference: &Reference, target: &str) -> bool {
        let mut seen = HashSet::new();
        let mut cursor = reference.head.clone();
        while let Some(sha) = cursor {
            if sha == target {
                return true;
            }
            if !seen.insert(sha.clone()) {
                return false;
            }
            cursor = cache.get_commit(&sha).and_then(|c| c.parent);
        }
        false
    }
}

/// Links adjacent chain elements: element `i` is the child of `i + 1`.
///
/// The head's `child` and the tail's `parent` are left as the caller built
/// them.
fn stitch(chain: &mut [Commit]) {
    for i in 0..chain.len().saturating_sub(1) {
        let parent_sha = chain[i + 1].sha.clone();
        let child_sha = chain[i].sha.clone();
        chain[i].parent = Some(parent_sha);
        chain[i + 1].child = Some(child_sha);
    }
}
