//! Repository state model.
//!
//! Tracks what the server knows about each remote repository across webhook
//! deliveries: commit chains per reference, plus a content-addressed cache of
//! commits, trees and blobs. The cache owns objects by hash; references hold
//! only a head hash and chains are walked through the cache, so shared
//! objects never form ownership cycles.

pub mod cache;
pub mod commit;
pub mod state;
pub mod tree;

pub use cache::ObjectCache;
pub use commit::{Author, Commit, CommitStatus, StatusState};
pub use state::{Reference, RepoSummary, Repositories, Repository};
pub use tree::{Blob, EntryKind, Tree, TreeEntry};
