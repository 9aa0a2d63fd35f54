//! Typed forge client.
//!
//! Wraps the handful of REST operations the dispatcher needs: an
//! authentication ping, the git data API (trees, blobs), commit statuses,
//! gists (the streaming report paste), and a generic URL fetch used to
//! resolve pull-request heads. All operations hit a configurable base URL
//! and authenticate with `Authorization: token <oauth>`.

pub mod api;
pub mod error;
pub mod gist;

pub use api::{BlobData, ForgeApi, TreeData};
pub use error::ForgeError;
pub use gist::{Paste, PasteDocument, PasteFile};
