//! Paste documents: the user-visible streaming build log.
//!
//! A paste is a public gist with one Markdown file. It is created up front
//! with placeholder content so the commit status can link to it immediately,
//! then updated whole-document as the report writer flushes.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use super::api::ForgeApi;
use super::error::ForgeError;

/// One file in a paste.
#[derive(Debug, Clone, Serialize)]
pub struct PasteFile {
    pub content: String,
}

/// The paste wire shape for create and update calls.
#[derive(Debug, Clone, Serialize)]
pub struct Paste {
    pub description: String,
    pub public: bool,
    pub files: BTreeMap<String, PasteFile>,
}

impl Paste {
    pub fn new(description: impl Into<String>) -> Self {
        Paste {
            description: description.into(),
            public: true,
            files: BTreeMap::new(),
        }
    }

    pub fn set_file(&mut self, name: impl Into<String>, content: impl Into<String>) {
        self.files.insert(
            name.into(),
            PasteFile {
                content: content.into(),
            },
        );
    }
}

/// A handle to one remote paste document holding one file.
///
/// The first call creates the paste (with `pending...` content); `update`
/// replaces the file content wholesale.
#[derive(Debug)]
pub struct PasteDocument {
    api: Arc<ForgeApi>,
    id: String,
    description: String,
    filename: String,
}

impl PasteDocument {
    /// Creates the remote paste and returns a handle to it.
    pub async fn create(
        api: Arc<ForgeApi>,
        description: impl Into<String>,
        filename: impl Into<String>,
    ) -> Result<Self, ForgeError> {
        let description = description.into();
        let filename = filename.into();

        let mut paste = Paste::new(&description);
        paste.set_file(&filename, "pending...");
        let id = api.create_paste(&paste).await?;

        Ok(PasteDocument {
            api,
            id,
            description,
            filename,
        })
    }

    /// Replaces the document content.
    pub async fn update(&self, content: &str) -> Result<(), ForgeError> {
        let mut paste = Paste::new(&self.description);
        paste.set_file(&self.filename, content);
        self.api.update_paste(&self.id, &paste).await
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The user-visible URL, used as the commit status target.
    pub fn url(&self) -> String {
        self.api.paste_url(&self.id)
    }
}
