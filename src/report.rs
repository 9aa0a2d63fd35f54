//! Buffered Markdown report writer, multiplexed over several sinks.
//!
//! The writer builds the streaming build report: level-2 titles, fenced code
//! blocks, one line per script output line. Output is buffered (~1 MiB) and
//! pushed to every sink on `flush`, each sink receiving the identical byte
//! stream. All operations are serialised by an internal mutex, so script
//! readers and the flush ticker can share one writer.
//!
//! Errors are sticky: once any operation fails, every subsequent operation
//! is a no-op returning the same error, so a broken remote sink cannot
//! corrupt the report shape.

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::forge::PasteDocument;

/// Report buffer capacity. A full buffer forces an early flush.
pub const BUFFER_CAPACITY: usize = 1024 * 1024;

/// Report writer errors. `Clone` so the sticky error can be returned
/// repeatedly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReportError {
    /// `title` was called while a code block was open.
    #[error("attempted title write in code block")]
    TitleInBlock,

    /// `close_block` was called with no block open.
    #[error("close called on unopened block")]
    BlockNotOpen,

    /// A sink rejected the stream.
    #[error("report sink error: {0}")]
    Sink(String),
}

/// One destination for report bytes.
#[async_trait]
pub trait ReportSink: Send {
    async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()>;
}

/// Sink writing to a local log file.
pub struct FileSink {
    file: tokio::fs::File,
}

impl FileSink {
    pub async fn create(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(FileSink {
            file: tokio::fs::File::create(path).await?,
        })
    }
}

#[async_trait]
impl ReportSink for FileSink {
    async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.file.write_all(bytes).await?;
        self.file.flush().await
    }
}

/// Sink pushing to a remote paste document.
///
/// Paste updates replace the file wholesale, so the sink accumulates the
/// full stream and re-publishes the entire document each time.
pub struct PasteSink {
    doc: PasteDocument,
    content: String,
}

impl PasteSink {
    pub fn new(doc: PasteDocument) -> Self {
        PasteSink {
            doc,
            content: String::new(),
        }
    }
}

#[async_trait]
impl ReportSink for PasteSink {
    async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.content.push_str(&String::from_utf8_lossy(bytes));
        self.doc
            .update(&self.content)
            .await
            .map_err(std::io::Error::other)
    }
}

struct Inner {
    sinks: Vec<Box<dyn ReportSink>>,
    buf: Vec<u8>,
    capacity: usize,
    block_open: bool,
    err: Option<ReportError>,
}

/// The multiplexed report writer.
pub struct ReportWriter {
    inner: Mutex<Inner>,
}

impl ReportWriter {
    pub fn new(sinks: Vec<Box<dyn ReportSink>>) -> Self {
        Self::with_capacity(sinks, BUFFER_CAPACITY)
    }

    pub fn with_capacity(sinks: Vec<Box<dyn ReportSink>>, capacity: usize) -> Self {
        ReportWriter {
            inner: Mutex::new(Inner {
                sinks,
                buf: Vec::new(),
                capacity,
                block_open: false,
                err: None,
            }),
        }
    }

    /// Writes a level-2 title. Rejected while a code block is open.
    pub async fn title(&self, text: &str) -> Result<(), ReportError> {
        let mut inner = self.inner.lock().await;
        inner.guard()?;
        if inner.block_open {
            inner.err = Some(ReportError::TitleInBlock);
            return Err(ReportError::TitleInBlock);
        }
        inner.push(format!("\n## {text}\n").as_bytes()).await
    }

    /// Opens a fenced code block. `close_block` must end it before the next
    /// title.
    pub async fn open_block(&self) -> Result<(), ReportError> {
        let mut inner = self.inner.lock().await;
        inner.guard()?;
        inner.block_open = true;
        inner.push(b"```\n").await
    }

    /// Closes the current code block.
    pub async fn close_block(&self) -> Result<(), ReportError> {
        let mut inner = self.inner.lock().await;
        inner.guard()?;
        if !inner.block_open {
            inner.err = Some(ReportError::BlockNotOpen);
            return Err(ReportError::BlockNotOpen);
        }
        inner.block_open = false;
        inner.push(b"\n```\n").await
    }

    /// Writes one line.
    pub async fn write(&self, line: &str) -> Result<(), ReportError> {
        let mut inner = self.inner.lock().await;
        inner.guard()?;
        inner.push(format!("{line}\n").as_bytes()).await
    }

    /// Forces propagation of buffered bytes to every sink.
    pub async fn flush(&self) -> Result<(), ReportError> {
        let mut inner = self.inner.lock().await;
        inner.guard()?;
        inner.flush_sinks().await
    }

    /// The sticky error, if any operation has failed.
    pub async fn err(&self) -> Option<ReportError> {
        self.inner.lock().await.err.clone()
    }
}

impl Inner {
    fn guard(&self) -> Result<(), ReportError> {
        match &self.err {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn push(&mut self, bytes: &[u8]) -> Result<(), ReportError> {
        if self.buf.len() + bytes.len() > self.capacity {
            self.flush_sinks().await?;
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    async fn flush_sinks(&mut self) -> Result<(), ReportError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        for sink in &mut self.sinks {
            if let Err(e) = sink.write_all(&self.buf).await {
                let err = ReportError::Sink(e.to_string());
                self.err = Some(err.clone());
                return Err(err);
            }
        }
        self.buf.clear();
        Ok(())
    }
}
