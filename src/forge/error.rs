//! Forge client errors.

use thiserror::Error;

/// Errors raised by forge operations.
///
/// Failures are not retried here; the dispatch model relies on the sender
/// re-triggering via another webhook, so each error surfaces directly to the
/// calling stage.
#[derive(Debug, Error)]
pub enum ForgeError {
    /// The request never completed (connection, TLS, timeout ...).
    #[error("forge transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The forge answered with a status the operation does not accept.
    #[error("{operation}: expected status {expected}, received {received}")]
    UnexpectedStatus {
        operation: &'static str,
        expected: u16,
        received: u16,
    },

    /// The response body could not be decoded as the expected shape.
    #[error("{operation}: failed decoding response: {message}")]
    Decode {
        operation: &'static str,
        message: String,
    },

    /// A paste was created but the response carried no usable id.
    #[error("failed to retrieve paste id from forge response")]
    MissingPasteId,
}

impl ForgeError {
    pub(crate) fn unexpected(
        operation: &'static str,
        expected: u16,
        received: reqwest::StatusCode,
    ) -> Self {
        ForgeError::UnexpectedStatus {
            operation,
            expected,
            received: received.as_u16(),
        }
    }
}
