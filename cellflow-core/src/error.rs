//! Error types shared by every cell kind.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type CellResult<T> = Result<T, CellError>;

/// Errors raised by cells, channels, pipelines and cancellation tokens.
///
/// Two families never mix: [`CellError::ReentrantUpdate`] is a programming
/// error and always travels straight back to the caller, while the remaining
/// variants describe computation failures that are first offered to a cell's
/// error handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CellError {
    /// A cell was updated from within one of its own update notifications.
    #[error("cell `{0}` was updated from within its own update notification")]
    ReentrantUpdate(String),

    /// A callback was registered against a token that is already cancelled.
    #[error("cancellation token is already cancelled")]
    AlreadyCancelled,

    /// An operator in a transform pipeline failed.
    #[error("operator `{operator}` failed: {message}")]
    Operator { operator: String, message: String },

    /// An index argument did not address an existing element.
    #[error("index {index} is out of bounds for a collection of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    /// A serialized change record could not be replayed.
    #[error("invalid change record: {0}")]
    InvalidChange(String),

    /// A cell was dropped while something was still waiting on it.
    #[error("cell was dropped before producing a value")]
    Disconnected,

    /// Any other failure, typically raised by user callbacks.
    #[error("{0}")]
    Failed(String),
}

impl CellError {
    /// Build a [`CellError::Failed`] from anything printable.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Build a [`CellError::Operator`] for the named operator.
    pub fn operator(operator: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Operator {
            operator: operator.into(),
            message: message.into(),
        }
    }

    /// Whether this is a programming error that must not be recovered from.
    pub fn is_reentrancy(&self) -> bool {
        matches!(self, Self::ReentrantUpdate(_))
    }
}
