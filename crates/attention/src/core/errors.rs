//! Error taxonomy for the attention operators.
//!
//! Every failure is a local precondition check raised synchronously at
//! construction or forward time; there is no recovery or retry logic
//! anywhere in this crate. Collaborator failures from the tensor-execution
//! layer pass through unchanged.

use thiserror::Error;

/// Attention-specific error category.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape for {context}")]
    InvalidShape { context: String },

    /// The kernel does not support the requested data type.
    #[error("unsupported dtype {requested}")]
    UnsupportedDType { requested: String },

    /// The requested execution backend is unavailable in this build or
    /// environment. Raised at construction time; fatal, never retried.
    #[error("attention backend unavailable: {reason}")]
    UnsupportedBackend { reason: String },

    /// A backend-specific failure propagated from the tensor-execution
    /// collaborator.
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

impl AttentionError {
    pub(crate) fn shape(context: impl Into<String>) -> Self {
        Self::InvalidShape {
            context: context.into(),
        }
    }
}
