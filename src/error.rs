//! Error types for MNEMONIC.

use thiserror::Error;

/// Result type alias used throughout the core.
pub type Result<T> = std::result::Result<T, MnemonicError>;

/// Failure modes surfaced by MNEMONIC's public operations.
///
/// `Superseded` and capacity eviction are deliberately *not* variants here:
/// both are informational outcomes, not errors (see
/// [`crate::record::StoreOutcome`]).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MnemonicError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl MnemonicError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        MnemonicError::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        MnemonicError::NotFound(msg.into())
    }
}
