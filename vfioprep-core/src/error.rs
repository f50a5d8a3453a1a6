//! Error types for vfioprep.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.
//! Failures of individual reversal steps are deliberately *not* represented here:
//! they are collected as warnings in a [`crate::reversal::ReversalReport`].

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for vfioprep operations.
pub type Result<T> = std::result::Result<T, PrepError>;

/// Main error type for vfioprep.
#[derive(Error, Debug)]
pub enum PrepError {
    // Resolution errors
    #[error("PCI enumeration failed: {reason}. {hint}")]
    EnumerationFailed { reason: String, hint: String },

    #[error("No display device from vendor {vendor} is available for passthrough. {hint}")]
    NoCandidate { vendor: String, hint: String },

    #[error("No isolation group data for device {address}. {hint}")]
    NoIsolationData { address: String, hint: String },

    #[error("Aborted by operator during {step}")]
    UserAborted { step: String },

    #[error("Invalid selection {index}: expected a choice below {count}")]
    InvalidChoice { index: usize, count: usize },

    #[error("Invalid PCI address: {address} (expected: 0b:00.0 or 0000:0b:00.0)")]
    InvalidAddress { address: String },

    // Journal errors
    #[error("Failed to persist journal to {path:?}: {source}")]
    PersistFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No journal found at {path:?}")]
    JournalNotFound { path: PathBuf },

    #[error("Journal at {path:?} is corrupt: {reason}")]
    CorruptJournal { path: PathBuf, reason: String },

    // Host mutation errors
    #[error("Failed to back up {path:?}: {source}")]
    BackupFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Required tool not found: {tool}. {hint}")]
    ToolNotFound { tool: String, hint: String },

    #[error("{tool} failed: {reason}")]
    ToolFailed { tool: String, reason: String },

    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PrepError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// Whether this error only means there is no prior session to revert.
    pub fn is_nothing_to_clean(&self) -> bool {
        matches!(self, Self::JournalNotFound { .. })
    }

    /// Whether the operator declined a prompt.
    pub fn is_user_aborted(&self) -> bool {
        matches!(self, Self::UserAborted { .. })
    }
}
