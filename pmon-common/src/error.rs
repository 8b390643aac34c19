//! Common error types for pmon

use thiserror::Error;

/// Common result type for pmon operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the pmon crates
#[derive(Error, Debug)]
pub enum Error {
    /// Artifact name does not match the instrument filename grammar.
    /// Recoverable at the point of occurrence: skip the one artifact.
    #[error("Unexpected format of artifact name ({0})")]
    Format(String),

    /// Configuration loading or validation error. Fatal at start-up.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data corruption detected mid-evaluation (e.g. classifier result count
    /// mismatch). Fatal for the current sample; its state stays on disk for
    /// inspection and resume.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// A file handle held elsewhere prevents removing a sample's output
    /// directory. Requires operator intervention.
    #[error("Resource locked: {0}")]
    ResourceLocked(String),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
