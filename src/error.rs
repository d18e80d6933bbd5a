//! Error types for Kestrel
//!
//! This module defines the error taxonomy used throughout the host core.
//! Uses `thiserror` for ergonomic error handling with automatic `Display`
//! and `Error` trait implementations.
//!
//! Two kinds of failures matter to callers:
//!
//! - `Config` — user-facing: unknown option names, type mismatches,
//!   malformed set-specs or config documents. Always recoverable; the
//!   pending option batch is rolled back and the error surfaces to the
//!   caller that initiated it.
//! - `ExtManager` — programmer-facing: duplicate registration, removal of
//!   an unregistered extension. Treated as a defect and surfaced
//!   immediately, never swallowed by dispatch.
//!
//! Failures raised *inside* extension handlers are a separate concern and
//! live in [`crate::ext::HookError`].

use thiserror::Error;

/// The primary error type for Kestrel operations.
#[derive(Error, Debug)]
pub enum KestrelError {
    /// Configuration-related errors (unknown options, type mismatches,
    /// malformed documents, missing required values).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Extension registry misuse (duplicate registration, unknown removal).
    #[error("Extension manager error: {0}")]
    ExtManager(String),

    /// An unclassified failure escaping an extension hook outside of event
    /// dispatch (load/ready/done invoked directly during registration or
    /// removal). Dispatch-time failures are isolated and logged instead.
    #[error("Extension error: {0}")]
    Extension(#[from] anyhow::Error),

    /// Standard I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized `Result` type for Kestrel operations.
pub type Result<T> = std::result::Result<T, KestrelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KestrelError::Config("No such option: foo".to_string());
        assert_eq!(err.to_string(), "Configuration error: No such option: foo");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: KestrelError = io_err.into();
        assert!(matches!(err, KestrelError::Io(_)));
    }

    #[test]
    fn test_ext_manager_display() {
        let err = KestrelError::ExtManager("Extension echo already registered".to_string());
        assert_eq!(
            err.to_string(),
            "Extension manager error: Extension echo already registered"
        );
    }
}
