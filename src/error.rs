//! Crate-level error types for configuration and run setup.
//!
//! Stage-specific failures (fetch, conversion, reputation, publish) live
//! in their own modules and are converted into ledger outcomes at the
//! per-entry boundary; the errors here abort a run before it starts.

use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors that prevent a run from starting.
#[derive(Debug, Error)]
pub enum SetupError {
    /// The catalog file could not be read or parsed.
    #[error("catalog error: {0}")]
    Catalog(#[from] crate::catalog::CatalogError),

    /// The run configuration is missing or invalid.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// The run report could not be written.
    #[error("failed to write report to {path}: {source}")]
    ReportWrite {
        /// Destination path for the report.
        path: Utf8PathBuf,
        /// The underlying I/O or serialization failure.
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias using [`SetupError`].
pub type Result<T> = std::result::Result<T, SetupError>;
