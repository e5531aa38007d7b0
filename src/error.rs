//! Error taxonomy for the ingest pipeline.
//!
//! Two levels:
//! - [`CatalogError`] is fatal: without a valid catalog no dataset can be processed.
//! - [`DatasetError`] is terminal for one dataset only; the pipeline records it in the
//!   run report and keeps going with the other datasets.

use std::path::PathBuf;
use std::time::Duration;

/// Catalog-level failures. Abort the whole run.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog parse error in {path}: {message}")]
    Parse { path: String, message: String },

    #[error("catalog schema error ({entry}): {message}")]
    Schema { entry: String, message: String },

    #[error("reading catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CatalogError {
    pub(crate) fn schema(entry: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Schema {
            entry: entry.into(),
            message: message.into(),
        }
    }
}

/// Per-dataset failures, caught at the dataset pipeline boundary.
#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    /// One attempt exceeded its deadline. Retried by the fetcher.
    #[error("fetch timed out after {:.1}s", .timeout.as_secs_f64())]
    FetchTimeout { timeout: Duration },

    /// Source could not be retrieved; retries exhausted or the failure is not retryable.
    #[error("source unavailable after {attempts} attempt(s): {reason}")]
    FetchUnavailable { attempts: u32, reason: String },

    /// `row` is 1-based over data rows; 0 means the header.
    #[error("schema mismatch at row {row}: {reason}")]
    SchemaMismatch { row: usize, reason: String },

    #[error("write conflict on {}: {reason}", .path.display())]
    WriteConflict { path: PathBuf, reason: String },

    /// The existing data file cannot be merged into (foreign header, unordered keys).
    #[error("data file {} is not mergeable: {reason}", .path.display())]
    DataFile { path: PathBuf, reason: String },

    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DatasetError {
    pub(crate) fn mismatch(row: usize, reason: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            row,
            reason: reason.into(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
