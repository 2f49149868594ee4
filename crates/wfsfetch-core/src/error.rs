//! Error types for WFS fetch sessions.
//!
//! Every failure that aborts a session is one of the concern-specific enums
//! below, wrapped by [`WfsFetchError`]. Per-row geometry decode failures are not
//! errors: the merge step rejects those rows and logs a warning.

use std::path::PathBuf;
use thiserror::Error;

pub use wfs_geojson::ResponseError;

/// Main error type for fetch sessions.
///
/// Uses `#[error(transparent)]` to delegate display formatting to the
/// underlying variants.
#[derive(Debug, Error)]
pub enum WfsFetchError {
    /// The page request failed or the service answered with a non-success status
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The response body could not be decoded into a page
    #[error(transparent)]
    Response(#[from] ResponseError),

    /// A page disagrees with the schema fixed on the first page
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// Pagination never reached the advertised match count
    #[error(transparent)]
    Pagination(#[from] PaginationError),

    /// A spill file could not be written
    #[error(transparent)]
    Spill(#[from] SpillError),

    /// Spill files or the in-memory batch could not be assembled
    #[error(transparent)]
    Merge(#[from] MergeError),

    /// Configuration errors
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Failures talking to the remote service.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request could not be sent or its body could not be read
    #[error("Request to '{url}' failed: {source}")]
    Request {
        /// The request URL
        url: String,
        /// The underlying client error
        #[source]
        source: reqwest::Error,
    },

    /// The service answered with a non-success HTTP status
    #[error("Request to '{url}' returned HTTP {status}")]
    Status {
        /// The request URL
        url: String,
        /// The HTTP status code
        status: u16,
    },

    /// The request URL could not be built
    #[error("Invalid service URL '{url}': {message}")]
    InvalidUrl {
        /// The offending URL
        url: String,
        /// Why it was rejected
        message: String,
    },
}

/// A later page reported a schema different from the one fixed at session start.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Page {page} declares {what} '{found}', but the session was fixed to '{expected}'")]
    Inconsistent {
        /// Zero-based page index
        page: usize,
        /// Which part of the schema differs ("geometry column" or "CRS")
        what: &'static str,
        /// The value fixed on the first page
        expected: String,
        /// The value this page reported
        found: String,
    },
}

/// The service under-reports and pagination cannot make progress.
#[derive(Debug, Error)]
pub enum PaginationError {
    #[error(
        "Pagination stalled at start index {start_index} after {attempts} empty page(s): \
         {returned} of {matched} features returned"
    )]
    Stalled {
        /// Offset that kept returning nothing
        start_index: u64,
        /// Consecutive empty pages observed at that offset
        attempts: u32,
        /// Features received so far
        returned: u64,
        /// Features the service said would match
        matched: u64,
    },
}

/// Spill directory or spill file failures.
#[derive(Debug, Error)]
pub enum SpillError {
    /// The session temporary directory could not be created
    #[error("Failed to create spill directory under '{path}': {source}")]
    CreateDir {
        /// Parent directory
        path: PathBuf,
        /// The underlying error
        #[source]
        source: std::io::Error,
    },

    /// A spill file could not be written completely
    #[error("Failed to write spill file '{path}': {source}")]
    Write {
        /// The spill file path
        path: PathBuf,
        /// The underlying error
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Failures assembling the final dataset.
#[derive(Debug, Error)]
pub enum MergeError {
    /// Spill files could not be loaded back
    #[error("Failed to load spill files: {0}")]
    Read(#[from] datafusion::error::DataFusionError),

    /// Columns could not be combined into a record batch
    #[error("Failed to assemble record batch: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),

    /// The geometry column could not be built
    #[error("Failed to build geometry column '{column}': {message}")]
    Geometry {
        /// Geometry column name
        column: String,
        /// Description of the failure
        message: String,
    },
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid option value
    #[error("Invalid {option} option: {message}")]
    InvalidOption {
        /// The option name
        option: String,
        /// Why it's invalid
        message: String,
    },
}

/// Type alias for Results using `WfsFetchError`.
pub type Result<T> = std::result::Result<T, WfsFetchError>;

impl WfsFetchError {
    /// Get a user-friendly error message.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Transport(e) => format!("Could not reach the feature service: {e}"),
            Self::Response(e) => format!("The feature service sent an unreadable page: {e}"),
            Self::Schema(e) => format!("The feature service changed schema mid-download: {e}"),
            Self::Pagination(e) => format!("Download incomplete: {e}"),
            Self::Spill(e) => format!("Could not cache features on disk: {e}"),
            Self::Merge(e) => format!("Could not assemble the dataset: {e}"),
            Self::Config(e) => format!("Configuration error: {e}"),
        }
    }

    /// Get recovery suggestions if available.
    #[must_use]
    pub fn recovery_suggestion(&self) -> Option<String> {
        match self {
            Self::Transport(TransportError::Status { status, .. }) if *status >= 500 => Some(
                "The service may be overloaded. Retry later or use a smaller page size.".to_string(),
            ),
            Self::Transport(TransportError::Status { .. }) => {
                Some("Check the dataset name, filter and field names.".to_string())
            },
            Self::Transport(_) => Some("Check network connectivity and the service URL.".to_string()),
            Self::Response(_) => {
                Some("Check the filter syntax; the service may have returned an exception report.".to_string())
            },
            Self::Pagination(_) => {
                Some("Add a sort attribute so paging is stable, or narrow the query.".to_string())
            },
            Self::Spill(_) => {
                Some("Check free disk space and permissions of the spill directory.".to_string())
            },
            Self::Schema(_) | Self::Merge(_) | Self::Config(_) => None,
        }
    }

    /// Check if this error is potentially recoverable by retrying the session.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::Pagination(_)
                | Self::Transport(TransportError::Request { .. })
        ) || matches!(self, Self::Transport(TransportError::Status { status, .. }) if *status >= 500)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_error_message() {
        let err = WfsFetchError::from(SchemaError::Inconsistent {
            page: 2,
            what: "geometry column",
            expected: "shape".to_string(),
            found: "geometry".to_string(),
        });

        assert_eq!(
            err.to_string(),
            "Page 2 declares geometry column 'geometry', but the session was fixed to 'shape'"
        );
        assert!(err.recovery_suggestion().is_none());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn stalled_pagination_is_recoverable() {
        let err = WfsFetchError::from(PaginationError::Stalled {
            start_index: 20_000,
            attempts: 3,
            returned: 20_000,
            matched: 25_000,
        });

        assert!(err.to_string().contains("start index 20000"));
        assert!(err.user_message().starts_with("Download incomplete"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn server_errors_suggest_retry() {
        let err = WfsFetchError::from(TransportError::Status {
            url: "https://example.com/ows".to_string(),
            status: 503,
        });

        assert!(err.is_recoverable());
        assert!(err.recovery_suggestion().unwrap().contains("Retry later"));

        let client_err = WfsFetchError::from(TransportError::Status {
            url: "https://example.com/ows".to_string(),
            status: 400,
        });
        assert!(!client_err.is_recoverable());
    }

    #[test]
    fn config_error_message() {
        let err = WfsFetchError::from(ConfigError::InvalidOption {
            option: "page_size".to_string(),
            message: "must be greater than zero".to_string(),
        });

        assert_eq!(
            err.user_message(),
            "Configuration error: Invalid page_size option: must be greater than zero"
        );
    }
}
