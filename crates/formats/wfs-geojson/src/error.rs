//! Errors raised while decoding a WFS response body.

use thiserror::Error;

/// A response body that could not be turned into a page of features.
#[derive(Debug, Error)]
pub enum ResponseError {
    /// The body is not a `GeoJSON` feature collection.
    #[error("Failed to parse WFS response{context}: {message}", context = fmt_context(context.as_deref()))]
    Parse {
        /// Human readable description of the failure.
        message: String,
        /// Optional context describing which request produced the body.
        context: Option<String>,
    },

    /// A member required for pagination is absent or not a count.
    #[error("WFS response is missing '{field}'{context}", context = fmt_context(context.as_deref()))]
    MissingField {
        /// The JSON member name.
        field: String,
        /// Optional context describing which request produced the body.
        context: Option<String>,
    },
}

impl ResponseError {
    /// Attach additional context to the error, returning the updated error.
    #[must_use]
    pub fn with_additional_context(mut self, extra: impl Into<String>) -> Self {
        let extra = extra.into();
        match &mut self {
            Self::Parse { context, .. } | Self::MissingField { context, .. } => match context {
                Some(existing) if !existing.is_empty() => {
                    existing.push_str("; ");
                    existing.push_str(&extra);
                },
                _ => *context = Some(extra),
            },
        }
        self
    }
}

fn fmt_context(context: Option<&str>) -> String {
    context
        .map(|c| format!(" while reading {c}"))
        .unwrap_or_default()
}

/// Result type alias that uses [`ResponseError`].
pub type ResponseResult<T> = Result<T, ResponseError>;
