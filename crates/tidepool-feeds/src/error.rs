//! Error types for the feed engine.

use thiserror::Error;

/// Errors from a paginated pull against a feed resource.
#[derive(Debug, Error)]
pub enum PullError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Server answered with a non-success status.
    #[error("pull failed ({status}): {body}")]
    Status { status: u16, body: String },

    /// Rate limited.
    #[error("rate limited{}", retry_hint(.retry_after_secs))]
    RateLimited {
        /// Seconds to wait before retrying (from Retry-After header, optional).
        retry_after_secs: Option<u64>,
    },

    /// Response body did not have the expected shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

fn retry_hint(retry_after_secs: &Option<u64>) -> String {
    match retry_after_secs {
        Some(secs) => format!(" (retry after {}s)", secs),
        None => String::new(),
    }
}

/// Errors that can occur inside the engine.
///
/// None of these are fatal; each is local to one feed or one event.
#[derive(Debug, Error)]
pub enum FeedError {
    /// A pull against the cursor pager failed. Feed cursors are untouched.
    #[error("pull failed: {0}")]
    PullFailed(#[from] PullError),

    /// A feed identifier string could not be parsed.
    #[error("invalid feed id: {0}")]
    InvalidFeedId(String),

    /// A push event kind outside the known vocabulary.
    #[error("unknown stream event: {0}")]
    UnknownEvent(String),

    /// A push event payload was missing required fields.
    #[error("invalid payload for {event}: {reason}")]
    InvalidPayload { event: String, reason: String },

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),
}
