use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state_machine::SubscriptionState;

/// Broad error category used for user-facing handling and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FeedErrorCategory {
    /// Invalid input, unsupported request, or other configuration issue.
    Config,
    /// Authentication/authorization failure reported by the API.
    Auth,
    /// Transient network or transport failure.
    Network,
    /// Rate-limited by the API.
    RateLimited,
    /// Requested conversation or message does not exist.
    NotFound,
    /// Payload could not be decoded.
    Serialization,
    /// Invariant break inside the feed.
    Internal,
}

/// Stable feed error payload emitted across the command/event boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct FeedError {
    /// High-level error category.
    pub category: FeedErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl FeedError {
    /// Construct a new feed error.
    pub fn new(
        category: FeedErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: SubscriptionState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            FeedErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while subscription is in state {current:?}"),
        )
    }

    /// Build the error reported when a row payload cannot be decoded.
    pub fn malformed_row(reason: impl Into<String>) -> Self {
        Self::new(
            FeedErrorCategory::Serialization,
            "malformed_row",
            reason.into(),
        )
    }

    /// Whether a retry of the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.category,
            FeedErrorCategory::Network | FeedErrorCategory::RateLimited
        )
    }
}

/// Map HTTP status codes to feed error categories.
pub fn classify_http_status(status: u16) -> FeedErrorCategory {
    match status {
        401 | 403 => FeedErrorCategory::Auth,
        404 => FeedErrorCategory::NotFound,
        408 | 429 => FeedErrorCategory::RateLimited,
        400..=499 => FeedErrorCategory::Config,
        500..=599 => FeedErrorCategory::Network,
        _ => FeedErrorCategory::Internal,
    }
}
