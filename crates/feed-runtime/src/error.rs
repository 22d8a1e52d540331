use feed_core::{FeedError, FeedErrorCategory, classify_http_status};
use feed_platform::PlatformError;

/// Map a collaborator failure onto the stable feed error taxonomy.
pub fn map_platform_error(err: PlatformError) -> FeedError {
    match err {
        PlatformError::NotFound(what) => FeedError::new(
            FeedErrorCategory::NotFound,
            "not_found",
            format!("not found: {what}"),
        ),
        PlatformError::Unavailable(reason) => {
            FeedError::new(FeedErrorCategory::Network, "service_unavailable", reason)
        }
        PlatformError::Http { status, message } => {
            let category = classify_http_status(status);
            let code = match category {
                FeedErrorCategory::Auth => "unauthorized",
                FeedErrorCategory::NotFound => "not_found",
                FeedErrorCategory::RateLimited => "rate_limited",
                FeedErrorCategory::Config => "request_rejected",
                FeedErrorCategory::Network => "service_unavailable",
                FeedErrorCategory::Serialization | FeedErrorCategory::Internal => "http_error",
            };
            FeedError::new(category, code, format!("http {status}: {message}"))
        }
        PlatformError::RateLimited { retry_after } => {
            let err = FeedError::new(
                FeedErrorCategory::RateLimited,
                "rate_limited",
                "rate limited by the messaging backend",
            );
            match retry_after {
                Some(after) => err.with_retry_after(after),
                None => err,
            }
        }
        PlatformError::Decode(reason) => {
            FeedError::new(FeedErrorCategory::Serialization, "decode_failed", reason)
        }
    }
}
