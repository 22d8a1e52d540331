use std::time::Duration;

use feed_core::{FeedTuning, MessageTimeline, RetryPolicy, timeline::DEFAULT_MAX_ITEMS};

pub const DEFAULT_CONVERSATION_LIMIT: u16 = 50;
pub const DEFAULT_PAGE_SIZE: u16 = 50;
pub const DEFAULT_FALLBACK_DELAY: Duration = Duration::from_millis(2_000);
pub const DEFAULT_DISCONNECTED_FALLBACK_DELAY: Duration = Duration::from_millis(750);
pub const DEFAULT_PERSIST_TIMEOUT: Duration = Duration::from_secs(15);

const COMMAND_BUFFER: usize = 128;
const EVENT_BUFFER: usize = 512;

/// Resolved runtime settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedRuntimeConfig {
    /// Signed-in user; used as the sender of local messages.
    pub own_user_id: String,
    pub conversation_limit: u16,
    /// Latest-page size, always in `1..=100`.
    pub page_size: u16,
    pub timeline_max_items: usize,
    pub fallback_delay: Duration,
    pub disconnected_fallback_delay: Duration,
    pub persist_timeout: Duration,
    pub subscribe_retry: RetryPolicy,
    pub command_buffer: usize,
    pub event_buffer: usize,
}

impl FeedRuntimeConfig {
    pub fn new(own_user_id: impl Into<String>) -> Self {
        Self {
            own_user_id: own_user_id.into(),
            conversation_limit: DEFAULT_CONVERSATION_LIMIT,
            page_size: DEFAULT_PAGE_SIZE,
            timeline_max_items: DEFAULT_MAX_ITEMS,
            fallback_delay: DEFAULT_FALLBACK_DELAY,
            disconnected_fallback_delay: DEFAULT_DISCONNECTED_FALLBACK_DELAY,
            persist_timeout: DEFAULT_PERSIST_TIMEOUT,
            subscribe_retry: RetryPolicy::default(),
            command_buffer: COMMAND_BUFFER,
            event_buffer: EVENT_BUFFER,
        }
    }

    /// Apply the values present in `tuning`.
    pub fn with_tuning(mut self, tuning: FeedTuning) -> Self {
        if let Some(limit) = tuning.conversation_limit {
            self.conversation_limit = limit.max(1);
        }
        if let Some(page_size) = tuning.page_size {
            self.page_size = MessageTimeline::bounded_page_limit(page_size, page_size);
        }
        if let Some(max_items) = tuning.timeline_max_items {
            self.timeline_max_items = max_items.max(1);
        }
        if let Some(ms) = tuning.fallback_delay_ms {
            self.fallback_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = tuning.disconnected_fallback_delay_ms {
            self.disconnected_fallback_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = tuning.persist_timeout_ms {
            self.persist_timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = tuning.subscribe_max_attempts {
            self.subscribe_retry = self.subscribe_retry.with_max_attempts(attempts);
        }
        self
    }
}
