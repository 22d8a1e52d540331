//! Single-writer runtime for the conversation feed.
//!
//! [`spawn_runtime`] starts one task that owns the conversation store, the
//! message timeline, the realtime subscription and the send coordinator.
//! Commands come in through [`FeedRuntimeHandle::send`]; every state change
//! goes out as a [`feed_core::FeedEvent`]. [`view::FeedView`] folds those
//! events into a render-ready snapshot.

pub mod config;
pub mod conversations;
pub mod error;
mod runtime;
pub mod send;
pub mod subscription;
pub mod view;

pub use config::FeedRuntimeConfig;
pub use conversations::{ConversationStore, display_title};
pub use runtime::{FeedRuntimeHandle, spawn_runtime};
pub use send::{SendCoordinator, SendSignal};
pub use subscription::{RealtimeSignal, SubscriptionManager};
pub use view::{FeedSnapshot, FeedView};
