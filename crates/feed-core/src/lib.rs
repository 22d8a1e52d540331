//! Core contract for the real-time conversation feed.
//!
//! This crate defines the command/event protocol, the message list
//! reconciler, the subscription lifecycle model, row normalization, retry
//! policy, and common error/channel abstractions. It performs no I/O.

/// Async command/event channel primitives.
pub mod channel;
/// Stable feed error types and HTTP classification helpers.
pub mod error;
/// Row-change and send-outcome normalization.
pub mod normalization;
/// Bounded backoff policy.
pub mod retry;
/// Realtime subscription lifecycle state machine.
pub mod state_machine;
/// Message list reconciler.
pub mod timeline;
/// Protocol types (commands, events, messages, conversations).
pub mod types;

pub use channel::{EventStream, FeedChannelError, FeedChannels};
pub use error::{FeedError, FeedErrorCategory, classify_http_status};
pub use normalization::{SendOutcome, normalize_row_change, normalize_send_outcome};
pub use retry::RetryPolicy;
pub use state_machine::{SubscriptionState, SubscriptionStateMachine};
pub use timeline::{MergeOutcome, MessageTimeline, TimelineMergeError};
pub use types::{
    Activation, ConnectionStatus, Conversation, ConversationKind, FeedCommand, FeedEvent,
    FeedItem, FeedTuning, MarketRole, Message, Participant, PendingMessage, RemoteEvent,
    RemoteEventKind, RowChange, SendAck,
};
