//! Collaborator seams for the conversation feed.
//!
//! The runtime only talks to the outside world through [`MessagingApi`] and
//! [`RealtimeTransport`]. The `memory` module provides in-process
//! implementations with fault injection.

use std::time::Duration;

use async_trait::async_trait;
use feed_core::{Conversation, Message, Participant, RowChange};
use thiserror::Error;
use tokio::sync::mpsc;

pub mod memory;

pub use memory::{InMemoryMessagingApi, InMemoryRealtimeHub};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("http status {status}: {message}")]
    Http { status: u16, message: String },
    /// HTTP 429 with the parsed `Retry-After` value, when the server sent one.
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("response decode failure: {0}")]
    Decode(String),
}

/// Create-message request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub conversation_id: String,
    pub sender_id: String,
    pub body: String,
}

/// REST-style messaging API.
#[async_trait]
pub trait MessagingApi: Send + Sync {
    /// Conversations visible to the signed-in user.
    async fn list_conversations(&self, limit: u16) -> Result<Vec<Conversation>, PlatformError>;

    /// Latest `limit` messages of a conversation, in either order.
    async fn list_messages(
        &self,
        conversation_id: &str,
        limit: u16,
    ) -> Result<Vec<Message>, PlatformError>;

    /// Persist a message and return it with its backend ID and timestamp.
    async fn create_message(&self, message: NewMessage) -> Result<Message, PlatformError>;

    async fn list_participants(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Participant>, PlatformError>;
}

/// Open publish/subscribe channel delivering row changes.
#[derive(Debug)]
pub struct RealtimeChannel {
    name: String,
    changes: mpsc::UnboundedReceiver<RowChange>,
}

impl RealtimeChannel {
    pub fn new(name: impl Into<String>, changes: mpsc::UnboundedReceiver<RowChange>) -> Self {
        Self {
            name: name.into(),
            changes,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next row change; `None` once the transport dropped the channel.
    pub async fn next_change(&mut self) -> Option<RowChange> {
        self.changes.recv().await
    }
}

/// Publish/subscribe transport keyed by channel name.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<RealtimeChannel, PlatformError>;

    async fn unsubscribe(&self, channel: RealtimeChannel) -> Result<(), PlatformError>;
}

/// Channel name carrying row changes for one conversation.
pub fn message_channel_name(conversation_id: &str) -> String {
    format!("messages:{conversation_id}")
}
