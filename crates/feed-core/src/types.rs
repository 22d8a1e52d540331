use serde::{Deserialize, Serialize};

/// Conversation shape as listed by the messaging API.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    /// One-to-one conversation between two parties.
    Direct,
    /// Conversation with more than two participants.
    Group,
    /// Conversation attached to an order, RFQ, or similar marketplace object.
    Contextual,
}

/// Marketplace role of a conversation participant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MarketRole {
    Buyer,
    Seller,
    Government,
}

/// Conversation metadata for the conversation list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    /// Stable opaque conversation ID.
    pub id: String,
    /// Conversation shape.
    pub kind: ConversationKind,
    /// Optional display title set server-side.
    pub title: Option<String>,
    /// Context object type, for example `order` or `rfq`.
    pub context_type: Option<String>,
    /// Context object ID.
    pub context_id: Option<String>,
    /// Last activity in milliseconds since Unix epoch.
    pub last_activity_ms: u64,
}

/// Participant metadata for one conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub conversation_id: String,
    pub user_id: String,
    pub display_name: Option<String>,
    pub role: Option<MarketRole>,
}

/// Backend-confirmed message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Backend-assigned message ID.
    pub id: String,
    /// Owning conversation ID.
    pub conversation_id: String,
    /// Sender user ID.
    pub sender_id: String,
    /// Message text; `None` once soft-deleted.
    pub body: Option<String>,
    /// Backend creation time in milliseconds since Unix epoch.
    pub created_at_ms: u64,
    /// Soft-delete time in milliseconds since Unix epoch.
    pub deleted_at_ms: Option<u64>,
}

impl Message {
    /// Whether the message has been soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at_ms.is_some()
    }
}

/// Locally synthesized message shown before backend confirmation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingMessage {
    /// Temporary client-side ID, never a backend ID.
    pub local_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub body: String,
    /// Local submission order within the timeline.
    pub sequence: u64,
}

/// One row of the reconciled message list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum FeedItem {
    Confirmed(Message),
    Pending(PendingMessage),
}

impl FeedItem {
    pub fn sender_id(&self) -> &str {
        match self {
            Self::Confirmed(message) => &message.sender_id,
            Self::Pending(pending) => &pending.sender_id,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

/// One selection of a conversation.
///
/// Every selection mints a new epoch, so results produced for an earlier
/// selection of the same conversation are told apart from current ones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Activation {
    pub conversation_id: String,
    pub epoch: u64,
}

impl Activation {
    pub fn new(conversation_id: impl Into<String>, epoch: u64) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            epoch,
        }
    }
}

/// Row change as delivered by the realtime transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RowChange {
    /// `INSERT`, `UPDATE` or `DELETE` (case-insensitive).
    pub event_type: String,
    /// New row state.
    pub record: serde_json::Value,
    /// Previous row state when the transport provides it.
    #[serde(default)]
    pub old_record: Option<serde_json::Value>,
}

/// Kind of a normalized realtime event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RemoteEventKind {
    Insert,
    Update,
}

/// Normalized realtime event applied by the reconciler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteEvent {
    pub kind: RemoteEventKind,
    pub message: Message,
}

impl RemoteEvent {
    pub fn insert(message: Message) -> Self {
        Self {
            kind: RemoteEventKind::Insert,
            message,
        }
    }

    pub fn update(message: Message) -> Self {
        Self {
            kind: RemoteEventKind::Update,
            message,
        }
    }
}

/// Realtime channel health for the active conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Channel is being opened.
    Connecting,
    /// Channel is open and delivering events.
    Connected,
    /// Channel could not be opened or dropped.
    Disconnected,
}

/// Optional runtime tuning values, usually parsed from the environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct FeedTuning {
    /// Conversation list limit for `ListConversations` without an explicit limit.
    pub conversation_limit: Option<u16>,
    /// Latest-page size for initial and fallback fetches.
    pub page_size: Option<u16>,
    /// Retention cap for confirmed timeline entries.
    pub timeline_max_items: Option<usize>,
    /// Fallback re-fetch delay while realtime is connected.
    pub fallback_delay_ms: Option<u64>,
    /// Fallback re-fetch delay while realtime is not connected.
    pub disconnected_fallback_delay_ms: Option<u64>,
    /// Upper bound for one create-message call.
    pub persist_timeout_ms: Option<u64>,
    /// Bounded number of attempts when opening a realtime channel.
    pub subscribe_max_attempts: Option<u32>,
}

/// User-driven command accepted by the feed runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum FeedCommand {
    /// Fetch the conversation list.
    ListConversations {
        /// Requested limit; runtime default when `None`.
        limit: Option<u16>,
    },
    /// Make a conversation active and load its timeline.
    SelectConversation { conversation_id: String },
    /// Navigate away from the active conversation.
    ClearSelection,
    /// Re-run the initial fetch for the active conversation.
    Refresh,
    /// Send a text message in the active conversation.
    SendMessage {
        /// Raw composer input.
        body: String,
    },
}

/// Acknowledgement for a send started with `FeedCommand::SendMessage`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendAck {
    /// Local ID of the optimistic entry.
    pub local_id: String,
    pub conversation_id: String,
    /// Backend message ID on success.
    pub message_id: Option<String>,
    /// Stable error code on failure.
    pub error_code: Option<String>,
    /// Original composer input to restore after a failure.
    pub restored_input: Option<String>,
}

/// Event emitted by the feed runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum FeedEvent {
    /// Full conversation list replacement, newest activity first.
    ConversationsUpdated { conversations: Vec<Conversation> },
    /// Active conversation changed (`None` after navigation away).
    ActiveConversationChanged { conversation_id: Option<String> },
    /// Participants for the active conversation.
    ParticipantsUpdated {
        conversation_id: String,
        participants: Vec<Participant>,
    },
    /// Reconciled timeline for the active conversation, in display order.
    TimelineSnapshot {
        conversation_id: String,
        items: Vec<FeedItem>,
    },
    /// Realtime channel status for the active conversation.
    ConnectionChanged {
        conversation_id: String,
        status: ConnectionStatus,
    },
    /// An optimistic entry was added and the composer should clear.
    SendStarted {
        local_id: String,
        conversation_id: String,
    },
    /// Outcome of a send.
    SendAck(SendAck),
    /// A fetch failed; the list may be incomplete or stale.
    FetchFailed {
        conversation_id: Option<String>,
        code: String,
        message: String,
    },
}
