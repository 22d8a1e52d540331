//! Render-ready state reducer over feed events.

use feed_core::{
    ConnectionStatus, Conversation, FeedCommand, FeedEvent, FeedItem, Participant, SendAck,
};
use tracing::{debug, trace, warn};

use crate::conversations::{display_title, participant_label};

const NO_SELECTION_STATUS: &str = "No conversation selected";
const DELETED_BODY: &str = "Message deleted";
const OWN_SENDER_LABEL: &str = "You";

/// Conversation list row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRow {
    pub conversation_id: String,
    pub title: String,
    pub last_activity_ms: u64,
    pub is_selected: bool,
}

/// Message list row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRow {
    /// Backend ID for confirmed rows, local ID for pending ones.
    pub key: String,
    pub sender_label: String,
    pub body: String,
    pub is_own: bool,
    pub is_pending: bool,
    pub is_deleted: bool,
}

/// Full view snapshot produced after each event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSnapshot {
    pub conversations: Vec<ConversationRow>,
    pub messages: Vec<MessageRow>,
    pub selected_conversation_id: Option<String>,
    pub status_text: String,
    pub error_text: Option<String>,
    pub composer_text: String,
    /// Set when the tail of the list changed since the last acknowledgement.
    pub scroll_to_bottom: bool,
    pub can_send: bool,
}

/// Mutable view state fed by runtime events and composer input.
#[derive(Debug, Clone)]
pub struct FeedView {
    own_user_id: String,
    conversations: Vec<Conversation>,
    selected: Option<String>,
    participants: Vec<Participant>,
    items: Vec<FeedItem>,
    connection: Option<ConnectionStatus>,
    error_text: Option<String>,
    composer_text: String,
    scroll_to_bottom: bool,
}

impl FeedView {
    pub fn new(own_user_id: impl Into<String>) -> Self {
        Self {
            own_user_id: own_user_id.into(),
            conversations: Vec::new(),
            selected: None,
            participants: Vec::new(),
            items: Vec::new(),
            connection: None,
            error_text: None,
            composer_text: String::new(),
            scroll_to_bottom: false,
        }
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        FeedSnapshot {
            conversations: self.conversation_rows(),
            messages: self.message_rows(),
            selected_conversation_id: self.selected.clone(),
            status_text: self.status_text().to_owned(),
            error_text: self.error_text.clone(),
            composer_text: self.composer_text.clone(),
            scroll_to_bottom: self.scroll_to_bottom,
            can_send: self.selected.is_some() && !self.composer_text.trim().is_empty(),
        }
    }

    pub fn selected_conversation_id(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn set_composer_text(&mut self, text: impl Into<String>) {
        self.composer_text = text.into();
    }

    /// Command for the current composer text, when there is something to send.
    ///
    /// The composer is cleared once the runtime reports `SendStarted`.
    pub fn submit(&self) -> Option<FeedCommand> {
        if self.selected.is_none() || self.composer_text.trim().is_empty() {
            return None;
        }
        Some(FeedCommand::SendMessage {
            body: self.composer_text.clone(),
        })
    }

    /// The renderer scrolled to the newest row.
    pub fn acknowledge_scroll(&mut self) {
        self.scroll_to_bottom = false;
    }

    pub fn clear_error(&mut self) {
        self.error_text = None;
    }

    /// Fold one runtime event into the view.
    pub fn handle_event(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::ConversationsUpdated { conversations } => {
                debug!(conversation_count = conversations.len(), "view conversation list replaced");
                self.conversations = conversations;
            }
            FeedEvent::ActiveConversationChanged { conversation_id } => {
                debug!(conversation_id = ?conversation_id, "view selection changed");
                self.selected = conversation_id;
                self.participants.clear();
                self.items.clear();
                self.connection = None;
                self.error_text = None;
                self.scroll_to_bottom = false;
            }
            FeedEvent::ParticipantsUpdated {
                conversation_id,
                participants,
            } => {
                if self.is_selected(&conversation_id) {
                    self.participants = participants;
                }
            }
            FeedEvent::TimelineSnapshot {
                conversation_id,
                items,
            } => {
                if !self.is_selected(&conversation_id) {
                    trace!(%conversation_id, "ignoring snapshot for unselected conversation");
                    return;
                }
                let previous_tail = self.items.last().map(item_key);
                let next_tail = items.last().map(item_key);
                if next_tail.is_some() && next_tail != previous_tail {
                    self.scroll_to_bottom = true;
                }
                self.items = items;
            }
            FeedEvent::ConnectionChanged {
                conversation_id,
                status,
            } => {
                if self.is_selected(&conversation_id) {
                    self.connection = Some(status);
                }
            }
            FeedEvent::SendStarted {
                conversation_id, ..
            } => {
                if self.is_selected(&conversation_id) {
                    self.composer_text.clear();
                    self.error_text = None;
                }
            }
            FeedEvent::SendAck(ack) => self.handle_send_ack(ack),
            FeedEvent::FetchFailed {
                conversation_id,
                code,
                message,
            } => match conversation_id {
                Some(conversation_id) if !self.is_selected(&conversation_id) => {}
                Some(_) => {
                    warn!(%code, %message, "message fetch failure surfaced to view");
                    self.error_text = Some(format!("could not load messages ({code})"));
                }
                None => {
                    warn!(%code, %message, "conversation fetch failure surfaced to view");
                    self.error_text = Some(format!("could not load conversations ({code})"));
                }
            },
        }
    }

    fn handle_send_ack(&mut self, ack: SendAck) {
        let Some(error_code) = ack.error_code else {
            debug!(local_id = %ack.local_id, "send acknowledgement succeeded");
            return;
        };
        warn!(
            local_id = %ack.local_id,
            error_code = %error_code,
            "send acknowledgement reported failure"
        );
        if !self.is_selected(&ack.conversation_id) {
            return;
        }
        self.error_text = Some(format!("send failed ({error_code})"));
        if let Some(restored) = ack.restored_input
            && self.composer_text.trim().is_empty()
        {
            self.composer_text = restored;
        }
    }

    fn is_selected(&self, conversation_id: &str) -> bool {
        self.selected.as_deref() == Some(conversation_id)
    }

    fn status_text(&self) -> &'static str {
        if self.selected.is_none() {
            return NO_SELECTION_STATUS;
        }
        match self.connection {
            None | Some(ConnectionStatus::Connecting) => "Connecting",
            Some(ConnectionStatus::Connected) => "Live",
            Some(ConnectionStatus::Disconnected) => "Offline, updates may be delayed",
        }
    }

    fn conversation_rows(&self) -> Vec<ConversationRow> {
        self.conversations
            .iter()
            .map(|conversation| {
                let is_selected = self.is_selected(&conversation.id);
                let participants: &[Participant] = if is_selected {
                    &self.participants
                } else {
                    &[]
                };
                ConversationRow {
                    conversation_id: conversation.id.clone(),
                    title: display_title(conversation, participants, &self.own_user_id),
                    last_activity_ms: conversation.last_activity_ms,
                    is_selected,
                }
            })
            .collect()
    }

    fn message_rows(&self) -> Vec<MessageRow> {
        self.items
            .iter()
            .map(|item| {
                let is_own = item.sender_id() == self.own_user_id;
                let (body, is_deleted) = match item {
                    FeedItem::Confirmed(message) if message.is_deleted() => {
                        (DELETED_BODY.to_owned(), true)
                    }
                    FeedItem::Confirmed(message) => {
                        (message.body.clone().unwrap_or_default(), false)
                    }
                    FeedItem::Pending(pending) => (pending.body.clone(), false),
                };
                MessageRow {
                    key: item_key(item),
                    sender_label: self.sender_label(item.sender_id(), is_own),
                    body,
                    is_own,
                    is_pending: item.is_pending(),
                    is_deleted,
                }
            })
            .collect()
    }

    fn sender_label(&self, sender_id: &str, is_own: bool) -> String {
        if is_own {
            return OWN_SENDER_LABEL.to_owned();
        }
        self.participants
            .iter()
            .find(|participant| participant.user_id == sender_id)
            .map(participant_label)
            .unwrap_or(sender_id)
            .to_owned()
    }
}

fn item_key(item: &FeedItem) -> String {
    match item {
        FeedItem::Confirmed(message) => message.id.clone(),
        FeedItem::Pending(pending) => pending.local_id.clone(),
    }
}
