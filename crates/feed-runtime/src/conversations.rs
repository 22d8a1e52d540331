use feed_core::{Activation, Conversation, ConversationKind, Participant};
use tracing::debug;

/// Conversation list plus the active selection and its participants.
#[derive(Debug, Clone, Default)]
pub struct ConversationStore {
    conversations: Vec<Conversation>,
    active: Option<Activation>,
    participants: Vec<Participant>,
    next_epoch: u64,
}

impl ConversationStore {
    /// Conversations ordered by last activity, newest first.
    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    /// Replace the list with a fetched one.
    pub fn replace(&mut self, mut conversations: Vec<Conversation>) {
        conversations.sort_by(|a, b| {
            b.last_activity_ms
                .cmp(&a.last_activity_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        conversations.dedup_by(|a, b| a.id == b.id);
        debug!(conversation_count = conversations.len(), "conversation list replaced");
        self.conversations = conversations;
    }

    pub fn active(&self) -> Option<&Activation> {
        self.active.as_ref()
    }

    pub fn is_current(&self, activation: &Activation) -> bool {
        self.active.as_ref() == Some(activation)
    }

    /// Select a conversation and mint its activation.
    ///
    /// Reselecting the active conversation mints a fresh epoch as well.
    pub fn set_active(&mut self, conversation_id: &str) -> Activation {
        self.next_epoch += 1;
        let activation = Activation::new(conversation_id, self.next_epoch);
        self.participants.clear();
        self.active = Some(activation.clone());
        activation
    }

    /// Navigate away. Returns the activation that was current.
    pub fn clear_active(&mut self) -> Option<Activation> {
        self.participants.clear();
        self.active.take()
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    /// Store participants for `activation`; `false` when the response is stale.
    pub fn set_participants(
        &mut self,
        activation: &Activation,
        participants: Vec<Participant>,
    ) -> bool {
        if !self.is_current(activation) {
            debug!(
                conversation_id = %activation.conversation_id,
                epoch = activation.epoch,
                "discarding stale participant list"
            );
            return false;
        }
        self.participants = participants
            .into_iter()
            .filter(|participant| participant.conversation_id == activation.conversation_id)
            .collect();
        true
    }
}

/// Human-readable title for a conversation row.
pub fn display_title(
    conversation: &Conversation,
    participants: &[Participant],
    own_user_id: &str,
) -> String {
    if let Some(title) = conversation
        .title
        .as_deref()
        .map(str::trim)
        .filter(|title| !title.is_empty())
    {
        return title.to_owned();
    }

    if let (Some(context_type), Some(context_id)) = (
        conversation.context_type.as_deref(),
        conversation.context_id.as_deref(),
    ) {
        return format!("{} {context_id}", context_label(context_type));
    }

    let others: Vec<&str> = participants
        .iter()
        .filter(|participant| {
            participant.conversation_id == conversation.id && participant.user_id != own_user_id
        })
        .map(participant_label)
        .collect();
    if !others.is_empty() {
        return others.join(", ");
    }

    match conversation.kind {
        ConversationKind::Direct => "Direct conversation",
        ConversationKind::Group => "Group conversation",
        ConversationKind::Contextual => "Conversation",
    }
    .to_owned()
}

/// Display name, falling back to the user ID.
pub fn participant_label(participant: &Participant) -> &str {
    participant
        .display_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(&participant.user_id)
}

fn context_label(context_type: &str) -> String {
    match context_type.to_ascii_lowercase().as_str() {
        "rfq" => "RFQ".to_owned(),
        "order" => "Order".to_owned(),
        "tender" => "Tender".to_owned(),
        other => {
            let mut chars = other.chars();
            chars
                .next()
                .map(|first| first.to_uppercase().chain(chars).collect())
                .unwrap_or_default()
        }
    }
}
