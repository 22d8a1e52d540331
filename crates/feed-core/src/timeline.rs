use std::collections::HashSet;

use thiserror::Error;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::types::{Activation, FeedItem, Message, PendingMessage, RemoteEvent, RemoteEventKind};

/// Default retention cap for confirmed entries.
pub const DEFAULT_MAX_ITEMS: usize = 1_200;

/// Errors that can occur while applying timeline operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimelineMergeError {
    /// An operation referenced a local ID that is not pending.
    #[error("pending entry with local_id '{0}' was not found")]
    MissingLocal(String),
    /// An operation targeted a conversation selection that is no longer active.
    #[error("conversation '{0}' is not the active conversation")]
    InactiveConversation(String),
}

/// Result of one reconciler mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// A new confirmed entry was inserted.
    Inserted,
    /// An existing confirmed entry changed.
    Updated,
    /// The input was already reflected in the list.
    Duplicate,
    /// The confirmed portion was replaced by a fetched page.
    Replaced { count: usize },
    /// A fetched page was merged into the list.
    Merged { inserted: usize, updated: usize },
    /// An optimistic entry was confirmed.
    Confirmed { retired: bool, inserted: bool },
    /// The input belongs to a conversation selection that is not active.
    Stale,
}

impl MergeOutcome {
    /// Whether the visible list may have changed.
    pub fn changed(&self) -> bool {
        match self {
            Self::Inserted | Self::Updated | Self::Replaced { .. } => true,
            Self::Merged { inserted, updated } => inserted + updated > 0,
            Self::Confirmed { retired, inserted } => *retired || *inserted,
            Self::Duplicate | Self::Stale => false,
        }
    }
}

/// Ordered, deduplicated message list for the active conversation.
///
/// Confirmed entries are kept sorted by `(created_at_ms, id)`; pending
/// entries follow them in submission order.
#[derive(Debug, Clone)]
pub struct MessageTimeline {
    active: Option<Activation>,
    confirmed: Vec<Message>,
    known_ids: HashSet<String>,
    /// IDs that arrived through realtime or confirmation since activation.
    live_ids: HashSet<String>,
    pending: Vec<PendingMessage>,
    next_sequence: u64,
    max_items: usize,
}

impl Default for MessageTimeline {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ITEMS)
    }
}

impl MessageTimeline {
    /// Create a timeline with a confirmed-entry cap (`max_items >= 1`).
    pub fn new(max_items: usize) -> Self {
        Self {
            active: None,
            confirmed: Vec::new(),
            known_ids: HashSet::new(),
            live_ids: HashSet::new(),
            pending: Vec::new(),
            next_sequence: 0,
            max_items: max_items.max(1),
        }
    }

    pub fn active(&self) -> Option<&Activation> {
        self.active.as_ref()
    }

    pub fn is_current(&self, activation: &Activation) -> bool {
        self.active.as_ref() == Some(activation)
    }

    fn accepts(&self, conversation_id: &str) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| active.conversation_id == conversation_id)
    }

    /// Reset the list for a new conversation selection.
    pub fn activate(&mut self, activation: Activation) {
        debug!(
            conversation_id = %activation.conversation_id,
            epoch = activation.epoch,
            "timeline activated"
        );
        self.clear();
        self.active = Some(activation);
    }

    /// Drop the active selection and its list.
    pub fn deactivate(&mut self) {
        self.clear();
        self.active = None;
    }

    pub fn confirmed(&self) -> &[Message] {
        &self.confirmed
    }

    pub fn pending(&self) -> &[PendingMessage] {
        &self.pending
    }

    pub fn len(&self) -> usize {
        self.confirmed.len() + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_message(&self, message_id: &str) -> bool {
        self.known_ids.contains(message_id)
    }

    pub fn is_pending(&self, local_id: &str) -> bool {
        self.pending.iter().any(|entry| entry.local_id == local_id)
    }

    /// Current items in display order.
    pub fn snapshot(&self) -> Vec<FeedItem> {
        self.confirmed
            .iter()
            .cloned()
            .map(FeedItem::Confirmed)
            .chain(self.pending.iter().cloned().map(FeedItem::Pending))
            .collect()
    }

    /// Replace the confirmed portion with the latest fetched page.
    ///
    /// Entries delivered live since activation survive the replacement, so an
    /// initial fetch resolving after realtime events never drops them.
    pub fn load_initial(&mut self, activation: &Activation, page: Vec<Message>) -> MergeOutcome {
        if !self.is_current(activation) {
            debug!(
                conversation_id = %activation.conversation_id,
                epoch = activation.epoch,
                "discarding stale initial page"
            );
            return MergeOutcome::Stale;
        }

        let retained: Vec<Message> = std::mem::take(&mut self.confirmed)
            .into_iter()
            .filter(|message| self.live_ids.contains(&message.id))
            .collect();
        self.known_ids.clear();

        for message in self.accept_page(page) {
            self.upsert(message);
        }
        for message in retained {
            if !self.known_ids.contains(&message.id) {
                self.insert_sorted(message);
            } else if message.is_deleted() {
                self.update_existing(message);
            }
        }

        self.trim_to_max();
        MergeOutcome::Replaced {
            count: self.confirmed.len(),
        }
    }

    /// Merge a re-fetched page without removing anything.
    pub fn merge_page(&mut self, activation: &Activation, page: Vec<Message>) -> MergeOutcome {
        if !self.is_current(activation) {
            debug!(
                conversation_id = %activation.conversation_id,
                epoch = activation.epoch,
                "discarding stale page merge"
            );
            return MergeOutcome::Stale;
        }

        let mut inserted = 0;
        let mut updated = 0;
        for message in self.accept_page(page) {
            match self.upsert(message) {
                MergeOutcome::Inserted => inserted += 1,
                MergeOutcome::Updated => updated += 1,
                _ => {}
            }
        }

        self.trim_to_max();
        MergeOutcome::Merged { inserted, updated }
    }

    /// Apply one realtime insert/update.
    pub fn apply_remote_event(&mut self, event: RemoteEvent) -> MergeOutcome {
        let RemoteEvent { kind, message } = event;
        if !self.accepts(&message.conversation_id) {
            debug!(
                conversation_id = %message.conversation_id,
                message_id = %message.id,
                "discarding realtime event for inactive conversation"
            );
            return MergeOutcome::Stale;
        }

        self.live_ids.insert(message.id.clone());
        let outcome = match kind {
            RemoteEventKind::Insert if self.known_ids.contains(&message.id) => {
                trace!(message_id = %message.id, "duplicate insert ignored");
                MergeOutcome::Duplicate
            }
            RemoteEventKind::Insert => {
                self.insert_sorted(message);
                MergeOutcome::Inserted
            }
            RemoteEventKind::Update if self.known_ids.contains(&message.id) => {
                if self.update_existing(message) {
                    MergeOutcome::Updated
                } else {
                    MergeOutcome::Duplicate
                }
            }
            RemoteEventKind::Update => {
                debug!(message_id = %message.id, "update for unknown message applied as insert");
                self.insert_sorted(message);
                MergeOutcome::Inserted
            }
        };

        self.trim_to_max();
        outcome
    }

    /// Append a pending entry for a local send.
    pub fn apply_optimistic(
        &mut self,
        activation: &Activation,
        sender_id: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<PendingMessage, TimelineMergeError> {
        if !self.is_current(activation) {
            return Err(TimelineMergeError::InactiveConversation(
                activation.conversation_id.clone(),
            ));
        }

        let pending = PendingMessage {
            local_id: Uuid::new_v4().to_string(),
            conversation_id: activation.conversation_id.clone(),
            sender_id: sender_id.into(),
            body: body.into(),
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        self.pending.push(pending.clone());
        Ok(pending)
    }

    /// Retire a pending entry in favour of its backend counterpart.
    pub fn confirm_optimistic(&mut self, local_id: &str, message: Message) -> MergeOutcome {
        if !self.accepts(&message.conversation_id) {
            debug!(
                %local_id,
                conversation_id = %message.conversation_id,
                "discarding confirmation for inactive conversation"
            );
            return MergeOutcome::Stale;
        }

        let retired = match self.pending_position(local_id) {
            Some(index) => {
                self.pending.remove(index);
                true
            }
            None => {
                debug!(%local_id, message_id = %message.id, "confirmation without pending entry");
                false
            }
        };

        let inserted = matches!(
            self.apply_remote_event(RemoteEvent::insert(message)),
            MergeOutcome::Inserted
        );
        MergeOutcome::Confirmed { retired, inserted }
    }

    /// Remove a pending entry after a failed send and hand it back.
    pub fn fail_optimistic(
        &mut self,
        local_id: &str,
    ) -> Result<PendingMessage, TimelineMergeError> {
        let index = self
            .pending_position(local_id)
            .ok_or_else(|| TimelineMergeError::MissingLocal(local_id.to_owned()))?;
        Ok(self.pending.remove(index))
    }

    /// Clamp a requested page size against safety and server caps.
    ///
    /// The result is always in `1..=100`.
    pub fn bounded_page_limit(requested: u16, server_cap: u16) -> u16 {
        let safe_requested = requested.max(1);
        let safe_cap = server_cap.max(1);
        safe_requested.min(safe_cap).min(100)
    }

    fn clear(&mut self) {
        self.confirmed.clear();
        self.known_ids.clear();
        self.live_ids.clear();
        self.pending.clear();
    }

    fn accept_page(&self, page: Vec<Message>) -> Vec<Message> {
        page.into_iter()
            .filter(|message| {
                let accepted = self.accepts(&message.conversation_id);
                if !accepted {
                    warn!(
                        conversation_id = %message.conversation_id,
                        message_id = %message.id,
                        "page contained message from another conversation"
                    );
                }
                accepted
            })
            .collect()
    }

    fn upsert(&mut self, message: Message) -> MergeOutcome {
        if !self.known_ids.contains(&message.id) {
            self.insert_sorted(message);
            MergeOutcome::Inserted
        } else if self.update_existing(message) {
            MergeOutcome::Updated
        } else {
            MergeOutcome::Duplicate
        }
    }

    /// Returns `false` when the stored entry already matched.
    fn update_existing(&mut self, mut incoming: Message) -> bool {
        let Some(index) = self.position(&incoming.id) else {
            self.insert_sorted(incoming);
            return true;
        };
        let existing = &self.confirmed[index];

        // Deletion is terminal and never moves the entry.
        if existing.is_deleted() && !incoming.is_deleted() {
            incoming.body = None;
            incoming.deleted_at_ms = existing.deleted_at_ms;
        }
        if incoming.is_deleted() {
            incoming.created_at_ms = existing.created_at_ms;
        }

        if *existing == incoming {
            return false;
        }

        if existing.created_at_ms == incoming.created_at_ms {
            self.confirmed[index] = incoming;
        } else {
            self.confirmed.remove(index);
            let at = self.sorted_position(&incoming);
            self.confirmed.insert(at, incoming);
        }
        true
    }

    fn insert_sorted(&mut self, message: Message) {
        let at = self.sorted_position(&message);
        self.known_ids.insert(message.id.clone());
        self.confirmed.insert(at, message);
    }

    fn sorted_position(&self, message: &Message) -> usize {
        let key = (message.created_at_ms, message.id.as_str());
        self.confirmed
            .partition_point(|it| (it.created_at_ms, it.id.as_str()) < key)
    }

    fn position(&self, message_id: &str) -> Option<usize> {
        self.confirmed.iter().position(|it| it.id == message_id)
    }

    fn pending_position(&self, local_id: &str) -> Option<usize> {
        self.pending.iter().position(|it| it.local_id == local_id)
    }

    fn trim_to_max(&mut self) {
        if self.confirmed.len() <= self.max_items {
            return;
        }

        let excess = self.confirmed.len() - self.max_items;
        for message in self.confirmed.drain(0..excess) {
            self.known_ids.remove(&message.id);
            self.live_ids.remove(&message.id);
        }
    }
}
