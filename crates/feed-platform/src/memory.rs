use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use feed_core::{
    Conversation, Message, Participant, RemoteEventKind, RowChange,
    normalization::message_to_row,
};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::{
    MessagingApi, NewMessage, PlatformError, RealtimeChannel, RealtimeTransport,
    message_channel_name,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct HubState {
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<RowChange>>>,
    failing_subscribes: u32,
    rate_limited_subscribes: u32,
    rate_limit_hint: Option<Duration>,
    subscribe_calls: u64,
}

/// In-process publish/subscribe hub.
#[derive(Clone, Default)]
pub struct InMemoryRealtimeHub {
    state: Arc<Mutex<HubState>>,
}

impl InMemoryRealtimeHub {
    /// Deliver a change to every open subscriber of `channel`.
    ///
    /// Returns the number of subscribers reached.
    pub fn publish(&self, channel: &str, change: RowChange) -> usize {
        let mut state = lock(&self.state);
        let Some(senders) = state.subscribers.get_mut(channel) else {
            return 0;
        };
        senders.retain(|tx| tx.send(change.clone()).is_ok());
        trace!(%channel, delivered = senders.len(), "published row change");
        senders.len()
    }

    /// Publish a message row on its conversation channel.
    pub fn publish_message(&self, kind: RemoteEventKind, message: &Message) -> usize {
        let event_type = match kind {
            RemoteEventKind::Insert => "INSERT",
            RemoteEventKind::Update => "UPDATE",
        };
        self.publish(
            &message_channel_name(&message.conversation_id),
            RowChange {
                event_type: event_type.to_owned(),
                record: message_to_row(message),
                old_record: None,
            },
        )
    }

    /// Make the next `count` subscribe calls fail.
    pub fn fail_next_subscribes(&self, count: u32) {
        lock(&self.state).failing_subscribes = count;
    }

    /// Answer the next `count` subscribe calls with a rate-limit error.
    pub fn rate_limit_next_subscribes(&self, count: u32, retry_after: Option<Duration>) {
        let mut state = lock(&self.state);
        state.rate_limited_subscribes = count;
        state.rate_limit_hint = retry_after;
    }

    /// Close every open subscription of `channel` from the transport side.
    pub fn drop_channel(&self, channel: &str) {
        let removed = lock(&self.state).subscribers.remove(channel);
        debug!(
            %channel,
            dropped = removed.map(|senders| senders.len()).unwrap_or(0),
            "dropped realtime channel"
        );
    }

    /// Open subscribers of `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        let mut state = lock(&self.state);
        state
            .subscribers
            .get_mut(channel)
            .map(|senders| {
                senders.retain(|tx| !tx.is_closed());
                senders.len()
            })
            .unwrap_or(0)
    }

    /// Open subscribers across every channel.
    pub fn total_subscribers(&self) -> usize {
        let mut state = lock(&self.state);
        state
            .subscribers
            .values_mut()
            .map(|senders| {
                senders.retain(|tx| !tx.is_closed());
                senders.len()
            })
            .sum()
    }

    pub fn subscribe_calls(&self) -> u64 {
        lock(&self.state).subscribe_calls
    }
}

#[async_trait]
impl RealtimeTransport for InMemoryRealtimeHub {
    async fn subscribe(&self, channel: &str) -> Result<RealtimeChannel, PlatformError> {
        let mut state = lock(&self.state);
        state.subscribe_calls += 1;
        if state.rate_limited_subscribes > 0 {
            state.rate_limited_subscribes -= 1;
            return Err(PlatformError::RateLimited {
                retry_after: state.rate_limit_hint,
            });
        }
        if state.failing_subscribes > 0 {
            state.failing_subscribes -= 1;
            return Err(PlatformError::Unavailable(format!(
                "realtime channel '{channel}' refused"
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state
            .subscribers
            .entry(channel.to_owned())
            .or_default()
            .push(tx);
        Ok(RealtimeChannel::new(channel, rx))
    }

    async fn unsubscribe(&self, channel: RealtimeChannel) -> Result<(), PlatformError> {
        let name = channel.name().to_owned();
        drop(channel);
        let mut state = lock(&self.state);
        if let Some(senders) = state.subscribers.get_mut(&name) {
            senders.retain(|tx| !tx.is_closed());
        }
        Ok(())
    }
}

#[derive(Debug)]
struct ApiState {
    conversations: Vec<Conversation>,
    participants: Vec<Participant>,
    messages: Vec<Message>,
    clock_ms: u64,
    failing_sends: u32,
    failing_fetches: u32,
    response_delay: Duration,
    fetch_delay: Duration,
    echo_sends: bool,
    list_message_calls: u64,
}

/// In-process messaging API backed by vectors.
///
/// Persisted messages are published on the attached hub unless echoes are
/// suppressed. A response delay applies after persistence, modelling a slow
/// acknowledgement for a message the backend already stored.
#[derive(Clone)]
pub struct InMemoryMessagingApi {
    state: Arc<Mutex<ApiState>>,
    hub: Option<InMemoryRealtimeHub>,
}

impl InMemoryMessagingApi {
    /// Create an API whose backend clock starts at `clock_ms`.
    pub fn new(clock_ms: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(ApiState {
                conversations: Vec::new(),
                participants: Vec::new(),
                messages: Vec::new(),
                clock_ms,
                failing_sends: 0,
                failing_fetches: 0,
                response_delay: Duration::ZERO,
                fetch_delay: Duration::ZERO,
                echo_sends: true,
                list_message_calls: 0,
            })),
            hub: None,
        }
    }

    /// Publish persisted and remote messages on `hub`.
    pub fn with_hub(mut self, hub: InMemoryRealtimeHub) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn seed_conversation(&self, conversation: Conversation) {
        lock(&self.state).conversations.push(conversation);
    }

    pub fn seed_participant(&self, participant: Participant) {
        lock(&self.state).participants.push(participant);
    }

    /// Store a message without publishing it.
    pub fn seed_message(&self, message: Message) {
        let mut state = lock(&self.state);
        state.clock_ms = state.clock_ms.max(message.created_at_ms);
        state.messages.push(message);
    }

    pub fn fail_next_sends(&self, count: u32) {
        lock(&self.state).failing_sends = count;
    }

    pub fn fail_next_fetches(&self, count: u32) {
        lock(&self.state).failing_fetches = count;
    }

    pub fn set_response_delay(&self, delay: Duration) {
        lock(&self.state).response_delay = delay;
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        lock(&self.state).fetch_delay = delay;
    }

    /// Toggle publishing of created messages on the hub.
    pub fn set_echo_sends(&self, echo: bool) {
        lock(&self.state).echo_sends = echo;
    }

    /// Persist a message from another participant and publish it.
    pub fn insert_remote(&self, conversation_id: &str, sender_id: &str, body: &str) -> Message {
        let message = self.persist(conversation_id, sender_id, body);
        if let Some(hub) = &self.hub {
            hub.publish_message(RemoteEventKind::Insert, &message);
        }
        message
    }

    /// Soft-delete a stored message and publish the update.
    pub fn soft_delete(&self, message_id: &str) -> Option<Message> {
        let deleted = {
            let mut state = lock(&self.state);
            state.clock_ms += 10;
            let deleted_at_ms = state.clock_ms;
            let message = state
                .messages
                .iter_mut()
                .find(|message| message.id == message_id)?;
            message.body = None;
            message.deleted_at_ms = Some(deleted_at_ms);
            message.clone()
        };
        if let Some(hub) = &self.hub {
            hub.publish_message(RemoteEventKind::Update, &deleted);
        }
        Some(deleted)
    }

    pub fn messages_in(&self, conversation_id: &str) -> Vec<Message> {
        lock(&self.state)
            .messages
            .iter()
            .filter(|message| message.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    pub fn list_message_calls(&self) -> u64 {
        lock(&self.state).list_message_calls
    }

    fn persist(&self, conversation_id: &str, sender_id: &str, body: &str) -> Message {
        let mut state = lock(&self.state);
        state.clock_ms += 10;
        let message = Message {
            id: format!("m{}", state.messages.len() + 1),
            conversation_id: conversation_id.to_owned(),
            sender_id: sender_id.to_owned(),
            body: Some(body.to_owned()),
            created_at_ms: state.clock_ms,
            deleted_at_ms: None,
        };
        state.messages.push(message.clone());
        message
    }

    fn take_fetch_failure(&self) -> Result<Duration, PlatformError> {
        let mut state = lock(&self.state);
        if state.failing_fetches > 0 {
            state.failing_fetches -= 1;
            return Err(PlatformError::Http {
                status: 503,
                message: "fetch refused".to_owned(),
            });
        }
        Ok(state.fetch_delay)
    }
}

#[async_trait]
impl MessagingApi for InMemoryMessagingApi {
    async fn list_conversations(&self, limit: u16) -> Result<Vec<Conversation>, PlatformError> {
        let delay = self.take_fetch_failure()?;
        tokio::time::sleep(delay).await;
        let state = lock(&self.state);
        Ok(state
            .conversations
            .iter()
            .take(usize::from(limit))
            .cloned()
            .collect())
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
        limit: u16,
    ) -> Result<Vec<Message>, PlatformError> {
        lock(&self.state).list_message_calls += 1;
        let delay = self.take_fetch_failure()?;
        tokio::time::sleep(delay).await;

        let state = lock(&self.state);
        if !state
            .conversations
            .iter()
            .any(|conversation| conversation.id == conversation_id)
        {
            return Err(PlatformError::NotFound(conversation_id.to_owned()));
        }
        let mut page: Vec<Message> = state
            .messages
            .iter()
            .filter(|message| message.conversation_id == conversation_id)
            .cloned()
            .collect();
        // Newest first, like a `created_at desc limit n` query.
        page.sort_by(|a, b| (b.created_at_ms, &b.id).cmp(&(a.created_at_ms, &a.id)));
        page.truncate(usize::from(limit));
        Ok(page)
    }

    async fn create_message(&self, request: NewMessage) -> Result<Message, PlatformError> {
        let (echo, response_delay) = {
            let mut state = lock(&self.state);
            if state.failing_sends > 0 {
                state.failing_sends -= 1;
                return Err(PlatformError::Http {
                    status: 500,
                    message: "create message failed".to_owned(),
                });
            }
            (state.echo_sends, state.response_delay)
        };

        let message = self.persist(&request.conversation_id, &request.sender_id, &request.body);
        if echo && let Some(hub) = &self.hub {
            hub.publish_message(RemoteEventKind::Insert, &message);
        }
        tokio::time::sleep(response_delay).await;
        Ok(message)
    }

    async fn list_participants(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Participant>, PlatformError> {
        let state = lock(&self.state);
        Ok(state
            .participants
            .iter()
            .filter(|participant| participant.conversation_id == conversation_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feed_core::{ConversationKind, normalize_row_change};

    fn conversation(id: &str) -> Conversation {
        Conversation {
            id: id.to_owned(),
            kind: ConversationKind::Direct,
            title: None,
            context_type: None,
            context_id: None,
            last_activity_ms: 0,
        }
    }

    #[tokio::test]
    async fn hub_delivers_to_subscribers_of_the_channel_only() {
        let hub = InMemoryRealtimeHub::default();
        let mut a = hub.subscribe("messages:c1").await.expect("subscribe c1");
        let _b = hub.subscribe("messages:c2").await.expect("subscribe c2");

        let api = InMemoryMessagingApi::new(1_000).with_hub(hub.clone());
        api.seed_conversation(conversation("c1"));
        let sent = api.insert_remote("c1", "seller-9", "quote attached");

        let change = a.next_change().await.expect("c1 subscriber gets the row");
        let event = normalize_row_change(&change)
            .expect("row decodes")
            .expect("insert event");
        assert_eq!(event.message, sent);
        assert_eq!(hub.subscriber_count("messages:c2"), 1);
    }

    #[tokio::test]
    async fn unsubscribe_and_drop_close_channels() {
        let hub = InMemoryRealtimeHub::default();
        let first = hub.subscribe("messages:c1").await.expect("subscribe");
        let mut second = hub.subscribe("messages:c1").await.expect("subscribe");
        assert_eq!(hub.subscriber_count("messages:c1"), 2);

        hub.unsubscribe(first).await.expect("unsubscribe");
        assert_eq!(hub.subscriber_count("messages:c1"), 1);

        hub.drop_channel("messages:c1");
        assert_eq!(second.next_change().await, None);
        assert_eq!(hub.total_subscribers(), 0);
    }

    #[tokio::test]
    async fn injected_subscribe_failures_are_consumed() {
        let hub = InMemoryRealtimeHub::default();
        hub.fail_next_subscribes(1);

        let err = hub
            .subscribe("messages:c1")
            .await
            .expect_err("first subscribe fails");
        assert!(matches!(err, PlatformError::Unavailable(_)));
        hub.subscribe("messages:c1").await.expect("second subscribe works");
        assert_eq!(hub.subscribe_calls(), 2);
    }

    #[tokio::test]
    async fn rate_limited_subscribes_carry_the_retry_hint() {
        let hub = InMemoryRealtimeHub::default();
        hub.rate_limit_next_subscribes(1, Some(Duration::from_secs(3)));

        let err = hub
            .subscribe("messages:c1")
            .await
            .expect_err("first subscribe is throttled");
        assert_eq!(
            err,
            PlatformError::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            }
        );
        hub.subscribe("messages:c1").await.expect("second subscribe works");
    }

    #[tokio::test]
    async fn lists_latest_messages_newest_first() {
        let api = InMemoryMessagingApi::new(1_000);
        api.seed_conversation(conversation("c1"));
        for body in ["one", "two", "three"] {
            api.insert_remote("c1", "buyer-1", body);
        }

        let page = api.list_messages("c1", 2).await.expect("list works");
        let bodies: Vec<_> = page.iter().filter_map(|m| m.body.as_deref()).collect();
        assert_eq!(bodies, ["three", "two"]);

        let err = api
            .list_messages("missing", 10)
            .await
            .expect_err("unknown conversation");
        assert_eq!(err, PlatformError::NotFound("missing".into()));
    }

    #[tokio::test]
    async fn create_message_respects_failure_and_echo_settings() {
        let hub = InMemoryRealtimeHub::default();
        let mut channel = hub.subscribe("messages:c1").await.expect("subscribe");
        let api = InMemoryMessagingApi::new(1_000).with_hub(hub.clone());
        api.seed_conversation(conversation("c1"));

        api.fail_next_sends(1);
        let request = NewMessage {
            conversation_id: "c1".into(),
            sender_id: "buyer-1".into(),
            body: "hello".into(),
        };
        let err = api
            .create_message(request.clone())
            .await
            .expect_err("injected failure");
        assert!(matches!(err, PlatformError::Http { status: 500, .. }));
        assert!(api.messages_in("c1").is_empty());

        api.set_echo_sends(false);
        let stored = api.create_message(request).await.expect("send works");
        assert_eq!(stored.id, "m1");
        assert_eq!(stored.created_at_ms, 1_010);
        assert_eq!(api.messages_in("c1"), vec![stored]);
        let delivered = hub.publish(
            "messages:c1",
            RowChange {
                event_type: "DELETE".into(),
                record: serde_json::Value::Null,
                old_record: None,
            },
        );
        assert_eq!(delivered, 1);
        let change = channel.next_change().await.expect("only the manual publish");
        assert_eq!(change.event_type, "DELETE");
    }

    #[tokio::test]
    async fn soft_delete_publishes_update() {
        let hub = InMemoryRealtimeHub::default();
        let mut channel = hub.subscribe("messages:c1").await.expect("subscribe");
        let api = InMemoryMessagingApi::new(1_000).with_hub(hub);
        api.seed_conversation(conversation("c1"));
        let sent = api.insert_remote("c1", "buyer-1", "typo");
        channel.next_change().await.expect("insert row");

        let deleted = api.soft_delete(&sent.id).expect("message exists");
        assert_eq!(deleted.body, None);
        let change = channel.next_change().await.expect("update row");
        assert_eq!(change.event_type, "UPDATE");
        assert!(api.soft_delete("m404").is_none());
    }
}
