use std::sync::Arc;

use feed_core::{
    Activation, ConnectionStatus, Conversation, EventStream, FeedChannelError, FeedChannels,
    FeedCommand, FeedError, FeedEvent, Message, MessageTimeline, Participant,
    normalization::normalize_fetch_error,
};
use feed_platform::{MessagingApi, RealtimeTransport};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    config::FeedRuntimeConfig,
    conversations::ConversationStore,
    error::map_platform_error,
    send::{SendCallback, SendCoordinator, SendSignal, SendTimings},
    subscription::{RealtimeSignal, SignalCallback, SubscriptionManager},
};

/// Cloneable handle for talking to a spawned feed runtime.
///
/// The runtime stops once every handle is dropped.
#[derive(Clone, Debug)]
pub struct FeedRuntimeHandle {
    channels: FeedChannels,
}

impl FeedRuntimeHandle {
    pub async fn send(&self, command: FeedCommand) -> Result<(), FeedChannelError> {
        self.channels.send_command(command).await
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }
}

/// Spawn the runtime task on the current tokio runtime.
pub fn spawn_runtime<A, T>(
    config: FeedRuntimeConfig,
    api: Arc<A>,
    transport: Arc<T>,
) -> FeedRuntimeHandle
where
    A: MessagingApi + ?Sized + 'static,
    T: RealtimeTransport + ?Sized + 'static,
{
    let (channels, command_rx) = FeedChannels::new(config.command_buffer, config.event_buffer);
    let runtime = FeedRuntime::new(config, channels.event_sender(), command_rx, api, transport);
    tokio::spawn(async move {
        runtime.run().await;
    });

    FeedRuntimeHandle { channels }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PagePurpose {
    /// First load, or a user refresh.
    Initial,
    /// Repair after an unconfirmed send.
    Fallback,
    /// Repair after the realtime channel dropped.
    CatchUp,
}

enum RuntimeMsg {
    ConversationsLoaded {
        request: u64,
        result: Result<Vec<Conversation>, FeedError>,
    },
    ParticipantsLoaded {
        activation: Activation,
        result: Result<Vec<Participant>, FeedError>,
    },
    PageLoaded {
        activation: Activation,
        purpose: PagePurpose,
        result: Result<Vec<Message>, FeedError>,
    },
    Realtime {
        activation: Activation,
        signal: RealtimeSignal,
    },
    Send(SendSignal),
}

struct FeedRuntime<A: ?Sized, T: ?Sized> {
    config: FeedRuntimeConfig,
    events: broadcast::Sender<FeedEvent>,
    command_rx: mpsc::Receiver<FeedCommand>,
    internal_tx: mpsc::UnboundedSender<RuntimeMsg>,
    internal_rx: mpsc::UnboundedReceiver<RuntimeMsg>,
    api: Arc<A>,
    store: ConversationStore,
    timeline: MessageTimeline,
    subscription: SubscriptionManager<T>,
    sends: SendCoordinator<A>,
    connection: ConnectionStatus,
    /// Cancellation scope of the current activation.
    scope: Option<CancellationToken>,
    conversation_request: u64,
}

impl<A, T> FeedRuntime<A, T>
where
    A: MessagingApi + ?Sized + 'static,
    T: RealtimeTransport + ?Sized + 'static,
{
    fn new(
        config: FeedRuntimeConfig,
        events: broadcast::Sender<FeedEvent>,
        command_rx: mpsc::Receiver<FeedCommand>,
        api: Arc<A>,
        transport: Arc<T>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let send_tx = internal_tx.clone();
        let on_send: SendCallback = Arc::new(move |signal| {
            let _ = send_tx.send(RuntimeMsg::Send(signal));
        });
        let sends = SendCoordinator::new(
            Arc::clone(&api),
            config.own_user_id.clone(),
            SendTimings {
                fallback_delay: config.fallback_delay,
                disconnected_fallback_delay: config.disconnected_fallback_delay,
                persist_timeout: config.persist_timeout,
            },
            on_send,
        );

        Self {
            timeline: MessageTimeline::new(config.timeline_max_items),
            subscription: SubscriptionManager::new(transport, config.subscribe_retry),
            config,
            events,
            command_rx,
            internal_tx,
            internal_rx,
            api,
            store: ConversationStore::default(),
            sends,
            connection: ConnectionStatus::Disconnected,
            scope: None,
            conversation_request: 0,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    let Some(command) = command else { break };
                    if let Err(err) = self.handle_command(command).await {
                        warn!(code = %err.code, message = %err.message, "command failed");
                        let conversation_id = self.active_conversation_id();
                        self.emit(normalize_fetch_error(conversation_id, err));
                    }
                }
                Some(msg) = self.internal_rx.recv() => {
                    if let Err(err) = self.handle_internal(msg) {
                        warn!(code = %err.code, message = %err.message, "internal update failed");
                    }
                }
            }
        }

        info!("command channel closed; feed runtime shutting down");
        if let Err(err) = self.release_activation().await {
            warn!(code = %err.code, "subscription release failed during shutdown");
        }
    }

    async fn handle_command(&mut self, command: FeedCommand) -> Result<(), FeedError> {
        match command {
            FeedCommand::ListConversations { limit } => {
                self.handle_list_conversations(limit);
                Ok(())
            }
            FeedCommand::SelectConversation { conversation_id } => {
                self.handle_select_conversation(conversation_id).await
            }
            FeedCommand::ClearSelection => self.handle_clear_selection().await,
            FeedCommand::Refresh => {
                self.handle_refresh();
                Ok(())
            }
            FeedCommand::SendMessage { body } => {
                self.handle_send_message(&body);
                Ok(())
            }
        }
    }

    fn handle_list_conversations(&mut self, limit: Option<u16>) {
        self.conversation_request += 1;
        let request = self.conversation_request;
        let limit = limit.unwrap_or(self.config.conversation_limit).max(1);
        let api = Arc::clone(&self.api);
        let tx = self.internal_tx.clone();
        debug!(request, limit, "listing conversations");

        tokio::spawn(async move {
            let result = api
                .list_conversations(limit)
                .await
                .map_err(map_platform_error);
            let _ = tx.send(RuntimeMsg::ConversationsLoaded { request, result });
        });
    }

    async fn handle_select_conversation(
        &mut self,
        conversation_id: String,
    ) -> Result<(), FeedError> {
        self.release_activation().await?;

        let activation = self.store.set_active(&conversation_id);
        info!(
            conversation_id = %activation.conversation_id,
            epoch = activation.epoch,
            "conversation selected"
        );
        self.timeline.activate(activation.clone());
        self.scope = Some(CancellationToken::new());
        self.emit(FeedEvent::ActiveConversationChanged {
            conversation_id: Some(conversation_id),
        });
        self.emit_timeline();

        let tx = self.internal_tx.clone();
        let on_signal: SignalCallback = Arc::new(move |activation, signal| {
            let _ = tx.send(RuntimeMsg::Realtime { activation, signal });
        });
        if let Some(status) = self
            .subscription
            .subscribe(activation.clone(), on_signal)
            .await?
        {
            self.set_connection(status);
        }

        self.spawn_page_fetch(&activation, PagePurpose::Initial);
        self.spawn_participants_fetch(&activation);
        Ok(())
    }

    async fn handle_clear_selection(&mut self) -> Result<(), FeedError> {
        let released = self.release_activation().await;
        if let Some(activation) = self.store.clear_active() {
            debug!(
                conversation_id = %activation.conversation_id,
                epoch = activation.epoch,
                "selection cleared"
            );
            self.timeline.deactivate();
            self.emit(FeedEvent::ActiveConversationChanged {
                conversation_id: None,
            });
        }
        released
    }

    fn handle_refresh(&mut self) {
        match self.timeline.active().cloned() {
            Some(activation) => self.spawn_page_fetch(&activation, PagePurpose::Initial),
            None => debug!("refresh ignored without an active conversation"),
        }
    }

    fn handle_send_message(&mut self, body: &str) {
        let Some(scope) = self.scope.clone() else {
            debug!("send ignored without an active conversation");
            return;
        };
        if let Some(pending) = self
            .sends
            .begin(&mut self.timeline, body, self.connection, &scope)
        {
            self.emit(FeedEvent::SendStarted {
                local_id: pending.local_id,
                conversation_id: pending.conversation_id,
            });
            self.emit_timeline();
        }
    }

    fn handle_internal(&mut self, msg: RuntimeMsg) -> Result<(), FeedError> {
        match msg {
            RuntimeMsg::ConversationsLoaded { request, result } => {
                if request != self.conversation_request {
                    debug!(request, "discarding superseded conversation list");
                    return Ok(());
                }
                match result {
                    Ok(conversations) => {
                        self.store.replace(conversations);
                        self.emit(FeedEvent::ConversationsUpdated {
                            conversations: self.store.conversations().to_vec(),
                        });
                    }
                    Err(err) => self.emit(normalize_fetch_error(None, err)),
                }
            }
            RuntimeMsg::ParticipantsLoaded { activation, result } => match result {
                Ok(participants) => {
                    if self.store.set_participants(&activation, participants) {
                        self.emit(FeedEvent::ParticipantsUpdated {
                            conversation_id: activation.conversation_id,
                            participants: self.store.participants().to_vec(),
                        });
                    }
                }
                Err(err) => self.report_fetch_failure(&activation, err),
            },
            RuntimeMsg::PageLoaded {
                activation,
                purpose,
                result,
            } => match result {
                Ok(page) => {
                    let outcome = match purpose {
                        PagePurpose::Initial => self.timeline.load_initial(&activation, page),
                        PagePurpose::Fallback | PagePurpose::CatchUp => {
                            self.timeline.merge_page(&activation, page)
                        }
                    };
                    debug!(
                        conversation_id = %activation.conversation_id,
                        epoch = activation.epoch,
                        ?purpose,
                        ?outcome,
                        "page applied"
                    );
                    if outcome.changed() {
                        self.emit_timeline();
                    }
                }
                Err(err) => self.report_fetch_failure(&activation, err),
            },
            RuntimeMsg::Realtime { activation, signal } => {
                self.handle_realtime(activation, signal)?;
            }
            RuntimeMsg::Send(SendSignal::Persisted {
                local_id,
                conversation_id,
                input,
                result,
            }) => {
                let completion = self.sends.complete(
                    &mut self.timeline,
                    &local_id,
                    &conversation_id,
                    input,
                    result,
                );
                self.emit(completion.ack);
                if completion.timeline_changed {
                    self.emit_timeline();
                }
            }
            RuntimeMsg::Send(SendSignal::FallbackDue {
                activation,
                local_id,
            }) => {
                if self.sends.fallback_due(&self.timeline, &activation, &local_id) {
                    info!(
                        conversation_id = %activation.conversation_id,
                        %local_id,
                        "send still unconfirmed; re-fetching latest page"
                    );
                    self.spawn_page_fetch(&activation, PagePurpose::Fallback);
                }
            }
            RuntimeMsg::Send(SendSignal::AckOverdue {
                activation,
                local_id,
            }) => {
                if self.sends.ack_overdue(&self.timeline, &activation, &local_id) {
                    self.spawn_page_fetch(&activation, PagePurpose::Fallback);
                }
            }
        }
        Ok(())
    }

    fn handle_realtime(
        &mut self,
        activation: Activation,
        signal: RealtimeSignal,
    ) -> Result<(), FeedError> {
        if !self.timeline.is_current(&activation) {
            trace!(
                conversation_id = %activation.conversation_id,
                epoch = activation.epoch,
                "discarding realtime signal for inactive selection"
            );
            return Ok(());
        }

        if let Some(status) = self.subscription.observe(&activation, &signal)? {
            self.set_connection(status);
        }
        match signal {
            RealtimeSignal::Event(event) => {
                let outcome = self.timeline.apply_remote_event(event);
                trace!(?outcome, "realtime event applied");
                if outcome.changed() {
                    self.emit_timeline();
                }
            }
            RealtimeSignal::Dropped => self.spawn_page_fetch(&activation, PagePurpose::CatchUp),
            RealtimeSignal::Opened | RealtimeSignal::OpenFailed(_) => {}
        }
        Ok(())
    }

    /// Cancel everything bound to the current activation and close its channel.
    async fn release_activation(&mut self) -> Result<(), FeedError> {
        if let Some(scope) = self.scope.take() {
            scope.cancel();
        }
        self.sends.cancel_timers();
        let released = self.subscription.unsubscribe().await?;
        if released {
            trace!("realtime channel released");
        }
        self.connection = ConnectionStatus::Disconnected;
        Ok(())
    }

    fn spawn_page_fetch(&self, activation: &Activation, purpose: PagePurpose) {
        let Some(scope) = self.scope.clone() else {
            return;
        };
        let api = Arc::clone(&self.api);
        let tx = self.internal_tx.clone();
        let activation = activation.clone();
        let conversation_id = activation.conversation_id.clone();
        let limit = self.config.page_size;
        debug!(%conversation_id, epoch = activation.epoch, ?purpose, limit, "fetching latest page");

        tokio::spawn(async move {
            tokio::select! {
                _ = scope.cancelled() => {
                    trace!(%conversation_id, ?purpose, "page fetch cancelled");
                }
                result = api.list_messages(&conversation_id, limit) => {
                    let _ = tx.send(RuntimeMsg::PageLoaded {
                        activation,
                        purpose,
                        result: result.map_err(map_platform_error),
                    });
                }
            }
        });
    }

    fn spawn_participants_fetch(&self, activation: &Activation) {
        let Some(scope) = self.scope.clone() else {
            return;
        };
        let api = Arc::clone(&self.api);
        let tx = self.internal_tx.clone();
        let activation = activation.clone();
        let conversation_id = activation.conversation_id.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = scope.cancelled() => {}
                result = api.list_participants(&conversation_id) => {
                    let _ = tx.send(RuntimeMsg::ParticipantsLoaded {
                        activation,
                        result: result.map_err(map_platform_error),
                    });
                }
            }
        });
    }

    fn report_fetch_failure(&self, activation: &Activation, err: FeedError) {
        if !self.timeline.is_current(activation) {
            debug!(
                conversation_id = %activation.conversation_id,
                epoch = activation.epoch,
                code = %err.code,
                "discarding failure for inactive selection"
            );
            return;
        }
        warn!(
            conversation_id = %activation.conversation_id,
            code = %err.code,
            "fetch failed"
        );
        self.emit(normalize_fetch_error(
            Some(activation.conversation_id.clone()),
            err,
        ));
    }

    fn set_connection(&mut self, status: ConnectionStatus) {
        let Some(conversation_id) = self.active_conversation_id() else {
            return;
        };
        if self.connection == status {
            return;
        }
        self.connection = status;
        self.emit(FeedEvent::ConnectionChanged {
            conversation_id,
            status,
        });
    }

    fn emit_timeline(&self) {
        let Some(activation) = self.timeline.active() else {
            return;
        };
        self.emit(FeedEvent::TimelineSnapshot {
            conversation_id: activation.conversation_id.clone(),
            items: self.timeline.snapshot(),
        });
    }

    fn active_conversation_id(&self) -> Option<String> {
        self.timeline
            .active()
            .map(|activation| activation.conversation_id.clone())
    }

    fn emit(&self, event: FeedEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use feed_core::{ConversationKind, FeedItem, FeedTuning, MarketRole, RemoteEventKind};
    use feed_platform::{InMemoryMessagingApi, InMemoryRealtimeHub};
    use tokio::time::timeout;

    struct Harness {
        handle: FeedRuntimeHandle,
        events: EventStream,
        api: InMemoryMessagingApi,
        hub: InMemoryRealtimeHub,
    }

    fn conversation(id: &str, last_activity_ms: u64) -> Conversation {
        Conversation {
            id: id.to_owned(),
            kind: ConversationKind::Contextual,
            title: None,
            context_type: Some("rfq".to_owned()),
            context_id: Some(format!("RFQ-{id}")),
            last_activity_ms,
        }
    }

    fn seeded(id: &str, created_at_ms: u64, sender: &str, body: &str) -> Message {
        Message {
            id: id.to_owned(),
            conversation_id: "c1".to_owned(),
            sender_id: sender.to_owned(),
            body: Some(body.to_owned()),
            created_at_ms,
            deleted_at_ms: None,
        }
    }

    fn start(config: FeedRuntimeConfig) -> Harness {
        let hub = InMemoryRealtimeHub::default();
        let api = InMemoryMessagingApi::new(1_000).with_hub(hub.clone());
        api.seed_conversation(conversation("c1", 500));
        api.seed_conversation(conversation("c2", 900));
        api.seed_participant(Participant {
            conversation_id: "c1".into(),
            user_id: "seller-9".into(),
            display_name: Some("Acme Supplies".into()),
            role: Some(MarketRole::Seller),
        });
        api.seed_message(seeded("m1", 100, "seller-9", "quote attached"));
        api.seed_message(seeded("m2", 200, "buyer-1", "thanks"));

        let handle = spawn_runtime(config, Arc::new(api.clone()), Arc::new(hub.clone()));
        let events = handle.subscribe();
        Harness {
            handle,
            events,
            api,
            hub,
        }
    }

    async fn next_event(events: &mut EventStream) -> FeedEvent {
        timeout(Duration::from_secs(30), events.recv())
            .await
            .expect("event timeout")
            .expect("event receive")
    }

    /// Skip events until `pick` accepts one.
    async fn wait_for<R>(
        events: &mut EventStream,
        mut pick: impl FnMut(&FeedEvent) -> Option<R>,
    ) -> R {
        loop {
            let event = next_event(events).await;
            if let Some(found) = pick(&event) {
                return found;
            }
        }
    }

    fn timeline_of(event: &FeedEvent) -> Option<Vec<FeedItem>> {
        match event {
            FeedEvent::TimelineSnapshot { items, .. } => Some(items.clone()),
            _ => None,
        }
    }

    fn labels(items: &[FeedItem]) -> Vec<String> {
        items
            .iter()
            .map(|item| match item {
                FeedItem::Confirmed(message) => message.id.clone(),
                FeedItem::Pending(pending) => format!("local:{}", pending.body),
            })
            .collect()
    }

    fn confirmed_count(items: &[FeedItem]) -> usize {
        items.iter().filter(|item| !item.is_pending()).count()
    }

    async fn select(harness: &mut Harness, conversation_id: &str) -> Vec<FeedItem> {
        harness
            .handle
            .send(FeedCommand::SelectConversation {
                conversation_id: conversation_id.to_owned(),
            })
            .await
            .expect("select enqueues");
        wait_for(&mut harness.events, |event| match event {
            FeedEvent::TimelineSnapshot { items, .. } if !items.is_empty() => Some(items.clone()),
            _ => None,
        })
        .await
    }

    /// Select and wait until both the first page and the channel are in.
    async fn select_connected(harness: &mut Harness, conversation_id: &str) -> Vec<FeedItem> {
        harness
            .handle
            .send(FeedCommand::SelectConversation {
                conversation_id: conversation_id.to_owned(),
            })
            .await
            .expect("select enqueues");

        let mut items = None;
        let mut connected = false;
        while items.is_none() || !connected {
            match next_event(&mut harness.events).await {
                FeedEvent::TimelineSnapshot { items: page, .. } if !page.is_empty() => {
                    items = Some(page)
                }
                FeedEvent::ConnectionChanged {
                    status: ConnectionStatus::Connected,
                    ..
                } => connected = true,
                _ => {}
            }
        }
        items.unwrap_or_default()
    }

    #[tokio::test(start_paused = true)]
    async fn lists_conversations_newest_activity_first() {
        let mut harness = start(FeedRuntimeConfig::new("buyer-1"));
        harness
            .handle
            .send(FeedCommand::ListConversations { limit: None })
            .await
            .expect("command enqueues");

        let conversations = wait_for(&mut harness.events, |event| match event {
            FeedEvent::ConversationsUpdated { conversations } => Some(conversations.clone()),
            _ => None,
        })
        .await;
        let ids: Vec<_> = conversations.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["c2", "c1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn selection_loads_page_participants_and_connects() {
        let mut harness = start(FeedRuntimeConfig::new("buyer-1"));
        harness
            .handle
            .send(FeedCommand::SelectConversation {
                conversation_id: "c1".into(),
            })
            .await
            .expect("select enqueues");

        assert_eq!(
            next_event(&mut harness.events).await,
            FeedEvent::ActiveConversationChanged {
                conversation_id: Some("c1".into())
            }
        );
        let mut saw_items = None;
        let mut saw_participants = false;
        let mut saw_connected = false;
        while saw_items.is_none() || !saw_participants || !saw_connected {
            match next_event(&mut harness.events).await {
                FeedEvent::TimelineSnapshot { items, .. } if !items.is_empty() => {
                    saw_items = Some(items)
                }
                FeedEvent::ParticipantsUpdated { participants, .. } => {
                    saw_participants = participants.len() == 1
                }
                FeedEvent::ConnectionChanged {
                    status: ConnectionStatus::Connected,
                    ..
                } => saw_connected = true,
                _ => {}
            }
        }
        assert_eq!(labels(&saw_items.unwrap_or_default()), ["m1", "m2"]);
        assert_eq!(harness.hub.subscriber_count("messages:c1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn confirmed_send_leaves_one_row_even_after_late_echo() {
        let mut harness = start(FeedRuntimeConfig::new("buyer-1"));
        harness.api.set_echo_sends(false);
        harness.api.set_response_delay(Duration::from_millis(300));
        select_connected(&mut harness, "c1").await;

        harness
            .handle
            .send(FeedCommand::SendMessage {
                body: "hello".into(),
            })
            .await
            .expect("send enqueues");

        let local_id = wait_for(&mut harness.events, |event| match event {
            FeedEvent::SendStarted { local_id, .. } => Some(local_id.clone()),
            _ => None,
        })
        .await;
        let pending = wait_for(&mut harness.events, timeline_of).await;
        assert_eq!(labels(&pending), ["m1", "m2", "local:hello"]);

        let ack = wait_for(&mut harness.events, |event| match event {
            FeedEvent::SendAck(ack) => Some(ack.clone()),
            _ => None,
        })
        .await;
        assert_eq!(ack.local_id, local_id);
        let message_id = ack.message_id.expect("send succeeded");
        let confirmed = wait_for(&mut harness.events, timeline_of).await;
        assert_eq!(labels(&confirmed), ["m1", "m2", message_id.as_str()]);

        tokio::time::sleep(Duration::from_millis(500)).await;
        let stored = harness
            .api
            .messages_in("c1")
            .into_iter()
            .find(|message| message.id == message_id)
            .expect("message persisted");
        assert_eq!(
            harness.hub.publish_message(RemoteEventKind::Insert, &stored),
            1
        );

        // The echo changes nothing, so the next snapshot comes from the
        // marker message published below.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let marker = harness.api.insert_remote("c1", "seller-9", "marker");
        let after = wait_for(&mut harness.events, timeline_of).await;
        assert_eq!(
            labels(&after),
            ["m1", "m2", message_id.as_str(), marker.id.as_str()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_persist_without_echo_is_repaired_by_fallback_fetch() {
        let mut harness = start(FeedRuntimeConfig::new("buyer-1"));
        harness.api.set_echo_sends(false);
        harness.api.set_response_delay(Duration::from_secs(10));
        select_connected(&mut harness, "c1").await;
        let calls_before = harness.api.list_message_calls();

        harness
            .handle
            .send(FeedCommand::SendMessage {
                body: "hello".into(),
            })
            .await
            .expect("send enqueues");

        let repaired = wait_for(&mut harness.events, |event| {
            timeline_of(event).filter(|items| confirmed_count(items) == 3)
        })
        .await;
        assert_eq!(labels(&repaired), ["m1", "m2", "m3", "local:hello"]);
        assert_eq!(harness.api.list_message_calls(), calls_before + 1);

        let after_ack = wait_for(&mut harness.events, timeline_of).await;
        assert_eq!(labels(&after_ack), ["m1", "m2", "m3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_send_restores_input_and_removes_entry() {
        let mut harness = start(FeedRuntimeConfig::new("buyer-1"));
        harness.api.fail_next_sends(1);
        select(&mut harness, "c1").await;

        harness
            .handle
            .send(FeedCommand::SendMessage {
                body: " final offer ".into(),
            })
            .await
            .expect("send enqueues");

        let ack = wait_for(&mut harness.events, |event| match event {
            FeedEvent::SendAck(ack) => Some(ack.clone()),
            _ => None,
        })
        .await;
        assert_eq!(ack.message_id, None);
        assert_eq!(ack.restored_input.as_deref(), Some(" final offer "));
        let items = wait_for(&mut harness.events, timeline_of).await;
        assert_eq!(labels(&items), ["m1", "m2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn late_ack_after_fallback_confirms_instead_of_failing() {
        let mut harness = start(FeedRuntimeConfig::new("buyer-1").with_tuning(FeedTuning {
            persist_timeout_ms: Some(5_000),
            ..FeedTuning::default()
        }));
        harness.api.set_echo_sends(false);
        harness.api.set_response_delay(Duration::from_secs(20));
        select_connected(&mut harness, "c1").await;
        let calls_before = harness.api.list_message_calls();

        harness
            .handle
            .send(FeedCommand::SendMessage {
                body: "hello".into(),
            })
            .await
            .expect("send enqueues");

        let repaired = wait_for(&mut harness.events, |event| {
            timeline_of(event).filter(|items| confirmed_count(items) == 3)
        })
        .await;
        assert_eq!(labels(&repaired), ["m1", "m2", "m3", "local:hello"]);

        let ack = wait_for(&mut harness.events, |event| match event {
            FeedEvent::SendAck(ack) => Some(ack.clone()),
            _ => None,
        })
        .await;
        assert_eq!(ack.message_id.as_deref(), Some("m3"));
        assert_eq!(ack.error_code, None);
        assert_eq!(ack.restored_input, None);
        // One re-fetch from the fallback timer, one after the overdue ack.
        assert_eq!(harness.api.list_message_calls(), calls_before + 2);

        let settled = wait_for(&mut harness.events, timeline_of).await;
        assert_eq!(labels(&settled), ["m1", "m2", "m3"]);
        assert_eq!(harness.api.messages_in("c1").len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn results_for_a_previous_conversation_are_discarded() {
        let mut harness = start(FeedRuntimeConfig::new("buyer-1"));
        harness.api.set_fetch_delay(Duration::from_millis(500));
        harness
            .handle
            .send(FeedCommand::SelectConversation {
                conversation_id: "c1".into(),
            })
            .await
            .expect("select enqueues");
        harness
            .handle
            .send(FeedCommand::SelectConversation {
                conversation_id: "c2".into(),
            })
            .await
            .expect("select enqueues");

        wait_for(&mut harness.events, |event| match event {
            FeedEvent::ActiveConversationChanged {
                conversation_id: Some(id),
            } if id == "c2" => Some(()),
            _ => None,
        })
        .await;
        assert_eq!(harness.hub.subscriber_count("messages:c1"), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        harness.api.insert_remote("c1", "seller-9", "late for c1");

        let mut c2_snapshots = 0;
        loop {
            match timeout(Duration::from_millis(100), harness.events.recv()).await {
                Ok(Ok(FeedEvent::TimelineSnapshot {
                    conversation_id,
                    items,
                })) => {
                    assert_eq!(conversation_id, "c2");
                    assert!(items.is_empty());
                    c2_snapshots += 1;
                }
                Ok(Ok(FeedEvent::ParticipantsUpdated {
                    conversation_id, ..
                })) => assert_eq!(conversation_id, "c2"),
                Ok(Ok(FeedEvent::ActiveConversationChanged { .. })) => {
                    panic!("selection changed unexpectedly")
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => panic!("event stream failed: {err}"),
                Err(_) => break,
            }
        }
        // One for the activation, one for the (empty) first page.
        assert_eq!(c2_snapshots, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_channel_reports_disconnected_and_catches_up() {
        let mut harness = start(FeedRuntimeConfig::new("buyer-1"));
        select_connected(&mut harness, "c1").await;

        harness.hub.drop_channel("messages:c1");
        harness.api.seed_message(seeded("m9", 900, "seller-9", "missed while offline"));

        wait_for(&mut harness.events, |event| {
            matches!(
                event,
                FeedEvent::ConnectionChanged {
                    status: ConnectionStatus::Disconnected,
                    ..
                }
            )
            .then_some(())
        })
        .await;
        let items = wait_for(&mut harness.events, timeline_of).await;
        assert_eq!(labels(&items), ["m1", "m2", "m9"]);
    }

    #[tokio::test(start_paused = true)]
    async fn initial_fetch_failure_is_surfaced_and_refresh_recovers() {
        let mut harness = start(FeedRuntimeConfig::new("buyer-1"));
        harness.api.fail_next_fetches(1);
        harness
            .handle
            .send(FeedCommand::SelectConversation {
                conversation_id: "c1".into(),
            })
            .await
            .expect("select enqueues");

        let code = wait_for(&mut harness.events, |event| match event {
            FeedEvent::FetchFailed {
                conversation_id: Some(id),
                code,
                ..
            } if id == "c1" => Some(code.clone()),
            _ => None,
        })
        .await;
        assert_eq!(code, "service_unavailable");

        harness
            .handle
            .send(FeedCommand::Refresh)
            .await
            .expect("refresh enqueues");
        let items = wait_for(&mut harness.events, |event| {
            timeline_of(event).filter(|items| !items.is_empty())
        })
        .await;
        assert_eq!(labels(&items), ["m1", "m2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn clearing_selection_and_dropping_handles_release_the_channel() {
        let mut harness = start(FeedRuntimeConfig::new("buyer-1"));
        select_connected(&mut harness, "c1").await;

        harness
            .handle
            .send(FeedCommand::ClearSelection)
            .await
            .expect("clear enqueues");
        wait_for(&mut harness.events, |event| match event {
            FeedEvent::ActiveConversationChanged {
                conversation_id: None,
            } => Some(()),
            _ => None,
        })
        .await;
        assert_eq!(harness.hub.total_subscribers(), 0);

        select_connected(&mut harness, "c1").await;
        assert_eq!(harness.hub.total_subscribers(), 1);

        let Harness { handle, hub, .. } = harness;
        drop(handle);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hub.total_subscribers(), 0);
    }
}
