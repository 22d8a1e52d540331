use std::sync::Arc;

use feed_core::{
    Activation, ConnectionStatus, FeedError, RemoteEvent, RetryPolicy, SubscriptionState,
    SubscriptionStateMachine, normalize_row_change,
};
use feed_platform::{RealtimeTransport, message_channel_name};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::map_platform_error;

/// Notification produced by a subscription task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeSignal {
    /// The channel is open.
    Opened,
    /// Every open attempt failed.
    OpenFailed(FeedError),
    /// A normalized row change.
    Event(RemoteEvent),
    /// The transport closed an open channel.
    Dropped,
}

/// Receives signals tagged with the activation that opened the channel.
pub type SignalCallback = Arc<dyn Fn(Activation, RealtimeSignal) + Send + Sync>;

struct RunningSubscription {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the single realtime channel of the active conversation.
pub struct SubscriptionManager<T: ?Sized> {
    transport: Arc<T>,
    retry: RetryPolicy,
    machine: SubscriptionStateMachine,
    activation: Option<Activation>,
    running: Option<RunningSubscription>,
}

impl<T> SubscriptionManager<T>
where
    T: RealtimeTransport + ?Sized + 'static,
{
    pub fn new(transport: Arc<T>, retry: RetryPolicy) -> Self {
        Self {
            transport,
            retry,
            machine: SubscriptionStateMachine::default(),
            activation: None,
            running: None,
        }
    }

    pub fn state(&self) -> SubscriptionState {
        self.machine.state()
    }

    /// Open the channel for `activation`.
    ///
    /// Returns the new connection status, or `None` when this activation is
    /// already subscribed. A channel held for another activation is closed
    /// first.
    pub async fn subscribe(
        &mut self,
        activation: Activation,
        on_signal: SignalCallback,
    ) -> Result<Option<ConnectionStatus>, FeedError> {
        if self.activation.as_ref() == Some(&activation) {
            trace!(
                conversation_id = %activation.conversation_id,
                epoch = activation.epoch,
                "subscription already held"
            );
            return Ok(None);
        }
        self.unsubscribe().await?;

        let status = self.machine.begin_subscribe(&activation.conversation_id)?;
        let stop = CancellationToken::new();
        let task = tokio::spawn(run_subscription(
            Arc::clone(&self.transport),
            activation.clone(),
            self.retry,
            stop.child_token(),
            on_signal,
        ));
        debug!(
            conversation_id = %activation.conversation_id,
            epoch = activation.epoch,
            "subscription task started"
        );
        self.activation = Some(activation);
        self.running = Some(RunningSubscription { stop, task });
        Ok(status)
    }

    /// Close the channel and wait for the task to release it.
    ///
    /// Returns `false` when nothing was subscribed.
    pub async fn unsubscribe(&mut self) -> Result<bool, FeedError> {
        let releasing = self.machine.begin_unsubscribe()?;
        if let Some(running) = self.running.take() {
            running.stop.cancel();
            if let Err(err) = running.task.await {
                warn!(error = %err, "subscription task ended abnormally");
            }
        }
        if releasing {
            self.machine.on_unsubscribed()?;
        }
        if let Some(activation) = self.activation.take() {
            debug!(
                conversation_id = %activation.conversation_id,
                epoch = activation.epoch,
                "subscription released"
            );
        }
        Ok(releasing)
    }

    /// Fold a task signal into the lifecycle.
    ///
    /// Returns the status to publish, if it changed. Signals from a previous
    /// activation are ignored.
    pub fn observe(
        &mut self,
        activation: &Activation,
        signal: &RealtimeSignal,
    ) -> Result<Option<ConnectionStatus>, FeedError> {
        if self.activation.as_ref() != Some(activation) {
            trace!(
                conversation_id = %activation.conversation_id,
                epoch = activation.epoch,
                "ignoring signal from released subscription"
            );
            return Ok(None);
        }

        match signal {
            RealtimeSignal::Opened => self.machine.on_subscribe_result(true).map(Some),
            RealtimeSignal::OpenFailed(err) => {
                warn!(
                    conversation_id = %activation.conversation_id,
                    code = %err.code,
                    "realtime channel could not be opened"
                );
                self.machine.on_subscribe_result(false).map(Some)
            }
            RealtimeSignal::Dropped => {
                warn!(
                    conversation_id = %activation.conversation_id,
                    "realtime channel dropped"
                );
                self.machine.on_dropped().map(Some)
            }
            RealtimeSignal::Event(_) => Ok(None),
        }
    }
}

async fn run_subscription<T>(
    transport: Arc<T>,
    activation: Activation,
    retry: RetryPolicy,
    stop: CancellationToken,
    on_signal: SignalCallback,
) where
    T: RealtimeTransport + ?Sized,
{
    let name = message_channel_name(&activation.conversation_id);
    let mut attempt: u32 = 0;

    let mut channel = loop {
        let result = tokio::select! {
            _ = stop.cancelled() => return,
            result = transport.subscribe(&name) => result,
        };
        match result {
            Ok(channel) => break channel,
            Err(err) => {
                let mapped = map_platform_error(err);
                if !retry.allows_retry_after(attempt) {
                    on_signal(activation, RealtimeSignal::OpenFailed(mapped));
                    return;
                }
                let delay = retry.delay_for_attempt(attempt, mapped.retry_after_ms);
                attempt = attempt.saturating_add(1);
                debug!(
                    channel = %name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    code = %mapped.code,
                    "retrying realtime subscribe"
                );
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    };
    on_signal(activation.clone(), RealtimeSignal::Opened);

    loop {
        let change = tokio::select! {
            _ = stop.cancelled() => break,
            change = channel.next_change() => change,
        };
        let Some(change) = change else {
            on_signal(activation, RealtimeSignal::Dropped);
            return;
        };
        match normalize_row_change(&change) {
            Ok(Some(event)) => on_signal(activation.clone(), RealtimeSignal::Event(event)),
            Ok(None) => {}
            Err(err) => warn!(channel = %name, error = %err, "dropping malformed row change"),
        }
    }

    if let Err(err) = transport.unsubscribe(channel).await {
        warn!(channel = %name, error = %err, "realtime unsubscribe failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use feed_core::{Message, RemoteEventKind, RowChange};
    use feed_platform::InMemoryRealtimeHub;
    use tokio::sync::mpsc;

    type Received = mpsc::UnboundedReceiver<(Activation, RealtimeSignal)>;

    fn recorder() -> (SignalCallback, Received) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: SignalCallback = Arc::new(move |activation, signal| {
            let _ = tx.send((activation, signal));
        });
        (callback, rx)
    }

    async fn next(rx: &mut Received) -> (Activation, RealtimeSignal) {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("signal timeout")
            .expect("signal channel open")
    }

    fn message(id: &str) -> Message {
        Message {
            id: id.to_owned(),
            conversation_id: "c1".to_owned(),
            sender_id: "seller-9".to_owned(),
            body: Some("price update".to_owned()),
            created_at_ms: 1_000,
            deleted_at_ms: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn opens_channel_and_forwards_normalized_events() {
        let hub = InMemoryRealtimeHub::default();
        let mut manager = SubscriptionManager::new(Arc::new(hub.clone()), RetryPolicy::default());
        let (callback, mut rx) = recorder();
        let activation = Activation::new("c1", 1);

        let status = manager
            .subscribe(activation.clone(), callback.clone())
            .await
            .expect("subscribe");
        assert_eq!(status, Some(ConnectionStatus::Connecting));
        assert_eq!(manager.state(), SubscriptionState::Subscribing);

        let (tagged, signal) = next(&mut rx).await;
        assert_eq!(tagged, activation);
        assert_eq!(
            manager.observe(&tagged, &signal).expect("observe opened"),
            Some(ConnectionStatus::Connected)
        );

        hub.publish(
            "messages:c1",
            RowChange {
                event_type: "INSERT".into(),
                record: serde_json::json!({ "id": "broken" }),
                old_record: None,
            },
        );
        hub.publish_message(RemoteEventKind::Insert, &message("m1"));
        let (_, signal) = next(&mut rx).await;
        assert_eq!(signal, RealtimeSignal::Event(RemoteEvent::insert(message("m1"))));

        let again = manager
            .subscribe(activation, callback)
            .await
            .expect("idempotent subscribe");
        assert_eq!(again, None);
        assert_eq!(hub.subscriber_count("messages:c1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn switching_activation_closes_previous_channel_first() {
        let hub = InMemoryRealtimeHub::default();
        let mut manager = SubscriptionManager::new(Arc::new(hub.clone()), RetryPolicy::default());
        let (callback, mut rx) = recorder();

        let first = Activation::new("c1", 1);
        manager
            .subscribe(first.clone(), callback.clone())
            .await
            .expect("subscribe c1");
        let (tagged, signal) = next(&mut rx).await;
        manager.observe(&tagged, &signal).expect("observe");

        let second = Activation::new("c2", 2);
        manager
            .subscribe(second.clone(), callback)
            .await
            .expect("subscribe c2");
        assert_eq!(hub.subscriber_count("messages:c1"), 0);

        let (tagged, signal) = next(&mut rx).await;
        assert_eq!(tagged, second);
        assert_eq!(
            manager.observe(&first, &RealtimeSignal::Dropped).expect("stale"),
            None
        );
        assert_eq!(
            manager.observe(&tagged, &signal).expect("observe"),
            Some(ConnectionStatus::Connected)
        );
        assert_eq!(hub.subscriber_count("messages:c2"), 1);

        assert!(manager.unsubscribe().await.expect("unsubscribe"));
        assert!(!manager.unsubscribe().await.expect("idle unsubscribe"));
        assert_eq!(hub.total_subscribers(), 0);
        assert_eq!(manager.state(), SubscriptionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_bounded_attempts() {
        let hub = InMemoryRealtimeHub::default();
        hub.fail_next_subscribes(10);
        let mut manager = SubscriptionManager::new(
            Arc::new(hub.clone()),
            RetryPolicy::default().with_max_attempts(3),
        );
        let (callback, mut rx) = recorder();
        let activation = Activation::new("c1", 1);

        manager
            .subscribe(activation, callback)
            .await
            .expect("subscribe");
        let (tagged, signal) = next(&mut rx).await;
        assert!(matches!(
            signal,
            RealtimeSignal::OpenFailed(ref err) if err.code == "service_unavailable"
        ));
        assert_eq!(hub.subscribe_calls(), 3);
        assert_eq!(
            manager.observe(&tagged, &signal).expect("observe failure"),
            Some(ConnectionStatus::Disconnected)
        );
        assert_eq!(manager.state(), SubscriptionState::Idle);
        assert!(!manager.unsubscribe().await.expect("nothing held"));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_open_waits_for_the_server_hint() {
        let hub = InMemoryRealtimeHub::default();
        hub.rate_limit_next_subscribes(1, Some(Duration::from_secs(3)));
        let mut manager = SubscriptionManager::new(Arc::new(hub.clone()), RetryPolicy::default());
        let (callback, mut rx) = recorder();
        let started = tokio::time::Instant::now();

        manager
            .subscribe(Activation::new("c1", 1), callback)
            .await
            .expect("subscribe");
        let (_, signal) = next(&mut rx).await;
        assert_eq!(signal, RealtimeSignal::Opened);
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(hub.subscribe_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reports_dropped_channel() {
        let hub = InMemoryRealtimeHub::default();
        let mut manager = SubscriptionManager::new(Arc::new(hub.clone()), RetryPolicy::default());
        let (callback, mut rx) = recorder();

        manager
            .subscribe(Activation::new("c1", 1), callback)
            .await
            .expect("subscribe");
        let (tagged, signal) = next(&mut rx).await;
        manager.observe(&tagged, &signal).expect("observe opened");

        hub.drop_channel("messages:c1");
        let (tagged, signal) = next(&mut rx).await;
        assert_eq!(signal, RealtimeSignal::Dropped);
        assert_eq!(
            manager.observe(&tagged, &signal).expect("observe drop"),
            Some(ConnectionStatus::Disconnected)
        );
    }
}
