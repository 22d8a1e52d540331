use std::{collections::HashMap, sync::Arc, time::Duration};

use feed_core::{
    Activation, ConnectionStatus, FeedError, FeedEvent, Message, MessageTimeline, PendingMessage,
    SendOutcome, normalize_send_outcome,
};
use feed_platform::{MessagingApi, NewMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::map_platform_error;

/// Completion produced by a send task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendSignal {
    /// The create-message call returned.
    Persisted {
        local_id: String,
        conversation_id: String,
        /// Composer input as the user typed it.
        input: String,
        result: Result<Message, FeedError>,
    },
    /// The fallback timer of a still-unconfirmed send fired.
    FallbackDue {
        activation: Activation,
        local_id: String,
    },
    /// The create-message call is still running after `persist_timeout`.
    ///
    /// The call keeps running; its eventual result is reported through
    /// `Persisted`.
    AckOverdue {
        activation: Activation,
        local_id: String,
    },
}

pub type SendCallback = Arc<dyn Fn(SendSignal) + Send + Sync>;

/// Result of folding a persist completion into the timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendCompletion {
    pub ack: FeedEvent,
    pub timeline_changed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendTimings {
    pub fallback_delay: Duration,
    pub disconnected_fallback_delay: Duration,
    /// How long a create-message call may run before a verification
    /// re-fetch is requested.
    pub persist_timeout: Duration,
}

impl SendTimings {
    /// Fallback delay for the current realtime status.
    pub fn fallback_for(&self, status: ConnectionStatus) -> Duration {
        match status {
            ConnectionStatus::Connected => self.fallback_delay,
            ConnectionStatus::Connecting | ConnectionStatus::Disconnected => {
                self.disconnected_fallback_delay
            }
        }
    }
}

/// Drives optimistic sends: persist call, fallback timer, outcome.
pub struct SendCoordinator<A: ?Sized> {
    api: Arc<A>,
    own_user_id: String,
    timings: SendTimings,
    timers: HashMap<String, CancellationToken>,
    on_signal: SendCallback,
}

impl<A> SendCoordinator<A>
where
    A: MessagingApi + ?Sized + 'static,
{
    pub fn new(
        api: Arc<A>,
        own_user_id: impl Into<String>,
        timings: SendTimings,
        on_signal: SendCallback,
    ) -> Self {
        Self {
            api,
            own_user_id: own_user_id.into(),
            timings,
            timers: HashMap::new(),
            on_signal,
        }
    }

    /// Trimmed composer input, or `None` when there is nothing to send.
    pub fn validate(input: &str) -> Option<&str> {
        Some(input.trim()).filter(|body| !body.is_empty())
    }

    /// Number of armed fallback timers.
    pub fn armed_timers(&self) -> usize {
        self.timers.len()
    }

    /// Start a send in the active conversation.
    ///
    /// Adds the optimistic entry, issues the persist call and arms the
    /// fallback timer under `scope`. Returns `None` for blank input or when
    /// no conversation is active.
    pub fn begin(
        &mut self,
        timeline: &mut MessageTimeline,
        input: &str,
        status: ConnectionStatus,
        scope: &CancellationToken,
    ) -> Option<PendingMessage> {
        let body = Self::validate(input)?;
        let Some(activation) = timeline.active().cloned() else {
            debug!("send ignored without an active conversation");
            return None;
        };
        let pending = match timeline.apply_optimistic(&activation, self.own_user_id.as_str(), body)
        {
            Ok(pending) => pending,
            Err(err) => {
                warn!(error = %err, "optimistic insert rejected");
                return None;
            }
        };

        self.spawn_persist(&activation, &pending, input);
        self.arm_fallback(activation, &pending.local_id, self.timings.fallback_for(status), scope);
        info!(
            conversation_id = %pending.conversation_id,
            local_id = %pending.local_id,
            "send started"
        );
        Some(pending)
    }

    /// Apply a persist outcome: confirm on success, hand back the input on failure.
    pub fn complete(
        &mut self,
        timeline: &mut MessageTimeline,
        local_id: &str,
        conversation_id: &str,
        input: String,
        result: Result<Message, FeedError>,
    ) -> SendCompletion {
        self.disarm(local_id);
        match result {
            Ok(message) => {
                let message_id = message.id.clone();
                let outcome = timeline.confirm_optimistic(local_id, message);
                debug!(%local_id, %message_id, ?outcome, "send confirmed");
                SendCompletion {
                    ack: normalize_send_outcome(
                        local_id,
                        conversation_id,
                        SendOutcome::Success { message_id },
                    ),
                    timeline_changed: outcome.changed(),
                }
            }
            Err(error) => {
                warn!(%local_id, code = %error.code, "send failed");
                let timeline_changed = match timeline.fail_optimistic(local_id) {
                    Ok(_) => true,
                    Err(err) => {
                        debug!(error = %err, "failed send had no pending entry");
                        false
                    }
                };
                SendCompletion {
                    ack: normalize_send_outcome(
                        local_id,
                        conversation_id,
                        SendOutcome::Failure {
                            error,
                            restored_input: Some(input),
                        },
                    ),
                    timeline_changed,
                }
            }
        }
    }

    /// Whether a fired fallback timer still calls for a re-fetch.
    pub fn fallback_due(
        &mut self,
        timeline: &MessageTimeline,
        activation: &Activation,
        local_id: &str,
    ) -> bool {
        self.timers.remove(local_id);
        let due = timeline.is_current(activation) && timeline.is_pending(local_id);
        debug!(%local_id, due, "fallback timer fired");
        due
    }

    /// Whether an overdue acknowledgement still calls for a re-fetch.
    ///
    /// The pending entry stays in place either way; only a returned
    /// create-message call confirms or fails it.
    pub fn ack_overdue(
        &self,
        timeline: &MessageTimeline,
        activation: &Activation,
        local_id: &str,
    ) -> bool {
        let due = timeline.is_current(activation) && timeline.is_pending(local_id);
        warn!(
            %local_id,
            timeout_ms = self.timings.persist_timeout.as_millis() as u64,
            due,
            "send acknowledgement overdue"
        );
        due
    }

    /// Cancel every armed timer. Persist calls keep running.
    pub fn cancel_timers(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.cancel();
        }
    }

    fn disarm(&mut self, local_id: &str) {
        if let Some(timer) = self.timers.remove(local_id) {
            timer.cancel();
        }
    }

    fn spawn_persist(&self, activation: &Activation, pending: &PendingMessage, input: &str) {
        let api = Arc::clone(&self.api);
        let on_signal = Arc::clone(&self.on_signal);
        let overdue_after = self.timings.persist_timeout;
        let activation = activation.clone();
        let conversation_id = pending.conversation_id.clone();
        let local_id = pending.local_id.clone();
        let input = input.to_owned();
        let request = NewMessage {
            conversation_id: pending.conversation_id.clone(),
            sender_id: pending.sender_id.clone(),
            body: pending.body.clone(),
        };

        tokio::spawn(async move {
            let mut call = api.create_message(request);
            let result = tokio::select! {
                result = &mut call => result,
                _ = tokio::time::sleep(overdue_after) => {
                    on_signal(SendSignal::AckOverdue {
                        activation,
                        local_id: local_id.clone(),
                    });
                    call.await
                }
            };
            on_signal(SendSignal::Persisted {
                local_id,
                conversation_id,
                input,
                result: result.map_err(map_platform_error),
            });
        });
    }

    fn arm_fallback(
        &mut self,
        activation: Activation,
        local_id: &str,
        delay: Duration,
        scope: &CancellationToken,
    ) {
        let timer = scope.child_token();
        let cancelled = timer.clone();
        let on_signal = Arc::clone(&self.on_signal);
        let local_id = local_id.to_owned();
        self.timers.insert(local_id.clone(), timer);

        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    on_signal(SendSignal::FallbackDue { activation, local_id });
                }
            }
        });
    }
}
