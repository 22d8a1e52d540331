use serde::{Deserialize, Serialize};

use crate::{error::FeedError, types::ConnectionStatus};

/// Lifecycle of the single realtime subscription.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SubscriptionState {
    /// No channel is open or being opened.
    Idle,
    /// A channel open request is in flight.
    Subscribing,
    /// A channel is open and delivering events.
    Subscribed,
    /// The channel is being released.
    Unsubscribing,
}

#[derive(Debug, Clone)]
pub struct SubscriptionStateMachine {
    state: SubscriptionState,
    conversation_id: Option<String>,
}

impl Default for SubscriptionStateMachine {
    fn default() -> Self {
        Self {
            state: SubscriptionState::Idle,
            conversation_id: None,
        }
    }
}

impl SubscriptionStateMachine {
    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Conversation the current (or in-flight) subscription belongs to.
    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// Start subscribing to `conversation_id`.
    ///
    /// Returns `None` when a subscription for the same conversation is already
    /// open or opening. A different conversation must be unsubscribed first.
    pub fn begin_subscribe(
        &mut self,
        conversation_id: &str,
    ) -> Result<Option<ConnectionStatus>, FeedError> {
        match self.state {
            SubscriptionState::Idle => {
                self.state = SubscriptionState::Subscribing;
                self.conversation_id = Some(conversation_id.to_owned());
                Ok(Some(ConnectionStatus::Connecting))
            }
            SubscriptionState::Subscribing | SubscriptionState::Subscribed
                if self.conversation_id.as_deref() == Some(conversation_id) =>
            {
                Ok(None)
            }
            _ => Err(FeedError::invalid_state(self.state, "subscribe")),
        }
    }

    /// Resolve an in-flight open request.
    pub fn on_subscribe_result(&mut self, success: bool) -> Result<ConnectionStatus, FeedError> {
        if success {
            self.transition_from_state(
                SubscriptionState::Subscribing,
                SubscriptionState::Subscribed,
                "on_subscribe_result",
            )?;
            Ok(ConnectionStatus::Connected)
        } else {
            self.transition_from_state(
                SubscriptionState::Subscribing,
                SubscriptionState::Idle,
                "on_subscribe_result",
            )?;
            self.conversation_id = None;
            Ok(ConnectionStatus::Disconnected)
        }
    }

    /// Start releasing the channel. Returns `false` when already idle.
    pub fn begin_unsubscribe(&mut self) -> Result<bool, FeedError> {
        if self.state == SubscriptionState::Idle {
            return Ok(false);
        }
        self.transition_from_any_of(
            &[
                SubscriptionState::Subscribing,
                SubscriptionState::Subscribed,
            ],
            SubscriptionState::Unsubscribing,
            "unsubscribe",
        )?;
        Ok(true)
    }

    /// Finish releasing the channel.
    pub fn on_unsubscribed(&mut self) -> Result<(), FeedError> {
        self.transition_from_state(
            SubscriptionState::Unsubscribing,
            SubscriptionState::Idle,
            "on_unsubscribed",
        )?;
        self.conversation_id = None;
        Ok(())
    }

    /// The open channel stopped delivering events.
    pub fn on_dropped(&mut self) -> Result<ConnectionStatus, FeedError> {
        self.transition_from_state(
            SubscriptionState::Subscribed,
            SubscriptionState::Idle,
            "on_dropped",
        )?;
        self.conversation_id = None;
        Ok(ConnectionStatus::Disconnected)
    }

    fn transition_from_state(
        &mut self,
        expected: SubscriptionState,
        next: SubscriptionState,
        action: &str,
    ) -> Result<(), FeedError> {
        if self.state != expected {
            return Err(FeedError::invalid_state(self.state, action));
        }
        self.state = next;
        Ok(())
    }

    fn transition_from_any_of(
        &mut self,
        expected: &[SubscriptionState],
        next: SubscriptionState,
        action: &str,
    ) -> Result<(), FeedError> {
        if !expected.contains(&self.state) {
            return Err(FeedError::invalid_state(self.state, action));
        }
        self.state = next;
        Ok(())
    }
}
