use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::types::{FeedCommand, FeedEvent};

/// Event stream handed to views.
pub type EventStream = broadcast::Receiver<FeedEvent>;

/// Errors returned by feed channel operations.
#[derive(Debug, Error)]
pub enum FeedChannelError {
    /// The runtime stopped receiving commands.
    #[error("command channel is closed")]
    CommandChannelClosed,
}

/// Command and event channels of one feed runtime.
///
/// Every clone holds the command side open. The runtime itself keeps only
/// the event sender, so its command receiver closes once the last clone is
/// dropped.
#[derive(Clone, Debug)]
pub struct FeedChannels {
    command_tx: mpsc::Sender<FeedCommand>,
    event_tx: broadcast::Sender<FeedEvent>,
}

impl FeedChannels {
    /// Create the channels and return them with the runtime's command receiver.
    pub fn new(command_buffer: usize, event_buffer: usize) -> (Self, mpsc::Receiver<FeedCommand>) {
        let (command_tx, command_rx) = mpsc::channel(command_buffer.max(1));
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));

        (
            Self {
                command_tx,
                event_tx,
            },
            command_rx,
        )
    }

    /// Event sender for the runtime task.
    pub fn event_sender(&self) -> broadcast::Sender<FeedEvent> {
        self.event_tx.clone()
    }

    /// Subscribe to emitted feed events.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Queue one command, waiting while the command buffer is full.
    pub async fn send_command(&self, command: FeedCommand) -> Result<(), FeedChannelError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| FeedChannelError::CommandChannelClosed)
    }
}
