//! Outbound Queues
//!
//! Every connection owns one bounded queue of [`ServerMessage`]s drained by
//! a single writer task. Ordinary sends wait for space up to a timeout.
//! Sends made while holding a game lock use [`Outbox::try_send`] and never
//! wait. Terminal instructions never wait either: if the queue is full the
//! writer is told to stop directly and writes the `quit` itself.

use std::fmt::Display;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error};

use crate::network::protocol::ServerMessage;

#[derive(Default)]
struct KillSwitch {
    reason: Mutex<Option<String>>,
    notify: Notify,
}

impl KillSwitch {
    fn trip(&self, reason: String) {
        let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        slot.get_or_insert(reason);
        self.notify.notify_one();
    }

    fn take_reason(&self) -> Option<String> {
        self.reason.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Sending half of a connection's outbound queue.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::Sender<ServerMessage>,
    kill: Arc<KillSwitch>,
    send_timeout: Duration,
}

/// Receiving half, owned by the writer task.
pub struct OutboxReceiver {
    rx: mpsc::Receiver<ServerMessage>,
    kill: Arc<KillSwitch>,
}

/// Result of a non-blocking send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued.
    Queued,
    /// No room right now.
    Full,
    /// The writer has stopped, or nothing is attached.
    Closed,
}

/// Create a bounded outbound queue.
pub fn channel(capacity: usize, send_timeout: Duration) -> (Outbox, OutboxReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let kill = Arc::new(KillSwitch::default());
    (
        Outbox {
            tx,
            kill: kill.clone(),
            send_timeout,
        },
        OutboxReceiver { rx, kill },
    )
}

impl Outbox {
    /// Queue a message, waiting for space up to the send timeout.
    ///
    /// Returns false if the queue is closed or stayed full.
    pub async fn send(&self, message: ServerMessage) -> bool {
        matches!(
            tokio::time::timeout(self.send_timeout, self.tx.send(message)).await,
            Ok(Ok(()))
        )
    }

    /// Queue a message only if there is room right now.
    pub fn try_send(&self, message: ServerMessage) -> Delivery {
        match self.tx.try_send(message) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Queue a terminal instruction without waiting.
    pub fn terminate(&self, reason: impl Into<String>) {
        match self.tx.try_send(ServerMessage::quit(reason)) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(ServerMessage::Quit { reason })) => self.kill.trip(reason),
            Err(TrySendError::Full(_)) => self.kill.trip("Connection killed".to_string()),
        }
    }

    /// Whether the writer has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Whether both handles feed the same writer.
    pub fn same_channel(&self, other: &Outbox) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

impl OutboxReceiver {
    /// Next queued message, for callers that drain the queue themselves.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.rx.recv().await
    }
}

/// Why a writer stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterExit {
    /// A terminal instruction was written.
    Quit(String),
    /// Writing to the transport failed.
    WriteFailed,
    /// Every sender was dropped.
    Abandoned,
}

/// Drain the queue into the transport until a terminal instruction, a write
/// failure, or abandonment. The transport is closed on return.
pub async fn run_writer<S>(mut sink: S, receiver: OutboxReceiver) -> WriterExit
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let OutboxReceiver { mut rx, kill } = receiver;

    let exit = loop {
        let message = tokio::select! {
            biased;
            _ = kill.notify.notified() => {
                let reason = kill.take_reason().unwrap_or_else(|| "Connection killed".to_string());
                Some(ServerMessage::quit(reason))
            }
            message = rx.recv() => message,
        };

        let Some(message) = message else {
            break WriterExit::Abandoned;
        };

        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to serialize message: {}", e);
                continue;
            }
        };

        if let Err(e) = sink.send(Message::Text(text)).await {
            debug!("Write failed: {}", e);
            break WriterExit::WriteFailed;
        }

        if let ServerMessage::Quit { reason } = message {
            break WriterExit::Quit(reason);
        }
    };

    rx.close();
    let _ = sink.close().await;
    exit
}
