//! Fan-out of store changes to connected viewers.
//!
//! Every viewer gets its own bounded buffer. Publishing never waits: when a
//! viewer falls more than `capacity` events behind, its oldest undelivered
//! events are dropped and it resumes with the newest ones, still in publish
//! order.

use std::sync::{Mutex, PoisonError};

use futures_util::{Stream, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, warn};

use crate::store::ChangeEvent;

/// Default number of events buffered per viewer.
pub const DEFAULT_VIEWER_BUFFER: usize = 64;

/// Broadcasts [`ChangeEvent`]s to every live subscription.
pub struct ChangeNotifier {
    /// `None` once the notifier has been closed.
    sender: Mutex<Option<broadcast::Sender<ChangeEvent>>>,
}

impl ChangeNotifier {
    /// Create a notifier buffering up to `capacity` events per viewer.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Register a new viewer. Events published from now on are delivered to it.
    pub fn subscribe(&self) -> Subscription {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let receiver = match guard.as_ref() {
            Some(sender) => sender.subscribe(),
            None => {
                // Closed: hand out a receiver whose sender is already gone.
                let (_, receiver) = broadcast::channel(1);
                receiver
            }
        };
        Subscription { receiver }
    }

    /// Deliver an event to every current subscription. Never blocks.
    pub fn publish(&self, event: ChangeEvent) {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = guard.as_ref() else {
            debug!(?event.action, "notifier closed, dropping event");
            return;
        };
        match sender.send(event) {
            Ok(viewers) => debug!(viewers, "change event published"),
            Err(_) => debug!("change event published with no viewers"),
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, |sender| sender.receiver_count())
    }

    /// Stop delivering events. Every subscription ends once it has drained
    /// what was already buffered for it.
    pub fn close(&self) {
        if self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            debug!("change notifier closed");
        }
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_VIEWER_BUFFER)
    }
}

/// One viewer's channel of change events.
pub struct Subscription {
    receiver: broadcast::Receiver<ChangeEvent>,
}

impl Subscription {
    /// Wait for the next event. Returns `None` once the notifier is closed.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "viewer fell behind, oldest change events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take an already buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        use broadcast::error::TryRecvError;
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(missed)) => {
                    warn!(missed, "viewer fell behind, oldest change events dropped");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Convert into a stream that skips over dropped events.
    pub fn into_stream(self) -> impl Stream<Item = ChangeEvent> + Send + 'static {
        BroadcastStream::new(self.receiver).filter_map(|item| async move {
            match item {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    warn!(missed, "viewer fell behind, oldest change events dropped");
                    None
                }
            }
        })
    }
}
