use std::sync::Arc;

use tokio::sync::{broadcast, watch};

use tether_types::events::{RevivalPaused, SessionRevived, SyncConnectionState};
use tether_types::models::{MessageRecord, SessionRecord};

use crate::error::SyncError;

/// Fans decrypted updates out to every interested consumer.
///
/// Connection status is a `watch` channel so late subscribers see the current
/// value. Everything else is a `broadcast` channel: events published while no
/// receiver exists are dropped, and a receiver that falls behind by more than
/// the buffer gets `RecvError::Lagged`.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    status_tx: watch::Sender<SyncConnectionState>,
    sessions_tx: broadcast::Sender<SessionRecord>,
    messages_tx: broadcast::Sender<MessageRecord>,
    errors_tx: broadcast::Sender<SyncError>,
    revival_paused_tx: broadcast::Sender<RevivalPaused>,
    revived_tx: broadcast::Sender<SessionRevived>,
}

impl Dispatcher {
    pub fn new(buffer: usize) -> Self {
        let buffer = buffer.max(1);
        let (status_tx, _) = watch::channel(SyncConnectionState::Disconnected);
        Self {
            inner: Arc::new(DispatcherInner {
                status_tx,
                sessions_tx: broadcast::channel(buffer).0,
                messages_tx: broadcast::channel(buffer).0,
                errors_tx: broadcast::channel(buffer).0,
                revival_paused_tx: broadcast::channel(buffer).0,
                revived_tx: broadcast::channel(buffer).0,
            }),
        }
    }

    pub fn status(&self) -> SyncConnectionState {
        *self.inner.status_tx.borrow()
    }

    /// Publish a status change. Repeating the current value is not an event.
    pub fn set_status(&self, status: SyncConnectionState) {
        self.inner.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    pub fn publish_session(&self, session: SessionRecord) {
        let _ = self.inner.sessions_tx.send(session);
    }

    pub fn publish_message(&self, message: MessageRecord) {
        let _ = self.inner.messages_tx.send(message);
    }

    pub fn publish_error(&self, error: SyncError) {
        let _ = self.inner.errors_tx.send(error);
    }

    pub fn publish_revival_paused(&self, event: RevivalPaused) {
        let _ = self.inner.revival_paused_tx.send(event);
    }

    pub fn publish_revived(&self, event: SessionRevived) {
        let _ = self.inner.revived_tx.send(event);
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncConnectionState> {
        self.inner.status_tx.subscribe()
    }

    pub fn subscribe_sessions(&self) -> broadcast::Receiver<SessionRecord> {
        self.inner.sessions_tx.subscribe()
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<MessageRecord> {
        self.inner.messages_tx.subscribe()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<SyncError> {
        self.inner.errors_tx.subscribe()
    }

    pub fn subscribe_revival_paused(&self) -> broadcast::Receiver<RevivalPaused> {
        self.inner.revival_paused_tx.subscribe()
    }

    pub fn subscribe_revived(&self) -> broadcast::Receiver<SessionRevived> {
        self.inner.revived_tx.subscribe()
    }
}
