use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use tether_crypto::SymmetricKey;
use tether_types::events::{
    ControlMessage, RevivalPaused, SessionRevived, SyncConnectionState, SyncUpdateEnvelope,
};
use tether_types::models::{MessageRecord, SessionRecord};

use crate::config::{SyncConfig, transport_url};
use crate::credentials::CredentialStore;
use crate::dispatcher::Dispatcher;
use crate::error::SyncError;
use crate::transport::{Connector, Frame, FrameSink, FrameStream};

/// A control message queued for the writer task, with an optional slot for
/// the write result.
struct Outbound {
    message: ControlMessage,
    done: Option<oneshot::Sender<Result<(), SyncError>>>,
}

/// Queue into the writer task of the current connection. Sending never
/// blocks, so it is safe while holding the state lock.
type Outbox = mpsc::UnboundedSender<Outbound>;

type Delivery = oneshot::Receiver<Result<(), SyncError>>;

/// Encrypted update channel to the sync server.
///
/// Owns one transport at a time plus the background work attached to it: a
/// writer task that owns the sink, a receive loop, a keepalive loop, and at
/// most one pending reconnect timer. Clones share the same connection.
///
/// Background tasks hold a handle to the service, so call [`disconnect`]
/// before dropping the last clone.
///
/// [`disconnect`]: SyncService::disconnect
#[derive(Clone)]
pub struct SyncService {
    inner: Arc<Inner>,
}

struct Inner {
    config: SyncConfig,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialStore>,
    dispatcher: Dispatcher,
    state: Mutex<ConnectionState>,
}

/// Everything that changes over the life of a connection. The guard is never
/// held across transport I/O.
struct ConnectionState {
    status: SyncConnectionState,
    /// Bumped on every teardown and every new attempt. Loops and timers carry
    /// the generation they were started under and go quiet once it moves on.
    generation: u64,
    attempt: u32,
    reconnect_enabled: bool,
    subscriptions: BTreeSet<String>,
    key: Option<SymmetricKey>,
    outbox: Option<Outbox>,
    tasks: BackgroundTasks,
}

impl ConnectionState {
    fn connected_outbox(&self) -> Option<&Outbox> {
        match self.status {
            SyncConnectionState::Connected => self.outbox.as_ref(),
            _ => None,
        }
    }
}

/// Tasks tied to one generation, sharing one cancellation token.
#[derive(Default)]
struct BackgroundTasks {
    cancel: CancellationToken,
    /// Owns the sink and closes it on cancellation; joined with a grace period.
    writer: Option<JoinHandle<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Signal the tasks and let them wind down on their own. Used from inside
    /// the tasks themselves, which cannot join their own handle. Every await
    /// in those tasks is raced against the token.
    fn cancel(self) {
        self.cancel.cancel();
    }

    async fn shutdown(self, grace: Duration) {
        self.cancel.cancel();
        for handle in self.handles {
            handle.abort();
            let _ = handle.await;
        }
        if let Some(mut writer) = self.writer {
            if tokio::time::timeout(grace, &mut writer).await.is_err() {
                writer.abort();
                let _ = writer.await;
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
    Caller,
    /// Timer scheduled under the given generation.
    Reconnect(u64),
}

impl SyncService {
    pub fn new(
        config: SyncConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        let dispatcher = Dispatcher::new(config.event_buffer);
        let reconnect_enabled = config.reconnect.enabled;
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                credentials,
                dispatcher,
                state: Mutex::new(ConnectionState {
                    status: SyncConnectionState::Disconnected,
                    generation: 0,
                    attempt: 0,
                    reconnect_enabled,
                    subscriptions: BTreeSet::new(),
                    key: None,
                    outbox: None,
                    tasks: BackgroundTasks::default(),
                }),
            }),
        }
    }

    /// Open the connection. Returns immediately if already connected or
    /// connecting.
    ///
    /// Fails with [`SyncError::EncryptionKeyMissing`] before touching the
    /// network when no key material is stored. A transport failure is
    /// returned and also schedules a reconnect when reconnection is enabled.
    pub async fn connect(&self) -> Result<(), SyncError> {
        self.inner.clone().establish(Trigger::Caller).await
    }

    /// Stop reconnecting, cancel and join all background work, close the
    /// transport and forget the cached key. Subscriptions are kept for the
    /// next `connect()`.
    pub async fn disconnect(&self) {
        let tasks = {
            let mut state = self.inner.state.lock().await;
            state.reconnect_enabled = false;
            state.generation += 1;
            state.attempt = 0;
            state.key = None;
            state.outbox = None;
            self.inner
                .set_status(&mut state, SyncConnectionState::Disconnected);
            std::mem::take(&mut state.tasks)
        };

        // The writer needs up to close_timeout for the close handshake
        tasks.shutdown(self.inner.config.close_timeout * 2).await;
        info!("sync disconnected");
    }

    /// `disconnect()` and forget every subscription.
    pub async fn logout(&self) {
        self.disconnect().await;
        self.inner.state.lock().await.subscriptions.clear();
    }

    /// Follow a session. Sent right away when connected, otherwise replayed
    /// on the next successful connection. Subscribing twice is a no-op.
    ///
    /// Waits for the write, not for the server.
    pub async fn subscribe(&self, session_id: impl Into<String>) -> Result<(), SyncError> {
        let session_id = session_id.into();
        let delivery = {
            let mut state = self.inner.state.lock().await;
            if !state.subscriptions.insert(session_id.clone()) {
                return Ok(());
            }
            match state.connected_outbox() {
                Some(outbox) => enqueue(outbox, ControlMessage::Subscribe { session_id }),
                None => return Ok(()),
            }
        };
        delivered(delivery).await
    }

    pub async fn unsubscribe(&self, session_id: &str) -> Result<(), SyncError> {
        let delivery = {
            let mut state = self.inner.state.lock().await;
            if !state.subscriptions.remove(session_id) {
                return Ok(());
            }
            let message = ControlMessage::Unsubscribe {
                session_id: session_id.to_string(),
            };
            match state.connected_outbox() {
                Some(outbox) => enqueue(outbox, message),
                None => return Ok(()),
            }
        };
        delivered(delivery).await
    }

    pub fn status(&self) -> SyncConnectionState {
        self.inner.dispatcher.status()
    }

    pub async fn subscriptions(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        state.subscriptions.iter().cloned().collect()
    }

    pub fn status_changes(&self) -> watch::Receiver<SyncConnectionState> {
        self.inner.dispatcher.subscribe_status()
    }

    pub fn session_updates(&self) -> broadcast::Receiver<SessionRecord> {
        self.inner.dispatcher.subscribe_sessions()
    }

    pub fn message_updates(&self) -> broadcast::Receiver<MessageRecord> {
        self.inner.dispatcher.subscribe_messages()
    }

    pub fn sync_errors(&self) -> broadcast::Receiver<SyncError> {
        self.inner.dispatcher.subscribe_errors()
    }

    pub fn revival_paused_events(&self) -> broadcast::Receiver<RevivalPaused> {
        self.inner.dispatcher.subscribe_revival_paused()
    }

    pub fn revived_events(&self) -> broadcast::Receiver<SessionRevived> {
        self.inner.dispatcher.subscribe_revived()
    }
}

impl Inner {
    fn set_status(&self, state: &mut ConnectionState, status: SyncConnectionState) {
        state.status = status;
        self.dispatcher.set_status(status);
    }

    /// Boxed so the reconnect timer can call back into it from a spawned task.
    fn establish(self: Arc<Self>, trigger: Trigger) -> BoxFuture<'static, Result<(), SyncError>> {
        async move { self.run_establish(trigger).await }.boxed()
    }

    async fn run_establish(self: &Arc<Self>, trigger: Trigger) -> Result<(), SyncError> {
        let (url, key, generation, attempt) = {
            let mut state = self.state.lock().await;

            match state.status {
                SyncConnectionState::Connected | SyncConnectionState::Connecting => return Ok(()),
                _ => {}
            }

            match trigger {
                Trigger::Reconnect(scheduled) => {
                    let pending = matches!(state.status, SyncConnectionState::Reconnecting(_));
                    if !pending || !state.reconnect_enabled || state.generation != scheduled {
                        return Ok(());
                    }
                }
                Trigger::Caller => {
                    // After exhaustion or disconnect() the caller gets a fresh budget
                    if !state.reconnect_enabled {
                        state.attempt = 0;
                    }
                    state.reconnect_enabled = self.config.reconnect.enabled;
                    std::mem::take(&mut state.tasks).cancel();
                }
            }

            let key = match state.key.clone() {
                Some(key) => key,
                None => match self.load_key() {
                    Ok(key) => {
                        debug!("derived session key {}", key.fingerprint());
                        state.key = Some(key.clone());
                        key
                    }
                    Err(e) => return Err(self.abandon(&mut state, trigger, e)),
                },
            };

            let url = match self.credentials.auth_token() {
                Some(token) => match transport_url(&self.config.server_url, &token) {
                    Ok(url) => url,
                    Err(e) => return Err(self.abandon(&mut state, trigger, e)),
                },
                None => {
                    let e = SyncError::ConnectionFailed("no auth token available".into());
                    return Err(self.abandon(&mut state, trigger, e));
                }
            };

            state.generation += 1;
            self.set_status(&mut state, SyncConnectionState::Connecting);
            (url, key, state.generation, state.attempt)
        };

        let connection_id = Uuid::new_v4();
        info!(
            %connection_id,
            attempt,
            "connecting to {}",
            self.config.server_url
        );

        let opened = self.connector.open(&url).await;

        let mut state = self.state.lock().await;
        if state.generation != generation {
            debug!(%connection_id, "connection attempt superseded");
            return Err(SyncError::ConnectionFailed(
                "connection attempt was cancelled".into(),
            ));
        }

        let (sink, stream) = match opened {
            Ok(pair) => pair,
            Err(e) => {
                warn!(%connection_id, "connection failed: {}", e);
                self.handle_failure(&mut state, &e.to_string());
                return Err(e);
            }
        };

        let (outbox, queued) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let writer = tokio::spawn(writer_loop(
            self.clone(),
            sink,
            queued,
            generation,
            cancel.clone(),
        ));
        let receive = tokio::spawn(receive_loop(
            self.clone(),
            stream,
            key,
            outbox.clone(),
            generation,
            cancel.clone(),
        ));
        let keepalive = tokio::spawn(keepalive_loop(
            outbox.clone(),
            self.config.ping_interval,
            cancel.clone(),
        ));
        let previous = std::mem::replace(
            &mut state.tasks,
            BackgroundTasks {
                cancel,
                writer: Some(writer),
                handles: vec![receive, keepalive],
            },
        );
        previous.cancel();

        self.set_status(&mut state, SyncConnectionState::Connected);
        info!(%connection_id, "sync connected");

        // Queued under the state lock, so a concurrent subscribe() lands
        // after the replay and is never sent twice.
        let replay: Vec<(String, Delivery)> = state
            .subscriptions
            .iter()
            .map(|session_id| {
                let message = ControlMessage::Subscribe {
                    session_id: session_id.clone(),
                };
                (session_id.clone(), enqueue(&outbox, message))
            })
            .collect();
        state.outbox = Some(outbox);
        drop(state);

        for (session_id, delivery) in replay {
            if let Err(e) = delivered(delivery).await {
                warn!(%connection_id, "failed to restore subscription {}: {}", session_id, e);
                self.dispatcher.publish_error(e);
            }
        }

        let mut state = self.state.lock().await;
        if state.generation == generation && state.status == SyncConnectionState::Connected {
            state.attempt = 0;
        }
        Ok(())
    }

    fn load_key(&self) -> Result<SymmetricKey, SyncError> {
        let material = self
            .credentials
            .key_material()
            .ok_or(SyncError::EncryptionKeyMissing)?;
        material.derive()
    }

    /// A connection attempt that failed before reaching the network. Retrying
    /// will not help, so a background attempt also stops reconnecting.
    fn abandon(
        &self,
        state: &mut ConnectionState,
        trigger: Trigger,
        error: SyncError,
    ) -> SyncError {
        warn!("cannot connect: {}", error);
        if let Trigger::Reconnect(_) = trigger {
            state.reconnect_enabled = false;
            state.generation += 1;
            std::mem::take(&mut state.tasks).cancel();
        }
        self.set_status(state, SyncConnectionState::Disconnected);
        self.dispatcher.publish_error(error.clone());
        error
    }

    /// Tear down the current transport and, if allowed, schedule the next
    /// attempt with backoff. The cancelled writer closes the sink itself.
    fn handle_failure(self: &Arc<Self>, state: &mut ConnectionState, reason: &str) {
        state.generation += 1;
        state.outbox = None;
        std::mem::take(&mut state.tasks).cancel();
        self.set_status(state, SyncConnectionState::Disconnected);

        if !state.reconnect_enabled {
            return;
        }

        let policy = &self.config.reconnect;
        let delay = policy.delay_for(state.attempt);
        state.attempt = state.attempt.saturating_add(1);

        if policy.exhausted(state.attempt) {
            state.reconnect_enabled = false;
            let error = SyncError::ConnectionFailed(format!(
                "giving up after {} reconnection attempts: {}",
                policy.max_attempts, reason
            ));
            warn!("{}", error);
            self.dispatcher.publish_error(error);
            return;
        }

        let attempt = state.attempt;
        self.set_status(state, SyncConnectionState::Reconnecting(attempt));
        info!(attempt, "reconnecting in {:?}", delay);

        let generation = state.generation;
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let inner = self.clone();
        let timer = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = inner.establish(Trigger::Reconnect(generation)).await {
                        debug!("reconnect attempt {} failed: {}", attempt, e);
                    }
                }
            }
        });
        state.tasks = BackgroundTasks {
            cancel,
            writer: None,
            handles: vec![timer],
        };
    }

    /// Called by the receive loop and the writer. Ignored once the generation
    /// has moved on, so a task that lost a race with disconnect() or with its
    /// sibling does nothing.
    async fn connection_lost(self: &Arc<Self>, generation: u64, reason: String) {
        let mut state = self.state.lock().await;
        if state.generation != generation || state.status != SyncConnectionState::Connected {
            return;
        }
        warn!("sync connection lost: {}", reason);
        self.handle_failure(&mut state, &reason);
    }

    fn handle_bundle(&self, bundle: &[u8], key: &SymmetricKey, outbox: &Outbox) {
        let plaintext = match tether_crypto::decrypt(bundle, key) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                let error = SyncError::from(e);
                warn!("dropping undecryptable frame: {}", error);
                self.dispatcher.publish_error(error);
                return;
            }
        };

        match SyncUpdateEnvelope::decode(&plaintext) {
            Ok(envelope) => self.dispatch(envelope, outbox),
            Err(e) => debug!("dropping unrecognized update: {}", e),
        }
    }

    fn dispatch(&self, envelope: SyncUpdateEnvelope, outbox: &Outbox) {
        trace!(kind = envelope.kind(), "update received");
        match envelope {
            SyncUpdateEnvelope::Session { session } => self.dispatcher.publish_session(session),
            SyncUpdateEnvelope::Message { message } => self.dispatcher.publish_message(message),
            SyncUpdateEnvelope::Update { session, message } => {
                if let Some(session) = session {
                    self.dispatcher.publish_session(session);
                }
                if let Some(message) = message {
                    self.dispatcher.publish_message(message);
                }
            }
            SyncUpdateEnvelope::Ping => {
                let pong = Outbound {
                    message: ControlMessage::Pong,
                    done: None,
                };
                if outbox.send(pong).is_err() {
                    debug!("connection closing, ping left unanswered");
                }
            }
            SyncUpdateEnvelope::Pong => trace!("keepalive acknowledged"),
            SyncUpdateEnvelope::Subscribe { session_id } => {
                debug!("server confirmed subscription to {}", session_id)
            }
            SyncUpdateEnvelope::Unsubscribe { session_id } => {
                debug!("server confirmed unsubscription from {}", session_id)
            }
            SyncUpdateEnvelope::SessionRevivalPaused(event) => {
                info!(
                    machine_id = %event.machine_id,
                    "session revival paused for {}ms: {}",
                    event.remaining_ms,
                    event.reason
                );
                self.dispatcher.publish_revival_paused(event);
            }
            SyncUpdateEnvelope::SessionRevived(event) => {
                info!(
                    "session {} revived as {}",
                    event.original_session_id, event.new_session_id
                );
                self.dispatcher.publish_revived(event);
            }
            SyncUpdateEnvelope::SessionRevivalFailed { session_id, reason } => {
                warn!("session {} could not be revived: {}", session_id, reason);
                self.dispatcher
                    .publish_error(SyncError::SessionRevivalFailed { session_id, reason });
            }
        }
    }
}

fn enqueue(outbox: &Outbox, message: ControlMessage) -> Delivery {
    let (done, delivery) = oneshot::channel();
    // A closed queue drops `done`, which `delivered` reports as a send failure
    let _ = outbox.send(Outbound {
        message,
        done: Some(done),
    });
    delivery
}

async fn delivered(delivery: Delivery) -> Result<(), SyncError> {
    delivery.await.unwrap_or_else(|_| {
        Err(SyncError::SendFailed(
            "connection closed before the message was written".into(),
        ))
    })
}

/// Sole owner of the sink. Writes queued control messages in order, each
/// bounded by `send_timeout`; the first failure drops the connection.
async fn writer_loop(
    inner: Arc<Inner>,
    mut sink: FrameSink,
    mut queued: mpsc::UnboundedReceiver<Outbound>,
    generation: u64,
    cancel: CancellationToken,
) {
    let send_timeout = inner.config.send_timeout;

    loop {
        let outbound = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = queued.recv() => match next {
                Some(outbound) => outbound,
                None => break,
            },
        };

        let write = tokio::time::timeout(send_timeout, write_control(&mut sink, &outbound.message));
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = write => {
                result.unwrap_or_else(|_| {
                    Err(SyncError::SendFailed(format!(
                        "write timed out after {:?}",
                        send_timeout
                    )))
                })
            }
        };

        let failure = result.as_ref().err().map(ToString::to_string);
        if let Some(done) = outbound.done {
            let _ = done.send(result);
        }
        if let Some(reason) = failure {
            inner.connection_lost(generation, reason).await;
            break;
        }
    }

    close_sink(&mut sink, inner.config.close_timeout).await;
}

/// Reads frames in arrival order until the transport fails or the loop is
/// cancelled. Undecryptable or unrecognized frames are skipped.
async fn receive_loop(
    inner: Arc<Inner>,
    mut stream: FrameStream,
    key: SymmetricKey,
    outbox: Outbox,
    generation: u64,
    cancel: CancellationToken,
) {
    let reason = loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(Frame::Binary(bundle))) => inner.handle_bundle(&bundle, &key, &outbox),
            Some(Ok(Frame::Text(text))) => match BASE64.decode(text.trim()) {
                Ok(bundle) => inner.handle_bundle(&bundle, &key, &outbox),
                Err(e) => {
                    warn!("dropping text frame that is not base64: {}", e);
                    inner
                        .dispatcher
                        .publish_error(SyncError::DecryptionFailed(format!(
                            "text frame is not base64: {}",
                            e
                        )));
                }
            },
            Some(Ok(Frame::Close)) => break "server closed the connection".to_string(),
            Some(Err(e)) => break e.to_string(),
            None => break "transport stream ended".to_string(),
        }
    };

    inner.connection_lost(generation, reason).await;
}

/// Queues a ping every `period`. A ping that cannot be written in time fails
/// in the writer, which drops the connection.
async fn keepalive_loop(outbox: Outbox, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick is immediate
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        trace!("queueing keepalive ping");
        let ping = Outbound {
            message: ControlMessage::Ping,
            done: None,
        };
        if outbox.send(ping).is_err() {
            return;
        }
    }
}

/// Control messages go out as plaintext JSON text frames.
async fn write_control(sink: &mut FrameSink, message: &ControlMessage) -> Result<(), SyncError> {
    let text = message
        .encode()
        .map_err(|e| SyncError::SendFailed(e.to_string()))?;
    sink.send(Frame::Text(text)).await
}

async fn close_sink(sink: &mut FrameSink, timeout: Duration) {
    match tokio::time::timeout(timeout, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("transport close failed: {}", e),
        Err(_) => debug!("transport close timed out after {:?}", timeout),
    }
}
