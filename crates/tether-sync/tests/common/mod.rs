//! In-memory sync server for driving `SyncService` without a network.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use futures_util::{Sink, sink, stream};
use tokio::sync::mpsc;
use url::Url;

use tether_crypto::{KeyPair, SymmetricKey};
use tether_sync::{
    Connector, Frame, FrameSink, FrameStream, KeyMaterial, StaticCredentials, SyncConfig,
    SyncError, SyncService,
};

pub const BASE_URL: &str = "http://sync.test/v1/updates";
pub const TOKEN: &str = "test-token";

/// Upper bound for anything the tests wait on. Time is paused, so this only
/// matters when something is genuinely stuck.
pub const WAIT: Duration = Duration::from_secs(120);

pub struct MockConnector {
    key: SymmetricKey,
    refuse: AtomicBool,
    stall: AtomicBool,
    opens: AtomicUsize,
    urls: Mutex<Vec<Url>>,
    servers: mpsc::UnboundedSender<MockServer>,
}

impl MockConnector {
    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Hand out transports whose writes never complete. The inbound side
    /// still works.
    pub fn stall_writes(&self, stall: bool) {
        self.stall.store(stall, Ordering::SeqCst);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<Url> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, url: &Url) -> Result<(FrameSink, FrameStream), SyncError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.clone());
        if self.refuse.load(Ordering::SeqCst) {
            return Err(SyncError::ConnectionFailed("connection refused".into()));
        }

        let (to_client, from_server) = mpsc::unbounded_channel::<Result<Frame, SyncError>>();
        let (to_server, from_client) = mpsc::unbounded_channel::<Frame>();

        let client_sink = sink::unfold(to_server, |tx, frame: Frame| async move {
            tx.send(frame)
                .map_err(|_| SyncError::SendFailed("server stopped reading".into()))?;
            Ok::<_, SyncError>(tx)
        });
        let client_stream = stream::unfold(from_server, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        let _ = self.servers.send(MockServer {
            url: url.clone(),
            key: self.key.clone(),
            outbound: Some(to_client),
            inbound: Some(from_client),
        });

        let client_sink: FrameSink = if self.stall.load(Ordering::SeqCst) {
            Box::pin(StalledSink)
        } else {
            Box::pin(client_sink)
        };
        Ok((client_sink, Box::pin(client_stream)))
    }
}

/// A peer that stopped draining its socket: nothing ever becomes ready,
/// not even the close handshake.
struct StalledSink;

impl Sink<Frame> for StalledSink {
    type Error = SyncError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), SyncError>> {
        Poll::Pending
    }

    fn start_send(self: Pin<&mut Self>, _item: Frame) -> Result<(), SyncError> {
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), SyncError>> {
        Poll::Pending
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), SyncError>> {
        Poll::Pending
    }
}

/// Server side of one accepted connection.
pub struct MockServer {
    pub url: Url,
    key: SymmetricKey,
    outbound: Option<mpsc::UnboundedSender<Result<Frame, SyncError>>>,
    inbound: Option<mpsc::UnboundedReceiver<Frame>>,
}

impl MockServer {
    fn send(&self, frame: Result<Frame, SyncError>) {
        if let Some(tx) = &self.outbound {
            let _ = tx.send(frame);
        }
    }

    /// Encrypt a JSON payload as a v0 bundle and send it as a binary frame.
    pub fn push_json(&self, payload: serde_json::Value) {
        let bundle = tether_crypto::encrypt(payload.to_string().as_bytes(), &self.key).unwrap();
        self.push_bundle(bundle);
    }

    pub fn push_bundle(&self, bundle: Vec<u8>) {
        self.send(Ok(Frame::Binary(Bytes::from(bundle))));
    }

    /// Send a bundle base64-encoded in a text frame.
    pub fn push_text_bundle(&self, bundle: &[u8]) {
        self.send(Ok(Frame::Text(BASE64.encode(bundle))));
    }

    pub fn push_raw_text(&self, text: &str) {
        self.send(Ok(Frame::Text(text.to_string())));
    }

    pub fn push_error(&self, reason: &str) {
        self.send(Err(SyncError::ConnectionFailed(reason.to_string())));
    }

    /// End the inbound stream as if the socket dropped.
    pub fn hang_up(&mut self) {
        self.outbound = None;
    }

    /// Make every further client write fail.
    pub fn stop_reading(&mut self) {
        self.inbound = None;
    }

    pub fn key(&self) -> &SymmetricKey {
        &self.key
    }

    /// Next frame written by the client, or `None` if nothing arrives in time.
    pub async fn next_sent_within(&mut self, limit: Duration) -> Option<Frame> {
        let rx = self.inbound.as_mut()?;
        tokio::time::timeout(limit, rx.recv()).await.ok().flatten()
    }

    /// Next control message written by the client, parsed as JSON.
    pub async fn next_control(&mut self) -> serde_json::Value {
        match self.next_sent_within(WAIT).await {
            Some(Frame::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text control frame, got {:?}", other),
        }
    }

    pub async fn assert_quiet(&mut self, limit: Duration) {
        if let Some(frame) = self.next_sent_within(limit).await {
            panic!("unexpected frame from client: {:?}", frame);
        }
    }
}

pub struct Harness {
    pub service: SyncService,
    pub connector: Arc<MockConnector>,
    pub credentials: Arc<StaticCredentials>,
    servers: mpsc::UnboundedReceiver<MockServer>,
}

impl Harness {
    pub async fn next_server(&mut self) -> MockServer {
        tokio::time::timeout(WAIT, self.servers.recv())
            .await
            .expect("no connection was opened")
            .expect("connector dropped")
    }
}

pub fn config() -> SyncConfig {
    SyncConfig::new(Url::parse(BASE_URL).unwrap())
}

/// A service paired with a fresh key pair, talking to a mock connector that
/// encrypts with the matching key.
pub fn harness(config: SyncConfig) -> Harness {
    let ours = KeyPair::generate();
    let theirs = KeyPair::generate();
    let shared = KeyMaterial::new(theirs.secret_key(), ours.public_key())
        .derive()
        .unwrap();

    let credentials = Arc::new(StaticCredentials::new(
        TOKEN,
        Some(KeyMaterial::new(ours.secret_key(), theirs.public_key())),
    ));
    harness_with(config, credentials, shared)
}

pub fn harness_with(
    config: SyncConfig,
    credentials: Arc<StaticCredentials>,
    server_key: SymmetricKey,
) -> Harness {
    let (servers_tx, servers) = mpsc::unbounded_channel();
    let connector = Arc::new(MockConnector {
        key: server_key,
        refuse: AtomicBool::new(false),
        stall: AtomicBool::new(false),
        opens: AtomicUsize::new(0),
        urls: Mutex::new(Vec::new()),
        servers: servers_tx,
    });
    let service = SyncService::new(config, connector.clone(), credentials.clone());
    Harness {
        service,
        connector,
        credentials,
        servers,
    }
}

/// Let every spawned task run until it blocks. With paused time this only
/// returns once the runtime is otherwise idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub fn session_json(id: &str, seq: u64) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "seq": seq,
        "created_at": 1_700_000_000_000i64,
        "updated_at": 1_700_000_000_000i64 + seq as i64,
        "active": true,
    })
}

pub fn message_json(id: &str, session_id: &str, seq: u64) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "session_id": session_id,
        "seq": seq,
        "content": "encrypted-content",
        "created_at": 1_700_000_000_000i64,
    })
}
