use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use url::Url;

use crate::error::SyncError;

/// One transport frame, independent of the socket library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Outbound: plaintext JSON control message.
    /// Inbound: base64 of an encrypted bundle.
    Text(String),
    /// Inbound: raw encrypted bundle.
    Binary(Bytes),
    Close,
}

impl Frame {
    fn into_message(self) -> Message {
        match self {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(data) => Message::Binary(data),
            Frame::Close => Message::Close(None),
        }
    }

    /// Socket-level ping/pong is answered by tungstenite and never surfaces.
    fn from_message(message: Message) -> Option<Self> {
        match message {
            Message::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
            Message::Binary(data) => Some(Frame::Binary(data)),
            Message::Close(_) => Some(Frame::Close),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => None,
        }
    }
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = SyncError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, SyncError>> + Send>>;

/// Opens the bidirectional transport. Injectable so the connection state
/// machine can run against an in-memory server.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &Url) -> Result<(FrameSink, FrameStream), SyncError>;
}

/// WebSocket transport over tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &Url) -> Result<(FrameSink, FrameStream), SyncError> {
        let (socket, response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| SyncError::ConnectionFailed(e.to_string()))?;
        debug!("websocket upgrade completed with status {}", response.status());

        let (sink, stream) = socket.split();

        let sink = sink
            .sink_map_err(|e| SyncError::SendFailed(e.to_string()))
            .with(|frame: Frame| future::ready(Ok::<_, SyncError>(frame.into_message())));

        let stream = stream.filter_map(|result| {
            future::ready(match result {
                Ok(message) => Frame::from_message(message).map(Ok),
                Err(e) => Some(Err(SyncError::ConnectionFailed(e.to_string()))),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}
