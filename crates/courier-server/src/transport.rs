//! Outbound side of a client connection.
//!
//! The write pump only knows [`EventSink`]; the WebSocket sender and the
//! in-memory channel used by tests both implement it.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use courier_core::events::Event;
use futures::SinkExt;
use futures::stream::SplitSink;
use thiserror::Error;
use tokio::sync::mpsc;

/// Failure writing to a client transport.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The peer is gone.
    #[error("transport closed")]
    Closed,
    /// The event could not be encoded.
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
    /// Underlying transport error.
    #[error("transport error: {0}")]
    Io(String),
}

/// Something a session can write events to.
#[async_trait]
pub trait EventSink: Send {
    /// Write one event.
    async fn send(&mut self, event: &Event) -> Result<(), SinkError>;

    /// Flush and close. Errors are ignored.
    async fn close(&mut self) {}
}

/// JSON text frames over the write half of an Axum WebSocket.
pub struct WsSink {
    inner: SplitSink<WebSocket, Message>,
}

impl WsSink {
    /// Wrap the write half of a split socket.
    pub fn new(inner: SplitSink<WebSocket, Message>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl EventSink for WsSink {
    async fn send(&mut self, event: &Event) -> Result<(), SinkError> {
        let json = serde_json::to_string(event)?;
        self.inner
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| SinkError::Io(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.inner.send(Message::Close(None)).await;
        let _ = self.inner.close().await;
    }
}

/// Forwards events into an unbounded channel.
#[derive(Clone, Debug)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelSink {
    /// Sink plus the receiver observing what was written.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn send(&mut self, event: &Event) -> Result<(), SinkError> {
        self.tx.send(event.clone()).map_err(|_| SinkError::Closed)
    }
}
