//! Transport abstraction for the duplex service connection.
//!
//! The session state machine talks to a [`Transport`] rather than a raw
//! WebSocket so tests can substitute a channel-backed mock. The production
//! implementation, [`WsTransport`], rides on tokio-tungstenite.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::{Result, StreamscribeError};

/// A message on the duplex connection: JSON control text or a raw PCM frame.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl WireMessage {
    pub fn len(&self) -> usize {
        match self {
            Self::Text(t) => t.len(),
            Self::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Connection factory. One `connect` call per (re)connection attempt.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn MessageSink>, Box<dyn MessageStream>)>;
}

/// Outbound half of an open connection.
#[async_trait]
pub trait MessageSink: Send {
    async fn send(&mut self, msg: WireMessage) -> Result<()>;

    /// Bytes accepted but not yet flushed to the peer. Used for the
    /// high-water-mark backpressure check before control sends.
    fn buffered_bytes(&self) -> usize {
        0
    }

    async fn close(&mut self);
}

/// Inbound half of an open connection. `None` means the peer closed.
#[async_trait]
pub trait MessageStream: Send {
    async fn next(&mut self) -> Option<Result<WireMessage>>;
}

// ── WebSocket transport ───────────────────────────────────────────

type WsSplitSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    WsMessage,
>;
type WsSplitStream = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

/// Production transport over tokio-tungstenite.
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn MessageSink>, Box<dyn MessageStream>)> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| StreamscribeError::Connect {
                message: e.to_string(),
            })?;
        let (sink, stream) = ws_stream.split();
        Ok((
            Box::new(WsSink { sink }),
            Box::new(WsStream { stream }),
        ))
    }
}

struct WsSink {
    sink: WsSplitSink,
}

#[async_trait]
impl MessageSink for WsSink {
    async fn send(&mut self, msg: WireMessage) -> Result<()> {
        let ws_msg = match msg {
            WireMessage::Text(t) => WsMessage::Text(t.into()),
            WireMessage::Binary(b) => WsMessage::Binary(b.into()),
        };
        self.sink
            .send(ws_msg)
            .await
            .map_err(|e| StreamscribeError::Send {
                message: e.to_string(),
            })
    }

    async fn close(&mut self) {
        let _ = self.sink.send(WsMessage::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

struct WsStream {
    stream: WsSplitStream,
}

#[async_trait]
impl MessageStream for WsStream {
    async fn next(&mut self) -> Option<Result<WireMessage>> {
        while let Some(msg) = self.stream.next().await {
            match msg {
                Ok(WsMessage::Text(t)) => {
                    return Some(Ok(WireMessage::Text(t.as_str().to_owned())))
                }
                Ok(WsMessage::Binary(b)) => return Some(Ok(WireMessage::Binary(b.to_vec()))),
                Ok(WsMessage::Close(frame)) => {
                    tracing::debug!(close_frame = ?frame, "Transport closed by peer");
                    return None;
                }
                // Control frames are handled by tungstenite automatically.
                Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => continue,
                Err(e) => {
                    return Some(Err(StreamscribeError::Send {
                        message: e.to_string(),
                    }))
                }
            }
        }
        None
    }
}

// ── Channel-backed mock for tests ─────────────────────────────────
