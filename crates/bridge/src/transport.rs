//! Message transports the bridge peers run over.
//!
//! The peers only need an ordered bidirectional text-message channel with a
//! distinguishable closed state, so that is the whole trait. Production uses
//! WebSocket frames; tests use an in-process duplex.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use tabrelay_core::{Error, Result};

#[async_trait]
pub trait Transport: Send {
    /// Send one text frame. An error means the connection is unusable.
    async fn send(&mut self, text: String) -> Result<()>;

    /// Receive the next text frame. `None` means the peer closed cleanly;
    /// `Some(Err(_))` means the connection failed.
    async fn recv(&mut self) -> Option<Result<String>>;

    async fn close(&mut self);
}

// ─── WebSocket ───────────────────────────────────────────────────────────────

/// Transport over a WebSocket stream, either a client connection or one
/// accepted by the executor's listener.
pub struct WsTransport<S> {
    stream: WebSocketStream<S>,
}

impl<S> WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, text: String) -> Result<()> {
        self.stream
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| Error::Transport(format!("WebSocket write failed: {}", e)))
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.stream.next().await? {
                Ok(WsMessage::Text(text)) => return Some(Ok(text)),
                Ok(WsMessage::Close(_)) => {
                    debug!("WebSocket closed by peer");
                    return None;
                }
                // Pings are answered by tungstenite internally; pong and
                // binary frames mean nothing to this protocol.
                Ok(_) => continue,
                Err(e) => {
                    return Some(Err(Error::Transport(format!(
                        "WebSocket read failed: {}",
                        e
                    ))))
                }
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

// ─── In-memory duplex (tests) ────────────────────────────────────────────────

/// One end of an in-process duplex channel. Dropping an end closes the
/// counterpart's receive side.
pub struct MemoryTransport {
    tx: mpsc::Sender<String>,
    rx: mpsc::Receiver<String>,
}

/// Build a connected pair of in-memory transports.
pub fn memory_pair() -> (MemoryTransport, MemoryTransport) {
    let (a_tx, a_rx) = mpsc::channel(64);
    let (b_tx, b_rx) = mpsc::channel(64);
    (
        MemoryTransport { tx: a_tx, rx: b_rx },
        MemoryTransport { tx: b_tx, rx: a_rx },
    )
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, text: String) -> Result<()> {
        self.tx
            .send(text)
            .await
            .map_err(|_| Error::Transport("memory channel closed".to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}
