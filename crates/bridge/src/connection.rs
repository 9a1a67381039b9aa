//! Connection-lifecycle pieces: channel state, bounded reconnect backoff,
//! and the pluggable connector the dispatcher opens its channel through.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream};

use tabrelay_core::config::ReconnectConfig;
use tabrelay_core::{Error, Result};

use crate::transport::{Transport, WsTransport};

/// State of the single bridge channel. The cycle is
/// `Disconnected → Connecting → Connected → Disconnected → …`; there is no
/// terminal state, shutdown is an external signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

/// Bounded exponential backoff between connection attempts. The delay
/// doubles from the floor up to the ceiling and resets to the floor after a
/// successful connect; retrying never stops.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl ReconnectPolicy {
    pub fn new(config: &ReconnectConfig) -> Self {
        let floor = Duration::from_millis(config.floor_ms.max(1));
        let ceiling = Duration::from_millis(config.ceiling_ms).max(floor);
        Self {
            floor,
            ceiling,
            current: floor,
        }
    }

    /// Delay to sleep before the next attempt; grows on every use.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.ceiling);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

/// Opens the physical channel. Abstracted so tests can script connection
/// attempts; production uses [`WsConnector`].
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>>;
}

/// Connects to the executor's WebSocket endpoint.
pub struct WsConnector {
    endpoint: String,
}

impl WsConnector {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let endpoint = endpoint.into();
        url::Url::parse(&endpoint)
            .map_err(|e| Error::Config(format!("invalid endpoint '{}': {}", endpoint, e)))?;
        Ok(Self { endpoint })
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        let (stream, _) = connect_async(self.endpoint.as_str())
            .await
            .map_err(|e| Error::Transport(format!("connect to {} failed: {}", self.endpoint, e)))?;
        let transport: WsTransport<MaybeTlsStream<TcpStream>> = WsTransport::new(stream);
        Ok(Box::new(transport))
    }
}
