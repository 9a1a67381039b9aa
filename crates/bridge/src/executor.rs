//! Executor peer: owns the command registry, answers call frames.
//!
//! Handlers run as spawned tasks so a slow operation never blocks decoding
//! of the next incoming call; responses are funneled back through a channel
//! and may leave in any order. Correlation, not ordering, is the contract.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tabrelay_core::protocol::{CallOutcome, WireMessage};
use tabrelay_core::Result;

use crate::registry::CommandRegistry;
use crate::transport::{Transport, WsTransport};

#[derive(Clone)]
pub struct Executor {
    registry: Arc<CommandRegistry>,
}

enum Event {
    Incoming(Option<Result<String>>),
    Outgoing(Option<String>),
}

impl Executor {
    pub fn new(registry: CommandRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    /// Accept extension connections on `listener`. At most one connection is
    /// served at a time; a newly arriving connection replaces the previous
    /// one as the sole active channel. The registry holds no per-connection
    /// state, so replacement does not disturb it.
    pub async fn listen(
        &self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let mut active: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Executor listener shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };
                    let ws = match tokio_tungstenite::accept_async(stream).await {
                        Ok(ws) => ws,
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "WebSocket handshake failed");
                            continue;
                        }
                    };
                    if let Some(previous) = active.take() {
                        info!(peer = %peer, "New connection replaces the active one");
                        previous.abort();
                    } else {
                        info!(peer = %peer, "Extension connected");
                    }
                    let executor = self.clone();
                    active = Some(tokio::spawn(async move {
                        executor.run_on(Box::new(WsTransport::new(ws))).await;
                    }));
                }
            }
        }

        if let Some(previous) = active.take() {
            previous.abort();
        }
        Ok(())
    }

    /// Serve one connection until the peer closes or the transport fails.
    pub async fn run_on(&self, mut transport: Box<dyn Transport>) {
        let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
        // Call ids currently being handled; guards against a duplicate call
        // id invoking its handler twice or being answered twice.
        let in_flight: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

        loop {
            let event = tokio::select! {
                incoming = transport.recv() => Event::Incoming(incoming),
                outgoing = out_rx.recv() => Event::Outgoing(outgoing),
            };

            match event {
                Event::Incoming(None) => {
                    info!("Connection closed by peer");
                    break;
                }
                Event::Incoming(Some(Err(e))) => {
                    warn!(error = %e, "Transport failed");
                    break;
                }
                Event::Incoming(Some(Ok(text))) => match WireMessage::decode(&text) {
                    Ok(WireMessage::Call {
                        id,
                        operation,
                        arguments,
                    }) => {
                        {
                            let mut guard = in_flight.lock().await;
                            if !guard.insert(id.clone()) {
                                warn!(id = %id, operation = %operation, "Duplicate call id, dropping");
                                continue;
                            }
                        }
                        self.spawn_handler(id, operation, arguments, out_tx.clone(), in_flight.clone());
                    }
                    Ok(WireMessage::Keepalive) => {
                        debug!("Keepalive received");
                    }
                    Ok(WireMessage::Response { id, .. }) => {
                        debug!(id = %id, "Unexpected response frame at executor, dropping");
                    }
                    Err(e) => {
                        warn!(error = %e, "Dropping malformed frame");
                    }
                },
                Event::Outgoing(Some(frame)) => {
                    if let Err(e) = transport.send(frame).await {
                        warn!(error = %e, "Failed to send response");
                        break;
                    }
                }
                // All senders live as long as this loop, so this arm is
                // unreachable in practice.
                Event::Outgoing(None) => break,
            }
        }

        transport.close().await;
    }

    /// Run one handler concurrently with the serve loop and queue exactly
    /// one response for it. A handler panic is caught at this boundary and
    /// converted into an error response; it never takes the connection down.
    fn spawn_handler(
        &self,
        id: String,
        operation: String,
        arguments: serde_json::Value,
        out_tx: mpsc::Sender<String>,
        in_flight: Arc<Mutex<HashSet<String>>>,
    ) {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            debug!(id = %id, operation = %operation, "Dispatching call");
            let op = operation.clone();
            let dispatched =
                tokio::spawn(async move { registry.dispatch(&op, arguments).await });
            let outcome = match dispatched.await {
                Ok(Ok(value)) => CallOutcome::Success(value),
                Ok(Err(message)) => CallOutcome::Failure(message),
                Err(e) if e.is_panic() => {
                    warn!(operation = %operation, "Handler panicked");
                    CallOutcome::Failure(format!("operation '{}' panicked", operation))
                }
                Err(_) => CallOutcome::Failure(format!("operation '{}' was cancelled", operation)),
            };

            let response = WireMessage::Response {
                id: id.clone(),
                outcome,
            };
            let _ = out_tx.send(response.encode()).await;
            in_flight.lock().await.remove(&id);
        });
    }
}
