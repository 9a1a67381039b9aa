//! Dispatcher peer: turns outer tool invocations into correlated calls.
//!
//! Each submitted call gets a fresh correlation id and a pending entry
//! holding its completion handle. The entry is completed exactly once: by
//! the matching response, by bulk failure when the channel is lost, or by
//! the per-call timeout. Calls submitted while the channel is down are
//! queued and flushed on the next connect.
//!
//! The same struct drives the connection lifecycle: [`Dispatcher::run`] is
//! the reconnect loop that owns the single physical channel, emits
//! keepalive traffic, and moves the channel state through
//! `Disconnected → Connecting → Connected` cycles.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use tabrelay_core::config::{BridgeConfig, ReconnectConfig};
use tabrelay_core::protocol::{CallOutcome, WireMessage};
use tabrelay_core::{Error, Result};

use crate::connection::{ChannelState, Connector, ReconnectPolicy};
use crate::transport::Transport;

struct PendingCall {
    tx: oneshot::Sender<Result<CallOutcome>>,
    /// Operation name, kept for diagnostics only.
    operation: String,
    submitted_at: Instant,
    /// Whether the call frame went out on the currently active channel.
    /// Unsent calls survive a disconnect and are flushed on reconnect.
    sent: bool,
}

struct QueuedFrame {
    id: String,
    frame: String,
}

/// Pending table, outbox and channel state are mutated from both the submit
/// path and the connection loop, so they live behind one combined lock.
struct State {
    channel: ChannelState,
    pending: HashMap<String, PendingCall>,
    outbox: VecDeque<QueuedFrame>,
    out_tx: Option<mpsc::Sender<String>>,
}

enum ConnectionEnd {
    Lost,
    Shutdown,
}

#[derive(Clone)]
pub struct Dispatcher {
    state: Arc<Mutex<State>>,
    call_timeout: Duration,
    keepalive_interval: Duration,
    reconnect: ReconnectConfig,
}

impl Dispatcher {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                channel: ChannelState::Disconnected,
                pending: HashMap::new(),
                outbox: VecDeque::new(),
                out_tx: None,
            })),
            call_timeout: Duration::from_millis(config.call_timeout_ms),
            keepalive_interval: Duration::from_millis(config.keepalive_interval_ms),
            reconnect: config.reconnect.clone(),
        }
    }

    pub async fn channel_state(&self) -> ChannelState {
        self.state.lock().await.channel
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Invoke a named operation on the executor side and wait for its
    /// result. Fails with [`Error::Operation`] when the handler reports an
    /// error, [`Error::ConnectionLost`] when the channel drops while the
    /// call is in flight, or [`Error::Timeout`] when no response arrives in
    /// the configured window.
    pub async fn submit(&self, operation: &str, arguments: Value) -> Result<Value> {
        let id = Uuid::new_v4().to_string();
        let frame = WireMessage::Call {
            id: id.clone(),
            operation: operation.to_string(),
            arguments,
        }
        .encode();
        let (tx, rx) = oneshot::channel();

        let sender = {
            let mut state = self.state.lock().await;
            let connected = state.channel == ChannelState::Connected;
            state.pending.insert(
                id.clone(),
                PendingCall {
                    tx,
                    operation: operation.to_string(),
                    submitted_at: Instant::now(),
                    sent: connected,
                },
            );
            if connected {
                state.out_tx.clone()
            } else {
                debug!(id = %id, operation = %operation, "Channel down, queueing call");
                state.outbox.push_back(QueuedFrame {
                    id: id.clone(),
                    frame: frame.clone(),
                });
                None
            }
        };

        if let Some(out_tx) = sender {
            if let Err(returned) = out_tx.send(frame).await {
                // The connection went down between the state check and the
                // send; requeue so the call rides the next connection.
                let mut state = self.state.lock().await;
                let still_pending = match state.pending.get_mut(&id) {
                    Some(entry) => {
                        entry.sent = false;
                        true
                    }
                    None => false,
                };
                if still_pending {
                    state.outbox.push_back(QueuedFrame {
                        id: id.clone(),
                        frame: returned.0,
                    });
                }
            }
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(Ok(CallOutcome::Success(value)))) => Ok(value),
            Ok(Ok(Ok(CallOutcome::Failure(message)))) => Err(Error::Operation(message)),
            Ok(Ok(Err(e))) => Err(e),
            // Completion handle dropped without a verdict; only reachable if
            // the dispatcher itself is torn down mid-call.
            Ok(Err(_)) => Err(Error::ConnectionLost),
            Err(_) => {
                let mut state = self.state.lock().await;
                state.pending.remove(&id);
                state.outbox.retain(|q| q.id != id);
                warn!(id = %id, operation = %operation, "Call timed out");
                Err(Error::Timeout(operation.to_string()))
            }
        }
    }

    /// Connection-manager loop. Keeps exactly one channel alive: connect,
    /// flush queued calls, pump frames and keepalives, and on loss fail the
    /// in-flight calls and retry with bounded backoff. Runs until the
    /// shutdown signal fires.
    pub async fn run(&self, connector: Arc<dyn Connector>, mut shutdown: broadcast::Receiver<()>) {
        let mut policy = ReconnectPolicy::new(&self.reconnect);

        loop {
            self.set_channel(ChannelState::Connecting).await;
            let attempt = tokio::select! {
                result = connector.connect() => result,
                _ = shutdown.recv() => {
                    self.set_channel(ChannelState::Disconnected).await;
                    info!("Dispatcher shutting down");
                    return;
                }
            };

            match attempt {
                Err(e) => {
                    self.set_channel(ChannelState::Disconnected).await;
                    let delay = policy.next_delay();
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "Connection attempt failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.recv() => {
                            info!("Dispatcher shutting down");
                            return;
                        }
                    }
                }
                Ok(mut transport) => {
                    policy.reset();
                    info!("Channel connected");
                    let (out_tx, out_rx) = mpsc::channel::<String>(64);
                    let backlog = self.on_connected(out_tx).await;

                    let mut end = ConnectionEnd::Lost;
                    let mut flushed = true;
                    for frame in backlog {
                        if transport.send(frame).await.is_err() {
                            warn!("Channel failed while flushing queued calls");
                            flushed = false;
                            break;
                        }
                    }
                    if flushed {
                        end = self
                            .pump(transport.as_mut(), out_rx, &mut shutdown)
                            .await;
                    }

                    self.on_disconnected().await;
                    match end {
                        ConnectionEnd::Shutdown => {
                            info!("Dispatcher shutting down");
                            return;
                        }
                        ConnectionEnd::Lost => {
                            let delay = policy.next_delay();
                            info!(delay_ms = delay.as_millis() as u64, "Channel lost, reconnecting");
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = shutdown.recv() => {
                                    info!("Dispatcher shutting down");
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Pump one live connection: incoming frames, outgoing calls, keepalive
    /// ticks. Returns when the channel dies or shutdown fires.
    async fn pump(
        &self,
        transport: &mut dyn Transport,
        mut out_rx: mpsc::Receiver<String>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> ConnectionEnd {
        enum Event {
            Incoming(Option<Result<String>>),
            Outgoing(Option<String>),
            KeepaliveTick,
            Shutdown,
        }

        let mut keepalive = tokio::time::interval(self.keepalive_interval);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                incoming = transport.recv() => Event::Incoming(incoming),
                outgoing = out_rx.recv() => Event::Outgoing(outgoing),
                _ = keepalive.tick() => Event::KeepaliveTick,
                _ = shutdown.recv() => Event::Shutdown,
            };

            match event {
                Event::Incoming(None) => {
                    info!("Channel closed by executor");
                    return ConnectionEnd::Lost;
                }
                Event::Incoming(Some(Err(e))) => {
                    warn!(error = %e, "Transport failed");
                    return ConnectionEnd::Lost;
                }
                Event::Incoming(Some(Ok(text))) => self.handle_frame(&text).await,
                Event::Outgoing(Some(frame)) => {
                    if transport.send(frame).await.is_err() {
                        return ConnectionEnd::Lost;
                    }
                }
                // The dispatcher state holds the sender for the lifetime of
                // the connection, so the queue never closes first.
                Event::Outgoing(None) => return ConnectionEnd::Lost,
                Event::KeepaliveTick => {
                    if transport.send(WireMessage::Keepalive.encode()).await.is_err() {
                        return ConnectionEnd::Lost;
                    }
                }
                Event::Shutdown => {
                    transport.close().await;
                    return ConnectionEnd::Shutdown;
                }
            }
        }
    }

    async fn handle_frame(&self, text: &str) {
        match WireMessage::decode(text) {
            Ok(WireMessage::Response { id, outcome }) => {
                let entry = self.state.lock().await.pending.remove(&id);
                match entry {
                    Some(entry) => {
                        debug!(
                            id = %id,
                            operation = %entry.operation,
                            elapsed_ms = entry.submitted_at.elapsed().as_millis() as u64,
                            "Call completed"
                        );
                        let _ = entry.tx.send(Ok(outcome));
                    }
                    // Already completed, timed out, or never ours. Not an
                    // error condition for this peer.
                    None => debug!(id = %id, "Response matches no pending call, discarding"),
                }
            }
            Ok(WireMessage::Keepalive) => debug!("Keepalive received"),
            Ok(WireMessage::Call { id, .. }) => {
                debug!(id = %id, "Unexpected call frame at dispatcher, dropping")
            }
            Err(e) => warn!(error = %e, "Dropping malformed frame"),
        }
    }

    async fn set_channel(&self, channel: ChannelState) {
        self.state.lock().await.channel = channel;
    }

    /// Enter `Connected`: install the outgoing queue and drain the outbox.
    /// Returns the frames to flush; queued calls whose entry disappeared in
    /// the meantime (per-call timeout) are silently dropped.
    async fn on_connected(&self, out_tx: mpsc::Sender<String>) -> Vec<String> {
        let mut state = self.state.lock().await;
        state.channel = ChannelState::Connected;
        state.out_tx = Some(out_tx);
        let mut backlog = Vec::new();
        while let Some(queued) = state.outbox.pop_front() {
            if let Some(entry) = state.pending.get_mut(&queued.id) {
                entry.sent = true;
                backlog.push(queued.frame);
            }
        }
        if !backlog.is_empty() {
            info!(count = backlog.len(), "Flushing calls queued while disconnected");
        }
        backlog
    }

    /// Enter `Disconnected`: every call that was in flight on the lost
    /// channel fails now; queued-but-unsent calls stay for the next connect.
    async fn on_disconnected(&self) {
        let mut state = self.state.lock().await;
        state.channel = ChannelState::Disconnected;
        state.out_tx = None;
        let lost: Vec<String> = state
            .pending
            .iter()
            .filter(|(_, entry)| entry.sent)
            .map(|(id, _)| id.clone())
            .collect();
        if !lost.is_empty() {
            info!(count = lost.len(), "Failing calls pending on the lost channel");
        }
        for id in lost {
            if let Some(entry) = state.pending.remove(&id) {
                let _ = entry.tx.send(Err(Error::ConnectionLost));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connector;
    use crate::executor::Executor;
    use crate::registry::CommandRegistry;
    use crate::transport::{memory_pair, MemoryTransport};
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::task::JoinHandle;

    /// Connector fed from a channel of pre-built transports; once the feed
    /// is empty it stays in `Connecting` forever, like a dispatcher whose
    /// executor endpoint is down.
    struct QueueConnector {
        feed: Mutex<mpsc::Receiver<Box<dyn Transport>>>,
    }

    #[async_trait]
    impl Connector for QueueConnector {
        async fn connect(&self) -> Result<Box<dyn Transport>> {
            let mut feed = self.feed.lock().await;
            match feed.recv().await {
                Some(transport) => Ok(transport),
                None => futures::future::pending().await,
            }
        }
    }

    fn test_registry() -> CommandRegistry {
        let mut registry = CommandRegistry::new();
        registry.register_fn("get_title", |_| async { Ok(json!("Example")) });
        registry.register_fn("slow_echo", |args| async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            Ok(args)
        });
        registry.register_fn("do_thing", |_| async {
            Err(Error::Other("boom".to_string()))
        });
        registry.register_fn("hang", |_| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(json!(null))
        });
        registry
    }

    fn test_config() -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.reconnect.floor_ms = 10;
        config.reconnect.ceiling_ms = 40;
        config.keepalive_interval_ms = 5000;
        config.call_timeout_ms = 5000;
        config
    }

    struct Harness {
        dispatcher: Dispatcher,
        feed: mpsc::Sender<Box<dyn Transport>>,
        shutdown: broadcast::Sender<()>,
        run_handle: JoinHandle<()>,
    }

    impl Harness {
        fn start(config: BridgeConfig) -> Self {
            let (feed, feed_rx) = mpsc::channel(4);
            let connector = Arc::new(QueueConnector {
                feed: Mutex::new(feed_rx),
            });
            let (shutdown, shutdown_rx) = broadcast::channel(1);
            let dispatcher = Dispatcher::new(&config);
            let run_handle = {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move { dispatcher.run(connector, shutdown_rx).await })
            };
            Self {
                dispatcher,
                feed,
                shutdown,
                run_handle,
            }
        }

        /// Wire up a fresh executor over a memory duplex and hand the
        /// dispatcher its end. Returns the executor's serve task.
        async fn attach_executor(&self, registry: CommandRegistry) -> JoinHandle<()> {
            let (dispatcher_end, executor_end) = memory_pair();
            let executor = Executor::new(registry);
            let handle =
                tokio::spawn(async move { executor.run_on(Box::new(executor_end)).await });
            self.feed.send(Box::new(dispatcher_end)).await.unwrap();
            self.wait_for(ChannelState::Connected).await;
            handle
        }

        /// Hand the dispatcher a raw memory end and keep the peer end for
        /// frame-level assertions.
        async fn attach_raw(&self) -> MemoryTransport {
            let (dispatcher_end, peer_end) = memory_pair();
            self.feed.send(Box::new(dispatcher_end)).await.unwrap();
            self.wait_for(ChannelState::Connected).await;
            peer_end
        }

        async fn wait_for(&self, wanted: ChannelState) {
            let deadline = Instant::now() + Duration::from_secs(2);
            while self.dispatcher.channel_state().await != wanted {
                assert!(Instant::now() < deadline, "never reached {:?}", wanted);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    async fn expect_call(peer: &mut MemoryTransport) -> (String, String) {
        loop {
            let text = tokio::time::timeout(Duration::from_secs(2), peer.recv())
                .await
                .expect("no frame within 2s")
                .expect("channel closed")
                .unwrap();
            match WireMessage::decode(&text).unwrap() {
                WireMessage::Call { id, operation, .. } => return (id, operation),
                WireMessage::Keepalive => continue,
                other => panic!("unexpected frame: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_submit_resolves_to_handler_value() {
        let harness = Harness::start(test_config());
        harness.attach_executor(test_registry()).await;

        let result = harness.dispatcher.submit("get_title", json!({})).await.unwrap();
        assert_eq!(result, json!("Example"));
        assert_eq!(harness.dispatcher.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_handler_error_surfaces_verbatim() {
        let harness = Harness::start(test_config());
        harness.attach_executor(test_registry()).await;

        let err = harness
            .dispatcher
            .submit("do_thing", json!({}))
            .await
            .unwrap_err();
        match err {
            Error::Operation(message) => assert_eq!(message, "boom"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(harness.dispatcher.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_operation_surfaces_as_error() {
        let harness = Harness::start(test_config());
        harness.attach_executor(test_registry()).await;

        let err = harness
            .dispatcher
            .submit("no_such_op", json!({}))
            .await
            .unwrap_err();
        match err {
            Error::Operation(message) => {
                assert_eq!(message, "operation not found: no_such_op")
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_calls_resolve_out_of_order() {
        let harness = Harness::start(test_config());
        harness.attach_executor(test_registry()).await;

        let (slow, fast) = tokio::join!(
            harness.dispatcher.submit("slow_echo", json!({"which": "a"})),
            harness.dispatcher.submit("get_title", json!({})),
        );
        assert_eq!(slow.unwrap(), json!({"which": "a"}));
        assert_eq!(fast.unwrap(), json!("Example"));
        assert_eq!(harness.dispatcher.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_call_queued_while_disconnected_resolves_after_connect() {
        let harness = Harness::start(test_config());
        harness.wait_for(ChannelState::Connecting).await;

        let dispatcher = harness.dispatcher.clone();
        let pending =
            tokio::spawn(async move { dispatcher.submit("get_title", json!({})).await });

        // Give the call time to land in the outbox, then bring the channel up.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(harness.dispatcher.pending_count().await, 1);
        harness.attach_executor(test_registry()).await;

        let result = pending.await.unwrap().unwrap();
        assert_eq!(result, json!("Example"));
    }

    #[tokio::test]
    async fn test_disconnect_fails_all_in_flight_calls() {
        let harness = Harness::start(test_config());
        let executor = harness.attach_executor(test_registry()).await;

        let mut waiting = Vec::new();
        for _ in 0..3 {
            let dispatcher = harness.dispatcher.clone();
            waiting.push(tokio::spawn(async move {
                dispatcher.submit("hang", json!({})).await
            }));
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        while harness.dispatcher.pending_count().await < 3 {
            assert!(Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Kill the executor; dropping its transport closes the channel.
        executor.abort();
        for handle in waiting {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, Error::ConnectionLost), "got {:?}", err);
        }
        assert_eq!(harness.dispatcher.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_reconnects_after_loss_and_serves_again() {
        let harness = Harness::start(test_config());
        let executor = harness.attach_executor(test_registry()).await;
        executor.abort();
        harness.wait_for(ChannelState::Disconnected).await;

        harness.attach_executor(test_registry()).await;
        let result = harness.dispatcher.submit("get_title", json!({})).await.unwrap();
        assert_eq!(result, json!("Example"));
    }

    #[tokio::test]
    async fn test_call_timeout_empties_pending_table() {
        let mut config = test_config();
        config.call_timeout_ms = 100;
        let harness = Harness::start(config);
        harness.attach_executor(test_registry()).await;

        let err = harness.dispatcher.submit("hang", json!({})).await.unwrap_err();
        match err {
            Error::Timeout(operation) => assert_eq!(operation, "hang"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(harness.dispatcher.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_timed_out_queued_call_is_never_sent() {
        let mut config = test_config();
        config.call_timeout_ms = 50;
        config.keepalive_interval_ms = 20;
        let harness = Harness::start(config);

        let err = harness.dispatcher.submit("get_title", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        // Bring the channel up afterwards: only keepalives may appear.
        let mut peer = harness.attach_raw().await;
        for _ in 0..3 {
            let text = tokio::time::timeout(Duration::from_secs(1), peer.recv())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(WireMessage::decode(&text).unwrap(), WireMessage::Keepalive);
        }
    }

    #[tokio::test]
    async fn test_second_response_for_same_id_is_a_no_op() {
        let harness = Harness::start(test_config());
        let mut peer = harness.attach_raw().await;

        let dispatcher = harness.dispatcher.clone();
        let call = tokio::spawn(async move { dispatcher.submit("get_title", json!({})).await });

        let (id, _) = expect_call(&mut peer).await;
        let response = WireMessage::Response {
            id,
            outcome: CallOutcome::Success(json!("Example")),
        }
        .encode();
        peer.send(response.clone()).await.unwrap();
        peer.send(response).await.unwrap();

        assert_eq!(call.await.unwrap().unwrap(), json!("Example"));
        assert_eq!(harness.dispatcher.pending_count().await, 0);

        // The dispatcher keeps working after the duplicate.
        let dispatcher = harness.dispatcher.clone();
        let call = tokio::spawn(async move { dispatcher.submit("get_title", json!({})).await });
        let (id, _) = expect_call(&mut peer).await;
        peer.send(
            WireMessage::Response {
                id,
                outcome: CallOutcome::Success(json!("still here")),
            }
            .encode(),
        )
        .await
        .unwrap();
        assert_eq!(call.await.unwrap().unwrap(), json!("still here"));
    }

    #[tokio::test]
    async fn test_response_with_unknown_id_is_discarded() {
        let harness = Harness::start(test_config());
        let mut peer = harness.attach_raw().await;

        peer.send(
            WireMessage::Response {
                id: "never-sent".to_string(),
                outcome: CallOutcome::Success(json!(1)),
            }
            .encode(),
        )
        .await
        .unwrap();
        peer.send("garbage {".to_string()).await.unwrap();

        // Channel stays up and calls still work.
        let dispatcher = harness.dispatcher.clone();
        let call = tokio::spawn(async move { dispatcher.submit("get_title", json!({})).await });
        let (id, operation) = expect_call(&mut peer).await;
        assert_eq!(operation, "get_title");
        peer.send(
            WireMessage::Response {
                id,
                outcome: CallOutcome::Success(json!("ok")),
            }
            .encode(),
        )
        .await
        .unwrap();
        assert_eq!(call.await.unwrap().unwrap(), json!("ok"));
    }

    #[tokio::test]
    async fn test_keepalive_emitted_on_interval() {
        let mut config = test_config();
        config.keepalive_interval_ms = 20;
        let harness = Harness::start(config);
        let mut peer = harness.attach_raw().await;

        for _ in 0..2 {
            let text = tokio::time::timeout(Duration::from_secs(1), peer.recv())
                .await
                .expect("no keepalive within 1s")
                .unwrap()
                .unwrap();
            assert_eq!(WireMessage::decode(&text).unwrap(), WireMessage::Keepalive);
        }
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_run_loop() {
        let harness = Harness::start(test_config());
        harness.attach_executor(test_registry()).await;

        harness.shutdown.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), harness.run_handle)
            .await
            .expect("run loop did not stop")
            .unwrap();
        assert_eq!(
            harness.dispatcher.channel_state().await,
            ChannelState::Disconnected
        );
    }
}
