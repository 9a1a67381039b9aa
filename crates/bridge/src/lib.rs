//! RPC correlation and connection-lifecycle layer of the tabrelay bridge.
//!
//! One side of the channel (the [`Dispatcher`]) turns outer tool invocations
//! into correlated call frames and completes them when the matching response
//! arrives; the other side (the [`Executor`]) resolves operation names
//! against a [`CommandRegistry`] and answers each call exactly once. The
//! transport in between is any ordered bidirectional text channel — a
//! WebSocket in production, an in-memory duplex in tests.

pub mod connection;
pub mod dispatcher;
pub mod executor;
pub mod registry;
pub mod transport;

pub use connection::{ChannelState, Connector, ReconnectPolicy, WsConnector};
pub use dispatcher::Dispatcher;
pub use executor::Executor;
pub use registry::{CommandHandler, CommandRegistry};
pub use transport::{memory_pair, MemoryTransport, Transport, WsTransport};
