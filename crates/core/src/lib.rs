pub mod config;
pub mod error;
pub mod protocol;

pub use config::BridgeConfig;
pub use error::{Error, Result};
pub use protocol::{CallOutcome, WireMessage};
