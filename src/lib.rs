pub mod bridge;
pub mod config;
pub mod error;
pub mod health;
pub mod logger;
pub mod multiplexer;
pub mod pending;
pub mod schema;
pub mod session;
pub mod sink;

pub use bridge::{Bridge, EventStream};
pub use error::{BridgeError, StartError};
pub use multiplexer::{Dispatched, Multiplexer, MultiplexerOptions};
pub use worker_channel;
