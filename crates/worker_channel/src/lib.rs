//! Line-delimited JSON-RPC channel to a single worker process.
//!
//! The channel owns the child process (or any async byte pair), frames its stdout
//! into messages, serializes writes to its stdin, performs the `initialize`
//! handshake and reports lifecycle through [`WorkerState`]. Correlation of
//! responses to callers is left to the registered [`InboundHandler`].

pub mod error;
pub mod framing;
pub mod jsonrpc;
pub mod worker;

pub use error::{ChannelError, FramingError};
pub use framing::LineFramer;
pub use jsonrpc::{ErrorObject, Id, Message, Request, Response};
pub use worker::{
    HANDSHAKE_ID_PREFIX, InboundHandler, WorkerChannel, WorkerCommand, WorkerOptions, WorkerState,
};
