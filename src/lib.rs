//! # zerorpc
//!
//! A ZeroRPC endpoint runtime: bidirectional RPC over ZeroMQ-style
//! DEALER/ROUTER sockets carrying MessagePack events.
//!
//! ## Features
//!
//! - Request/response and server-streaming calls multiplexed as logical
//!   channels over one socket
//! - Per-channel liveness heartbeats (`_zpc_hb`), with lost peers
//!   surfaced as [`RpcError::LostRemote`]
//! - Credit-based flow control on streamed replies (`_zpc_more` grants
//!   sized by the receiver's free buffer)
//! - First-class remote exceptions: an `ERR` reply carries the
//!   `[name, text, traceback]` triple and is returned as
//!   [`RpcError::Remote`]
//!
//! ## Usage
//!
//! 1. Bind a [`Server`] and register task handlers (unary or streaming).
//! 2. Connect a [`Client`] and call [`Client::invoke`] or
//!    [`Client::invoke_stream`].
//! 3. Arguments and results are dynamic MessagePack values
//!    ([`Value`]).
//!
//! ## Example
//!
//! ```no_run
//! use zerorpc::{Client, Server, Value};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), zerorpc::RpcError> {
//!     let server = Server::bind("tcp://127.0.0.1:4242").await?;
//!     server.register_task("hello", |args: Vec<Value>| async move {
//!         let who = args.first().and_then(Value::as_str).unwrap_or("world");
//!         Ok(Value::from(format!("Hello, {}", who)))
//!     })?;
//!
//!     let client = Client::connect("tcp://127.0.0.1:4242").await?;
//!     let reply = client.invoke("hello", vec![Value::from("John")]).await?;
//!     println!("{:?}", reply.args);
//!     Ok(())
//! }
//! ```

mod channel;
mod socket;
mod transport;

pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod server;

pub use client::{CallStream, Client};
pub use config::{Config, PROTOCOL_VERSION};
pub use error::RpcError;
pub use event::Event;
pub use server::{Server, StreamSink};

// args, results and header values are dynamic MessagePack values
pub use rmpv::Value;
