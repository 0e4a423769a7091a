//! # MuxRPC - Asynchronous Multiplexed RPC
//!
//! MuxRPC is a bidirectional request/response RPC framework over a byte
//! stream. Calls are identified by a caller-chosen verb, framed with
//! little-endian fixed-width headers, and correlated by monotonically
//! increasing message ids. Connections negotiate optional features at setup:
//! inline per-call deadlines and per-direction payload compression.
//!
//! ## Features
//!
//! - **Typed stubs**: registering a handler yields the matching client stub
//! - **Pluggable serialization**: any [`Serializer`]; MessagePack by default
//! - **Fire-and-forget calls** that elicit no response frame
//! - **Structured remote errors**: handler failures surface to the caller
//! - **Admission control** bounding in-memory request bytes per connection
//! - **Async/Await**: built on tokio for efficient asynchronous I/O
//!
//! ## Quick Start
//!
//! ### Register a verb and serve it
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use muxrpc::{MsgpackSerializer, Protocol, ResourceLimits, Server, ServerOptions};
//!
//! #[tokio::main]
//! async fn main() {
//!     let proto = Arc::new(Protocol::new(MsgpackSerializer));
//!     let echo = proto.register(1, |(x,): (u32,)| async move { Ok::<_, String>(x) });
//!
//!     let server = Server::create(proto, ResourceLimits::default(), ServerOptions::default());
//!     let addr = server.listen("127.0.0.1:8000".parse().unwrap()).await.unwrap();
//!     println!("Serving on {addr}...");
//!     server.join().await;
//!     let _ = echo;
//! }
//! ```
//!
//! ### Call it
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use muxrpc::{Client, ClientOptions, MsgpackSerializer, Protocol};
//!
//! #[tokio::main]
//! async fn main() {
//!     let proto = Protocol::new(MsgpackSerializer);
//!     let echo = proto.client::<(u32,), u32>(1);
//!
//!     let addr = "127.0.0.1:8000".parse().unwrap();
//!     let client = Client::connect(addr, ClientOptions::default(), MsgpackSerializer)
//!         .await
//!         .unwrap();
//!     let rsp = echo.call(&client, (5,)).await;
//!     println!("echo rsp: {rsp:?}");
//! }
//! ```

#![forbid(unsafe_code)]

/// Error types and error handling utilities.
mod error;
pub use error::{Error, ErrorKind, Result};

/// Typed argument marshalling and the pluggable serializer.
mod marshal;
pub use marshal::{MsgpackSerializer, RpcArgs, Serializer};

/// Wire framing: little-endian headers and frame readers.
mod frame;

/// Feature negotiation at connection setup.
mod negotiate;
pub use negotiate::Features;

/// Optional payload compression.
mod compress;
pub use compress::{Compressor, CompressorFactory, ZstdFactory};

/// Task lifecycle management.
mod task_supervisor;
pub use task_supervisor::{TaskGuard, TaskSupervisor};

/// Reply gate delaying shutdown until in-flight handlers finish.
mod gate;

/// Outstanding-call table correlating requests with responses.
mod waiter;

/// Send-loop discipline shared by both endpoint roles.
mod connection;

/// Verb registry and per-verb dispatch closures.
mod protocol;
pub use protocol::{Protocol, Verb};

/// Typed client stubs.
mod stub;
pub use stub::{OnewayStub, Stub};

/// RPC client: connect, invoke, correlate replies.
mod client;
pub use client::{Client, ClientOptions, ClientStats};

/// RPC server: listen, dispatch, admission and graceful shutdown.
mod server;
pub use server::{ClientInfo, ResourceLimits, Server, ServerOptions};
