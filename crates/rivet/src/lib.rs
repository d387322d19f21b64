#![warn(missing_docs)]

//! Rivet: a small public API facade for the workspace.
//!
//! This crate re-exports the types needed to build reactor-driven TCP
//! services and protobuf RPC endpoints:
//!
//! - Event loops and the worker pool (`EventLoop`, `LoopHandle`,
//!   `EventLoopPool`)
//! - TCP building blocks (`TcpServer`, `TcpClient`, `TcpConnection`)
//! - The RPC layer (`RpcServer`, `RpcClient`, `RpcChannel`, `Service`)
//! - Core configuration (`Config`) and the byte buffer (`Buffer`)
//!
//! Example
//! ```ignore
//! use rivet::{Config, EventLoop, RpcServer};
//!
//! let lp = EventLoop::new()?;
//! let server = RpcServer::new(lp.handle(), "demo", "127.0.0.1:9981".parse()?, Config::default())?;
//! server.register_service(std::sync::Arc::new(MyService));
//! server.start()?;
//! lp.run();
//! ```

// Core config, errors and the buffer
pub use rivet_core::{Buffer, Config, Error, Result};
// Reactor: loops, handles, pool
pub use rivet_reactor::{EventLoop, EventLoopPool, LoopHandle, LoopInit};
// TCP layer
pub use rivet_net::{ConnState, TcpClient, TcpConnection, TcpServer};
// RPC layer
pub use rivet_rpc::{
    codec, decode_request, encode_response, CodecError, Done, ErrorCode, MessageType, RpcChannel,
    RpcClient, RpcCodec, RpcMessage, RpcServer, Service, ServiceMap,
};

/// Convenience prelude with the most commonly used items.
pub mod prelude {
    pub use crate::{
        Buffer, Config, ConnState, Done, ErrorCode, EventLoop, LoopHandle, RpcChannel, RpcClient,
        RpcServer, Service, TcpClient, TcpConnection, TcpServer,
    };
}
