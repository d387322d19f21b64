#![warn(missing_docs)]

//! rivet-net: the TCP layer on top of the reactor.
//!
//! - [`Acceptor`]: listening socket feeding accepted descriptors to a
//!   callback, with EMFILE eviction
//! - [`Connector`]: active-connect state machine with exponential backoff
//! - [`TcpConnection`]: per-descriptor state machine with input/output
//!   buffers, half-close and deferred destruction
//! - [`TcpServer`] / [`TcpClient`]: compose the above with the loop pool
//!   and own the connection map

/// Listening-socket wrapper producing accepted descriptors.
pub mod acceptor;
/// TCP client with reconnect support.
pub mod client;
/// The per-connection state machine.
pub mod connection;
/// Active-connect state machine with backoff.
pub mod connector;
/// Helpers over the raw socket layer.
pub mod sock;
/// TCP server owning the acceptor, pool and connection map.
pub mod server;

pub use acceptor::Acceptor;
pub use client::TcpClient;
pub use connection::{
    ConnState, ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection,
    WriteCompleteCallback,
};
pub use connector::Connector;
pub use server::TcpServer;
