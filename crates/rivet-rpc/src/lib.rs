#![warn(missing_docs)]

//! rivet-rpc: a protobuf RPC framework over the rivet TCP layer.
//!
//! On the wire each envelope is one fixed-framed packet:
//!
//! ```text
//! +----------+-----------+------------------------+-----------+
//! | len (4)  | tag (4)   | payload (len-8 bytes)  | sum (4)   |
//! +----------+-----------+------------------------+-----------+
//! ```
//!
//! `len` counts everything after itself, the tag is the ASCII literal
//! `RPC0`, and `sum` is the zlib Adler-32 of `tag || payload`, big-endian.
//! The payload is a protobuf [`RpcMessage`] correlating calls by id.
//!
//! - [`codec`]: frame boundary handling, checksum, envelope encode/decode
//! - [`RpcChannel`]: request/response correlation and service dispatch
//! - [`RpcServer`] / [`RpcClient`]: bind channels to connections

/// Request/response correlation and inbound dispatch.
pub mod channel;
/// RPC client glue: TCP client plus one shared channel.
pub mod client;
/// Frame codec: length prefix, tag, checksum, envelope payload.
pub mod codec;
/// The wire envelope and its enums.
pub mod message;
/// RPC server glue: TCP server plus the service registry.
pub mod server;
/// The polymorphic service contract and registry types.
pub mod service;

pub use channel::RpcChannel;
pub use client::RpcClient;
pub use codec::{CodecError, RpcCodec};
pub use message::{ErrorCode, MessageType, RpcMessage};
pub use server::RpcServer;
pub use service::{decode_request, encode_response, Done, Service, ServiceMap};
