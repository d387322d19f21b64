#![warn(missing_docs)]

//! rivet-core: foundational types and utilities.
//!
//! This crate provides the minimal set of core utilities shared across all
//! layers of the rivet workspace:
//! - Configuration types
//! - Error handling
//! - The growable byte buffer with prepend margin
//!
//! Reactor and protocol logic lives in specialized crates:
//! - `rivet-reactor`: poller, channels, event loops, loop thread pool
//! - `rivet-net`: acceptor, connector, TCP connections, server/client
//! - `rivet-rpc`: wire codec, RPC channel, RPC server/client

/// Growable byte buffer with a prepend margin and scatter-read support.
pub mod buffer;
/// Configuration options for the reactor and TCP layers.
pub mod config;
/// Error types and results.
pub mod error;

pub use buffer::Buffer;
pub use config::Config;
pub use error::{Error, Result};
