#![warn(missing_docs)]

//! rivet-reactor: a readiness-based reactor pinned to one OS thread.
//!
//! The building blocks, leaves first:
//! - [`Poller`]: thin wrapper around the OS readiness primitive plus the
//!   fd-to-channel map
//! - [`Channel`]: interest registration and event dispatch for one
//!   descriptor
//! - [`EventLoop`]: owns the poller, drains ready channels, runs queued
//!   tasks, wakes up across threads
//! - [`EventLoopPool`]: N threads, each hosting exactly one loop
//!
//! A loop binds to the thread that created it and stays there for the
//! thread's lifetime. Everything reachable from a channel is owned by that
//! thread; cross-thread work enters through [`LoopHandle::run_in_loop`].

/// Interest registration and callback dispatch for one file descriptor.
pub mod channel;
/// The per-thread event loop and its cross-thread handle.
pub mod event_loop;
/// Pool of worker threads, one event loop each.
pub mod pool;
/// Readiness poller and fd-to-channel map.
pub mod poller;

pub use channel::{Channel, ChannelRef, PollState, Readiness};
pub use event_loop::{EventLoop, LoopHandle};
pub use pool::{EventLoopPool, LoopInit};
pub use poller::Poller;
