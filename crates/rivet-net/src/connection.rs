//! TcpConnection: the per-descriptor state machine.
//!
//! States: Connecting -> Connected -> Disconnecting -> Disconnected. A
//! connection is created by a server or client, which then drives the two
//! lifecycle steps `connect_established` and `connect_destroyed` on the
//! owner loop. All I/O happens on that loop; operations arriving from other
//! threads are posted to it, carrying a strong reference so the connection
//! outlives every callback it scheduled on itself.

use std::any::Any;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use rivet_core::{Buffer, Config};
use rivet_reactor::{Channel, EventLoop, LoopHandle};

use crate::sock;

/// Invoked on establishment and on disconnect.
pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
/// Invoked with freshly received bytes; consume what you can parse.
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer) + Send + Sync>;
/// Invoked once each time the output buffer fully drains.
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
/// Invoked when the output buffer crosses the high-water mark, with its size.
pub type HighWaterMarkCallback = Arc<dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync>;
/// Internal: the owner (server/client) unregisters the connection here.
pub type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Connection lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    /// Created, not yet wired into the loop.
    Connecting = 0,
    /// Established and readable.
    Connected = 1,
    /// Local close requested; flushing or waiting for teardown.
    Disconnecting = 2,
    /// Fully torn down.
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

struct Io {
    stream: TcpStream,
    input: Buffer,
    output: Buffer,
    // Latched by EPIPE/ECONNRESET on a direct write; suppresses buffering.
    fault: bool,
}

#[derive(Default)]
struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
    high_water_mark_level: usize,
}

/// One established TCP connection, pinned to its owner loop.
pub struct TcpConnection {
    loop_: LoopHandle,
    name: String,
    fd: RawFd,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: AtomicU8,
    reading: AtomicBool,
    io: Mutex<Io>,
    cbs: Mutex<Callbacks>,
    context: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

impl TcpConnection {
    /// Wraps an already-connected stream. The caller must later run
    /// [`connect_established`](TcpConnection::connect_established) on the
    /// owner loop.
    pub fn new(
        loop_: LoopHandle,
        name: String,
        stream: TcpStream,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        config: &Config,
    ) -> Arc<TcpConnection> {
        if let Err(e) = sock::apply_stream_options(&stream, config) {
            warn!("{}: could not apply socket options: {}", name, e);
        }
        let fd = stream.as_raw_fd();
        Arc::new(TcpConnection {
            loop_,
            name,
            fd,
            local_addr,
            peer_addr,
            state: AtomicU8::new(ConnState::Connecting as u8),
            reading: AtomicBool::new(false),
            io: Mutex::new(Io {
                stream,
                input: Buffer::new(),
                output: Buffer::new(),
                fault: false,
            }),
            cbs: Mutex::new(Callbacks {
                high_water_mark_level: config.high_water_mark,
                ..Default::default()
            }),
            context: Mutex::new(None),
        })
    }

    /// Connection name assigned by the owner.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Local address of the socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Peer address of the socket.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Loop owning this connection.
    pub fn owner_loop(&self) -> &LoopHandle {
        &self.loop_
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: ConnState) {
        self.state.store(s as u8, Ordering::Release);
    }

    /// True while established.
    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    /// True once fully torn down.
    pub fn disconnected(&self) -> bool {
        self.state() == ConnState::Disconnected
    }

    /// Bytes currently queued in the output buffer.
    pub fn queued_bytes(&self) -> usize {
        self.io.lock().output.readable_bytes()
    }

    /// Installs the connection (connect/disconnect) callback.
    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.cbs.lock().connection = Some(cb);
    }

    /// Installs the message callback.
    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.cbs.lock().message = Some(cb);
    }

    /// Installs the write-complete callback.
    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.cbs.lock().write_complete = Some(cb);
    }

    /// Installs the high-water-mark callback and its threshold.
    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, level: usize) {
        let mut cbs = self.cbs.lock();
        cbs.high_water_mark = Some(cb);
        cbs.high_water_mark_level = level;
    }

    /// Installs the owner's close callback.
    pub fn set_close_callback(&self, cb: CloseCallback) {
        self.cbs.lock().close = Some(cb);
    }

    /// Stores an opaque per-connection context.
    pub fn set_context(&self, ctx: Arc<dyn Any + Send + Sync>) {
        *self.context.lock() = Some(ctx);
    }

    /// Fetches the per-connection context downcast to `T`.
    pub fn context<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.context.lock().clone().and_then(|ctx| ctx.downcast::<T>().ok())
    }

    /// Clears the per-connection context.
    pub fn clear_context(&self) {
        *self.context.lock() = None;
    }

    fn connection_cb(&self) -> Option<ConnectionCallback> {
        self.cbs.lock().connection.clone()
    }

    fn message_cb(&self) -> Option<MessageCallback> {
        self.cbs.lock().message.clone()
    }

    fn write_complete_cb(&self) -> Option<WriteCompleteCallback> {
        self.cbs.lock().write_complete.clone()
    }

    fn close_cb(&self) -> Option<CloseCallback> {
        self.cbs.lock().close.clone()
    }

    /// Sends bytes, buffering whatever the socket does not take immediately.
    ///
    /// On the owner loop a direct write is attempted first; from any other
    /// thread the bytes are copied and posted, so the caller's buffer can be
    /// reused as soon as this returns.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != ConnState::Connected {
            warn!("{}: send on {:?} connection dropped", self.name, self.state());
            return;
        }
        if self.loop_.is_in_loop_thread() {
            if let Some(lp) = EventLoop::current() {
                self.send_in_loop(&lp, data);
                return;
            }
        }
        let this = Arc::clone(self);
        let owned = data.to_vec();
        self.loop_.queue_in_loop(move |lp| this.send_in_loop(lp, &owned));
    }

    /// Sends the readable region of `buf`, consuming it.
    pub fn send_buffer(self: &Arc<Self>, buf: &mut Buffer) {
        if self.state() != ConnState::Connected {
            warn!("{}: send on {:?} connection dropped", self.name, self.state());
            return;
        }
        if self.loop_.is_in_loop_thread() {
            if let Some(lp) = EventLoop::current() {
                self.send_in_loop(&lp, buf.peek());
                buf.retrieve_all();
                return;
            }
        }
        let this = Arc::clone(self);
        let owned = buf.read_bytes(buf.readable_bytes());
        self.loop_.queue_in_loop(move |lp| this.send_in_loop(lp, &owned));
    }

    fn send_in_loop(self: &Arc<Self>, lp: &EventLoop, data: &[u8]) {
        lp.assert_in_loop_thread();
        if self.state() == ConnState::Disconnected {
            warn!("{}: disconnected, give up writing", self.name);
            return;
        }
        let mut io = self.io.lock();
        let writing =
            lp.channel_for(self.fd).map(|ch| ch.borrow().is_writing()).unwrap_or(false);
        let mut nwrote = 0usize;

        // Direct write only when nothing is queued ahead of this payload.
        if !writing && io.output.readable_bytes() == 0 && !io.fault {
            loop {
                match (&io.stream).write(&data[nwrote..]) {
                    Ok(0) => break,
                    Ok(n) => {
                        nwrote += n;
                        if nwrote == data.len() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        error!("{}: write failed: {}", self.name, e);
                        if matches!(
                            e.raw_os_error(),
                            Some(libc::EPIPE) | Some(libc::ECONNRESET)
                        ) {
                            io.fault = true;
                        }
                        break;
                    }
                }
            }
        }

        let remaining = data.len() - nwrote;
        if remaining == 0 {
            drop(io);
            if nwrote > 0 {
                if let Some(cb) = self.write_complete_cb() {
                    let this = Arc::clone(self);
                    lp.queue_in_loop(move |_| cb(&this));
                }
            }
            return;
        }
        if io.fault {
            return;
        }

        let old_len = io.output.readable_bytes();
        let (hwm_cb, hwm_level) = {
            let cbs = self.cbs.lock();
            (cbs.high_water_mark.clone(), cbs.high_water_mark_level)
        };
        if old_len < hwm_level && old_len + remaining >= hwm_level {
            if let Some(cb) = hwm_cb {
                let this = Arc::clone(self);
                let size = old_len + remaining;
                lp.queue_in_loop(move |_| cb(&this, size));
            }
        }
        io.output.append(&data[nwrote..]);
        drop(io);
        if !writing {
            if let Some(ch) = lp.channel_for(self.fd) {
                Channel::enable_writing(&ch, lp);
            }
        }
    }

    /// Half-close: shuts the write side once the output buffer drains; the
    /// read side stays open until the peer closes.
    pub fn shutdown(self: &Arc<Self>) {
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnecting);
            let this = Arc::clone(self);
            self.loop_.run_in_loop(move |lp| this.shutdown_in_loop(lp));
        }
    }

    fn shutdown_in_loop(&self, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        let writing =
            lp.channel_for(self.fd).map(|ch| ch.borrow().is_writing()).unwrap_or(false);
        if !writing {
            if let Err(e) = self.io.lock().stream.shutdown(std::net::Shutdown::Write) {
                error!("{}: shutdown failed: {}", self.name, e);
            }
        }
        // Otherwise handle_write finishes the flush and retries the shutdown.
    }

    /// Unconditional close, scheduled on the owner loop while holding a
    /// strong self-reference.
    pub fn force_close(self: &Arc<Self>) {
        if matches!(self.state(), ConnState::Connected | ConnState::Disconnecting) {
            self.set_state(ConnState::Disconnecting);
            let this = Arc::clone(self);
            self.loop_.queue_in_loop(move |lp| this.force_close_in_loop(lp));
        }
    }

    /// [`force_close`](TcpConnection::force_close) after `delay`.
    pub fn force_close_with_delay(self: &Arc<Self>, delay: Duration) {
        if matches!(self.state(), ConnState::Connected | ConnState::Disconnecting) {
            let this = Arc::clone(self);
            self.loop_.run_after(delay, move |_| this.force_close());
        }
    }

    fn force_close_in_loop(self: &Arc<Self>, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        if matches!(self.state(), ConnState::Connected | ConnState::Disconnecting) {
            self.handle_close(lp);
        }
    }

    /// Re-arms read interest after [`stop_read`](TcpConnection::stop_read).
    pub fn start_read(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.loop_.run_in_loop(move |lp| {
            if !this.reading.swap(true, Ordering::AcqRel) {
                if let Some(ch) = lp.channel_for(this.fd) {
                    Channel::enable_reading(&ch, lp);
                }
            }
        });
    }

    /// Pauses delivery of the message callback (kernel-level backpressure).
    pub fn stop_read(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.loop_.run_in_loop(move |lp| {
            if this.reading.swap(false, Ordering::AcqRel) {
                if let Some(ch) = lp.channel_for(this.fd) {
                    Channel::disable_reading(&ch, lp);
                }
            }
        });
    }

    /// True while the read side is armed.
    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::Acquire)
    }

    /// Lifecycle step one: wire the channel into the owner loop and go
    /// Connected. Invoked by the creating server/client, on the owner loop.
    pub fn connect_established(self: &Arc<Self>, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        debug_assert_eq!(self.state(), ConnState::Connecting);
        self.set_state(ConnState::Connected);

        let ch = Channel::new(self.fd);
        {
            let mut c = ch.borrow_mut();
            let that = Arc::clone(self);
            c.set_read_callback(Box::new(move || {
                if let Some(lp) = EventLoop::current() {
                    that.handle_read(&lp);
                }
            }));
            let that = Arc::clone(self);
            c.set_write_callback(Box::new(move || {
                if let Some(lp) = EventLoop::current() {
                    that.handle_write(&lp);
                }
            }));
            let that = Arc::clone(self);
            c.set_close_callback(Box::new(move || {
                if let Some(lp) = EventLoop::current() {
                    that.handle_close(&lp);
                }
            }));
            let that = Arc::clone(self);
            c.set_error_callback(Box::new(move || that.handle_error()));
        }
        Channel::enable_reading(&ch, lp);
        self.reading.store(true, Ordering::Release);

        if let Some(cb) = self.connection_cb() {
            cb(self);
        }
        trace!("{}: established {} -> {}", self.name, self.local_addr, self.peer_addr);
    }

    /// Lifecycle step two, the terminal one: disable and remove the channel.
    /// Invoked by the creating server/client, on the owner loop.
    pub fn connect_destroyed(self: &Arc<Self>, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnected);
            if let Some(ch) = lp.channel_for(self.fd) {
                Channel::disable_all(&ch, lp);
            }
            if let Some(cb) = self.connection_cb() {
                cb(self);
            }
        }
        if let Some(ch) = lp.channel_for(self.fd) {
            lp.remove_channel(&ch);
        }
        trace!("{}: destroyed", self.name);
    }

    fn handle_read(self: &Arc<Self>, lp: &EventLoop) {
        // Edge-triggered readiness: drain until the kernel runs dry.
        loop {
            let result = {
                let mut io = self.io.lock();
                let Io { stream, input, .. } = &mut *io;
                let mut reader = &*stream;
                input.read_from(&mut reader)
            };
            match result {
                Ok(0) => {
                    self.handle_close(lp);
                    return;
                }
                Ok(_) => {
                    let mut buf = {
                        let mut io = self.io.lock();
                        std::mem::take(&mut io.input)
                    };
                    match self.message_cb() {
                        Some(cb) => cb(self, &mut buf),
                        None => buf.retrieve_all(),
                    }
                    self.io.lock().input = buf;
                    if self.state() == ConnState::Disconnected || !self.is_reading() {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("{}: read failed: {}", self.name, e);
                    self.handle_error();
                    self.handle_close(lp);
                    return;
                }
            }
        }
    }

    fn handle_write(self: &Arc<Self>, lp: &EventLoop) {
        let ch = match lp.channel_for(self.fd) {
            Some(ch) => ch,
            None => return,
        };
        if !ch.borrow().is_writing() {
            debug!("{}: connection is down, no more writing", self.name);
            return;
        }
        let drained = {
            let mut io = self.io.lock();
            loop {
                if io.output.readable_bytes() == 0 {
                    break;
                }
                match (&io.stream).write(io.output.peek()) {
                    Ok(0) => break,
                    Ok(n) => io.output.retrieve(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        error!("{}: write failed: {}", self.name, e);
                        break;
                    }
                }
            }
            io.output.readable_bytes() == 0
        };
        if drained {
            Channel::disable_writing(&ch, lp);
            if let Some(cb) = self.write_complete_cb() {
                let this = Arc::clone(self);
                lp.queue_in_loop(move |_| cb(&this));
            }
            if self.state() == ConnState::Disconnecting {
                self.shutdown_in_loop(lp);
            }
        }
    }

    fn handle_close(self: &Arc<Self>, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        let state = self.state();
        if state == ConnState::Disconnected {
            return;
        }
        debug_assert!(matches!(state, ConnState::Connected | ConnState::Disconnecting));
        debug!("{}: closing, state = {:?}", self.name, state);
        self.set_state(ConnState::Disconnected);
        if let Some(ch) = lp.channel_for(self.fd) {
            Channel::disable_all(&ch, lp);
        }
        let guard = Arc::clone(self);
        if let Some(cb) = self.connection_cb() {
            cb(&guard);
        }
        if let Some(cb) = self.close_cb() {
            cb(&guard);
        }
    }

    fn handle_error(&self) {
        let err = sock::stream_error(&self.io.lock().stream);
        if let Some(err) = err {
            error!("{}: SO_ERROR = {}", self.name, err);
        }
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("local", &self.local_addr)
            .field("peer", &self.peer_addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(ConnState::from_u8(0), ConnState::Connecting);
        assert_eq!(ConnState::from_u8(1), ConnState::Connected);
        assert_eq!(ConnState::from_u8(2), ConnState::Disconnecting);
        assert_eq!(ConnState::from_u8(3), ConnState::Disconnected);
    }
}
