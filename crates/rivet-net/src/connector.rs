//! Connector: active-connect state machine with exponential backoff.
//!
//! A nonblocking `connect` is classified by errno: in-progress outcomes arm
//! write interest and wait for the socket to become writable; transient
//! failures close the socket and retry after a doubling delay; everything
//! else is fatal for this attempt. On writability the socket is re-checked
//! for a pending `SO_ERROR` and for the loopback self-connect degeneracy,
//! either of which also triggers a retry.

use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::Socket;
use tracing::{debug, error, info, warn};

use rivet_core::Config;
use rivet_reactor::{Channel, EventLoop, LoopHandle};

use crate::sock;

/// Callback receiving the connected stream.
pub type NewSocketCallback = Box<dyn FnMut(TcpStream) + Send>;

/// Connect progress.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectorState {
    /// No attempt in flight.
    #[default]
    Disconnected = 0,
    /// Waiting for the nonblocking connect to resolve.
    Connecting = 1,
    /// Handed the socket to the callback.
    Connected = 2,
}

impl ConnectorState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectorState::Connecting,
            2 => ConnectorState::Connected,
            _ => ConnectorState::Disconnected,
        }
    }
}

/// Active-connect state machine bound to one loop.
pub struct Connector {
    loop_: LoopHandle,
    server_addr: SocketAddr,
    connect: AtomicBool,
    state: AtomicU8,
    retry_delay_ms: AtomicU64,
    initial_delay: Duration,
    max_delay: Duration,
    socket: Mutex<Option<Socket>>,
    new_socket_cb: Mutex<Option<NewSocketCallback>>,
}

impl Connector {
    /// Creates a connector for `server_addr` using `config`'s retry bounds.
    pub fn new(loop_: LoopHandle, server_addr: SocketAddr, config: &Config) -> Arc<Connector> {
        Arc::new(Connector {
            loop_,
            server_addr,
            connect: AtomicBool::new(false),
            state: AtomicU8::new(ConnectorState::Disconnected as u8),
            retry_delay_ms: AtomicU64::new(config.connect_retry_initial.as_millis() as u64),
            initial_delay: config.connect_retry_initial,
            max_delay: config.connect_retry_max,
            socket: Mutex::new(None),
            new_socket_cb: Mutex::new(None),
        })
    }

    /// Target address.
    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Current state.
    pub fn state(&self) -> ConnectorState {
        ConnectorState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Delay the next retry would use.
    pub fn current_retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms.load(Ordering::Acquire))
    }

    fn set_state(&self, s: ConnectorState) {
        self.state.store(s as u8, Ordering::Release);
    }

    /// Installs the callback receiving the connected socket.
    pub fn set_new_socket_callback(&self, cb: NewSocketCallback) {
        *self.new_socket_cb.lock() = Some(cb);
    }

    /// Starts connecting; retries run until [`stop`](Connector::stop).
    pub fn start(self: &Arc<Self>) {
        self.connect.store(true, Ordering::Release);
        let this = Arc::clone(self);
        self.loop_.run_in_loop(move |lp| this.start_in_loop(lp));
    }

    fn start_in_loop(self: &Arc<Self>, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        debug_assert_eq!(self.state(), ConnectorState::Disconnected);
        if self.connect.load(Ordering::Acquire) {
            self.connect_in_loop(lp);
        } else {
            debug!("connector to {}: do not connect", self.server_addr);
        }
    }

    /// Marks "do not connect"; an in-flight attempt is torn down on the loop.
    pub fn stop(self: &Arc<Self>) {
        self.connect.store(false, Ordering::Release);
        let this = Arc::clone(self);
        self.loop_.queue_in_loop(move |lp| this.stop_in_loop(lp));
    }

    fn stop_in_loop(self: &Arc<Self>, lp: &EventLoop) {
        if self.state() == ConnectorState::Connecting {
            self.set_state(ConnectorState::Disconnected);
            if let Some(socket) = self.remove_and_reset_channel(lp) {
                drop(socket);
            }
            debug!("connector to {}: stopped", self.server_addr);
        }
    }

    /// Resets backoff and starts over. Loop thread only.
    pub fn restart(self: &Arc<Self>, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        self.set_state(ConnectorState::Disconnected);
        self.retry_delay_ms.store(self.initial_delay.as_millis() as u64, Ordering::Release);
        self.connect.store(true, Ordering::Release);
        self.start_in_loop(lp);
    }

    fn connect_in_loop(self: &Arc<Self>, lp: &EventLoop) {
        let socket = match sock::new_nonblocking_socket(&self.server_addr) {
            Ok(s) => s,
            Err(e) => {
                error!("connector to {}: socket creation failed: {}", self.server_addr, e);
                return;
            }
        };
        let errno = match socket.connect(&self.server_addr.into()) {
            Ok(()) => 0,
            Err(e) => e.raw_os_error().unwrap_or(libc::EIO),
        };
        match errno {
            0 | libc::EINPROGRESS | libc::EINTR | libc::EISCONN => self.connecting(lp, socket),

            libc::EAGAIN
            | libc::EADDRINUSE
            | libc::EADDRNOTAVAIL
            | libc::ECONNREFUSED
            | libc::ENETUNREACH => self.retry(socket),

            libc::EACCES
            | libc::EPERM
            | libc::EAFNOSUPPORT
            | libc::EALREADY
            | libc::EBADF
            | libc::EFAULT
            | libc::ENOTSOCK => {
                error!("connector to {}: connect error {}", self.server_addr, errno);
                drop(socket);
            }

            _ => {
                error!("connector to {}: unexpected connect error {}", self.server_addr, errno);
                drop(socket);
            }
        }
    }

    fn connecting(self: &Arc<Self>, lp: &EventLoop, socket: Socket) {
        self.set_state(ConnectorState::Connecting);
        let fd = socket.as_raw_fd();
        *self.socket.lock() = Some(socket);

        let ch = Channel::new(fd);
        {
            let mut c = ch.borrow_mut();
            let that = Arc::clone(self);
            c.set_write_callback(Box::new(move || {
                if let Some(lp) = EventLoop::current() {
                    that.handle_write(&lp);
                }
            }));
            let that = Arc::clone(self);
            c.set_error_callback(Box::new(move || {
                if let Some(lp) = EventLoop::current() {
                    that.handle_error(&lp);
                }
            }));
        }
        Channel::enable_writing(&ch, lp);
    }

    fn handle_write(self: &Arc<Self>, lp: &EventLoop) {
        if self.state() != ConnectorState::Connecting {
            debug_assert_eq!(self.state(), ConnectorState::Disconnected);
            return;
        }
        let socket = match self.remove_and_reset_channel(lp) {
            Some(s) => s,
            None => return,
        };
        if let Some(err) = sock::socket_error(&socket) {
            warn!("connector to {}: SO_ERROR = {}", self.server_addr, err);
            self.retry(socket);
        } else if sock::is_self_connect(&socket) {
            warn!("connector to {}: self connect", self.server_addr);
            self.retry(socket);
        } else {
            self.set_state(ConnectorState::Connected);
            if self.connect.load(Ordering::Acquire) {
                let stream: TcpStream = socket.into();
                let mut cb = self.new_socket_cb.lock();
                match cb.as_mut() {
                    Some(f) => f(stream),
                    None => drop(stream),
                }
            } else {
                drop(socket);
            }
        }
    }

    fn handle_error(self: &Arc<Self>, lp: &EventLoop) {
        if self.state() == ConnectorState::Connecting {
            if let Some(socket) = self.remove_and_reset_channel(lp) {
                if let Some(err) = sock::socket_error(&socket) {
                    warn!("connector to {}: error event, SO_ERROR = {}", self.server_addr, err);
                }
                self.retry(socket);
            }
        }
    }

    fn retry(self: &Arc<Self>, socket: Socket) {
        drop(socket);
        self.set_state(ConnectorState::Disconnected);
        if self.connect.load(Ordering::Acquire) {
            let delay = Duration::from_millis(self.retry_delay_ms.load(Ordering::Acquire));
            info!("connector to {}: retrying in {:?}", self.server_addr, delay);
            let next = (delay * 2).min(self.max_delay);
            self.retry_delay_ms.store(next.as_millis() as u64, Ordering::Release);
            let this = Arc::clone(self);
            self.loop_.run_after(delay, move |lp| {
                if this.connect.load(Ordering::Acquire)
                    && this.state() == ConnectorState::Disconnected
                {
                    this.start_in_loop(lp);
                }
            });
        } else {
            debug!("connector to {}: do not connect", self.server_addr);
        }
    }

    fn remove_and_reset_channel(&self, lp: &EventLoop) -> Option<Socket> {
        let socket = self.socket.lock().take()?;
        let fd = socket.as_raw_fd();
        if let Some(ch) = lp.channel_for(fd) {
            Channel::disable_all(&ch, lp);
            lp.remove_channel(&ch);
        }
        Some(socket)
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("server_addr", &self.server_addr)
            .field("state", &self.state())
            .finish()
    }
}
