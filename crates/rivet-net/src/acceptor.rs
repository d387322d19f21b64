//! Acceptor: a listening socket wired into the base loop.
//!
//! On read readiness the acceptor drains the kernel's accept queue and hands
//! each descriptor to the new-connection callback. When the process runs out
//! of descriptors a reserved idle descriptor is sacrificed so the pending
//! entry can be accepted and dropped instead of busy-looping.

use std::fs::File;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use socket2::Socket;
use tracing::{debug, error, info, warn};

use rivet_core::{Config, Result};
use rivet_reactor::{Channel, EventLoop, LoopHandle};

use crate::sock;

const IDLE_FD_PATH: &str = "/dev/null";

/// Callback receiving each accepted stream with its peer address.
pub type NewConnectionCallback = Box<dyn FnMut(TcpStream, SocketAddr) + Send>;

/// Nonblocking listening socket owned by the base loop.
pub struct Acceptor {
    loop_: LoopHandle,
    listen_socket: Socket,
    fd: RawFd,
    local_addr: SocketAddr,
    idle_fd: Mutex<Option<File>>,
    listening: AtomicBool,
    new_conn_cb: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    /// Binds a listening socket on `addr`.
    pub fn new(loop_: LoopHandle, addr: SocketAddr, config: &Config) -> Result<Arc<Acceptor>> {
        let listen_socket = sock::bind_listener(addr, config)?;
        let local_addr = sock::to_socket_addr(&listen_socket.local_addr()?);
        let fd = listen_socket.as_raw_fd();
        let idle_fd = File::open(IDLE_FD_PATH)?;
        Ok(Arc::new(Acceptor {
            loop_,
            listen_socket,
            fd,
            local_addr,
            idle_fd: Mutex::new(Some(idle_fd)),
            listening: AtomicBool::new(false),
            new_conn_cb: Mutex::new(None),
        }))
    }

    /// Address the socket is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Raw descriptor of the listening socket.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// True once [`listen`](Acceptor::listen) has run.
    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Installs the callback invoked for each accepted descriptor.
    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_conn_cb.lock() = Some(cb);
    }

    /// Arms read interest on the base loop and starts accepting.
    pub fn listen(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.loop_.run_in_loop(move |lp| Acceptor::listen_in_loop(&this, lp));
    }

    fn listen_in_loop(this: &Arc<Acceptor>, lp: &EventLoop) {
        if this.listening.swap(true, Ordering::AcqRel) {
            return;
        }
        let ch = Channel::new(this.fd);
        {
            let that = Arc::clone(this);
            ch.borrow_mut().set_read_callback(Box::new(move || that.handle_read()));
        }
        Channel::enable_reading(&ch, lp);
        info!("accepting on {}", this.local_addr);
    }

    fn handle_read(&self) {
        loop {
            match self.listen_socket.accept() {
                Ok((socket, addr)) => {
                    let peer = sock::to_socket_addr(&addr);
                    if let Err(e) = socket.set_nonblocking(true) {
                        warn!("accepted fd from {} left blocking: {}", peer, e);
                    }
                    let stream: TcpStream = socket.into();
                    let mut cb = self.new_conn_cb.lock();
                    match cb.as_mut() {
                        Some(f) => f(stream, peer),
                        None => {
                            debug!("no new-connection callback, closing fd from {}", peer);
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if e.raw_os_error() == Some(libc::EMFILE) => self.evict_one_pending(),
                Err(e) => {
                    error!("accept on {} failed: {}", self.local_addr, e);
                    break;
                }
            }
        }
    }

    // Out of descriptors: free the reserved one, accept and drop the pending
    // entry, then re-reserve. Without this the readable listening fd would
    // spin forever.
    fn evict_one_pending(&self) {
        let mut idle = self.idle_fd.lock();
        idle.take();
        match self.listen_socket.accept() {
            Ok((socket, addr)) => {
                warn!(
                    "descriptor table full, evicted pending connection from {}",
                    sock::to_socket_addr(&addr)
                );
                drop(socket);
            }
            Err(e) => warn!("descriptor table full and eviction failed: {}", e),
        }
        match File::open(IDLE_FD_PATH) {
            Ok(f) => *idle = Some(f),
            Err(e) => error!("could not re-reserve idle descriptor: {}", e),
        }
    }
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("local_addr", &self.local_addr)
            .field("listening", &self.listening())
            .finish()
    }
}
