//! TcpServer: acceptor + loop pool + connection map.
//!
//! New descriptors are distributed round-robin over the worker loops; each
//! connection is named `"<server>-<peer>#<seq>"` and kept in the map under
//! that name until its close callback unregisters it.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{info, warn};

use rivet_core::{Config, Result};
use rivet_reactor::{Channel, EventLoopPool, LoopHandle, LoopInit};

use crate::acceptor::Acceptor;
use crate::connection::{
    ConnectionCallback, MessageCallback, TcpConnection, WriteCompleteCallback,
};
use crate::sock;

#[derive(Default)]
struct ServerCallbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    thread_init: Option<LoopInit>,
}

/// TCP server composing the acceptor with the worker loop pool.
pub struct TcpServer {
    base: LoopHandle,
    name: String,
    acceptor: Arc<Acceptor>,
    pool: Arc<EventLoopPool>,
    connections: Mutex<HashMap<String, Arc<TcpConnection>>>,
    next_conn_id: AtomicU64,
    started: AtomicBool,
    config: Config,
    cbs: Mutex<ServerCallbacks>,
}

impl TcpServer {
    /// Binds the listening socket; the server starts accepting on
    /// [`start`](TcpServer::start).
    pub fn new(
        base: LoopHandle,
        name: impl Into<String>,
        listen_addr: SocketAddr,
        config: Config,
    ) -> Result<Arc<TcpServer>> {
        let name = name.into();
        let acceptor = Acceptor::new(base.clone(), listen_addr, &config)?;
        let pool = Arc::new(EventLoopPool::new(base.clone(), name.clone()));
        let server = Arc::new(TcpServer {
            base,
            name,
            acceptor,
            pool,
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(0),
            started: AtomicBool::new(false),
            config,
            cbs: Mutex::new(ServerCallbacks::default()),
        });
        let weak = Arc::downgrade(&server);
        server.acceptor.set_new_connection_callback(Box::new(
            move |stream: TcpStream, peer: SocketAddr| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(stream, peer);
                }
            },
        ));
        Ok(server)
    }

    /// Address the listening socket is bound to.
    pub fn listen_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    /// Server name used as the connection-name prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle of the base (acceptor) loop.
    pub fn base_loop(&self) -> LoopHandle {
        self.base.clone()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Installs the connection callback applied to every new connection.
    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.cbs.lock().connection = Some(cb);
    }

    /// Installs the message callback applied to every new connection.
    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.cbs.lock().message = Some(cb);
    }

    /// Installs the write-complete callback applied to every new connection.
    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.cbs.lock().write_complete = Some(cb);
    }

    /// Installs the per-worker-thread init callback; runs before each worker
    /// loop starts.
    pub fn set_thread_init_callback(&self, cb: LoopInit) {
        self.cbs.lock().thread_init = Some(cb);
    }

    /// Starts the worker pool and begins accepting. Idempotent.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let init = self.cbs.lock().thread_init.clone();
        self.pool.start(self.config.worker_threads, init)?;
        self.acceptor.listen();
        info!(
            "server {} listening on {} with {} workers",
            self.name,
            self.listen_addr(),
            self.config.worker_threads
        );
        Ok(())
    }

    fn new_connection(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let io_loop = self.pool.next_loop();
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let conn_name = format!("{}-{}#{}", self.name, peer, id);
        let local = stream.local_addr().unwrap_or_else(|_| sock::unspecified_addr());
        info!("server {}: new connection [{}]", self.name, conn_name);

        let conn = TcpConnection::new(
            io_loop.clone(),
            conn_name.clone(),
            stream,
            local,
            peer,
            &self.config,
        );
        {
            let cbs = self.cbs.lock();
            if let Some(cb) = cbs.connection.clone() {
                conn.set_connection_callback(cb);
            }
            if let Some(cb) = cbs.message.clone() {
                conn.set_message_callback(cb);
            }
            if let Some(cb) = cbs.write_complete.clone() {
                conn.set_write_complete_callback(cb);
            }
        }
        let weak: Weak<TcpServer> = Arc::downgrade(self);
        conn.set_close_callback(Arc::new(move |c: &Arc<TcpConnection>| {
            match weak.upgrade() {
                Some(server) => server.remove_connection(c),
                None => {
                    // Server already gone: still tear the connection down.
                    let conn = Arc::clone(c);
                    c.owner_loop().queue_in_loop(move |lp| conn.connect_destroyed(lp));
                }
            }
        }));
        self.connections.lock().insert(conn_name, Arc::clone(&conn));
        io_loop.run_in_loop(move |lp| conn.connect_established(lp));
    }

    fn remove_connection(self: &Arc<Self>, conn: &Arc<TcpConnection>) {
        let this = Arc::clone(self);
        let conn = Arc::clone(conn);
        self.base.run_in_loop(move |_| {
            info!("server {}: remove connection [{}]", this.name, conn.name());
            if this.connections.lock().remove(conn.name()).is_none() {
                warn!("server {}: connection [{}] was not mapped", this.name, conn.name());
            }
            let c = Arc::clone(&conn);
            conn.owner_loop().queue_in_loop(move |lp| c.connect_destroyed(lp));
        });
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        for (_, conn) in self.connections.lock().drain() {
            let c = Arc::clone(&conn);
            conn.owner_loop().run_in_loop(move |lp| c.connect_destroyed(lp));
        }
        // The acceptor channel holds the last strong acceptor reference via
        // its read callback; removing it closes the listening socket.
        let fd = self.acceptor.fd();
        self.base.queue_in_loop(move |lp| {
            if let Some(ch) = lp.channel_for(fd) {
                Channel::disable_all(&ch, lp);
                lp.remove_channel(&ch);
            }
        });
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("name", &self.name)
            .field("listen_addr", &self.listen_addr())
            .field("connections", &self.connection_count())
            .finish()
    }
}
