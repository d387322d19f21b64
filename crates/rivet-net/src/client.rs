//! TcpClient: connector + single connection, with optional reconnect.

use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::info;

use rivet_core::Config;
use rivet_reactor::LoopHandle;

use crate::connection::{
    ConnectionCallback, MessageCallback, TcpConnection, WriteCompleteCallback,
};
use crate::connector::Connector;
use crate::sock;

#[derive(Default)]
struct ClientCallbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
}

/// TCP client owning one connection at a time.
pub struct TcpClient {
    loop_: LoopHandle,
    name: String,
    connector: Arc<Connector>,
    connection: Mutex<Option<Arc<TcpConnection>>>,
    retry: AtomicBool,
    connect: AtomicBool,
    next_conn_id: AtomicU64,
    config: Config,
    cbs: Mutex<ClientCallbacks>,
}

impl TcpClient {
    /// Creates a client targeting `server_addr`; nothing happens until
    /// [`connect`](TcpClient::connect).
    pub fn new(
        loop_: LoopHandle,
        name: impl Into<String>,
        server_addr: SocketAddr,
        config: Config,
    ) -> Arc<TcpClient> {
        let name = name.into();
        let connector = Connector::new(loop_.clone(), server_addr, &config);
        let client = Arc::new(TcpClient {
            loop_,
            name,
            connector,
            connection: Mutex::new(None),
            retry: AtomicBool::new(false),
            connect: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(0),
            config,
            cbs: Mutex::new(ClientCallbacks::default()),
        });
        let weak = Arc::downgrade(&client);
        client.connector.set_new_socket_callback(Box::new(move |stream: TcpStream| {
            if let Some(client) = weak.upgrade() {
                client.new_connection(stream);
            }
        }));
        client
    }

    /// Client name used as the connection-name prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address this client connects to.
    pub fn server_addr(&self) -> SocketAddr {
        self.connector.server_addr()
    }

    /// The live connection, if any.
    pub fn connection(&self) -> Option<Arc<TcpConnection>> {
        self.connection.lock().clone()
    }

    /// Reconnect automatically after a disconnect.
    pub fn enable_retry(&self) {
        self.retry.store(true, Ordering::Release);
    }

    /// True when reconnect-on-disconnect is armed.
    pub fn retry_enabled(&self) -> bool {
        self.retry.load(Ordering::Acquire)
    }

    /// Installs the connection callback.
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

    /// Starts connecting (with backoff until the peer is reachable).
    pub fn connect(self: &Arc<Self>) {
        info!("client {}: connecting to {}", self.name, self.server_addr());
        self.connect.store(true, Ordering::Release);
        self.connector.start();
    }

    /// Half-closes the live connection; the connector is left alone.
    pub fn disconnect(&self) {
        self.connect.store(false, Ordering::Release);
        if let Some(conn) = self.connection.lock().clone() {
            conn.shutdown();
        }
    }

    /// Cancels connecting.
    pub fn stop(&self) {
        self.connect.store(false, Ordering::Release);
        self.connector.stop();
    }

    fn new_connection(self: &Arc<Self>, stream: TcpStream) {
        // Runs on the loop thread, from the connector's writable dispatch.
        let peer = stream.peer_addr().unwrap_or_else(|_| sock::unspecified_addr());
        let local = stream.local_addr().unwrap_or_else(|_| sock::unspecified_addr());
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let conn_name = format!("{}-{}#{}", self.name, peer, id);
        info!("client {}: connected [{}]", self.name, conn_name);

        let conn =
            TcpConnection::new(self.loop_.clone(), conn_name, stream, local, peer, &self.config);
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
        let weak: Weak<TcpClient> = Arc::downgrade(self);
        conn.set_close_callback(Arc::new(move |c: &Arc<TcpConnection>| {
            match weak.upgrade() {
                Some(client) => client.remove_connection(c),
                None => {
                    let conn = Arc::clone(c);
                    c.owner_loop().queue_in_loop(move |lp| conn.connect_destroyed(lp));
                }
            }
        }));
        *self.connection.lock() = Some(Arc::clone(&conn));
        self.loop_.run_in_loop(move |lp| conn.connect_established(lp));
    }

    fn remove_connection(self: &Arc<Self>, conn: &Arc<TcpConnection>) {
        let this = Arc::clone(self);
        let conn = Arc::clone(conn);
        self.loop_.run_in_loop(move |lp| {
            {
                let mut slot = this.connection.lock();
                if slot.as_ref().map(|c| Arc::ptr_eq(c, &conn)).unwrap_or(false) {
                    slot.take();
                }
            }
            let c = Arc::clone(&conn);
            lp.queue_in_loop(move |lp| c.connect_destroyed(lp));
            if this.retry.load(Ordering::Acquire) && this.connect.load(Ordering::Acquire) {
                info!("client {}: reconnecting to {}", this.name, this.server_addr());
                this.connector.restart(lp);
            }
        });
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.connector.stop();
        if let Some(conn) = self.connection.lock().take() {
            // The close path falls back to plain destruction once the client
            // is gone.
            conn.force_close();
        }
    }
}

impl std::fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpClient")
            .field("name", &self.name)
            .field("server_addr", &self.server_addr())
            .field("connected", &self.connection.lock().is_some())
            .finish()
    }
}
