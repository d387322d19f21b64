//! RpcServer: a TCP server with a service registry.
//!
//! Each new connection gets its own [`RpcChannel`] pointed at the shared
//! registry; the channel lives in the connection's context slot, tying its
//! lifetime to the connection. On disconnect the slot is cleared, which
//! breaks the channel-connection cycle.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use rivet_core::{Config, Result};
use rivet_net::{TcpConnection, TcpServer};
use rivet_reactor::{LoopHandle, LoopInit};

use crate::channel::RpcChannel;
use crate::service::{Service, ServiceMap};

/// RPC server: TCP server plus service registry.
pub struct RpcServer {
    tcp: Arc<TcpServer>,
    services: Mutex<ServiceMap>,
    started: AtomicBool,
}

impl RpcServer {
    /// Binds the listening socket. Register services, then
    /// [`start`](RpcServer::start).
    pub fn new(
        base: LoopHandle,
        name: impl Into<String>,
        listen_addr: SocketAddr,
        config: Config,
    ) -> Result<Arc<RpcServer>> {
        let tcp = TcpServer::new(base, name, listen_addr, config)?;
        Ok(Arc::new(RpcServer {
            tcp,
            services: Mutex::new(ServiceMap::new()),
            started: AtomicBool::new(false),
        }))
    }

    /// Adds a service under its fully-qualified name. Must happen before
    /// [`start`](RpcServer::start); the registry is read-only afterwards.
    pub fn register_service(&self, service: Arc<dyn Service>) {
        assert!(
            !self.started.load(Ordering::Acquire),
            "services must be registered before start"
        );
        let name = service.name().to_string();
        info!("server {}: service {} registered", self.tcp.name(), name);
        self.services.lock().insert(name, service);
    }

    /// Address the listening socket is bound to.
    pub fn listen_addr(&self) -> SocketAddr {
        self.tcp.listen_addr()
    }

    /// Installs the per-worker-thread init callback.
    pub fn set_thread_init_callback(&self, cb: LoopInit) {
        self.tcp.set_thread_init_callback(cb);
    }

    /// Snapshots the registry and starts accepting.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let registry: Arc<ServiceMap> = Arc::new(self.services.lock().clone());
        self.tcp.set_connection_callback(Arc::new(move |conn: &Arc<TcpConnection>| {
            if conn.connected() {
                let channel = RpcChannel::new();
                channel.set_services(Arc::clone(&registry));
                channel.set_connection(Some(Arc::clone(conn)));
                let ch = Arc::clone(&channel);
                conn.set_message_callback(Arc::new(move |conn, buf| ch.on_message(conn, buf)));
                conn.set_context(channel);
            } else {
                if let Some(channel) = conn.context::<RpcChannel>() {
                    channel.set_connection(None);
                }
                conn.clear_context();
            }
        }));
        self.tcp.start()
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("listen_addr", &self.listen_addr())
            .field("services", &self.services.lock().len())
            .finish()
    }
}
