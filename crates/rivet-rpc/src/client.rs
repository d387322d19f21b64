//! RpcClient: a TCP client sharing one channel across reconnects.
//!
//! On connect the channel is pointed at the new connection; on disconnect
//! it is unbound and every outstanding completion is dropped without
//! running. The underlying client reconnects with backoff; calls are never
//! replayed.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use rivet_core::Config;
use rivet_net::TcpClient;
use rivet_reactor::LoopHandle;

use crate::channel::RpcChannel;

/// Invoked each time the channel is bound to a fresh connection.
pub type ChannelReadyCallback = Arc<dyn Fn(&Arc<RpcChannel>) + Send + Sync>;

/// RPC client: TCP client plus one shared channel.
pub struct RpcClient {
    tcp: Arc<TcpClient>,
    channel: Arc<RpcChannel>,
    ready_cb: Arc<Mutex<Option<ChannelReadyCallback>>>,
}

impl RpcClient {
    /// Creates a client for `server_addr`; call
    /// [`connect`](RpcClient::connect) to start.
    pub fn new(
        loop_: LoopHandle,
        name: impl Into<String>,
        server_addr: SocketAddr,
        config: Config,
    ) -> Arc<RpcClient> {
        let tcp = TcpClient::new(loop_, name, server_addr, config);
        let channel = RpcChannel::new();
        let ready_cb: Arc<Mutex<Option<ChannelReadyCallback>>> = Arc::new(Mutex::new(None));

        {
            let ch = Arc::clone(&channel);
            tcp.set_message_callback(Arc::new(move |conn, buf| ch.on_message(conn, buf)));
        }
        {
            let ch = Arc::clone(&channel);
            let ready = Arc::clone(&ready_cb);
            tcp.set_connection_callback(Arc::new(move |conn| {
                if conn.connected() {
                    ch.set_connection(Some(Arc::clone(conn)));
                    if let Some(cb) = ready.lock().clone() {
                        cb(&ch);
                    }
                } else {
                    ch.set_connection(None);
                    // Calls are not replayed across reconnects.
                    ch.drain_outstanding();
                }
            }));
        }
        tcp.enable_retry();

        Arc::new(RpcClient { tcp, channel, ready_cb })
    }

    /// Installs the hook that fires once the channel has a live connection.
    pub fn set_connect_callback(&self, cb: ChannelReadyCallback) {
        *self.ready_cb.lock() = Some(cb);
    }

    /// The shared channel; valid for calls whenever a connection is bound.
    pub fn channel(&self) -> Arc<RpcChannel> {
        Arc::clone(&self.channel)
    }

    /// Starts connecting, retrying with backoff until reachable.
    pub fn connect(&self) {
        self.tcp.connect();
    }

    /// Half-closes the live connection.
    pub fn disconnect(&self) {
        self.tcp.disconnect();
    }

    /// Cancels connecting.
    pub fn stop(&self) {
        self.tcp.stop();
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient").field("channel", &self.channel).finish()
    }
}
