//! RpcChannel: the bidirectional call multiplexer.
//!
//! Outbound calls get a strictly monotonic id from an atomic counter and
//! park their completion in the outstanding table until the matching
//! response arrives. Inbound requests resolve the service by name, then the
//! method against the service's method list, before dispatch; the
//! completion closure handed to the service captures the connection and the
//! call id, and sending the response envelope is all it does. Destroying
//! the channel drains the table without running anything.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use prost::Message;
use tracing::{debug, warn};

use rivet_core::Buffer;
use rivet_net::TcpConnection;

use crate::codec::{self, RpcCodec};
use crate::message::{ErrorCode, MessageType, RpcMessage};
use crate::service::{Done, ServiceMap};

/// Erased completion for one outstanding call: receives the response
/// envelope, or the error code the peer reported.
pub type ResponseHandler = Box<dyn FnOnce(Result<RpcMessage, ErrorCode>) + Send>;

/// Bidirectional RPC endpoint bound to one connection.
pub struct RpcChannel {
    codec: RpcCodec,
    next_id: AtomicI64,
    outstanding: Mutex<HashMap<i64, ResponseHandler>>,
    services: Mutex<Option<Arc<ServiceMap>>>,
    connection: Mutex<Option<Arc<TcpConnection>>>,
}

impl RpcChannel {
    /// Creates an unbound channel.
    pub fn new() -> Arc<RpcChannel> {
        Arc::new_cyclic(|weak: &Weak<RpcChannel>| {
            let w = weak.clone();
            let codec = RpcCodec::new(Arc::new(move |conn, message| {
                if let Some(channel) = w.upgrade() {
                    channel.on_rpc_message(conn, message);
                }
            }));
            RpcChannel {
                codec,
                next_id: AtomicI64::new(0),
                outstanding: Mutex::new(HashMap::new()),
                services: Mutex::new(None),
                connection: Mutex::new(None),
            }
        })
    }

    /// Binds (or unbinds) the transport connection.
    pub fn set_connection(&self, conn: Option<Arc<TcpConnection>>) {
        *self.connection.lock() = conn;
    }

    /// The bound connection, if any.
    pub fn connection(&self) -> Option<Arc<TcpConnection>> {
        self.connection.lock().clone()
    }

    /// Points inbound request dispatch at a service registry.
    pub fn set_services(&self, services: Arc<ServiceMap>) {
        *self.services.lock() = Some(services);
    }

    /// Number of calls awaiting a response.
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.lock().len()
    }

    /// Drops every outstanding completion without running it.
    pub fn drain_outstanding(&self) {
        let dropped: Vec<ResponseHandler> = {
            let mut table = self.outstanding.lock();
            table.drain().map(|(_, handler)| handler).collect()
        };
        if !dropped.is_empty() {
            debug!("dropping {} outstanding calls", dropped.len());
        }
    }

    /// Connection message callback: feed received bytes through the codec.
    pub fn on_message(&self, conn: &Arc<TcpConnection>, buf: &mut Buffer) {
        self.codec.on_message(conn, buf);
    }

    /// Issues a typed call. The completion receives the decoded response or
    /// the error code from the response envelope; an undecodable response
    /// surfaces as [`ErrorCode::WrongProto`]. Returns the assigned id.
    pub fn call<Req, Resp, F>(
        &self,
        service: &str,
        method: &str,
        request: &Req,
        completion: F,
    ) -> i64
    where
        Req: Message,
        Resp: Message + Default,
        F: FnOnce(Result<Resp, ErrorCode>) + Send + 'static,
    {
        let handler: ResponseHandler = Box::new(move |result| match result {
            Ok(envelope) => match Resp::decode(&envelope.response[..]) {
                Ok(response) => completion(Ok(response)),
                Err(_) => completion(Err(ErrorCode::WrongProto)),
            },
            Err(code) => completion(Err(code)),
        });
        self.call_raw(service, method, request.encode_to_vec(), handler)
    }

    /// Issues a call with an already-serialized request. Returns the
    /// assigned id; ids are strictly increasing per channel.
    pub fn call_raw(
        &self,
        service: &str,
        method: &str,
        request: Vec<u8>,
        handler: ResponseHandler,
    ) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel) + 1;
        let message = RpcMessage::request(id, service, method, request);
        let conn = self.connection.lock().clone();
        match conn {
            Some(conn) => {
                self.outstanding.lock().insert(id, handler);
                self.codec.send(&conn, &message);
            }
            None => {
                // No transport: the completion is dropped without running.
                warn!("call {}::{} with no connection", service, method);
            }
        }
        id
    }

    fn on_rpc_message(&self, conn: &Arc<TcpConnection>, message: RpcMessage) {
        match message.message_type() {
            MessageType::Response => self.handle_response(message),
            MessageType::Request => self.handle_request(conn, message),
            MessageType::Error => {
                warn!("peer error envelope for id {}: {:?}", message.id, message.error_code());
            }
        }
    }

    fn handle_response(&self, message: RpcMessage) {
        let handler = self.outstanding.lock().remove(&message.id);
        match handler {
            Some(handler) => {
                let code = message.error_code();
                if code == ErrorCode::NoError {
                    handler(Ok(message));
                } else {
                    handler(Err(code));
                }
            }
            None => debug!("response for unknown id {} dropped", message.id),
        }
    }

    fn handle_request(&self, conn: &Arc<TcpConnection>, message: RpcMessage) {
        let id = message.id;
        let services = self.services.lock().clone();
        let service = services.as_ref().and_then(|map| map.get(&message.service).cloned());
        let error = match service {
            Some(service) if !service.methods().contains(&message.method.as_str()) => {
                ErrorCode::NoMethod
            }
            Some(service) => {
                let reply_conn = Arc::clone(conn);
                let done: Done = Box::new(move |payload: Vec<u8>| {
                    codec::send_message(&reply_conn, &RpcMessage::response(id, payload));
                });
                match service.call_method(&message.method, &message.request, done) {
                    Ok(()) => ErrorCode::NoError,
                    Err(code) => code,
                }
            }
            None => ErrorCode::NoService,
        };
        if error != ErrorCode::NoError {
            codec::send_message(conn, &RpcMessage::error_response(id, error));
        }
    }
}

impl Drop for RpcChannel {
    fn drop(&mut self) {
        // Outstanding completions are released without being run.
        let n = self.outstanding.get_mut().len();
        if n > 0 {
            debug!("channel dropped with {} outstanding calls", n);
        }
    }
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("outstanding", &self.outstanding_count())
            .field("bound", &self.connection.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_ids_are_strictly_increasing_even_unbound() {
        let channel = RpcChannel::new();
        let mut last = 0;
        for _ in 0..100 {
            let id = channel.call_raw("s", "m", Vec::new(), Box::new(|_| {}));
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn test_unbound_call_drops_completion_without_running() {
        let channel = RpcChannel::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&ran);
        channel.call_raw(
            "s",
            "m",
            Vec::new(),
            Box::new(move |_| {
                observed.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(channel.outstanding_count(), 0);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_drain_outstanding_empties_table() {
        let channel = RpcChannel::new();
        channel
            .outstanding
            .lock()
            .insert(1, Box::new(|_| panic!("must not run")) as ResponseHandler);
        assert_eq!(channel.outstanding_count(), 1);
        channel.drain_outstanding();
        assert_eq!(channel.outstanding_count(), 0);
    }

    #[test]
    fn test_response_for_unknown_id_is_ignored() {
        let channel = RpcChannel::new();
        // Must not panic or grow the table.
        channel.handle_response(RpcMessage::response(12345, Vec::new()));
        assert_eq!(channel.outstanding_count(), 0);
    }
}
