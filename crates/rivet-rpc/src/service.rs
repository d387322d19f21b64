//! The polymorphic service contract.
//!
//! A service exposes its fully-qualified name, the method names it serves,
//! and a dispatch entry point. The implementation decodes its own request
//! type, produces a response, and runs `done` exactly once with the
//! serialized response; dispatch-level failures are returned as an
//! [`ErrorCode`] instead.

use std::collections::HashMap;
use std::sync::Arc;

use prost::Message;

use crate::message::ErrorCode;

/// Completion handed to [`Service::call_method`]. Consumes the serialized
/// response; may run later and on a different thread, but exactly once.
pub type Done = Box<dyn FnOnce(Vec<u8>) + Send>;

/// A dispatchable RPC service.
pub trait Service: Send + Sync {
    /// Fully-qualified service name used for registry lookup.
    fn name(&self) -> &str;

    /// Names of the methods this service exposes. The dispatcher consults
    /// this before [`call_method`](Service::call_method) and answers calls
    /// to anything else with [`ErrorCode::NoMethod`] itself.
    fn methods(&self) -> &[&str];

    /// Dispatches one call. `method` is guaranteed to be one of
    /// [`methods`](Service::methods).
    ///
    /// On success the implementation arranges for `done` to run exactly once
    /// with the serialized response. Undecodable requests return
    /// [`ErrorCode::InvalidRequest`].
    fn call_method(&self, method: &str, request: &[u8], done: Done) -> Result<(), ErrorCode>;
}

/// Registry from fully-qualified service name to implementation.
/// Populated before the server starts; read-only afterwards.
pub type ServiceMap = HashMap<String, Arc<dyn Service>>;

/// Decodes a request payload, mapping failure to `InvalidRequest`.
pub fn decode_request<T: Message + Default>(bytes: &[u8]) -> Result<T, ErrorCode> {
    T::decode(bytes).map_err(|_| ErrorCode::InvalidRequest)
}

/// Serializes a response payload.
pub fn encode_response<T: Message>(message: &T) -> Vec<u8> {
    message.encode_to_vec()
}
