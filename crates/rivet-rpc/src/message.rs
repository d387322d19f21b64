//! The wire envelope: one RPC message, request or response.

/// Direction of an envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    /// A call from client to server.
    Request = 0,
    /// The server's answer, correlated by id.
    Response = 1,
    /// Standalone error report (folded into Response + error in practice).
    Error = 2,
}

impl MessageType {
    /// Decodes a wire value, treating unknown values as `Request`.
    pub fn from_wire(value: i32) -> MessageType {
        match value {
            1 => MessageType::Response,
            2 => MessageType::Error,
            _ => MessageType::Request,
        }
    }
}

/// Dispatch outcome carried in a response envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    /// Call dispatched and answered normally.
    NoError = 0,
    /// The peer's payload did not decode as the expected message.
    WrongProto = 1,
    /// No service registered under the requested name.
    NoService = 2,
    /// The service does not expose the requested method.
    NoMethod = 3,
    /// The request payload did not decode.
    InvalidRequest = 4,
}

impl ErrorCode {
    /// Decodes a wire value, treating unknown values as `NoError`.
    pub fn from_wire(value: i32) -> ErrorCode {
        match value {
            1 => ErrorCode::WrongProto,
            2 => ErrorCode::NoService,
            3 => ErrorCode::NoMethod,
            4 => ErrorCode::InvalidRequest,
            _ => ErrorCode::NoError,
        }
    }
}

/// One RPC envelope as carried in the frame payload.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RpcMessage {
    /// Request, Response or Error.
    #[prost(enumeration = "MessageType", tag = "1")]
    pub kind: i32,
    /// Correlation id, strictly monotonic per channel.
    #[prost(int64, tag = "2")]
    pub id: i64,
    /// Fully-qualified service name (requests only).
    #[prost(string, tag = "3")]
    pub service: String,
    /// Method name within the service (requests only).
    #[prost(string, tag = "4")]
    pub method: String,
    /// Serialized request payload.
    #[prost(bytes = "vec", tag = "5")]
    pub request: Vec<u8>,
    /// Serialized response payload.
    #[prost(bytes = "vec", tag = "6")]
    pub response: Vec<u8>,
    /// Dispatch outcome (responses only).
    #[prost(enumeration = "ErrorCode", tag = "7")]
    pub error: i32,
}

impl RpcMessage {
    /// Builds a request envelope.
    pub fn request(id: i64, service: &str, method: &str, payload: Vec<u8>) -> RpcMessage {
        RpcMessage {
            kind: MessageType::Request as i32,
            id,
            service: service.to_string(),
            method: method.to_string(),
            request: payload,
            ..Default::default()
        }
    }

    /// Builds a response envelope carrying `payload`.
    pub fn response(id: i64, payload: Vec<u8>) -> RpcMessage {
        RpcMessage {
            kind: MessageType::Response as i32,
            id,
            response: payload,
            ..Default::default()
        }
    }

    /// Builds a response envelope carrying only an error code.
    pub fn error_response(id: i64, code: ErrorCode) -> RpcMessage {
        RpcMessage {
            kind: MessageType::Response as i32,
            id,
            error: code as i32,
            ..Default::default()
        }
    }

    /// The envelope direction.
    pub fn message_type(&self) -> MessageType {
        MessageType::from_wire(self.kind)
    }

    /// The dispatch outcome.
    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::from_wire(self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_envelope_roundtrip() {
        let msg = RpcMessage::request(7, "pkg.Service", "Method", vec![1, 2, 3]);
        let bytes = msg.encode_to_vec();
        let back = RpcMessage::decode(&bytes[..]).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.message_type(), MessageType::Request);
        assert_eq!(back.error_code(), ErrorCode::NoError);
    }

    #[test]
    fn test_wire_enum_fallbacks() {
        assert_eq!(MessageType::from_wire(42), MessageType::Request);
        assert_eq!(ErrorCode::from_wire(42), ErrorCode::NoError);
        assert_eq!(ErrorCode::from_wire(3), ErrorCode::NoMethod);
    }

    #[test]
    fn test_error_response_shape() {
        let msg = RpcMessage::error_response(9, ErrorCode::NoService);
        assert_eq!(msg.message_type(), MessageType::Response);
        assert_eq!(msg.error_code(), ErrorCode::NoService);
        assert!(msg.response.is_empty());
    }
}
