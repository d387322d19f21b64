//! Frame codec: length prefix, tag, protobuf payload, Adler-32 checksum.
//!
//! Encoding appends `tag || payload`, then the checksum over both, then
//! prepends the total length into the buffer's head margin so no copy is
//! needed. Decoding loops over complete frames; a malformed frame stops the
//! loop without consuming anything, leaving the stream for the caller to
//! judge.

use std::sync::Arc;

use adler32::RollingAdler32;
use byteorder::{BigEndian, ByteOrder};
use prost::Message;
use thiserror::Error;
use tracing::error;

use rivet_core::Buffer;
use rivet_net::TcpConnection;

use crate::message::RpcMessage;

/// Length-prefix size.
pub const HEADER_LEN: usize = 4;
/// Frame tag identifying this protocol revision.
pub const TAG: [u8; 4] = *b"RPC0";
/// Checksum trailer size.
pub const CHECKSUM_LEN: usize = 4;
/// Smallest legal `len` value: tag plus checksum around an empty payload.
pub const MIN_MESSAGE_LEN: usize = 4 + CHECKSUM_LEN;
/// Largest legal `len` value.
pub const MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;

/// Frame decode failures.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The length prefix is outside `[MIN_MESSAGE_LEN, MAX_MESSAGE_LEN]`.
    #[error("frame length {0} out of range")]
    InvalidLength(i32),
    /// The checksum trailer does not match the frame contents.
    #[error("checksum mismatch")]
    CheckSum,
    /// The frame does not start with the expected tag.
    #[error("unknown message tag")]
    UnknownMessageType,
    /// The payload did not decode as an envelope.
    #[error("envelope parse failure")]
    Parse,
}

/// zlib Adler-32 over `data`.
pub fn checksum(data: &[u8]) -> u32 {
    let mut adler = RollingAdler32::new();
    adler.update_buffer(data);
    adler.hash()
}

/// Encodes one envelope into an empty buffer: appends `tag || payload`,
/// appends the checksum, then prepends the total length into the head
/// margin.
pub fn fill_empty_buffer(buf: &mut Buffer, message: &RpcMessage) {
    debug_assert_eq!(buf.readable_bytes(), 0);
    buf.append(&TAG);
    buf.append(&message.encode_to_vec());
    let sum = checksum(buf.peek());
    buf.append_i32(sum as i32);
    let len = buf.readable_bytes() as i32;
    buf.prepend_i32(len);
}

/// Validates and decodes one complete frame body (everything after the
/// length prefix).
pub fn parse(frame: &[u8]) -> Result<RpcMessage, CodecError> {
    if frame.len() < MIN_MESSAGE_LEN {
        return Err(CodecError::InvalidLength(frame.len() as i32));
    }
    let (body, trailer) = frame.split_at(frame.len() - CHECKSUM_LEN);
    let expected = BigEndian::read_i32(trailer) as u32;
    if checksum(body) != expected {
        return Err(CodecError::CheckSum);
    }
    if body[..TAG.len()] != TAG {
        return Err(CodecError::UnknownMessageType);
    }
    RpcMessage::decode(&body[TAG.len()..]).map_err(|_| CodecError::Parse)
}

/// Extracts one envelope from `buf` if a complete, valid frame is present.
///
/// `Ok(None)` means "wait for more bytes". Errors consume nothing: the
/// stream is treated as corrupt from here on.
pub fn decode_one(buf: &mut Buffer) -> Result<Option<RpcMessage>, CodecError> {
    if buf.readable_bytes() < HEADER_LEN + MIN_MESSAGE_LEN {
        return Ok(None);
    }
    let len = buf.peek_i32();
    if len < MIN_MESSAGE_LEN as i32 || len > MAX_MESSAGE_LEN as i32 {
        return Err(CodecError::InvalidLength(len));
    }
    let frame_len = len as usize;
    if buf.readable_bytes() < HEADER_LEN + frame_len {
        return Ok(None);
    }
    let message = parse(&buf.peek()[HEADER_LEN..HEADER_LEN + frame_len])?;
    buf.retrieve(HEADER_LEN + frame_len);
    Ok(Some(message))
}

/// Encodes `message` and queues it on `conn`.
pub fn send_message(conn: &Arc<TcpConnection>, message: &RpcMessage) {
    let mut buf = Buffer::new();
    fill_empty_buffer(&mut buf, message);
    conn.send_buffer(&mut buf);
}

/// Callback receiving each decoded envelope.
pub type RpcMessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, RpcMessage) + Send + Sync>;
/// Callback surfacing frame errors to the embedder.
pub type CodecErrorCallback = Arc<dyn Fn(&Arc<TcpConnection>, CodecError) + Send + Sync>;

/// Stateful end of the codec: owns the dispatch callbacks.
pub struct RpcCodec {
    message_cb: RpcMessageCallback,
    error_cb: Option<CodecErrorCallback>,
}

impl RpcCodec {
    /// Creates a codec delivering envelopes to `message_cb`.
    pub fn new(message_cb: RpcMessageCallback) -> RpcCodec {
        RpcCodec { message_cb, error_cb: None }
    }

    /// Installs a hook observing frame errors (the connection is left open
    /// either way; closing is the embedder's policy call).
    pub fn set_error_callback(&mut self, cb: CodecErrorCallback) {
        self.error_cb = Some(cb);
    }

    /// Encodes and sends one envelope on `conn`.
    pub fn send(&self, conn: &Arc<TcpConnection>, message: &RpcMessage) {
        send_message(conn, message);
    }

    /// Connection message callback: frames envelopes out of `buf` until it
    /// runs dry or turns out to be corrupt.
    pub fn on_message(&self, conn: &Arc<TcpConnection>, buf: &mut Buffer) {
        loop {
            match decode_one(buf) {
                Ok(Some(message)) => (self.message_cb)(conn, message),
                Ok(None) => break,
                Err(e) => {
                    error!("{}: frame error: {}", conn.name(), e);
                    if let Some(cb) = &self.error_cb {
                        cb(conn, e);
                    }
                    break;
                }
            }
        }
    }
}

impl std::fmt::Debug for RpcCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcCodec").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ErrorCode, MessageType};

    fn sample_message() -> RpcMessage {
        RpcMessage::request(1, "pkg.Echo", "Echo", b"hello".to_vec())
    }

    fn encode(message: &RpcMessage) -> Vec<u8> {
        let mut buf = Buffer::new();
        fill_empty_buffer(&mut buf, message);
        buf.peek().to_vec()
    }

    #[test]
    fn test_wire_layout() {
        let message = sample_message();
        let wire = encode(&message);

        // First four bytes: big-endian length of everything after them.
        let len = BigEndian::read_i32(&wire[..4]) as usize;
        assert_eq!(len, wire.len() - HEADER_LEN);

        // Tag follows the length.
        assert_eq!(&wire[4..8], b"RPC0");

        // Trailer: Adler-32 over tag || payload.
        let body = &wire[HEADER_LEN..wire.len() - CHECKSUM_LEN];
        let sum = BigEndian::read_i32(&wire[wire.len() - CHECKSUM_LEN..]) as u32;
        assert_eq!(sum, checksum(body));
    }

    #[test]
    fn test_roundtrip() {
        let message = sample_message();
        let mut buf = Buffer::new();
        fill_empty_buffer(&mut buf, &message);
        let decoded = decode_one(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, message);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn test_empty_payload_roundtrip() {
        let message = RpcMessage::default();
        let mut buf = Buffer::new();
        fill_empty_buffer(&mut buf, &message);
        let decoded = decode_one(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_arbitrary_chunking_preserves_frames() {
        let messages: Vec<RpcMessage> = (0..5)
            .map(|i| RpcMessage::request(i, "pkg.Echo", "Echo", vec![i as u8; i as usize * 7]))
            .collect();
        let mut wire = Vec::new();
        for m in &messages {
            wire.extend(encode(m));
        }

        // Feed the concatenation in every chunk size; the decoder must
        // produce exactly the original sequence with no spurious frames.
        for chunk in 1..=17 {
            let mut buf = Buffer::new();
            let mut seen = Vec::new();
            for piece in wire.chunks(chunk) {
                buf.append(piece);
                loop {
                    match decode_one(&mut buf).unwrap() {
                        Some(m) => seen.push(m),
                        None => break,
                    }
                }
            }
            assert_eq!(seen, messages, "chunk size {}", chunk);
        }
    }

    #[test]
    fn test_single_byte_corruption_is_rejected() {
        let message = sample_message();
        let wire = encode(&message);
        // Flip one payload byte (past tag, before checksum).
        for i in 8..wire.len() - CHECKSUM_LEN {
            let mut corrupted = wire.clone();
            corrupted[i] ^= 0x01;
            let mut buf = Buffer::new();
            buf.append(&corrupted);
            let before = buf.readable_bytes();
            assert_eq!(decode_one(&mut buf), Err(CodecError::CheckSum), "byte {}", i);
            // Nothing consumed on error.
            assert_eq!(buf.readable_bytes(), before);
        }
    }

    #[test]
    fn test_bad_tag_detected() {
        let message = sample_message();
        let mut wire = encode(&message);
        // Rewrite the tag and fix the checksum so only the tag is at fault.
        wire[4..8].copy_from_slice(b"RPCX");
        let body_len = wire.len() - HEADER_LEN - CHECKSUM_LEN;
        let sum = checksum(&wire[HEADER_LEN..HEADER_LEN + body_len]);
        let at = wire.len() - CHECKSUM_LEN;
        BigEndian::write_i32(&mut wire[at..], sum as i32);

        let mut buf = Buffer::new();
        buf.append(&wire);
        assert_eq!(decode_one(&mut buf), Err(CodecError::UnknownMessageType));
    }

    #[test]
    fn test_length_out_of_range() {
        let mut buf = Buffer::new();
        buf.append_i32((MAX_MESSAGE_LEN + 1) as i32);
        buf.append(&[0u8; 16]);
        assert!(matches!(decode_one(&mut buf), Err(CodecError::InvalidLength(_))));

        let mut buf = Buffer::new();
        buf.append_i32(3);
        buf.append(&[0u8; 16]);
        assert!(matches!(decode_one(&mut buf), Err(CodecError::InvalidLength(3))));
    }

    #[test]
    fn test_partial_frame_waits() {
        let message = sample_message();
        let wire = encode(&message);
        let mut buf = Buffer::new();
        buf.append(&wire[..wire.len() - 1]);
        assert_eq!(decode_one(&mut buf), Ok(None));
        buf.append(&wire[wire.len() - 1..]);
        let decoded = decode_one(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.message_type(), MessageType::Request);
        assert_eq!(decoded.error_code(), ErrorCode::NoError);
    }
}
