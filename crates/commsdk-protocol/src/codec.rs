use bytes::{Buf, BytesMut};

use crate::error::ProtocolError;
use crate::messages::{ClientMessage, ServerMessage};

/// Maximum session frame size: 1 MiB.
pub const MAX_MSG_SIZE: u32 = 1_048_576;

/// Blob transfers are split into chunks of this size.
pub const BLOB_CHUNK_SIZE: usize = 256 * 1024;

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// SDK version, read from Cargo.toml at compile time.
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

fn frame(payload: Vec<u8>) -> Result<Vec<u8>, ProtocolError> {
    if payload.len() > MAX_MSG_SIZE as usize {
        return Err(ProtocolError::MessageTooLarge(payload.len()));
    }
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Encode a `ClientMessage` into a length-prefixed byte buffer.
pub fn encode_client_msg(msg: &ClientMessage) -> Result<Vec<u8>, ProtocolError> {
    frame(postcard::to_allocvec(msg)?)
}

/// Decode a `ClientMessage` from a postcard-encoded payload (without length prefix).
pub fn decode_client_msg(payload: &[u8]) -> Result<ClientMessage, ProtocolError> {
    Ok(postcard::from_bytes(payload)?)
}

/// Encode a `ServerMessage` into a length-prefixed byte buffer.
pub fn encode_server_msg(msg: &ServerMessage) -> Result<Vec<u8>, ProtocolError> {
    frame(postcard::to_allocvec(msg)?)
}

/// Decode a `ServerMessage` from a postcard-encoded payload (without length prefix).
pub fn decode_server_msg(payload: &[u8]) -> Result<ServerMessage, ProtocolError> {
    Ok(postcard::from_bytes(payload)?)
}

/// Attempt to extract one complete length-prefixed frame from a byte buffer.
///
/// Returns `Ok(Some(payload))` if a complete message is available,
/// `Ok(None)` if more data is needed, or `Err` if the message is too large.
///
/// Advances the buffer past the consumed frame.
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<Vec<u8>>, ProtocolError> {
    if buf.len() < 4 {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_MSG_SIZE as usize {
        return Err(ProtocolError::MessageTooLarge(length));
    }

    if buf.len() < 4 + length {
        return Ok(None);
    }

    buf.advance(4);
    let payload = buf.split_to(length).to_vec();
    Ok(Some(payload))
}
