use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("packet too short: expected at least {expected} bytes, got {got}")]
    PacketTooShort { expected: usize, got: usize },

    #[error("unknown media packet type: 0x{0:02x}")]
    UnknownPacketType(u8),

    #[error("message too large: {0} bytes (max 1048576)")]
    MessageTooLarge(usize),

    #[error("malformed media key: {0:?}")]
    InvalidMediaKey(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
