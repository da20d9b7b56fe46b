use crate::error::ProtocolError;
use crate::types::CallId;

/// Call media packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MediaPacketType {
    Audio = 0x01,
    Video = 0x02,
    /// Sent while media is paused to keep the connection watchdog fed.
    KeepAlive = 0x03,
}

impl MediaPacketType {
    pub fn from_byte(b: u8) -> Result<Self, ProtocolError> {
        match b {
            0x01 => Ok(Self::Audio),
            0x02 => Ok(Self::Video),
            0x03 => Ok(Self::KeepAlive),
            other => Err(ProtocolError::UnknownPacketType(other)),
        }
    }
}

/// Header size: 1 (type) + 8 (call_id) + 4 (sequence) = 13 bytes.
pub const MEDIA_HEADER_SIZE: usize = 13;

/// A call media packet.
///
/// Wire format:
/// ```text
/// [type: u8] [call_id: u64 BE] [sequence: u32 BE] [payload: variable]
/// ```
#[derive(Debug, Clone)]
pub struct MediaPacket {
    pub packet_type: MediaPacketType,
    pub call_id: CallId,
    pub sequence: u32,
    pub payload: Vec<u8>,
}

impl MediaPacket {
    pub fn audio(call_id: CallId, sequence: u32, payload: Vec<u8>) -> Self {
        Self { packet_type: MediaPacketType::Audio, call_id, sequence, payload }
    }

    pub fn video(call_id: CallId, sequence: u32, payload: Vec<u8>) -> Self {
        Self { packet_type: MediaPacketType::Video, call_id, sequence, payload }
    }

    pub fn keep_alive(call_id: CallId, sequence: u32) -> Self {
        Self {
            packet_type: MediaPacketType::KeepAlive,
            call_id,
            sequence,
            payload: Vec::new(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MEDIA_HEADER_SIZE + self.payload.len());
        buf.push(self.packet_type as u8);
        buf.extend_from_slice(&self.call_id.to_be_bytes());
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < MEDIA_HEADER_SIZE {
            return Err(ProtocolError::PacketTooShort {
                expected: MEDIA_HEADER_SIZE,
                got: data.len(),
            });
        }

        let packet_type = MediaPacketType::from_byte(data[0])?;
        let call_id = u64::from_be_bytes([
            data[1], data[2], data[3], data[4], data[5], data[6], data[7], data[8],
        ]);
        let sequence = u32::from_be_bytes([data[9], data[10], data[11], data[12]]);
        Ok(Self {
            packet_type,
            call_id,
            sequence,
            payload: data[MEDIA_HEADER_SIZE..].to_vec(),
        })
    }
}
