//! WireGuard message wire formats
//!
//! - Type 1: Handshake Initiation (148 bytes)
//! - Type 2: Handshake Response (92 bytes)
//! - Type 4: Transport Data (16-byte header + sealed payload)
//!
//! All integers are little-endian. Cookie replies (type 3) are not handled.

use crate::crypto::aead::TAG_LEN;
use crate::error::ProtocolError;

/// WireGuard message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    HandshakeInitiation = 1,
    HandshakeResponse = 2,
    CookieReply = 3,
    TransportData = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::HandshakeInitiation),
            2 => Ok(Self::HandshakeResponse),
            3 => Ok(Self::CookieReply),
            4 => Ok(Self::TransportData),
            _ => Err(ProtocolError::InvalidMessageType { msg_type: value }),
        }
    }
}

/// Get the message type of a datagram
pub fn message_type(data: &[u8]) -> Result<MessageType, ProtocolError> {
    let first = data.first().ok_or(ProtocolError::InvalidMessageLength {
        expected: 1,
        got: 0,
    })?;
    MessageType::try_from(*first)
}

fn check_frame(data: &[u8], size: usize, kind: MessageType) -> Result<(), ProtocolError> {
    if data.len() < size {
        return Err(ProtocolError::InvalidMessageLength {
            expected: size,
            got: data.len(),
        });
    }
    if data[0] != kind as u8 {
        return Err(ProtocolError::InvalidMessageType { msg_type: data[0] });
    }
    Ok(())
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(buf)
}

fn read_array<const N: usize>(data: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[at..at + N]);
    out
}

/// Handshake Initiation message (148 bytes)
///
/// ```text
/// type(1) | reserved(3) | sender_index(4) | ephemeral_public(32) |
/// encrypted_static(48) | encrypted_timestamp(28) | mac1(16) | mac2(16)
/// ```
#[derive(Debug, Clone)]
pub struct HandshakeInitiation {
    pub sender_index: u32,
    pub ephemeral_public: [u8; 32],
    pub encrypted_static: [u8; 32 + TAG_LEN],
    pub encrypted_timestamp: [u8; 12 + TAG_LEN],
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl HandshakeInitiation {
    pub const SIZE: usize = 148;

    /// Bytes covered by MAC1
    pub const MAC1_OFFSET: usize = 116;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = MessageType::HandshakeInitiation as u8;
        buf[4..8].copy_from_slice(&self.sender_index.to_le_bytes());
        buf[8..40].copy_from_slice(&self.ephemeral_public);
        buf[40..88].copy_from_slice(&self.encrypted_static);
        buf[88..116].copy_from_slice(&self.encrypted_timestamp);
        buf[116..132].copy_from_slice(&self.mac1);
        buf[132..148].copy_from_slice(&self.mac2);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        check_frame(data, Self::SIZE, MessageType::HandshakeInitiation)?;
        Ok(Self {
            sender_index: read_u32(data, 4),
            ephemeral_public: read_array(data, 8),
            encrypted_static: read_array(data, 40),
            encrypted_timestamp: read_array(data, 88),
            mac1: read_array(data, 116),
            mac2: read_array(data, 132),
        })
    }
}

/// Handshake Response message (92 bytes)
///
/// ```text
/// type(1) | reserved(3) | sender_index(4) | receiver_index(4) |
/// ephemeral_public(32) | encrypted_nothing(16) | mac1(16) | mac2(16)
/// ```
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub sender_index: u32,
    pub receiver_index: u32,
    pub ephemeral_public: [u8; 32],
    pub encrypted_nothing: [u8; TAG_LEN],
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl HandshakeResponse {
    pub const SIZE: usize = 92;

    /// Bytes covered by MAC1
    pub const MAC1_OFFSET: usize = 60;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = MessageType::HandshakeResponse as u8;
        buf[4..8].copy_from_slice(&self.sender_index.to_le_bytes());
        buf[8..12].copy_from_slice(&self.receiver_index.to_le_bytes());
        buf[12..44].copy_from_slice(&self.ephemeral_public);
        buf[44..60].copy_from_slice(&self.encrypted_nothing);
        buf[60..76].copy_from_slice(&self.mac1);
        buf[76..92].copy_from_slice(&self.mac2);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        check_frame(data, Self::SIZE, MessageType::HandshakeResponse)?;
        Ok(Self {
            sender_index: read_u32(data, 4),
            receiver_index: read_u32(data, 8),
            ephemeral_public: read_array(data, 12),
            encrypted_nothing: read_array(data, 44),
            mac1: read_array(data, 60),
            mac2: read_array(data, 76),
        })
    }
}

/// Transport Data header
///
/// ```text
/// type(1) | reserved(3) | receiver_index(4) | counter(8) | sealed_packet(n+16)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportHeader {
    pub receiver_index: u32,
    pub counter: u64,
}

impl TransportHeader {
    pub const SIZE: usize = 16;

    /// Header plus an empty (keepalive) sealed payload
    pub const MIN_SIZE: usize = Self::SIZE + TAG_LEN;

    /// Frame a sealed payload
    pub fn frame(&self, sealed: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE + sealed.len());
        buf.push(MessageType::TransportData as u8);
        buf.extend_from_slice(&[0, 0, 0]);
        buf.extend_from_slice(&self.receiver_index.to_le_bytes());
        buf.extend_from_slice(&self.counter.to_le_bytes());
        buf.extend_from_slice(sealed);
        buf
    }

    /// Split a transport message into its header and sealed payload
    pub fn parse(data: &[u8]) -> Result<(Self, &[u8]), ProtocolError> {
        check_frame(data, Self::MIN_SIZE, MessageType::TransportData)?;
        let header = Self {
            receiver_index: read_u32(data, 4),
            counter: read_u64(data, 8),
        };
        Ok((header, &data[Self::SIZE..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initiation_layout() {
        let init = HandshakeInitiation {
            sender_index: 0x12345678,
            ephemeral_public: [1u8; 32],
            encrypted_static: [2u8; 48],
            encrypted_timestamp: [3u8; 28],
            mac1: [4u8; 16],
            mac2: [5u8; 16],
        };

        let bytes = init.to_bytes();
        assert_eq!(&bytes[..4], &[1, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(bytes[HandshakeInitiation::MAC1_OFFSET], 4);

        let parsed = HandshakeInitiation::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.sender_index, init.sender_index);
        assert_eq!(parsed.encrypted_timestamp, init.encrypted_timestamp);
        assert_eq!(parsed.mac2, init.mac2);
    }

    #[test]
    fn test_response_parse() {
        let mut data = [0u8; HandshakeResponse::SIZE];
        data[0] = 2;
        data[4..8].copy_from_slice(&0x11223344u32.to_le_bytes());
        data[8..12].copy_from_slice(&0x55667788u32.to_le_bytes());

        let parsed = HandshakeResponse::from_bytes(&data).unwrap();
        assert_eq!(parsed.sender_index, 0x11223344);
        assert_eq!(parsed.receiver_index, 0x55667788);
        assert_eq!(parsed.to_bytes(), data);
    }

    #[test]
    fn test_truncated_frames() {
        let short = [2u8; HandshakeResponse::SIZE - 1];
        assert!(matches!(
            HandshakeResponse::from_bytes(&short),
            Err(ProtocolError::InvalidMessageLength { expected: 92, got: 91 })
        ));

        let keepalive_minus_one = [4u8; TransportHeader::MIN_SIZE - 1];
        assert!(TransportHeader::parse(&keepalive_minus_one).is_err());
    }

    #[test]
    fn test_transport_frame() {
        let header = TransportHeader {
            receiver_index: 42,
            counter: 1234,
        };
        let sealed = vec![0xAA; 40];
        let msg = header.frame(&sealed);
        assert_eq!(msg[0], 4);
        assert_eq!(msg.len(), TransportHeader::SIZE + sealed.len());

        let (parsed, payload) = TransportHeader::parse(&msg).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(payload, &sealed[..]);
    }

    #[test]
    fn test_message_type() {
        assert_eq!(message_type(&[4, 0]).unwrap(), MessageType::TransportData);
        assert!(message_type(&[]).is_err());
        assert!(message_type(&[99]).is_err());
    }
}
