//! Packet framing and serialization.
//!
//! Defines the wire format for transport packets.
//!
//! Wire format (all multi-byte fields big-endian):
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Type/Ver (1) │ Extension (1) │ Conn ID (2) │ Timestamp (4)  │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Timestamp Diff (4)           │ Window (4)  │ Seq (2) Ack (2)│
//! ├──────────────────────────────────────────────────────────────┤
//! │ Extension chain (variable)   │ Payload (variable)           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Extensions chain as `(next_ext, len, data…)` triples at the start of
//! the payload area. The only extension understood is the selective-ack
//! bitmask (id 1).

use bytes::BufMut;

use crate::error::{Error, Result};
use crate::PROTOCOL_VERSION;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 20;

/// Extension identifiers.
pub mod extension {
    /// No extension follows
    pub const NONE: u8 = 0;
    /// Selective-ack bitmask
    pub const SELECTIVE_ACK: u8 = 1;
}

/// Packet types in the transport protocol.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Data packet with payload
    Data = 0,
    /// Sender is done writing
    Fin = 1,
    /// Acknowledgment (no payload of its own)
    State = 2,
    /// Abort marker; recognized but never emitted
    Reset = 3,
    /// Connection request
    Syn = 4,
}

impl TryFrom<u8> for PacketType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PacketType::Data),
            1 => Ok(PacketType::Fin),
            2 => Ok(PacketType::State),
            3 => Ok(PacketType::Reset),
            4 => Ok(PacketType::Syn),
            _ => Err(Error::InvalidPacket("unknown packet type")),
        }
    }
}

/// A packet header.
///
/// The timestamp pair completes the 20-byte layout shared by the uTP
/// family; this implementation stamps `timestamp_us` on send and carries
/// `timestamp_diff_us` as zero.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    /// Packet type
    pub packet_type: PacketType,
    /// First extension id in the chain (`extension::NONE` when absent)
    pub extension: u8,
    /// Connection identifier
    pub conn_id: u16,
    /// Send time, microseconds, wrapping
    pub timestamp_us: u32,
    /// Reserved delay-measurement field
    pub timestamp_diff_us: u32,
    /// Advertised receive window in bytes
    pub window: u32,
    /// Sequence number
    pub seqnr: u16,
    /// Acknowledgment number
    pub acknr: u16,
}

impl Header {
    /// Create a header with zeroed timestamps and window.
    pub fn new(packet_type: PacketType, conn_id: u16, seqnr: u16, acknr: u16) -> Self {
        Self {
            packet_type,
            extension: extension::NONE,
            conn_id,
            timestamp_us: 0,
            timestamp_diff_us: 0,
            window: 0,
            seqnr,
            acknr,
        }
    }

    /// Serialize the header into `buf`.
    pub fn encode_into(&self, buf: &mut impl BufMut) {
        buf.put_u8(((self.packet_type as u8) << 4) | (PROTOCOL_VERSION & 0x0f));
        buf.put_u8(self.extension);
        buf.put_u16(self.conn_id);
        buf.put_u32(self.timestamp_us);
        buf.put_u32(self.timestamp_diff_us);
        buf.put_u32(self.window);
        buf.put_u16(self.seqnr);
        buf.put_u16(self.acknr);
    }

    /// Deserialize a header from the front of `data`.
    ///
    /// Rejects short buffers, version nibbles other than the protocol
    /// version, and unrecognized type nibbles.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::InvalidPacket("datagram shorter than header"));
        }

        let version = data[0] & 0x0f;
        if version != PROTOCOL_VERSION {
            return Err(Error::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: version,
            });
        }

        let packet_type = PacketType::try_from(data[0] >> 4)?;

        Ok(Self {
            packet_type,
            extension: data[1],
            conn_id: u16::from_be_bytes([data[2], data[3]]),
            timestamp_us: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            timestamp_diff_us: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            window: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
            seqnr: u16::from_be_bytes([data[16], data[17]]),
            acknr: u16::from_be_bytes([data[18], data[19]]),
        })
    }
}

/// Rewrite the acknowledgment number of an already-encoded packet.
///
/// Records in the send queue are encoded once and re-sent with the
/// acknowledgment current at transmission time.
pub fn patch_acknr(packet: &mut [u8], acknr: u16) {
    packet[18..20].copy_from_slice(&acknr.to_be_bytes());
}

/// Rewrite the send timestamp of an already-encoded packet.
pub fn patch_timestamp(packet: &mut [u8], timestamp_us: u32) {
    packet[4..8].copy_from_slice(&timestamp_us.to_be_bytes());
}

/// Walk the extension chain at the start of the payload area.
///
/// Returns the selective-ack bitmask, if present, and the user payload
/// that follows the chain. A chain that runs past the end of the
/// datagram is malformed.
pub fn split_extensions<'a>(first: u8, area: &'a [u8]) -> Result<(Option<&'a [u8]>, &'a [u8])> {
    let mut ext = first;
    let mut rest = area;
    let mut sack = None;

    while ext != extension::NONE {
        if rest.len() < 2 {
            return Err(Error::InvalidPacket("truncated extension header"));
        }
        let next = rest[0];
        let len = rest[1] as usize;
        if rest.len() < 2 + len {
            return Err(Error::InvalidPacket("truncated extension payload"));
        }

        if ext == extension::SELECTIVE_ACK {
            sack = Some(&rest[2..2 + len]);
        }

        rest = &rest[2 + len..];
        ext = next;
    }

    Ok((sack, rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn encode(header: &Header) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        header.encode_into(&mut buf);
        buf.to_vec()
    }

    #[test]
    fn test_header_roundtrip() {
        let mut header = Header::new(PacketType::Data, 0x1234, 100, 99);
        header.window = 256 * 1024;
        header.timestamp_us = 0xdead_beef;

        let bytes = encode(&header);
        assert_eq!(bytes.len(), HEADER_SIZE);

        let decoded = Header::decode(&bytes).unwrap();
        assert_eq!(decoded.packet_type, PacketType::Data);
        assert_eq!(decoded.conn_id, 0x1234);
        assert_eq!(decoded.window, 256 * 1024);
        assert_eq!(decoded.timestamp_us, 0xdead_beef);
        assert_eq!(decoded.seqnr, 100);
        assert_eq!(decoded.acknr, 99);
    }

    #[test]
    fn test_type_version_nibbles() {
        let bytes = encode(&Header::new(PacketType::Syn, 1, 0, 0));
        assert_eq!(bytes[0] >> 4, PacketType::Syn as u8);
        assert_eq!(bytes[0] & 0x0f, PROTOCOL_VERSION);
    }

    #[test]
    fn test_decode_rejects_bad_version() {
        let mut bytes = encode(&Header::new(PacketType::Data, 1, 0, 0));
        bytes[0] = (bytes[0] & 0xf0) | 0x02;
        assert!(matches!(
            Header::decode(&bytes),
            Err(Error::VersionMismatch { actual: 2, .. })
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let mut bytes = encode(&Header::new(PacketType::Data, 1, 0, 0));
        bytes[0] = (0x0f << 4) | PROTOCOL_VERSION;
        assert!(Header::decode(&bytes).is_err());
    }

    #[test]
    fn test_decode_rejects_short() {
        let bytes = encode(&Header::new(PacketType::Data, 1, 0, 0));
        assert!(Header::decode(&bytes[..HEADER_SIZE - 1]).is_err());
    }

    #[test]
    fn test_patch_acknr() {
        let mut bytes = encode(&Header::new(PacketType::Data, 1, 7, 3));
        patch_acknr(&mut bytes, 0xbeef);
        let decoded = Header::decode(&bytes).unwrap();
        assert_eq!(decoded.acknr, 0xbeef);
        assert_eq!(decoded.seqnr, 7);
    }

    #[test]
    fn test_split_no_extension() {
        let payload = b"hello";
        let (sack, rest) = split_extensions(extension::NONE, payload).unwrap();
        assert!(sack.is_none());
        assert_eq!(rest, payload);
    }

    #[test]
    fn test_split_sack_extension() {
        // [next=0, len=4, mask..] then user payload.
        let area = [0u8, 4, 0xaa, 0, 0, 0x01, b'h', b'i'];
        let (sack, rest) = split_extensions(extension::SELECTIVE_ACK, &area).unwrap();
        assert_eq!(sack.unwrap(), &[0xaa, 0, 0, 0x01]);
        assert_eq!(rest, b"hi");
    }

    #[test]
    fn test_split_chained_unknown_extension() {
        // Unknown extension id 7 chains to a SACK, then payload.
        let area = [
            1u8, 2, 0xff, 0xff, // ext 7 body, next = 1
            0, 4, 0x0f, 0, 0, 0, // sack, next = 0
            b'x',
        ];
        let (sack, rest) = split_extensions(7, &area).unwrap();
        assert_eq!(sack.unwrap(), &[0x0f, 0, 0, 0]);
        assert_eq!(rest, b"x");
    }

    #[test]
    fn test_split_truncated_chain() {
        assert!(split_extensions(extension::SELECTIVE_ACK, &[0]).is_err());
        assert!(split_extensions(extension::SELECTIVE_ACK, &[0, 10, 1, 2]).is_err());
    }
}
