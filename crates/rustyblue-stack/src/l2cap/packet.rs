//! L2CAP basic frames

use super::constants::*;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// L2CAP Packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2capHeader {
    /// Length of the L2CAP payload in bytes
    pub length: u16,
    /// Channel Identifier
    pub channel_id: u16,
}

impl L2capHeader {
    pub fn new(length: u16, channel_id: u16) -> Self {
        Self { length, channel_id }
    }

    /// Parse an L2CAP header from raw bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut cursor = Cursor::new(data);
        let length = cursor.read_u16::<LittleEndian>().ok()?;
        let channel_id = cursor.read_u16::<LittleEndian>().ok()?;
        Some(Self { length, channel_id })
    }

    pub fn to_bytes(&self) -> [u8; L2CAP_HEADER_SIZE] {
        let length = self.length.to_le_bytes();
        let channel_id = self.channel_id.to_le_bytes();
        [length[0], length[1], channel_id[0], channel_id[1]]
    }
}

/// Build a basic frame for `channel_id`
pub fn l2cap_packet(channel_id: u16, payload: &[u8]) -> Vec<u8> {
    let header = L2capHeader::new(payload.len() as u16, channel_id);
    let mut packet = Vec::with_capacity(L2CAP_HEADER_SIZE + payload.len());
    packet.extend_from_slice(&header.to_bytes());
    packet.extend_from_slice(payload);
    packet
}

/// Split a received PDU into header and payload.
///
/// A payload shorter than announced is returned as far as it goes; trailing
/// bytes beyond the announced length are cut off.
pub fn split_pdu(pdu: &[u8]) -> Option<(L2capHeader, &[u8])> {
    let header = L2capHeader::parse(pdu)?;
    let end = (L2CAP_HEADER_SIZE + header.length as usize).min(pdu.len());
    Some((header, &pdu[L2CAP_HEADER_SIZE..end]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = L2capHeader::new(10, 0x0040);
        assert_eq!(header.to_bytes(), [0x0a, 0x00, 0x40, 0x00]);
        assert_eq!(L2capHeader::parse(&[0x0a, 0x00, 0x40, 0x00, 0xff]), Some(header));
        assert_eq!(L2capHeader::parse(&[0x0a, 0x00, 0x40]), None);
    }

    #[test]
    fn test_split_pdu_trims_to_announced_length() {
        let mut pdu = l2cap_packet(0x0041, &[1, 2, 3]);
        pdu.push(0xee);
        let (header, payload) = split_pdu(&pdu).unwrap();
        assert_eq!(header.channel_id, 0x0041);
        assert_eq!(payload, &[1, 2, 3]);
    }
}
