//! RFCOMM frames
//!
//! Layout: address, control, one or two length bytes, an optional credit
//! byte (UIH with P/F only), payload and the frame check sequence.

use super::constants::*;
use super::types::{RfcommError, RfcommResult};

/// Reversed generator polynomial of the frame check sequence
const CRC8_POLYNOMIAL: u8 = 0xe0;

const fn crc8_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CRC8_POLYNOMIAL
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC8_TABLE: [u8; 256] = crc8_table();

/// Frame check sequence over `data`
pub fn fcs(data: &[u8]) -> u8 {
    let crc = data
        .iter()
        .fold(0xffu8, |crc, byte| CRC8_TABLE[(crc ^ byte) as usize]);
    0xff - crc
}

/// UIH frames are checked over address and control only
pub fn is_uih(control: u8) -> bool {
    control & !RFCOMM_PF_BIT == RFCOMM_UIH
}

/// Address byte: EA bit, C/R bit and DLCI
pub fn address(dlci: u8, cr: bool) -> u8 {
    1 | (u8::from(cr) << 1) | (dlci << 2)
}

/// Encode a frame. `credits` is only written for UIH with P/F.
pub fn encode(address: u8, control: u8, credits: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len();
    let mut frame = Vec::with_capacity(len + 6);
    frame.push(address);
    frame.push(control);
    if len < 128 {
        frame.push(((len as u8) << 1) | 1);
    } else {
        frame.push(((len & 0x7f) as u8) << 1);
        frame.push((len >> 7) as u8);
    }
    let checked = if is_uih(control) { 2 } else { frame.len() };
    if control == RFCOMM_UIH_PF {
        frame.push(credits);
    }
    frame.extend_from_slice(payload);
    let check = fcs(&frame[..checked]);
    frame.push(check);
    frame
}

/// A received frame borrowing its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub address: u8,
    pub control: u8,
    /// Credit byte of a UIH frame with P/F
    pub credits: Option<u8>,
    pub payload: &'a [u8],
}

impl<'a> Frame<'a> {
    pub fn parse(data: &'a [u8]) -> RfcommResult<Self> {
        if data.len() < 4 {
            return Err(RfcommError::MalformedFrame("frame too short"));
        }
        let address = data[0];
        let control = data[1];

        let (length, mut pos) = if data[2] & 1 == 1 {
            ((data[2] >> 1) as usize, 3)
        } else {
            let high = *data
                .get(3)
                .ok_or(RfcommError::MalformedFrame("truncated length"))?;
            ((data[2] >> 1) as usize | (high as usize) << 7, 4)
        };
        let header_len = pos;

        let credits = if control == RFCOMM_UIH_PF {
            let credits = *data
                .get(pos)
                .ok_or(RfcommError::MalformedFrame("missing credits"))?;
            pos += 1;
            Some(credits)
        } else {
            None
        };

        if data.len() < pos + length + 1 {
            return Err(RfcommError::MalformedFrame("truncated payload"));
        }
        let payload = &data[pos..pos + length];

        let checked = if is_uih(control) { 2 } else { header_len };
        if fcs(&data[..checked]) != data[pos + length] {
            return Err(RfcommError::MalformedFrame("bad FCS"));
        }

        Ok(Self {
            address,
            control,
            credits,
            payload,
        })
    }

    pub fn dlci(&self) -> u8 {
        self.address >> 2
    }

    pub fn is_uih(&self) -> bool {
        is_uih(self.control)
    }
}
