//! Multiplexer control messages carried in UIH frames on DLCI 0

use super::constants::*;
use super::types::{RfcommError, RfcommResult, RpnSettings};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Parameters of a PN message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PnParams {
    pub dlci: u8,
    /// Convergence layer nibble, 0xf0 / 0xe0 for credit based flow control
    pub convergence_layer: u8,
    pub priority: u8,
    pub max_frame_size: u16,
    pub credits: u8,
}

/// A decoded multiplexer control message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxMessage {
    ParameterNegotiation {
        command: bool,
        params: PnParams,
    },
    ModemStatus {
        command: bool,
        dlci: u8,
        signals: u8,
    },
    /// `settings` is `None` for a poll of the current settings
    RemotePortNegotiation {
        command: bool,
        dlci: u8,
        settings: Option<RpnSettings>,
    },
    CloseDown {
        command: bool,
    },
    /// Recognized framing but a type this stack does not handle
    Unknown {
        kind: u8,
    },
}

/// DLCI byte of MSC and RPN: EA and C/R set
fn dlci_byte(dlci: u8) -> u8 {
    0x03 | (dlci << 2)
}

impl MuxMessage {
    pub fn pn_command(dlci: u8, max_frame_size: u16) -> Self {
        MuxMessage::ParameterNegotiation {
            command: true,
            params: PnParams {
                dlci,
                convergence_layer: RFCOMM_PN_CL_CREDITS_CMD,
                priority: 0,
                max_frame_size,
                credits: 0,
            },
        }
    }

    pub fn pn_response(dlci: u8, priority: u8, max_frame_size: u16) -> Self {
        MuxMessage::ParameterNegotiation {
            command: false,
            params: PnParams {
                dlci,
                convergence_layer: RFCOMM_PN_CL_CREDITS_RSP,
                priority,
                max_frame_size,
                credits: 0,
            },
        }
    }

    pub fn msc(command: bool, dlci: u8) -> Self {
        MuxMessage::ModemStatus {
            command,
            dlci,
            signals: RFCOMM_MSC_SIGNALS,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let (kind, command, value) = match self {
            MuxMessage::ParameterNegotiation { command, params } => {
                let size = params.max_frame_size.to_le_bytes();
                let value = vec![
                    params.dlci,
                    params.convergence_layer,
                    params.priority,
                    0,
                    size[0],
                    size[1],
                    0,
                    params.credits,
                ];
                (RFCOMM_MUX_TYPE_PN, *command, value)
            }
            MuxMessage::ModemStatus {
                command,
                dlci,
                signals,
            } => (RFCOMM_MUX_TYPE_MSC, *command, vec![dlci_byte(*dlci), *signals]),
            MuxMessage::RemotePortNegotiation {
                command,
                dlci,
                settings,
            } => {
                let mut value = vec![dlci_byte(*dlci)];
                if let Some(s) = settings {
                    value.extend_from_slice(&[
                        s.baud_rate,
                        s.data_format,
                        s.flow_control,
                        s.xon,
                        s.xoff,
                        s.parameter_mask[0],
                        s.parameter_mask[1],
                    ]);
                }
                (RFCOMM_MUX_TYPE_RPN, *command, value)
            }
            MuxMessage::CloseDown { command } => (RFCOMM_MUX_TYPE_CLD, *command, Vec::new()),
            MuxMessage::Unknown { kind } => (*kind & !RFCOMM_MUX_CR_BIT, false, Vec::new()),
        };

        let mut bytes = Vec::with_capacity(2 + value.len());
        bytes.push(if command { kind | RFCOMM_MUX_CR_BIT } else { kind });
        bytes.push(((value.len() as u8) << 1) | 1);
        bytes.extend_from_slice(&value);
        bytes
    }

    pub fn parse(data: &[u8]) -> RfcommResult<Self> {
        let (&kind, rest) = data
            .split_first()
            .ok_or(RfcommError::MalformedFrame("empty multiplexer message"))?;
        let command = kind & RFCOMM_MUX_CR_BIT != 0;

        let (&len_byte, rest) = rest
            .split_first()
            .ok_or(RfcommError::MalformedFrame("missing message length"))?;
        let (length, value) = if len_byte & 1 == 1 {
            ((len_byte >> 1) as usize, rest)
        } else {
            let (&high, rest) = rest
                .split_first()
                .ok_or(RfcommError::MalformedFrame("truncated message length"))?;
            ((len_byte >> 1) as usize | (high as usize) << 7, rest)
        };
        let value = value
            .get(..length)
            .ok_or(RfcommError::MalformedFrame("truncated message"))?;

        let message = match kind & !RFCOMM_MUX_CR_BIT {
            RFCOMM_MUX_TYPE_PN => {
                if value.len() < 8 {
                    return Err(RfcommError::MalformedFrame("short PN"));
                }
                let mut cursor = Cursor::new(&value[4..6]);
                let max_frame_size = cursor
                    .read_u16::<LittleEndian>()
                    .map_err(|_| RfcommError::MalformedFrame("short PN"))?;
                MuxMessage::ParameterNegotiation {
                    command,
                    params: PnParams {
                        dlci: value[0] & 0x3f,
                        convergence_layer: value[1],
                        priority: value[2],
                        max_frame_size,
                        credits: value[7],
                    },
                }
            }
            RFCOMM_MUX_TYPE_MSC => {
                if value.len() < 2 {
                    return Err(RfcommError::MalformedFrame("short MSC"));
                }
                MuxMessage::ModemStatus {
                    command,
                    dlci: value[0] >> 2,
                    signals: value[1],
                }
            }
            RFCOMM_MUX_TYPE_RPN => {
                let first = *value
                    .first()
                    .ok_or(RfcommError::MalformedFrame("short RPN"))?;
                let dlci = first >> 2;
                let settings = if value.len() >= 8 {
                    Some(RpnSettings {
                        baud_rate: value[1],
                        data_format: value[2],
                        flow_control: value[3],
                        xon: value[4],
                        xoff: value[5],
                        parameter_mask: [value[6], value[7]],
                    })
                } else {
                    None
                };
                MuxMessage::RemotePortNegotiation {
                    command,
                    dlci,
                    settings,
                }
            }
            RFCOMM_MUX_TYPE_CLD => MuxMessage::CloseDown { command },
            _ => MuxMessage::Unknown { kind },
        };
        Ok(message)
    }
}
