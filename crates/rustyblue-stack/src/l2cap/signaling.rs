//! L2CAP Signaling channel codec
//!
//! Signaling PDUs travel on CID 0x0001. One PDU may carry several commands,
//! each with its own code/identifier/length header; [`split_commands`] walks
//! them and [`SignalingCommand::parse`] decodes a single one.

use super::constants::*;
use super::packet::l2cap_packet;
use super::types::*;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

/// Handle for identifying signaling transactions
pub type SignalId = u8;

/// Header of one signaling command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalingHeader {
    pub code: u8,
    pub identifier: SignalId,
    pub length: u16,
}

/// Iterator over the commands of a signaling PDU
pub struct SignalingCommands<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for SignalingCommands<'a> {
    type Item = (SignalingHeader, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < L2CAP_SIGNALING_HEADER_SIZE {
            return None;
        }
        let header = SignalingHeader {
            code: self.data[0],
            identifier: self.data[1],
            length: u16::from_le_bytes([self.data[2], self.data[3]]),
        };
        let rest = &self.data[L2CAP_SIGNALING_HEADER_SIZE..];
        let len = (header.length as usize).min(rest.len());
        self.data = &rest[len..];
        Some((header, &rest[..len]))
    }
}

/// Walk the commands of the payload of a signaling PDU
pub fn split_commands(payload: &[u8]) -> SignalingCommands<'_> {
    SignalingCommands { data: payload }
}

/// L2CAP Signaling command (BR/EDR subset)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingCommand {
    CommandReject {
        identifier: SignalId,
        reason: u16,
        data: Vec<u8>,
    },
    ConnectionRequest {
        identifier: SignalId,
        psm: u16,
        source_cid: u16,
    },
    ConnectionResponse {
        identifier: SignalId,
        destination_cid: u16,
        source_cid: u16,
        result: u16,
        status: u16,
    },
    ConfigureRequest {
        identifier: SignalId,
        destination_cid: u16,
        flags: u16,
        options: ConfigOptions,
    },
    ConfigureResponse {
        identifier: SignalId,
        source_cid: u16,
        flags: u16,
        result: u16,
        options: ConfigOptions,
    },
    DisconnectionRequest {
        identifier: SignalId,
        destination_cid: u16,
        source_cid: u16,
    },
    DisconnectionResponse {
        identifier: SignalId,
        destination_cid: u16,
        source_cid: u16,
    },
    EchoRequest {
        identifier: SignalId,
        data: Vec<u8>,
    },
    EchoResponse {
        identifier: SignalId,
        data: Vec<u8>,
    },
    InformationRequest {
        identifier: SignalId,
        info_type: u16,
    },
    InformationResponse {
        identifier: SignalId,
        info_type: u16,
        result: u16,
        data: Vec<u8>,
    },
}

impl SignalingCommand {
    /// Get the command code for this signaling command
    pub fn command_code(&self) -> u8 {
        match self {
            Self::CommandReject { .. } => L2CAP_COMMAND_REJECT,
            Self::ConnectionRequest { .. } => L2CAP_CONNECTION_REQUEST,
            Self::ConnectionResponse { .. } => L2CAP_CONNECTION_RESPONSE,
            Self::ConfigureRequest { .. } => L2CAP_CONFIGURE_REQUEST,
            Self::ConfigureResponse { .. } => L2CAP_CONFIGURE_RESPONSE,
            Self::DisconnectionRequest { .. } => L2CAP_DISCONNECTION_REQUEST,
            Self::DisconnectionResponse { .. } => L2CAP_DISCONNECTION_RESPONSE,
            Self::EchoRequest { .. } => L2CAP_ECHO_REQUEST,
            Self::EchoResponse { .. } => L2CAP_ECHO_RESPONSE,
            Self::InformationRequest { .. } => L2CAP_INFORMATION_REQUEST,
            Self::InformationResponse { .. } => L2CAP_INFORMATION_RESPONSE,
        }
    }

    /// Get the identifier for this signaling command
    pub fn identifier(&self) -> SignalId {
        match self {
            Self::CommandReject { identifier, .. }
            | Self::ConnectionRequest { identifier, .. }
            | Self::ConnectionResponse { identifier, .. }
            | Self::ConfigureRequest { identifier, .. }
            | Self::ConfigureResponse { identifier, .. }
            | Self::DisconnectionRequest { identifier, .. }
            | Self::DisconnectionResponse { identifier, .. }
            | Self::EchoRequest { identifier, .. }
            | Self::EchoResponse { identifier, .. }
            | Self::InformationRequest { identifier, .. }
            | Self::InformationResponse { identifier, .. } => *identifier,
        }
    }

    /// Parse configuration options from raw bytes
    fn parse_config_options(data: &[u8]) -> ConfigOptions {
        let mut options = ConfigOptions::default();
        let mut offset = 0;

        while offset + 2 <= data.len() {
            let option_type = data[offset] & !L2CAP_CONF_HINT;
            let option_length = data[offset + 1] as usize;

            if offset + 2 + option_length > data.len() {
                break;
            }
            let option_data = &data[offset + 2..offset + 2 + option_length];

            match option_type {
                L2CAP_CONF_MTU if option_length == 2 => {
                    let mut cursor = Cursor::new(option_data);
                    options.mtu = cursor.read_u16::<LittleEndian>().ok();
                }
                L2CAP_CONF_FLUSH_TIMEOUT if option_length == 2 => {
                    let mut cursor = Cursor::new(option_data);
                    options.flush_timeout = cursor.read_u16::<LittleEndian>().ok();
                }
                _ => {}
            }

            offset += 2 + option_length;
        }

        options
    }

    /// Serialize configuration options to bytes
    fn serialize_config_options(options: &ConfigOptions, out: &mut Vec<u8>) {
        if let Some(mtu) = options.mtu {
            out.push(L2CAP_CONF_MTU);
            out.push(2);
            out.extend_from_slice(&mtu.to_le_bytes());
        }
        if let Some(timeout) = options.flush_timeout {
            out.push(L2CAP_CONF_FLUSH_TIMEOUT);
            out.push(2);
            out.extend_from_slice(&timeout.to_le_bytes());
        }
    }

    /// Decode the parameters of one command
    pub fn parse(header: &SignalingHeader, params: &[u8]) -> L2capResult<Self> {
        let mut cursor = Cursor::new(params);
        let identifier = header.identifier;
        let truncated = |_| {
            L2capError::InvalidParameter(format!(
                "signaling command 0x{:02x} truncated",
                header.code
            ))
        };

        let command = match header.code {
            L2CAP_COMMAND_REJECT => Self::CommandReject {
                identifier,
                reason: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
                data: rest(&mut cursor),
            },
            L2CAP_CONNECTION_REQUEST => Self::ConnectionRequest {
                identifier,
                psm: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
                source_cid: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
            },
            L2CAP_CONNECTION_RESPONSE => Self::ConnectionResponse {
                identifier,
                destination_cid: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
                source_cid: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
                result: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
                status: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
            },
            L2CAP_CONFIGURE_REQUEST => Self::ConfigureRequest {
                identifier,
                destination_cid: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
                flags: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
                options: Self::parse_config_options(&rest(&mut cursor)),
            },
            L2CAP_CONFIGURE_RESPONSE => Self::ConfigureResponse {
                identifier,
                source_cid: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
                flags: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
                result: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
                options: Self::parse_config_options(&rest(&mut cursor)),
            },
            L2CAP_DISCONNECTION_REQUEST => Self::DisconnectionRequest {
                identifier,
                destination_cid: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
                source_cid: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
            },
            L2CAP_DISCONNECTION_RESPONSE => Self::DisconnectionResponse {
                identifier,
                destination_cid: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
                source_cid: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
            },
            L2CAP_ECHO_REQUEST => Self::EchoRequest {
                identifier,
                data: params.to_vec(),
            },
            L2CAP_ECHO_RESPONSE => Self::EchoResponse {
                identifier,
                data: params.to_vec(),
            },
            L2CAP_INFORMATION_REQUEST => Self::InformationRequest {
                identifier,
                info_type: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
            },
            L2CAP_INFORMATION_RESPONSE => Self::InformationResponse {
                identifier,
                info_type: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
                result: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
                data: rest(&mut cursor),
            },
            code => {
                return Err(L2capError::InvalidParameter(format!(
                    "unknown signaling code 0x{:02x}",
                    code
                )))
            }
        };
        Ok(command)
    }

    /// Serialize the command including its header
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut params: Vec<u8> = Vec::new();
        // writes into a Vec cannot fail
        let _ = self.write_params(&mut params);

        let mut result = Vec::with_capacity(L2CAP_SIGNALING_HEADER_SIZE + params.len());
        result.push(self.command_code());
        result.push(self.identifier());
        result.extend_from_slice(&(params.len() as u16).to_le_bytes());
        result.extend_from_slice(&params);
        result
    }

    fn write_params(&self, out: &mut Vec<u8>) -> std::io::Result<()> {
        match self {
            Self::CommandReject { reason, data, .. } => {
                out.write_u16::<LittleEndian>(*reason)?;
                out.extend_from_slice(data);
            }
            Self::ConnectionRequest {
                psm, source_cid, ..
            } => {
                out.write_u16::<LittleEndian>(*psm)?;
                out.write_u16::<LittleEndian>(*source_cid)?;
            }
            Self::ConnectionResponse {
                destination_cid,
                source_cid,
                result,
                status,
                ..
            } => {
                out.write_u16::<LittleEndian>(*destination_cid)?;
                out.write_u16::<LittleEndian>(*source_cid)?;
                out.write_u16::<LittleEndian>(*result)?;
                out.write_u16::<LittleEndian>(*status)?;
            }
            Self::ConfigureRequest {
                destination_cid,
                flags,
                options,
                ..
            } => {
                out.write_u16::<LittleEndian>(*destination_cid)?;
                out.write_u16::<LittleEndian>(*flags)?;
                Self::serialize_config_options(options, out);
            }
            Self::ConfigureResponse {
                source_cid,
                flags,
                result,
                options,
                ..
            } => {
                out.write_u16::<LittleEndian>(*source_cid)?;
                out.write_u16::<LittleEndian>(*flags)?;
                out.write_u16::<LittleEndian>(*result)?;
                Self::serialize_config_options(options, out);
            }
            Self::DisconnectionRequest {
                destination_cid,
                source_cid,
                ..
            }
            | Self::DisconnectionResponse {
                destination_cid,
                source_cid,
                ..
            } => {
                out.write_u16::<LittleEndian>(*destination_cid)?;
                out.write_u16::<LittleEndian>(*source_cid)?;
            }
            Self::EchoRequest { data, .. } | Self::EchoResponse { data, .. } => {
                out.extend_from_slice(data);
            }
            Self::InformationRequest { info_type, .. } => {
                out.write_u16::<LittleEndian>(*info_type)?;
            }
            Self::InformationResponse {
                info_type,
                result,
                data,
                ..
            } => {
                out.write_u16::<LittleEndian>(*info_type)?;
                out.write_u16::<LittleEndian>(*result)?;
                out.extend_from_slice(data);
            }
        }
        Ok(())
    }

    /// The command as a complete PDU on the signaling channel
    pub fn to_pdu(&self) -> Vec<u8> {
        l2cap_packet(L2CAP_CID_SIGNALING, &self.to_bytes())
    }
}

fn rest(cursor: &mut Cursor<&[u8]>) -> Vec<u8> {
    let mut data = Vec::new();
    let _ = cursor.read_to_end(&mut data);
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8]) -> SignalingCommand {
        let (header, params) = split_commands(bytes).next().unwrap();
        SignalingCommand::parse(&header, params).unwrap()
    }

    #[test]
    fn test_connection_request_encoding() {
        let command = SignalingCommand::ConnectionRequest {
            identifier: 7,
            psm: 0x0003,
            source_cid: 0x0040,
        };
        assert_eq!(
            command.to_bytes(),
            vec![0x02, 0x07, 0x04, 0x00, 0x03, 0x00, 0x40, 0x00]
        );
        assert_eq!(decode(&command.to_bytes()), command);
    }

    #[test]
    fn test_configure_request_mtu_option() {
        // MTU option flagged as hint plus an unknown option
        let bytes = [
            0x04, 0x01, 0x0c, 0x00, 0x40, 0x00, 0x00, 0x00, 0x81, 0x02, 0xa0, 0x02, 0x7f, 0x02,
            0x00, 0x00,
        ];
        match decode(&bytes) {
            SignalingCommand::ConfigureRequest {
                destination_cid,
                options,
                ..
            } => {
                assert_eq!(destination_cid, 0x0040);
                assert_eq!(options.mtu, Some(672));
                assert_eq!(options.flush_timeout, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_several_commands_in_one_pdu() {
        let mut payload = SignalingCommand::EchoRequest {
            identifier: 1,
            data: vec![0xaa, 0xbb],
        }
        .to_bytes();
        payload.extend(
            SignalingCommand::InformationRequest {
                identifier: 2,
                info_type: L2CAP_INFO_EXTENDED_FEATURES,
            }
            .to_bytes(),
        );

        let commands: Vec<_> = split_commands(&payload)
            .map(|(header, params)| SignalingCommand::parse(&header, params).unwrap())
            .collect();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].identifier(), 1);
        assert_eq!(commands[1].command_code(), L2CAP_INFORMATION_REQUEST);
    }

    #[test]
    fn test_truncated_command_is_rejected() {
        let header = SignalingHeader {
            code: L2CAP_CONNECTION_RESPONSE,
            identifier: 1,
            length: 4,
        };
        assert!(SignalingCommand::parse(&header, &[0x40, 0x00, 0x41, 0x00]).is_err());
    }
}
