//! Typed decoding of controller events
//!
//! [`HciEvent`] carries the raw event code and parameters; the engine works on
//! [`ControllerEvent`], which decodes the events the host stack reacts to.
//! Everything else is kept as [`ControllerEvent::Unknown`] and still forwarded
//! to the application.

use crate::gap::{BdAddr, ClassOfDevice, LinkKey, LinkKeyType};
use crate::hci::constants::*;
use crate::hci::packet::HciEvent;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

/// A decoded HCI event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    InquiryComplete {
        status: u8,
    },
    InquiryResult {
        addresses: Vec<BdAddr>,
    },
    ConnectionComplete {
        status: u8,
        handle: u16,
        bd_addr: BdAddr,
        link_type: u8,
        encryption_enabled: bool,
    },
    ConnectionRequest {
        bd_addr: BdAddr,
        class_of_device: ClassOfDevice,
        link_type: u8,
    },
    DisconnectionComplete {
        status: u8,
        handle: u16,
        reason: u8,
    },
    AuthenticationComplete {
        status: u8,
        handle: u16,
    },
    RemoteNameRequestComplete {
        status: u8,
        bd_addr: BdAddr,
        name: String,
    },
    EncryptionChange {
        status: u8,
        handle: u16,
        enabled: bool,
    },
    CommandComplete {
        num_hci_command_packets: u8,
        opcode: u16,
        return_parameters: Vec<u8>,
    },
    CommandStatus {
        status: u8,
        num_hci_command_packets: u8,
        opcode: u16,
    },
    HardwareError {
        code: u8,
    },
    RoleChange {
        status: u8,
        bd_addr: BdAddr,
        role: u8,
    },
    NumberOfCompletedPackets {
        /// (connection handle, completed packets)
        completed: Vec<(u16, u16)>,
    },
    PinCodeRequest {
        bd_addr: BdAddr,
    },
    LinkKeyRequest {
        bd_addr: BdAddr,
    },
    LinkKeyNotification {
        bd_addr: BdAddr,
        link_key: LinkKey,
        key_type: LinkKeyType,
    },
    Unknown {
        event_code: u8,
        parameters: Vec<u8>,
    },
}

fn read_addr(cursor: &mut Cursor<&[u8]>) -> Option<BdAddr> {
    let mut bytes = [0u8; 6];
    cursor.read_exact(&mut bytes).ok()?;
    Some(BdAddr::new(bytes))
}

/// Remote names are NUL terminated; some devices terminate them with 0xff
fn parse_remote_name(raw: &[u8]) -> String {
    let end = raw
        .iter()
        .position(|b| *b == 0 || *b == 0xff)
        .unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

impl ControllerEvent {
    /// Decode a raw event. Returns `None` when a known event is truncated.
    pub fn decode(event: &HciEvent) -> Option<Self> {
        let params: &[u8] = &event.parameters;
        let mut cursor = Cursor::new(params);

        let decoded = match event.event_code {
            EVT_INQUIRY_COMPLETE => ControllerEvent::InquiryComplete {
                status: cursor.read_u8().ok()?,
            },
            EVT_INQUIRY_RESULT => {
                let count = cursor.read_u8().ok()? as usize;
                let mut addresses = Vec::with_capacity(count);
                for i in 0..count {
                    let start = 1 + i * 6;
                    addresses.push(BdAddr::from_slice(params.get(start..start + 6)?)?);
                }
                ControllerEvent::InquiryResult { addresses }
            }
            EVT_CONN_COMPLETE => ControllerEvent::ConnectionComplete {
                status: cursor.read_u8().ok()?,
                handle: cursor.read_u16::<LittleEndian>().ok()? & HCI_HANDLE_MASK,
                bd_addr: read_addr(&mut cursor)?,
                link_type: cursor.read_u8().ok()?,
                encryption_enabled: cursor.read_u8().ok()? != 0,
            },
            EVT_CONN_REQUEST => ControllerEvent::ConnectionRequest {
                bd_addr: read_addr(&mut cursor)?,
                class_of_device: ClassOfDevice::from_slice(params.get(6..9)?)?,
                link_type: *params.get(9)?,
            },
            EVT_DISCONN_COMPLETE => ControllerEvent::DisconnectionComplete {
                status: cursor.read_u8().ok()?,
                handle: cursor.read_u16::<LittleEndian>().ok()? & HCI_HANDLE_MASK,
                reason: cursor.read_u8().ok()?,
            },
            EVT_AUTH_COMPLETE => ControllerEvent::AuthenticationComplete {
                status: cursor.read_u8().ok()?,
                handle: cursor.read_u16::<LittleEndian>().ok()? & HCI_HANDLE_MASK,
            },
            EVT_REMOTE_NAME_REQ_COMPLETE => ControllerEvent::RemoteNameRequestComplete {
                status: cursor.read_u8().ok()?,
                bd_addr: read_addr(&mut cursor)?,
                name: parse_remote_name(params.get(7..).unwrap_or(&[])),
            },
            EVT_ENCRYPTION_CHANGE => ControllerEvent::EncryptionChange {
                status: cursor.read_u8().ok()?,
                handle: cursor.read_u16::<LittleEndian>().ok()? & HCI_HANDLE_MASK,
                enabled: cursor.read_u8().ok()? != 0,
            },
            EVT_CMD_COMPLETE => ControllerEvent::CommandComplete {
                num_hci_command_packets: cursor.read_u8().ok()?,
                opcode: cursor.read_u16::<LittleEndian>().ok()?,
                return_parameters: params.get(3..).unwrap_or(&[]).to_vec(),
            },
            EVT_CMD_STATUS => ControllerEvent::CommandStatus {
                status: cursor.read_u8().ok()?,
                num_hci_command_packets: cursor.read_u8().ok()?,
                opcode: cursor.read_u16::<LittleEndian>().ok()?,
            },
            EVT_HARDWARE_ERROR => ControllerEvent::HardwareError {
                code: cursor.read_u8().ok()?,
            },
            EVT_ROLE_CHANGE => ControllerEvent::RoleChange {
                status: cursor.read_u8().ok()?,
                bd_addr: read_addr(&mut cursor)?,
                role: cursor.read_u8().ok()?,
            },
            EVT_NUM_COMP_PKTS => {
                // all handles first, then all counts
                let count = cursor.read_u8().ok()? as usize;
                let mut completed = Vec::with_capacity(count);
                for i in 0..count {
                    let handle_at = 1 + 2 * i;
                    let count_at = 1 + 2 * count + 2 * i;
                    let handle = params.get(handle_at..handle_at + 2)?;
                    let packets = params.get(count_at..count_at + 2)?;
                    completed.push((
                        u16::from_le_bytes([handle[0], handle[1]]) & HCI_HANDLE_MASK,
                        u16::from_le_bytes([packets[0], packets[1]]),
                    ));
                }
                ControllerEvent::NumberOfCompletedPackets { completed }
            }
            EVT_PIN_CODE_REQ => ControllerEvent::PinCodeRequest {
                bd_addr: read_addr(&mut cursor)?,
            },
            EVT_LINK_KEY_REQ => ControllerEvent::LinkKeyRequest {
                bd_addr: read_addr(&mut cursor)?,
            },
            EVT_LINK_KEY_NOTIFY => {
                let bd_addr = read_addr(&mut cursor)?;
                let mut link_key = [0u8; 16];
                cursor.read_exact(&mut link_key).ok()?;
                let key_type = LinkKeyType::from(cursor.read_u8().unwrap_or(0));
                ControllerEvent::LinkKeyNotification {
                    bd_addr,
                    link_key,
                    key_type,
                }
            }
            event_code => ControllerEvent::Unknown {
                event_code,
                parameters: params.to_vec(),
            },
        };

        Some(decoded)
    }

    /// Decode raw event bytes (without the H4 packet indicator)
    pub fn parse(data: &[u8]) -> Option<Self> {
        Self::decode(&HciEvent::parse(data)?)
    }

    /// Whether this is the Command Complete for `opcode`
    pub fn is_command_complete(&self, expected: u16) -> bool {
        matches!(self, ControllerEvent::CommandComplete { opcode, .. } if *opcode == expected)
    }
}

/// Return parameters of Read Buffer Size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSize {
    pub status: u8,
    pub acl_data_packet_length: u16,
    pub sco_data_packet_length: u8,
    pub total_num_acl_packets: u16,
    pub total_num_sco_packets: u16,
}

impl BufferSize {
    pub fn parse(return_parameters: &[u8]) -> Option<Self> {
        let mut cursor = Cursor::new(return_parameters);
        Some(Self {
            status: cursor.read_u8().ok()?,
            acl_data_packet_length: cursor.read_u16::<LittleEndian>().ok()?,
            sco_data_packet_length: cursor.read_u8().ok()?,
            total_num_acl_packets: cursor.read_u16::<LittleEndian>().ok()?,
            total_num_sco_packets: cursor.read_u16::<LittleEndian>().unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_connection_complete() {
        let raw = [
            EVT_CONN_COMPLETE,
            11,
            0x00,
            0x2a,
            0x00,
            0x66,
            0x55,
            0x44,
            0x33,
            0x22,
            0x11,
            LINK_TYPE_ACL,
            0x00,
        ];
        let event = ControllerEvent::parse(&raw).unwrap();
        assert_eq!(
            event,
            ControllerEvent::ConnectionComplete {
                status: 0,
                handle: 0x002a,
                bd_addr: "11:22:33:44:55:66".parse().unwrap(),
                link_type: LINK_TYPE_ACL,
                encryption_enabled: false,
            }
        );
    }

    #[test]
    fn test_decode_number_of_completed_packets() {
        let raw = [EVT_NUM_COMP_PKTS, 9, 2, 0x01, 0x00, 0x02, 0x00, 3, 0, 1, 0];
        let event = ControllerEvent::parse(&raw).unwrap();
        assert_eq!(
            event,
            ControllerEvent::NumberOfCompletedPackets {
                completed: vec![(1, 3), (2, 1)]
            }
        );
    }

    #[test]
    fn test_decode_truncated_event() {
        // connection complete without address
        let raw = [EVT_CONN_COMPLETE, 3, 0x00, 0x2a, 0x00];
        assert!(ControllerEvent::parse(&raw).is_none());
    }

    #[test]
    fn test_remote_name_terminators() {
        assert_eq!(parse_remote_name(b"phone\0junk"), "phone");
        assert_eq!(parse_remote_name(&[b'h', b'i', 0xff, b'x']), "hi");
        assert_eq!(parse_remote_name(b"full"), "full");
    }

    #[test]
    fn test_buffer_size_parse() {
        let params = [0x00, 0xfd, 0x03, 0x40, 0x08, 0x00, 0x01, 0x00];
        let size = BufferSize::parse(&params).unwrap();
        assert_eq!(size.acl_data_packet_length, 1021);
        assert_eq!(size.sco_data_packet_length, 0x40);
        assert_eq!(size.total_num_acl_packets, 8);
        assert_eq!(size.total_num_sco_packets, 1);
    }
}
