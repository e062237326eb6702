//! HCI packet structures and parsing
//!
//! This module contains structures and methods for handling HCI packets:
//! commands sent to the controller, raw events received from it and the
//! ACL data packet header.

use crate::gap::{BdAddr, LinkKey};
use crate::hci::constants::*;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Classic HCI commands used by the host stack
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HciCommand {
    // Link Control Commands (OGF: 0x01)
    Inquiry {
        lap: u32,
        duration: u8,
        num_responses: u8,
    },
    InquiryCancel,
    CreateConnection {
        bd_addr: BdAddr,
        packet_type: u16,
        page_scan_repetition_mode: u8,
        clock_offset: u16,
        allow_role_switch: bool,
    },
    Disconnect {
        handle: u16,
        reason: u8,
    },
    CreateConnectionCancel {
        bd_addr: BdAddr,
    },
    AcceptConnectionRequest {
        bd_addr: BdAddr,
        role: u8,
    },
    RejectConnectionRequest {
        bd_addr: BdAddr,
        reason: u8,
    },
    LinkKeyRequestReply {
        bd_addr: BdAddr,
        link_key: LinkKey,
    },
    LinkKeyRequestNegativeReply {
        bd_addr: BdAddr,
    },
    PinCodeRequestReply {
        bd_addr: BdAddr,
        pin: Vec<u8>,
    },
    PinCodeRequestNegativeReply {
        bd_addr: BdAddr,
    },
    AuthenticationRequested {
        handle: u16,
    },
    RemoteNameRequest {
        bd_addr: BdAddr,
        page_scan_repetition_mode: u8,
        clock_offset: u16,
    },

    // Link Policy Commands (OGF: 0x02)
    SniffMode {
        handle: u16,
        max_interval: u16,
        min_interval: u16,
        attempt: u16,
        timeout: u16,
    },
    ExitSniffMode {
        handle: u16,
    },

    // Host Controller Commands (OGF: 0x03)
    Reset,
    SetEventMask {
        event_mask: u64,
    },
    DeleteStoredLinkKey {
        bd_addr: BdAddr,
        delete_all: bool,
    },
    WriteLocalName {
        name: String,
    },
    WritePageTimeout {
        timeout: u16,
    },
    WriteScanEnable {
        scan_enable: u8,
    },
    WriteAuthenticationEnable {
        enable: bool,
    },
    WriteClassOfDevice {
        class_of_device: u32,
    },

    // Informational Parameters (OGF: 0x04)
    ReadBufferSize,
    ReadBdAddr,

    /// Any other command, parameters already encoded
    Raw {
        ogf: u8,
        ocf: u16,
        parameters: Vec<u8>,
    },
}

impl HciCommand {
    /// Build a command from its raw parts
    pub fn new(ogf: u8, ocf: u16, parameters: Vec<u8>) -> Self {
        Self::Raw {
            ogf,
            ocf,
            parameters,
        }
    }

    /// Get the OGF and OCF for this command
    pub fn opcode_parts(&self) -> (u8, u16) {
        match self {
            // Link Control Commands
            Self::Inquiry { .. } => (OGF_LINK_CTL, OCF_INQUIRY),
            Self::InquiryCancel => (OGF_LINK_CTL, OCF_INQUIRY_CANCEL),
            Self::CreateConnection { .. } => (OGF_LINK_CTL, OCF_CREATE_CONNECTION),
            Self::Disconnect { .. } => (OGF_LINK_CTL, OCF_DISCONNECT),
            Self::CreateConnectionCancel { .. } => (OGF_LINK_CTL, OCF_CREATE_CONNECTION_CANCEL),
            Self::AcceptConnectionRequest { .. } => (OGF_LINK_CTL, OCF_ACCEPT_CONNECTION_REQUEST),
            Self::RejectConnectionRequest { .. } => (OGF_LINK_CTL, OCF_REJECT_CONNECTION_REQUEST),
            Self::LinkKeyRequestReply { .. } => (OGF_LINK_CTL, OCF_LINK_KEY_REQUEST_REPLY),
            Self::LinkKeyRequestNegativeReply { .. } => {
                (OGF_LINK_CTL, OCF_LINK_KEY_REQUEST_NEGATIVE_REPLY)
            }
            Self::PinCodeRequestReply { .. } => (OGF_LINK_CTL, OCF_PIN_CODE_REQUEST_REPLY),
            Self::PinCodeRequestNegativeReply { .. } => {
                (OGF_LINK_CTL, OCF_PIN_CODE_REQUEST_NEGATIVE_REPLY)
            }
            Self::AuthenticationRequested { .. } => (OGF_LINK_CTL, OCF_AUTHENTICATION_REQUESTED),
            Self::RemoteNameRequest { .. } => (OGF_LINK_CTL, OCF_REMOTE_NAME_REQUEST),

            // Link Policy Commands
            Self::SniffMode { .. } => (OGF_LINK_POLICY, OCF_SNIFF_MODE),
            Self::ExitSniffMode { .. } => (OGF_LINK_POLICY, OCF_EXIT_SNIFF_MODE),

            // Host Controller Commands
            Self::Reset => (OGF_HOST_CTL, OCF_RESET),
            Self::SetEventMask { .. } => (OGF_HOST_CTL, OCF_SET_EVENT_MASK),
            Self::DeleteStoredLinkKey { .. } => (OGF_HOST_CTL, OCF_DELETE_STORED_LINK_KEY),
            Self::WriteLocalName { .. } => (OGF_HOST_CTL, OCF_WRITE_LOCAL_NAME),
            Self::WritePageTimeout { .. } => (OGF_HOST_CTL, OCF_WRITE_PAGE_TIMEOUT),
            Self::WriteScanEnable { .. } => (OGF_HOST_CTL, OCF_WRITE_SCAN_ENABLE),
            Self::WriteAuthenticationEnable { .. } => {
                (OGF_HOST_CTL, OCF_WRITE_AUTHENTICATION_ENABLE)
            }
            Self::WriteClassOfDevice { .. } => (OGF_HOST_CTL, OCF_WRITE_CLASS_OF_DEVICE),

            // Informational Parameters
            Self::ReadBufferSize => (OGF_INFO_PARAM, OCF_READ_BUFFER_SIZE),
            Self::ReadBdAddr => (OGF_INFO_PARAM, OCF_READ_BD_ADDR),

            Self::Raw { ogf, ocf, .. } => (*ogf, *ocf),
        }
    }

    /// The 16-bit opcode of this command
    pub fn opcode(&self) -> u16 {
        let (ogf, ocf) = self.opcode_parts();
        opcode(ogf, ocf)
    }

    /// Convert the command to its raw parameter bytes
    fn parameters(&self) -> Vec<u8> {
        match self {
            Self::InquiryCancel | Self::Reset | Self::ReadBufferSize | Self::ReadBdAddr => vec![],

            Self::Inquiry {
                lap,
                duration,
                num_responses,
            } => {
                let mut params = Vec::with_capacity(5);
                params.extend_from_slice(&lap.to_le_bytes()[..3]);
                params.push(*duration);
                params.push(*num_responses);
                params
            }

            Self::CreateConnection {
                bd_addr,
                packet_type,
                page_scan_repetition_mode,
                clock_offset,
                allow_role_switch,
            } => {
                let mut params = Vec::with_capacity(13);
                params.extend_from_slice(bd_addr.as_slice());
                params.extend_from_slice(&packet_type.to_le_bytes());
                params.push(*page_scan_repetition_mode);
                params.push(0); // reserved
                params.extend_from_slice(&clock_offset.to_le_bytes());
                params.push(*allow_role_switch as u8);
                params
            }

            Self::Disconnect { handle, reason } => {
                let mut params = Vec::with_capacity(3);
                params.extend_from_slice(&handle.to_le_bytes());
                params.push(*reason);
                params
            }

            Self::CreateConnectionCancel { bd_addr }
            | Self::LinkKeyRequestNegativeReply { bd_addr }
            | Self::PinCodeRequestNegativeReply { bd_addr } => bd_addr.as_slice().to_vec(),

            Self::AcceptConnectionRequest { bd_addr, role } => {
                let mut params = bd_addr.as_slice().to_vec();
                params.push(*role);
                params
            }

            Self::RejectConnectionRequest { bd_addr, reason } => {
                let mut params = bd_addr.as_slice().to_vec();
                params.push(*reason);
                params
            }

            Self::LinkKeyRequestReply { bd_addr, link_key } => {
                let mut params = Vec::with_capacity(22);
                params.extend_from_slice(bd_addr.as_slice());
                params.extend_from_slice(link_key);
                params
            }

            Self::PinCodeRequestReply { bd_addr, pin } => {
                let pin_len = pin.len().min(HCI_MAX_PIN_LEN);
                let mut params = Vec::with_capacity(23);
                params.extend_from_slice(bd_addr.as_slice());
                params.push(pin_len as u8);
                let mut padded = [0u8; HCI_MAX_PIN_LEN];
                padded[..pin_len].copy_from_slice(&pin[..pin_len]);
                params.extend_from_slice(&padded);
                params
            }

            Self::AuthenticationRequested { handle } | Self::ExitSniffMode { handle } => {
                handle.to_le_bytes().to_vec()
            }

            Self::RemoteNameRequest {
                bd_addr,
                page_scan_repetition_mode,
                clock_offset,
            } => {
                let mut params = Vec::with_capacity(10);
                params.extend_from_slice(bd_addr.as_slice());
                params.push(*page_scan_repetition_mode);
                params.push(0); // reserved
                params.extend_from_slice(&clock_offset.to_le_bytes());
                params
            }

            Self::SniffMode {
                handle,
                max_interval,
                min_interval,
                attempt,
                timeout,
            } => {
                let mut params = Vec::with_capacity(10);
                for value in [handle, max_interval, min_interval, attempt, timeout] {
                    params.extend_from_slice(&value.to_le_bytes());
                }
                params
            }

            Self::SetEventMask { event_mask } => event_mask.to_le_bytes().to_vec(),

            Self::DeleteStoredLinkKey {
                bd_addr,
                delete_all,
            } => {
                let mut params = bd_addr.as_slice().to_vec();
                params.push(*delete_all as u8);
                params
            }

            Self::WriteLocalName { name } => {
                // fixed 248 byte field, NUL padded
                let mut params = vec![0u8; HCI_MAX_NAME_LEN];
                let bytes = name.as_bytes();
                let len = bytes.len().min(HCI_MAX_NAME_LEN - 1);
                params[..len].copy_from_slice(&bytes[..len]);
                params
            }

            Self::WritePageTimeout { timeout } => timeout.to_le_bytes().to_vec(),

            Self::WriteScanEnable { scan_enable } => vec![*scan_enable],

            Self::WriteAuthenticationEnable { enable } => vec![*enable as u8],

            Self::WriteClassOfDevice { class_of_device } => {
                class_of_device.to_le_bytes()[..3].to_vec()
            }

            Self::Raw { parameters, .. } => parameters.clone(),
        }
    }

    /// Convert the command to a raw HCI command packet (without the H4
    /// packet indicator)
    pub fn to_packet(&self) -> Vec<u8> {
        let params = self.parameters();
        let param_len = params.len().min(HCI_MAX_PARAM_LEN);

        let mut packet = Vec::with_capacity(HCI_COMMAND_HEADER_SIZE + param_len);
        packet.extend_from_slice(&self.opcode().to_le_bytes());
        packet.push(param_len as u8);
        packet.extend_from_slice(&params[..param_len]);
        packet
    }
}

/// Split a raw command packet into opcode and parameters
pub fn parse_command_packet(packet: &[u8]) -> Option<(u16, &[u8])> {
    if packet.len() < HCI_COMMAND_HEADER_SIZE {
        return None;
    }
    let opcode = u16::from_le_bytes([packet[0], packet[1]]);
    let param_len = packet[2] as usize;
    let params = packet.get(HCI_COMMAND_HEADER_SIZE..HCI_COMMAND_HEADER_SIZE + param_len)?;
    Some((opcode, params))
}

/// HCI Event packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HciEvent {
    pub event_code: u8,
    pub parameter_total_length: u8,
    pub parameters: Vec<u8>,
}

impl HciEvent {
    /// Build an event from its code and parameters
    pub fn new(event_code: u8, parameters: Vec<u8>) -> Self {
        Self {
            event_code,
            parameter_total_length: parameters.len() as u8,
            parameters,
        }
    }

    /// Parse an HCI event from raw bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HCI_EVENT_HEADER_SIZE {
            return None;
        }

        let event_code = data[0];
        let parameter_total_length = data[1];

        if data.len() < (parameter_total_length as usize + HCI_EVENT_HEADER_SIZE) {
            return None;
        }

        let parameters =
            data[HCI_EVENT_HEADER_SIZE..(parameter_total_length as usize + HCI_EVENT_HEADER_SIZE)]
                .to_vec();

        Some(HciEvent {
            event_code,
            parameter_total_length,
            parameters,
        })
    }

    /// Serialize the event (without the H4 packet indicator)
    pub fn to_packet(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(HCI_EVENT_HEADER_SIZE + self.parameters.len());
        packet.push(self.event_code);
        packet.push(self.parameters.len() as u8);
        packet.extend_from_slice(&self.parameters);
        packet
    }
}

/// ACL data packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AclHeader {
    /// Connection handle (12 bits)
    pub handle: u16,
    /// Packet boundary flags (2 bits)
    pub packet_boundary: u8,
    /// Broadcast flags (2 bits)
    pub broadcast: u8,
    /// Length of the payload following the header
    pub length: u16,
}

impl AclHeader {
    pub fn new(handle: u16, packet_boundary: u8, length: u16) -> Self {
        Self {
            handle: handle & HCI_HANDLE_MASK,
            packet_boundary: packet_boundary & 0x03,
            broadcast: 0,
            length,
        }
    }

    /// Parse an ACL header from raw bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HCI_ACL_HEADER_SIZE {
            return None;
        }

        let mut cursor = Cursor::new(data);
        let handle_and_flags = cursor.read_u16::<LittleEndian>().ok()?;
        let length = cursor.read_u16::<LittleEndian>().ok()?;

        Some(Self {
            handle: handle_and_flags & HCI_HANDLE_MASK,
            packet_boundary: ((handle_and_flags >> 12) & 0x03) as u8,
            broadcast: ((handle_and_flags >> 14) & 0x03) as u8,
            length,
        })
    }

    /// Serialize the header to bytes
    pub fn to_bytes(&self) -> [u8; HCI_ACL_HEADER_SIZE] {
        let handle_and_flags = (self.handle & HCI_HANDLE_MASK)
            | ((self.packet_boundary as u16 & 0x03) << 12)
            | ((self.broadcast as u16 & 0x03) << 14);
        let handle_bytes = handle_and_flags.to_le_bytes();
        let length_bytes = self.length.to_le_bytes();
        [
            handle_bytes[0],
            handle_bytes[1],
            length_bytes[0],
            length_bytes[1],
        ]
    }
}

/// Build a complete ACL packet (header + payload)
pub fn acl_packet(handle: u16, packet_boundary: u8, payload: &[u8]) -> Vec<u8> {
    let header = AclHeader::new(handle, packet_boundary, payload.len() as u16);
    let mut packet = Vec::with_capacity(HCI_ACL_HEADER_SIZE + payload.len());
    packet.extend_from_slice(&header.to_bytes());
    packet.extend_from_slice(payload);
    packet
}

/// ACL packet types usable for a given controller buffer size
///
/// Basic rate types are enabled when they fit; EDR bits are inverted because
/// they mean "may not be used".
pub fn acl_packet_types_for_buffer_size(buffer_size: u16) -> u16 {
    let mut packet_types = 0u16;
    for (bit, size) in ACL_PACKET_TYPE_SIZES.iter().enumerate() {
        if *size == 0 {
            continue;
        }
        if *size <= buffer_size {
            packet_types |= 1 << bit;
        }
    }
    packet_types ^ ACL_PACKET_TYPE_EDR_MASK
}
