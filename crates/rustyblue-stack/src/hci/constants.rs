//! HCI protocol constants
//!
//! This module contains constants used in the Bluetooth HCI protocol.

// HCI packet types
pub const HCI_COMMAND_PKT: u8 = 0x01;
pub const HCI_ACL_PKT: u8 = 0x02;
pub const HCI_SCO_PKT: u8 = 0x03;
pub const HCI_EVENT_PKT: u8 = 0x04;

// Header sizes
pub const HCI_COMMAND_HEADER_SIZE: usize = 3;
pub const HCI_EVENT_HEADER_SIZE: usize = 2;
pub const HCI_ACL_HEADER_SIZE: usize = 4;

// Maximum size of HCI command parameters
pub const HCI_MAX_PARAM_LEN: usize = 255;

// Common OGF (Opcode Group Field) values
pub const OGF_LINK_CTL: u8 = 0x01;
pub const OGF_LINK_POLICY: u8 = 0x02;
pub const OGF_HOST_CTL: u8 = 0x03;
pub const OGF_INFO_PARAM: u8 = 0x04;
pub const OGF_VENDOR: u8 = 0x3f;

// Link Control Commands (OGF: 0x01)
pub const OCF_INQUIRY: u16 = 0x0001;
pub const OCF_INQUIRY_CANCEL: u16 = 0x0002;
pub const OCF_CREATE_CONNECTION: u16 = 0x0005;
pub const OCF_DISCONNECT: u16 = 0x0006;
pub const OCF_CREATE_CONNECTION_CANCEL: u16 = 0x0008;
pub const OCF_ACCEPT_CONNECTION_REQUEST: u16 = 0x0009;
pub const OCF_REJECT_CONNECTION_REQUEST: u16 = 0x000A;
pub const OCF_LINK_KEY_REQUEST_REPLY: u16 = 0x000B;
pub const OCF_LINK_KEY_REQUEST_NEGATIVE_REPLY: u16 = 0x000C;
pub const OCF_PIN_CODE_REQUEST_REPLY: u16 = 0x000D;
pub const OCF_PIN_CODE_REQUEST_NEGATIVE_REPLY: u16 = 0x000E;
pub const OCF_AUTHENTICATION_REQUESTED: u16 = 0x0011;
pub const OCF_REMOTE_NAME_REQUEST: u16 = 0x0019;

// Link Policy Commands (OGF: 0x02)
pub const OCF_SNIFF_MODE: u16 = 0x0003;
pub const OCF_EXIT_SNIFF_MODE: u16 = 0x0004;

// Host Controller Commands (OGF: 0x03)
pub const OCF_SET_EVENT_MASK: u16 = 0x0001;
pub const OCF_RESET: u16 = 0x0003;
pub const OCF_DELETE_STORED_LINK_KEY: u16 = 0x0012;
pub const OCF_WRITE_LOCAL_NAME: u16 = 0x0013;
pub const OCF_WRITE_PAGE_TIMEOUT: u16 = 0x0018;
pub const OCF_WRITE_SCAN_ENABLE: u16 = 0x001A;
pub const OCF_WRITE_AUTHENTICATION_ENABLE: u16 = 0x0020;
pub const OCF_WRITE_CLASS_OF_DEVICE: u16 = 0x0024;

// Informational Parameters (OGF: 0x04)
pub const OCF_READ_BUFFER_SIZE: u16 = 0x0005;
pub const OCF_READ_BD_ADDR: u16 = 0x0009;

/// Build an opcode from its group and command fields
pub const fn opcode(ogf: u8, ocf: u16) -> u16 {
    ((ogf as u16) << 10) | (ocf & 0x03ff)
}

pub const OPCODE_CREATE_CONNECTION: u16 = opcode(OGF_LINK_CTL, OCF_CREATE_CONNECTION);
pub const OPCODE_DISCONNECT: u16 = opcode(OGF_LINK_CTL, OCF_DISCONNECT);
pub const OPCODE_CREATE_CONNECTION_CANCEL: u16 = opcode(OGF_LINK_CTL, OCF_CREATE_CONNECTION_CANCEL);
pub const OPCODE_ACCEPT_CONNECTION_REQUEST: u16 = opcode(OGF_LINK_CTL, OCF_ACCEPT_CONNECTION_REQUEST);
pub const OPCODE_REJECT_CONNECTION_REQUEST: u16 = opcode(OGF_LINK_CTL, OCF_REJECT_CONNECTION_REQUEST);
pub const OPCODE_LINK_KEY_REQUEST_REPLY: u16 = opcode(OGF_LINK_CTL, OCF_LINK_KEY_REQUEST_REPLY);
pub const OPCODE_LINK_KEY_REQUEST_NEGATIVE_REPLY: u16 =
    opcode(OGF_LINK_CTL, OCF_LINK_KEY_REQUEST_NEGATIVE_REPLY);
pub const OPCODE_PIN_CODE_REQUEST_REPLY: u16 = opcode(OGF_LINK_CTL, OCF_PIN_CODE_REQUEST_REPLY);
pub const OPCODE_PIN_CODE_REQUEST_NEGATIVE_REPLY: u16 =
    opcode(OGF_LINK_CTL, OCF_PIN_CODE_REQUEST_NEGATIVE_REPLY);
pub const OPCODE_DELETE_STORED_LINK_KEY: u16 = opcode(OGF_HOST_CTL, OCF_DELETE_STORED_LINK_KEY);
pub const OPCODE_RESET: u16 = opcode(OGF_HOST_CTL, OCF_RESET);
pub const OPCODE_READ_BUFFER_SIZE: u16 = opcode(OGF_INFO_PARAM, OCF_READ_BUFFER_SIZE);
pub const OPCODE_READ_BD_ADDR: u16 = opcode(OGF_INFO_PARAM, OCF_READ_BD_ADDR);
pub const OPCODE_WRITE_SCAN_ENABLE: u16 = opcode(OGF_HOST_CTL, OCF_WRITE_SCAN_ENABLE);

// HCI Events
pub const EVT_INQUIRY_COMPLETE: u8 = 0x01;
pub const EVT_INQUIRY_RESULT: u8 = 0x02;
pub const EVT_CONN_COMPLETE: u8 = 0x03;
pub const EVT_CONN_REQUEST: u8 = 0x04;
pub const EVT_DISCONN_COMPLETE: u8 = 0x05;
pub const EVT_AUTH_COMPLETE: u8 = 0x06;
pub const EVT_REMOTE_NAME_REQ_COMPLETE: u8 = 0x07;
pub const EVT_ENCRYPTION_CHANGE: u8 = 0x08;
pub const EVT_CMD_COMPLETE: u8 = 0x0E;
pub const EVT_CMD_STATUS: u8 = 0x0F;
pub const EVT_HARDWARE_ERROR: u8 = 0x10;
pub const EVT_ROLE_CHANGE: u8 = 0x12;
pub const EVT_NUM_COMP_PKTS: u8 = 0x13;
pub const EVT_PIN_CODE_REQ: u8 = 0x16;
pub const EVT_LINK_KEY_REQ: u8 = 0x17;
pub const EVT_LINK_KEY_NOTIFY: u8 = 0x18;

// Link types
pub const LINK_TYPE_SCO: u8 = 0x00;
pub const LINK_TYPE_ACL: u8 = 0x01;
pub const LINK_TYPE_ESCO: u8 = 0x02;

// Roles used when accepting a connection
pub const ROLE_MASTER: u8 = 0x00;
pub const ROLE_SLAVE: u8 = 0x01;

// ACL packet boundary flags
pub const ACL_PB_FIRST_NON_FLUSHABLE: u8 = 0x00;
pub const ACL_PB_CONTINUING: u8 = 0x01;
pub const ACL_PB_FIRST_FLUSHABLE: u8 = 0x02;

/// Connection handles are 12 bit
pub const HCI_HANDLE_MASK: u16 = 0x0fff;

/// Maximum length of the local name
pub const HCI_MAX_NAME_LEN: usize = 248;

/// Default PIN code length limit
pub const HCI_MAX_PIN_LEN: usize = 16;

// ACL packet types (Create Connection parameter)
pub const ACL_PACKET_TYPE_2DH1_MAY_NOT_BE_USED: u16 = 0x0002;
pub const ACL_PACKET_TYPE_3DH1_MAY_NOT_BE_USED: u16 = 0x0004;
pub const ACL_PACKET_TYPE_DM1: u16 = 0x0008;
pub const ACL_PACKET_TYPE_DH1: u16 = 0x0010;
pub const ACL_PACKET_TYPE_DM3: u16 = 0x0400;
pub const ACL_PACKET_TYPE_DH3: u16 = 0x0800;
pub const ACL_PACKET_TYPE_DM5: u16 = 0x4000;
pub const ACL_PACKET_TYPE_DH5: u16 = 0x8000;

/// EDR packet type bits carry "may not be used" semantics
pub const ACL_PACKET_TYPE_EDR_MASK: u16 = 0x3306;

/// Payload capacity of every ACL baseband packet type, indexed by bit position
/// in the packet type mask; 0 marks reserved bits.
pub const ACL_PACKET_TYPE_SIZES: [u16; 16] = [
    0, 54, 83, 17, // -, 2-DH1, 3-DH1, DM1
    27, 0, 0, 0, // DH1
    367, 552, 121, 183, // 2-DH3, 3-DH3, DM3, DH3
    679, 1021, 224, 339, // 2-DH5, 3-DH5, DM5, DH5
];
