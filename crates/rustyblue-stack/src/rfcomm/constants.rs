//! RFCOMM protocol constants

// Frame control field values
pub const RFCOMM_SABM: u8 = 0x3f;
pub const RFCOMM_UA: u8 = 0x73;
pub const RFCOMM_DM: u8 = 0x0f;
pub const RFCOMM_DM_PF: u8 = 0x1f;
pub const RFCOMM_DISC: u8 = 0x53;
pub const RFCOMM_UIH: u8 = 0xef;
pub const RFCOMM_UIH_PF: u8 = 0xff;

/// Poll/final bit of the control field
pub const RFCOMM_PF_BIT: u8 = 0x10;

// Multiplexer control message types, command/response bit included
pub const RFCOMM_MUX_PN_CMD: u8 = 0x83;
pub const RFCOMM_MUX_PN_RSP: u8 = 0x81;
pub const RFCOMM_MUX_MSC_CMD: u8 = 0xe3;
pub const RFCOMM_MUX_MSC_RSP: u8 = 0xe1;
pub const RFCOMM_MUX_RPN_CMD: u8 = 0x93;
pub const RFCOMM_MUX_RPN_RSP: u8 = 0x91;
pub const RFCOMM_MUX_CLD_CMD: u8 = 0xc3;

/// Command/response bit of a message type
pub const RFCOMM_MUX_CR_BIT: u8 = 0x02;

// Message type values with the command/response bit cleared
pub const RFCOMM_MUX_TYPE_PN: u8 = 0x81;
pub const RFCOMM_MUX_TYPE_MSC: u8 = 0xe1;
pub const RFCOMM_MUX_TYPE_RPN: u8 = 0x91;
pub const RFCOMM_MUX_TYPE_CLD: u8 = 0xc1;

/// Convergence layer nibble of a PN command, credit based flow control
pub const RFCOMM_PN_CL_CREDITS_CMD: u8 = 0xf0;
/// Convergence layer nibble of a PN response accepting credit based flow control
pub const RFCOMM_PN_CL_CREDITS_RSP: u8 = 0xe0;

/// Modem status signals sent with MSC: RTC, RTR, DV, EA
pub const RFCOMM_MSC_SIGNALS: u8 = 0x8d;

// Remote port settings reported when the peer only polls
pub const RFCOMM_RPN_BAUD_9600: u8 = 0xa0;
pub const RFCOMM_RPN_DATA_8N1: u8 = 0x03;
pub const RFCOMM_RPN_FLOW_NONE: u8 = 0x00;
pub const RFCOMM_RPN_XON: u8 = 0xd1;
pub const RFCOMM_RPN_XOFF: u8 = 0xd3;
pub const RFCOMM_RPN_MASK_0: u8 = 0x7f;
pub const RFCOMM_RPN_MASK_1: u8 = 0x3f;

/// DLCI of the multiplexer control channel
pub const RFCOMM_DLCI_CONTROL: u8 = 0;

/// MTU offered on the RFCOMM L2CAP service, capped by the ACL buffer size
pub const RFCOMM_L2CAP_SERVICE_MTU: u16 = 0xffff;

/// L2CAP PSM of RFCOMM
pub const RFCOMM_PSM: u16 = 0x0003;
