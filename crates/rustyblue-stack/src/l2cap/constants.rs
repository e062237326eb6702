//! L2CAP protocol constants

/// Basic L2CAP header: 2 byte length, 2 byte channel id
pub const L2CAP_HEADER_SIZE: usize = 4;
/// Signaling command header: code, identifier, 2 byte length
pub const L2CAP_SIGNALING_HEADER_SIZE: usize = 4;

// Fixed channel identifiers
pub const L2CAP_CID_SIGNALING: u16 = 0x0001;
pub const L2CAP_CID_CONNECTIONLESS: u16 = 0x0002;

/// First dynamically allocated channel identifier
pub const L2CAP_DYNAMIC_CID_MIN: u16 = 0x0040;

/// Smallest MTU every L2CAP implementation supports
pub const L2CAP_MINIMAL_MTU: u16 = 48;
/// MTU assumed for the peer until it configures another one
pub const L2CAP_DEFAULT_MTU: u16 = 672;

/// Capacity of the queue of responses to requests that have no channel
pub const NR_PENDING_SIGNALING_RESPONSES: usize = 3;

// Signaling command codes
pub const L2CAP_COMMAND_REJECT: u8 = 0x01;
pub const L2CAP_CONNECTION_REQUEST: u8 = 0x02;
pub const L2CAP_CONNECTION_RESPONSE: u8 = 0x03;
pub const L2CAP_CONFIGURE_REQUEST: u8 = 0x04;
pub const L2CAP_CONFIGURE_RESPONSE: u8 = 0x05;
pub const L2CAP_DISCONNECTION_REQUEST: u8 = 0x06;
pub const L2CAP_DISCONNECTION_RESPONSE: u8 = 0x07;
pub const L2CAP_ECHO_REQUEST: u8 = 0x08;
pub const L2CAP_ECHO_RESPONSE: u8 = 0x09;
pub const L2CAP_INFORMATION_REQUEST: u8 = 0x0A;
pub const L2CAP_INFORMATION_RESPONSE: u8 = 0x0B;

// Connection response results
pub const L2CAP_CONNECTION_SUCCESSFUL: u16 = 0x0000;
pub const L2CAP_CONNECTION_PENDING: u16 = 0x0001;
pub const L2CAP_CONNECTION_REFUSED_PSM: u16 = 0x0002;
pub const L2CAP_CONNECTION_REFUSED_SECURITY: u16 = 0x0003;
pub const L2CAP_CONNECTION_REFUSED_RESOURCES: u16 = 0x0004;

// Configuration option types (the high bit is the hint flag)
pub const L2CAP_CONF_MTU: u8 = 0x01;
pub const L2CAP_CONF_FLUSH_TIMEOUT: u8 = 0x02;
pub const L2CAP_CONF_HINT: u8 = 0x80;

// Information request types and results
pub const L2CAP_INFO_CONNECTIONLESS_MTU: u16 = 0x0001;
pub const L2CAP_INFO_EXTENDED_FEATURES: u16 = 0x0002;
pub const L2CAP_INFO_RESULT_SUCCESS: u16 = 0x0000;
pub const L2CAP_INFO_RESULT_NOT_SUPPORTED: u16 = 0x0001;
