//! Error types for the rustyblue stack
//!
//! `L2capError` and `RfcommError` live next to their engines. This module
//! holds the HCI and transport errors and the status codes shared by every
//! layer.

use thiserror::Error;

/// Stack status codes reported in application events.
///
/// Values below 0x50 are Bluetooth controller error codes; values from 0x50
/// up are host stack codes.
pub mod status {
    pub const SUCCESS: u8 = 0x00;
    pub const AUTHENTICATION_FAILURE: u8 = 0x05;
    pub const PIN_OR_KEY_MISSING: u8 = 0x06;
    pub const CONNECTION_REJECTED_LIMITED_RESOURCES: u8 = 0x0d;
    pub const CONNECTION_REJECTED_UNACCEPTABLE_ADDRESS: u8 = 0x0f;
    pub const REMOTE_USER_TERMINATED_CONNECTION: u8 = 0x13;
    pub const CONNECTION_TERMINATED_BY_LOCAL_HOST: u8 = 0x16;
    pub const UNSUPPORTED_FEATURE_OR_PARAMETER_VALUE: u8 = 0x11;
    pub const CONNECTION_REJECTED_UNACCEPTABLE_LINK_TYPE: u8 = 0x0a;

    pub const ACTIVATION_POWERON_FAILED: u8 = 0x52;
    pub const MEMORY_ALLOC_FAILED: u8 = 0x56;
    pub const ACL_BUFFERS_FULL: u8 = 0x57;

    pub const L2CAP_CONNECTION_RESPONSE_RESULT_SUCCESSFUL: u8 = 0x63;
    pub const L2CAP_CONNECTION_RESPONSE_RESULT_PENDING: u8 = 0x64;
    pub const L2CAP_CONNECTION_RESPONSE_RESULT_REFUSED_PSM: u8 = 0x65;
    pub const L2CAP_CONNECTION_RESPONSE_RESULT_REFUSED_SECURITY: u8 = 0x66;
    pub const L2CAP_CONNECTION_RESPONSE_RESULT_REFUSED_RESOURCES: u8 = 0x67;
    pub const L2CAP_SERVICE_ALREADY_REGISTERED: u8 = 0x69;

    pub const RFCOMM_MULTIPLEXER_STOPPED: u8 = 0x70;
    pub const RFCOMM_CHANNEL_ALREADY_REGISTERED: u8 = 0x71;
    pub const RFCOMM_NO_OUTGOING_CREDITS: u8 = 0x72;
}

/// Errors reported by a [`Transport`](crate::transport::Transport)
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport is not open")]
    NotOpen,

    #[error("Transport is busy")]
    Busy,

    #[error("Unsupported operation")]
    Unsupported,
}

/// Errors raised by the HCI engine
#[derive(Error, Debug)]
pub enum HciError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("No HCI command credits available")]
    CommandBuffersFull,

    #[error("ACL buffers full")]
    AclBuffersFull,

    #[error("Memory allocation failed")]
    MemoryAllocationFailed,

    #[error("Controller is not working")]
    NotWorking,

    #[error("Invalid parameter length: {0}")]
    InvalidParamLength(usize),

    #[error("Invalid HCI packet format")]
    InvalidPacketFormat,
}

impl HciError {
    /// Status code reported to the application for this error
    pub fn status(&self) -> u8 {
        match self {
            HciError::AclBuffersFull => status::ACL_BUFFERS_FULL,
            HciError::MemoryAllocationFailed => status::MEMORY_ALLOC_FAILED,
            HciError::Transport(_) | HciError::NotWorking => status::ACTIVATION_POWERON_FAILED,
            HciError::CommandBuffersFull
            | HciError::InvalidParamLength(_)
            | HciError::InvalidPacketFormat => status::UNSUPPORTED_FEATURE_OR_PARAMETER_VALUE,
        }
    }
}

pub type HciResult<T> = Result<T, HciError>;
