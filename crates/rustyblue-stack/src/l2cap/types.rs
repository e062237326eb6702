//! Type definitions for L2CAP operations
//!
//! Errors, channel states, configuration options and the events the
//! [`L2capEngine`](super::L2capEngine) reports to its users.

use crate::error::{status, HciError};
use crate::gap::BdAddr;
use crate::stack::ClientId;
use std::fmt;
use thiserror::Error;

/// Error types specific to L2CAP operations
#[derive(Debug, Error)]
pub enum L2capError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Channel 0x{0:04x} not found")]
    ChannelNotFound(u16),

    #[error("Invalid state for operation: {0}")]
    InvalidState(L2capChannelState),

    #[error("Payload of {len} bytes exceeds the remote MTU of {mtu}")]
    MtuExceeded { len: usize, mtu: u16 },

    #[error("No send credits on channel 0x{0:04x}")]
    NoCredits(u16),

    #[error("Resource limit reached")]
    ResourceLimitReached,

    #[error("HCI error: {0}")]
    Hci(#[from] HciError),
}

impl L2capError {
    /// Status code reported to the application for this error
    pub fn status(&self) -> u8 {
        match self {
            L2capError::Hci(e) => e.status(),
            L2capError::ResourceLimitReached => status::MEMORY_ALLOC_FAILED,
            L2capError::NoCredits(_) => status::ACL_BUFFERS_FULL,
            _ => status::UNSUPPORTED_FEATURE_OR_PARAMETER_VALUE,
        }
    }
}

/// Result type for L2CAP operations
pub type L2capResult<T> = std::result::Result<T, L2capError>;

/// State of an L2CAP channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2capChannelState {
    Closed,
    WillSendCreateConnection,
    WaitConnectionComplete,
    WaitClientAcceptOrReject,
    WillSendConnectionResponseDecline,
    WillSendConnectionResponseAccept,
    WillSendConnectionRequest,
    WaitConnectRsp,
    Config,
    Open,
    WillSendDisconnectRequest,
    WillSendDisconnectResponse,
    WaitDisconnect,
}

impl L2capChannelState {
    /// The peer has not heard of the channel yet
    pub fn before_signaling(&self) -> bool {
        matches!(
            self,
            L2capChannelState::WillSendCreateConnection
                | L2capChannelState::WaitConnectionComplete
                | L2capChannelState::WillSendConnectionRequest
        )
    }
}

impl fmt::Display for L2capChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            L2capChannelState::Closed => "CLOSED",
            L2capChannelState::WillSendCreateConnection => "WILL_SEND_CREATE_CONNECTION",
            L2capChannelState::WaitConnectionComplete => "WAIT_CONNECTION_COMPLETE",
            L2capChannelState::WaitClientAcceptOrReject => "WAIT_CLIENT_ACCEPT_OR_REJECT",
            L2capChannelState::WillSendConnectionResponseDecline => {
                "WILL_SEND_CONNECTION_RESPONSE_DECLINE"
            }
            L2capChannelState::WillSendConnectionResponseAccept => {
                "WILL_SEND_CONNECTION_RESPONSE_ACCEPT"
            }
            L2capChannelState::WillSendConnectionRequest => "WILL_SEND_CONNECTION_REQUEST",
            L2capChannelState::WaitConnectRsp => "WAIT_CONNECT_RSP",
            L2capChannelState::Config => "CONFIG",
            L2capChannelState::Open => "OPEN",
            L2capChannelState::WillSendDisconnectRequest => "WILL_SEND_DISCONNECT_REQUEST",
            L2capChannelState::WillSendDisconnectResponse => "WILL_SEND_DISCONNECT_RESPONSE",
            L2capChannelState::WaitDisconnect => "WAIT_DISCONNECT",
        };
        write!(f, "{}", name)
    }
}

/// Progress of the configuration exchange of a channel in `CONFIG`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigFlags {
    pub send_conf_req: bool,
    pub sent_conf_req: bool,
    pub rcvd_conf_req: bool,
    pub send_conf_rsp: bool,
    pub sent_conf_rsp: bool,
    pub rcvd_conf_rsp: bool,
}

impl ConfigFlags {
    /// Both directions are configured: our request was answered and we
    /// answered the peer's request
    pub fn ready_for_open(&self) -> bool {
        self.rcvd_conf_rsp && self.sent_conf_rsp
    }
}

/// L2CAP configuration options understood by this stack
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigOptions {
    /// Maximum Transmission Unit
    pub mtu: Option<u16>,
    /// Flush Timeout
    pub flush_timeout: Option<u16>,
}

/// Who receives the events of a channel or service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Owner {
    /// The RFCOMM engine
    Rfcomm,
    /// An application client
    Application(ClientId),
}

/// Events reported by the L2CAP engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum L2capEvent {
    IncomingConnection {
        address: BdAddr,
        handle: u16,
        psm: u16,
        local_cid: u16,
        remote_cid: u16,
    },
    /// Result of an outgoing or accepted incoming channel, status 0 on success
    ChannelOpened {
        status: u8,
        address: BdAddr,
        handle: u16,
        psm: u16,
        local_cid: u16,
        remote_cid: u16,
        local_mtu: u16,
        remote_mtu: u16,
    },
    ChannelClosed {
        local_cid: u16,
    },
    /// The channel may send `credits` more packets
    Credits {
        local_cid: u16,
        credits: u8,
    },
    ServiceRegistered {
        status: u8,
        psm: u16,
    },
    Data {
        local_cid: u16,
        payload: Vec<u8>,
    },
}
