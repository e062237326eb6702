//! Type definitions for RFCOMM operations

use crate::error::status;
use crate::gap::BdAddr;
use crate::l2cap::L2capError;
use std::fmt;
use thiserror::Error;

/// Error types specific to RFCOMM operations
#[derive(Debug, Error)]
pub enum RfcommError {
    #[error("RFCOMM channel {0} not found")]
    ChannelNotFound(u16),

    #[error("No outgoing credits on RFCOMM channel {0}")]
    NoOutgoingCredits(u16),

    #[error("Payload of {len} bytes exceeds the frame size of {max}")]
    FrameTooLarge { len: usize, max: u16 },

    #[error("Malformed frame: {0}")]
    MalformedFrame(&'static str),

    #[error("Resource limit reached")]
    ResourceLimitReached,

    #[error("L2CAP error: {0}")]
    L2cap(#[from] L2capError),
}

impl RfcommError {
    /// Status code reported to the application for this error
    pub fn status(&self) -> u8 {
        match self {
            RfcommError::L2cap(e) => e.status(),
            RfcommError::NoOutgoingCredits(_) => status::RFCOMM_NO_OUTGOING_CREDITS,
            RfcommError::ResourceLimitReached => status::MEMORY_ALLOC_FAILED,
            _ => status::UNSUPPORTED_FEATURE_OR_PARAMETER_VALUE,
        }
    }
}

/// Result type for RFCOMM operations
pub type RfcommResult<T> = std::result::Result<T, RfcommError>;

/// State of a multiplexer session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiplexerState {
    Closed,
    /// Outgoing, waiting for the L2CAP channel
    W4Connect,
    SendSabm0,
    W4Ua0,
    /// Incoming, waiting for the peer to start the session
    W4Sabm0,
    SendUa0,
    Open,
    SendUa0AndDisc,
    /// Idle timeout fired, close the session
    SendDisc0,
}

impl fmt::Display for MultiplexerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MultiplexerState::Closed => "CLOSED",
            MultiplexerState::W4Connect => "W4_CONNECT",
            MultiplexerState::SendSabm0 => "SEND_SABM_0",
            MultiplexerState::W4Ua0 => "W4_UA_0",
            MultiplexerState::W4Sabm0 => "W4_SABM_0",
            MultiplexerState::SendUa0 => "SEND_UA_0",
            MultiplexerState::Open => "OPEN",
            MultiplexerState::SendUa0AndDisc => "SEND_UA_0_AND_DISC",
            MultiplexerState::SendDisc0 => "SEND_DISC_0",
        };
        write!(f, "{}", name)
    }
}

/// State of an RFCOMM channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RfcommChannelState {
    Closed,
    W4Multiplexer,
    SendUihPn,
    W4PnRsp,
    SendSabmW4Ua,
    W4Ua,
    IncomingSetup,
    DlcSetup,
    Open,
    SendDm,
    SendDisc,
    SendUaAfterDisc,
}

impl RfcommChannelState {
    /// Teardown is already under way
    pub fn closing(&self) -> bool {
        matches!(
            self,
            RfcommChannelState::SendDm
                | RfcommChannelState::SendDisc
                | RfcommChannelState::SendUaAfterDisc
        )
    }
}

impl fmt::Display for RfcommChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RfcommChannelState::Closed => "CLOSED",
            RfcommChannelState::W4Multiplexer => "W4_MULTIPLEXER",
            RfcommChannelState::SendUihPn => "SEND_UIH_PN",
            RfcommChannelState::W4PnRsp => "W4_PN_RSP",
            RfcommChannelState::SendSabmW4Ua => "SEND_SABM_W4_UA",
            RfcommChannelState::W4Ua => "W4_UA",
            RfcommChannelState::IncomingSetup => "INCOMING_SETUP",
            RfcommChannelState::DlcSetup => "DLC_SETUP",
            RfcommChannelState::Open => "OPEN",
            RfcommChannelState::SendDm => "SEND_DM",
            RfcommChannelState::SendDisc => "SEND_DISC",
            RfcommChannelState::SendUaAfterDisc => "SEND_UA_AFTER_DISC",
        };
        write!(f, "{}", name)
    }
}

/// Handshake progress of a channel during incoming setup and `DLC_SETUP`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DlcFlags {
    pub rcvd_pn: bool,
    pub rcvd_sabm: bool,
    pub client_accepted: bool,
    pub send_pn_rsp: bool,
    pub send_ua: bool,
    pub send_msc_cmd: bool,
    pub sent_msc_cmd: bool,
    pub rcvd_msc_cmd: bool,
    pub send_msc_rsp: bool,
    pub sent_msc_rsp: bool,
    pub rcvd_msc_rsp: bool,
    pub send_credits: bool,
    pub sent_credits: bool,
    pub send_rpn_rsp: bool,
}

impl DlcFlags {
    /// Modem status exchanged both ways and initial credits granted
    pub fn handshake_complete(&self) -> bool {
        self.rcvd_msc_rsp && self.sent_msc_rsp && self.sent_credits
    }
}

/// Remote port settings carried by RPN
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpnSettings {
    pub baud_rate: u8,
    pub data_format: u8,
    pub flow_control: u8,
    pub xon: u8,
    pub xoff: u8,
    pub parameter_mask: [u8; 2],
}

impl Default for RpnSettings {
    fn default() -> Self {
        use super::constants::*;
        Self {
            baud_rate: RFCOMM_RPN_BAUD_9600,
            data_format: RFCOMM_RPN_DATA_8N1,
            flow_control: RFCOMM_RPN_FLOW_NONE,
            xon: RFCOMM_RPN_XON,
            xoff: RFCOMM_RPN_XOFF,
            parameter_mask: [RFCOMM_RPN_MASK_0, RFCOMM_RPN_MASK_1],
        }
    }
}

/// Events reported by the RFCOMM engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RfcommEvent {
    /// A peer opens a channel to a registered service, answer with accept
    /// or decline
    IncomingConnection {
        address: BdAddr,
        server_channel: u8,
        rfcomm_cid: u16,
    },
    /// Result of opening a channel, status 0 on success
    ChannelOpened {
        status: u8,
        address: BdAddr,
        handle: u16,
        server_channel: u8,
        rfcomm_cid: u16,
        max_frame_size: u16,
    },
    ChannelClosed {
        rfcomm_cid: u16,
    },
    /// The application may send `credits` more frames
    Credits {
        rfcomm_cid: u16,
        credits: u8,
    },
    /// The peer granted new credits
    RemoteCredits {
        rfcomm_cid: u16,
    },
    ServiceRegistered {
        status: u8,
        server_channel: u8,
    },
    Data {
        rfcomm_cid: u16,
        payload: Vec<u8>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_needs_all_three_steps() {
        let mut flags = DlcFlags {
            rcvd_msc_rsp: true,
            sent_msc_rsp: true,
            ..DlcFlags::default()
        };
        assert!(!flags.handshake_complete());
        flags.sent_credits = true;
        assert!(flags.handshake_complete());
        flags.rcvd_msc_rsp = false;
        assert!(!flags.handshake_complete());
    }

    #[test]
    fn test_error_status() {
        assert_eq!(RfcommError::NoOutgoingCredits(1).status(), 0x72);
        assert_eq!(RfcommError::ResourceLimitReached.status(), 0x56);
        assert_eq!(
            RfcommError::from(L2capError::NoCredits(0x40)).status(),
            status::ACL_BUFFERS_FULL
        );
    }
}
