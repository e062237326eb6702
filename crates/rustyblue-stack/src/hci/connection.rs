//! Baseband (ACL) connections tracked by the HCI engine

use crate::gap::BdAddr;
use crate::hci::constants::{ACL_PB_CONTINUING, ACL_PB_FIRST_FLUSHABLE, ACL_PB_FIRST_NON_FLUSHABLE};
use crate::l2cap::constants::L2CAP_HEADER_SIZE;
use bitflags::bitflags;
use log::{error, warn};
use std::fmt;
use std::time::{Duration, Instant};

/// Handle value used before the controller assigned one
pub const INVALID_HANDLE: u16 = 0xffff;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    SentCreateConnection,
    ReceivedConnectionRequest,
    AcceptedConnectionRequest,
    Open,
    SentDisconnect,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::SentCreateConnection => write!(f, "SENT_CREATE_CONNECTION"),
            ConnectionState::ReceivedConnectionRequest => write!(f, "RECEIVED_CONNECTION_REQUEST"),
            ConnectionState::AcceptedConnectionRequest => write!(f, "ACCEPTED_CONNECTION_REQUEST"),
            ConnectionState::Open => write!(f, "OPEN"),
            ConnectionState::SentDisconnect => write!(f, "SENT_DISCONNECT"),
        }
    }
}

bitflags! {
    /// Pairing steps seen on a connection
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AuthFlags: u16 {
        const RECV_LINK_KEY_REQUEST = 0x0001;
        const HANDLE_LINK_KEY_REQUEST = 0x0002;
        const SENT_LINK_KEY_REPLY = 0x0004;
        const SENT_LINK_KEY_NEGATIVE_REQUEST = 0x0008;
        const RECV_LINK_KEY_NOTIFICATION = 0x0010;
        const RECV_PIN_CODE_REQUEST = 0x0020;
        const SENT_PIN_CODE_REPLY = 0x0040;
        const SENT_PIN_CODE_NEGATIVE_REPLY = 0x0080;
    }
}

/// A baseband connection to a remote device
#[derive(Debug)]
pub struct Connection {
    pub address: BdAddr,
    /// Controller assigned handle, [`INVALID_HANDLE`] until connected
    pub handle: u16,
    pub state: ConnectionState,
    pub auth_flags: AuthFlags,
    /// ACL packets handed to the controller and not yet completed
    pub outstanding_acl_packets: u16,
    pub last_activity: Instant,
    /// Next liveness check, armed once the connection is open
    pub timeout_at: Option<Instant>,
    reassembly: Vec<u8>,
    reassembly_expected: usize,
}

impl Connection {
    pub fn new(address: BdAddr, state: ConnectionState) -> Self {
        Self {
            address,
            handle: INVALID_HANDLE,
            state,
            auth_flags: AuthFlags::empty(),
            outstanding_acl_packets: 0,
            last_activity: Instant::now(),
            timeout_at: None,
            reassembly: Vec::new(),
            reassembly_expected: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn arm_timeout(&mut self, now: Instant, interval: Duration) {
        self.timeout_at = Some(now + interval);
    }

    /// Pairing is in progress and has not been settled by a key yet
    pub fn authentication_active(&self) -> bool {
        !self.auth_flags.is_empty()
            && !self
                .auth_flags
                .intersects(AuthFlags::SENT_LINK_KEY_REPLY | AuthFlags::RECV_LINK_KEY_NOTIFICATION)
    }

    /// Feed one ACL fragment and return the L2CAP PDU once it is complete.
    ///
    /// A first fragment that already covers the L2CAP length announced in its
    /// header is returned as is.
    pub fn reassemble(&mut self, packet_boundary: u8, payload: &[u8]) -> Option<Vec<u8>> {
        match packet_boundary {
            ACL_PB_FIRST_FLUSHABLE | ACL_PB_FIRST_NON_FLUSHABLE => {
                if !self.reassembly.is_empty() {
                    warn!(
                        "First ACL fragment on handle 0x{:04x} while {} bytes are pending, dropping them",
                        self.handle,
                        self.reassembly.len()
                    );
                    self.reset_reassembly();
                }
                if payload.len() < 2 {
                    warn!("ACL first fragment too short for an L2CAP header");
                    return None;
                }
                let l2cap_len = u16::from_le_bytes([payload[0], payload[1]]) as usize;
                let expected = l2cap_len + L2CAP_HEADER_SIZE;
                if payload.len() >= expected {
                    return Some(payload[..expected].to_vec());
                }
                self.reassembly.extend_from_slice(payload);
                self.reassembly_expected = expected;
                None
            }
            ACL_PB_CONTINUING => {
                if self.reassembly.is_empty() {
                    error!(
                        "ACL continuation fragment without first fragment on handle 0x{:04x}",
                        self.handle
                    );
                    return None;
                }
                self.reassembly.extend_from_slice(payload);
                if self.reassembly.len() < self.reassembly_expected {
                    return None;
                }
                let mut pdu = std::mem::take(&mut self.reassembly);
                pdu.truncate(self.reassembly_expected);
                self.reassembly_expected = 0;
                Some(pdu)
            }
            other => {
                error!("Invalid ACL packet boundary flags {}", other);
                None
            }
        }
    }

    fn reset_reassembly(&mut self) {
        self.reassembly.clear();
        self.reassembly_expected = 0;
    }
}
