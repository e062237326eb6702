//! RFCOMM multiplexer sessions
//!
//! One multiplexer runs per remote device on top of a single L2CAP channel
//! to the RFCOMM PSM. DLCI 0 carries its control traffic.

use super::constants::RFCOMM_DLCI_CONTROL;
use super::frame;
use super::types::MultiplexerState;
use crate::gap::BdAddr;
use crate::hci::connection::INVALID_HANDLE;
use log::debug;
use std::time::Instant;

/// Largest RFCOMM frame payload for an L2CAP MTU: header of up to five
/// bytes, one more once the length field needs two bytes
pub fn max_frame_size_for_mtu(mtu: u16) -> u16 {
    let size = mtu.saturating_sub(5);
    if size > 127 {
        size - 1
    } else {
        size
    }
}

#[derive(Debug, Clone)]
pub struct Multiplexer {
    pub address: BdAddr,
    pub handle: u16,
    pub l2cap_cid: u16,
    pub state: MultiplexerState,
    pub max_frame_size: u16,
    /// We started the session
    pub initiator: bool,
    /// DM owed to the peer for a DLCI without channel
    pub send_dm_for_dlci: Option<u8>,
    /// Deadline of the idle timer while no channel is attached
    pub idle_deadline: Option<Instant>,
}

impl Multiplexer {
    pub fn outgoing(address: BdAddr, max_frame_size: u16) -> Self {
        Self {
            address,
            handle: INVALID_HANDLE,
            l2cap_cid: 0,
            state: MultiplexerState::W4Connect,
            max_frame_size,
            initiator: true,
            send_dm_for_dlci: None,
            idle_deadline: None,
        }
    }

    pub fn incoming(address: BdAddr, handle: u16, l2cap_cid: u16, max_frame_size: u16) -> Self {
        Self {
            address,
            handle,
            l2cap_cid,
            state: MultiplexerState::W4Sabm0,
            max_frame_size,
            initiator: false,
            send_dm_for_dlci: None,
            idle_deadline: None,
        }
    }

    pub fn set_state(&mut self, state: MultiplexerState) {
        if self.state != state {
            debug!(
                "RFCOMM multiplexer {}: {} -> {}",
                self.address, self.state, state
            );
            self.state = state;
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == MultiplexerState::Open
    }

    /// Address byte of a command (SABM, DISC, UIH)
    pub fn command_address(&self, dlci: u8) -> u8 {
        frame::address(dlci, self.initiator)
    }

    /// Address byte of a response (UA, DM)
    pub fn response_address(&self, dlci: u8) -> u8 {
        frame::address(dlci, !self.initiator)
    }

    /// Address byte of control messages
    pub fn control_address(&self) -> u8 {
        self.command_address(RFCOMM_DLCI_CONTROL)
    }

    /// DLCI of a channel to `server_channel` on the peer
    pub fn outgoing_dlci(&self, server_channel: u8) -> u8 {
        (server_channel << 1) | u8::from(!self.initiator)
    }

    /// DLCI the peer uses for our `server_channel`
    pub fn incoming_dlci(&self, server_channel: u8) -> u8 {
        (server_channel << 1) | u8::from(self.initiator)
    }

    /// Bound the frame size by the MTU of the L2CAP channel
    pub fn limit_frame_size(&mut self, mtu: u16) {
        self.max_frame_size = self.max_frame_size.min(max_frame_size_for_mtu(mtu));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_for_mtu() {
        assert_eq!(max_frame_size_for_mtu(1017), 1011);
        assert_eq!(max_frame_size_for_mtu(672), 666);
        assert_eq!(max_frame_size_for_mtu(132), 127);
        assert_eq!(max_frame_size_for_mtu(133), 127);
        assert_eq!(max_frame_size_for_mtu(48), 43);
        assert_eq!(max_frame_size_for_mtu(3), 0);
    }

    #[test]
    fn test_direction_bits() {
        let mut mux = Multiplexer::outgoing(BdAddr::default(), 127);
        assert_eq!(mux.command_address(0), 0x03);
        assert_eq!(mux.response_address(0), 0x01);
        assert_eq!(mux.outgoing_dlci(3), 6);
        assert_eq!(mux.incoming_dlci(3), 7);

        mux.initiator = false;
        assert_eq!(mux.command_address(0), 0x01);
        assert_eq!(mux.response_address(6), 0x1b);
        assert_eq!(mux.outgoing_dlci(3), 7);
        assert_eq!(mux.incoming_dlci(3), 6);
    }

    #[test]
    fn test_limit_frame_size() {
        let mut mux = Multiplexer::incoming(BdAddr::default(), 0x0b, 0x40, 1011);
        mux.limit_frame_size(672);
        assert_eq!(mux.max_frame_size, 666);
        mux.limit_frame_size(0xffff);
        assert_eq!(mux.max_frame_size, 666);
    }
}
