//! RFCOMM channels and services

use super::messages::PnParams;
use super::types::*;
use crate::gap::BdAddr;
use crate::stack::ClientId;
use log::debug;

/// A server channel accepting incoming connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RfcommService {
    pub server_channel: u8,
    pub max_frame_size: u16,
    pub incoming_flow_control: bool,
    pub initial_credits: u8,
    pub client: ClientId,
}

/// One DLCI on a multiplexer
#[derive(Debug, Clone)]
pub struct RfcommChannel {
    pub rfcomm_cid: u16,
    /// Remote device, identifies the multiplexer
    pub address: BdAddr,
    pub dlci: u8,
    pub max_frame_size: u16,
    pub state: RfcommChannelState,
    pub flags: DlcFlags,
    /// Frames the peer lets us send
    pub credits_outgoing: u16,
    /// Frames we let the peer send
    pub credits_incoming: u8,
    /// Credits to grant the peer with the next credit frame
    pub new_credits_incoming: u8,
    /// Frames the application may still send
    pub packets_granted: u8,
    /// The application grants incoming credits itself
    pub incoming_flow_control: bool,
    pub pn_priority: u8,
    pub rpn: RpnSettings,
    pub client: ClientId,
}

impl RfcommChannel {
    #[allow(clippy::too_many_arguments)]
    pub fn outgoing(
        rfcomm_cid: u16,
        address: BdAddr,
        dlci: u8,
        max_frame_size: u16,
        incoming_flow_control: bool,
        initial_credits: u8,
        client: ClientId,
    ) -> Self {
        Self {
            rfcomm_cid,
            address,
            dlci,
            max_frame_size,
            state: RfcommChannelState::Closed,
            flags: DlcFlags::default(),
            credits_outgoing: 0,
            credits_incoming: 0,
            new_credits_incoming: initial_credits,
            packets_granted: 0,
            incoming_flow_control,
            pn_priority: 0,
            rpn: RpnSettings::default(),
            client,
        }
    }

    /// Channel created for a frame of the peer addressing `service`
    pub fn incoming(
        rfcomm_cid: u16,
        address: BdAddr,
        dlci: u8,
        multiplexer_frame_size: u16,
        service: &RfcommService,
    ) -> Self {
        Self::outgoing(
            rfcomm_cid,
            address,
            dlci,
            multiplexer_frame_size.min(service.max_frame_size),
            service.incoming_flow_control,
            service.initial_credits,
            service.client,
        )
    }

    pub fn server_channel(&self) -> u8 {
        self.dlci >> 1
    }

    pub fn set_state(&mut self, state: RfcommChannelState) {
        if self.state != state {
            debug!(
                "RFCOMM channel {} (dlci {}): {} -> {}",
                self.rfcomm_cid, self.dlci, self.state, state
            );
            self.state = state;
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == RfcommChannelState::Open
    }

    /// `DLC_SETUP` is done and the peer gave us something to send with
    pub fn ready_for_open(&self) -> bool {
        self.state == RfcommChannelState::DlcSetup
            && self.flags.handshake_complete()
            && self.credits_outgoing > 0
    }

    /// Take the parameters of a PN command of the peer
    pub fn accept_pn(&mut self, params: &PnParams, multiplexer_frame_size: u16) {
        self.pn_priority = params.priority;
        self.credits_outgoing = u16::from(params.credits);
        self.max_frame_size = self
            .max_frame_size
            .min(multiplexer_frame_size)
            .min(params.max_frame_size);
    }

    /// Automatic flow control tops up the peer's credits when they run low
    pub fn replenish_incoming_credits(&mut self, low_watermark: u8, credits: u8) {
        if !self.incoming_flow_control && self.credits_incoming < low_watermark {
            self.new_credits_incoming = credits;
        }
    }

    /// Incoming setup is answered and both sides agreed
    pub fn incoming_setup_done(&self) -> bool {
        self.flags.client_accepted
            && self.flags.rcvd_sabm
            && !self.flags.send_pn_rsp
            && !self.flags.send_ua
    }

    /// The event reporting the outcome of opening this channel
    pub fn opened_event(&self, status: u8, handle: u16) -> RfcommEvent {
        RfcommEvent::ChannelOpened {
            status,
            address: self.address,
            handle,
            server_channel: self.server_channel(),
            rfcomm_cid: self.rfcomm_cid,
            max_frame_size: self.max_frame_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> RfcommChannel {
        RfcommChannel::outgoing(1, BdAddr::default(), 6, 1011, false, 0x30, ClientId(1))
    }

    #[test]
    fn test_ready_for_open_needs_credits() {
        let mut channel = channel();
        channel.state = RfcommChannelState::DlcSetup;
        channel.flags = DlcFlags {
            rcvd_msc_rsp: true,
            sent_msc_rsp: true,
            sent_credits: true,
            ..DlcFlags::default()
        };
        assert!(!channel.ready_for_open());
        channel.credits_outgoing = 1;
        assert!(channel.ready_for_open());
        channel.state = RfcommChannelState::Open;
        assert!(!channel.ready_for_open());
    }

    #[test]
    fn test_accept_pn_takes_smallest_frame_size() {
        let mut channel = channel();
        let params = PnParams {
            dlci: 6,
            convergence_layer: 0xf0,
            priority: 7,
            max_frame_size: 900,
            credits: 3,
        };
        channel.accept_pn(&params, 1000);
        assert_eq!(channel.max_frame_size, 900);
        assert_eq!(channel.credits_outgoing, 3);
        assert_eq!(channel.pn_priority, 7);

        channel.accept_pn(&params, 127);
        assert_eq!(channel.max_frame_size, 127);
    }

    #[test]
    fn test_incoming_uses_service_settings() {
        let service = RfcommService {
            server_channel: 3,
            max_frame_size: 200,
            incoming_flow_control: true,
            initial_credits: 4,
            client: ClientId(9),
        };
        let channel = RfcommChannel::incoming(2, BdAddr::default(), 6, 1011, &service);
        assert_eq!(channel.server_channel(), 3);
        assert_eq!(channel.max_frame_size, 200);
        assert_eq!(channel.new_credits_incoming, 4);
        assert!(channel.incoming_flow_control);
        assert_eq!(channel.client, ClientId(9));
    }

    #[test]
    fn test_replenish_only_with_automatic_flow_control() {
        let mut channel = channel();
        channel.credits_incoming = 4;
        channel.new_credits_incoming = 0;
        channel.replenish_incoming_credits(5, 0x30);
        assert_eq!(channel.new_credits_incoming, 0x30);

        channel.incoming_flow_control = true;
        channel.new_credits_incoming = 0;
        channel.replenish_incoming_credits(5, 0x30);
        assert_eq!(channel.new_credits_incoming, 0);
    }
}
