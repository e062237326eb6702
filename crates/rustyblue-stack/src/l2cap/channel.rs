//! L2CAP channels and services
//!
//! An [`L2capChannel`] is a logical connection to one PSM on a remote device,
//! carried by a single baseband connection.

use super::constants::*;
use super::signaling::SignalId;
use super::types::*;
use crate::gap::BdAddr;
use crate::hci::connection::INVALID_HANDLE;
use log::debug;

/// Signaling identifier meaning "no transaction"
pub const SIG_ID_INVALID: SignalId = 0;

/// L2CAP Channel structure
#[derive(Debug, Clone)]
pub struct L2capChannel {
    pub address: BdAddr,
    /// Baseband connection handle, valid once the connection is open
    pub handle: u16,
    pub local_cid: u16,
    pub remote_cid: u16,
    pub local_mtu: u16,
    pub remote_mtu: u16,
    pub psm: u16,
    pub state: L2capChannelState,
    pub config: ConfigFlags,
    /// Identifier of our outstanding request
    pub local_sig_id: SignalId,
    /// Identifier of the peer request we still have to answer
    pub remote_sig_id: SignalId,
    /// Packets the owner may still send
    pub packets_granted: u8,
    /// Result sent when declining an incoming connection
    pub reason: u16,
    pub owner: Owner,
}

impl L2capChannel {
    /// Channel created by a local request
    pub fn outgoing(address: BdAddr, psm: u16, local_cid: u16, mtu: u16, owner: Owner) -> Self {
        Self {
            address,
            handle: INVALID_HANDLE,
            local_cid,
            remote_cid: 0,
            local_mtu: mtu,
            remote_mtu: L2CAP_MINIMAL_MTU,
            psm,
            state: L2capChannelState::WillSendCreateConnection,
            config: ConfigFlags::default(),
            local_sig_id: SIG_ID_INVALID,
            remote_sig_id: SIG_ID_INVALID,
            packets_granted: 0,
            reason: 0,
            owner,
        }
    }

    /// Channel created by a connection request of the peer
    #[allow(clippy::too_many_arguments)]
    pub fn incoming(
        address: BdAddr,
        handle: u16,
        psm: u16,
        local_cid: u16,
        remote_cid: u16,
        mtu: u16,
        sig_id: SignalId,
        owner: Owner,
    ) -> Self {
        Self {
            address,
            handle,
            local_cid,
            remote_cid,
            local_mtu: mtu,
            remote_mtu: L2CAP_DEFAULT_MTU,
            psm,
            state: L2capChannelState::WaitClientAcceptOrReject,
            config: ConfigFlags::default(),
            local_sig_id: SIG_ID_INVALID,
            remote_sig_id: sig_id,
            packets_granted: 0,
            reason: 0,
            owner,
        }
    }

    pub fn set_state(&mut self, state: L2capChannelState) {
        if self.state != state {
            debug!(
                "L2CAP channel 0x{:04x}: {} -> {}",
                self.local_cid, self.state, state
            );
            self.state = state;
        }
    }

    /// Enter `CONFIG`, sending our configuration request first
    pub fn start_config(&mut self) {
        self.set_state(L2capChannelState::Config);
        self.config = ConfigFlags {
            send_conf_req: true,
            ..ConfigFlags::default()
        };
    }

    /// Record a configuration request of the peer; its MTU becomes our
    /// limit for outgoing payloads
    pub fn handle_configure_request(&mut self, identifier: SignalId, options: &ConfigOptions) {
        self.remote_sig_id = identifier;
        self.config.rcvd_conf_req = true;
        self.config.send_conf_rsp = true;
        if let Some(mtu) = options.mtu {
            debug!("L2CAP channel 0x{:04x}: remote mtu {}", self.local_cid, mtu);
            self.remote_mtu = mtu;
        }
    }

    pub fn handle_configure_response(&mut self) {
        self.config.rcvd_conf_rsp = true;
    }

    pub fn is_open(&self) -> bool {
        self.state == L2capChannelState::Open
    }

    /// The event reporting the outcome of opening this channel
    pub fn opened_event(&self, status: u8) -> L2capEvent {
        L2capEvent::ChannelOpened {
            status,
            address: self.address,
            handle: self.handle,
            psm: self.psm,
            local_cid: self.local_cid,
            remote_cid: self.remote_cid,
            local_mtu: self.local_mtu,
            remote_mtu: self.remote_mtu,
        }
    }
}

/// A PSM accepting incoming channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2capService {
    pub psm: u16,
    /// MTU offered on incoming channels
    pub mtu: u16,
    pub owner: Owner,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::ClientId;

    #[test]
    fn test_config_exchange_opens_after_both_responses() {
        let mut channel = L2capChannel::outgoing(
            BdAddr::default(),
            0x1001,
            0x0040,
            672,
            Owner::Application(ClientId::default()),
        );
        channel.start_config();
        assert!(channel.config.send_conf_req);
        assert!(!channel.config.ready_for_open());

        channel.handle_configure_request(
            3,
            &ConfigOptions {
                mtu: Some(200),
                flush_timeout: None,
            },
        );
        assert_eq!(channel.remote_mtu, 200);
        assert_eq!(channel.remote_sig_id, 3);
        assert!(channel.config.send_conf_rsp);

        channel.handle_configure_response();
        assert!(!channel.config.ready_for_open());

        channel.config.sent_conf_rsp = true;
        assert!(channel.config.ready_for_open());
    }
}
