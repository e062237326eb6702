//! L2CAP engine
//!
//! The engine owns the channels and services of every baseband connection and
//! runs the signaling state machines on top of the [`HciEngine`]. Like the HCI
//! engine it never blocks: entry points update channel state, and
//! [`L2capEngine::run`] sends whatever signaling the HCI flow control permits.
//! Results are queued as `(Owner, L2capEvent)` pairs so the caller can route
//! them to RFCOMM or to the application that owns the channel.

use super::channel::{L2capChannel, L2capService};
use super::constants::*;
use super::packet::{l2cap_packet, split_pdu};
use super::psm::PSM;
use super::signaling::{split_commands, SignalId, SignalingCommand, SignalingHeader};
use super::types::*;
use crate::config::L2capConfig;
use crate::error::{status, HciError};
use crate::gap::BdAddr;
use crate::hci::connection::INVALID_HANDLE;
use crate::hci::constants::OPCODE_CREATE_CONNECTION_CANCEL;
use crate::hci::{ControllerEvent, HciCommand, HciEngine, HostEvent};
use crate::stack::ClientId;
use heapless::Deque;
use log::{debug, error, info, trace, warn};
use std::collections::VecDeque;

/// Response to a request that has no channel (echo, information, refused
/// connection)
#[derive(Debug, Clone, Copy)]
struct SignalingResponse {
    handle: u16,
    /// Code of the request being answered
    code: u8,
    sig_id: SignalId,
    /// Result for connection requests, info type for information requests
    data: u16,
}

/// Outcome of one run step for a channel
enum ChannelStep {
    Idle,
    Progress,
    Removed,
}

/// L2CAP engine responsible for channels and services on BR/EDR links
pub struct L2capEngine {
    config: L2capConfig,
    channels: Vec<L2capChannel>,
    services: Vec<L2capService>,
    signaling_responses: Deque<SignalingResponse, NR_PENDING_SIGNALING_RESPONSES>,
    next_local_cid: u16,
    next_sig_id: SignalId,
    new_credits_blocked: bool,
    events: VecDeque<(Owner, L2capEvent)>,
}

impl L2capEngine {
    pub fn new(config: L2capConfig) -> Self {
        Self {
            config,
            channels: Vec::new(),
            services: Vec::new(),
            signaling_responses: Deque::new(),
            next_local_cid: L2CAP_DYNAMIC_CID_MIN,
            next_sig_id: 0,
            new_credits_blocked: false,
            events: VecDeque::new(),
        }
    }

    /// Next queued event together with the owner it is meant for
    pub fn poll_event(&mut self) -> Option<(Owner, L2capEvent)> {
        self.events.pop_front()
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    fn emit(&mut self, owner: Owner, event: L2capEvent) {
        self.events.push_back((owner, event));
    }

    fn emit_opened(&mut self, idx: usize, status: u8) {
        let channel = &self.channels[idx];
        info!(
            "L2CAP channel opened, status 0x{:02x} addr {} handle 0x{:04x} psm {} local_cid 0x{:04x} remote_cid 0x{:04x} local_mtu {} remote_mtu {}",
            status,
            channel.address,
            channel.handle,
            PSM::from(channel.psm),
            channel.local_cid,
            channel.remote_cid,
            channel.local_mtu,
            channel.remote_mtu
        );
        let (owner, event) = (channel.owner, channel.opened_event(status));
        self.emit(owner, event);
    }

    fn emit_closed(&mut self, idx: usize) {
        let channel = &self.channels[idx];
        info!("L2CAP channel closed, local_cid 0x{:04x}", channel.local_cid);
        let (owner, local_cid) = (channel.owner, channel.local_cid);
        self.emit(owner, L2capEvent::ChannelClosed { local_cid });
    }

    fn emit_credits(&mut self, idx: usize, credits: u8) {
        let channel = &mut self.channels[idx];
        channel.packets_granted = channel.packets_granted.saturating_add(credits);
        trace!(
            "L2CAP credits local_cid 0x{:04x} credits {}",
            channel.local_cid,
            credits
        );
        let (owner, local_cid) = (channel.owner, channel.local_cid);
        self.emit(owner, L2capEvent::Credits { local_cid, credits });
    }

    // ---- lookup ------------------------------------------------------------

    fn index_for_local_cid(&self, local_cid: u16) -> Option<usize> {
        self.channels.iter().position(|c| c.local_cid == local_cid)
    }

    pub fn channel(&self, local_cid: u16) -> Option<&L2capChannel> {
        self.channels.iter().find(|c| c.local_cid == local_cid)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn service(&self, psm: u16) -> Option<&L2capService> {
        self.services.iter().find(|s| s.psm == psm)
    }

    /// MTU of the peer, 0 for an unknown channel
    pub fn remote_mtu(&self, local_cid: u16) -> u16 {
        self.channel(local_cid).map(|c| c.remote_mtu).unwrap_or(0)
    }

    /// Largest payload that fits into a single ACL packet
    pub fn max_mtu(&self, hci: &HciEngine) -> u16 {
        (hci.max_acl_data_packet_length() as usize)
            .saturating_sub(L2CAP_HEADER_SIZE) as u16
    }

    fn next_local_cid(&mut self) -> u16 {
        loop {
            let cid = self.next_local_cid;
            self.next_local_cid = match cid.checked_add(1) {
                Some(next) => next,
                None => L2CAP_DYNAMIC_CID_MIN,
            };
            if self.index_for_local_cid(cid).is_none() {
                return cid;
            }
        }
    }

    fn next_sig_id(&mut self) -> SignalId {
        self.next_sig_id = self.next_sig_id.wrapping_add(1);
        if self.next_sig_id == 0 {
            self.next_sig_id = 1;
        }
        self.next_sig_id
    }

    // ---- credits -----------------------------------------------------------

    /// Stop handing out send credits, e.g. while the consumer is congested
    pub fn block_new_credits(&mut self, blocked: bool) {
        debug!("L2CAP new credits blocked: {}", blocked);
        self.new_credits_blocked = blocked;
    }

    /// Grant one credit to every open channel that used up its credit, as
    /// long as its connection has few packets in flight
    pub fn hand_out_credits(&mut self, hci: &HciEngine) {
        if self.new_credits_blocked {
            return;
        }
        for idx in 0..self.channels.len() {
            if hci.free_acl_slots() == 0 {
                return;
            }
            let channel = &self.channels[idx];
            if !channel.is_open() || channel.packets_granted != 0 {
                continue;
            }
            if hci.number_outgoing_packets(channel.handle) < self.config.buffered_acl_packets {
                self.emit_credits(idx, 1);
            }
        }
    }

    pub fn can_send(&self, hci: &HciEngine, local_cid: u16) -> bool {
        match self.channel(local_cid) {
            Some(channel) => channel.packets_granted > 0 && hci.can_send_acl(),
            None => false,
        }
    }

    /// Send one payload on an open channel, consuming a credit
    pub fn send(&mut self, hci: &mut HciEngine, local_cid: u16, data: &[u8]) -> L2capResult<()> {
        if !hci.can_send_acl() {
            info!("L2CAP send on 0x{:04x}: cannot send now", local_cid);
            return Err(HciError::AclBuffersFull.into());
        }
        let idx = self
            .index_for_local_cid(local_cid)
            .ok_or(L2capError::ChannelNotFound(local_cid))?;
        let channel = &mut self.channels[idx];
        if channel.packets_granted == 0 {
            error!("L2CAP send on 0x{:04x}: no credits", local_cid);
            return Err(L2capError::NoCredits(local_cid));
        }
        if data.len() > channel.remote_mtu as usize {
            return Err(L2capError::MtuExceeded {
                len: data.len(),
                mtu: channel.remote_mtu,
            });
        }

        channel.packets_granted -= 1;
        debug!(
            "L2CAP send on 0x{:04x}, handle 0x{:04x}, credits left {}",
            local_cid, channel.handle, channel.packets_granted
        );
        let handle = channel.handle;
        let packet = l2cap_packet(channel.remote_cid, data);
        let result = hci.send_acl(handle, &packet);

        self.hand_out_credits(hci);
        result.map_err(L2capError::from)
    }

    // ---- channels ----------------------------------------------------------

    /// Open an outgoing channel to `psm` on `address`, creating the
    /// baseband connection if needed. Returns the local CID; the outcome is
    /// reported with [`L2capEvent::ChannelOpened`].
    pub fn create_channel(
        &mut self,
        hci: &HciEngine,
        address: BdAddr,
        psm: u16,
        mtu: u16,
        owner: Owner,
    ) -> L2capResult<u16> {
        info!(
            "L2CAP create channel addr {} psm {} mtu {}",
            address,
            PSM::from(psm),
            mtu
        );
        if self.channels.len() >= self.config.max_channels {
            let dummy = L2capChannel::outgoing(address, psm, 0, mtu, owner);
            self.emit(owner, dummy.opened_event(status::MEMORY_ALLOC_FAILED));
            return Err(L2capError::ResourceLimitReached);
        }

        // limit local mtu to max acl packet length
        let mtu = mtu.min(self.max_mtu(hci));
        let local_cid = self.next_local_cid();
        self.channels
            .push(L2capChannel::outgoing(address, psm, local_cid, mtu, owner));
        Ok(local_cid)
    }

    /// Close a channel. Channels the peer does not know about yet are
    /// dropped right away and reported as failed to open.
    pub fn disconnect(&mut self, local_cid: u16, reason: u8) {
        info!(
            "L2CAP disconnect local_cid 0x{:04x} reason 0x{:02x}",
            local_cid, reason
        );
        let Some(idx) = self.index_for_local_cid(local_cid) else {
            debug!("L2CAP disconnect: no channel 0x{:04x}", local_cid);
            return;
        };
        match self.channels[idx].state {
            state if state.before_signaling() => {
                self.emit_opened(idx, status::CONNECTION_TERMINATED_BY_LOCAL_HOST);
                self.channels.remove(idx);
            }
            L2capChannelState::WillSendDisconnectResponse | L2capChannelState::WaitDisconnect => {}
            _ => self.channels[idx].set_state(L2capChannelState::WillSendDisconnectRequest),
        }
    }

    pub fn accept_connection(&mut self, local_cid: u16) {
        info!("L2CAP accept connection local_cid 0x{:04x}", local_cid);
        match self.index_for_local_cid(local_cid) {
            Some(idx)
                if self.channels[idx].state == L2capChannelState::WaitClientAcceptOrReject =>
            {
                self.channels[idx].set_state(L2capChannelState::WillSendConnectionResponseAccept)
            }
            Some(_) => warn!("L2CAP accept: channel 0x{:04x} not waiting", local_cid),
            None => error!("L2CAP accept: local_cid 0x{:04x} not found", local_cid),
        }
    }

    /// Refuse an incoming channel with the connection response `result`
    pub fn decline_connection(&mut self, local_cid: u16, result: u16) {
        info!(
            "L2CAP decline connection local_cid 0x{:04x}, result 0x{:04x}",
            local_cid, result
        );
        match self.index_for_local_cid(local_cid) {
            Some(idx)
                if self.channels[idx].state == L2capChannelState::WaitClientAcceptOrReject =>
            {
                let channel = &mut self.channels[idx];
                channel.reason = result;
                channel.set_state(L2capChannelState::WillSendConnectionResponseDecline);
            }
            Some(_) => warn!("L2CAP decline: channel 0x{:04x} not waiting", local_cid),
            None => error!("L2CAP decline: local_cid 0x{:04x} not found", local_cid),
        }
    }

    fn finalize_channel_close(&mut self, idx: usize) {
        self.channels[idx].set_state(L2capChannelState::Closed);
        self.emit_closed(idx);
        self.channels.remove(idx);
    }

    fn open_channel(&mut self, idx: usize) {
        self.channels[idx].set_state(L2capChannelState::Open);
        self.emit_opened(idx, status::SUCCESS);
        self.emit_credits(idx, 1);
    }

    // ---- services ----------------------------------------------------------

    pub fn register_service(&mut self, hci: &mut HciEngine, psm: u16, mtu: u16, owner: Owner) {
        info!("L2CAP register service psm {} mtu {}", PSM::from(psm), mtu);

        if self.service(psm).is_some() {
            error!("L2CAP register service: psm 0x{:04x} already registered", psm);
            self.emit(
                owner,
                L2capEvent::ServiceRegistered {
                    status: status::L2CAP_SERVICE_ALREADY_REGISTERED,
                    psm,
                },
            );
            return;
        }
        if self.services.len() >= self.config.max_services {
            error!("L2CAP register service: no room for psm 0x{:04x}", psm);
            self.emit(
                owner,
                L2capEvent::ServiceRegistered {
                    status: status::MEMORY_ALLOC_FAILED,
                    psm,
                },
            );
            return;
        }

        self.services.push(L2capService { psm, mtu, owner });
        // enable page scan
        hci.connectable_control(true);
        self.emit(
            owner,
            L2capEvent::ServiceRegistered {
                status: status::SUCCESS,
                psm,
            },
        );
    }

    pub fn unregister_service(&mut self, hci: &mut HciEngine, psm: u16) {
        info!("L2CAP unregister service psm 0x{:04x}", psm);
        let Some(idx) = self.services.iter().position(|s| s.psm == psm) else {
            return;
        };
        self.services.remove(idx);
        if self.services.is_empty() {
            hci.connectable_control(false);
        }
    }

    /// Disconnect every channel and drop every service of `client`
    pub fn close_client(&mut self, hci: &mut HciEngine, client: ClientId) {
        let owner = Owner::Application(client);
        let cids: Vec<u16> = self
            .channels
            .iter()
            .filter(|c| c.owner == owner)
            .map(|c| c.local_cid)
            .collect();
        for cid in cids {
            self.disconnect(cid, status::REMOTE_USER_TERMINATED_CONNECTION);
        }

        let registered = self.services.len();
        self.services.retain(|s| s.owner != owner);
        if registered > 0 && self.services.is_empty() {
            hci.connectable_control(false);
        }
    }

    // ---- run pass ----------------------------------------------------------

    /// Send pending signaling. Returns whether anything happened.
    pub fn run(&mut self, hci: &mut HciEngine) -> bool {
        let mut progress = false;

        while let Some(response) = self.signaling_responses.front().copied() {
            if !hci.can_send_acl() {
                break;
            }
            if let Some(command) = response_command(&response) {
                send_or_log(hci, response.handle, &command);
            }
            self.signaling_responses.pop_front();
            progress = true;
        }

        let mut idx = 0;
        while idx < self.channels.len() {
            if !hci.can_send_command() || !hci.can_send_acl() {
                break;
            }
            match self.run_channel(hci, idx) {
                ChannelStep::Idle => idx += 1,
                ChannelStep::Progress => {
                    progress = true;
                    idx += 1;
                }
                ChannelStep::Removed => progress = true,
            }
        }

        progress
    }

    fn run_channel(&mut self, hci: &mut HciEngine, idx: usize) -> ChannelStep {
        match self.channels[idx].state {
            L2capChannelState::WillSendCreateConnection => {
                let channel = &mut self.channels[idx];
                channel.set_state(L2capChannelState::WaitConnectionComplete);
                let command = HciCommand::CreateConnection {
                    bd_addr: channel.address,
                    packet_type: hci.usable_acl_packet_types(),
                    page_scan_repetition_mode: 0,
                    clock_offset: 0,
                    allow_role_switch: true,
                };
                if let Err(e) = hci.send_command(&command) {
                    error!("Create connection for channel 0x{:04x} failed: {}", channel.local_cid, e);
                }
                ChannelStep::Progress
            }

            L2capChannelState::WillSendConnectionResponseDecline => {
                let channel = &self.channels[idx];
                let command = SignalingCommand::ConnectionResponse {
                    identifier: channel.remote_sig_id,
                    destination_cid: 0,
                    source_cid: 0,
                    result: channel.reason,
                    status: 0,
                };
                send_or_log(hci, channel.handle, &command);
                // no close event, the owner never accepted the channel
                self.channels.remove(idx);
                ChannelStep::Removed
            }

            L2capChannelState::WillSendConnectionResponseAccept => {
                let channel = &mut self.channels[idx];
                channel.start_config();
                let command = SignalingCommand::ConnectionResponse {
                    identifier: channel.remote_sig_id,
                    destination_cid: channel.local_cid,
                    source_cid: channel.remote_cid,
                    result: L2CAP_CONNECTION_SUCCESSFUL,
                    status: 0,
                };
                send_or_log(hci, channel.handle, &command);
                ChannelStep::Progress
            }

            L2capChannelState::WillSendConnectionRequest => {
                let sig_id = self.next_sig_id();
                let channel = &mut self.channels[idx];
                channel.local_sig_id = sig_id;
                channel.set_state(L2capChannelState::WaitConnectRsp);
                let command = SignalingCommand::ConnectionRequest {
                    identifier: sig_id,
                    psm: channel.psm,
                    source_cid: channel.local_cid,
                };
                send_or_log(hci, channel.handle, &command);
                ChannelStep::Progress
            }

            L2capChannelState::Config => self.run_config(hci, idx),

            L2capChannelState::WillSendDisconnectResponse => {
                let channel = &self.channels[idx];
                let command = SignalingCommand::DisconnectionResponse {
                    identifier: channel.remote_sig_id,
                    destination_cid: channel.local_cid,
                    source_cid: channel.remote_cid,
                };
                send_or_log(hci, channel.handle, &command);
                self.finalize_channel_close(idx);
                ChannelStep::Removed
            }

            L2capChannelState::WillSendDisconnectRequest => {
                let sig_id = self.next_sig_id();
                let channel = &mut self.channels[idx];
                channel.local_sig_id = sig_id;
                channel.set_state(L2capChannelState::WaitDisconnect);
                let command = SignalingCommand::DisconnectionRequest {
                    identifier: sig_id,
                    destination_cid: channel.remote_cid,
                    source_cid: channel.local_cid,
                };
                send_or_log(hci, channel.handle, &command);
                ChannelStep::Progress
            }

            _ => ChannelStep::Idle,
        }
    }

    /// One configuration PDU per pass, the response to the peer first
    fn run_config(&mut self, hci: &mut HciEngine, idx: usize) -> ChannelStep {
        let mut progress = false;

        if self.channels[idx].config.send_conf_rsp {
            let channel = &mut self.channels[idx];
            channel.config.send_conf_rsp = false;
            channel.config.sent_conf_rsp = true;
            let command = SignalingCommand::ConfigureResponse {
                identifier: channel.remote_sig_id,
                source_cid: channel.remote_cid,
                flags: 0,
                result: 0,
                options: ConfigOptions::default(),
            };
            send_or_log(hci, channel.handle, &command);
            progress = true;
        } else if self.channels[idx].config.send_conf_req {
            let sig_id = self.next_sig_id();
            let channel = &mut self.channels[idx];
            channel.config.send_conf_req = false;
            channel.config.sent_conf_req = true;
            channel.local_sig_id = sig_id;
            let command = SignalingCommand::ConfigureRequest {
                identifier: sig_id,
                destination_cid: channel.remote_cid,
                flags: 0,
                options: ConfigOptions {
                    mtu: Some(channel.local_mtu),
                    flush_timeout: None,
                },
            };
            send_or_log(hci, channel.handle, &command);
            progress = true;
        }

        if self.channels[idx].config.ready_for_open() {
            self.open_channel(idx);
            progress = true;
        }

        if progress {
            ChannelStep::Progress
        } else {
            ChannelStep::Idle
        }
    }

    // ---- events from HCI ---------------------------------------------------

    /// React to an event of the HCI engine
    pub fn handle_host_event(&mut self, hci: &mut HciEngine, event: &HostEvent) {
        if let Some((result, handle, address)) = event.connection_complete() {
            if result == status::SUCCESS {
                self.handle_connection_success_for_addr(address, handle);
            } else {
                self.handle_connection_failed_for_addr(address, result);
            }
            return;
        }

        if let Some((handle, _)) = event.disconnection_complete() {
            if handle == INVALID_HANDLE {
                debug!("Disconnection without handle ignored");
                return;
            }
            // the link is gone, every channel on it is closed
            let mut idx = 0;
            while idx < self.channels.len() {
                if self.channels[idx].handle == handle {
                    self.emit_closed(idx);
                    self.channels.remove(idx);
                } else {
                    idx += 1;
                }
            }
            return;
        }

        match event {
            HostEvent::Controller(ControllerEvent::CommandComplete {
                opcode: OPCODE_CREATE_CONNECTION_CANCEL,
                return_parameters,
                ..
            }) => {
                if return_parameters.first() == Some(&status::SUCCESS) {
                    if let Some(address) = return_parameters.get(1..).and_then(BdAddr::from_slice) {
                        self.handle_connection_failed_for_addr(
                            address,
                            status::CONNECTION_TERMINATED_BY_LOCAL_HOST,
                        );
                    }
                }
            }
            HostEvent::Controller(ControllerEvent::NumberOfCompletedPackets { .. }) => {
                self.hand_out_credits(hci);
            }
            HostEvent::TimeoutCheck { handle } => self.handle_timeout_check(hci, *handle),
            HostEvent::AclData { handle, pdu } => self.handle_acl_data(hci, *handle, pdu),
            _ => {}
        }
    }

    fn waiting_for_connection(channel: &L2capChannel, address: &BdAddr) -> bool {
        channel.address == *address
            && matches!(
                channel.state,
                L2capChannelState::WaitConnectionComplete
                    | L2capChannelState::WillSendCreateConnection
            )
    }

    fn handle_connection_success_for_addr(&mut self, address: BdAddr, handle: u16) {
        for channel in self.channels.iter_mut() {
            if Self::waiting_for_connection(channel, &address) {
                channel.handle = handle;
                channel.set_state(L2capChannelState::WillSendConnectionRequest);
            }
        }
    }

    fn handle_connection_failed_for_addr(&mut self, address: BdAddr, result: u8) {
        let mut idx = 0;
        while idx < self.channels.len() {
            if Self::waiting_for_connection(&self.channels[idx], &address) {
                self.emit_opened(idx, result);
                self.channels.remove(idx);
            } else {
                idx += 1;
            }
        }
    }

    /// Disconnect a baseband link nobody uses
    fn handle_timeout_check(&mut self, hci: &mut HciEngine, handle: u16) {
        if hci.authentication_active(handle) {
            return;
        }
        if self.channels.iter().any(|c| c.handle == handle) {
            return;
        }
        if !hci.can_send_command() {
            return;
        }
        info!("Connection 0x{:04x} unused, disconnecting", handle);
        let command = HciCommand::Disconnect {
            handle,
            reason: status::REMOTE_USER_TERMINATED_CONNECTION,
        };
        if let Err(e) = hci.send_command(&command) {
            error!("Disconnect of idle connection 0x{:04x} failed: {}", handle, e);
        }
    }

    fn handle_acl_data(&mut self, hci: &mut HciEngine, handle: u16, pdu: &[u8]) {
        let Some((header, payload)) = split_pdu(pdu) else {
            warn!("L2CAP PDU too short on handle 0x{:04x}", handle);
            return;
        };

        if header.channel_id == L2CAP_CID_SIGNALING {
            for (command_header, params) in split_commands(payload) {
                self.signaling_handler_dispatch(hci, handle, &command_header, params);
            }
            return;
        }

        match self.index_for_local_cid(header.channel_id) {
            Some(idx) if self.channels[idx].handle == handle => {
                let owner = self.channels[idx].owner;
                self.emit(
                    owner,
                    L2capEvent::Data {
                        local_cid: header.channel_id,
                        payload: payload.to_vec(),
                    },
                );
            }
            _ => debug!(
                "L2CAP data for unknown cid 0x{:04x} on handle 0x{:04x}, {} bytes dropped",
                header.channel_id,
                handle,
                payload.len()
            ),
        }
    }

    // ---- signaling ---------------------------------------------------------

    fn register_signaling_response(&mut self, handle: u16, code: u8, sig_id: SignalId, data: u16) {
        let response = SignalingResponse {
            handle,
            code,
            sig_id,
            data,
        };
        if self.signaling_responses.push_back(response).is_err() {
            debug!(
                "Signaling response queue full, dropping response to code 0x{:02x} id {}",
                code, sig_id
            );
        }
    }

    fn signaling_handler_dispatch(
        &mut self,
        hci: &mut HciEngine,
        handle: u16,
        header: &SignalingHeader,
        params: &[u8],
    ) {
        let code = header.code;
        if code < L2CAP_COMMAND_REJECT || code == L2CAP_ECHO_RESPONSE || code > L2CAP_INFORMATION_REQUEST
        {
            trace!("Ignoring signaling code 0x{:02x}", code);
            return;
        }

        let command = match SignalingCommand::parse(header, params) {
            Ok(command) => command,
            Err(e) => {
                warn!("Malformed signaling command on handle 0x{:04x}: {}", handle, e);
                return;
            }
        };

        // requests without a channel
        let destination_cid = match command {
            SignalingCommand::ConnectionRequest {
                identifier,
                psm,
                source_cid,
            } => {
                self.handle_connection_request(hci, handle, identifier, psm, source_cid);
                return;
            }
            SignalingCommand::EchoRequest { identifier, .. } => {
                self.register_signaling_response(handle, code, identifier, 0);
                return;
            }
            SignalingCommand::InformationRequest {
                identifier,
                info_type,
            } => {
                self.register_signaling_response(handle, code, identifier, info_type);
                return;
            }
            SignalingCommand::ConfigureRequest {
                destination_cid, ..
            }
            | SignalingCommand::DisconnectionRequest {
                destination_cid, ..
            } => Some(destination_cid),
            _ => None,
        };

        // responses match our identifier, requests our channel id
        let found = self.channels.iter().position(|c| {
            c.handle == handle
                && if code & 1 == 1 {
                    c.local_sig_id == header.identifier
                } else {
                    Some(c.local_cid) == destination_cid
                }
        });
        match found {
            Some(idx) => self.signaling_handler_channel(hci, idx, command),
            None => debug!(
                "No channel for signaling code 0x{:02x} id {} on handle 0x{:04x}",
                code, header.identifier, handle
            ),
        }
    }

    fn signaling_handler_channel(&mut self, hci: &mut HciEngine, idx: usize, command: SignalingCommand) {
        let state = self.channels[idx].state;
        debug!(
            "L2CAP signaling code 0x{:02x} for channel 0x{:04x} in {}",
            command.command_code(),
            self.channels[idx].local_cid,
            state
        );

        if let SignalingCommand::DisconnectionRequest { identifier, .. } = command {
            if matches!(
                state,
                L2capChannelState::Config
                    | L2capChannelState::Open
                    | L2capChannelState::WillSendDisconnectRequest
                    | L2capChannelState::WaitDisconnect
            ) {
                let channel = &mut self.channels[idx];
                channel.remote_sig_id = identifier;
                channel.set_state(L2capChannelState::WillSendDisconnectResponse);
            }
            return;
        }

        match (state, command) {
            (
                L2capChannelState::WaitConnectRsp,
                SignalingCommand::ConnectionResponse {
                    destination_cid,
                    result,
                    ..
                },
            ) => match result {
                L2CAP_CONNECTION_SUCCESSFUL => {
                    let channel = &mut self.channels[idx];
                    channel.remote_cid = destination_cid;
                    channel.start_config();
                }
                L2CAP_CONNECTION_PENDING => {
                    debug!("L2CAP connection 0x{:04x} pending", self.channels[idx].local_cid);
                }
                _ => {
                    self.channels[idx].set_state(L2capChannelState::Closed);
                    let status = connection_refused_status(result);
                    self.emit_opened(idx, status);
                    if status == status::L2CAP_CONNECTION_RESPONSE_RESULT_REFUSED_SECURITY {
                        let address = self.channels[idx].address;
                        hci.drop_link_key(&address);
                    }
                    self.channels.remove(idx);
                }
            },

            (
                L2capChannelState::Config,
                SignalingCommand::ConfigureRequest {
                    identifier,
                    options,
                    ..
                },
            ) => {
                self.channels[idx].handle_configure_request(identifier, &options);
                self.open_if_configured(idx);
            }

            (L2capChannelState::Config, SignalingCommand::ConfigureResponse { .. }) => {
                self.channels[idx].handle_configure_response();
                self.open_if_configured(idx);
            }

            (L2capChannelState::WaitDisconnect, SignalingCommand::DisconnectionResponse { .. }) => {
                self.finalize_channel_close(idx);
            }

            (state, command) => {
                debug!("Ignoring {:?} in {}", command, state);
            }
        }
    }

    fn open_if_configured(&mut self, idx: usize) {
        if self.channels[idx].config.ready_for_open() {
            self.open_channel(idx);
        }
    }

    fn handle_connection_request(
        &mut self,
        hci: &HciEngine,
        handle: u16,
        sig_id: SignalId,
        psm: u16,
        source_cid: u16,
    ) {
        let Some(service) = self.service(psm).copied() else {
            debug!("Connection request for unregistered psm 0x{:04x}", psm);
            self.register_signaling_response(
                handle,
                L2CAP_CONNECTION_REQUEST,
                sig_id,
                L2CAP_CONNECTION_REFUSED_PSM,
            );
            return;
        };

        let Some(address) = hci.connection(handle).map(|c| c.address) else {
            error!("No baseband connection for handle 0x{:04x}", handle);
            return;
        };

        if self.channels.len() >= self.config.max_channels {
            self.register_signaling_response(
                handle,
                L2CAP_CONNECTION_REQUEST,
                sig_id,
                L2CAP_CONNECTION_REFUSED_RESOURCES,
            );
            return;
        }

        let local_cid = self.next_local_cid();
        let mtu = service.mtu.min(self.max_mtu(hci));
        let channel = L2capChannel::incoming(
            address,
            handle,
            psm,
            local_cid,
            source_cid,
            mtu,
            sig_id,
            service.owner,
        );
        info!(
            "L2CAP incoming connection addr {} handle 0x{:04x} psm {} local_cid 0x{:04x} remote_cid 0x{:04x}",
            address,
            handle,
            PSM::from(psm),
            local_cid,
            source_cid
        );
        self.channels.push(channel);
        self.emit(
            service.owner,
            L2capEvent::IncomingConnection {
                address,
                handle,
                psm,
                local_cid,
                remote_cid: source_cid,
            },
        );
    }
}

/// Status reported for a refused outgoing connection
fn connection_refused_status(result: u16) -> u8 {
    match result {
        L2CAP_CONNECTION_REFUSED_PSM => status::L2CAP_CONNECTION_RESPONSE_RESULT_REFUSED_PSM,
        L2CAP_CONNECTION_REFUSED_SECURITY => {
            status::L2CAP_CONNECTION_RESPONSE_RESULT_REFUSED_SECURITY
        }
        L2CAP_CONNECTION_REFUSED_RESOURCES => {
            status::L2CAP_CONNECTION_RESPONSE_RESULT_REFUSED_RESOURCES
        }
        other => {
            warn!("L2CAP connection refused with unknown result 0x{:04x}", other);
            status::L2CAP_CONNECTION_RESPONSE_RESULT_REFUSED_RESOURCES
        }
    }
}

/// The PDU answering a queued request
fn response_command(response: &SignalingResponse) -> Option<SignalingCommand> {
    let identifier = response.sig_id;
    match response.code {
        L2CAP_CONNECTION_REQUEST => Some(SignalingCommand::ConnectionResponse {
            identifier,
            destination_cid: 0,
            source_cid: 0,
            result: response.data,
            status: 0,
        }),
        L2CAP_ECHO_REQUEST => Some(SignalingCommand::EchoResponse {
            identifier,
            data: Vec::new(),
        }),
        L2CAP_INFORMATION_REQUEST if response.data == L2CAP_INFO_EXTENDED_FEATURES => {
            // extended features supported, but none present
            Some(SignalingCommand::InformationResponse {
                identifier,
                info_type: response.data,
                result: L2CAP_INFO_RESULT_SUCCESS,
                data: vec![0; 4],
            })
        }
        L2CAP_INFORMATION_REQUEST => Some(SignalingCommand::InformationResponse {
            identifier,
            info_type: response.data,
            result: L2CAP_INFO_RESULT_NOT_SUPPORTED,
            data: Vec::new(),
        }),
        _ => None,
    }
}

fn send_signaling(hci: &mut HciEngine, handle: u16, command: &SignalingCommand) -> L2capResult<()> {
    if !hci.can_send_acl() {
        return Err(HciError::AclBuffersFull.into());
    }
    trace!("L2CAP signaling => {:?}", command);
    hci.send_acl(handle, &command.to_pdu())?;
    Ok(())
}

fn send_or_log(hci: &mut HciEngine, handle: u16, command: &SignalingCommand) {
    if let Err(e) = send_signaling(hci, handle, command) {
        error!(
            "Failed to send signaling code 0x{:02x} on handle 0x{:04x}: {}",
            command.command_code(),
            handle,
            e
        );
    }
}
