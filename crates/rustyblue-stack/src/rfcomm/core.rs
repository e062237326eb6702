//! RFCOMM engine
//!
//! Runs the multiplexer sessions and their channels on top of the
//! [`L2capEngine`]. The engine is driven the same way as the layers below it:
//! L2CAP events addressed to RFCOMM are fed into
//! [`RfcommEngine::handle_l2cap_event`], entry points only update state, and
//! [`RfcommEngine::run`] sends the frames the L2CAP credits permit. Results
//! are queued for the application client that owns the channel or service.

use super::channel::{RfcommChannel, RfcommService};
use super::constants::*;
use super::frame::{self, Frame};
use super::messages::{MuxMessage, PnParams};
use super::multiplexer::{max_frame_size_for_mtu, Multiplexer};
use super::types::*;
use crate::config::RfcommConfig;
use crate::error::status;
use crate::gap::BdAddr;
use crate::hci::connection::INVALID_HANDLE;
use crate::hci::HciEngine;
use crate::l2cap::constants::L2CAP_CONNECTION_REFUSED_RESOURCES;
use crate::l2cap::{L2capEngine, L2capEvent, Owner};
use crate::stack::ClientId;
use log::{debug, error, info, trace, warn};
use std::collections::VecDeque;
use std::time::Instant;

/// Frame or control message received for a DLCI
#[derive(Debug, Clone, Copy)]
enum ChannelEvent {
    Sabm,
    Ua,
    Disc,
    Dm,
    Pn(PnParams),
    PnRsp(PnParams),
    MscCmd,
    MscRsp,
    RpnPoll,
    RpnSet(RpnSettings),
}

/// Outcome of one run step for a multiplexer or channel
enum Step {
    Idle,
    Progress,
    Removed,
}

/// RFCOMM engine owning every multiplexer, channel and service
pub struct RfcommEngine {
    config: RfcommConfig,
    multiplexers: Vec<Multiplexer>,
    channels: Vec<RfcommChannel>,
    services: Vec<RfcommService>,
    next_cid: u16,
    events: VecDeque<(ClientId, RfcommEvent)>,
}

impl RfcommEngine {
    pub fn new(config: RfcommConfig) -> Self {
        Self {
            config,
            multiplexers: Vec::new(),
            channels: Vec::new(),
            services: Vec::new(),
            next_cid: 0,
            events: VecDeque::new(),
        }
    }

    /// Next queued event together with the client it is meant for
    pub fn poll_event(&mut self) -> Option<(ClientId, RfcommEvent)> {
        self.events.pop_front()
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    fn emit(&mut self, client: ClientId, event: RfcommEvent) {
        self.events.push_back((client, event));
    }

    fn emit_opened(&mut self, idx: usize, status: u8) {
        let channel = &self.channels[idx];
        let handle = self.handle_for(&channel.address);
        info!(
            "RFCOMM channel opened, status 0x{:02x} addr {} handle 0x{:04x} channel #{} rfcomm_cid {} max frame size {}",
            status,
            channel.address,
            handle,
            channel.server_channel(),
            channel.rfcomm_cid,
            channel.max_frame_size
        );
        let (client, event) = (channel.client, channel.opened_event(status, handle));
        self.emit(client, event);
    }

    fn emit_closed(&mut self, idx: usize) {
        let channel = &self.channels[idx];
        info!("RFCOMM channel closed, rfcomm_cid {}", channel.rfcomm_cid);
        let (client, rfcomm_cid) = (channel.client, channel.rfcomm_cid);
        self.emit(client, RfcommEvent::ChannelClosed { rfcomm_cid });
    }

    /// Report the end of a channel: closed if it was open, failed to open
    /// with `status` while it was being set up
    fn emit_teardown(&mut self, idx: usize, status: u8) {
        match self.channels[idx].state {
            RfcommChannelState::Open => self.emit_closed(idx),
            // never reported to the application
            RfcommChannelState::Closed => {}
            state if state.closing() => {}
            _ => self.emit_opened(idx, status),
        }
    }

    fn emit_service_registered(&mut self, client: ClientId, status: u8, server_channel: u8) {
        info!(
            "RFCOMM service registered, status 0x{:02x} channel #{}",
            status, server_channel
        );
        self.emit(
            client,
            RfcommEvent::ServiceRegistered {
                status,
                server_channel,
            },
        );
    }

    // ---- lookup ------------------------------------------------------------

    fn multiplexer_for_address(&self, address: &BdAddr) -> Option<usize> {
        self.multiplexers.iter().position(|m| m.address == *address)
    }

    fn multiplexer_for_l2cap_cid(&self, l2cap_cid: u16) -> Option<usize> {
        self.multiplexers
            .iter()
            .position(|m| m.l2cap_cid == l2cap_cid)
    }

    fn channel_index(&self, rfcomm_cid: u16) -> Option<usize> {
        self.channels.iter().position(|c| c.rfcomm_cid == rfcomm_cid)
    }

    fn channel_for_dlci(&self, address: &BdAddr, dlci: u8) -> Option<usize> {
        self.channels
            .iter()
            .position(|c| c.address == *address && c.dlci == dlci)
    }

    fn handle_for(&self, address: &BdAddr) -> u16 {
        self.multiplexers
            .iter()
            .find(|m| m.address == *address)
            .map(|m| m.handle)
            .unwrap_or(INVALID_HANDLE)
    }

    pub fn channel(&self, rfcomm_cid: u16) -> Option<&RfcommChannel> {
        self.channels.iter().find(|c| c.rfcomm_cid == rfcomm_cid)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn multiplexer(&self, address: &BdAddr) -> Option<&Multiplexer> {
        self.multiplexers.iter().find(|m| m.address == *address)
    }

    pub fn multiplexer_count(&self) -> usize {
        self.multiplexers.len()
    }

    pub fn service(&self, server_channel: u8) -> Option<&RfcommService> {
        self.services
            .iter()
            .find(|s| s.server_channel == server_channel)
    }

    fn next_cid(&mut self) -> u16 {
        loop {
            self.next_cid = self.next_cid.wrapping_add(1);
            if self.next_cid == 0 {
                continue;
            }
            if self.channel_index(self.next_cid).is_none() {
                return self.next_cid;
            }
        }
    }

    // ---- credits -----------------------------------------------------------

    /// Let the application send on every open channel that used up its
    /// packet, as long as the peer granted credits and L2CAP can send
    fn hand_out_credits(&mut self, l2cap: &L2capEngine, hci: &HciEngine) {
        for idx in 0..self.channels.len() {
            let channel = &self.channels[idx];
            if !channel.is_open() || channel.packets_granted != 0 || channel.credits_outgoing == 0
            {
                continue;
            }
            let Some(mux) = self.multiplexers.iter().find(|m| m.address == channel.address)
            else {
                continue;
            };
            if !l2cap.can_send(hci, mux.l2cap_cid) {
                continue;
            }
            let channel = &mut self.channels[idx];
            channel.packets_granted += 1;
            trace!("RFCOMM credits rfcomm_cid {} credits 1", channel.rfcomm_cid);
            let (client, rfcomm_cid) = (channel.client, channel.rfcomm_cid);
            self.emit(
                client,
                RfcommEvent::Credits {
                    rfcomm_cid,
                    credits: 1,
                },
            );
        }
    }

    /// Send one payload on an open channel, consuming an outgoing credit and
    /// the packet granted to the application
    pub fn send(
        &mut self,
        l2cap: &mut L2capEngine,
        hci: &mut HciEngine,
        rfcomm_cid: u16,
        data: &[u8],
    ) -> RfcommResult<()> {
        let idx = self
            .channel_index(rfcomm_cid)
            .ok_or(RfcommError::ChannelNotFound(rfcomm_cid))?;
        let channel = &self.channels[idx];
        if channel.credits_outgoing == 0 {
            info!("RFCOMM send on {}: no outgoing credits", rfcomm_cid);
            return Err(RfcommError::NoOutgoingCredits(rfcomm_cid));
        }
        if channel.packets_granted == 0 {
            info!("RFCOMM send on {}: no packet granted", rfcomm_cid);
            return Err(RfcommError::NoOutgoingCredits(rfcomm_cid));
        }
        if data.len() > channel.max_frame_size as usize {
            return Err(RfcommError::FrameTooLarge {
                len: data.len(),
                max: channel.max_frame_size,
            });
        }
        let mux = self
            .multiplexers
            .iter()
            .find(|m| m.address == channel.address)
            .ok_or(RfcommError::ChannelNotFound(rfcomm_cid))?;

        send_frame(
            l2cap,
            hci,
            mux.l2cap_cid,
            mux.command_address(channel.dlci),
            RFCOMM_UIH,
            0,
            data,
        )?;

        let channel = &mut self.channels[idx];
        channel.credits_outgoing -= 1;
        channel.packets_granted -= 1;
        debug!(
            "RFCOMM sent {} bytes on {}, credits left {}",
            data.len(),
            rfcomm_cid,
            channel.credits_outgoing
        );
        self.hand_out_credits(l2cap, hci);
        Ok(())
    }

    /// Grant the peer `credits` more frames on a channel with incoming flow
    /// control
    pub fn grant_credits(&mut self, rfcomm_cid: u16, credits: u8) {
        let Some(idx) = self.channel_index(rfcomm_cid) else {
            debug!("RFCOMM grant credits: no channel {}", rfcomm_cid);
            return;
        };
        let channel = &mut self.channels[idx];
        if !channel.incoming_flow_control {
            debug!("RFCOMM grant credits: channel {} uses automatic credits", rfcomm_cid);
            return;
        }
        channel.new_credits_incoming = channel.new_credits_incoming.saturating_add(credits);
    }

    // ---- channels ----------------------------------------------------------

    /// Open a channel to `server_channel` on `address`, granting the peer
    /// credits automatically. Returns the RFCOMM channel id; the outcome is
    /// reported with [`RfcommEvent::ChannelOpened`].
    pub fn create_channel(
        &mut self,
        l2cap: &mut L2capEngine,
        hci: &HciEngine,
        address: BdAddr,
        server_channel: u8,
        client: ClientId,
    ) -> RfcommResult<u16> {
        let credits = self.config.default_initial_credits;
        self.create_channel_internal(l2cap, hci, address, server_channel, false, credits, client)
    }

    /// Like [`create_channel`](Self::create_channel), but the application
    /// grants incoming credits itself, starting with `initial_credits`
    pub fn create_channel_with_initial_credits(
        &mut self,
        l2cap: &mut L2capEngine,
        hci: &HciEngine,
        address: BdAddr,
        server_channel: u8,
        initial_credits: u8,
        client: ClientId,
    ) -> RfcommResult<u16> {
        self.create_channel_internal(
            l2cap,
            hci,
            address,
            server_channel,
            true,
            initial_credits,
            client,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn create_channel_internal(
        &mut self,
        l2cap: &mut L2capEngine,
        hci: &HciEngine,
        address: BdAddr,
        server_channel: u8,
        incoming_flow_control: bool,
        initial_credits: u8,
        client: ClientId,
    ) -> RfcommResult<u16> {
        info!(
            "RFCOMM create channel addr {} channel #{} flow control {} credits {}",
            address, server_channel, incoming_flow_control, initial_credits
        );

        let (mux_idx, new_mux) = match self.multiplexer_for_address(&address) {
            Some(idx) => (idx, false),
            None => {
                if self.multiplexers.len() >= self.config.max_multiplexers {
                    return self.open_failed(address, server_channel, client);
                }
                let frame_size = max_frame_size_for_mtu(l2cap.max_mtu(hci));
                self.multiplexers
                    .push(Multiplexer::outgoing(address, frame_size));
                (self.multiplexers.len() - 1, true)
            }
        };

        if self.channels.len() >= self.config.max_channels {
            if new_mux {
                self.multiplexers.remove(mux_idx);
            }
            return self.open_failed(address, server_channel, client);
        }

        let rfcomm_cid = self.next_cid();
        let mux = &mut self.multiplexers[mux_idx];
        mux.idle_deadline = None;
        let mut channel = RfcommChannel::outgoing(
            rfcomm_cid,
            address,
            mux.outgoing_dlci(server_channel),
            mux.max_frame_size,
            incoming_flow_control,
            initial_credits,
            client,
        );
        if mux.is_open() {
            channel.set_state(RfcommChannelState::SendUihPn);
        } else {
            channel.set_state(RfcommChannelState::W4Multiplexer);
        }
        self.channels.push(channel);

        if new_mux {
            let mtu = l2cap.max_mtu(hci);
            match l2cap.create_channel(hci, address, RFCOMM_PSM, mtu, Owner::Rfcomm) {
                Ok(l2cap_cid) => self.multiplexers[mux_idx].l2cap_cid = l2cap_cid,
                // reported through the failed channel-opened event
                Err(e) => warn!("RFCOMM L2CAP channel to {} failed: {}", address, e),
            }
        }
        Ok(rfcomm_cid)
    }

    fn open_failed(
        &mut self,
        address: BdAddr,
        server_channel: u8,
        client: ClientId,
    ) -> RfcommResult<u16> {
        error!(
            "RFCOMM create channel to {} channel #{}: out of resources",
            address, server_channel
        );
        self.emit(
            client,
            RfcommEvent::ChannelOpened {
                status: status::MEMORY_ALLOC_FAILED,
                address,
                handle: INVALID_HANDLE,
                server_channel,
                rfcomm_cid: 0,
                max_frame_size: 0,
            },
        );
        Err(RfcommError::ResourceLimitReached)
    }

    /// Close a channel. Channels still waiting for their multiplexer are
    /// dropped right away and reported as failed to open.
    pub fn disconnect(&mut self, rfcomm_cid: u16) {
        info!("RFCOMM disconnect rfcomm_cid {}", rfcomm_cid);
        let Some(idx) = self.channel_index(rfcomm_cid) else {
            debug!("RFCOMM disconnect: no channel {}", rfcomm_cid);
            return;
        };
        match self.channels[idx].state {
            RfcommChannelState::Closed => self.finalize_channel(idx),
            RfcommChannelState::W4Multiplexer | RfcommChannelState::SendUihPn => {
                self.emit_opened(idx, status::CONNECTION_TERMINATED_BY_LOCAL_HOST);
                self.finalize_channel(idx);
            }
            RfcommChannelState::IncomingSetup => {
                self.channels[idx].set_state(RfcommChannelState::SendDm)
            }
            state if state.closing() => {}
            _ => {
                self.emit_teardown(idx, status::CONNECTION_TERMINATED_BY_LOCAL_HOST);
                self.channels[idx].set_state(RfcommChannelState::SendDisc);
            }
        }
    }

    pub fn accept_connection(&mut self, rfcomm_cid: u16) {
        info!("RFCOMM accept connection rfcomm_cid {}", rfcomm_cid);
        let Some(idx) = self.channel_index(rfcomm_cid) else {
            error!("RFCOMM accept: channel {} not found", rfcomm_cid);
            return;
        };
        let channel = &mut self.channels[idx];
        if channel.state != RfcommChannelState::IncomingSetup {
            warn!("RFCOMM accept: channel {} not waiting", rfcomm_cid);
            return;
        }
        channel.flags.client_accepted = true;
        if channel.flags.rcvd_pn {
            channel.flags.send_pn_rsp = true;
        }
        if channel.flags.rcvd_sabm {
            channel.flags.send_ua = true;
        }
    }

    pub fn decline_connection(&mut self, rfcomm_cid: u16) {
        info!("RFCOMM decline connection rfcomm_cid {}", rfcomm_cid);
        match self.channel_index(rfcomm_cid) {
            Some(idx) if self.channels[idx].state == RfcommChannelState::IncomingSetup => {
                self.channels[idx].set_state(RfcommChannelState::SendDm)
            }
            Some(_) => warn!("RFCOMM decline: channel {} not waiting", rfcomm_cid),
            None => error!("RFCOMM decline: channel {} not found", rfcomm_cid),
        }
    }

    fn finalize_channel(&mut self, idx: usize) {
        let channel = self.channels.remove(idx);
        debug!("RFCOMM channel {} released", channel.rfcomm_cid);
        if let Some(mux_idx) = self.multiplexer_for_address(&channel.address) {
            self.prepare_idle_timer(mux_idx);
        }
    }

    fn open_if_ready(&mut self, l2cap: &L2capEngine, hci: &HciEngine, idx: usize) {
        if !self.channels[idx].ready_for_open() {
            return;
        }
        self.channels[idx].set_state(RfcommChannelState::Open);
        self.emit_opened(idx, status::SUCCESS);
        let address = self.channels[idx].address;
        if let Some(mux_idx) = self.multiplexer_for_address(&address) {
            let mux = &mut self.multiplexers[mux_idx];
            mux.idle_deadline = None;
        }
        self.hand_out_credits(l2cap, hci);
    }

    // ---- services ----------------------------------------------------------

    pub fn register_service(
        &mut self,
        l2cap: &mut L2capEngine,
        hci: &mut HciEngine,
        service: RfcommService,
    ) {
        info!(
            "RFCOMM register service channel #{} max frame size {} flow control {} credits {}",
            service.server_channel,
            service.max_frame_size,
            service.incoming_flow_control,
            service.initial_credits
        );
        let (client, server_channel) = (service.client, service.server_channel);

        if self.service(server_channel).is_some() {
            error!("RFCOMM register service: channel #{} already registered", server_channel);
            self.emit_service_registered(
                client,
                status::RFCOMM_CHANNEL_ALREADY_REGISTERED,
                server_channel,
            );
            return;
        }
        if self.services.len() >= self.config.max_services {
            self.emit_service_registered(client, status::MEMORY_ALLOC_FAILED, server_channel);
            return;
        }

        if self.services.is_empty() {
            l2cap.register_service(hci, RFCOMM_PSM, RFCOMM_L2CAP_SERVICE_MTU, Owner::Rfcomm);
        }
        self.services.push(service);
        self.emit_service_registered(client, status::SUCCESS, server_channel);
    }

    pub fn unregister_service(
        &mut self,
        l2cap: &mut L2capEngine,
        hci: &mut HciEngine,
        server_channel: u8,
    ) {
        info!("RFCOMM unregister service channel #{}", server_channel);
        let Some(idx) = self
            .services
            .iter()
            .position(|s| s.server_channel == server_channel)
        else {
            return;
        };
        self.services.remove(idx);
        if self.services.is_empty() {
            l2cap.unregister_service(hci, RFCOMM_PSM);
        }
    }

    /// Disconnect every channel and drop every service of `client`
    pub fn close_client(&mut self, l2cap: &mut L2capEngine, hci: &mut HciEngine, client: ClientId) {
        let cids: Vec<u16> = self
            .channels
            .iter()
            .filter(|c| c.client == client)
            .map(|c| c.rfcomm_cid)
            .collect();
        for cid in cids {
            self.disconnect(cid);
        }

        let registered = self.services.len();
        self.services.retain(|s| s.client != client);
        if registered > 0 && self.services.is_empty() {
            l2cap.unregister_service(hci, RFCOMM_PSM);
        }
    }

    // ---- multiplexers ------------------------------------------------------

    /// Arm the idle timer of a multiplexer without channels, stop it
    /// otherwise
    fn prepare_idle_timer(&mut self, mux_idx: usize) {
        let address = self.multiplexers[mux_idx].address;
        let idle = !self.channels.iter().any(|c| c.address == address);
        let timeout = self.config.multiplexer_timeout;
        let mux = &mut self.multiplexers[mux_idx];
        if !idle {
            mux.idle_deadline = None;
        } else if mux.idle_deadline.is_none() {
            debug!("RFCOMM multiplexer {} idle, timer armed", address);
            mux.idle_deadline = Some(Instant::now() + timeout);
        }
    }

    fn multiplexer_opened(&mut self, mux_idx: usize) {
        let mux = &mut self.multiplexers[mux_idx];
        info!("RFCOMM multiplexer {} open", mux.address);
        mux.set_state(MultiplexerState::Open);
        let address = mux.address;
        for channel in self.channels.iter_mut().filter(|c| c.address == address) {
            if channel.state == RfcommChannelState::W4Multiplexer {
                channel.set_state(RfcommChannelState::SendUihPn);
            }
        }
        self.prepare_idle_timer(mux_idx);
    }

    /// Tear down a multiplexer with all its channels and release its L2CAP
    /// channel
    fn finalize_multiplexer(&mut self, l2cap: &mut L2capEngine, mux_idx: usize) {
        let address = self.multiplexers[mux_idx].address;
        info!("RFCOMM multiplexer {} closed", address);
        let mut idx = 0;
        while idx < self.channels.len() {
            if self.channels[idx].address == address {
                self.emit_teardown(idx, status::RFCOMM_MULTIPLEXER_STOPPED);
                self.channels.remove(idx);
            } else {
                idx += 1;
            }
        }
        let mux = self.multiplexers.remove(mux_idx);
        l2cap.disconnect(mux.l2cap_cid, status::REMOTE_USER_TERMINATED_CONNECTION);
    }

    // ---- timers ------------------------------------------------------------

    /// Earliest multiplexer idle deadline
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.multiplexers.iter().filter_map(|m| m.idle_deadline).min()
    }

    /// Close the multiplexers whose idle timer expired
    pub fn handle_timeout(&mut self, l2cap: &mut L2capEngine, now: Instant) {
        let mut idx = 0;
        while idx < self.multiplexers.len() {
            match self.multiplexers[idx].idle_deadline {
                Some(at) if at <= now => {
                    let mux = &mut self.multiplexers[idx];
                    mux.idle_deadline = None;
                    let address = mux.address;
                    if self.channels.iter().any(|c| c.address == address) {
                        idx += 1;
                        continue;
                    }
                    info!("RFCOMM multiplexer {} idle timeout", address);
                    if self.multiplexers[idx].is_open() {
                        self.multiplexers[idx].set_state(MultiplexerState::SendDisc0);
                        idx += 1;
                    } else {
                        self.finalize_multiplexer(l2cap, idx);
                    }
                }
                _ => idx += 1,
            }
        }
    }

    // ---- run pass ----------------------------------------------------------

    /// Send pending frames. Returns whether anything happened.
    pub fn run(&mut self, l2cap: &mut L2capEngine, hci: &mut HciEngine) -> bool {
        let mut progress = false;

        let mut idx = 0;
        while idx < self.multiplexers.len() {
            if !l2cap.can_send(hci, self.multiplexers[idx].l2cap_cid) {
                idx += 1;
                continue;
            }
            match self.run_multiplexer(l2cap, hci, idx) {
                Step::Idle => idx += 1,
                Step::Progress => {
                    progress = true;
                    idx += 1;
                }
                Step::Removed => progress = true,
            }
        }

        let mut idx = 0;
        while idx < self.channels.len() {
            let ready = match self.multiplexer_for_address(&self.channels[idx].address) {
                Some(mux_idx) => {
                    let mux = &self.multiplexers[mux_idx];
                    mux.is_open() && l2cap.can_send(hci, mux.l2cap_cid)
                }
                None => false,
            };
            if !ready {
                idx += 1;
                continue;
            }
            match self.run_channel(l2cap, hci, idx) {
                Step::Idle => idx += 1,
                Step::Progress => {
                    progress = true;
                    idx += 1;
                }
                Step::Removed => progress = true,
            }
        }

        progress
    }

    fn run_multiplexer(&mut self, l2cap: &mut L2capEngine, hci: &mut HciEngine, idx: usize) -> Step {
        let mux = self.multiplexers[idx].clone();

        if let Some(dlci) = mux.send_dm_for_dlci {
            self.multiplexers[idx].send_dm_for_dlci = None;
            debug!("RFCOMM sending DM for dlci {}", dlci);
            send_or_log(l2cap, hci, &mux, mux.response_address(dlci), RFCOMM_DM_PF, 0, &[]);
            return Step::Progress;
        }

        match mux.state {
            MultiplexerState::SendSabm0 => {
                self.multiplexers[idx].set_state(MultiplexerState::W4Ua0);
                let address = mux.command_address(RFCOMM_DLCI_CONTROL);
                send_or_log(l2cap, hci, &mux, address, RFCOMM_SABM, 0, &[]);
                Step::Progress
            }
            MultiplexerState::SendUa0 => {
                let address = mux.response_address(RFCOMM_DLCI_CONTROL);
                send_or_log(l2cap, hci, &mux, address, RFCOMM_UA, 0, &[]);
                self.multiplexer_opened(idx);
                Step::Progress
            }
            MultiplexerState::SendUa0AndDisc => {
                let address = mux.response_address(RFCOMM_DLCI_CONTROL);
                send_or_log(l2cap, hci, &mux, address, RFCOMM_UA, 0, &[]);
                self.finalize_multiplexer(l2cap, idx);
                Step::Removed
            }
            MultiplexerState::SendDisc0 => {
                let address = mux.command_address(RFCOMM_DLCI_CONTROL);
                send_or_log(l2cap, hci, &mux, address, RFCOMM_DISC, 0, &[]);
                self.finalize_multiplexer(l2cap, idx);
                Step::Removed
            }
            _ => Step::Idle,
        }
    }

    fn run_channel(&mut self, l2cap: &mut L2capEngine, hci: &mut HciEngine, idx: usize) -> Step {
        let Some(mux) = self
            .multiplexers
            .iter()
            .find(|m| m.address == self.channels[idx].address)
            .cloned()
        else {
            return Step::Idle;
        };
        let channel = &mut self.channels[idx];
        let dlci = channel.dlci;

        if channel.flags.send_rpn_rsp {
            channel.flags.send_rpn_rsp = false;
            let message = MuxMessage::RemotePortNegotiation {
                command: false,
                dlci,
                settings: Some(channel.rpn),
            };
            send_message(l2cap, hci, &mux, &message);
            return Step::Progress;
        }

        match channel.state {
            RfcommChannelState::IncomingSetup => {
                let mut progress = false;
                if channel.flags.send_pn_rsp {
                    channel.flags.send_pn_rsp = false;
                    let message =
                        MuxMessage::pn_response(dlci, channel.pn_priority, channel.max_frame_size);
                    send_message(l2cap, hci, &mux, &message);
                    progress = true;
                } else if channel.flags.send_ua {
                    channel.flags.send_ua = false;
                    send_or_log(l2cap, hci, &mux, mux.response_address(dlci), RFCOMM_UA, 0, &[]);
                    progress = true;
                }
                if channel.incoming_setup_done() {
                    channel.flags.send_msc_cmd = true;
                    channel.flags.send_credits = true;
                    channel.set_state(RfcommChannelState::DlcSetup);
                    progress = true;
                }
                if progress {
                    Step::Progress
                } else {
                    Step::Idle
                }
            }

            RfcommChannelState::SendUihPn => {
                channel.set_state(RfcommChannelState::W4PnRsp);
                let message = MuxMessage::pn_command(dlci, channel.max_frame_size);
                send_message(l2cap, hci, &mux, &message);
                Step::Progress
            }

            RfcommChannelState::SendSabmW4Ua => {
                channel.set_state(RfcommChannelState::W4Ua);
                send_or_log(l2cap, hci, &mux, mux.command_address(dlci), RFCOMM_SABM, 0, &[]);
                Step::Progress
            }

            RfcommChannelState::DlcSetup => {
                if channel.flags.send_msc_cmd {
                    channel.flags.send_msc_cmd = false;
                    channel.flags.sent_msc_cmd = true;
                    send_message(l2cap, hci, &mux, &MuxMessage::msc(true, dlci));
                } else if channel.flags.send_msc_rsp {
                    channel.flags.send_msc_rsp = false;
                    channel.flags.sent_msc_rsp = true;
                    send_message(l2cap, hci, &mux, &MuxMessage::msc(false, dlci));
                } else if channel.flags.send_credits {
                    channel.flags.send_credits = false;
                    channel.flags.sent_credits = true;
                    if channel.new_credits_incoming > 0 {
                        send_credits(l2cap, hci, &mux, channel);
                    }
                } else {
                    return Step::Idle;
                }
                self.open_if_ready(l2cap, hci, idx);
                Step::Progress
            }

            RfcommChannelState::Open => {
                if channel.flags.send_msc_rsp {
                    channel.flags.send_msc_rsp = false;
                    send_message(l2cap, hci, &mux, &MuxMessage::msc(false, dlci));
                } else if channel.new_credits_incoming > 0 {
                    send_credits(l2cap, hci, &mux, channel);
                } else {
                    return Step::Idle;
                }
                Step::Progress
            }

            RfcommChannelState::SendDm => {
                channel.set_state(RfcommChannelState::Closed);
                send_or_log(l2cap, hci, &mux, mux.response_address(dlci), RFCOMM_DM_PF, 0, &[]);
                self.finalize_channel(idx);
                Step::Removed
            }

            RfcommChannelState::SendDisc => {
                send_or_log(l2cap, hci, &mux, mux.command_address(dlci), RFCOMM_DISC, 0, &[]);
                self.finalize_channel(idx);
                Step::Removed
            }

            RfcommChannelState::SendUaAfterDisc => {
                send_or_log(l2cap, hci, &mux, mux.response_address(dlci), RFCOMM_UA, 0, &[]);
                self.finalize_channel(idx);
                Step::Removed
            }

            _ => Step::Idle,
        }
    }

    // ---- events from L2CAP -------------------------------------------------

    /// React to an event of the L2CAP engine addressed to RFCOMM
    pub fn handle_l2cap_event(
        &mut self,
        l2cap: &mut L2capEngine,
        hci: &mut HciEngine,
        event: L2capEvent,
    ) {
        match event {
            L2capEvent::IncomingConnection {
                address,
                handle,
                psm,
                local_cid,
                ..
            } if psm == RFCOMM_PSM => {
                self.handle_incoming_l2cap(l2cap, hci, address, handle, local_cid)
            }
            L2capEvent::ChannelOpened {
                status,
                address,
                handle,
                psm,
                local_cid,
                local_mtu,
                remote_mtu,
                ..
            } if psm == RFCOMM_PSM => {
                self.handle_l2cap_opened(status, address, handle, local_cid, local_mtu.min(remote_mtu))
            }
            L2capEvent::ChannelClosed { local_cid } => {
                if let Some(mux_idx) = self.multiplexer_for_l2cap_cid(local_cid) {
                    self.finalize_multiplexer(l2cap, mux_idx);
                }
            }
            L2capEvent::Credits { .. } => self.hand_out_credits(l2cap, hci),
            L2capEvent::ServiceRegistered { status, .. } => {
                if status != status::SUCCESS {
                    warn!("RFCOMM L2CAP service registration failed, status 0x{:02x}", status);
                }
            }
            L2capEvent::Data { local_cid, payload } => {
                self.handle_l2cap_data(l2cap, hci, local_cid, &payload)
            }
            other => debug!("RFCOMM ignoring {:?}", other),
        }
    }

    fn handle_incoming_l2cap(
        &mut self,
        l2cap: &mut L2capEngine,
        hci: &HciEngine,
        address: BdAddr,
        handle: u16,
        local_cid: u16,
    ) {
        if self.multiplexer_for_address(&address).is_some() {
            info!("RFCOMM multiplexer for {} exists, declining", address);
            l2cap.decline_connection(local_cid, L2CAP_CONNECTION_REFUSED_RESOURCES);
            return;
        }
        if self.multiplexers.len() >= self.config.max_multiplexers {
            info!("RFCOMM no multiplexer available for {}, declining", address);
            l2cap.decline_connection(local_cid, L2CAP_CONNECTION_REFUSED_RESOURCES);
            return;
        }
        info!("RFCOMM incoming multiplexer from {}", address);
        let frame_size = max_frame_size_for_mtu(l2cap.max_mtu(hci));
        self.multiplexers
            .push(Multiplexer::incoming(address, handle, local_cid, frame_size));
        l2cap.accept_connection(local_cid);
    }

    fn handle_l2cap_opened(
        &mut self,
        status: u8,
        address: BdAddr,
        handle: u16,
        local_cid: u16,
        mtu: u16,
    ) {
        let Some(mux_idx) = self.multiplexer_for_address(&address) else {
            debug!("RFCOMM L2CAP channel opened for {} without multiplexer", address);
            return;
        };

        if status != status::SUCCESS {
            info!(
                "RFCOMM L2CAP channel to {} failed, status 0x{:02x}",
                address, status
            );
            let mut idx = 0;
            while idx < self.channels.len() {
                if self.channels[idx].address == address {
                    self.emit_teardown(idx, status);
                    self.channels.remove(idx);
                } else {
                    idx += 1;
                }
            }
            self.multiplexers.remove(mux_idx);
            return;
        }

        let mux = &mut self.multiplexers[mux_idx];
        mux.handle = handle;
        mux.l2cap_cid = local_cid;
        mux.limit_frame_size(mtu);
        let frame_size = mux.max_frame_size;
        if mux.state == MultiplexerState::W4Connect {
            mux.set_state(MultiplexerState::SendSabm0);
        }
        for channel in self.channels.iter_mut().filter(|c| c.address == address) {
            channel.max_frame_size = channel.max_frame_size.min(frame_size);
        }
    }

    fn handle_l2cap_data(
        &mut self,
        l2cap: &mut L2capEngine,
        hci: &mut HciEngine,
        l2cap_cid: u16,
        payload: &[u8],
    ) {
        let Some(mux_idx) = self.multiplexer_for_l2cap_cid(l2cap_cid) else {
            debug!("RFCOMM data on L2CAP 0x{:04x} without multiplexer", l2cap_cid);
            return;
        };
        trace!("RFCOMM <= {}", hex::encode(payload));
        let frame = match Frame::parse(payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("RFCOMM dropping frame: {}", e);
                return;
            }
        };

        let dlci = frame.dlci();
        if dlci == RFCOMM_DLCI_CONTROL && self.handle_multiplexer_frame(l2cap, mux_idx, &frame) {
            return;
        }
        if !self.multiplexers[mux_idx].is_open() {
            debug!(
                "RFCOMM frame 0x{:02x} for dlci {} before multiplexer is open",
                frame.control, dlci
            );
            return;
        }
        if dlci != RFCOMM_DLCI_CONTROL && frame.is_uih() {
            self.handle_channel_data(l2cap, hci, mux_idx, &frame);
            return;
        }
        self.handle_channel_frame(l2cap, hci, mux_idx, &frame);
    }

    /// Control frames on DLCI 0. Returns whether the frame was consumed.
    fn handle_multiplexer_frame(
        &mut self,
        l2cap: &mut L2capEngine,
        mux_idx: usize,
        frame: &Frame<'_>,
    ) -> bool {
        let state = self.multiplexers[mux_idx].state;
        match frame.control {
            RFCOMM_SABM if state == MultiplexerState::W4Sabm0 => {
                self.multiplexers[mux_idx].set_state(MultiplexerState::SendUa0);
                true
            }
            RFCOMM_UA if state == MultiplexerState::W4Ua0 => {
                self.multiplexer_opened(mux_idx);
                true
            }
            RFCOMM_DISC => {
                self.multiplexers[mux_idx].set_state(MultiplexerState::SendUa0AndDisc);
                true
            }
            RFCOMM_DM | RFCOMM_DM_PF => {
                self.finalize_multiplexer(l2cap, mux_idx);
                true
            }
            _ if frame.is_uih() => {
                if let Ok(MuxMessage::CloseDown { .. }) = MuxMessage::parse(frame.payload) {
                    info!("RFCOMM close down from {}", self.multiplexers[mux_idx].address);
                    self.finalize_multiplexer(l2cap, mux_idx);
                    return true;
                }
                false
            }
            _ => false,
        }
    }

    /// UIH frame on a channel: credits and payload
    fn handle_channel_data(
        &mut self,
        l2cap: &L2capEngine,
        hci: &HciEngine,
        mux_idx: usize,
        frame: &Frame<'_>,
    ) {
        let address = self.multiplexers[mux_idx].address;
        let Some(idx) = self.channel_for_dlci(&address, frame.dlci()) else {
            debug!("RFCOMM data for unknown dlci {}", frame.dlci());
            return;
        };
        if self.channels[idx].state.closing() {
            debug!(
                "RFCOMM channel {} closing, dropping {} bytes",
                self.channels[idx].rfcomm_cid,
                frame.payload.len()
            );
            return;
        }

        if let Some(credits) = frame.credits {
            let channel = &mut self.channels[idx];
            channel.credits_outgoing = channel.credits_outgoing.saturating_add(credits.into());
            debug!(
                "RFCOMM channel {} received {} credits, now {}",
                channel.rfcomm_cid, credits, channel.credits_outgoing
            );
            if channel.is_open() {
                let (client, rfcomm_cid) = (channel.client, channel.rfcomm_cid);
                self.emit(client, RfcommEvent::RemoteCredits { rfcomm_cid });
            }
            self.open_if_ready(l2cap, hci, idx);
        }

        if !frame.payload.is_empty() {
            let channel = &mut self.channels[idx];
            channel.credits_incoming = channel.credits_incoming.saturating_sub(1);
            let (client, rfcomm_cid) = (channel.client, channel.rfcomm_cid);
            self.emit(
                client,
                RfcommEvent::Data {
                    rfcomm_cid,
                    payload: frame.payload.to_vec(),
                },
            );
        }

        let (low, credits) = (
            self.config.credit_low_watermark,
            self.config.default_initial_credits,
        );
        self.channels[idx].replenish_incoming_credits(low, credits);
        self.hand_out_credits(l2cap, hci);
    }

    /// Control frames for a channel and multiplexer messages on DLCI 0
    fn handle_channel_frame(
        &mut self,
        l2cap: &mut L2capEngine,
        hci: &mut HciEngine,
        mux_idx: usize,
        frame: &Frame<'_>,
    ) {
        let dlci = frame.dlci();
        let target = match frame.control {
            _ if dlci == RFCOMM_DLCI_CONTROL && !frame.is_uih() => {
                debug!("RFCOMM ignoring control 0x{:02x} on dlci 0", frame.control);
                None
            }
            RFCOMM_SABM => Some((dlci, ChannelEvent::Sabm)),
            RFCOMM_UA => Some((dlci, ChannelEvent::Ua)),
            RFCOMM_DISC => Some((dlci, ChannelEvent::Disc)),
            RFCOMM_DM | RFCOMM_DM_PF => Some((dlci, ChannelEvent::Dm)),
            _ if frame.is_uih() => match MuxMessage::parse(frame.payload) {
                Ok(MuxMessage::ParameterNegotiation { command, params }) => {
                    let event = if command {
                        ChannelEvent::Pn(params)
                    } else {
                        ChannelEvent::PnRsp(params)
                    };
                    Some((params.dlci, event))
                }
                Ok(MuxMessage::ModemStatus { command, dlci, .. }) => {
                    let event = if command {
                        ChannelEvent::MscCmd
                    } else {
                        ChannelEvent::MscRsp
                    };
                    Some((dlci, event))
                }
                Ok(MuxMessage::RemotePortNegotiation {
                    command: true,
                    dlci,
                    settings,
                }) => {
                    let event = match settings {
                        Some(settings) => ChannelEvent::RpnSet(settings),
                        None => ChannelEvent::RpnPoll,
                    };
                    Some((dlci, event))
                }
                Ok(message) => {
                    debug!("RFCOMM ignoring {:?}", message);
                    None
                }
                Err(e) => {
                    warn!("RFCOMM dropping multiplexer message: {}", e);
                    None
                }
            },
            control => {
                warn!("RFCOMM unexpected control 0x{:02x}", control);
                None
            }
        };

        if let Some((dlci, event)) = target {
            self.dispatch_channel_event(l2cap, hci, mux_idx, dlci, event);
        }
    }

    /// Route an event to the channel of `dlci`, creating an incoming channel
    /// for a registered service or answering with DM
    fn dispatch_channel_event(
        &mut self,
        l2cap: &mut L2capEngine,
        hci: &mut HciEngine,
        mux_idx: usize,
        dlci: u8,
        event: ChannelEvent,
    ) {
        let address = self.multiplexers[mux_idx].address;
        if let Some(idx) = self.channel_for_dlci(&address, dlci) {
            self.channel_event(l2cap, hci, idx, event);
            return;
        }

        if matches!(event, ChannelEvent::Ua | ChannelEvent::Dm) {
            debug!("RFCOMM {:?} for unknown dlci {} ignored", event, dlci);
            return;
        }

        let server_channel = dlci >> 1;
        let Some(service) = self.service(server_channel).copied() else {
            info!("RFCOMM no service for channel #{}, sending DM", server_channel);
            self.multiplexers[mux_idx].send_dm_for_dlci = Some(dlci);
            return;
        };

        let creates_channel = matches!(
            event,
            ChannelEvent::Sabm
                | ChannelEvent::Pn(_)
                | ChannelEvent::RpnPoll
                | ChannelEvent::RpnSet(_)
        );
        if !creates_channel || self.channels.len() >= self.config.max_channels {
            debug!("RFCOMM {:?} for dlci {} refused, sending DM", event, dlci);
            self.multiplexers[mux_idx].send_dm_for_dlci = Some(dlci);
            return;
        }

        let rfcomm_cid = self.next_cid();
        let mux = &mut self.multiplexers[mux_idx];
        mux.idle_deadline = None;
        let channel = RfcommChannel::incoming(rfcomm_cid, address, dlci, mux.max_frame_size, &service);
        self.channels.push(channel);
        let idx = self.channels.len() - 1;
        self.channel_event(l2cap, hci, idx, event);
    }

    fn channel_event(
        &mut self,
        l2cap: &mut L2capEngine,
        hci: &mut HciEngine,
        idx: usize,
        event: ChannelEvent,
    ) {
        trace!(
            "RFCOMM channel {} in {}: {:?}",
            self.channels[idx].rfcomm_cid,
            self.channels[idx].state,
            event
        );

        // handled in every state
        match event {
            ChannelEvent::Disc => {
                self.emit_teardown(idx, status::REMOTE_USER_TERMINATED_CONNECTION);
                self.channels[idx].set_state(RfcommChannelState::SendUaAfterDisc);
                return;
            }
            ChannelEvent::Dm => {
                self.emit_teardown(idx, status::REMOTE_USER_TERMINATED_CONNECTION);
                self.channels[idx].set_state(RfcommChannelState::Closed);
                self.finalize_channel(idx);
                return;
            }
            ChannelEvent::RpnSet(settings) => {
                let channel = &mut self.channels[idx];
                channel.rpn = settings;
                channel.flags.send_rpn_rsp = true;
                return;
            }
            ChannelEvent::RpnPoll => {
                let channel = &mut self.channels[idx];
                channel.rpn = RpnSettings::default();
                channel.flags.send_rpn_rsp = true;
                return;
            }
            _ => {}
        }

        let address = self.channels[idx].address;
        let mux_frame_size = self
            .multiplexer(&address)
            .map(|m| m.max_frame_size)
            .unwrap_or(0);
        let channel = &mut self.channels[idx];
        let mut incoming = false;

        match (channel.state, event) {
            (RfcommChannelState::Closed, ChannelEvent::Sabm) => {
                channel.flags.rcvd_sabm = true;
                channel.set_state(RfcommChannelState::IncomingSetup);
                incoming = true;
            }
            (RfcommChannelState::Closed, ChannelEvent::Pn(params)) => {
                channel.accept_pn(&params, mux_frame_size);
                channel.flags.rcvd_pn = true;
                channel.set_state(RfcommChannelState::IncomingSetup);
                incoming = true;
            }
            (RfcommChannelState::IncomingSetup, ChannelEvent::Sabm) => {
                channel.flags.rcvd_sabm = true;
                if channel.flags.client_accepted {
                    channel.flags.send_ua = true;
                }
            }
            (RfcommChannelState::IncomingSetup, ChannelEvent::Pn(params)) => {
                channel.accept_pn(&params, mux_frame_size);
                channel.flags.rcvd_pn = true;
                if channel.flags.client_accepted {
                    channel.flags.send_pn_rsp = true;
                }
            }
            (RfcommChannelState::W4PnRsp, ChannelEvent::PnRsp(params)) => {
                channel.max_frame_size = channel.max_frame_size.min(params.max_frame_size);
                channel.credits_outgoing = u16::from(params.credits);
                channel.set_state(RfcommChannelState::SendSabmW4Ua);
            }
            (RfcommChannelState::W4Ua, ChannelEvent::Ua) => {
                channel.flags.send_msc_cmd = true;
                channel.flags.send_credits = true;
                channel.set_state(RfcommChannelState::DlcSetup);
            }
            (RfcommChannelState::DlcSetup, ChannelEvent::MscCmd) => {
                channel.flags.rcvd_msc_cmd = true;
                channel.flags.send_msc_rsp = true;
            }
            (RfcommChannelState::DlcSetup, ChannelEvent::MscRsp) => {
                channel.flags.rcvd_msc_rsp = true;
            }
            (RfcommChannelState::Open, ChannelEvent::MscCmd) => {
                channel.flags.send_msc_rsp = true;
            }
            (state, event) => {
                debug!(
                    "RFCOMM channel {}: {:?} ignored in {}",
                    channel.rfcomm_cid, event, state
                );
            }
        }

        if incoming {
            let channel = &self.channels[idx];
            info!(
                "RFCOMM incoming connection addr {} channel #{} rfcomm_cid {}",
                channel.address,
                channel.server_channel(),
                channel.rfcomm_cid
            );
            let (client, event) = (
                channel.client,
                RfcommEvent::IncomingConnection {
                    address: channel.address,
                    server_channel: channel.server_channel(),
                    rfcomm_cid: channel.rfcomm_cid,
                },
            );
            self.emit(client, event);
        }

        self.open_if_ready(l2cap, hci, idx);
    }
}

fn send_frame(
    l2cap: &mut L2capEngine,
    hci: &mut HciEngine,
    l2cap_cid: u16,
    address: u8,
    control: u8,
    credits: u8,
    payload: &[u8],
) -> RfcommResult<()> {
    let bytes = frame::encode(address, control, credits, payload);
    trace!("RFCOMM => {}", hex::encode(&bytes));
    l2cap.send(hci, l2cap_cid, &bytes)?;
    Ok(())
}

fn send_or_log(
    l2cap: &mut L2capEngine,
    hci: &mut HciEngine,
    mux: &Multiplexer,
    address: u8,
    control: u8,
    credits: u8,
    payload: &[u8],
) {
    if let Err(e) = send_frame(l2cap, hci, mux.l2cap_cid, address, control, credits, payload) {
        error!(
            "RFCOMM frame 0x{:02x} to {} failed: {}",
            control, mux.address, e
        );
    }
}

fn send_message(
    l2cap: &mut L2capEngine,
    hci: &mut HciEngine,
    mux: &Multiplexer,
    message: &MuxMessage,
) {
    trace!("RFCOMM control message {:?}", message);
    send_or_log(
        l2cap,
        hci,
        mux,
        mux.control_address(),
        RFCOMM_UIH,
        0,
        &message.to_bytes(),
    );
}

/// Grant the peer the pending incoming credits
fn send_credits(
    l2cap: &mut L2capEngine,
    hci: &mut HciEngine,
    mux: &Multiplexer,
    channel: &mut RfcommChannel,
) {
    let credits = channel.new_credits_incoming;
    channel.new_credits_incoming = 0;
    channel.credits_incoming = channel.credits_incoming.saturating_add(credits);
    debug!(
        "RFCOMM granting {} credits on {}",
        credits, channel.rfcomm_cid
    );
    send_or_log(
        l2cap,
        hci,
        mux,
        mux.command_address(channel.dlci),
        RFCOMM_UIH_PF,
        credits,
        &[],
    );
}
