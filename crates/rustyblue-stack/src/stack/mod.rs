//! The assembled stack
//!
//! [`Stack`] owns the HCI, L2CAP and RFCOMM engines and is the only object an
//! application talks to. Every entry point updates the engine it targets and
//! then runs all engines until none of them makes progress, routing the
//! queued events on the way:
//!
//! - HCI events go to L2CAP and, unless internal, to the application
//! - L2CAP events go to RFCOMM or to the client owning the channel or service
//! - RFCOMM events go to the client owning the channel or service
//!
//! The stack never blocks. The run loop around it feeds received packets
//! through [`Stack::deliver`] and fires timers through
//! [`Stack::handle_timeout`].

use crate::config::StackConfig;
use crate::error::HciResult;
use crate::gap::{BdAddr, LinkKeyStore};
use crate::hci::{HciCommand, HciEngine, HostEvent, PowerMode};
use crate::l2cap::{L2capEngine, L2capEvent, L2capResult, Owner};
use crate::rfcomm::{RfcommEngine, RfcommEvent, RfcommResult, RfcommService};
use crate::transport::{ControllerControl, PacketType, Transport};
use log::{debug, trace};
use std::time::Instant;


/// Identifies an application client, e.g. one daemon connection
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u32);

/// Events delivered to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Hci(HostEvent),
    L2cap { client: ClientId, event: L2capEvent },
    Rfcomm { client: ClientId, event: RfcommEvent },
}

/// Receiver of the application events
pub trait EventSink {
    fn on_event(&mut self, event: Event);
}

impl<F: FnMut(Event)> EventSink for F {
    fn on_event(&mut self, event: Event) {
        self(event)
    }
}

/// HCI, L2CAP and RFCOMM wired together
pub struct Stack {
    hci: HciEngine,
    l2cap: L2capEngine,
    rfcomm: RfcommEngine,
    sink: Box<dyn EventSink>,
}

impl Stack {
    pub fn new(
        config: StackConfig,
        transport: Box<dyn Transport>,
        control: Option<Box<dyn ControllerControl>>,
        key_store: Option<Box<dyn LinkKeyStore>>,
        sink: Box<dyn EventSink>,
    ) -> Self {
        Self {
            hci: HciEngine::new(config.hci, transport, control, key_store),
            l2cap: L2capEngine::new(config.l2cap),
            rfcomm: RfcommEngine::new(config.rfcomm),
            sink,
        }
    }

    pub fn hci(&self) -> &HciEngine {
        &self.hci
    }

    pub fn l2cap(&self) -> &L2capEngine {
        &self.l2cap
    }

    pub fn rfcomm(&self) -> &RfcommEngine {
        &self.rfcomm
    }

    /// Run every engine and route their events until nothing moves
    fn pump(&mut self) {
        let mut rounds = 0u32;
        loop {
            rounds += 1;
            let mut progress = self.hci.run();

            while let Some(event) = self.hci.poll_event() {
                progress = true;
                self.l2cap.handle_host_event(&mut self.hci, &event);
                if !event.is_internal() {
                    self.sink.on_event(Event::Hci(event));
                }
            }

            progress |= self.l2cap.run(&mut self.hci);
            while let Some((owner, event)) = self.l2cap.poll_event() {
                progress = true;
                match owner {
                    Owner::Rfcomm => {
                        self.rfcomm
                            .handle_l2cap_event(&mut self.l2cap, &mut self.hci, event)
                    }
                    Owner::Application(client) => {
                        self.sink.on_event(Event::L2cap { client, event })
                    }
                }
            }

            progress |= self.rfcomm.run(&mut self.l2cap, &mut self.hci);
            while let Some((client, event)) = self.rfcomm.poll_event() {
                progress = true;
                self.sink.on_event(Event::Rfcomm { client, event });
            }

            if !progress {
                break;
            }
        }
        trace!("Stack settled after {} rounds", rounds);
    }

    // ---- power and controller ----------------------------------------------

    pub fn power_control(&mut self, mode: PowerMode) -> HciResult<()> {
        let result = self.hci.power_control(mode);
        self.pump();
        result
    }

    /// Hand a packet received from the controller to the stack
    pub fn deliver(&mut self, kind: PacketType, packet: &[u8]) {
        self.hci.handle_packet(kind, packet);
        self.pump();
    }

    /// The transport finished sending a packet: retry parked work
    pub fn packet_sent(&mut self) {
        debug!("Packet sent, resuming");
        self.pump();
    }

    /// Earliest deadline of any engine timer
    pub fn poll_timeout(&self) -> Option<Instant> {
        match (self.hci.poll_timeout(), self.rfcomm.poll_timeout()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fire the timers that expired at `now`
    pub fn handle_timeout(&mut self, now: Instant) {
        self.hci.handle_timeout(now);
        self.rfcomm.handle_timeout(&mut self.l2cap, now);
        self.pump();
    }

    pub fn send_command(&mut self, command: &HciCommand) -> HciResult<()> {
        let result = self.hci.send_command(command);
        self.pump();
        result
    }

    pub fn connectable_control(&mut self, enable: bool) {
        self.hci.connectable_control(enable);
        self.pump();
    }

    pub fn discoverable_control(&mut self, enable: bool) {
        self.hci.discoverable_control(enable);
        self.pump();
    }

    // ---- L2CAP ---------------------------------------------------------------

    pub fn l2cap_create_channel(
        &mut self,
        client: ClientId,
        address: BdAddr,
        psm: u16,
        mtu: u16,
    ) -> L2capResult<u16> {
        let result =
            self.l2cap
                .create_channel(&self.hci, address, psm, mtu, Owner::Application(client));
        self.pump();
        result
    }

    pub fn l2cap_disconnect(&mut self, local_cid: u16, reason: u8) {
        self.l2cap.disconnect(local_cid, reason);
        self.pump();
    }

    pub fn l2cap_register_service(&mut self, client: ClientId, psm: u16, mtu: u16) {
        self.l2cap
            .register_service(&mut self.hci, psm, mtu, Owner::Application(client));
        self.pump();
    }

    pub fn l2cap_unregister_service(&mut self, psm: u16) {
        self.l2cap.unregister_service(&mut self.hci, psm);
        self.pump();
    }

    pub fn l2cap_accept_connection(&mut self, local_cid: u16) {
        self.l2cap.accept_connection(local_cid);
        self.pump();
    }

    pub fn l2cap_decline_connection(&mut self, local_cid: u16, result: u16) {
        self.l2cap.decline_connection(local_cid, result);
        self.pump();
    }

    pub fn l2cap_send(&mut self, local_cid: u16, data: &[u8]) -> L2capResult<()> {
        let result = self.l2cap.send(&mut self.hci, local_cid, data);
        self.pump();
        result
    }

    pub fn l2cap_can_send(&self, local_cid: u16) -> bool {
        self.l2cap.can_send(&self.hci, local_cid)
    }

    /// Stop or resume handing out L2CAP send credits, e.g. while a client
    /// queue is congested
    pub fn l2cap_block_new_credits(&mut self, blocked: bool) {
        self.l2cap.block_new_credits(blocked);
        if !blocked {
            self.l2cap.hand_out_credits(&self.hci);
        }
        self.pump();
    }

    // ---- RFCOMM --------------------------------------------------------------

    pub fn rfcomm_create_channel(
        &mut self,
        client: ClientId,
        address: BdAddr,
        server_channel: u8,
    ) -> RfcommResult<u16> {
        let result =
            self.rfcomm
                .create_channel(&mut self.l2cap, &self.hci, address, server_channel, client);
        self.pump();
        result
    }

    pub fn rfcomm_create_channel_with_initial_credits(
        &mut self,
        client: ClientId,
        address: BdAddr,
        server_channel: u8,
        initial_credits: u8,
    ) -> RfcommResult<u16> {
        let result = self.rfcomm.create_channel_with_initial_credits(
            &mut self.l2cap,
            &self.hci,
            address,
            server_channel,
            initial_credits,
            client,
        );
        self.pump();
        result
    }

    pub fn rfcomm_disconnect(&mut self, rfcomm_cid: u16) {
        self.rfcomm.disconnect(rfcomm_cid);
        self.pump();
    }

    pub fn rfcomm_register_service(
        &mut self,
        client: ClientId,
        server_channel: u8,
        max_frame_size: u16,
        incoming_flow_control: bool,
        initial_credits: u8,
    ) {
        let service = RfcommService {
            server_channel,
            max_frame_size,
            incoming_flow_control,
            initial_credits,
            client,
        };
        self.rfcomm
            .register_service(&mut self.l2cap, &mut self.hci, service);
        self.pump();
    }

    pub fn rfcomm_unregister_service(&mut self, server_channel: u8) {
        self.rfcomm
            .unregister_service(&mut self.l2cap, &mut self.hci, server_channel);
        self.pump();
    }

    pub fn rfcomm_accept_connection(&mut self, rfcomm_cid: u16) {
        self.rfcomm.accept_connection(rfcomm_cid);
        self.pump();
    }

    pub fn rfcomm_decline_connection(&mut self, rfcomm_cid: u16) {
        self.rfcomm.decline_connection(rfcomm_cid);
        self.pump();
    }

    pub fn rfcomm_grant_credits(&mut self, rfcomm_cid: u16, credits: u8) {
        self.rfcomm.grant_credits(rfcomm_cid, credits);
        self.pump();
    }

    pub fn rfcomm_send(&mut self, rfcomm_cid: u16, data: &[u8]) -> RfcommResult<()> {
        let result = self
            .rfcomm
            .send(&mut self.l2cap, &mut self.hci, rfcomm_cid, data);
        self.pump();
        result
    }

    /// Drop everything a client owns: its channels are disconnected and its
    /// services unregistered
    pub fn close_client(&mut self, client: ClientId) {
        debug!("Closing client {:?}", client);
        self.rfcomm
            .close_client(&mut self.l2cap, &mut self.hci, client);
        self.l2cap.close_client(&mut self.hci, client);
        self.pump();
    }
}
