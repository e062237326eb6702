//! HCI engine
//!
//! Owns the baseband connections, the command and ACL flow control counters
//! and the controller power state machine. The engine never blocks: every
//! entry point updates state and queues [`HostEvent`]s, and [`HciEngine::run`]
//! sends whatever the current state and the flow control counters permit.

use crate::config::HciConfig;
use crate::error::{status, HciError, HciResult};
use crate::gap::{BdAddr, LinkKeyStore};
use crate::hci::connection::{AuthFlags, Connection, ConnectionState, INVALID_HANDLE};
use crate::hci::constants::*;
use crate::hci::event::{BufferSize, ControllerEvent};
use crate::hci::packet::{
    acl_packet, acl_packet_types_for_buffer_size, parse_command_packet, AclHeader, HciCommand,
    HciEvent,
};
use crate::transport::{ControllerControl, PacketType, Transport};
use log::{debug, error, info, trace, warn};
use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

/// Controller power state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HciState {
    Off,
    Initializing,
    Working,
    Halting,
    Sleeping,
    FallingAsleep,
}

impl fmt::Display for HciState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HciState::Off => write!(f, "OFF"),
            HciState::Initializing => write!(f, "INITIALIZING"),
            HciState::Working => write!(f, "WORKING"),
            HciState::Halting => write!(f, "HALTING"),
            HciState::Sleeping => write!(f, "SLEEPING"),
            HciState::FallingAsleep => write!(f, "FALLING_ASLEEP"),
        }
    }
}

/// Requested power mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    On,
    Off,
    Sleep,
}

/// Events produced by the HCI engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// Power state changed (also emitted on every power control request)
    State(HciState),
    PowerOnFailed,
    ConnectionCountChanged(usize),
    DiscoverableEnabled(bool),
    /// Connection complete produced by the host itself
    ConnectionComplete {
        status: u8,
        handle: u16,
        address: BdAddr,
    },
    /// Disconnection produced by the host itself while shutting down
    DisconnectionComplete {
        handle: u16,
        reason: u8,
    },
    RemoteNameCached {
        address: BdAddr,
        name: String,
    },
    /// Event received from the controller
    Controller(ControllerEvent),
    /// Idle connection should be checked by L2CAP
    TimeoutCheck {
        handle: u16,
    },
    /// Reassembled L2CAP PDU
    AclData {
        handle: u16,
        pdu: Vec<u8>,
    },
}

impl HostEvent {
    /// `(status, handle, address)` of a connection complete, whether it came
    /// from the controller or the host
    pub fn connection_complete(&self) -> Option<(u8, u16, BdAddr)> {
        match self {
            HostEvent::ConnectionComplete {
                status,
                handle,
                address,
            } => Some((*status, *handle, *address)),
            HostEvent::Controller(ControllerEvent::ConnectionComplete {
                status,
                handle,
                bd_addr,
                ..
            }) => Some((*status, *handle, *bd_addr)),
            _ => None,
        }
    }

    /// `(handle, reason)` of a successful disconnection
    pub fn disconnection_complete(&self) -> Option<(u16, u8)> {
        match self {
            HostEvent::DisconnectionComplete { handle, reason } => Some((*handle, *reason)),
            HostEvent::Controller(ControllerEvent::DisconnectionComplete {
                status: 0,
                handle,
                reason,
            }) => Some((*handle, *reason)),
            _ => None,
        }
    }

    /// Whether the application should see this event
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            HostEvent::TimeoutCheck { .. } | HostEvent::AclData { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitStep {
    Reset,
    BaudChange,
    LocalBaudChange,
    CustomInit,
    ReadBdAddr,
    ReadBufferSize,
    WritePageTimeout,
    WriteScanEnable,
    WriteLocalName,
    WriteClassOfDevice,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SleepStep {
    Disconnecting,
    WaitScanDisable,
    Sleep,
}

/// The HCI engine
pub struct HciEngine {
    config: HciConfig,
    transport: Box<dyn Transport>,
    control: Option<Box<dyn ControllerControl>>,
    key_store: Option<Box<dyn LinkKeyStore>>,

    state: HciState,
    init_step: InitStep,
    /// Init sequence waits for the Command Complete of its last command
    init_waiting: bool,
    sleep_step: SleepStep,

    num_cmd_packets: u8,
    acl_data_packet_length: u16,
    total_num_acl_packets: u16,
    packet_types: u16,
    local_address: Option<BdAddr>,

    connections: Vec<Connection>,

    discoverable: bool,
    connectable: bool,
    pending_scan_enable: Option<u8>,
    pending_decline: Option<(BdAddr, u8)>,

    events: VecDeque<HostEvent>,
}

impl HciEngine {
    pub fn new(
        config: HciConfig,
        transport: Box<dyn Transport>,
        control: Option<Box<dyn ControllerControl>>,
        key_store: Option<Box<dyn LinkKeyStore>>,
    ) -> Self {
        let acl_data_packet_length = config.acl_payload_size;
        Self {
            config,
            transport,
            control,
            key_store,
            state: HciState::Off,
            init_step: InitStep::Reset,
            init_waiting: false,
            sleep_step: SleepStep::Disconnecting,
            num_cmd_packets: 0,
            acl_data_packet_length,
            total_num_acl_packets: 0,
            packet_types: acl_packet_types_for_buffer_size(acl_data_packet_length),
            local_address: None,
            connections: Vec::new(),
            discoverable: false,
            connectable: false,
            pending_scan_enable: None,
            pending_decline: None,
            events: VecDeque::new(),
        }
    }

    pub fn state(&self) -> HciState {
        self.state
    }

    /// Address read from the controller during initialisation
    pub fn local_address(&self) -> Option<BdAddr> {
        self.local_address
    }

    /// Next queued event
    pub fn poll_event(&mut self) -> Option<HostEvent> {
        self.events.pop_front()
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    fn emit(&mut self, event: HostEvent) {
        self.events.push_back(event);
    }

    fn emit_state(&mut self) {
        debug!("HCI state {}", self.state);
        self.emit(HostEvent::State(self.state));
    }

    fn emit_connection_count(&mut self) {
        let count = self.connections.len();
        debug!("Number of baseband connections: {}", count);
        self.emit(HostEvent::ConnectionCountChanged(count));
    }

    // ---- connections -------------------------------------------------------

    fn index_for_handle(&self, handle: u16) -> Option<usize> {
        self.connections.iter().position(|c| c.handle == handle)
    }

    fn index_for_address(&self, address: &BdAddr) -> Option<usize> {
        self.connections.iter().position(|c| c.address == *address)
    }

    pub fn connection(&self, handle: u16) -> Option<&Connection> {
        self.connections.iter().find(|c| c.handle == handle)
    }

    pub fn connection_for_address(&self, address: &BdAddr) -> Option<&Connection> {
        self.connections.iter().find(|c| c.address == *address)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn create_connection_for_address(
        &mut self,
        address: BdAddr,
        state: ConnectionState,
    ) -> Option<usize> {
        if self.connections.len() >= self.config.max_connections {
            warn!("No connection slot left for {}", address);
            return None;
        }
        self.connections.push(Connection::new(address, state));
        Some(self.connections.len() - 1)
    }

    /// Set authentication flags on the connection to `address` and refresh
    /// its activity timestamp
    fn add_auth_flags(&mut self, address: &BdAddr, flags: AuthFlags) {
        if let Some(idx) = self.index_for_address(address) {
            let conn = &mut self.connections[idx];
            conn.auth_flags |= flags;
            conn.touch();
        }
    }

    /// Whether pairing is in progress on `handle`
    pub fn authentication_active(&self, handle: u16) -> bool {
        self.connection(handle)
            .map(|c| c.authentication_active())
            .unwrap_or(false)
    }

    /// Forget the stored link key of `address`
    pub fn drop_link_key(&mut self, address: &BdAddr) {
        if let Some(store) = self.key_store.as_mut() {
            info!("Dropping link key for {}", address);
            store.delete_link_key(address);
        }
    }

    pub fn key_store(&self) -> Option<&dyn LinkKeyStore> {
        self.key_store.as_deref()
    }

    /// Remove a connection the host gave up on and tell the upper layers
    fn shutdown_connection(&mut self, idx: usize) {
        let conn = self.connections.remove(idx);
        info!(
            "Connection closed: handle 0x{:04x}, {}",
            conn.handle, conn.address
        );
        if conn.handle == INVALID_HANDLE {
            // never connected: the link failed to come up
            self.emit(HostEvent::ConnectionComplete {
                status: status::CONNECTION_TERMINATED_BY_LOCAL_HOST,
                handle: INVALID_HANDLE,
                address: conn.address,
            });
        } else {
            self.emit(HostEvent::DisconnectionComplete {
                handle: conn.handle,
                reason: status::CONNECTION_TERMINATED_BY_LOCAL_HOST,
            });
        }
        self.emit_connection_count();
    }

    // ---- flow control ------------------------------------------------------

    /// ACL packets the controller can still take
    pub fn free_acl_slots(&self) -> u16 {
        let mut free_slots = self.total_num_acl_packets;
        for conn in &self.connections {
            if free_slots < conn.outstanding_acl_packets {
                error!("Sum of outgoing ACL packets exceeds controller buffers");
                return 0;
            }
            free_slots -= conn.outstanding_acl_packets;
        }
        free_slots
    }

    /// ACL packets in flight on `handle`
    pub fn number_outgoing_packets(&self, handle: u16) -> u16 {
        match self.connection(handle) {
            Some(conn) => conn.outstanding_acl_packets,
            None => {
                error!("No connection for handle 0x{:04x}", handle);
                0
            }
        }
    }

    pub fn can_send(&self, kind: PacketType) -> bool {
        if !self.transport.can_send_packet_now(kind) {
            return false;
        }
        match kind {
            PacketType::Acl => self.free_acl_slots() > 0,
            PacketType::Command => self.num_cmd_packets > 0,
            _ => false,
        }
    }

    pub fn can_send_command(&self) -> bool {
        self.can_send(PacketType::Command)
    }

    pub fn can_send_acl(&self) -> bool {
        self.can_send(PacketType::Acl)
    }

    /// Packet types allowed for outgoing connections
    pub fn usable_acl_packet_types(&self) -> u16 {
        self.packet_types
    }

    /// Largest ACL payload the host sends
    pub fn max_acl_data_packet_length(&self) -> u16 {
        self.acl_data_packet_length
    }

    // ---- power control -----------------------------------------------------

    fn power_on(&mut self) -> HciResult<()> {
        if let Some(control) = self.control.as_mut() {
            if let Err(e) = control.on() {
                error!("Power on failed: {}", e);
                self.emit(HostEvent::PowerOnFailed);
                return Err(e.into());
            }
        }

        if let Err(e) = self.transport.open() {
            error!("HCI transport open failed, turning Bluetooth off again: {}", e);
            if let Some(control) = self.control.as_mut() {
                control.off();
            }
            self.emit(HostEvent::PowerOnFailed);
            return Err(e.into());
        }
        Ok(())
    }

    fn power_off(&mut self) {
        info!("Powering controller off");
        self.transport.close();
        if let Some(control) = self.control.as_mut() {
            control.off();
        }
        self.state = HciState::Off;
    }

    fn power_sleep(&mut self) {
        info!("Putting controller to sleep");
        if let Some(control) = self.control.as_mut() {
            control.sleep();
        }
        self.state = HciState::Sleeping;
    }

    fn power_wake(&mut self) {
        info!("Waking controller");
        if let Some(control) = self.control.as_mut() {
            control.wake();
        }
    }

    fn start_init(&mut self) {
        // assume that one command can be sent
        self.num_cmd_packets = 1;
        self.state = HciState::Initializing;
        self.init_step = InitStep::Reset;
        self.init_waiting = false;
    }

    fn start_sleep(&mut self) {
        self.state = HciState::FallingAsleep;
        self.sleep_step = SleepStep::Disconnecting;
    }

    /// Change the controller power mode
    pub fn power_control(&mut self, mode: PowerMode) -> HciResult<()> {
        info!("Power control {:?}, current state {}", mode, self.state);

        match (self.state, mode) {
            (HciState::Off, PowerMode::On) => {
                self.power_on()?;
                self.start_init();
            }
            (HciState::Off, _) => {}

            (HciState::Initializing, PowerMode::On) => {}
            // no connections yet
            (HciState::Initializing, PowerMode::Off) => self.power_off(),
            (HciState::Initializing, PowerMode::Sleep) => self.power_sleep(),

            (HciState::Working, PowerMode::On) => {}
            (HciState::Working, PowerMode::Off) => self.state = HciState::Halting,
            (HciState::Working, PowerMode::Sleep) => self.start_sleep(),

            (HciState::Halting, PowerMode::On) => self.start_init(),
            (HciState::Halting, PowerMode::Off) => {}
            (HciState::Halting, PowerMode::Sleep) => self.start_sleep(),

            (HciState::FallingAsleep, PowerMode::On) => self.start_init(),
            (HciState::FallingAsleep, PowerMode::Off) => self.state = HciState::Halting,
            (HciState::FallingAsleep, PowerMode::Sleep) => {}

            (HciState::Sleeping, PowerMode::On) => {
                self.power_wake();
                self.start_init();
            }
            (HciState::Sleeping, PowerMode::Off) => self.state = HciState::Halting,
            (HciState::Sleeping, PowerMode::Sleep) => {}
        }

        self.emit_state();
        Ok(())
    }

    /// Shut every connection down and power off
    pub fn close(&mut self) {
        while !self.connections.is_empty() {
            self.shutdown_connection(0);
        }
        if self.state != HciState::Off {
            self.power_off();
            self.emit_state();
        }
    }

    fn update_scan_enable(&mut self) {
        // 2 = page scan, 1 = inquiry scan
        self.pending_scan_enable =
            Some((self.connectable as u8) << 1 | self.discoverable as u8);
    }

    pub fn discoverable_control(&mut self, enable: bool) {
        if self.discoverable == enable {
            self.emit(HostEvent::DiscoverableEnabled(self.discoverable));
            return;
        }
        self.discoverable = enable;
        self.update_scan_enable();
    }

    pub fn connectable_control(&mut self, enable: bool) {
        if self.connectable == enable {
            return;
        }
        self.connectable = enable;
        self.update_scan_enable();
    }

    pub fn is_discoverable(&self) -> bool {
        self.discoverable
    }

    pub fn is_connectable(&self) -> bool {
        self.connectable
    }

    // ---- sending -----------------------------------------------------------

    /// Send a typed command
    pub fn send_command(&mut self, command: &HciCommand) -> HciResult<()> {
        self.send_command_packet(&command.to_packet())
    }

    /// Send an encoded command packet, keeping connection and pairing
    /// bookkeeping in sync with what is sent
    pub fn send_command_packet(&mut self, packet: &[u8]) -> HciResult<()> {
        let (opcode, params) = parse_command_packet(packet).ok_or(HciError::InvalidPacketFormat)?;
        let address = BdAddr::from_slice(params);

        if opcode == OPCODE_CREATE_CONNECTION {
            let address = address.ok_or(HciError::InvalidParamLength(params.len()))?;
            info!("Create connection to {}", address);
            if let Some(idx) = self.index_for_address(&address) {
                let conn = &self.connections[idx];
                if conn.state == ConnectionState::Open {
                    let handle = conn.handle;
                    self.emit(HostEvent::ConnectionComplete {
                        status: status::SUCCESS,
                        handle,
                        address,
                    });
                }
                // otherwise the connection is already being set up
                return Ok(());
            }
            if self.num_cmd_packets == 0 {
                return Err(HciError::CommandBuffersFull);
            }
            if self
                .create_connection_for_address(address, ConnectionState::SentCreateConnection)
                .is_none()
            {
                self.emit(HostEvent::ConnectionComplete {
                    status: status::MEMORY_ALLOC_FAILED,
                    handle: INVALID_HANDLE,
                    address,
                });
                return Ok(());
            }
        } else if self.num_cmd_packets == 0 {
            return Err(HciError::CommandBuffersFull);
        }

        if let Some(address) = address {
            match opcode {
                OPCODE_LINK_KEY_REQUEST_REPLY => {
                    self.add_auth_flags(&address, AuthFlags::SENT_LINK_KEY_REPLY)
                }
                OPCODE_LINK_KEY_REQUEST_NEGATIVE_REPLY => {
                    self.add_auth_flags(&address, AuthFlags::SENT_LINK_KEY_NEGATIVE_REQUEST)
                }
                OPCODE_PIN_CODE_REQUEST_REPLY => {
                    self.add_auth_flags(&address, AuthFlags::SENT_PIN_CODE_REPLY)
                }
                OPCODE_PIN_CODE_REQUEST_NEGATIVE_REPLY => {
                    self.add_auth_flags(&address, AuthFlags::SENT_PIN_CODE_NEGATIVE_REPLY)
                }
                OPCODE_DELETE_STORED_LINK_KEY => self.drop_link_key(&address),
                _ => {}
            }
        }

        if opcode == OPCODE_DISCONNECT && params.len() >= 2 {
            let handle = u16::from_le_bytes([params[0], params[1]]) & HCI_HANDLE_MASK;
            if let Some(idx) = self.index_for_handle(handle) {
                self.connections[idx].state = ConnectionState::SentDisconnect;
            }
        }

        self.num_cmd_packets = self.num_cmd_packets.saturating_sub(1);
        trace!("CMD => {}", hex::encode(packet));
        self.transport.send_packet(PacketType::Command, packet)?;
        Ok(())
    }

    /// Send one L2CAP PDU on `handle` as a single ACL packet
    pub fn send_acl(&mut self, handle: u16, pdu: &[u8]) -> HciResult<()> {
        if self.free_acl_slots() == 0 {
            return Err(HciError::AclBuffersFull);
        }

        let Some(idx) = self.index_for_handle(handle) else {
            warn!("ACL send on unknown handle 0x{:04x}", handle);
            return Ok(());
        };
        let conn = &mut self.connections[idx];
        conn.touch();
        conn.outstanding_acl_packets += 1;

        let packet = acl_packet(handle, ACL_PB_FIRST_FLUSHABLE, pdu);
        trace!("ACL => {}", hex::encode(&packet));
        self.transport.send_packet(PacketType::Acl, &packet)?;
        Ok(())
    }

    // ---- receiving ---------------------------------------------------------

    /// Handle a complete packet received from the transport
    pub fn handle_packet(&mut self, kind: PacketType, packet: &[u8]) {
        match kind {
            PacketType::Event => self.handle_event_packet(packet),
            PacketType::Acl => self.handle_acl_packet(packet),
            other => debug!("Ignoring {:?} packet", other),
        }
    }

    fn handle_acl_packet(&mut self, packet: &[u8]) {
        trace!("ACL <= {}", hex::encode(packet));
        let Some(header) = AclHeader::parse(packet) else {
            warn!("Dropping truncated ACL packet");
            return;
        };
        let Some(idx) = self.index_for_handle(header.handle) else {
            error!("ACL data for unknown handle 0x{:04x}", header.handle);
            return;
        };
        let end = (HCI_ACL_HEADER_SIZE + header.length as usize).min(packet.len());
        let payload = &packet[HCI_ACL_HEADER_SIZE..end];

        let conn = &mut self.connections[idx];
        conn.touch();
        if let Some(pdu) = conn.reassemble(header.packet_boundary, payload) {
            self.emit(HostEvent::AclData {
                handle: header.handle,
                pdu,
            });
        }
    }

    fn handle_event_packet(&mut self, packet: &[u8]) {
        trace!("EVT <= {}", hex::encode(packet));
        let Some(event) = HciEvent::parse(packet).and_then(|raw| ControllerEvent::decode(&raw))
        else {
            warn!("Dropping malformed HCI event");
            return;
        };
        self.handle_event(event);
    }

    /// Handle a decoded controller event
    pub fn handle_event(&mut self, event: ControllerEvent) {
        let mut forward = true;

        match &event {
            ControllerEvent::CommandComplete {
                num_hci_command_packets,
                opcode,
                return_parameters,
            } => {
                self.num_cmd_packets = *num_hci_command_packets;
                match *opcode {
                    OPCODE_READ_BUFFER_SIZE => self.handle_read_buffer_size(return_parameters),
                    OPCODE_READ_BD_ADDR => {
                        if let Some(address) = return_parameters.get(1..).and_then(BdAddr::from_slice)
                        {
                            info!(
                                "Local address, status 0x{:02x}: {}",
                                return_parameters[0], address
                            );
                            self.local_address = Some(address);
                        }
                    }
                    OPCODE_WRITE_SCAN_ENABLE => {
                        self.emit(HostEvent::DiscoverableEnabled(self.discoverable))
                    }
                    _ => {}
                }
            }

            ControllerEvent::CommandStatus {
                num_hci_command_packets,
                ..
            } => self.num_cmd_packets = *num_hci_command_packets,

            ControllerEvent::NumberOfCompletedPackets { completed } => {
                for (handle, packets) in completed {
                    match self.index_for_handle(*handle) {
                        Some(idx) => {
                            let conn = &mut self.connections[idx];
                            conn.outstanding_acl_packets =
                                conn.outstanding_acl_packets.saturating_sub(*packets);
                        }
                        None => error!("Completed packets for unused handle 0x{:04x}", handle),
                    }
                }
            }

            ControllerEvent::ConnectionRequest {
                bd_addr, link_type, ..
            } => {
                info!("Incoming connection from {}, link type {}", bd_addr, link_type);
                if *link_type == LINK_TYPE_ACL {
                    let idx = match self.index_for_address(bd_addr) {
                        Some(idx) => Some(idx),
                        None => self.create_connection_for_address(
                            *bd_addr,
                            ConnectionState::ReceivedConnectionRequest,
                        ),
                    };
                    match idx {
                        Some(idx) => {
                            self.connections[idx].state = ConnectionState::ReceivedConnectionRequest
                        }
                        None => {
                            self.pending_decline = Some((
                                *bd_addr,
                                status::CONNECTION_REJECTED_LIMITED_RESOURCES,
                            ))
                        }
                    }
                } else {
                    self.pending_decline = Some((
                        *bd_addr,
                        status::CONNECTION_REJECTED_UNACCEPTABLE_LINK_TYPE,
                    ));
                }
            }

            ControllerEvent::ConnectionComplete {
                status: result,
                handle,
                bd_addr,
                ..
            } => {
                info!("Connection complete (status 0x{:02x}) {}", result, bd_addr);
                if let Some(idx) = self.index_for_address(bd_addr) {
                    if *result == status::SUCCESS {
                        let interval = self.config.connection_timeout;
                        let conn = &mut self.connections[idx];
                        conn.state = ConnectionState::Open;
                        conn.handle = *handle;
                        conn.touch();
                        conn.arm_timeout(Instant::now(), interval);
                        info!("New connection: handle 0x{:04x}, {}", handle, bd_addr);
                        self.emit_connection_count();
                    } else {
                        self.connections.remove(idx);
                        if *result == status::AUTHENTICATION_FAILURE {
                            self.drop_link_key(bd_addr);
                        }
                    }
                }
            }

            ControllerEvent::LinkKeyRequest { bd_addr } => {
                // answered from the key store by run()
                self.add_auth_flags(
                    bd_addr,
                    AuthFlags::RECV_LINK_KEY_REQUEST | AuthFlags::HANDLE_LINK_KEY_REQUEST,
                );
                forward = false;
            }

            ControllerEvent::LinkKeyNotification {
                bd_addr,
                link_key,
                key_type,
            } => {
                self.add_auth_flags(bd_addr, AuthFlags::RECV_LINK_KEY_NOTIFICATION);
                if let Some(store) = self.key_store.as_mut() {
                    store.put_link_key(bd_addr, link_key, *key_type);
                }
            }

            ControllerEvent::PinCodeRequest { bd_addr } => {
                self.add_auth_flags(bd_addr, AuthFlags::RECV_PIN_CODE_REQUEST);
                // the stored key did not work
                if let Some(store) = self.key_store.as_mut() {
                    store.delete_link_key(bd_addr);
                }
            }

            ControllerEvent::AuthenticationComplete { handle, .. } => {
                if let Some(idx) = self.index_for_handle(*handle) {
                    self.connections[idx].auth_flags = AuthFlags::empty();
                }
            }

            ControllerEvent::RemoteNameRequestComplete {
                status: result,
                bd_addr,
                name,
            } => {
                if *result == status::SUCCESS {
                    if let Some(store) = self.key_store.as_mut() {
                        store.put_name(bd_addr, name);
                    }
                }
            }

            ControllerEvent::InquiryResult { addresses } => {
                let cached: Vec<(BdAddr, String)> = match self.key_store.as_ref() {
                    Some(store) => addresses
                        .iter()
                        .filter_map(|a| store.get_name(a).map(|name| (*a, name)))
                        .collect(),
                    None => Vec::new(),
                };
                // the result first, then the cached names
                self.emit(HostEvent::Controller(event.clone()));
                for (address, name) in cached {
                    self.emit(HostEvent::RemoteNameCached { address, name });
                }
                forward = false;
            }

            ControllerEvent::DisconnectionComplete {
                status: result,
                handle,
                ..
            } => {
                if *result == status::SUCCESS {
                    if let Some(idx) = self.index_for_handle(*handle) {
                        let conn = self.connections.remove(idx);
                        info!(
                            "Connection closed: handle 0x{:04x}, {}",
                            conn.handle, conn.address
                        );
                        self.emit_connection_count();
                    }
                }
            }

            ControllerEvent::HardwareError { code } => {
                error!("Controller hardware error 0x{:02x}", code);
                if let Some(control) = self.control.as_mut() {
                    control.hardware_error();
                }
            }

            _ => {}
        }

        let command_complete = matches!(event, ControllerEvent::CommandComplete { .. });
        if self.state == HciState::Initializing && self.init_waiting && command_complete {
            self.init_waiting = false;
        }
        if self.state == HciState::FallingAsleep
            && self.sleep_step == SleepStep::WaitScanDisable
            && event.is_command_complete(OPCODE_WRITE_SCAN_ENABLE)
        {
            self.sleep_step = SleepStep::Sleep;
        }

        if forward {
            self.emit(HostEvent::Controller(event));
        }
    }

    fn handle_read_buffer_size(&mut self, return_parameters: &[u8]) {
        let Some(size) = BufferSize::parse(return_parameters) else {
            warn!("Malformed Read Buffer Size response");
            return;
        };
        self.acl_data_packet_length = size
            .acl_data_packet_length
            .min(self.config.acl_payload_size);
        self.total_num_acl_packets = size.total_num_acl_packets;
        self.packet_types = acl_packet_types_for_buffer_size(self.acl_data_packet_length);
        info!(
            "Read buffer size: used size {}, count {}, packet types {:04x}",
            self.acl_data_packet_length, self.total_num_acl_packets, self.packet_types
        );
    }

    // ---- timers ------------------------------------------------------------

    /// Earliest liveness check deadline
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.connections.iter().filter_map(|c| c.timeout_at).min()
    }

    /// Run the liveness checks that are due
    pub fn handle_timeout(&mut self, now: Instant) {
        let interval = self.config.connection_timeout;
        let mut idle = Vec::new();
        for conn in self.connections.iter_mut() {
            match conn.timeout_at {
                Some(at) if at <= now => {
                    if now >= conn.last_activity + interval {
                        idle.push(conn.handle);
                    }
                    conn.arm_timeout(now, interval);
                }
                _ => {}
            }
        }
        for handle in idle {
            debug!("Connection 0x{:04x} idle, checking for timeout", handle);
            self.emit(HostEvent::TimeoutCheck { handle });
        }
    }

    // ---- run pass ----------------------------------------------------------

    /// Send whatever is pending. Returns whether anything happened.
    pub fn run(&mut self) -> bool {
        let mut progress = false;

        if !self.can_send_command() {
            return progress;
        }

        if let Some((address, reason)) = self.pending_decline.take() {
            progress = true;
            self.send_or_log(&HciCommand::RejectConnectionRequest {
                bd_addr: address,
                reason,
            });
        }

        if !self.can_send_command() {
            return progress;
        }

        if let Some(scan_enable) = self.pending_scan_enable.take() {
            progress = true;
            self.send_or_log(&HciCommand::WriteScanEnable { scan_enable });
        }

        for idx in 0..self.connections.len() {
            if !self.can_send_command() {
                return progress;
            }

            if self.connections[idx].state == ConnectionState::ReceivedConnectionRequest {
                let address = self.connections[idx].address;
                debug!("Accepting connection from {}", address);
                self.send_or_log(&HciCommand::AcceptConnectionRequest {
                    bd_addr: address,
                    role: ROLE_SLAVE,
                });
                self.connections[idx].state = ConnectionState::AcceptedConnectionRequest;
                progress = true;
            }

            if !self.can_send_command() {
                return progress;
            }

            if self.connections[idx]
                .auth_flags
                .contains(AuthFlags::HANDLE_LINK_KEY_REQUEST)
            {
                let address = self.connections[idx].address;
                self.connections[idx]
                    .auth_flags
                    .remove(AuthFlags::HANDLE_LINK_KEY_REQUEST);
                let key = self
                    .key_store
                    .as_ref()
                    .and_then(|store| store.get_link_key(&address));
                debug!("Responding to link key request from {}", address);
                let command = match key {
                    Some((link_key, _)) => HciCommand::LinkKeyRequestReply {
                        bd_addr: address,
                        link_key,
                    },
                    None => HciCommand::LinkKeyRequestNegativeReply { bd_addr: address },
                };
                self.send_or_log(&command);
                progress = true;
            }
        }

        if !self.can_send_command() {
            return progress;
        }

        match self.state {
            HciState::Initializing => self.run_init() || progress,
            HciState::Halting => self.run_halting() || progress,
            HciState::FallingAsleep => self.run_falling_asleep() || progress,
            _ => progress,
        }
    }

    fn send_or_log(&mut self, command: &HciCommand) {
        if let Err(e) = self.send_command(command) {
            error!("Failed to send {:?}: {}", command, e);
        }
    }

    fn send_init_command(&mut self, command: &HciCommand, next: InitStep) -> bool {
        self.send_or_log(command);
        self.init_waiting = true;
        self.init_step = next;
        true
    }

    fn run_init(&mut self) -> bool {
        if self.init_waiting {
            return false;
        }
        loop {
            debug!("HCI init step {:?}", self.init_step);
            match self.init_step {
                InitStep::Reset => {
                    return self.send_init_command(&HciCommand::Reset, InitStep::BaudChange);
                }
                InitStep::BaudChange => {
                    let command = match (self.config.baud_rate_main, self.control.as_mut()) {
                        (Some(baud), Some(control)) => control.baud_rate_command(baud),
                        _ => None,
                    };
                    match command {
                        Some(packet) => {
                            if let Err(e) = self.send_command_packet(&packet) {
                                error!("Failed to send baud rate command: {}", e);
                            }
                            self.init_waiting = true;
                            self.init_step = InitStep::LocalBaudChange;
                            return true;
                        }
                        None => self.init_step = InitStep::CustomInit,
                    }
                }
                InitStep::LocalBaudChange => {
                    if let Some(baud) = self.config.baud_rate_main {
                        if let Err(e) = self.transport.set_baud_rate(baud) {
                            warn!("Could not switch transport to {} baud: {}", baud, e);
                        }
                    }
                    self.init_step = InitStep::CustomInit;
                }
                InitStep::CustomInit => {
                    let packet = self.control.as_mut().and_then(|c| c.next_init_command());
                    match packet {
                        Some(packet) => {
                            if let Err(e) = self.send_command_packet(&packet) {
                                error!("Failed to send vendor init command: {}", e);
                            }
                            self.init_waiting = true;
                            return true;
                        }
                        None => {
                            debug!("Vendor init script done");
                            self.init_step = InitStep::ReadBdAddr;
                        }
                    }
                }
                InitStep::ReadBdAddr => {
                    return self.send_init_command(&HciCommand::ReadBdAddr, InitStep::ReadBufferSize);
                }
                InitStep::ReadBufferSize => {
                    return self
                        .send_init_command(&HciCommand::ReadBufferSize, InitStep::WritePageTimeout);
                }
                InitStep::WritePageTimeout => {
                    let timeout = self.config.page_timeout;
                    return self.send_init_command(
                        &HciCommand::WritePageTimeout { timeout },
                        InitStep::WriteScanEnable,
                    );
                }
                InitStep::WriteScanEnable => {
                    let scan_enable = (self.connectable as u8) << 1 | self.discoverable as u8;
                    return self.send_init_command(
                        &HciCommand::WriteScanEnable { scan_enable },
                        InitStep::WriteLocalName,
                    );
                }
                InitStep::WriteLocalName => match self.config.local_name.clone() {
                    Some(name) => {
                        return self.send_init_command(
                            &HciCommand::WriteLocalName { name },
                            InitStep::WriteClassOfDevice,
                        );
                    }
                    None => self.init_step = InitStep::WriteClassOfDevice,
                },
                InitStep::WriteClassOfDevice => match self.config.class_of_device {
                    Some(class_of_device) => {
                        return self.send_init_command(
                            &HciCommand::WriteClassOfDevice { class_of_device },
                            InitStep::Done,
                        );
                    }
                    None => self.init_step = InitStep::Done,
                },
                InitStep::Done => {
                    self.state = HciState::Working;
                    self.emit_state();
                    return true;
                }
            }
        }
    }

    /// Disconnect the first connection, reporting it closed right away so
    /// the upper layers drop their channels
    fn disconnect_first_connection(&mut self) {
        let handle = self.connections[0].handle;
        debug!("Shutting down connection 0x{:04x}", handle);
        if handle != INVALID_HANDLE {
            self.send_or_log(&HciCommand::Disconnect {
                handle,
                reason: status::REMOTE_USER_TERMINATED_CONNECTION,
            });
        }
        self.shutdown_connection(0);
    }

    fn run_halting(&mut self) -> bool {
        if !self.connections.is_empty() {
            self.disconnect_first_connection();
            return true;
        }
        self.power_off();
        self.emit_state();
        true
    }

    fn run_falling_asleep(&mut self) -> bool {
        match self.sleep_step {
            SleepStep::Disconnecting => {
                if !self.connections.is_empty() {
                    self.disconnect_first_connection();
                    return true;
                }
                // drop inquiry scan but keep page scan
                let scan_enable = (self.connectable as u8) << 1;
                self.send_or_log(&HciCommand::WriteScanEnable { scan_enable });
                self.sleep_step = SleepStep::WaitScanDisable;
                true
            }
            SleepStep::WaitScanDisable => false,
            SleepStep::Sleep => {
                self.power_sleep();
                self.emit_state();
                true
            }
        }
    }
}
