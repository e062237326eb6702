//! Test doubles and a minimal controller simulator shared by the unit tests

use crate::error::TransportError;
use crate::gap::BdAddr;
use crate::hci::constants::*;
use crate::hci::engine::{HciEngine, HciState, HostEvent, PowerMode};
use crate::hci::packet::{acl_packet, parse_command_packet, AclHeader, HciEvent};
use crate::l2cap::constants::L2CAP_HEADER_SIZE;
use crate::stack::{Event, EventSink};
use crate::transport::{ControllerControl, PacketType, Transport};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// ACL buffer size the simulated controller reports
pub const SIM_ACL_LENGTH: u16 = 1021;
/// ACL buffer count the simulated controller reports
pub const SIM_ACL_PACKETS: u16 = 8;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Default)]
pub struct TransportState {
    pub open: bool,
    pub fail_open: bool,
    pub busy: bool,
    pub baud_rate: Option<u32>,
    pub sent: Vec<(PacketType, Vec<u8>)>,
}

/// Transport recording everything that is sent
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    pub state: Rc<RefCell<TransportState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_sent(&self) -> Vec<(PacketType, Vec<u8>)> {
        std::mem::take(&mut self.state.borrow_mut().sent)
    }

    /// Drain sent packets and keep the command packets only
    pub fn take_commands(&self) -> Vec<Vec<u8>> {
        self.take_sent()
            .into_iter()
            .filter(|(kind, _)| *kind == PacketType::Command)
            .map(|(_, packet)| packet)
            .collect()
    }

    /// Drain sent packets and keep the ACL payloads (L2CAP PDUs) only
    pub fn take_acl(&self) -> Vec<(u16, Vec<u8>)> {
        self.take_sent()
            .into_iter()
            .filter(|(kind, _)| *kind == PacketType::Acl)
            .filter_map(|(_, packet)| {
                let header = AclHeader::parse(&packet)?;
                Some((header.handle, packet[HCI_ACL_HEADER_SIZE..].to_vec()))
            })
            .collect()
    }
}

impl Transport for MockTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        if state.fail_open {
            return Err(TransportError::NotOpen);
        }
        state.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.state.borrow_mut().open = false;
    }

    fn send_packet(&mut self, kind: PacketType, packet: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        if !state.open {
            return Err(TransportError::NotOpen);
        }
        state.sent.push((kind, packet.to_vec()));
        Ok(())
    }

    fn can_send_packet_now(&self, _kind: PacketType) -> bool {
        !self.state.borrow().busy
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), TransportError> {
        self.state.borrow_mut().baud_rate = Some(baud);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ControlState {
    pub calls: Vec<&'static str>,
    pub fail_on: bool,
    pub baud_command: Option<Vec<u8>>,
    pub init_commands: VecDeque<Vec<u8>>,
}

/// Controller control hook recording calls
#[derive(Debug, Clone, Default)]
pub struct MockControl {
    pub state: Rc<RefCell<ControlState>>,
}

impl MockControl {
    pub fn calls(&self) -> Vec<&'static str> {
        self.state.borrow().calls.clone()
    }
}

impl ControllerControl for MockControl {
    fn on(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        state.calls.push("on");
        if state.fail_on {
            return Err(TransportError::Busy);
        }
        Ok(())
    }

    fn off(&mut self) {
        self.state.borrow_mut().calls.push("off");
    }

    fn sleep(&mut self) {
        self.state.borrow_mut().calls.push("sleep");
    }

    fn wake(&mut self) {
        self.state.borrow_mut().calls.push("wake");
    }

    fn baud_rate_command(&mut self, _baud: u32) -> Option<Vec<u8>> {
        self.state.borrow_mut().baud_command.clone()
    }

    fn next_init_command(&mut self) -> Option<Vec<u8>> {
        self.state.borrow_mut().init_commands.pop_front()
    }

    fn hardware_error(&mut self) {
        self.state.borrow_mut().calls.push("hardware_error");
    }
}

/// Event sink collecting every application event
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    pub events: Rc<RefCell<Vec<Event>>>,
}

impl RecordingSink {
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut self.events.borrow_mut())
    }
}

impl EventSink for RecordingSink {
    fn on_event(&mut self, event: Event) {
        self.events.borrow_mut().push(event);
    }
}

// ---- controller side packet builders ---------------------------------------

pub fn addr(last: u8) -> BdAddr {
    BdAddr::new([last, 0x55, 0x44, 0x33, 0x22, 0x11])
}

pub fn opcode_of(command: &[u8]) -> u16 {
    parse_command_packet(command).map(|(op, _)| op).unwrap_or(0)
}

pub fn params_of(command: &[u8]) -> Vec<u8> {
    parse_command_packet(command)
        .map(|(_, params)| params.to_vec())
        .unwrap_or_default()
}

pub fn command_complete(opcode: u16, return_parameters: &[u8]) -> Vec<u8> {
    let mut params = vec![1];
    params.extend_from_slice(&opcode.to_le_bytes());
    params.extend_from_slice(return_parameters);
    HciEvent::new(EVT_CMD_COMPLETE, params).to_packet()
}

pub fn command_status(status: u8, opcode: u16) -> Vec<u8> {
    let mut params = vec![status, 1];
    params.extend_from_slice(&opcode.to_le_bytes());
    HciEvent::new(EVT_CMD_STATUS, params).to_packet()
}

pub fn connection_request(address: BdAddr, link_type: u8) -> Vec<u8> {
    let mut params = address.as_slice().to_vec();
    params.extend_from_slice(&[0x0c, 0x02, 0x5a]);
    params.push(link_type);
    HciEvent::new(EVT_CONN_REQUEST, params).to_packet()
}

pub fn connection_complete(status: u8, handle: u16, address: BdAddr) -> Vec<u8> {
    let mut params = vec![status];
    params.extend_from_slice(&handle.to_le_bytes());
    params.extend_from_slice(address.as_slice());
    params.extend_from_slice(&[LINK_TYPE_ACL, 0]);
    HciEvent::new(EVT_CONN_COMPLETE, params).to_packet()
}

pub fn disconnection_complete(handle: u16, reason: u8) -> Vec<u8> {
    let mut params = vec![0];
    params.extend_from_slice(&handle.to_le_bytes());
    params.push(reason);
    HciEvent::new(EVT_DISCONN_COMPLETE, params).to_packet()
}

pub fn number_of_completed_packets(completed: &[(u16, u16)]) -> Vec<u8> {
    let mut params = vec![completed.len() as u8];
    for (handle, _) in completed {
        params.extend_from_slice(&handle.to_le_bytes());
    }
    for (_, count) in completed {
        params.extend_from_slice(&count.to_le_bytes());
    }
    HciEvent::new(EVT_NUM_COMP_PKTS, params).to_packet()
}

pub fn address_event(event_code: u8, address: BdAddr) -> Vec<u8> {
    HciEvent::new(event_code, address.as_slice().to_vec()).to_packet()
}

pub fn link_key_notification(address: BdAddr, key: [u8; 16]) -> Vec<u8> {
    let mut params = address.as_slice().to_vec();
    params.extend_from_slice(&key);
    params.push(0x04);
    HciEvent::new(EVT_LINK_KEY_NOTIFY, params).to_packet()
}

pub fn remote_name_complete(address: BdAddr, name: &str) -> Vec<u8> {
    let mut params = vec![0];
    params.extend_from_slice(address.as_slice());
    let mut raw_name = [0u8; HCI_MAX_NAME_LEN];
    raw_name[..name.len()].copy_from_slice(name.as_bytes());
    params.extend_from_slice(&raw_name);
    HciEvent::new(EVT_REMOTE_NAME_REQ_COMPLETE, params).to_packet()
}

pub fn inquiry_result(addresses: &[BdAddr]) -> Vec<u8> {
    let mut params = vec![addresses.len() as u8];
    for address in addresses {
        params.extend_from_slice(address.as_slice());
    }
    HciEvent::new(EVT_INQUIRY_RESULT, params).to_packet()
}

/// L2CAP basic frame
pub fn l2cap_pdu(cid: u16, payload: &[u8]) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(L2CAP_HEADER_SIZE + payload.len());
    pdu.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    pdu.extend_from_slice(&cid.to_le_bytes());
    pdu.extend_from_slice(payload);
    pdu
}

/// ACL packet carrying a complete L2CAP PDU
pub fn acl(handle: u16, pdu: &[u8]) -> Vec<u8> {
    acl_packet(handle, ACL_PB_FIRST_FLUSHABLE, pdu)
}

/// What a well behaved controller answers to `command`
pub fn controller_reply(command: &[u8]) -> Vec<u8> {
    let opcode = opcode_of(command);
    match opcode {
        OPCODE_READ_BUFFER_SIZE => {
            let mut params = vec![0];
            params.extend_from_slice(&SIM_ACL_LENGTH.to_le_bytes());
            params.push(64);
            params.extend_from_slice(&SIM_ACL_PACKETS.to_le_bytes());
            params.extend_from_slice(&1u16.to_le_bytes());
            command_complete(opcode, &params)
        }
        OPCODE_READ_BD_ADDR => {
            let mut params = vec![0];
            params.extend_from_slice(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
            command_complete(opcode, &params)
        }
        _ if opcode >> 10 == OGF_LINK_CTL as u16
            && !matches!(
                opcode,
                OPCODE_LINK_KEY_REQUEST_REPLY
                    | OPCODE_LINK_KEY_REQUEST_NEGATIVE_REPLY
                    | OPCODE_PIN_CODE_REQUEST_REPLY
                    | OPCODE_PIN_CODE_REQUEST_NEGATIVE_REPLY
                    | OPCODE_CREATE_CONNECTION_CANCEL
            ) =>
        {
            command_status(0, opcode)
        }
        _ => command_complete(opcode, &[0]),
    }
}

pub fn drain_host_events(hci: &mut HciEngine) -> Vec<HostEvent> {
    std::iter::from_fn(|| hci.poll_event()).collect()
}

/// Power the engine on and answer the init sequence until it is working
pub fn boot_hci(hci: &mut HciEngine, transport: &MockTransport) {
    hci.power_control(PowerMode::On).unwrap();
    for _ in 0..32 {
        hci.run();
        let commands = transport.take_commands();
        if commands.is_empty() && hci.state() == HciState::Working {
            break;
        }
        for command in commands {
            hci.handle_packet(PacketType::Event, &controller_reply(&command));
        }
    }
    assert_eq!(hci.state(), HciState::Working);
}
