//! Unit tests for HCI packet handling and the HCI engine

use super::constants::*;
use super::engine::*;
use super::event::ControllerEvent;
use super::packet::*;
use crate::config::HciConfig;
use crate::error::{status, HciError};
use crate::gap::{LinkKeyType, MemoryLinkKeyStore};
use crate::testing::*;
use crate::transport::PacketType;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};

fn engine_with(config: HciConfig) -> (HciEngine, MockTransport, MockControl) {
    init_logging();
    let transport = MockTransport::new();
    let control = MockControl::default();
    let hci = HciEngine::new(
        config,
        Box::new(transport.clone()),
        Some(Box::new(control.clone())),
        Some(Box::new(MemoryLinkKeyStore::new())),
    );
    (hci, transport, control)
}

fn working_engine() -> (HciEngine, MockTransport) {
    let (mut hci, transport, _) = engine_with(HciConfig::default());
    boot_hci(&mut hci, &transport);
    drain_host_events(&mut hci);
    (hci, transport)
}

fn deliver(hci: &mut HciEngine, packet: &[u8]) {
    hci.handle_packet(PacketType::Event, packet);
}

/// Outgoing connection to `address`, opened with `handle`
fn open_connection(hci: &mut HciEngine, transport: &MockTransport, last: u8, handle: u16) {
    hci.send_command(&HciCommand::CreateConnection {
        bd_addr: addr(last),
        packet_type: hci.usable_acl_packet_types(),
        page_scan_repetition_mode: 0,
        clock_offset: 0,
        allow_role_switch: true,
    })
    .unwrap();
    for command in transport.take_commands() {
        deliver(hci, &controller_reply(&command));
    }
    deliver(hci, &connection_complete(0, handle, addr(last)));
    drain_host_events(hci);
}

#[test]
fn test_hci_command_serialization() {
    // Reset
    let packet = HciCommand::Reset.to_packet();
    let opcode = u16::from_le_bytes([packet[0], packet[1]]);
    assert_eq!(opcode, 0x0C03); // OGF_HOST_CTL << 10 | OCF_RESET
    assert_eq!(packet[2], 0);

    // Disconnect
    let packet = HciCommand::Disconnect {
        handle: 0x0040,
        reason: 0x13,
    }
    .to_packet();
    assert_eq!(u16::from_le_bytes([packet[0], packet[1]]), 0x0406);
    assert_eq!(packet[2], 3);
    assert_eq!(u16::from_le_bytes([packet[3], packet[4]]), 0x0040);
    assert_eq!(packet[5], 0x13);

    // Create Connection, address goes out least significant byte first
    let packet = HciCommand::CreateConnection {
        bd_addr: "11:22:33:44:55:66".parse().unwrap(),
        packet_type: 0xcc18,
        page_scan_repetition_mode: 1,
        clock_offset: 0x1234,
        allow_role_switch: true,
    }
    .to_packet();
    assert_eq!(u16::from_le_bytes([packet[0], packet[1]]), OPCODE_CREATE_CONNECTION);
    assert_eq!(packet[2], 13);
    assert_eq!(&packet[3..9], &[0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
    assert_eq!(u16::from_le_bytes([packet[9], packet[10]]), 0xcc18);
    assert_eq!(packet[11], 1);
    assert_eq!(packet[12], 0);
    assert_eq!(u16::from_le_bytes([packet[13], packet[14]]), 0x1234);
    assert_eq!(packet[15], 1);

    // Write Local Name is a fixed 248 byte field
    let packet = HciCommand::WriteLocalName {
        name: "rustyblue".to_string(),
    }
    .to_packet();
    assert_eq!(packet[2] as usize, HCI_MAX_NAME_LEN);
    assert_eq!(&packet[3..12], b"rustyblue");
    assert_eq!(packet[12], 0);

    // PIN code reply pads the PIN to 16 bytes
    let packet = HciCommand::PinCodeRequestReply {
        bd_addr: addr(1),
        pin: b"0000".to_vec(),
    }
    .to_packet();
    assert_eq!(packet[2], 23);
    assert_eq!(packet[9], 4);
    assert_eq!(&packet[10..14], b"0000");
    assert!(packet[14..].iter().all(|b| *b == 0));

    // Raw command
    let packet = HciCommand::new(OGF_VENDOR, 0x0001, vec![0x01, 0x02, 0x03]).to_packet();
    assert_eq!(u16::from_le_bytes([packet[0], packet[1]]), 0xFC01);
    assert_eq!(&packet[2..], &[3, 0x01, 0x02, 0x03]);
}

#[test]
fn test_hci_event_parsing() {
    // Command Complete for Reset
    let data = [
        EVT_CMD_COMPLETE, // Event code
        4,                // Parameter length
        1,                // Num_HCI_Command_Packets
        0x03,             // Command_Opcode (low byte)
        0x0C,             // Command_Opcode (high byte)
        0x00,             // Status
    ];

    let event = HciEvent::parse(&data).unwrap();
    assert_eq!(event.event_code, EVT_CMD_COMPLETE);
    assert_eq!(event.parameter_total_length, 4);
    assert_eq!(event.parameters, vec![1, 0x03, 0x0C, 0x00]);

    let decoded = ControllerEvent::decode(&event).unwrap();
    assert!(decoded.is_command_complete(OPCODE_RESET));
    assert!(!decoded.is_command_complete(OPCODE_DISCONNECT));

    // Invalid data
    assert!(HciEvent::parse(&[]).is_none());
    assert!(HciEvent::parse(&[EVT_CMD_COMPLETE, 10, 1, 2]).is_none());
}

#[test]
fn test_acl_header() {
    let header = AclHeader::parse(&[0x2a, 0x20, 0x05, 0x00]).unwrap();
    assert_eq!(header.handle, 0x002a);
    assert_eq!(header.packet_boundary, ACL_PB_FIRST_FLUSHABLE);
    assert_eq!(header.broadcast, 0);
    assert_eq!(header.length, 5);
    assert_eq!(header.to_bytes(), [0x2a, 0x20, 0x05, 0x00]);

    let packet = acl_packet(0x0abc, ACL_PB_CONTINUING, &[9, 8]);
    assert_eq!(packet, vec![0xbc, 0x1a, 0x02, 0x00, 9, 8]);

    assert!(AclHeader::parse(&[0x01, 0x02]).is_none());
}

#[test]
fn test_packet_types_for_buffer_size() {
    // everything fits, EDR types allowed
    assert_eq!(acl_packet_types_for_buffer_size(1021), 0xcc18);
    // only DM1/DH1 fit, EDR types marked as not usable
    assert_eq!(acl_packet_types_for_buffer_size(27), 0x331e);
}

#[test]
fn test_power_on_runs_init_sequence() {
    let (mut hci, transport, _) = engine_with(HciConfig::default());

    hci.power_control(PowerMode::On).unwrap();
    assert_eq!(hci.state(), HciState::Initializing);

    let mut opcodes = Vec::new();
    for _ in 0..16 {
        hci.run();
        let commands = transport.take_commands();
        if commands.is_empty() {
            break;
        }
        for command in commands {
            opcodes.push(opcode_of(&command));
            deliver(&mut hci, &controller_reply(&command));
        }
    }

    assert_eq!(
        opcodes,
        vec![
            OPCODE_RESET,
            OPCODE_READ_BD_ADDR,
            OPCODE_READ_BUFFER_SIZE,
            opcode(OGF_HOST_CTL, OCF_WRITE_PAGE_TIMEOUT),
            OPCODE_WRITE_SCAN_ENABLE,
            opcode(OGF_HOST_CTL, OCF_WRITE_LOCAL_NAME),
        ]
    );
    assert_eq!(hci.state(), HciState::Working);
    assert_eq!(hci.local_address().unwrap().to_string(), "06:05:04:03:02:01");
    assert_eq!(hci.max_acl_data_packet_length(), SIM_ACL_LENGTH);
    assert_eq!(hci.free_acl_slots(), SIM_ACL_PACKETS);

    let events = drain_host_events(&mut hci);
    assert_eq!(events[0], HostEvent::State(HciState::Initializing));
    assert!(events.contains(&HostEvent::State(HciState::Working)));
}

#[test]
fn test_init_waits_for_command_complete() {
    let (mut hci, transport, _) = engine_with(HciConfig::default());
    hci.power_control(PowerMode::On).unwrap();

    hci.run();
    assert_eq!(transport.take_commands().len(), 1);

    // unrelated events do not advance the sequence
    deliver(&mut hci, &command_status(0, OPCODE_CREATE_CONNECTION));
    hci.run();
    assert!(transport.take_commands().is_empty());
}

#[test]
fn test_init_with_baud_change_and_vendor_script() {
    let config = HciConfig {
        baud_rate_main: Some(921_600),
        local_name: None,
        class_of_device: Some(0x5a020c),
        ..HciConfig::default()
    };
    let (mut hci, transport, control) = engine_with(config);
    let baud_command = HciCommand::new(OGF_VENDOR, 0x0018, vec![0x00, 0x10, 0x0e, 0x00]).to_packet();
    let vendor_command = HciCommand::new(OGF_VENDOR, 0x0001, vec![0xaa]).to_packet();
    control.state.borrow_mut().baud_command = Some(baud_command.clone());
    control
        .state
        .borrow_mut()
        .init_commands
        .push_back(vendor_command.clone());

    hci.power_control(PowerMode::On).unwrap();
    let mut sent = Vec::new();
    for _ in 0..16 {
        hci.run();
        let commands = transport.take_commands();
        if commands.is_empty() {
            break;
        }
        for command in commands {
            deliver(&mut hci, &controller_reply(&command));
            sent.push(command);
        }
    }

    assert_eq!(opcode_of(&sent[0]), OPCODE_RESET);
    assert_eq!(sent[1], baud_command);
    assert_eq!(sent[2], vendor_command);
    assert_eq!(opcode_of(&sent[3]), OPCODE_READ_BD_ADDR);
    assert_eq!(
        opcode_of(sent.last().unwrap()),
        opcode(OGF_HOST_CTL, OCF_WRITE_CLASS_OF_DEVICE)
    );
    assert_eq!(transport.state.borrow().baud_rate, Some(921_600));
    assert_eq!(hci.state(), HciState::Working);
}

#[test]
fn test_power_on_failure() {
    let (mut hci, transport, control) = engine_with(HciConfig::default());
    transport.state.borrow_mut().fail_open = true;

    let result = hci.power_control(PowerMode::On);
    assert!(matches!(result, Err(HciError::Transport(_))));
    assert_eq!(hci.state(), HciState::Off);
    assert_eq!(drain_host_events(&mut hci), vec![HostEvent::PowerOnFailed]);
    assert_eq!(control.calls(), vec!["on", "off"]);
}

#[test]
fn test_power_off_disconnects_connections() {
    let (mut hci, transport) = working_engine();
    open_connection(&mut hci, &transport, 1, 0x0001);

    hci.power_control(PowerMode::Off).unwrap();
    assert_eq!(hci.state(), HciState::Halting);

    hci.run();
    let commands = transport.take_commands();
    assert_eq!(commands.len(), 1);
    assert_eq!(opcode_of(&commands[0]), OPCODE_DISCONNECT);
    assert_eq!(params_of(&commands[0]), vec![0x01, 0x00, 0x13]);

    deliver(&mut hci, &controller_reply(&commands[0]));
    hci.run();
    assert_eq!(hci.state(), HciState::Off);
    assert!(!transport.state.borrow().open);

    let events = drain_host_events(&mut hci);
    assert!(events.contains(&HostEvent::DisconnectionComplete {
        handle: 0x0001,
        reason: status::CONNECTION_TERMINATED_BY_LOCAL_HOST,
    }));
    assert!(events.contains(&HostEvent::ConnectionCountChanged(0)));
    assert_eq!(events.last(), Some(&HostEvent::State(HciState::Off)));
}

#[test]
fn test_sleep_and_wake() {
    let (mut hci, transport, control) = engine_with(HciConfig::default());
    boot_hci(&mut hci, &transport);
    hci.connectable_control(true);
    hci.discoverable_control(true);
    hci.run();
    for command in transport.take_commands() {
        deliver(&mut hci, &controller_reply(&command));
    }

    hci.power_control(PowerMode::Sleep).unwrap();
    hci.run();
    let commands = transport.take_commands();
    assert_eq!(opcode_of(&commands[0]), OPCODE_WRITE_SCAN_ENABLE);
    // page scan only
    assert_eq!(params_of(&commands[0]), vec![0x02]);

    // waits for the scan enable to complete
    hci.run();
    assert_eq!(hci.state(), HciState::FallingAsleep);

    deliver(&mut hci, &controller_reply(&commands[0]));
    hci.run();
    assert_eq!(hci.state(), HciState::Sleeping);
    assert!(control.calls().contains(&"sleep"));

    hci.power_control(PowerMode::On).unwrap();
    assert_eq!(hci.state(), HciState::Initializing);
    assert!(control.calls().contains(&"wake"));
    hci.run();
    assert_eq!(opcode_of(&transport.take_commands()[0]), OPCODE_RESET);
}

#[test]
fn test_create_connection_bookkeeping() {
    let config = HciConfig {
        max_connections: 1,
        ..HciConfig::default()
    };
    let (mut hci, transport, _) = engine_with(config);
    boot_hci(&mut hci, &transport);
    drain_host_events(&mut hci);

    open_connection(&mut hci, &transport, 1, 0x0010);

    // already open: report it, send nothing
    hci.send_command(&HciCommand::CreateConnection {
        bd_addr: addr(1),
        packet_type: 0,
        page_scan_repetition_mode: 0,
        clock_offset: 0,
        allow_role_switch: false,
    })
    .unwrap();
    assert!(transport.take_commands().is_empty());
    assert_eq!(
        drain_host_events(&mut hci),
        vec![HostEvent::ConnectionComplete {
            status: 0,
            handle: 0x0010,
            address: addr(1)
        }]
    );

    // no slot for a second connection
    hci.send_command(&HciCommand::CreateConnection {
        bd_addr: addr(2),
        packet_type: 0,
        page_scan_repetition_mode: 0,
        clock_offset: 0,
        allow_role_switch: false,
    })
    .unwrap();
    assert!(transport.take_commands().is_empty());
    let events = drain_host_events(&mut hci);
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0].connection_complete().map(|(s, _, a)| (s, a)),
        Some((status::MEMORY_ALLOC_FAILED, addr(2)))
    );
}

#[test]
fn test_close_fails_connection_without_handle() {
    let (mut hci, transport) = working_engine();
    hci.send_command(&HciCommand::CreateConnection {
        bd_addr: addr(2),
        packet_type: 0,
        page_scan_repetition_mode: 0,
        clock_offset: 0,
        allow_role_switch: false,
    })
    .unwrap();
    transport.take_commands();
    drain_host_events(&mut hci);

    hci.close();
    let events = drain_host_events(&mut hci);
    assert!(events.contains(&HostEvent::ConnectionComplete {
        status: status::CONNECTION_TERMINATED_BY_LOCAL_HOST,
        handle: super::connection::INVALID_HANDLE,
        address: addr(2),
    }));
    assert!(!events
        .iter()
        .any(|event| matches!(event, HostEvent::DisconnectionComplete { .. })));
}

#[test]
fn test_command_credits() {
    let (mut hci, transport) = working_engine();

    hci.send_command(&HciCommand::InquiryCancel).unwrap();
    assert!(!hci.can_send_command());
    assert!(matches!(
        hci.send_command(&HciCommand::InquiryCancel),
        Err(HciError::CommandBuffersFull)
    ));

    let commands = transport.take_commands();
    assert_eq!(commands.len(), 1);
    deliver(&mut hci, &controller_reply(&commands[0]));
    assert!(hci.can_send_command());
}

#[test]
fn test_acl_flow_control() {
    let (mut hci, transport) = working_engine();
    open_connection(&mut hci, &transport, 1, 0x0001);

    for _ in 0..SIM_ACL_PACKETS {
        hci.send_acl(0x0001, &l2cap_pdu(0x0040, &[1])).unwrap();
    }
    assert_eq!(hci.free_acl_slots(), 0);
    assert!(!hci.can_send_acl());
    assert!(matches!(
        hci.send_acl(0x0001, &[0]),
        Err(HciError::AclBuffersFull)
    ));
    assert_eq!(transport.take_acl().len(), SIM_ACL_PACKETS as usize);

    deliver(&mut hci, &number_of_completed_packets(&[(0x0001, 3)]));
    assert_eq!(hci.number_outgoing_packets(0x0001), SIM_ACL_PACKETS - 3);
    assert_eq!(hci.free_acl_slots(), 3);

    // unknown handles are accepted and dropped
    assert!(hci.send_acl(0x0777, &[0]).is_ok());
    assert!(transport.take_acl().is_empty());
}

#[test]
fn test_outstanding_packets_stay_in_range() {
    let (mut hci, transport) = working_engine();
    open_connection(&mut hci, &transport, 1, 0x0001);
    open_connection(&mut hci, &transport, 2, 0x0002);

    let mut rng = StdRng::seed_from_u64(0x5eed);
    for _ in 0..500 {
        let handle = if rng.gen_bool(0.5) { 0x0001 } else { 0x0002 };
        if rng.gen_bool(0.6) {
            let _ = hci.send_acl(handle, &[0]);
        } else {
            let completed = rng.gen_range(0..5);
            deliver(&mut hci, &number_of_completed_packets(&[(handle, completed)]));
        }
        let first = hci.number_outgoing_packets(0x0001);
        let second = hci.number_outgoing_packets(0x0002);
        assert!(first + second <= SIM_ACL_PACKETS);
        assert_eq!(hci.free_acl_slots(), SIM_ACL_PACKETS - first - second);
    }
}

#[test]
fn test_incoming_connection_requests() {
    let config = HciConfig {
        max_connections: 1,
        ..HciConfig::default()
    };
    let (mut hci, transport, _) = engine_with(config);
    boot_hci(&mut hci, &transport);

    // ACL link: accepted, staying slave
    deliver(&mut hci, &connection_request(addr(1), LINK_TYPE_ACL));
    hci.run();
    let commands = transport.take_commands();
    assert_eq!(opcode_of(&commands[0]), OPCODE_ACCEPT_CONNECTION_REQUEST);
    assert_eq!(params_of(&commands[0])[6], ROLE_SLAVE);
    deliver(&mut hci, &controller_reply(&commands[0]));

    // SCO link: rejected
    deliver(&mut hci, &connection_request(addr(2), LINK_TYPE_SCO));
    hci.run();
    let commands = transport.take_commands();
    assert_eq!(opcode_of(&commands[0]), OPCODE_REJECT_CONNECTION_REQUEST);
    assert_eq!(
        params_of(&commands[0])[6],
        status::CONNECTION_REJECTED_UNACCEPTABLE_LINK_TYPE
    );
    deliver(&mut hci, &controller_reply(&commands[0]));

    // no slot left
    deliver(&mut hci, &connection_request(addr(3), LINK_TYPE_ACL));
    hci.run();
    let commands = transport.take_commands();
    assert_eq!(opcode_of(&commands[0]), OPCODE_REJECT_CONNECTION_REQUEST);
    assert_eq!(
        params_of(&commands[0])[6],
        status::CONNECTION_REJECTED_LIMITED_RESOURCES
    );
}

#[test]
fn test_failed_connection_drops_link_key() {
    let (mut hci, transport, _) = engine_with(HciConfig::default());
    boot_hci(&mut hci, &transport);

    deliver(&mut hci, &link_key_notification(addr(1), [7; 16]));
    assert!(hci.key_store().unwrap().get_link_key(&addr(1)).is_some());

    hci.send_command(&HciCommand::CreateConnection {
        bd_addr: addr(1),
        packet_type: 0,
        page_scan_repetition_mode: 0,
        clock_offset: 0,
        allow_role_switch: false,
    })
    .unwrap();
    deliver(
        &mut hci,
        &connection_complete(status::AUTHENTICATION_FAILURE, 0, addr(1)),
    );

    assert_eq!(hci.connection_count(), 0);
    assert!(hci.key_store().unwrap().get_link_key(&addr(1)).is_none());
}

#[test]
fn test_link_key_request_answered_from_store() {
    let (mut hci, transport) = working_engine();
    deliver(&mut hci, &link_key_notification(addr(1), [0x42; 16]));
    open_connection(&mut hci, &transport, 1, 0x0001);
    open_connection(&mut hci, &transport, 2, 0x0002);

    // known key
    deliver(&mut hci, &address_event(EVT_LINK_KEY_REQ, addr(1)));
    assert!(drain_host_events(&mut hci).is_empty());
    assert!(hci.authentication_active(0x0001));
    hci.run();
    let commands = transport.take_commands();
    assert_eq!(opcode_of(&commands[0]), OPCODE_LINK_KEY_REQUEST_REPLY);
    assert_eq!(&params_of(&commands[0])[6..], &[0x42; 16]);
    assert!(!hci.authentication_active(0x0001));
    deliver(&mut hci, &controller_reply(&commands[0]));

    // unknown key
    deliver(&mut hci, &address_event(EVT_LINK_KEY_REQ, addr(2)));
    hci.run();
    let commands = transport.take_commands();
    assert_eq!(
        opcode_of(&commands[0]),
        OPCODE_LINK_KEY_REQUEST_NEGATIVE_REPLY
    );
    assert!(hci.authentication_active(0x0002));
}

#[test]
fn test_pin_request_deletes_key() {
    let (mut hci, _transport) = working_engine();

    deliver(&mut hci, &link_key_notification(addr(1), [1; 16]));
    let (_, key_type) = hci.key_store().unwrap().get_link_key(&addr(1)).unwrap();
    assert_eq!(key_type, LinkKeyType::UnauthenticatedP192);

    deliver(&mut hci, &address_event(EVT_PIN_CODE_REQ, addr(1)));
    assert!(hci.key_store().unwrap().get_link_key(&addr(1)).is_none());

    // forwarded to the application
    let events = drain_host_events(&mut hci);
    assert!(matches!(
        events.last(),
        Some(HostEvent::Controller(ControllerEvent::PinCodeRequest { .. }))
    ));
}

#[test]
fn test_remote_names_are_cached() {
    let (mut hci, _transport) = working_engine();

    deliver(&mut hci, &remote_name_complete(addr(1), "headset"));
    assert_eq!(
        hci.key_store().unwrap().get_name(&addr(1)).as_deref(),
        Some("headset")
    );
    drain_host_events(&mut hci);

    deliver(&mut hci, &inquiry_result(&[addr(1), addr(2)]));
    let events = drain_host_events(&mut hci);
    assert_eq!(events.len(), 2);
    assert!(matches!(
        events[0],
        HostEvent::Controller(ControllerEvent::InquiryResult { .. })
    ));
    assert_eq!(
        events[1],
        HostEvent::RemoteNameCached {
            address: addr(1),
            name: "headset".to_string()
        }
    );
}

#[test]
fn test_scan_enable_round_trip() {
    let (mut hci, transport) = working_engine();

    for (connectable, discoverable) in [(true, false), (true, true), (false, true)] {
        hci.connectable_control(connectable);
        hci.discoverable_control(discoverable);
        drain_host_events(&mut hci);
        hci.run();

        let commands = transport.take_commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(opcode_of(&commands[0]), OPCODE_WRITE_SCAN_ENABLE);
        assert_eq!(
            params_of(&commands[0]),
            vec![(connectable as u8) << 1 | discoverable as u8]
        );

        deliver(&mut hci, &controller_reply(&commands[0]));
        let events = drain_host_events(&mut hci);
        assert_eq!(events[0], HostEvent::DiscoverableEnabled(discoverable));
    }

    // unchanged discoverable mode is reported right away
    hci.discoverable_control(true);
    assert_eq!(
        drain_host_events(&mut hci),
        vec![HostEvent::DiscoverableEnabled(true)]
    );
    hci.run();
    assert!(transport.take_commands().is_empty());

    // unchanged connectable mode is silent
    hci.connectable_control(false);
    assert!(drain_host_events(&mut hci).is_empty());
}

#[test]
fn test_acl_reassembly_through_engine() {
    let (mut hci, transport) = working_engine();
    open_connection(&mut hci, &transport, 1, 0x0001);

    let pdu = l2cap_pdu(0x0040, &[0x11; 12]);
    hci.handle_packet(
        PacketType::Acl,
        &acl_packet(0x0001, ACL_PB_FIRST_FLUSHABLE, &pdu[..8]),
    );
    assert!(drain_host_events(&mut hci).is_empty());
    hci.handle_packet(
        PacketType::Acl,
        &acl_packet(0x0001, ACL_PB_CONTINUING, &pdu[8..]),
    );
    assert_eq!(
        drain_host_events(&mut hci),
        vec![HostEvent::AclData {
            handle: 0x0001,
            pdu
        }]
    );

    // unknown handle
    hci.handle_packet(PacketType::Acl, &acl(0x0009, &l2cap_pdu(0x0040, &[1])));
    assert!(drain_host_events(&mut hci).is_empty());
}

#[test]
fn test_liveness_timer() {
    let (mut hci, transport) = working_engine();
    assert!(hci.poll_timeout().is_none());

    open_connection(&mut hci, &transport, 1, 0x0001);
    let deadline = hci.poll_timeout().unwrap();
    assert!(deadline > Instant::now());

    hci.handle_timeout(Instant::now() + Duration::from_secs(11));
    assert_eq!(
        drain_host_events(&mut hci),
        vec![HostEvent::TimeoutCheck { handle: 0x0001 }]
    );
    // re-armed
    assert!(hci.poll_timeout().unwrap() > deadline);
}

#[test]
fn test_disconnection_complete_removes_connection() {
    let (mut hci, transport) = working_engine();
    open_connection(&mut hci, &transport, 1, 0x0001);

    deliver(&mut hci, &disconnection_complete(0x0001, 0x13));
    assert_eq!(hci.connection_count(), 0);
    let events = drain_host_events(&mut hci);
    assert_eq!(events[0], HostEvent::ConnectionCountChanged(0));
    assert_eq!(events[1].disconnection_complete(), Some((0x0001, 0x13)));
}

#[test]
fn test_hardware_error_reaches_control() {
    let (mut hci, transport, control) = engine_with(HciConfig::default());
    boot_hci(&mut hci, &transport);
    deliver(&mut hci, &[EVT_HARDWARE_ERROR, 1, 0x03]);
    assert!(control.calls().contains(&"hardware_error"));
}
