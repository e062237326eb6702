//! Controller transport capabilities
//!
//! The stack never talks to a UART, USB endpoint or socket directly. It sends
//! complete HCI packets through a [`Transport`] and receives complete packets
//! through [`Stack::deliver`](crate::Stack::deliver). Vendor specific power and
//! init handling goes through the optional [`ControllerControl`] hook.

use crate::error::TransportError;
use crate::hci::constants::{HCI_ACL_PKT, HCI_COMMAND_PKT, HCI_EVENT_PKT, HCI_SCO_PKT};

/// HCI packet indicator as used by the H4 transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Command,
    Acl,
    Sco,
    Event,
}

impl PacketType {
    pub fn indicator(&self) -> u8 {
        match self {
            PacketType::Command => HCI_COMMAND_PKT,
            PacketType::Acl => HCI_ACL_PKT,
            PacketType::Sco => HCI_SCO_PKT,
            PacketType::Event => HCI_EVENT_PKT,
        }
    }

    pub fn from_indicator(value: u8) -> Option<Self> {
        match value {
            HCI_COMMAND_PKT => Some(PacketType::Command),
            HCI_ACL_PKT => Some(PacketType::Acl),
            HCI_SCO_PKT => Some(PacketType::Sco),
            HCI_EVENT_PKT => Some(PacketType::Event),
            _ => None,
        }
    }
}

/// Byte transport to the Bluetooth controller.
///
/// Packets are passed without the H4 indicator byte; `kind` carries it.
pub trait Transport {
    /// Bring the link to the controller up
    fn open(&mut self) -> Result<(), TransportError>;

    /// Tear the link down
    fn close(&mut self);

    /// Send one complete HCI packet
    fn send_packet(&mut self, kind: PacketType, packet: &[u8]) -> Result<(), TransportError>;

    /// Whether the transport can take another packet right now
    fn can_send_packet_now(&self, _kind: PacketType) -> bool {
        true
    }

    /// Switch the local UART speed (UART transports only)
    fn set_baud_rate(&mut self, _baud: u32) -> Result<(), TransportError> {
        Err(TransportError::Unsupported)
    }
}

/// Vendor hooks for controller power management and initialisation
pub trait ControllerControl {
    /// Power the controller on
    fn on(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Power the controller off
    fn off(&mut self) {}

    /// Put the controller into its low power mode
    fn sleep(&mut self) {}

    /// Leave the low power mode
    fn wake(&mut self) {}

    /// Vendor command that switches the controller UART to `baud`
    fn baud_rate_command(&mut self, _baud: u32) -> Option<Vec<u8>> {
        None
    }

    /// Next vendor init command (complete command packet without indicator),
    /// `None` once the vendor sequence is done
    fn next_init_command(&mut self) -> Option<Vec<u8>> {
        None
    }

    /// Controller reported a hardware error
    fn hardware_error(&mut self) {}
}
