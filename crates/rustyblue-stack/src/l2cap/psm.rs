//! Protocol/Service Multiplexer (PSM) values used on BR/EDR links

use std::fmt;

/// Protocol/Service Multiplexer.
///
/// Assigned numbers: https://www.bluetooth.com/specifications/assigned-numbers/logical-link-control/
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PSM {
    /// Service Discovery Protocol
    SDP,
    /// RFCOMM serial port emulation
    RFCOMM,
    /// BNEP protocol
    BNEP,
    /// HID Control
    HID_CONTROL,
    /// HID Interrupt
    HID_INTERRUPT,
    /// AVCTP protocol
    AVCTP,
    /// AVDTP protocol
    AVDTP,
    /// Any other value, normally a dynamically assigned PSM
    Dynamic(u16),
}

impl PSM {
    pub fn value(&self) -> u16 {
        match self {
            PSM::SDP => 0x0001,
            PSM::RFCOMM => 0x0003,
            PSM::BNEP => 0x000F,
            PSM::HID_CONTROL => 0x0011,
            PSM::HID_INTERRUPT => 0x0013,
            PSM::AVCTP => 0x0017,
            PSM::AVDTP => 0x0019,
            PSM::Dynamic(value) => *value,
        }
    }
}

impl From<u16> for PSM {
    fn from(value: u16) -> Self {
        match value {
            0x0001 => PSM::SDP,
            0x0003 => PSM::RFCOMM,
            0x000F => PSM::BNEP,
            0x0011 => PSM::HID_CONTROL,
            0x0013 => PSM::HID_INTERRUPT,
            0x0017 => PSM::AVCTP,
            0x0019 => PSM::AVDTP,
            other => PSM::Dynamic(other),
        }
    }
}

impl fmt::Display for PSM {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PSM::SDP => write!(f, "SDP (0x0001)"),
            PSM::RFCOMM => write!(f, "RFCOMM (0x0003)"),
            PSM::BNEP => write!(f, "BNEP (0x000F)"),
            PSM::HID_CONTROL => write!(f, "HID-Control (0x0011)"),
            PSM::HID_INTERRUPT => write!(f, "HID-Interrupt (0x0013)"),
            PSM::AVCTP => write!(f, "AVCTP (0x0017)"),
            PSM::AVDTP => write!(f, "AVDTP (0x0019)"),
            PSM::Dynamic(value) => write!(f, "PSM 0x{:04X}", value),
        }
    }
}
