//! Stack configuration
//!
//! Every layer has its own configuration struct; [`StackConfig`] bundles them.
//! The defaults match the limits a desktop host uses.

use std::time::Duration;

/// Configuration for the whole stack
#[derive(Debug, Clone, Default)]
pub struct StackConfig {
    pub hci: HciConfig,
    pub l2cap: L2capConfig,
    pub rfcomm: RfcommConfig,
}

/// HCI layer configuration
#[derive(Debug, Clone)]
pub struct HciConfig {
    /// Name written to the controller during initialisation
    pub local_name: Option<String>,
    /// Baud rate the transport is opened with
    pub baud_rate_init: Option<u32>,
    /// Baud rate to switch to after reset, requires a vendor baud command
    pub baud_rate_main: Option<u32>,
    /// Class of Device written during initialisation
    pub class_of_device: Option<u32>,
    /// Page timeout in 0.625 ms slots
    pub page_timeout: u16,
    /// Host limit for the ACL payload size announced by the controller
    pub acl_payload_size: u16,
    /// Interval of the per-connection liveness check
    pub connection_timeout: Duration,
    /// Maximum number of baseband connections
    pub max_connections: usize,
}

impl Default for HciConfig {
    fn default() -> Self {
        Self {
            local_name: Some("rustyblue".to_string()),
            baud_rate_init: None,
            baud_rate_main: None,
            class_of_device: None,
            page_timeout: 0x6000,
            acl_payload_size: 1021,
            connection_timeout: Duration::from_millis(10_000),
            max_connections: 8,
        }
    }
}

/// L2CAP layer configuration
#[derive(Debug, Clone)]
pub struct L2capConfig {
    pub max_channels: usize,
    pub max_services: usize,
    /// Packets a connection may have in flight before channels on it stop
    /// receiving new send credits
    pub buffered_acl_packets: u16,
}

impl Default for L2capConfig {
    fn default() -> Self {
        Self {
            max_channels: 16,
            max_services: 16,
            buffered_acl_packets: 3,
        }
    }
}

/// RFCOMM layer configuration
#[derive(Debug, Clone)]
pub struct RfcommConfig {
    /// Idle time after which a multiplexer without channels is shut down
    pub multiplexer_timeout: Duration,
    pub max_multiplexers: usize,
    pub max_channels: usize,
    pub max_services: usize,
    /// Credits granted to the peer when incoming flow control is automatic
    pub default_initial_credits: u8,
    /// Incoming credit level below which new credits are granted
    pub credit_low_watermark: u8,
}

impl Default for RfcommConfig {
    fn default() -> Self {
        Self {
            multiplexer_timeout: Duration::from_millis(60_000),
            max_multiplexers: 8,
            max_channels: 16,
            max_services: 16,
            default_initial_credits: 0x30,
            credit_low_watermark: 5,
        }
    }
}
