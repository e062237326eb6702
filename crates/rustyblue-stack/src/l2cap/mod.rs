//! L2CAP (Logical Link Control and Adaptation Protocol) implementation
//!
//! This module provides the connection oriented part of L2CAP on BR/EDR
//! links:
//! - Channel setup, configuration and teardown over the signaling channel
//! - Service registration for incoming channels
//! - Per channel send credits derived from the HCI flow control

pub mod channel;
pub mod constants;
pub mod core;
pub mod packet;
pub mod psm;
pub mod signaling;
pub mod types;

// Re-export the public API
pub use self::channel::{L2capChannel, L2capService};
pub use self::core::L2capEngine;
pub use self::psm::PSM;
pub use self::types::*;
