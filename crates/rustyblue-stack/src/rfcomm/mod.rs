//! RFCOMM implementation
//!
//! Serial port emulation on top of one L2CAP channel per remote device:
//! - Multiplexer sessions with their control channel on DLCI 0
//! - Channels negotiated with PN, MSC and RPN
//! - Credit based flow control in both directions

pub mod channel;
pub mod constants;
pub mod core;
pub mod frame;
pub mod messages;
pub mod multiplexer;
pub mod types;

pub use self::channel::{RfcommChannel, RfcommService};
pub use self::core::RfcommEngine;
pub use self::messages::{MuxMessage, PnParams};
pub use self::multiplexer::Multiplexer;
pub use self::types::*;
