//! RustyBlue stack - host side classic Bluetooth protocol engines
//!
//! This library drives a Bluetooth controller through an HCI transport and
//! layers L2CAP and RFCOMM on top of the baseband connections. The engines are
//! sans-IO: packets come in through [`Stack::deliver`], go out through a
//! [`Transport`](transport::Transport), and results are reported as
//! [`Event`]s to an [`EventSink`].

pub mod config;
pub mod error;
pub mod gap;
pub mod hci;
pub mod l2cap;
pub mod rfcomm;
pub mod stack;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

// Re-export common types for convenience
pub use config::{HciConfig, L2capConfig, RfcommConfig, StackConfig};
pub use error::{HciError, TransportError};
pub use gap::{BdAddr, LinkKeyStore, MemoryLinkKeyStore};
pub use hci::{HciCommand, HciEngine, HciState, HostEvent, PowerMode};
pub use l2cap::{L2capEngine, L2capError, L2capEvent, PSM};
pub use rfcomm::{RfcommEngine, RfcommError, RfcommEvent};
pub use stack::{ClientId, Event, EventSink, Stack};
pub use transport::{ControllerControl, PacketType, Transport};
