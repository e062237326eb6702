//! Bluetooth HCI (Host Controller Interface) implementation
//!
//! This module provides the packet codecs and the [`HciEngine`], which owns
//! the baseband connections and talks to the controller through a
//! [`Transport`](crate::transport::Transport).

pub mod connection;
pub mod constants;
pub mod engine;
pub mod event;
pub mod packet;

#[cfg(test)]
mod tests;

pub use connection::{AuthFlags, Connection, ConnectionState};
pub use engine::{HciEngine, HciState, HostEvent, PowerMode};
pub use event::ControllerEvent;
pub use packet::{AclHeader, HciCommand, HciEvent};
