//! Device addressing and bonding information shared by all layers

pub mod keys;
pub mod types;

pub use keys::{LinkKeyStore, MemoryLinkKeyStore};
pub use types::*;
