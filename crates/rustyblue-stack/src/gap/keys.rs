//! Link key and remote name storage
//!
//! The HCI engine consults a [`LinkKeyStore`] when the controller asks for a
//! link key, stores keys announced after pairing and drops keys that turned
//! out to be stale (authentication failure, security refusal, new PIN request).

use super::types::{BdAddr, LinkKey, LinkKeyType};
use std::collections::HashMap;

/// Persistent storage for link keys and cached remote device names
pub trait LinkKeyStore {
    /// Look up the link key for a device
    fn get_link_key(&self, address: &BdAddr) -> Option<(LinkKey, LinkKeyType)>;

    /// Store (or replace) the link key for a device
    fn put_link_key(&mut self, address: &BdAddr, key: &LinkKey, key_type: LinkKeyType);

    /// Forget the link key for a device
    fn delete_link_key(&mut self, address: &BdAddr);

    /// Look up a cached remote name
    fn get_name(&self, address: &BdAddr) -> Option<String>;

    /// Cache the remote name of a device
    fn put_name(&mut self, address: &BdAddr, name: &str);

    /// Forget the cached remote name of a device
    fn delete_name(&mut self, address: &BdAddr);
}

/// In-memory implementation of [`LinkKeyStore`]
#[derive(Debug, Default, Clone)]
pub struct MemoryLinkKeyStore {
    keys: HashMap<BdAddr, (LinkKey, LinkKeyType)>,
    names: HashMap<BdAddr, String>,
}

impl MemoryLinkKeyStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored link keys
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl LinkKeyStore for MemoryLinkKeyStore {
    fn get_link_key(&self, address: &BdAddr) -> Option<(LinkKey, LinkKeyType)> {
        self.keys.get(address).copied()
    }

    fn put_link_key(&mut self, address: &BdAddr, key: &LinkKey, key_type: LinkKeyType) {
        self.keys.insert(*address, (*key, key_type));
    }

    fn delete_link_key(&mut self, address: &BdAddr) {
        self.keys.remove(address);
    }

    fn get_name(&self, address: &BdAddr) -> Option<String> {
        self.names.get(address).cloned()
    }

    fn put_name(&mut self, address: &BdAddr, name: &str) {
        self.names.insert(*address, name.to_string());
    }

    fn delete_name(&mut self, address: &BdAddr) {
        self.names.remove(address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_keys() {
        let mut store = MemoryLinkKeyStore::new();
        let addr = BdAddr::new([1, 2, 3, 4, 5, 6]);
        assert!(store.get_link_key(&addr).is_none());

        store.put_link_key(&addr, &[0xAA; 16], LinkKeyType::Combination);
        assert_eq!(
            store.get_link_key(&addr),
            Some(([0xAA; 16], LinkKeyType::Combination))
        );
        assert_eq!(store.len(), 1);

        store.delete_link_key(&addr);
        assert!(store.get_link_key(&addr).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_memory_store_names() {
        let mut store = MemoryLinkKeyStore::new();
        let addr = BdAddr::new([1, 2, 3, 4, 5, 6]);
        store.put_name(&addr, "Keyboard");
        assert_eq!(store.get_name(&addr).as_deref(), Some("Keyboard"));
        store.delete_name(&addr);
        assert!(store.get_name(&addr).is_none());
    }
}
