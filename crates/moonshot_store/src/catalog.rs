//! Local record of which checkpoint names this node currently holds.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::anyhow;

use crate::error::{Result, StoreError};

/// Registration parameters remembered for cleanup when a name is closed.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    /// Whether this node holds the name as producer (gold) or consumer.
    pub is_gold: bool,
    /// Start addresses of the registered regions, in registration order.
    pub addr_list: Vec<u64>,
    /// Byte lengths parallel to `addr_list`.
    pub size_list: Vec<u64>,
    /// Shard granularity the regions were registered with.
    pub max_shard_size: u64,
}

/// Names this node participates in, as producer or consumer.
///
/// A name present here cannot be registered or fetched again until it is
/// removed; the coordinator uses this to sequence lifecycle operations and
/// to know what to unwind on close.
#[derive(Debug, Default)]
pub struct Catalog {
    entries: Mutex<HashMap<String, CatalogEntry>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `name` is live locally.
    pub fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.lock_entries()?.contains_key(name))
    }

    /// Parameters recorded for `name`, if live locally.
    pub fn get(&self, name: &str) -> Result<Option<CatalogEntry>> {
        Ok(self.lock_entries()?.get(name).cloned())
    }

    /// Record `name` as live with the given parameters.
    pub fn add(&self, name: &str, entry: CatalogEntry) -> Result<()> {
        self.lock_entries()?.insert(name.to_string(), entry);
        Ok(())
    }

    /// Drop the local record for `name`.
    pub fn remove(&self, name: &str) -> Result<()> {
        self.lock_entries()?.remove(name);
        Ok(())
    }

    fn lock_entries(&self) -> Result<MutexGuard<'_, HashMap<String, CatalogEntry>>> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Transport(anyhow!("catalog lock poisoned")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(is_gold: bool) -> CatalogEntry {
        CatalogEntry {
            is_gold,
            addr_list: vec![0x1000],
            size_list: vec![4096],
            max_shard_size: 1024,
        }
    }

    #[test]
    fn add_get_remove_roundtrip() {
        let catalog = Catalog::new();
        assert!(!catalog.contains("a/b").expect("contains"));
        assert!(catalog.get("a/b").expect("get").is_none());

        catalog.add("a/b", entry(true)).expect("add");
        assert!(catalog.contains("a/b").expect("contains"));
        let stored = catalog.get("a/b").expect("get").expect("entry");
        assert!(stored.is_gold);
        assert_eq!(stored.addr_list, vec![0x1000]);

        catalog.remove("a/b").expect("remove");
        assert!(!catalog.contains("a/b").expect("contains"));
    }

    #[test]
    fn reinsert_overwrites_role() {
        let catalog = Catalog::new();
        catalog.add("x", entry(true)).expect("add");
        catalog.add("x", entry(false)).expect("add");
        assert!(!catalog.get("x").expect("get").expect("entry").is_gold);
    }
}
