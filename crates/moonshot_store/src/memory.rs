//! Process-local table of memory regions registered with the transfer
//! substrate.
//!
//! Registration is slow: latency-dominated per call and pin-cost-dominated
//! per byte. A region is therefore split into fixed chunks registered in
//! parallel while the registry keeps one ref-counted logical entry. The
//! registry lock only guards the in-memory table; every substrate call
//! happens outside it, tracked through the refcount.

use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use tokio::task::JoinSet;
use tracing::warn;

use crate::error::{Result, StoreError};
use crate::transfer::TransferBackend;

/// Default registration chunk size: 4 GiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 4096 * 1024 * 1024;

/// Upper bound on concurrently in-flight substrate calls per operation.
const MAX_REGISTRATION_WORKERS: usize = 16;

#[derive(Debug, Clone, Copy)]
struct RegionEntry {
    addr: u64,
    length: u64,
    refcount: usize,
}

/// Ref-counted table of the regions this process has pinned.
pub struct RegisteredMemory {
    transfer: Arc<dyn TransferBackend>,
    regions: Mutex<Vec<RegionEntry>>,
    chunk_size: u64,
    location_tag: String,
}

impl RegisteredMemory {
    /// `chunk_size` must be a power of two; every `max_shard_size` passed
    /// to [`add`](Self::add) must divide it.
    pub fn new(
        transfer: Arc<dyn TransferBackend>,
        chunk_size: u64,
        location_tag: impl Into<String>,
    ) -> Self {
        debug_assert!(chunk_size.is_power_of_two());
        Self {
            transfer,
            regions: Mutex::new(Vec::new()),
            chunk_size,
            location_tag: location_tag.into(),
        }
    }

    /// Register `[addr, addr + length)`.
    ///
    /// An exact duplicate of a live entry only bumps its refcount; a range
    /// that overlaps a live entry with different bounds is rejected. A new
    /// range is pinned chunk by chunk in parallel, and any chunk failure
    /// unwinds everything this call registered before surfacing the first
    /// error.
    pub async fn add(&self, addr: u64, length: u64, max_shard_size: u64) -> Result<()> {
        self.check_shard_size(max_shard_size)?;

        {
            let mut regions = self.lock_regions()?;
            for entry in regions.iter_mut() {
                if entry.addr == addr && entry.length == length {
                    entry.refcount += 1;
                    return Ok(());
                }
                if addr < entry.addr + entry.length && addr + length > entry.addr {
                    return Err(StoreError::AddressOverlapped { addr, length });
                }
            }
            regions.push(RegionEntry {
                addr,
                length,
                refcount: 1,
            });
        }

        let mut workers = JoinSet::new();
        let mut registered = Vec::new();
        let mut first_error: Option<anyhow::Error> = None;
        for (chunk_addr, chunk_length) in chunks(addr, length, self.chunk_size) {
            if workers.len() >= MAX_REGISTRATION_WORKERS {
                if let Some(joined) = workers.join_next().await {
                    record_chunk_outcome(joined, &mut registered, &mut first_error);
                }
            }
            let transfer = Arc::clone(&self.transfer);
            let location = self.location_tag.clone();
            workers.spawn(async move {
                transfer
                    .register_local_memory(chunk_addr, chunk_length, &location)
                    .await
                    .map(|()| chunk_addr)
            });
        }
        while let Some(joined) = workers.join_next().await {
            record_chunk_outcome(joined, &mut registered, &mut first_error);
        }

        let Some(err) = first_error else {
            return Ok(());
        };

        // Unwind this call: release the chunks it managed to pin and take
        // the entry back out through the refcount path, so a concurrent
        // duplicate add keeps its reference.
        for chunk_addr in registered {
            if let Err(cleanup) = self.transfer.unregister_local_memory(chunk_addr).await {
                warn!(error = ?cleanup, chunk_addr, "cascading error unregistering chunk");
            }
        }
        self.release_entry(addr, length);
        Err(StoreError::Transport(err))
    }

    /// Drop one reference to `[addr, addr + length)`; the last reference
    /// unregisters every chunk. An unregister failure is surfaced but the
    /// entry is never re-installed.
    pub async fn remove(&self, addr: u64, length: u64, max_shard_size: u64) -> Result<()> {
        self.check_shard_size(max_shard_size)?;

        {
            let mut regions = self.lock_regions()?;
            let Some(index) = regions
                .iter()
                .position(|entry| entry.addr == addr && entry.length == length)
            else {
                return Err(StoreError::NotFound(format!(
                    "registered region {addr:#x}+{length}"
                )));
            };
            regions[index].refcount -= 1;
            if regions[index].refcount > 0 {
                return Ok(());
            }
            regions.remove(index);
        }

        let mut workers = JoinSet::new();
        let mut first_error: Option<anyhow::Error> = None;
        for (chunk_addr, _) in chunks(addr, length, self.chunk_size) {
            if workers.len() >= MAX_REGISTRATION_WORKERS {
                if let Some(joined) = workers.join_next().await {
                    record_unregister_outcome(joined, &mut first_error);
                }
            }
            let transfer = Arc::clone(&self.transfer);
            workers.spawn(async move { transfer.unregister_local_memory(chunk_addr).await });
        }
        while let Some(joined) = workers.join_next().await {
            record_unregister_outcome(joined, &mut first_error);
        }

        match first_error {
            Some(err) => Err(StoreError::Transport(err)),
            None => Ok(()),
        }
    }

    /// Number of live registry entries.
    pub fn region_count(&self) -> usize {
        self.regions.lock().map(|regions| regions.len()).unwrap_or(0)
    }

    fn check_shard_size(&self, max_shard_size: u64) -> Result<()> {
        if max_shard_size == 0
            || !max_shard_size.is_power_of_two()
            || self.chunk_size % max_shard_size != 0
        {
            return Err(StoreError::InvalidArgument(format!(
                "max_shard_size {max_shard_size} must be a power of two dividing the chunk size {}",
                self.chunk_size
            )));
        }
        Ok(())
    }

    fn lock_regions(&self) -> Result<std::sync::MutexGuard<'_, Vec<RegionEntry>>> {
        self.regions
            .lock()
            .map_err(|_| StoreError::Transport(anyhow!("memory registry lock poisoned")))
    }

    fn release_entry(&self, addr: u64, length: u64) {
        let Ok(mut regions) = self.regions.lock() else {
            return;
        };
        let Some(index) = regions
            .iter()
            .position(|entry| entry.addr == addr && entry.length == length)
        else {
            return;
        };
        regions[index].refcount -= 1;
        if regions[index].refcount == 0 {
            regions.remove(index);
        }
    }
}

/// `(addr, length)` of every chunk covering `[addr, addr + length)`; the
/// last chunk may be short.
fn chunks(addr: u64, length: u64, chunk_size: u64) -> Vec<(u64, u64)> {
    let mut out = Vec::new();
    let mut offset = 0u64;
    while offset < length {
        out.push((addr + offset, chunk_size.min(length - offset)));
        offset += chunk_size;
    }
    out
}

fn record_chunk_outcome(
    joined: std::result::Result<anyhow::Result<u64>, tokio::task::JoinError>,
    registered: &mut Vec<u64>,
    first_error: &mut Option<anyhow::Error>,
) {
    match joined {
        Ok(Ok(chunk_addr)) => registered.push(chunk_addr),
        Ok(Err(err)) => {
            if first_error.is_none() {
                *first_error = Some(err);
            }
        }
        Err(join_err) => {
            if first_error.is_none() {
                *first_error = Some(anyhow!("registration worker failed: {join_err}"));
            }
        }
    }
}

fn record_unregister_outcome(
    joined: std::result::Result<anyhow::Result<()>, tokio::task::JoinError>,
    first_error: &mut Option<anyhow::Error>,
) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            if first_error.is_none() {
                *first_error = Some(err);
            }
        }
        Err(join_err) => {
            if first_error.is_none() {
                *first_error = Some(anyhow!("unregistration worker failed: {join_err}"));
            }
        }
    }
}
