//! The checkpoint coordinator: the public API that sequences metadata,
//! memory registration, and shard transfers.
//!
//! Per local name the coordinator enforces a four-state machine observable
//! through the catalog:
//!
//! ```text
//! absent --register-----> gold    --unregister----> absent
//! absent --get_replica--> replica --delete_replica-> absent
//! ```
//!
//! Every other transition is rejected as already-open/already-closed.
//! Metadata mutations that only move local state forward (unregister,
//! delete_replica, replica finalization) retry compare-and-swap conflicts
//! indefinitely; callers bound them with their own deadline.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::warn;

use crate::catalog::{Catalog, CatalogEntry};
use crate::error::{Result, StoreError};
use crate::memory::{RegisteredMemory, DEFAULT_CHUNK_SIZE};
use crate::metadata::{
    Checkpoint, EtcdMetadataStore, Location, MetadataStore, Shard, DEFAULT_METADATA_TIMEOUT,
};
use crate::transfer::{BatchId, TransferBackend, TransferOpcode, TransferRequest, TransferState};

/// Maximum transfer attempts per shard before giving up.
pub const MAX_RETRY_COUNT: usize = 8;

/// Upper bound on concurrently in-flight shard transfers per call.
const MAX_TRANSFER_WORKERS: usize = 16;

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Endpoint of the metadata store, e.g. `http://127.0.0.1:2379`.
    pub metadata_uri: String,
    /// Stable cluster-wide identifier of this node's memory segment.
    pub local_segment_name: String,
    /// Registration chunk size; a power of two that every checkpoint's
    /// `max_shard_size` must divide.
    pub chunk_size: u64,
    /// Per-RPC deadline for metadata operations.
    pub metadata_timeout: Duration,
    /// Device location hint handed to the substrate at registration time.
    pub location_tag: String,
}

impl EngineConfig {
    /// Production defaults for the given endpoint and segment name.
    pub fn new(metadata_uri: impl Into<String>, local_segment_name: impl Into<String>) -> Self {
        Self {
            metadata_uri: metadata_uri.into(),
            local_segment_name: local_segment_name.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            metadata_timeout: DEFAULT_METADATA_TIMEOUT,
            location_tag: "cpu:0".to_string(),
        }
    }
}

/// Summary of one stored checkpoint, as returned by
/// [`CheckpointEngine::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointInfo {
    pub name: String,
    pub max_shard_size: u64,
    /// Sum of the producer-declared region lengths.
    pub total_size: u64,
    pub size_list: Vec<u64>,
}

/// Coordinator for publishing, replicating, and retiring checkpoints.
///
/// The engine owns the local catalog and memory registry exclusively; the
/// checkpoint value in the metadata store is shared with every peer and
/// only ever mutated through revision compare-and-swap.
pub struct CheckpointEngine {
    local_segment_name: String,
    catalog: Catalog,
    memory: RegisteredMemory,
    metadata: Arc<dyn MetadataStore>,
    transfer: Arc<dyn TransferBackend>,
}

impl CheckpointEngine {
    /// Connect to the metadata store named by `config` and assemble an
    /// engine over the given transfer substrate. The config is validated
    /// before any collaborator is touched.
    pub async fn connect(
        config: &EngineConfig,
        transfer: Arc<dyn TransferBackend>,
    ) -> Result<Self> {
        check_config(config)?;
        let metadata =
            EtcdMetadataStore::connect_with_timeout(&config.metadata_uri, config.metadata_timeout)
                .await?;
        Self::with_metadata_store(config, Arc::new(metadata), transfer)
    }

    /// Assemble an engine over explicit collaborators; used when embedding
    /// an in-process metadata store or substituting test doubles.
    pub fn with_metadata_store(
        config: &EngineConfig,
        metadata: Arc<dyn MetadataStore>,
        transfer: Arc<dyn TransferBackend>,
    ) -> Result<Self> {
        check_config(config)?;
        Ok(Self {
            local_segment_name: config.local_segment_name.clone(),
            catalog: Catalog::new(),
            memory: RegisteredMemory::new(
                Arc::clone(&transfer),
                config.chunk_size,
                config.location_tag.clone(),
            ),
            metadata,
            transfer,
        })
    }

    /// Segment name this engine publishes its locations under.
    pub fn local_segment_name(&self) -> &str {
        &self.local_segment_name
    }

    /// Publish the regions `(addr_list[i], size_list[i])` as checkpoint
    /// `name`, pinning them and writing the shard map with this node as
    /// the single gold source of every shard.
    pub async fn register(
        &self,
        name: &str,
        addr_list: &[u64],
        size_list: &[u64],
        max_shard_size: u64,
    ) -> Result<()> {
        check_region_lists(name, addr_list, size_list)?;
        if self.catalog.contains(name)? {
            return Err(StoreError::AlreadyOpen(name.to_string()));
        }

        let mut shards = Vec::new();
        let mut registered: Vec<(u64, u64)> = Vec::new();
        for (&addr, &size) in addr_list.iter().zip(size_list) {
            if let Err(err) = self.memory.add(addr, size, max_shard_size).await {
                self.unwind_registrations(&registered, max_shard_size).await;
                return Err(err);
            }
            registered.push((addr, size));

            let mut offset = 0u64;
            while offset < size {
                shards.push(Shard {
                    length: max_shard_size.min(size - offset),
                    gold: vec![Location {
                        segment_name: self.local_segment_name.clone(),
                        offset: addr + offset,
                    }],
                    replica_list: Vec::new(),
                });
                offset += max_shard_size;
            }
        }

        let checkpoint = Checkpoint {
            name: name.to_string(),
            size: size_list.iter().sum(),
            size_list: size_list.to_vec(),
            max_shard_size,
            shards,
        };
        if let Err(err) = self.metadata.put(name, &checkpoint).await {
            self.unwind_registrations(&registered, max_shard_size).await;
            return Err(StoreError::Transport(err));
        }

        self.catalog.add(
            name,
            CatalogEntry {
                is_gold: true,
                addr_list: addr_list.to_vec(),
                size_list: size_list.to_vec(),
                max_shard_size,
            },
        )?;
        Ok(())
    }

    /// Withdraw this node's gold locations from `name` and release the
    /// pinned regions. The metadata key disappears once the update leaves
    /// the checkpoint without any location.
    pub async fn unregister(&self, name: &str) -> Result<()> {
        let Some(entry) = self.catalog.get(name)? else {
            return Err(StoreError::AlreadyClosed(name.to_string()));
        };

        loop {
            let Some((mut checkpoint, revision)) = self.metadata.get(name).await? else {
                return Err(StoreError::NotFound(format!("checkpoint `{name}`")));
            };
            for shard in &mut checkpoint.shards {
                shard.gold.clear();
            }
            if self.metadata.update(name, &checkpoint, revision).await? {
                break;
            }
        }

        self.catalog.remove(name)?;
        self.unwind_registrations(&entry_regions(&entry), entry.max_shard_size)
            .await;
        Ok(())
    }

    /// Pull `name` into the given local regions, shard by shard, then
    /// advertise this node as a replica of every shard.
    ///
    /// The destination layout must produce exactly the checkpoint's shard
    /// count: regions are consumed in order and each contributes
    /// `ceil(size / max_shard_size)` tasks. A failed transfer aborts
    /// before the metadata update but keeps the destination regions
    /// registered, so the caller can reissue the call.
    pub async fn get_replica(
        &self,
        name: &str,
        addr_list: &[u64],
        size_list: &[u64],
    ) -> Result<()> {
        check_region_lists(name, addr_list, size_list)?;
        if self.catalog.contains(name)? {
            return Err(StoreError::AlreadyOpen(name.to_string()));
        }

        let Some((checkpoint, revision)) = self.metadata.get(name).await? else {
            return Err(StoreError::NotFound(format!("checkpoint `{name}`")));
        };
        let max_shard_size = checkpoint.max_shard_size;
        if max_shard_size == 0 {
            return Err(StoreError::InvalidArgument(format!(
                "checkpoint `{name}` carries a zero max_shard_size"
            )));
        }
        let planned: u64 = size_list
            .iter()
            .map(|size| size.div_ceil(max_shard_size))
            .sum();
        if planned != checkpoint.shards.len() as u64 {
            return Err(StoreError::InvalidArgument(format!(
                "destination layout yields {planned} shard tasks but `{name}` has {}",
                checkpoint.shards.len()
            )));
        }

        let mut registered: Vec<(u64, u64)> = Vec::new();
        for (&addr, &size) in addr_list.iter().zip(size_list) {
            if let Err(err) = self.memory.add(addr, size, max_shard_size).await {
                self.unwind_registrations(&registered, max_shard_size).await;
                return Err(err);
            }
            registered.push((addr, size));
        }

        let mut workers = JoinSet::new();
        let mut first_error: Option<StoreError> = None;
        let mut task_id = 0usize;
        for (&addr, &size) in addr_list.iter().zip(size_list) {
            let mut offset = 0u64;
            while offset < size {
                let destination = addr + offset;
                let shard = checkpoint.shards[task_id].clone();
                task_id += 1;
                offset += max_shard_size;

                if workers.len() >= MAX_TRANSFER_WORKERS {
                    if let Some(joined) = workers.join_next().await {
                        record_transfer_outcome(joined, &mut first_error);
                    }
                }
                let transfer = Arc::clone(&self.transfer);
                workers.spawn(async move { perform_transfer(transfer, destination, shard).await });
            }
        }
        while let Some(joined) = workers.join_next().await {
            record_transfer_outcome(joined, &mut first_error);
        }

        if let Some(err) = first_error {
            // No replica claim was published; the destination regions stay
            // registered for a reissue.
            return Err(err);
        }

        self.finalize_replica(name, addr_list, size_list, checkpoint, revision)
            .await
    }

    /// Append this node's replica locations to every shard, in the same
    /// task order the transfers used, retrying the compare-and-swap until
    /// it lands on a current revision.
    async fn finalize_replica(
        &self,
        name: &str,
        addr_list: &[u64],
        size_list: &[u64],
        mut checkpoint: Checkpoint,
        mut revision: i64,
    ) -> Result<()> {
        loop {
            let max_shard_size = checkpoint.max_shard_size;
            let mut task_id = 0usize;
            for (&addr, &size) in addr_list.iter().zip(size_list) {
                let mut offset = 0u64;
                while offset < size {
                    let Some(shard) = checkpoint.shards.get_mut(task_id) else {
                        return Err(StoreError::InvalidArgument(format!(
                            "checkpoint `{name}` shard list shrank during finalization"
                        )));
                    };
                    shard.replica_list.push(Location {
                        segment_name: self.local_segment_name.clone(),
                        offset: addr + offset,
                    });
                    task_id += 1;
                    offset += max_shard_size;
                }
            }

            if self.metadata.update(name, &checkpoint, revision).await? {
                self.catalog.add(
                    name,
                    CatalogEntry {
                        is_gold: false,
                        addr_list: addr_list.to_vec(),
                        size_list: size_list.to_vec(),
                        max_shard_size,
                    },
                )?;
                return Ok(());
            }

            let Some((current, current_revision)) = self.metadata.get(name).await? else {
                return Err(StoreError::NotFound(format!("checkpoint `{name}`")));
            };
            checkpoint = current;
            revision = current_revision;
        }
    }

    /// Withdraw every replica location this node advertised for `name`
    /// and release the pinned destination regions.
    pub async fn delete_replica(&self, name: &str) -> Result<()> {
        let Some(entry) = self.catalog.get(name)? else {
            return Err(StoreError::AlreadyClosed(name.to_string()));
        };

        loop {
            let Some((mut checkpoint, revision)) = self.metadata.get(name).await? else {
                return Err(StoreError::NotFound(format!("checkpoint `{name}`")));
            };
            for shard in &mut checkpoint.shards {
                shard
                    .replica_list
                    .retain(|replica| replica.segment_name != self.local_segment_name);
            }
            if self.metadata.update(name, &checkpoint, revision).await? {
                break;
            }
        }

        self.catalog.remove(name)?;
        self.unwind_registrations(&entry_regions(&entry), entry.max_shard_size)
            .await;
        Ok(())
    }

    /// Summaries of every checkpoint whose name starts with `name_prefix`,
    /// in key order.
    pub async fn list(&self, name_prefix: &str) -> Result<Vec<CheckpointInfo>> {
        let checkpoints = self.metadata.list(name_prefix).await?;
        Ok(checkpoints
            .into_iter()
            .map(|checkpoint| CheckpointInfo {
                total_size: checkpoint.total_size(),
                name: checkpoint.name,
                max_shard_size: checkpoint.max_shard_size,
                size_list: checkpoint.size_list,
            })
            .collect())
    }

    /// Close the substrate, then the metadata client. The first failure is
    /// reported; teardown continues regardless.
    pub async fn close(&self) -> Result<()> {
        let mut first_error: Option<anyhow::Error> = None;
        if let Err(err) = self.transfer.close().await {
            first_error = Some(err);
        }
        if let Err(err) = self.metadata.close().await {
            if first_error.is_none() {
                first_error = Some(err);
            } else {
                warn!(error = ?err, "cascading error closing metadata store");
            }
        }
        match first_error {
            Some(err) => Err(StoreError::Transport(err)),
            None => Ok(()),
        }
    }

    /// Best-effort release of regions pinned earlier in the same call or
    /// recorded in a catalog entry. Failures are logged and swallowed so
    /// the original error stays visible.
    async fn unwind_registrations(&self, regions: &[(u64, u64)], max_shard_size: u64) {
        for &(addr, size) in regions {
            if let Err(err) = self.memory.remove(addr, size, max_shard_size).await {
                warn!(error = ?err, addr, size, "cascading error releasing region");
            }
        }
    }
}

fn check_config(config: &EngineConfig) -> Result<()> {
    if config.local_segment_name.is_empty() {
        return Err(StoreError::InvalidArgument(
            "local segment name must not be empty".to_string(),
        ));
    }
    if config.chunk_size == 0 || !config.chunk_size.is_power_of_two() {
        return Err(StoreError::InvalidArgument(format!(
            "chunk size {} must be a power of two",
            config.chunk_size
        )));
    }
    Ok(())
}

fn check_region_lists(name: &str, addr_list: &[u64], size_list: &[u64]) -> Result<()> {
    if name.is_empty() {
        return Err(StoreError::InvalidArgument(
            "checkpoint name must not be empty".to_string(),
        ));
    }
    if addr_list.is_empty() || addr_list.len() != size_list.len() {
        return Err(StoreError::InvalidArgument(
            "address and size lists must be parallel and non-empty".to_string(),
        ));
    }
    Ok(())
}

fn entry_regions(entry: &CatalogEntry) -> Vec<(u64, u64)> {
    entry
        .addr_list
        .iter()
        .copied()
        .zip(entry.size_list.iter().copied())
        .collect()
}

fn record_transfer_outcome(
    joined: std::result::Result<Result<()>, tokio::task::JoinError>,
    first_error: &mut Option<StoreError>,
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
                *first_error =
                    Some(StoreError::Transport(anyhow::anyhow!(
                        "transfer worker failed: {join_err}"
                    )));
            }
        }
    }
}

/// Pull one shard into `destination`, retrying across the shard's
/// advertised locations until one completes or the ladder runs dry.
async fn perform_transfer(
    transfer: Arc<dyn TransferBackend>,
    destination: u64,
    shard: Shard,
) -> Result<()> {
    let mut attempts = 0usize;
    for attempt in 0..MAX_RETRY_COUNT {
        let Some(location) = shard.select_location(attempt) else {
            break;
        };
        attempts += 1;

        let target_id = transfer.resolve_segment(&location.segment_name).await?;
        let batch = transfer.allocate_batch(1).await?;
        let request = TransferRequest {
            opcode: TransferOpcode::Read,
            source: destination,
            target_id,
            target_offset: location.offset,
            length: shard.length,
        };

        let outcome = drive_batch(transfer.as_ref(), batch, request).await;
        if let Err(err) = transfer.free_batch(batch).await {
            warn!(error = ?err, batch, "cascading error releasing transfer batch");
        }

        match outcome {
            Ok(TransferState::Completed) => return Ok(()),
            Ok(state) => {
                warn!(
                    ?state,
                    attempt,
                    segment = %location.segment_name,
                    offset = location.offset,
                    "shard transfer attempt failed"
                );
            }
            Err(err) => return Err(StoreError::Transport(err)),
        }
    }
    Err(StoreError::TooManyRetries(attempts))
}

/// Submit one request on `batch` and poll it to a terminal state.
async fn drive_batch(
    transfer: &dyn TransferBackend,
    batch: BatchId,
    request: TransferRequest,
) -> anyhow::Result<TransferState> {
    transfer.submit(batch, &[request]).await?;
    loop {
        let (state, _transferred) = transfer.status(batch, 0).await?;
        if !state.is_in_flight() {
            return Ok(state);
        }
    }
}
