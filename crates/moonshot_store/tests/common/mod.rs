//! Shared helpers for coordinator integration tests.
//!
//! Tests run the real engine against the in-process metadata store and the
//! loopback transfer fabric, scaled down from production sizes: 1 MiB
//! registration chunks instead of 4 GiB, so a few-MiB buffer exercises the
//! same chunking and sharding structure.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use moonshot_store::{
    BatchId, CheckpointEngine, EngineConfig, LoopbackCluster, LoopbackNode, MemoryMetadataStore,
    MetadataStore, SegmentId, TransferBackend, TransferRequest, TransferState,
};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * 1024;

/// Registration chunk size used by test engines.
pub const TEST_CHUNK_SIZE: u64 = MIB;

/// One shared metadata store plus one loopback fabric, standing in for a
/// cluster of peers.
pub struct TestCluster {
    pub metadata: Arc<MemoryMetadataStore>,
    pub fabric: LoopbackCluster,
}

impl TestCluster {
    pub fn new() -> Self {
        Self {
            metadata: Arc::new(MemoryMetadataStore::new()),
            fabric: LoopbackCluster::new(),
        }
    }

    pub fn config(&self, segment_name: &str) -> EngineConfig {
        let mut config = EngineConfig::new("memory://embedded", segment_name);
        config.chunk_size = TEST_CHUNK_SIZE;
        config
    }

    /// Engine joined to the fabric under `segment_name`.
    pub fn engine(&self, segment_name: &str) -> CheckpointEngine {
        self.engine_with_backend(segment_name, Arc::new(self.fabric.node(segment_name)))
    }

    /// Engine with a custom backend (fault injection wrappers).
    pub fn engine_with_backend(
        &self,
        segment_name: &str,
        backend: Arc<dyn TransferBackend>,
    ) -> CheckpointEngine {
        CheckpointEngine::with_metadata_store(
            &self.config(segment_name),
            Arc::clone(&self.metadata) as Arc<dyn MetadataStore>,
            backend,
        )
        .expect("engine")
    }
}

/// Heap buffer whose address is handed to the engine as a raw region.
///
/// Kept alive for as long as the region stays registered; the loopback
/// fabric copies through the raw address.
pub struct TestBuffer {
    data: Vec<u8>,
}

impl TestBuffer {
    /// Deterministically patterned content.
    pub fn patterned(len: u64, seed: u8) -> Self {
        let data = (0..len)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect();
        Self { data }
    }

    pub fn zeroed(len: u64) -> Self {
        Self {
            data: vec![0u8; len as usize],
        }
    }

    pub fn addr(&self) -> u64 {
        self.data.as_ptr() as u64
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Backend wrapper that fails transfers against scripted segments while
/// recording every submitted request.
pub struct FlakyBackend {
    inner: LoopbackNode,
    fail_segments: Mutex<HashSet<SegmentId>>,
    fail_all: Mutex<bool>,
    failed_batches: Mutex<HashMap<BatchId, usize>>,
    submitted: Mutex<Vec<TransferRequest>>,
}

impl FlakyBackend {
    pub fn new(inner: LoopbackNode) -> Self {
        Self {
            inner,
            fail_segments: Mutex::new(HashSet::new()),
            fail_all: Mutex::new(false),
            failed_batches: Mutex::new(HashMap::new()),
            submitted: Mutex::new(Vec::new()),
        }
    }

    /// Every transfer targeting `segment` reports `Failed`.
    pub fn fail_segment(&self, segment: SegmentId) {
        self.fail_segments.lock().unwrap().insert(segment);
    }

    /// Every transfer reports `Failed`, whatever it targets.
    pub fn fail_everything(&self) {
        *self.fail_all.lock().unwrap() = true;
    }

    pub fn submitted(&self) -> Vec<TransferRequest> {
        self.submitted.lock().unwrap().clone()
    }

    /// Segment id for `name`, for scripting failures against it.
    pub async fn resolve(&self, name: &str) -> SegmentId {
        self.inner.resolve_segment(name).await.expect("segment")
    }

    fn should_fail(&self, request: &TransferRequest) -> bool {
        *self.fail_all.lock().unwrap()
            || self.fail_segments.lock().unwrap().contains(&request.target_id)
    }
}

#[async_trait]
impl TransferBackend for FlakyBackend {
    async fn register_local_memory(
        &self,
        addr: u64,
        length: u64,
        location: &str,
    ) -> anyhow::Result<()> {
        self.inner.register_local_memory(addr, length, location).await
    }

    async fn unregister_local_memory(&self, addr: u64) -> anyhow::Result<()> {
        self.inner.unregister_local_memory(addr).await
    }

    async fn allocate_batch(&self, capacity: usize) -> anyhow::Result<BatchId> {
        self.inner.allocate_batch(capacity).await
    }

    async fn free_batch(&self, batch: BatchId) -> anyhow::Result<()> {
        self.failed_batches.lock().unwrap().remove(&batch);
        self.inner.free_batch(batch).await
    }

    async fn submit(&self, batch: BatchId, requests: &[TransferRequest]) -> anyhow::Result<()> {
        self.submitted.lock().unwrap().extend_from_slice(requests);
        if requests.iter().any(|request| self.should_fail(request)) {
            // The device accepted the batch; completion will report failure.
            self.failed_batches
                .lock()
                .unwrap()
                .insert(batch, requests.len());
            return Ok(());
        }
        self.inner.submit(batch, requests).await
    }

    async fn status(&self, batch: BatchId, task: usize) -> anyhow::Result<(TransferState, u64)> {
        if self.failed_batches.lock().unwrap().contains_key(&batch) {
            return Ok((TransferState::Failed, 0));
        }
        self.inner.status(batch, task).await
    }

    async fn resolve_segment(&self, name: &str) -> anyhow::Result<SegmentId> {
        self.inner.resolve_segment(name).await
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.inner.close().await
    }
}

/// Backend wrapper counting substrate registrations and releases.
pub struct CountingBackend {
    inner: LoopbackNode,
    pub registers: Mutex<usize>,
    pub unregisters: Mutex<usize>,
}

impl CountingBackend {
    pub fn new(inner: LoopbackNode) -> Self {
        Self {
            inner,
            registers: Mutex::new(0),
            unregisters: Mutex::new(0),
        }
    }

    pub fn counts(&self) -> (usize, usize) {
        (*self.registers.lock().unwrap(), *self.unregisters.lock().unwrap())
    }
}

#[async_trait]
impl TransferBackend for CountingBackend {
    async fn register_local_memory(
        &self,
        addr: u64,
        length: u64,
        location: &str,
    ) -> anyhow::Result<()> {
        self.inner.register_local_memory(addr, length, location).await?;
        *self.registers.lock().unwrap() += 1;
        Ok(())
    }

    async fn unregister_local_memory(&self, addr: u64) -> anyhow::Result<()> {
        self.inner.unregister_local_memory(addr).await?;
        *self.unregisters.lock().unwrap() += 1;
        Ok(())
    }

    async fn allocate_batch(&self, capacity: usize) -> anyhow::Result<BatchId> {
        self.inner.allocate_batch(capacity).await
    }

    async fn free_batch(&self, batch: BatchId) -> anyhow::Result<()> {
        self.inner.free_batch(batch).await
    }

    async fn submit(&self, batch: BatchId, requests: &[TransferRequest]) -> anyhow::Result<()> {
        self.inner.submit(batch, requests).await
    }

    async fn status(&self, batch: BatchId, task: usize) -> anyhow::Result<(TransferState, u64)> {
        self.inner.status(batch, task).await
    }

    async fn resolve_segment(&self, name: &str) -> anyhow::Result<SegmentId> {
        self.inner.resolve_segment(name).await
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.inner.close().await
    }
}
