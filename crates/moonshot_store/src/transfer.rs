//! Narrow contract of the one-sided transfer substrate, plus an
//! in-process loopback implementation of it.
//!
//! The production substrate is an external engine that pins memory
//! windows with the NIC and executes batched one-sided reads and writes;
//! this module only fixes the surface the coordinator drives. The
//! loopback substrate keeps every segment in the current process and
//! copies bytes directly, which is enough to run the full replication
//! flow in demos and tests without transfer hardware.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail};
use async_trait::async_trait;

/// Handle for a group of transfer tasks submitted together.
pub type BatchId = u64;

/// Substrate-local identifier of a resolved segment.
pub type SegmentId = i64;

/// Direction of a one-sided transfer, from the submitter's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOpcode {
    /// Pull bytes from the target into local memory.
    Read,
    /// Push local bytes into the target.
    Write,
}

/// Lifecycle states reported for a submitted transfer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Waiting,
    Pending,
    Invalid,
    Cancelled,
    Completed,
    Timeout,
    Failed,
}

impl TransferState {
    /// Whether the task is still in flight and worth polling again.
    pub fn is_in_flight(self) -> bool {
        matches!(self, TransferState::Waiting | TransferState::Pending)
    }
}

/// One transfer task: move `length` bytes between the local virtual
/// address `source` and `(target_id, target_offset)` on the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRequest {
    pub opcode: TransferOpcode,
    pub source: u64,
    pub target_id: SegmentId,
    pub target_offset: u64,
    pub length: u64,
}

/// One-sided transfer substrate as seen by the coordinator.
///
/// Calls may block on device completion; the coordinator fans work out
/// across tasks rather than assuming any call returns quickly.
#[async_trait]
pub trait TransferBackend: Send + Sync {
    /// Pin `[addr, addr + length)` for one-sided access, tagged with a
    /// device location hint such as `"cpu:0"`.
    async fn register_local_memory(
        &self,
        addr: u64,
        length: u64,
        location: &str,
    ) -> anyhow::Result<()>;

    /// Release a window previously pinned at `addr`.
    async fn unregister_local_memory(&self, addr: u64) -> anyhow::Result<()>;

    /// Allocate a handle for up to `capacity` tasks.
    async fn allocate_batch(&self, capacity: usize) -> anyhow::Result<BatchId>;

    /// Release a batch handle.
    async fn free_batch(&self, batch: BatchId) -> anyhow::Result<()>;

    /// Submit tasks on `batch`; task indices follow submission order.
    async fn submit(&self, batch: BatchId, requests: &[TransferRequest]) -> anyhow::Result<()>;

    /// State of the `task`-th request of `batch`, plus bytes moved so far.
    async fn status(&self, batch: BatchId, task: usize) -> anyhow::Result<(TransferState, u64)>;

    /// Resolve a cluster-wide segment name to this substrate's id for it.
    async fn resolve_segment(&self, name: &str) -> anyhow::Result<SegmentId>;

    /// Tear the substrate down.
    async fn close(&self) -> anyhow::Result<()>;
}

/// In-process transfer fabric shared by a set of [`LoopbackNode`]s.
///
/// Each node joins under its segment name; reads and writes resolve
/// `(segment_id, offset)` against that segment's registered windows and
/// copy within the process. Offsets are plain virtual addresses, exactly
/// as the coordinator publishes them.
#[derive(Debug, Clone, Default)]
pub struct LoopbackCluster {
    inner: Arc<Mutex<LoopbackState>>,
}

#[derive(Debug, Default)]
struct LoopbackState {
    next_segment: SegmentId,
    next_batch: BatchId,
    segments: HashMap<String, SegmentId>,
    /// Registered windows per segment: `(addr, length)` per chunk.
    windows: HashMap<SegmentId, Vec<(u64, u64)>>,
    /// Terminal state per task of each live batch.
    batches: HashMap<BatchId, Vec<TransferState>>,
}

impl LoopbackCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the fabric as `segment_name`; rejoining under the same name
    /// yields a node for the same segment.
    pub fn node(&self, segment_name: &str) -> LoopbackNode {
        let mut state = self.lock();
        let segment_id = match state.segments.get(segment_name) {
            Some(&id) => id,
            None => {
                state.next_segment += 1;
                let id = state.next_segment;
                state.segments.insert(segment_name.to_string(), id);
                state.windows.entry(id).or_default();
                id
            }
        };
        LoopbackNode {
            cluster: self.clone(),
            segment_id,
            segment_name: segment_name.to_string(),
        }
    }

    /// Total number of registered windows across every segment.
    pub fn total_windows(&self) -> usize {
        self.lock().windows.values().map(Vec::len).sum()
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        // The fabric mutex only guards table updates; a poisoning panic
        // inside them would leave no consistent state worth recovering.
        match self.inner.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl LoopbackState {
    fn window_covers(&self, segment_id: SegmentId, addr: u64, length: u64) -> bool {
        let Some(windows) = self.windows.get(&segment_id) else {
            return false;
        };
        windows.iter().any(|&(start, len)| {
            addr >= start && addr.saturating_add(length) <= start.saturating_add(len)
        })
    }
}

/// One segment's view of a [`LoopbackCluster`].
#[derive(Debug, Clone)]
pub struct LoopbackNode {
    cluster: LoopbackCluster,
    segment_id: SegmentId,
    segment_name: String,
}

impl LoopbackNode {
    pub fn segment_name(&self) -> &str {
        &self.segment_name
    }
}

#[async_trait]
impl TransferBackend for LoopbackNode {
    async fn register_local_memory(
        &self,
        addr: u64,
        length: u64,
        _location: &str,
    ) -> anyhow::Result<()> {
        let mut state = self.cluster.lock();
        let windows = state.windows.entry(self.segment_id).or_default();
        if windows.iter().any(|&(start, _)| start == addr) {
            bail!("segment `{}` already registered a window at {addr:#x}", self.segment_name);
        }
        windows.push((addr, length));
        Ok(())
    }

    async fn unregister_local_memory(&self, addr: u64) -> anyhow::Result<()> {
        let mut state = self.cluster.lock();
        let windows = state
            .windows
            .get_mut(&self.segment_id)
            .ok_or_else(|| anyhow!("segment `{}` has no windows", self.segment_name))?;
        let Some(index) = windows.iter().position(|&(start, _)| start == addr) else {
            bail!("segment `{}` has no window at {addr:#x}", self.segment_name);
        };
        windows.remove(index);
        Ok(())
    }

    async fn allocate_batch(&self, capacity: usize) -> anyhow::Result<BatchId> {
        let mut state = self.cluster.lock();
        state.next_batch += 1;
        let batch = state.next_batch;
        state.batches.insert(batch, Vec::with_capacity(capacity));
        Ok(batch)
    }

    async fn free_batch(&self, batch: BatchId) -> anyhow::Result<()> {
        let mut state = self.cluster.lock();
        state
            .batches
            .remove(&batch)
            .map(|_| ())
            .ok_or_else(|| anyhow!("unknown batch {batch}"))
    }

    async fn submit(&self, batch: BatchId, requests: &[TransferRequest]) -> anyhow::Result<()> {
        let mut state = self.cluster.lock();
        for request in requests {
            if !state.window_covers(self.segment_id, request.source, request.length) {
                bail!(
                    "local range {:#x}+{} is not registered with segment `{}`",
                    request.source,
                    request.length,
                    self.segment_name
                );
            }
            if !state.window_covers(request.target_id, request.target_offset, request.length) {
                bail!(
                    "target range {:#x}+{} is not registered with segment {}",
                    request.target_offset,
                    request.length,
                    request.target_id
                );
            }
        }
        let outcomes: Vec<TransferState> = requests
            .iter()
            .map(|request| {
                // SAFETY: both ranges were just validated against windows
                // registered by live nodes of this process, and the
                // coordinator never issues concurrent transfers that touch
                // the same destination bytes.
                unsafe {
                    let len = request.length as usize;
                    match request.opcode {
                        TransferOpcode::Read => std::ptr::copy_nonoverlapping(
                            request.target_offset as usize as *const u8,
                            request.source as usize as *mut u8,
                            len,
                        ),
                        TransferOpcode::Write => std::ptr::copy_nonoverlapping(
                            request.source as usize as *const u8,
                            request.target_offset as usize as *mut u8,
                            len,
                        ),
                    }
                }
                TransferState::Completed
            })
            .collect();
        let Some(tasks) = state.batches.get_mut(&batch) else {
            bail!("unknown batch {batch}");
        };
        tasks.extend(outcomes);
        Ok(())
    }

    async fn status(&self, batch: BatchId, task: usize) -> anyhow::Result<(TransferState, u64)> {
        let state = self.cluster.lock();
        let tasks = state
            .batches
            .get(&batch)
            .ok_or_else(|| anyhow!("unknown batch {batch}"))?;
        let task_state = tasks
            .get(task)
            .copied()
            .ok_or_else(|| anyhow!("batch {batch} has no task {task}"))?;
        Ok((task_state, 0))
    }

    async fn resolve_segment(&self, name: &str) -> anyhow::Result<SegmentId> {
        let state = self.cluster.lock();
        state
            .segments
            .get(name)
            .copied()
            .ok_or_else(|| anyhow!("unknown segment `{name}`"))
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
