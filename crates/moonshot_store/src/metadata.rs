//! Cluster-wide checkpoint metadata and the transactional client it is
//! stored through.
//!
//! Checkpoints live in an external strongly-consistent key-value store
//! under `moonshot/checkpoint/<name>`. The value has no single owner:
//! concurrent mutators synchronize with compare-and-swap on the key's
//! modification revision, and an update that leaves every shard without a
//! single location deletes the key in the same transaction, which folds
//! garbage collection into the normal update path.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, ConnectOptions, GetOptions, Txn, TxnOp};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Key prefix for every checkpoint entry in the metadata store.
pub const CHECKPOINT_KEY_PREFIX: &str = "moonshot/checkpoint/";

/// Default per-RPC deadline for metadata operations.
pub const DEFAULT_METADATA_TIMEOUT: Duration = Duration::from_secs(5);

/// Where some bytes live: a stable node identifier plus a byte offset into
/// that node's virtual address space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub segment_name: String,
    pub offset: u64,
}

/// A contiguous byte range of a checkpoint and the locations it can be
/// read from. A shard with neither gold nor replica locations is dead.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub length: u64,
    /// Producer-owned authoritative sources.
    pub gold: Vec<Location>,
    /// Consumer-held copies, preferred over gold when present.
    pub replica_list: Vec<Location>,
}

impl Shard {
    /// Source to use for transfer attempt `attempt`.
    ///
    /// The first attempt randomizes across the healthy set (replicas when
    /// any exist, otherwise gold); later attempts walk
    /// `replica_list ++ gold` in order so a retrying caller eventually
    /// tries every advertised location. `None` once the ladder is
    /// exhausted.
    pub fn select_location(&self, attempt: usize) -> Option<&Location> {
        if attempt == 0 {
            self.random_location()
        } else {
            self.indexed_location(attempt - 1)
        }
    }

    fn random_location(&self) -> Option<&Location> {
        let mut rng = rand::thread_rng();
        if !self.replica_list.is_empty() {
            self.replica_list.get(rng.gen_range(0..self.replica_list.len()))
        } else if !self.gold.is_empty() {
            self.gold.get(rng.gen_range(0..self.gold.len()))
        } else {
            None
        }
    }

    fn indexed_location(&self, index: usize) -> Option<&Location> {
        if index < self.replica_list.len() {
            self.replica_list.get(index)
        } else {
            self.gold.get(index - self.replica_list.len())
        }
    }
}

/// Cluster-wide logical artifact: an ordered sequence of shards cut from
/// the producer's contiguous regions, region by region, each region
/// contributing `ceil(size / max_shard_size)` shards with the last
/// possibly short.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub name: String,
    /// Convenience copy of the total size; `size_list` is authoritative.
    pub size: u64,
    /// Producer-declared region lengths, in registration order.
    pub size_list: Vec<u64>,
    /// Shard granularity; a power of two.
    pub max_shard_size: u64,
    pub shards: Vec<Shard>,
}

impl Checkpoint {
    /// Total payload size, summed from the authoritative `size_list`.
    pub fn total_size(&self) -> u64 {
        self.size_list.iter().sum()
    }

    /// Whether every shard has lost both its gold and replica locations.
    /// An empty checkpoint is defunct and must leave the metadata store.
    pub fn is_empty(&self) -> bool {
        self.shards
            .iter()
            .all(|shard| shard.gold.is_empty() && shard.replica_list.is_empty())
    }
}

fn checkpoint_key(name: &str) -> String {
    format!("{CHECKPOINT_KEY_PREFIX}{name}")
}

/// Transactional view of the external metadata store.
///
/// `update` is the only synchronization primitive: it applies iff the
/// key's modification revision still equals the revision observed by a
/// prior `get`, and reports "not applied" as `Ok(false)` rather than an
/// error. Implementations must delete the key instead of writing it when
/// the supplied checkpoint has become empty.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Unconditional write, used when a producer first publishes a name.
    async fn put(&self, name: &str, checkpoint: &Checkpoint) -> anyhow::Result<()>;

    /// Current value and its revision, or `None` when the key is absent.
    async fn get(&self, name: &str) -> anyhow::Result<Option<(Checkpoint, i64)>>;

    /// Compare-and-swap against `expected_revision`.
    async fn update(
        &self,
        name: &str,
        checkpoint: &Checkpoint,
        expected_revision: i64,
    ) -> anyhow::Result<bool>;

    /// Every checkpoint whose name starts with `prefix`, in key order.
    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<Checkpoint>>;

    /// Release the client.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Metadata client backed by an etcd cluster.
///
/// Every call is wrapped in a per-RPC deadline on top of whatever
/// cancellation the caller applies to the future itself.
pub struct EtcdMetadataStore {
    client: Client,
    timeout: Duration,
}

impl EtcdMetadataStore {
    /// Connect to the metadata store at `metadata_uri` with the default
    /// per-RPC deadline.
    pub async fn connect(metadata_uri: &str) -> anyhow::Result<Self> {
        Self::connect_with_timeout(metadata_uri, DEFAULT_METADATA_TIMEOUT).await
    }

    pub async fn connect_with_timeout(
        metadata_uri: &str,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let options = ConnectOptions::new().with_connect_timeout(timeout);
        let client = tokio::time::timeout(timeout, Client::connect([metadata_uri], Some(options)))
            .await
            .map_err(|_| anyhow::anyhow!("etcd connect timed out for {metadata_uri}"))?
            .with_context(|| format!("etcd connect failed for {metadata_uri}"))?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl MetadataStore for EtcdMetadataStore {
    async fn put(&self, name: &str, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        let value = serde_json::to_vec(checkpoint)
            .with_context(|| format!("encode checkpoint `{name}`"))?;
        let mut kv = self.client.kv_client();
        tokio::time::timeout(self.timeout, kv.put(checkpoint_key(name), value, None))
            .await
            .map_err(|_| anyhow::anyhow!("etcd put timed out for `{name}`"))?
            .with_context(|| format!("etcd put failed for `{name}`"))?;
        Ok(())
    }

    async fn get(&self, name: &str) -> anyhow::Result<Option<(Checkpoint, i64)>> {
        let mut kv = self.client.kv_client();
        let response = tokio::time::timeout(self.timeout, kv.get(checkpoint_key(name), None))
            .await
            .map_err(|_| anyhow::anyhow!("etcd get timed out for `{name}`"))?
            .with_context(|| format!("etcd get failed for `{name}`"))?;
        let Some(entry) = response.kvs().first() else {
            return Ok(None);
        };
        let checkpoint = serde_json::from_slice(entry.value())
            .with_context(|| format!("decode checkpoint `{name}`"))?;
        Ok(Some((checkpoint, entry.mod_revision())))
    }

    async fn update(
        &self,
        name: &str,
        checkpoint: &Checkpoint,
        expected_revision: i64,
    ) -> anyhow::Result<bool> {
        let key = checkpoint_key(name);
        let compare = Compare::mod_revision(key.as_str(), CompareOp::Equal, expected_revision);
        // An update that empties the checkpoint removes the key in the
        // same transaction.
        let apply = if checkpoint.is_empty() {
            TxnOp::delete(key.as_str(), None)
        } else {
            let value = serde_json::to_vec(checkpoint)
                .with_context(|| format!("encode checkpoint `{name}`"))?;
            TxnOp::put(key.as_str(), value, None)
        };
        let txn = Txn::new().when([compare]).and_then([apply]);
        let mut kv = self.client.kv_client();
        let response = tokio::time::timeout(self.timeout, kv.txn(txn))
            .await
            .map_err(|_| anyhow::anyhow!("etcd update timed out for `{name}`"))?
            .with_context(|| format!("etcd update failed for `{name}`"))?;
        Ok(response.succeeded())
    }

    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<Checkpoint>> {
        let mut kv = self.client.kv_client();
        let options = GetOptions::new().with_prefix();
        let response =
            tokio::time::timeout(self.timeout, kv.get(checkpoint_key(prefix), Some(options)))
                .await
                .map_err(|_| anyhow::anyhow!("etcd list timed out for prefix `{prefix}`"))?
                .with_context(|| format!("etcd list failed for prefix `{prefix}`"))?;
        let mut checkpoints = Vec::with_capacity(response.kvs().len());
        for entry in response.kvs() {
            let checkpoint: Checkpoint = serde_json::from_slice(entry.value())
                .with_context(|| format!("decode checkpoint at `{:?}`", entry.key_str()))?;
            checkpoints.push(checkpoint);
        }
        Ok(checkpoints)
    }

    async fn close(&self) -> anyhow::Result<()> {
        // Dropping the client tears down its channels.
        Ok(())
    }
}

/// In-process metadata store with etcd-compatible revision semantics.
///
/// Backs embedded and demo deployments and the test suite. A store-wide
/// counter stands in for etcd's revision: every applied write stamps the
/// key with the next value, and an absent key compares as revision 0.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    inner: Mutex<MemoryStoreState>,
}

#[derive(Debug, Default)]
struct MemoryStoreState {
    revision: i64,
    entries: BTreeMap<String, (Checkpoint, i64)>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, MemoryStoreState>> {
        self.inner
            .lock()
            .map_err(|_| anyhow::anyhow!("metadata store lock poisoned"))
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn put(&self, name: &str, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        let mut state = self.lock()?;
        state.revision += 1;
        let revision = state.revision;
        state
            .entries
            .insert(checkpoint_key(name), (checkpoint.clone(), revision));
        Ok(())
    }

    async fn get(&self, name: &str) -> anyhow::Result<Option<(Checkpoint, i64)>> {
        let state = self.lock()?;
        Ok(state.entries.get(&checkpoint_key(name)).cloned())
    }

    async fn update(
        &self,
        name: &str,
        checkpoint: &Checkpoint,
        expected_revision: i64,
    ) -> anyhow::Result<bool> {
        let key = checkpoint_key(name);
        let mut state = self.lock()?;
        let current = state
            .entries
            .get(&key)
            .map(|(_, revision)| *revision)
            .unwrap_or(0);
        if current != expected_revision {
            return Ok(false);
        }
        if checkpoint.is_empty() {
            state.entries.remove(&key);
        } else {
            state.revision += 1;
            let revision = state.revision;
            state.entries.insert(key, (checkpoint.clone(), revision));
        }
        Ok(true)
    }

    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<Checkpoint>> {
        let start = checkpoint_key(prefix);
        let state = self.lock()?;
        Ok(state
            .entries
            .range(start.clone()..)
            .take_while(|(key, _)| key.starts_with(&start))
            .map(|(_, (checkpoint, _))| checkpoint.clone())
            .collect())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
