//! Peer-to-peer checkpoint store for large model-training artifacts.
//!
//! A training process registers one or more in-memory regions under a
//! logical name; inference processes on other hosts pull that content
//! directly into their own registered regions over a one-sided transfer
//! substrate, then advertise themselves as additional replicas for later
//! consumers. A strongly-consistent external key-value store holds the
//! cluster-wide map from checkpoint name to gold (producer) and replica
//! (consumer) locations, mutated lock-free with compare-and-swap on
//! per-key revisions.
//!
//! [`CheckpointEngine`] is the public entry point. The metadata store and
//! the transfer substrate sit behind trait seams so deployments can pick
//! etcd or an embedded store, and tests can substitute doubles; the
//! [`transfer::LoopbackCluster`] substrate runs the whole flow inside one
//! process.

pub mod catalog;
pub mod engine;
pub mod error;
pub mod memory;
pub mod metadata;
pub mod transfer;

pub use engine::{CheckpointEngine, CheckpointInfo, EngineConfig, MAX_RETRY_COUNT};
pub use error::{Result, StoreError};
pub use metadata::{
    Checkpoint, EtcdMetadataStore, Location, MemoryMetadataStore, MetadataStore, Shard,
    CHECKPOINT_KEY_PREFIX,
};
pub use transfer::{
    BatchId, LoopbackCluster, LoopbackNode, SegmentId, TransferBackend, TransferOpcode,
    TransferRequest, TransferState,
};
