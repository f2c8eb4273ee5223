//! Typed error surface of the checkpoint coordinator.

use thiserror::Error;

/// Errors surfaced by coordinator operations.
///
/// Metadata compare-and-swap conflicts are never errors; the coordinator
/// retries them internally. Substrate and metadata-store failures pass
/// through untranslated inside [`StoreError::Transport`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// Shape mismatches, empty inputs, or a shard size that is not a power
    /// of two dividing the registry chunk size.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The range overlaps an existing registration with different bounds.
    #[error("memory region {addr:#x}+{length} overlaps an existing registration")]
    AddressOverlapped {
        /// Start of the rejected range.
        addr: u64,
        /// Length of the rejected range.
        length: u64,
    },

    /// The name is already live on this node, as gold or replica.
    #[error("checkpoint `{0}` is already open on this node")]
    AlreadyOpen(String),

    /// The name is not live on this node.
    #[error("checkpoint `{0}` is not open on this node")]
    AlreadyClosed(String),

    /// No such entry in the metadata store or the local registry.
    #[error("not found: {0}")]
    NotFound(String),

    /// A shard transfer exhausted every advertised location.
    #[error("shard transfer failed after {0} attempts")]
    TooManyRetries(usize),

    /// Substrate or metadata-store failure.
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
