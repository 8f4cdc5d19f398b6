//! Error types for the NTB transport.

use thiserror::Error;

/// Unrecoverable per-queue failure.
///
/// These replace the hard stop a kernel driver would take on a broken ring
/// invariant. Only the affected queue is failed; other queues keep running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FatalError {
    /// A cursor published by the peer, or computed locally, lies outside the
    /// queue's partition.
    #[error("queue {queue}: ring offset {offset} outside partition of {size} bytes")]
    OffsetOutOfBounds {
        queue: usize,
        offset: usize,
        size: usize,
    },
    /// The bridge reported a hardware error.
    #[error("hardware error reported by the bridge")]
    HardwareError,
}

/// Transport operation errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Another transport is already registered with this bridge.
    #[error("a transport is already registered with this bridge")]
    AlreadyRegistered,
    /// Every queue slot is in use.
    #[error("no free queue slot")]
    NoFreeQueue,
    /// No free entry or allocation failure.
    #[error("out of memory")]
    OutOfMemory,
    /// The queue's logical link is down.
    #[error("queue link is down")]
    LinkDown,
    /// Payload exceeds the queue's current maximum payload size.
    #[error("payload too large: {len} bytes, max {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },
    /// The queue has been failed by a fatal error.
    #[error("queue failed: {0}")]
    QueueFailed(FatalError),
    /// Operation is not valid in the queue's current state.
    #[error("operation not permitted: {0}")]
    NotPermitted(&'static str),
    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Hardware access failed.
    #[error("hardware: {0}")]
    Hardware(String),
    /// IO error, e.g. a worker thread could not be spawned.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, Error>;
