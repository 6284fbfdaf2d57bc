//! Error kinds shared across every core component.
//!
//! Public core operations return `Result<_, CoreError>` (or a typed outcome
//! carrying an `Option<CoreError>`-shaped field) and never panic or unwind.
//! Config-loading helpers are the one exception: those remain fail-fast,
//! `.expect()`-based initialization helpers outside the reactor, matching
//! the teacher crate's own `*Config::from_file` convention.

use thiserror::Error;

/// The six semantic error kinds the core can report.
#[derive(Debug, Error)]
pub enum CoreError {
    /// CAN socket/syscall failure at open/bind/read/write.
    #[error("can I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// TX queue full, or persistent backoff dropped a frame.
    #[error("backpressure: tx queue at {queue_len} frames")]
    BackpressureDrop {
        /// Queue depth observed at the time of the drop.
        queue_len: usize,
    },

    /// A received frame could not be decoded (wrong length, malformed payload).
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// Caller-supplied input failed validation (unknown node, bad channel, …).
    #[error("validation error: {0}")]
    Validation(String),

    /// Local strategy version is ahead of an incoming cloud update.
    #[error("reply conflict: local version {local_version} > incoming {incoming_version}")]
    ReplyConflict {
        /// Version currently held locally.
        local_version: u32,
        /// Version carried by the rejected incoming update.
        incoming_version: u32,
    },

    /// Interface reset via `ip link` failed or timed out.
    #[error("interface reset failed: {0}")]
    ResetFailed(String),
}

/// Convenience alias used throughout the core.
pub type CoreResult<T> = Result<T, CoreError>;
