// engine error types.

use thiserror::Error;

/// Hard ceiling on pending entries per channel ring.
pub const MAX_QUEUE_SIZE: usize = 1024;

/// Parked-instruction count at which a queue starts cancelling new
/// instructions of the same type instead of parking them.
pub const MAX_DIRTY: usize = 64;

/// Errors surfaced by the engine
///
/// Matching and backpressure errors are local to the operation that
/// triggered them and never close the channel. `Internal` indicates a
/// scheduler bug; it is never retried or swallowed.
#[derive(Debug, Error)]
pub enum Error {
    /// A ring buffer or buffer policy was requested with capacity zero
    #[error("can't create a ring buffer of size 0")]
    ZeroCapacity,

    /// A single channel accumulated more than [`MAX_QUEUE_SIZE`] pending
    /// entries
    #[error("no more than {MAX_QUEUE_SIZE} pending puts are allowed on a single channel")]
    Backpressure,

    /// A sleep was offered as a select arm
    #[error("sleep is not a valid event for select")]
    InvalidSelectArm,

    /// An async bridge was used on a channel with no registered queue
    #[error("channel is not registered with the scheduler")]
    Unregistered,

    /// An internal invariant was violated; continuing would corrupt buffer
    /// or queue state
    #[error("internal invariant violated: {0}")]
    Internal(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
