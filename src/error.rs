//! Error types for the connection engine: configuration errors, resource
//! exhaustion and internal-invariant failures.
//!
//! Protocol violations coming off the wire are never surfaced as errors;
//! they are handled inside the state machine (segment dropped, ACK or RST
//! issued) per RFC 793.

use std::{error, fmt, result};

/// A convenience wrapper around `Result` for `loadgen::Error`.
pub type Result<T> = result::Result<T, Error>;

/// Set of errors that can occur in the connection engine.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// A timeout was scheduled past the range covered by its timer wheel.
    TimerOutOfRange {
        /// Requested timeout in microseconds.
        timeout_us: u64,
        /// Largest timeout the wheel can hold (`buckets * step`).
        max_us: u64,
    },
    /// An event was dispatched that is not valid for the current state.
    InvalidEvent {
        /// Name of the state the control block was in.
        state: &'static str,
        /// Name of the offending event.
        event: &'static str,
    },
    /// No free control block left in the per-worker pool.
    PoolExhausted {
        /// Fixed capacity of the pool.
        capacity: usize,
    },
    /// A handle referred to a control block that has already been released.
    StaleHandle,
    /// A connection with the same 5-tuple already exists in the lookup table.
    DuplicateConnection,
    /// An operation referenced a test case id this worker does not run.
    UnknownTestCase(u32),
    /// An internal invariant did not hold. Indicates a bug in the engine,
    /// reported as an error instead of aborting the worker.
    Invariant(InvariantError),
}

impl error::Error for Error {}

impl From<InvariantError> for Error {
    fn from(err: InvariantError) -> Error {
        Error::Invariant(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::TimerOutOfRange { timeout_us, max_us } => {
                write!(
                    f,
                    "timeout of {timeout_us}us exceeds the wheel range of {max_us}us"
                )
            }
            Error::InvalidEvent { state, event } => {
                write!(f, "event {event} is not valid in state {state}")
            }
            Error::PoolExhausted { capacity } => {
                write!(
                    f,
                    "no free control block in the pool (capacity {capacity})"
                )
            }
            Error::StaleHandle => {
                write!(f, "handle refers to a released control block")
            }
            Error::DuplicateConnection => {
                write!(f, "connection already exists for this 5-tuple")
            }
            Error::UnknownTestCase(tcid) => {
                write!(f, "test case {tcid} is not configured on this worker")
            }
            Error::Invariant(ref err) => fmt::Display::fmt(err, f),
        }
    }
}

/// Internal invariant violations. Any of these indicates a bug rather than
/// a recoverable runtime condition.
#[derive(Debug)]
#[non_exhaustive]
pub enum InvariantError {
    /// The application consumed more bytes than the segment contained.
    DeliveredTooMuch {
        /// Bytes the application reported as consumed.
        delivered: usize,
        /// Bytes actually handed to the application.
        available: usize,
    },
    /// The retransmission queue was asked to drop more bytes than it holds.
    RetransUnderflow {
        /// Bytes acknowledged by the peer.
        acked: u32,
        /// Bytes currently queued.
        queued: usize,
    },
    /// A send offset pointed past the end of the retransmission queue.
    SendOffsetOutOfBounds {
        /// Requested offset into the queue.
        offset: usize,
        /// Total queued bytes.
        total: usize,
    },
}

impl error::Error for InvariantError {}

impl fmt::Display for InvariantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            InvariantError::DeliveredTooMuch {
                delivered,
                available,
            } => {
                write!(
                    f,
                    "application delivered {delivered} bytes but only {available} were available"
                )
            }
            InvariantError::RetransUnderflow { acked, queued } => {
                write!(
                    f,
                    "peer acknowledged {acked} bytes but the retransmission queue holds {queued}"
                )
            }
            InvariantError::SendOffsetOutOfBounds { offset, total } => {
                write!(
                    f,
                    "send offset {offset} is out of bounds for a queue of {total} bytes"
                )
            }
        }
    }
}
