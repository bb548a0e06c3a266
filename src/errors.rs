//! Crate-wide error taxonomy.
//!
//! `rips` split its error space into a `TxError` for the send path and an
//! `RxError` for the receive path. Golden Gate's ports are bidirectional and
//! the protocol, client and stack layers all share the same recoverable /
//! fatal distinction, so here the two are unified into one `GgError` with the
//! same hand-rolled `Display`/`Error` style `rips::errors` used.

use std::error::Error;
use std::fmt;
use std::io;

/// Uniform error type returned by every public Golden Gate API.
#[derive(Debug)]
pub enum GgError {
    /// Backpressure: the operation cannot proceed right now. The caller
    /// should register an `OnCanPut` listener and retry once it fires.
    WouldBlock,

    /// Allocation failed while creating a buffer or object.
    OutOfMemory,

    /// The caller violated a documented precondition (bad argument shape,
    /// unknown stack descriptor character, missing parameters, ...).
    InvalidParameters(String),

    /// The operation is not permitted in the object's current state (for
    /// example calling `Start` on a protocol that isn't `Init`).
    InvalidState,

    /// An offset or index fell outside the valid range for the operation.
    OutOfRange,

    /// A buffer was too small to hold the serialized/deserialized result.
    NotEnoughSpace,

    /// A Gattlink data frame arrived with a PSN that was not the expected
    /// next one; the frame was dropped and a corrective ack scheduled.
    GattlinkUnexpectedPsn,

    /// The requested feature or role combination is not supported.
    NotSupported,

    /// A retransmit or handshake exceeded its budget without local
    /// recovery (surfaced informationally; the engine keeps retrying).
    Timeout,

    /// An invariant that should always hold was violated. Indicates a bug.
    Internal(String),

    /// Failure from the underlying transport/I/O layer.
    IoError(io::Error),
}

impl From<io::Error> for GgError {
    fn from(e: io::Error) -> Self {
        GgError::IoError(e)
    }
}

impl From<GgError> for io::Error {
    fn from(e: GgError) -> Self {
        match e {
            GgError::WouldBlock => io::Error::new(io::ErrorKind::WouldBlock, "would block"),
            GgError::IoError(io_e) => io_e,
            other => io::Error::new(io::ErrorKind::Other, format!("{}", other)),
        }
    }
}

impl fmt::Display for GgError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        use GgError::*;
        match *self {
            WouldBlock => write!(fmt, "operation would block"),
            OutOfMemory => write!(fmt, "out of memory"),
            InvalidParameters(ref s) => write!(fmt, "invalid parameters: {}", s),
            InvalidState => write!(fmt, "invalid state for this operation"),
            OutOfRange => write!(fmt, "index or offset out of range"),
            NotEnoughSpace => write!(fmt, "not enough space in buffer"),
            GattlinkUnexpectedPsn => write!(fmt, "unexpected gattlink packet serial number"),
            NotSupported => write!(fmt, "operation not supported"),
            Timeout => write!(fmt, "operation timed out"),
            Internal(ref s) => write!(fmt, "internal error: {}", s),
            IoError(ref e) => write!(fmt, "io error: {}", e),
        }
    }
}

impl Error for GgError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match *self {
            GgError::IoError(ref e) => Some(e),
            _ => None,
        }
    }
}

/// Result alias used throughout the crate, mirroring `rips::TxResult`/`RxResult`.
pub type GgResult<T> = Result<T, GgError>;
