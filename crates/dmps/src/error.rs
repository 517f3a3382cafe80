// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for the message processing stack.
//!
//! Errors are behavioural, not numeric: callers dispatch on what an error
//! *means* for the driving loop (retry after I/O, abort the connection,
//! fix the calling code), never on wire-level codes.
//!
//! # Classes
//!
//! | Class | Variants | Caller reaction |
//! |-------|----------|-----------------|
//! | Transient | `WantRead`, `WantWrite`, `Retry` | re-invoke once the dependency clears |
//! | Programmer error | `InvalidArgument`, `InvalidState`, `InvariantViolation`, `BoundsExceeded` | fix the calling code |
//! | Peer misbehaviour | `ProtocolViolation` | connection enters `Blocked` |
//! | Terminal | `FatalAlertSent`, `FatalAlertReceived`, `Blocked` | flush pending alert, then free |
//! | Resource | `BufferExhausted`, `FlightTooLong`, `SequenceOverflow` | drop offending data or abort handshake |

use crate::epoch::EpochId;
use crate::types::Alert;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by MPS operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // ========================================================================
    // Transient I/O conditions (not failures)
    // ========================================================================
    /// Progress requires the underlying transport to produce data.
    WantRead,
    /// Progress requires the underlying transport to accept data.
    WantWrite,
    /// Transient condition inside the record layer; retry the same call.
    Retry,

    // ========================================================================
    // Programmer errors
    // ========================================================================
    /// An argument violated a documented constraint.
    InvalidArgument(&'static str),
    /// The operation is not legal in the current read/write/flight state.
    InvalidState(&'static str),
    /// An internal invariant did not hold. Always a bug, never a runtime
    /// condition; the connection is no longer usable.
    InvariantViolation(&'static str),
    /// A bounded reader or writer was asked to move past its declared length.
    BoundsExceeded,

    // ========================================================================
    // Peer misbehaviour
    // ========================================================================
    /// The peer sent something inconsistent (mismatched fragment metadata,
    /// out-of-window sequence number, malformed alert).
    ProtocolViolation(&'static str),

    // ========================================================================
    // Terminal conditions
    // ========================================================================
    /// A fatal alert has been sent; only `flush` may still be called.
    FatalAlertSent(Alert),
    /// A fatal alert has been received from the peer.
    FatalAlertReceived(Alert),
    /// The instance is blocked after a previous terminal condition.
    /// Query [`Mps::error_state`](crate::Mps::error_state) for the reason.
    Blocked,

    // ========================================================================
    // Resource limits
    // ========================================================================
    /// No reassembly slot is available for the offered fragment.
    /// Transient from the protocol's point of view: the peer will retransmit.
    BufferExhausted,
    /// The outgoing flight already contains the maximum number of messages.
    FlightTooLong,
    /// The handshake sequence number space is exhausted.
    SequenceOverflow,
    /// The referenced epoch is not present in the registry.
    EpochUnknown(EpochId),
}

impl Error {
    /// Whether re-invoking the failed operation can succeed without any
    /// change to the MPS itself (only to its external dependencies).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::WantRead | Error::WantWrite | Error::Retry | Error::BufferExhausted
        )
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::WantRead => write!(f, "want read: transport must produce data"),
            Error::WantWrite => write!(f, "want write: transport must accept data"),
            Error::Retry => write!(f, "transient record-layer condition, retry"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Error::InvalidState(msg) => write!(f, "invalid state: {}", msg),
            Error::InvariantViolation(msg) => write!(f, "invariant violation: {}", msg),
            Error::BoundsExceeded => write!(f, "declared message length exceeded"),
            Error::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            Error::FatalAlertSent(a) => write!(f, "fatal alert sent (type {})", a),
            Error::FatalAlertReceived(a) => write!(f, "fatal alert received (type {})", a),
            Error::Blocked => write!(f, "MPS is blocked"),
            Error::BufferExhausted => write!(f, "no future-message buffer available"),
            Error::FlightTooLong => write!(f, "outgoing flight exceeds maximum length"),
            Error::SequenceOverflow => write!(f, "handshake sequence number space exhausted"),
            Error::EpochUnknown(id) => write!(f, "unknown epoch id {}", id),
        }
    }
}

impl std::error::Error for Error {}
