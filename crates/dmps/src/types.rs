// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared message-level types: kinds, flight flags, dependency bitmask,
//! connection state.

/// (D)TLS alert description code. Kept abstract: this layer only
/// distinguishes fatal from non-fatal delivery.
pub type Alert = u8;

/// The `close_notify` alert sent on orderly shutdown.
pub const ALERT_CLOSE_NOTIFY: Alert = 0;

/// Alert sent to the peer when an internal error blocks the stack.
pub const ALERT_INTERNAL_ERROR: Alert = 80;

/// Content kind of a message exposed by the public read/write surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    /// A (reassembled) handshake message.
    Handshake,
    /// Application data.
    ApplicationData,
    /// An alert.
    Alert,
    /// A ChangeCipherSpec message.
    ChangeCipherSpec,
}

/// Contribution of a message to the current flight and handshake.
///
/// Set by the handshake logic via `read_set_flags` / `write_set_flags`;
/// drives flight-state transitions on `consume` / `dispatch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgFlags {
    /// The message does not belong to the handshake flight structure
    /// (e.g. application data interleaved after the handshake).
    None,
    /// The message belongs to the current flight but more will follow.
    Contributes,
    /// The message is the last one of the current flight.
    EndsFlight,
    /// The message is the last one of the entire handshake.
    EndsHandshake,
}

impl MsgFlags {
    /// Whether the message is remembered for retransmission purposes.
    pub fn contributes(self) -> bool {
        !matches!(self, MsgFlags::None)
    }

    /// Whether consuming/dispatching the message closes the flight.
    pub fn closes_flight(self) -> bool {
        matches!(self, MsgFlags::EndsFlight | MsgFlags::EndsHandshake)
    }
}

/// Bitflags signalling which external interfaces must become available
/// before the MPS can make progress.
pub mod deps {
    /// The underlying transport must produce data.
    pub const BLOCK_READ: u8 = 1 << 0;
    /// The underlying transport must accept data.
    pub const BLOCK_WRITE: u8 = 1 << 1;
}

/// Dependency bitmask, a bitwise OR of [`deps`] flags.
pub type Deps = u8;

/// Reason an MPS instance entered the `Blocked` connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// We sent a fatal alert of the given type.
    AlertSent(Alert),
    /// The peer sent a fatal alert of the given type.
    AlertReceived(Alert),
    /// An internal error made the instance unusable.
    InternalError(&'static str),
}

/// Connection state of an MPS instance.
///
/// Guards every public entry point: see the state table in the crate docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Both directions are usable.
    Open,
    /// The peer closed its writing side; we may still send.
    WriteOnly,
    /// We closed our writing side; the peer may still send.
    ReadOnly,
    /// The connection is fully closed.
    Closed,
    /// Terminal error state; only `flush` and the state accessors remain legal.
    Blocked,
}

impl ConnectionState {
    /// Whether read operations are admissible in this state.
    pub fn may_read(self) -> bool {
        matches!(self, ConnectionState::Open | ConnectionState::ReadOnly)
    }

    /// Whether write operations are admissible in this state.
    pub fn may_write(self) -> bool {
        matches!(self, ConnectionState::Open | ConnectionState::WriteOnly)
    }
}
