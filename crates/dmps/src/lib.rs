// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # DMPS - Datagram-TLS Message Processing Stack
//!
//! A pure Rust message processing stack for (D)TLS endpoints: the layer
//! between a raw record layer and the handshake logic. DMPS presents
//! handshake, alert, ChangeCipherSpec and application-data messages as
//! typed, streamable objects with well-defined boundaries and epochs,
//! hiding fragmentation, reassembly, replay handling and flight accounting.
//!
//! ## Quick Start
//!
//! ```rust
//! use dmps::record::mem::{MemoryRecordLayer, NullTransform};
//! use dmps::timer::ManualTimer;
//! use dmps::{Mps, MpsConfig, Result};
//!
//! fn main() -> Result<()> {
//!     let mut mps = Mps::new(
//!         MpsConfig::datagram(),
//!         MemoryRecordLayer::new(),
//!         Box::new(ManualTimer::new()),
//!     );
//!
//!     let epoch = mps.add_key_material(Box::new(NullTransform))?;
//!     mps.set_incoming_keys(epoch)?;
//!     mps.set_outgoing_keys(epoch)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        Handshake Logic                             |
//! |        read / read_handshake / write_handshake / dispatch          |
//! +--------------------------------------------------------------------+
//! |                             DMPS                                   |
//! |  Flight State Machine | Reassembly Window | Retransmission Backup  |
//! |  Detection Table      | Epoch Registry    | Readers / Writers      |
//! +--------------------------------------------------------------------+
//! |                        Record Layer (port)                         |
//! |        framing | AEAD | record replay window | datagram packing    |
//! +--------------------------------------------------------------------+
//! |                           Transport                                |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Mps`] | The stack instance: public read/write surface |
//! | [`MpsConfig`] | Mode (stream/datagram) and retransmission timeouts |
//! | [`record::RecordLayer`] | Port to the record layer beneath |
//! | [`timer::Timer`] | Externally driven two-stage retransmission timer |
//! | [`MsgFlags`] | A message's contribution to the current flight |
//!
//! ## Non-blocking contract
//!
//! No operation blocks. When progress depends on the transport, operations
//! return [`Error::WantRead`] / [`Error::WantWrite`] and record the
//! dependency; the caller re-invokes after servicing it. Retransmission
//! timeouts are delivered through the installed [`timer::Timer`], never
//! read from a wall clock.
//!
//! The instance is single-threaded by design: confine it to one thread and
//! serialize access externally if needed.

/// Global configuration (protocol constants, runtime config).
pub mod config;
/// Retransmission detection over the last incoming flight.
pub mod detect;
/// Epoch registry (key-material identity and lifetime).
pub mod epoch;
/// Behavioural error types.
pub mod error;
/// Flight-exchange state machine vocabulary.
pub mod flight;
/// Incoming handshake reassembly engine.
pub mod incoming;
/// The MPS instance and public message API.
pub mod mps;
/// Outgoing pipeline and retransmission backups.
pub mod outgoing;
/// Abstract record-layer port plus the in-memory loopback.
pub mod record;
/// Pausable zero-copy readers and writers.
pub mod stream;
/// Two-stage retransmission timer port.
pub mod timer;
/// Shared message-level types.
pub mod types;

pub use config::{Mode, MpsConfig};
pub use epoch::{EpochId, EpochRegistry, Transform};
pub use error::{Error, Result};
pub use flight::{FlightState, RetransmitState};
pub use incoming::HandshakeIn;
pub use mps::{HandshakeOutHandle, Mps};
pub use outgoing::{Backup, Handle, RewriteFn};
pub use stream::{Reader, ReaderExt, Writer, WriterExt};
pub use types::{
    deps, Alert, BlockReason, ConnectionState, Deps, MsgFlags, MsgKind, ALERT_CLOSE_NOTIFY,
    ALERT_INTERNAL_ERROR,
};
