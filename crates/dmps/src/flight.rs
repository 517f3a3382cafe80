// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Flight-exchange state machine types.
//!
//! The state machine itself is driven by [`Mps`](crate::Mps); this module
//! holds its vocabulary and the retransmission backoff arithmetic.
//!
//! ```text
//!             write first msg                dispatch EndsFlight
//!   Done ----------------------> Send -----------------------------> Await
//!    ^                            ^                                    |
//!    |  EndsHandshake consumed    | flight complete (EndsFlight read)  | first peer msg
//!    |                            |                                    v
//!    +--------- Finalize <--- [dispatch FinishHandshake]           Receive
//!         (quiescence elapsed)
//! ```
//!
//! `Await` retransmits the whole last flight on timeout with exponential
//! backoff; `Receive` requests retransmission instead (in DTLS 1.2 both are
//! a full resend, the distinction is kept so an ACK-based scheme can slot
//! in); `Finalize` keeps the terminal flight resendable until a quiescence
//! period passes without peer activity.

/// Phase of the flight exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightState {
    /// No flight exchange in progress.
    Done,
    /// Our flight is out; nothing of the peer's answer seen yet.
    /// A timeout here means the peer may have missed our flight entirely.
    Await,
    /// At least one message of the peer's flight arrived, implicitly
    /// acknowledging ours.
    Receive,
    /// We are writing our next outgoing flight.
    Send,
    /// The exchange ended with our terminal flight; we hold it back for
    /// the quiescence period in case the peer missed it.
    Finalize,
}

/// Ongoing retransmission activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetransmitState {
    /// Nothing in progress.
    None,
    /// Resending our last outgoing flight (`Await` / `Finalize`).
    Resend,
    /// Requesting retransmission from the peer (`Receive`). Handled as a
    /// full resend in DTLS 1.2.
    RequestResend,
}

/// Waiting-state bookkeeping: current timeout and resend cursor.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WaitState {
    /// Current retransmission timeout (ms); doubles per timeout up to the
    /// configured ceiling.
    pub(crate) retransmit_timeout_ms: u32,
    /// Index into the backup array where an interrupted resend resumes.
    pub(crate) resend_offset: usize,
}

impl WaitState {
    pub(crate) fn new(initial_timeout_ms: u32) -> Self {
        Self {
            retransmit_timeout_ms: initial_timeout_ms,
            resend_offset: 0,
        }
    }

    /// Apply exponential backoff: `timeout <- min(2 * timeout, max)`.
    pub(crate) fn backoff(&mut self, max_ms: u32) {
        self.retransmit_timeout_ms = self
            .retransmit_timeout_ms
            .saturating_mul(2)
            .min(max_ms);
    }

    /// Reset to the initial timeout (flight boundary).
    pub(crate) fn reset(&mut self, initial_timeout_ms: u32) {
        self.retransmit_timeout_ms = initial_timeout_ms;
        self.resend_offset = 0;
    }
}
