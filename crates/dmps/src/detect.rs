// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Retransmission detection over the last incoming flight.
//!
//! DTLS 1.2 has no per-message acknowledgements: peers retransmit flights in
//! their entirety. If *every* replayed message triggered a resend of our own
//! last flight, one peer retransmission would trigger as many resends as the
//! flight has messages. The table therefore keeps each remembered message in
//! one of two states:
//!
//! - `Enabled`: a replay triggers a resend, keeps this slot enabled, and
//!   puts every *other* slot on hold.
//! - `OnHold`: a replay re-arms the slot to `Enabled` without resending.
//!
//! Net effect: exactly one resend per peer-retransmitted flight, without
//! depending on which of its messages survives the network.

use crate::config::MAX_FLIGHT_LENGTH;
use crate::epoch::EpochId;

/// Whether a remembered message currently triggers retransmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Enabled,
    OnHold,
}

#[derive(Debug, Clone, Copy)]
struct RecognitionInfo {
    epoch: EpochId,
    seq: u16,
    state: SlotState,
}

/// Decision for one observed handshake record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Replay of a remembered message in `Enabled` state: resend our last
    /// outgoing flight.
    Resend,
    /// Replay of a remembered message in `OnHold` state: swallow it.
    Ignore,
    /// Not a remembered message; forward to the reassembly engine.
    Miss,
}

/// Memory of the current or last incoming flight.
#[derive(Debug, Default)]
pub struct DetectionTable {
    slots: Vec<RecognitionInfo>,
}

impl DetectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a received flight message. Silently ignores overflow past
    /// [`MAX_FLIGHT_LENGTH`] entries and duplicates; detection memory is
    /// best-effort, correctness is carried by the reassembly engine.
    pub fn remember(&mut self, epoch: EpochId, seq: u16) {
        if self.slots.len() >= MAX_FLIGHT_LENGTH {
            log::warn!(
                "detection table full, not remembering (epoch {}, seq {})",
                epoch,
                seq
            );
            return;
        }
        if self.slots.iter().any(|s| s.epoch == epoch && s.seq == seq) {
            return;
        }
        self.slots.push(RecognitionInfo {
            epoch,
            seq,
            state: SlotState::Enabled,
        });
    }

    /// Classify an observed handshake record.
    pub fn check(&mut self, epoch: EpochId, seq: u16) -> Verdict {
        let hit = self
            .slots
            .iter()
            .position(|s| s.epoch == epoch && s.seq == seq);
        let Some(idx) = hit else {
            return Verdict::Miss;
        };

        match self.slots[idx].state {
            SlotState::Enabled => {
                // One trigger disarms the whole table; subsequent replays
                // re-arm slot by slot without resending.
                for slot in &mut self.slots {
                    slot.state = SlotState::OnHold;
                }
                log::debug!(
                    "replay of (epoch {}, seq {}) detected, triggering resend",
                    epoch,
                    seq
                );
                Verdict::Resend
            }
            SlotState::OnHold => {
                self.slots[idx].state = SlotState::Enabled;
                Verdict::Ignore
            }
        }
    }

    /// Forget the remembered flight.
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Number of remembered messages.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(seqs: &[u16]) -> DetectionTable {
        let mut t = DetectionTable::new();
        for &s in seqs {
            t.remember(1, s);
        }
        t
    }

    #[test]
    fn test_unknown_message_is_miss() {
        let mut t = table_with(&[10, 11, 12]);
        assert_eq!(t.check(1, 13), Verdict::Miss);
        assert_eq!(t.check(2, 10), Verdict::Miss, "epoch participates in identity");
    }

    #[test]
    fn test_single_resend_per_replayed_flight() {
        let mut t = table_with(&[10, 11, 12]);

        // first replay resends and disarms the table
        assert_eq!(t.check(1, 12), Verdict::Resend);
        assert_eq!(t.check(1, 12), Verdict::Ignore);
        assert_eq!(t.check(1, 10), Verdict::Ignore);
        assert_eq!(t.check(1, 11), Verdict::Ignore);
    }

    #[test]
    fn test_on_hold_rearms() {
        let mut t = table_with(&[10, 11]);
        assert_eq!(t.check(1, 10), Verdict::Resend);
        assert_eq!(t.check(1, 11), Verdict::Ignore, "on hold");
        // 11 was re-armed by the previous check
        assert_eq!(t.check(1, 11), Verdict::Resend);
    }

    #[test]
    fn test_full_flight_replays_trigger_once_each() {
        let mut t = table_with(&[10, 11, 12]);

        // peer retransmits its whole flight: exactly one resend
        assert_eq!(t.check(1, 10), Verdict::Resend);
        assert_eq!(t.check(1, 11), Verdict::Ignore);
        assert_eq!(t.check(1, 12), Verdict::Ignore);

        // and again: still exactly one resend
        let verdicts = [t.check(1, 10), t.check(1, 11), t.check(1, 12)];
        assert_eq!(
            verdicts.iter().filter(|v| **v == Verdict::Resend).count(),
            1
        );
    }

    #[test]
    fn test_capacity_bounded() {
        let mut t = DetectionTable::new();
        for seq in 0..10 {
            t.remember(0, seq);
        }
        assert_eq!(t.len(), MAX_FLIGHT_LENGTH);
        // overflowed entries were never remembered
        assert_eq!(t.check(0, 9), Verdict::Miss);
    }

    #[test]
    fn test_duplicate_remember_ignored() {
        let mut t = DetectionTable::new();
        t.remember(0, 5);
        t.remember(0, 5);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_clear() {
        let mut t = table_with(&[1, 2]);
        t.clear();
        assert!(t.is_empty());
        assert_eq!(t.check(1, 1), Verdict::Miss);
    }
}
