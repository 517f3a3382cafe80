// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Incoming handshake reassembly engine.
//!
//! Maintains a sliding window of `1 + FUTURE_MESSAGE_BUFFERS` slots: slot 0
//! is the next expected handshake message (`next_seq`), slots `1..` buffer
//! out-of-order successors. Fragments are merged per slot until slot 0 is
//! complete, at which point the reassembled message is handed to the caller
//! through a bounded reader.
//!
//! ```text
//!        slot 0          slot 1..F (future messages)
//!   +-------------+   +---------+---------+-----+
//!   | next_seq    |   | +1      | +2      | ... |
//!   | NoFrag/Win  |   | Window  | None    |     |
//!   +-------------+   +---------+---------+-----+
//!        | consume: shift left, next_seq += 1
//!        v
//!   reader handed to the handshake logic
//! ```
//!
//! Slot 0 may borrow the record payload wholesale when the message arrived
//! unfragmented (`NoFragmentation`): the payload `Vec` moves straight into
//! the reader, no reassembly buffer is allocated. Future messages are
//! always copied, since the record layer's buffer cannot be held across
//! records.
//!
//! Retransmission detection is *not* this engine's job: replays of the last
//! incoming flight are filtered out beforehand (see [`crate::detect`]).

mod window;

use crate::config::FUTURE_MESSAGE_BUFFERS;
use crate::epoch::{EpochId, EpochRegistry};
use crate::error::{Error, Result};
use crate::record::FragmentHeader;
use crate::stream::{Reader, ReaderExt};

use window::ReassemblyWindow;

/// Buffering state of one window slot.
#[derive(Debug)]
enum Slot {
    /// Nothing received for this sequence number.
    None,
    /// Complete single-fragment message, payload borrowed from the record
    /// layer. Only admissible in slot 0.
    NoFragmentation {
        hs_type: u8,
        epoch: EpochId,
        payload: Vec<u8>,
    },
    /// Partially received message being reassembled.
    Window {
        hs_type: u8,
        epoch: EpochId,
        total_len: usize,
        window: ReassemblyWindow,
    },
    /// Slot 0 while its message is lent out through a reader.
    Taken { epoch: EpochId },
}

impl Slot {
    fn is_none(&self) -> bool {
        matches!(self, Slot::None)
    }

    fn complete(&self) -> bool {
        match self {
            Slot::None | Slot::Taken { .. } => false,
            Slot::NoFragmentation { .. } => true,
            Slot::Window { window, .. } => window.complete(),
        }
    }

    fn epoch(&self) -> Option<EpochId> {
        match self {
            Slot::None => None,
            Slot::NoFragmentation { epoch, .. }
            | Slot::Window { epoch, .. }
            | Slot::Taken { epoch } => Some(*epoch),
        }
    }
}

/// Reading state of the engine's public side.
#[derive(Debug)]
enum ReadState {
    /// No message handed out.
    Inactive,
    /// Slot 0's message is lent out through `rd`.
    Active {
        hs_type: u8,
        total_len: usize,
        rd: ReaderExt,
    },
    /// Reading was paused; the unread suffix is preserved.
    Paused {
        hs_type: u8,
        total_len: usize,
        rd: Reader,
        remaining: usize,
    },
}

/// Outcome of feeding one fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOutcome {
    /// The next expected message is now complete and can be requested.
    Ready,
    /// Fragment stored (or ignored as a stale duplicate); nothing
    /// deliverable yet.
    Pending,
}

/// Handle to a complete incoming handshake message.
#[derive(Debug)]
pub struct HandshakeIn<'a> {
    /// Handshake message type (wire value).
    pub hs_type: u8,
    /// Total message length in bytes.
    pub len: usize,
    /// Handshake sequence number of the message.
    pub seq: u16,
    /// Bounded reader over the message body.
    pub reader: &'a mut ReaderExt,
}

/// The reassembly engine.
#[derive(Debug)]
pub struct Reassembly {
    next_seq: u16,
    slots: Vec<Slot>,
    state: ReadState,
}

impl Reassembly {
    /// Create an engine expecting `first_seq` as the next handshake
    /// sequence number.
    pub fn new(first_seq: u16) -> Self {
        Self {
            next_seq: first_seq,
            slots: (0..=FUTURE_MESSAGE_BUFFERS).map(|_| Slot::None).collect(),
            state: ReadState::Inactive,
        }
    }

    /// The next expected handshake sequence number.
    pub fn next_seq(&self) -> u16 {
        self.next_seq
    }

    /// Whether the next expected message is complete and not yet lent out.
    pub fn available(&self) -> bool {
        match self.state {
            ReadState::Inactive => self.slots[0].complete(),
            // a paused message is by definition available again
            ReadState::Paused { .. } => true,
            ReadState::Active { .. } => false,
        }
    }

    /// Epochs currently referenced by window slots (diagnostics/tests).
    pub fn referenced_epochs(&self) -> Vec<EpochId> {
        self.slots.iter().filter_map(Slot::epoch).collect()
    }

    /// Feed one handshake fragment.
    ///
    /// The caller has already filtered replays of the last incoming flight;
    /// stale fragments that still reach the engine are dropped here.
    pub fn feed(
        &mut self,
        reg: &mut EpochRegistry,
        epoch: EpochId,
        hdr: &FragmentHeader,
        payload: Vec<u8>,
    ) -> Result<FeedOutcome> {
        if hdr.frag_len != payload.len() {
            return Err(Error::InvalidArgument("fragment length mismatch"));
        }
        if hdr.offset + hdr.frag_len > hdr.total_len {
            return Err(Error::ProtocolViolation("fragment exceeds message length"));
        }

        if hdr.seq < self.next_seq {
            log::trace!(
                "dropping stale fragment seq {} (next expected {})",
                hdr.seq,
                self.next_seq
            );
            return Ok(FeedOutcome::Pending);
        }

        let idx = usize::from(hdr.seq - self.next_seq);
        if idx >= self.slots.len() {
            return Err(Error::BufferExhausted);
        }

        match &mut self.slots[idx] {
            slot @ Slot::None => {
                if idx == 0 && hdr.is_whole_message() && matches!(self.state, ReadState::Inactive)
                {
                    // Zero copy: the record payload becomes the message.
                    reg.acquire(epoch)?;
                    *slot = Slot::NoFragmentation {
                        hs_type: hdr.hs_type,
                        epoch,
                        payload,
                    };
                } else {
                    let mut window = ReassemblyWindow::new(hdr.total_len);
                    window.write_fragment(hdr.offset, &payload)?;
                    reg.acquire(epoch)?;
                    *slot = Slot::Window {
                        hs_type: hdr.hs_type,
                        epoch,
                        total_len: hdr.total_len,
                        window,
                    };
                }
            }
            Slot::NoFragmentation { .. } => {
                return Err(Error::ProtocolViolation(
                    "extra fragment for unfragmented message",
                ));
            }
            Slot::Taken { .. } => {
                return Err(Error::ProtocolViolation(
                    "fragment for message currently being read",
                ));
            }
            Slot::Window {
                hs_type,
                epoch: slot_epoch,
                total_len,
                window,
            } => {
                if *hs_type != hdr.hs_type {
                    return Err(Error::ProtocolViolation("fragment type mismatch"));
                }
                if *slot_epoch != epoch {
                    return Err(Error::ProtocolViolation("fragment epoch mismatch"));
                }
                if *total_len != hdr.total_len {
                    return Err(Error::ProtocolViolation("fragment total-length mismatch"));
                }
                window.write_fragment(hdr.offset, &payload)?;
            }
        }

        if self.available() {
            Ok(FeedOutcome::Ready)
        } else {
            Ok(FeedOutcome::Pending)
        }
    }

    /// Hand out the next complete message.
    ///
    /// Legal when [`available`](Self::available); `in_epoch` must match the
    /// epoch the message was received under.
    pub fn request(&mut self, in_epoch: EpochId) -> Result<HandshakeIn<'_>> {
        match std::mem::replace(&mut self.state, ReadState::Inactive) {
            st @ ReadState::Active { .. } => {
                self.state = st;
                Err(Error::InvalidState("handshake message already requested"))
            }
            ReadState::Paused {
                hs_type,
                total_len,
                rd,
                remaining,
            } => {
                self.state = ReadState::Active {
                    hs_type,
                    total_len,
                    rd: ReaderExt::new(rd, remaining),
                };
                self.active_handle()
            }
            ReadState::Inactive => {
                if !self.slots[0].complete() {
                    return Err(Error::InvalidState("next handshake message not complete"));
                }
                let slot_epoch = self.slots[0].epoch().unwrap_or_default();
                if slot_epoch != in_epoch {
                    return Err(Error::ProtocolViolation(
                        "buffered message epoch does not match incoming epoch",
                    ));
                }
                let (hs_type, payload) =
                    match std::mem::replace(&mut self.slots[0], Slot::Taken { epoch: slot_epoch })
                    {
                        Slot::NoFragmentation {
                            hs_type, payload, ..
                        } => (hs_type, payload),
                        Slot::Window {
                            hs_type, window, ..
                        } => (hs_type, window.into_buf()),
                        // unreachable: complete() checked above
                        _ => return Err(Error::InvariantViolation("slot emptied concurrently")),
                    };
                let total_len = payload.len();
                self.state = ReadState::Active {
                    hs_type,
                    total_len,
                    rd: ReaderExt::new(Reader::with_fragment(payload), total_len),
                };
                self.active_handle()
            }
        }
    }

    fn active_handle(&mut self) -> Result<HandshakeIn<'_>> {
        let seq = self.next_seq;
        match &mut self.state {
            ReadState::Active {
                hs_type,
                total_len,
                rd,
            } => Ok(HandshakeIn {
                hs_type: *hs_type,
                len: *total_len,
                seq,
                reader: rd,
            }),
            _ => Err(Error::InvariantViolation("no active handshake message")),
        }
    }

    /// Pause reading; the unread suffix is preserved for the next `request`.
    pub fn pause(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, ReadState::Inactive) {
            ReadState::Active {
                hs_type,
                total_len,
                rd,
            } => {
                let (rd, remaining) = rd.into_inner();
                self.state = ReadState::Paused {
                    hs_type,
                    total_len,
                    rd,
                    remaining,
                };
                Ok(())
            }
            other => {
                self.state = other;
                Err(Error::InvalidState("no handshake message being read"))
            }
        }
    }

    /// Conclude the current message: tear down slot 0, shift the window,
    /// advance `next_seq`.
    ///
    /// Returns the `(epoch, seq)` of the consumed message for flight
    /// bookkeeping.
    pub fn consume(&mut self, reg: &mut EpochRegistry) -> Result<(EpochId, u16)> {
        match &self.state {
            ReadState::Active { rd, .. } if rd.done() => {}
            ReadState::Active { .. } => {
                return Err(Error::InvalidState("handshake message not fully read"));
            }
            _ => {
                return Err(Error::InvalidState("no handshake message being read"));
            }
        }
        self.state = ReadState::Inactive;

        let epoch = match self.slots[0].epoch() {
            Some(e) => e,
            None => return Err(Error::InvariantViolation("consumed slot has no epoch")),
        };
        reg.release(epoch)?;

        let seq = self.next_seq;
        self.next_seq = self
            .next_seq
            .checked_add(1)
            .ok_or(Error::SequenceOverflow)?;

        self.slots.remove(0);
        self.slots.push(Slot::None);
        Ok((epoch, seq))
    }

    /// Drop all buffered state, releasing epoch references. Used on
    /// handshake completion and teardown.
    pub fn clear(&mut self, reg: &mut EpochRegistry) -> Result<()> {
        for slot in &mut self.slots {
            if let Some(epoch) = slot.epoch() {
                reg.release(epoch)?;
            }
            *slot = Slot::None;
        }
        self.state = ReadState::Inactive;
        Ok(())
    }

    /// Whether any slot buffers data (diagnostics/tests).
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Slot::is_none) && matches!(self.state, ReadState::Inactive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::mem::NullTransform;

    fn setup() -> (EpochRegistry, EpochId) {
        let mut reg = EpochRegistry::new();
        let id = reg.add(Box::new(NullTransform)).unwrap();
        // keep the epoch alive independently of the engine
        reg.acquire(id).unwrap();
        (reg, id)
    }

    fn hdr(seq: u16, total: usize, offset: usize, frag_len: usize) -> FragmentHeader {
        FragmentHeader {
            hs_type: 11,
            total_len: total,
            seq,
            offset,
            frag_len,
        }
    }

    fn read_to_end(rd: &mut ReaderExt) -> Vec<u8> {
        let mut out = Vec::new();
        while !rd.done() {
            let chunk = rd.request(rd.remaining()).unwrap().to_vec();
            assert!(!chunk.is_empty());
            out.extend_from_slice(&chunk);
            rd.commit().unwrap();
        }
        out
    }

    #[test]
    fn test_whole_message_zero_copy_path() {
        let (mut reg, ep) = setup();
        let mut eng = Reassembly::new(0);

        let body: Vec<u8> = (0..80u8).collect();
        let out = eng
            .feed(&mut reg, ep, &hdr(0, 80, 0, 80), body.clone())
            .unwrap();
        assert_eq!(out, FeedOutcome::Ready);

        let msg = eng.request(ep).unwrap();
        assert_eq!(msg.hs_type, 11);
        assert_eq!(msg.len, 80);
        assert_eq!(msg.seq, 0);
        assert_eq!(read_to_end(msg.reader), body);

        assert_eq!(eng.consume(&mut reg).unwrap(), (ep, 0));
        assert_eq!(eng.next_seq(), 1);
    }

    #[test]
    fn test_out_of_order_fragments() {
        let (mut reg, ep) = setup();
        let mut eng = Reassembly::new(0);

        let body: Vec<u8> = (0..200u16).map(|i| (i % 251) as u8).collect();
        // arrival order: tail, head, middle
        assert_eq!(
            eng.feed(&mut reg, ep, &hdr(0, 200, 150, 50), body[150..].to_vec())
                .unwrap(),
            FeedOutcome::Pending
        );
        assert_eq!(
            eng.feed(&mut reg, ep, &hdr(0, 200, 0, 75), body[..75].to_vec())
                .unwrap(),
            FeedOutcome::Pending
        );
        assert_eq!(
            eng.feed(&mut reg, ep, &hdr(0, 200, 75, 75), body[75..150].to_vec())
                .unwrap(),
            FeedOutcome::Ready
        );

        let msg = eng.request(ep).unwrap();
        assert_eq!(read_to_end(msg.reader), body);
    }

    #[test]
    fn test_future_message_buffered_and_shifted() {
        let (mut reg, ep) = setup();
        let mut eng = Reassembly::new(3);

        // seq 4 arrives complete before seq 3
        assert_eq!(
            eng.feed(&mut reg, ep, &hdr(4, 100, 0, 100), vec![4u8; 100])
                .unwrap(),
            FeedOutcome::Pending
        );
        assert!(!eng.available());

        assert_eq!(
            eng.feed(&mut reg, ep, &hdr(3, 80, 0, 80), vec![3u8; 80])
                .unwrap(),
            FeedOutcome::Ready
        );

        let msg = eng.request(ep).unwrap();
        assert_eq!(msg.seq, 3);
        assert_eq!(read_to_end(msg.reader), vec![3u8; 80]);
        eng.consume(&mut reg).unwrap();

        assert!(eng.available(), "future message shifted into slot 0");
        let msg = eng.request(ep).unwrap();
        assert_eq!(msg.seq, 4);
        assert_eq!(read_to_end(msg.reader), vec![4u8; 100]);
        eng.consume(&mut reg).unwrap();
        assert_eq!(eng.next_seq(), 5);
    }

    #[test]
    fn test_window_bounds() {
        let (mut reg, ep) = setup();
        let mut eng = Reassembly::new(10);

        // inside the window: next_seq + FUTURE_MESSAGE_BUFFERS
        let last_ok = 10 + FUTURE_MESSAGE_BUFFERS as u16;
        eng.feed(&mut reg, ep, &hdr(last_ok, 10, 0, 10), vec![0; 10])
            .unwrap();

        // one past the window
        assert!(matches!(
            eng.feed(&mut reg, ep, &hdr(last_ok + 1, 10, 0, 10), vec![0; 10]),
            Err(Error::BufferExhausted)
        ));

        // stale sequence numbers are dropped silently
        assert_eq!(
            eng.feed(&mut reg, ep, &hdr(9, 10, 0, 10), vec![0; 10])
                .unwrap(),
            FeedOutcome::Pending
        );
    }

    #[test]
    fn test_metadata_mismatch_rejected() {
        let (mut reg, ep) = setup();
        let mut eng = Reassembly::new(0);

        eng.feed(&mut reg, ep, &hdr(0, 200, 0, 50), vec![0; 50])
            .unwrap();

        let bad_total = FragmentHeader {
            total_len: 300,
            ..hdr(0, 200, 50, 50)
        };
        assert!(matches!(
            eng.feed(&mut reg, ep, &bad_total, vec![0; 50]),
            Err(Error::ProtocolViolation(_))
        ));

        let bad_type = FragmentHeader {
            hs_type: 12,
            ..hdr(0, 200, 50, 50)
        };
        assert!(matches!(
            eng.feed(&mut reg, ep, &bad_type, vec![0; 50]),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_epoch_mismatch_across_fragments() {
        let mut reg = EpochRegistry::new();
        let e1 = reg.add(Box::new(NullTransform)).unwrap();
        let e2 = reg.add(Box::new(NullTransform)).unwrap();
        reg.acquire(e1).unwrap();
        reg.acquire(e2).unwrap();

        let mut eng = Reassembly::new(0);
        eng.feed(&mut reg, e1, &hdr(0, 100, 0, 50), vec![0; 50])
            .unwrap();
        assert!(matches!(
            eng.feed(&mut reg, e2, &hdr(0, 100, 50, 50), vec![0; 50]),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_pause_resume_delivers_identical_bytes() {
        let (mut reg, ep) = setup();
        let mut eng = Reassembly::new(0);

        let body: Vec<u8> = (0..150u16).map(|i| (i % 256) as u8).collect();
        eng.feed(&mut reg, ep, &hdr(0, 150, 0, 150), body.clone())
            .unwrap();

        let msg = eng.request(ep).unwrap();
        let first = msg.reader.request(60).unwrap().to_vec();
        msg.reader.commit().unwrap();
        eng.pause().unwrap();

        assert!(eng.available());
        let msg = eng.request(ep).unwrap();
        let mut got = first;
        got.extend_from_slice(&read_to_end(msg.reader));
        assert_eq!(got, body);

        eng.consume(&mut reg).unwrap();
    }

    #[test]
    fn test_consume_requires_full_read() {
        let (mut reg, ep) = setup();
        let mut eng = Reassembly::new(0);
        eng.feed(&mut reg, ep, &hdr(0, 10, 0, 10), vec![0; 10])
            .unwrap();
        eng.request(ep).unwrap();
        assert!(matches!(
            eng.consume(&mut reg),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_epoch_refcounts_follow_slots() {
        let (mut reg, ep) = setup();
        let base = reg.refs(ep).unwrap();
        let mut eng = Reassembly::new(0);

        eng.feed(&mut reg, ep, &hdr(0, 10, 0, 10), vec![0; 10])
            .unwrap();
        eng.feed(&mut reg, ep, &hdr(1, 10, 0, 10), vec![0; 10])
            .unwrap();
        assert_eq!(reg.refs(ep).unwrap(), base + 2);

        let msg = eng.request(ep).unwrap();
        read_to_end(msg.reader);
        eng.consume(&mut reg).unwrap();
        assert_eq!(reg.refs(ep).unwrap(), base + 1);

        eng.clear(&mut reg).unwrap();
        assert_eq!(reg.refs(ep).unwrap(), base);
        assert!(eng.is_empty());
    }
}
