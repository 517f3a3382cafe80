// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reassembly buffer with block-granular receive tracking.
//!
//! One [`ReassemblyWindow`] backs one partially received handshake message:
//! a buffer of the declared total length, a list of received byte ranges
//! (sorted and coalesced, so adjacent fragments merge), and a bitmask with
//! one bit per [`REASSEMBLY_BLOCK_SIZE`]-byte block derived from the
//! accumulated coverage. A block is marked once the *union* of received
//! fragments covers it — fragment boundaries need not fall on block
//! multiples — and `complete()` holds exactly when every byte has been
//! received.
//!
//! Overlapping fragments are legal as long as the overlapping bytes agree;
//! disagreement means the peer is sending inconsistent retransmissions and
//! is reported as a protocol violation.

use std::ops::Range;

use crate::config::REASSEMBLY_BLOCK_SIZE;
use crate::error::{Error, Result};

#[derive(Debug)]
pub(crate) struct ReassemblyWindow {
    buf: Vec<u8>,
    bitmask: Vec<u8>,
    num_blocks: usize,
    /// Received byte ranges, kept sorted and coalesced.
    received: Vec<Range<usize>>,
}

impl ReassemblyWindow {
    pub(crate) fn new(total_len: usize) -> Self {
        let num_blocks = total_len.div_ceil(REASSEMBLY_BLOCK_SIZE);
        Self {
            buf: vec![0; total_len],
            bitmask: vec![0; num_blocks.div_ceil(8)],
            num_blocks,
            received: Vec::new(),
        }
    }

    fn block_marked(&self, block: usize) -> bool {
        self.bitmask[block / 8] & (1 << (block % 8)) != 0
    }

    fn mark_block(&mut self, block: usize) {
        self.bitmask[block / 8] |= 1 << (block % 8);
    }

    /// Bounds of block `b`, the final block clamped to the message end.
    fn block_range(&self, block: usize) -> (usize, usize) {
        let start = block * REASSEMBLY_BLOCK_SIZE;
        let end = (start + REASSEMBLY_BLOCK_SIZE).min(self.buf.len());
        (start, end)
    }

    /// Insert `range` into the received list, coalescing overlapping and
    /// adjacent ranges.
    fn insert_range(&mut self, range: Range<usize>) {
        self.received.push(range);
        self.received.sort_by_key(|r| r.start);

        let mut merged: Vec<Range<usize>> = Vec::with_capacity(self.received.len());
        for r in self.received.drain(..) {
            match merged.last_mut() {
                Some(last) if r.start <= last.end => last.end = last.end.max(r.end),
                _ => merged.push(r),
            }
        }
        self.received = merged;
    }

    /// Merge one fragment at `offset`.
    ///
    /// Rejects out-of-bounds fragments and byte-inconsistent overlaps.
    pub(crate) fn write_fragment(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(data.len())
            .ok_or(Error::ProtocolViolation("fragment bounds overflow"))?;
        if end > self.buf.len() {
            return Err(Error::ProtocolViolation("fragment exceeds message length"));
        }

        // Overlaps with already-received bytes must be byte-identical.
        for r in &self.received {
            let lo = r.start.max(offset);
            let hi = r.end.min(end);
            if lo < hi && self.buf[lo..hi] != data[lo - offset..hi - offset] {
                return Err(Error::ProtocolViolation("inconsistent fragment overlap"));
            }
        }

        self.buf[offset..end].copy_from_slice(data);
        if offset < end {
            self.insert_range(offset..end);
        }

        // Mark every block the accumulated coverage spans in full. Adjacent
        // fragments coalesce first, so a block straddled by two fragments is
        // marked as soon as both halves are in.
        for block in 0..self.num_blocks {
            if self.block_marked(block) {
                continue;
            }
            let (bs, be) = self.block_range(block);
            if self
                .received
                .iter()
                .any(|r| r.start <= bs && r.end >= be)
            {
                self.mark_block(block);
            }
        }
        Ok(())
    }

    /// Whether every block of the message has been received.
    pub(crate) fn complete(&self) -> bool {
        (0..self.num_blocks).all(|b| self.block_marked(b))
    }

    /// Hand out the reassembled message. Callers check `complete()` first.
    pub(crate) fn into_buf(self) -> Vec<u8> {
        self.buf
    }
}
