// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pausable writer with an optional spill queue.
//!
//! A [`Writer`] hands out mutable slices of a primary buffer sized to the
//! current record's free payload space. When the primary buffer is full and
//! a spill queue was attached, further writes land in the queue; the
//! outgoing pipeline later drains the queue into subsequent records.
//!
//! The request/commit discipline mirrors the reader: exactly one request
//! may be outstanding, and `commit(k)` declares how much of the last slice
//! carries payload.

use crate::error::{Error, Result};

/// Target region of the outstanding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    None,
    Primary(usize),
    Queue(usize),
}

/// Writer over a primary buffer plus an optional spill queue.
#[derive(Debug)]
pub struct Writer {
    buf: Vec<u8>,
    buf_used: usize,
    queue: Vec<u8>,
    queue_cap: usize,
    queue_used: usize,
    pending: Pending,
}

impl Writer {
    /// Create a writer over a primary buffer of `capacity` bytes with no
    /// spill queue. Writes past the primary buffer fail.
    pub fn new(capacity: usize) -> Self {
        Self::with_queue(capacity, 0)
    }

    /// Create a writer whose overflow spills into a queue of `queue_cap`
    /// bytes.
    pub fn with_queue(capacity: usize, queue_cap: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            buf_used: 0,
            queue: vec![0; queue_cap],
            queue_cap,
            queue_used: 0,
            pending: Pending::None,
        }
    }

    /// Request a mutable slice of up to `n` bytes.
    pub fn request_buffer(&mut self, n: usize) -> Result<&mut [u8]> {
        if self.pending != Pending::None {
            return Err(Error::InvariantViolation("request with uncommitted request"));
        }
        let buf_left = self.buf.len() - self.buf_used;
        if buf_left > 0 {
            let k = n.min(buf_left);
            self.pending = Pending::Primary(k);
            let start = self.buf_used;
            return Ok(&mut self.buf[start..start + k]);
        }
        let queue_left = self.queue_cap - self.queue_used;
        if queue_left == 0 {
            return Err(Error::BufferExhausted);
        }
        let k = n.min(queue_left);
        self.pending = Pending::Queue(k);
        let start = self.queue_used;
        Ok(&mut self.queue[start..start + k])
    }

    /// Declare that the first `k` bytes of the last requested slice carry
    /// payload.
    pub fn commit(&mut self, k: usize) -> Result<()> {
        match self.pending {
            Pending::None => Err(Error::InvariantViolation("commit without request")),
            Pending::Primary(n) if k <= n => {
                self.buf_used += k;
                self.pending = Pending::None;
                Ok(())
            }
            Pending::Queue(n) if k <= n => {
                self.queue_used += k;
                self.pending = Pending::None;
                Ok(())
            }
            _ => Err(Error::InvariantViolation("commit past requested buffer")),
        }
    }

    /// Committed bytes in the primary buffer (the current fragment).
    pub fn fragment(&self) -> &[u8] {
        &self.buf[..self.buf_used]
    }

    /// Committed bytes waiting in the spill queue.
    pub fn queued(&self) -> &[u8] {
        &self.queue[..self.queue_used]
    }

    /// Total committed payload (primary + queue).
    pub fn total_committed(&self) -> usize {
        self.buf_used + self.queue_used
    }

    /// Whether a spill queue is attached.
    pub fn has_queue(&self) -> bool {
        self.queue_cap > 0
    }
}

/// Writer bounded by a declared total message length.
#[derive(Debug)]
pub struct WriterExt {
    wr: Writer,
    /// Declared bytes not yet committed.
    remaining: usize,
}

impl WriterExt {
    /// Bound `wr` to `total` declared bytes.
    pub fn new(wr: Writer, total: usize) -> Self {
        Self { wr, remaining: total }
    }

    /// Request a mutable slice of up to `n` bytes within the declared bound.
    pub fn request_buffer(&mut self, n: usize) -> Result<&mut [u8]> {
        if n > 0 && self.remaining == 0 {
            return Err(Error::BoundsExceeded);
        }
        let k = n.min(self.remaining);
        self.wr.request_buffer(k)
    }

    /// Commit `k` payload bytes of the last requested slice.
    pub fn commit(&mut self, k: usize) -> Result<()> {
        if k > self.remaining {
            return Err(Error::BoundsExceeded);
        }
        self.wr.commit(k)?;
        self.remaining -= k;
        Ok(())
    }

    /// Declared bytes not yet committed.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Whether the declared length has been written in full.
    pub fn done(&self) -> bool {
        self.remaining == 0
    }

    /// Copy `data` into the writer through the request/commit discipline.
    ///
    /// Convenience for callers that hold the full body in memory.
    pub fn write_all(&mut self, data: &[u8]) -> Result<usize> {
        write_all(self, data)
    }

    /// Access the inner writer (pipeline support).
    pub fn inner(&self) -> &Writer {
        &self.wr
    }

    /// Recover the inner writer.
    pub fn into_inner(self) -> Writer {
        self.wr
    }
}

/// Convenience: copy `data` into `wr` through the request/commit discipline.
///
/// Used by raw-backup resends and tests; returns the number of bytes written
/// (always `data.len()` unless the writer runs out of space).
pub(crate) fn write_all(wr: &mut WriterExt, mut data: &[u8]) -> Result<usize> {
    let mut written = 0;
    while !data.is_empty() {
        let chunk = wr.request_buffer(data.len())?;
        let k = chunk.len().min(data.len());
        chunk[..k].copy_from_slice(&data[..k]);
        wr.commit(k)?;
        written += k;
        data = &data[k..];
    }
    Ok(written)
}
