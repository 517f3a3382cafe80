// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Zero-copy pausable reader.
//!
//! A [`Reader`] serves slices out of a fed fragment without copying. Bytes
//! become permanently consumed only on `commit`; `reclaim` rolls back to the
//! last commit point and preserves every unconsumed byte in an internal
//! accumulator, so the logical stream continues seamlessly across a
//! pause/feed cycle.
//!
//! ```text
//!             +-- accumulator (carried over pauses) --+-- fragment --+
//! committed   |###########                            |#####         |
//! fetched     |#################                      |########      |
//!                         ^ rolled back by reclaim()  ^
//! ```

use crate::error::{Error, Result};

/// Cursor pair over one backing region.
#[derive(Debug, Default, Clone, Copy)]
struct Cursor {
    /// Bytes permanently consumed.
    committed: usize,
    /// Bytes handed out via `request` since the last commit (>= committed).
    fetched: usize,
}

/// Pausable reader over an accumulator plus the current fragment.
#[derive(Debug, Default)]
pub struct Reader {
    acc: Vec<u8>,
    acc_cur: Cursor,
    frag: Vec<u8>,
    frag_cur: Cursor,
    /// Set when a request ran past the end of all buffered data.
    starved: bool,
}

impl Reader {
    /// Create an empty reader. Feed a fragment before requesting.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a reader already serving `frag`.
    pub fn with_fragment(frag: Vec<u8>) -> Self {
        Self {
            frag,
            ..Self::default()
        }
    }

    /// Install a new fragment continuing the logical stream.
    ///
    /// Legal only when the previous fragment is fully committed or was
    /// reclaimed; anything else would silently drop bytes.
    pub fn feed(&mut self, frag: Vec<u8>) -> Result<()> {
        if self.frag_cur.committed != self.frag.len() {
            return Err(Error::InvariantViolation(
                "feed with unconsumed fragment bytes",
            ));
        }
        self.frag = frag;
        self.frag_cur = Cursor::default();
        self.starved = false;
        Ok(())
    }

    /// Request up to `n` bytes.
    ///
    /// Returns a slice of length `k <= n` drawn from the accumulator first,
    /// then the fragment. Returns an empty slice (and records starvation)
    /// when all buffered data has been fetched. Never blocks.
    pub fn request(&mut self, n: usize) -> Result<&[u8]> {
        let acc_left = self.acc.len() - self.acc_cur.fetched;
        if acc_left > 0 {
            let k = n.min(acc_left);
            let start = self.acc_cur.fetched;
            self.acc_cur.fetched += k;
            return Ok(&self.acc[start..start + k]);
        }

        let frag_left = self.frag.len() - self.frag_cur.fetched;
        if frag_left == 0 {
            self.starved = n > 0;
            return Ok(&[]);
        }
        let k = n.min(frag_left);
        let start = self.frag_cur.fetched;
        self.frag_cur.fetched += k;
        Ok(&self.frag[start..start + k])
    }

    /// Permanently consume everything requested so far.
    ///
    /// Returns the number of newly committed bytes.
    pub fn commit(&mut self) -> Result<usize> {
        let n = (self.acc_cur.fetched - self.acc_cur.committed)
            + (self.frag_cur.fetched - self.frag_cur.committed);
        self.acc_cur.committed = self.acc_cur.fetched;
        self.frag_cur.committed = self.frag_cur.fetched;

        // Drop the accumulator as soon as it is fully consumed so its
        // allocation does not outlive the pause that created it.
        if self.acc_cur.committed == self.acc.len() && !self.acc.is_empty() {
            self.acc.clear();
            self.acc_cur = Cursor::default();
        }
        Ok(n)
    }

    /// Roll back uncommitted fetches and take ownership of every remaining
    /// byte, preserving it for the next `feed`.
    ///
    /// After this call the reader holds no fragment and serves the preserved
    /// suffix before any newly fed data.
    pub fn reclaim(&mut self) {
        let mut kept = Vec::with_capacity(
            (self.acc.len() - self.acc_cur.committed) + (self.frag.len() - self.frag_cur.committed),
        );
        kept.extend_from_slice(&self.acc[self.acc_cur.committed..]);
        kept.extend_from_slice(&self.frag[self.frag_cur.committed..]);
        self.acc = kept;
        self.acc_cur = Cursor::default();
        self.frag = Vec::new();
        self.frag_cur = Cursor::default();
        self.starved = false;
    }

    /// Bytes buffered but not yet fetched.
    pub fn bytes_available(&self) -> usize {
        (self.acc.len() - self.acc_cur.fetched) + (self.frag.len() - self.frag_cur.fetched)
    }

    /// Whether the last request could not be served in full.
    pub fn starved(&self) -> bool {
        self.starved
    }
}

/// Reader bounded by a declared total length.
///
/// Wraps a [`Reader`] with the length taken from a message header, so
/// over-reads surface as [`Error::BoundsExceeded`] instead of silently
/// running into the next message.
#[derive(Debug, Default)]
pub struct ReaderExt {
    rd: Reader,
    /// Declared bytes not yet committed.
    remaining: usize,
    /// Bytes fetched since the last commit.
    fetched: usize,
}

impl ReaderExt {
    /// Bound `rd` to `total` declared bytes.
    pub fn new(rd: Reader, total: usize) -> Self {
        Self {
            rd,
            remaining: total,
            fetched: 0,
        }
    }

    /// Request up to `n` bytes within the declared bound.
    pub fn request(&mut self, n: usize) -> Result<&[u8]> {
        if n > 0 && self.fetched == self.remaining {
            return Err(Error::BoundsExceeded);
        }
        let k = n.min(self.remaining - self.fetched);
        let out = self.rd.request(k)?;
        self.fetched += out.len();
        Ok(out)
    }

    /// Permanently consume everything requested so far.
    pub fn commit(&mut self) -> Result<()> {
        let n = self.rd.commit()?;
        debug_assert!(n <= self.remaining);
        self.remaining -= n;
        self.fetched = 0;
        Ok(())
    }

    /// Declared bytes not yet committed.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Whether the full declared length has been committed.
    pub fn done(&self) -> bool {
        self.remaining == 0
    }

    /// Drain the remaining declared bytes into a vector.
    ///
    /// Convenience for callers that want the whole body at once rather than
    /// streaming it.
    pub fn read_remaining(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.remaining);
        while !self.done() {
            let chunk = self.request(self.remaining - self.fetched)?;
            if chunk.is_empty() {
                return Err(Error::InvariantViolation(
                    "declared bytes missing from stream",
                ));
            }
            out.extend_from_slice(chunk);
            self.commit()?;
        }
        Ok(out)
    }

    /// Detach the bound and recover the inner reader, rolling back any
    /// uncommitted fetch. Used by the pause path.
    pub fn into_inner(mut self) -> (Reader, usize) {
        self.rd.reclaim();
        (self.rd, self.remaining)
    }

    /// Access the inner reader (test and pipeline support).
    pub fn inner_mut(&mut self) -> &mut Reader {
        &mut self.rd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(rd: &mut ReaderExt) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let chunk = rd.request(usize::MAX).unwrap_or(&[]).to_vec();
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
            rd.commit().unwrap();
            if rd.done() {
                break;
            }
        }
        out
    }

    #[test]
    fn test_request_commit_linear() {
        let mut rd = Reader::with_fragment(vec![1, 2, 3, 4, 5]);
        assert_eq!(rd.request(2).unwrap(), &[1, 2]);
        assert_eq!(rd.request(2).unwrap(), &[3, 4]);
        assert_eq!(rd.commit().unwrap(), 4);
        assert_eq!(rd.request(10).unwrap(), &[5]);
        assert_eq!(rd.commit().unwrap(), 1);
        assert_eq!(rd.bytes_available(), 0);
    }

    #[test]
    fn test_starvation_flag() {
        let mut rd = Reader::with_fragment(vec![9]);
        assert_eq!(rd.request(1).unwrap(), &[9]);
        assert!(!rd.starved());
        assert_eq!(rd.request(1).unwrap(), &[] as &[u8]);
        assert!(rd.starved());
    }

    #[test]
    fn test_reclaim_rolls_back_uncommitted() {
        let mut rd = Reader::with_fragment(vec![1, 2, 3, 4]);
        assert_eq!(rd.request(2).unwrap(), &[1, 2]);
        rd.commit().unwrap();
        // fetched but never committed
        assert_eq!(rd.request(1).unwrap(), &[3]);
        rd.reclaim();

        rd.feed(vec![5, 6]).unwrap();
        // stream resumes at byte 3, then continues into the new fragment
        assert_eq!(rd.request(10).unwrap(), &[3, 4]);
        assert_eq!(rd.request(10).unwrap(), &[5, 6]);
    }

    #[test]
    fn test_feed_with_pending_bytes_rejected() {
        let mut rd = Reader::with_fragment(vec![1, 2]);
        rd.request(1).unwrap();
        rd.commit().unwrap();
        let err = rd.feed(vec![3]).unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[test]
    fn test_ext_reader_bounds() {
        let rd = Reader::with_fragment(vec![0; 10]);
        let mut ext = ReaderExt::new(rd, 4);
        assert_eq!(ext.request(3).unwrap().len(), 3);
        assert_eq!(ext.request(3).unwrap().len(), 1, "clamped to bound");
        assert!(matches!(ext.request(1), Err(Error::BoundsExceeded)));
        ext.commit().unwrap();
        assert!(ext.done());
        assert!(matches!(ext.request(1), Err(Error::BoundsExceeded)));
    }

    #[test]
    fn test_ext_reader_pause_resume_identical_bytes() {
        let body: Vec<u8> = (0..=99).collect();

        // unpaused reference
        let mut direct = ReaderExt::new(Reader::with_fragment(body.clone()), body.len());
        let reference = read_all(&mut direct);

        // paused after 37 bytes
        let mut ext = ReaderExt::new(Reader::with_fragment(body.clone()), body.len());
        let first = ext.request(37).unwrap().to_vec();
        ext.commit().unwrap();
        let (rd, remaining) = ext.into_inner();
        assert_eq!(remaining, body.len() - 37);

        let mut resumed = ReaderExt::new(rd, remaining);
        let mut paused = first;
        paused.extend_from_slice(&read_all(&mut resumed));

        assert_eq!(paused, reference);
    }
}
