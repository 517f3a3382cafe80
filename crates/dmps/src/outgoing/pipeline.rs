// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Outgoing handshake writer pipeline.
//!
//! Bridges the user-facing bounded writer and the record layer: the user
//! authors one logical handshake message, the pipeline cuts it into
//! fragments sized to the record payload space and describes each fragment
//! header to the record layer.
//!
//! Pausing detaches the writer from the current record (which is then
//! dispatched) and remembers `(type, length, seq, offset, epoch)`; a later
//! reopen attaches a fresh writer against a new record with the same
//! metadata, enforced field by field. Because fragment headers carry the
//! total message length, pausing requires the length to have been declared
//! up front.

use crate::epoch::EpochId;
use crate::error::{Error, Result};
use crate::record::FragmentHeader;
use crate::stream::{Writer, WriterExt};

use super::backup::{Backup, Handle, RewriteFn};

/// Writing state of the outgoing handshake message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutState {
    None,
    Active,
    Paused,
}

/// Split `payload` (starting at message offset `base`) into fragments of at
/// most `cap` bytes each.
///
/// An empty payload still yields one header-only fragment so that
/// zero-length messages occupy a record.
pub(crate) fn chunk_fragments(
    hs_type: u8,
    seq: u16,
    total_len: usize,
    base: usize,
    payload: &[u8],
    cap: usize,
) -> Vec<(FragmentHeader, Vec<u8>)> {
    if payload.is_empty() {
        return vec![(
            FragmentHeader {
                hs_type,
                total_len,
                seq,
                offset: base,
                frag_len: 0,
            },
            Vec::new(),
        )];
    }
    payload
        .chunks(cap.max(1))
        .scan(base, |offset, chunk| {
            let hdr = FragmentHeader {
                hs_type,
                total_len,
                seq,
                offset: *offset,
                frag_len: chunk.len(),
            };
            *offset += chunk.len();
            Some((hdr, chunk.to_vec()))
        })
        .collect()
}

/// State machine for one outgoing handshake message.
pub(crate) struct HandshakeOut {
    state: OutState,
    hs_type: u8,
    epoch: EpochId,
    seq: u16,
    /// Declared total length; `None` while unknown (pause then forbidden).
    length: Option<usize>,
    /// Bytes already cut into fragments by earlier pauses.
    offset: usize,
    writer: Option<WriterExt>,
    /// Accumulated body copy when no rewriter was registered.
    raw_backup: Option<Vec<u8>>,
    rewriter: Option<RewriteFn>,
}

impl std::fmt::Debug for HandshakeOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeOut")
            .field("state", &self.state)
            .field("hs_type", &self.hs_type)
            .field("epoch", &self.epoch)
            .field("seq", &self.seq)
            .field("length", &self.length)
            .field("offset", &self.offset)
            .field("rewriter", &self.rewriter.is_some())
            .finish()
    }
}

impl HandshakeOut {
    pub(crate) fn new() -> Self {
        Self {
            state: OutState::None,
            hs_type: 0,
            epoch: 0,
            seq: 0,
            length: None,
            offset: 0,
            writer: None,
            raw_backup: None,
            rewriter: None,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state == OutState::Active
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.state == OutState::Paused
    }

    pub(crate) fn epoch(&self) -> EpochId {
        self.epoch
    }

    pub(crate) fn seq(&self) -> u16 {
        self.seq
    }

    fn make_writer(&self, record_cap: usize) -> WriterExt {
        match self.length {
            Some(len) => {
                let remaining = len - self.offset;
                let buf_cap = record_cap.min(remaining);
                WriterExt::new(
                    Writer::with_queue(buf_cap, remaining - buf_cap),
                    remaining,
                )
            }
            // Unknown length: the message is bounded by the current record.
            None => WriterExt::new(Writer::new(record_cap), record_cap),
        }
    }

    /// Open a fresh message or continue a paused one.
    ///
    /// A continuation must repeat the original metadata; the epoch of a
    /// message is pinned when it is first opened.
    pub(crate) fn open(
        &mut self,
        record_cap: usize,
        hs_type: u8,
        epoch: EpochId,
        seq: u16,
        length: Option<usize>,
        rewriter: Option<RewriteFn>,
    ) -> Result<()> {
        match self.state {
            OutState::Active => Err(Error::InvalidState("handshake message already open")),
            OutState::None => {
                self.hs_type = hs_type;
                self.epoch = epoch;
                self.seq = seq;
                self.length = length;
                self.offset = 0;
                self.raw_backup = if rewriter.is_none() {
                    Some(Vec::with_capacity(length.unwrap_or(0)))
                } else {
                    None
                };
                self.rewriter = rewriter;
                self.writer = Some(self.make_writer(record_cap));
                self.state = OutState::Active;
                Ok(())
            }
            OutState::Paused => {
                if hs_type != self.hs_type || length != self.length || seq != self.seq {
                    return Err(Error::InvalidArgument(
                        "continuation metadata differs from paused message",
                    ));
                }
                if epoch != self.epoch {
                    return Err(Error::InvalidState("epoch change across paused message"));
                }
                if rewriter.is_some() != self.rewriter.is_some() {
                    return Err(Error::InvalidArgument(
                        "continuation changes retransmission handling",
                    ));
                }
                if let Some(cb) = rewriter {
                    self.rewriter = Some(cb);
                }
                self.writer = Some(self.make_writer(record_cap));
                self.state = OutState::Active;
                Ok(())
            }
        }
    }

    /// The user-facing writer of the open message.
    pub(crate) fn writer(&mut self) -> Result<&mut WriterExt> {
        if self.state != OutState::Active {
            return Err(Error::InvalidState("no handshake message open"));
        }
        self.writer
            .as_mut()
            .ok_or(Error::InvariantViolation("active message without writer"))
    }

    /// Cut everything committed so far into fragments and advance `offset`.
    fn take_fragments(&mut self, record_cap: usize) -> Result<Vec<(FragmentHeader, Vec<u8>)>> {
        let writer = self
            .writer
            .take()
            .ok_or(Error::InvariantViolation("active message without writer"))?;
        let inner = writer.into_inner();
        let mut body = inner.fragment().to_vec();
        body.extend_from_slice(inner.queued());

        if let Some(backup) = self.raw_backup.as_mut() {
            backup.extend_from_slice(&body);
        }

        let total_len = self.length.unwrap_or(self.offset + body.len());
        // a fully fragmented message must not grow a trailing empty fragment
        let frags = if body.is_empty() && self.offset > 0 {
            Vec::new()
        } else {
            chunk_fragments(
                self.hs_type,
                self.seq,
                total_len,
                self.offset,
                &body,
                record_cap,
            )
        };
        self.offset += body.len();
        Ok(frags)
    }

    /// Pause the open message.
    ///
    /// Returns the fragments completed so far; the caller dispatches each
    /// into its own record. Empty when nothing was committed since the last
    /// fragment boundary.
    pub(crate) fn pause(&mut self, record_cap: usize) -> Result<Vec<(FragmentHeader, Vec<u8>)>> {
        if self.state != OutState::Active {
            return Err(Error::InvalidState("no handshake message open"));
        }
        if self.length.is_none() {
            return Err(Error::InvalidState(
                "pause requires a declared message length",
            ));
        }
        let mut frags = self.take_fragments(record_cap)?;
        // a pause never emits a header-only fragment
        if frags.len() == 1 && frags[0].1.is_empty() {
            frags.clear();
        }
        self.state = OutState::Paused;
        Ok(frags)
    }

    /// Conclude the message.
    ///
    /// Returns the remaining fragments plus the retransmission backup to be
    /// installed in the flight.
    pub(crate) fn dispatch(
        &mut self,
        record_cap: usize,
    ) -> Result<(Vec<(FragmentHeader, Vec<u8>)>, Backup)> {
        if self.state != OutState::Active {
            return Err(Error::InvalidState("no handshake message open"));
        }
        if let Some(len) = self.length {
            let written = self.offset + self.writer.as_ref().map_or(0, |w| {
                w.inner().total_committed()
            });
            if written != len {
                return Err(Error::InvalidState(
                    "declared message length not fully written",
                ));
            }
        }

        let frags = self.take_fragments(record_cap)?;
        let total_len = self.length.unwrap_or(self.offset);

        let handle = match self.rewriter.take() {
            Some(cb) => Handle::Rewrite(cb),
            None => Handle::Raw(self.raw_backup.take().unwrap_or_default()),
        };
        let backup = Backup {
            hs_type: self.hs_type,
            seq: self.seq,
            epoch: self.epoch,
            len: total_len,
            handle,
        };

        self.state = OutState::None;
        self.length = None;
        self.offset = 0;
        Ok((frags, backup))
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::write_all;

    fn write(out: &mut HandshakeOut, data: &[u8]) {
        write_all(out.writer().unwrap(), data).unwrap();
    }

    #[test]
    fn test_single_record_message() {
        let mut out = HandshakeOut::new();
        out.open(512, 1, 0, 7, Some(100), None).unwrap();
        write(&mut out, &[0xAB; 100]);

        let (frags, backup) = out.dispatch(512).unwrap();
        assert_eq!(frags.len(), 1);
        let (hdr, payload) = &frags[0];
        assert_eq!(
            *hdr,
            FragmentHeader {
                hs_type: 1,
                total_len: 100,
                seq: 7,
                offset: 0,
                frag_len: 100
            }
        );
        assert_eq!(payload.len(), 100);
        assert_eq!(backup.seq, 7);
        assert!(matches!(&backup.handle, Handle::Raw(b) if b.len() == 100));
    }

    #[test]
    fn test_fragmentation_across_records() {
        let mut out = HandshakeOut::new();
        out.open(100, 1, 0, 0, Some(250), None).unwrap();
        let body: Vec<u8> = (0..250u16).map(|i| i as u8).collect();
        write(&mut out, &body);

        let (frags, _) = out.dispatch(100).unwrap();
        assert_eq!(frags.len(), 3);
        assert_eq!(frags[0].0.offset, 0);
        assert_eq!(frags[0].0.frag_len, 100);
        assert_eq!(frags[1].0.offset, 100);
        assert_eq!(frags[1].0.frag_len, 100);
        assert_eq!(frags[2].0.offset, 200);
        assert_eq!(frags[2].0.frag_len, 50);
        for (hdr, _) in &frags {
            assert_eq!(hdr.total_len, 250);
            assert_eq!(hdr.seq, 0);
        }

        let rebuilt: Vec<u8> = frags.iter().flat_map(|(_, p)| p.clone()).collect();
        assert_eq!(rebuilt, body);
    }

    #[test]
    fn test_pause_then_continue() {
        let mut out = HandshakeOut::new();
        out.open(512, 16, 2, 3, Some(800), None).unwrap();
        write(&mut out, &[1u8; 300]);

        let frags = out.pause(512).unwrap();
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].0.offset, 0);
        assert_eq!(frags[0].0.frag_len, 300);
        assert_eq!(frags[0].0.total_len, 800);

        out.open(512, 16, 2, 3, Some(800), None).unwrap();
        write(&mut out, &[2u8; 500]);
        let (frags, backup) = out.dispatch(512).unwrap();
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].0.offset, 300);
        assert_eq!(frags[0].0.frag_len, 500);
        assert_eq!(frags[0].0.total_len, 800);

        // the raw backup spans both segments
        assert!(matches!(&backup.handle, Handle::Raw(b) if b.len() == 800));
    }

    #[test]
    fn test_pause_unknown_length_forbidden() {
        let mut out = HandshakeOut::new();
        out.open(512, 1, 0, 0, None, None).unwrap();
        write(&mut out, &[0; 10]);
        assert!(matches!(out.pause(512), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_unknown_length_bounded_by_record() {
        let mut out = HandshakeOut::new();
        out.open(64, 1, 0, 0, None, None).unwrap();
        write(&mut out, &[9u8; 64]);
        assert!(matches!(
            out.writer().unwrap().request_buffer(1),
            Err(Error::BoundsExceeded)
        ));

        let (frags, backup) = out.dispatch(64).unwrap();
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].0.total_len, 64);
        assert_eq!(backup.len, 64);
    }

    #[test]
    fn test_continuation_metadata_enforced() {
        let mut out = HandshakeOut::new();
        out.open(512, 16, 2, 3, Some(800), None).unwrap();
        write(&mut out, &[0; 100]);
        out.pause(512).unwrap();

        assert!(matches!(
            out.open(512, 17, 2, 3, Some(800), None),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            out.open(512, 16, 2, 3, Some(900), None),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            out.open(512, 16, 3, 3, Some(800), None),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_dispatch_requires_declared_length_written() {
        let mut out = HandshakeOut::new();
        out.open(512, 1, 0, 0, Some(100), None).unwrap();
        write(&mut out, &[0; 40]);
        assert!(matches!(out.dispatch(512), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_zero_length_message_emits_header_only_fragment() {
        let mut out = HandshakeOut::new();
        out.open(512, 14, 0, 5, Some(0), None).unwrap();
        let (frags, _) = out.dispatch(512).unwrap();
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].0.frag_len, 0);
        assert!(frags[0].1.is_empty());
    }
}
