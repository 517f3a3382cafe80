// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory record layer.
//!
//! A loopback implementation of [`RecordLayer`] backed by queues instead of
//! a socket. Tests and benches script the incoming side with the
//! `deliver_*` helpers and inspect the outgoing side through [`sent`]
//! (records that reached the "wire") and the flush budget (to simulate a
//! transport that stalls mid-flight).
//!
//! No record protection is performed; transforms stay opaque. Record
//! sequence numbers follow the DTLS layout: a 2-byte epoch followed by a
//! 6-byte per-epoch counter.
//!
//! [`sent`]: MemoryRecordLayer::sent

use std::collections::{HashMap, VecDeque};
use std::fmt;

use crate::epoch::{EpochId, Transform};
use crate::error::{Error, Result};
use crate::types::Alert;

use super::{FragmentHeader, RecordContent, RecordIn, RecordLayer, RecordSeq};

/// Default free payload space per record.
pub const DEFAULT_MTU: usize = 512;

/// Transform that performs no protection. Stands in for real key material
/// wherever the registry demands ownership of *something*.
#[derive(Debug, Default)]
pub struct NullTransform;

impl Transform for NullTransform {}

/// One record on the outgoing side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOut {
    pub epoch: EpochId,
    pub rec_seq: RecordSeq,
    pub content: RecordContent,
}

fn encode_rec_seq(epoch: EpochId, counter: u64) -> RecordSeq {
    let mut seq = [0u8; 8];
    seq[..2].copy_from_slice(&epoch.to_be_bytes());
    seq[2..].copy_from_slice(&counter.to_be_bytes()[2..]);
    seq
}

/// Loopback record layer over in-memory queues.
pub struct MemoryRecordLayer {
    mtu: usize,
    incoming: VecDeque<RecordIn>,
    current_in: Option<RecordIn>,
    in_counters: HashMap<EpochId, u64>,
    staged: Option<RecordOut>,
    pending: VecDeque<RecordOut>,
    wire: Vec<RecordOut>,
    out_counters: HashMap<EpochId, u64>,
    forced_seq: Option<RecordSeq>,
    /// Records moved to the wire per `flush` call; `None` is unlimited.
    flush_budget: Option<usize>,
}

impl MemoryRecordLayer {
    pub fn new() -> Self {
        Self::with_mtu(DEFAULT_MTU)
    }

    /// Use a specific per-record payload capacity.
    pub fn with_mtu(mtu: usize) -> Self {
        Self {
            mtu,
            incoming: VecDeque::new(),
            current_in: None,
            in_counters: HashMap::new(),
            staged: None,
            pending: VecDeque::new(),
            wire: Vec::new(),
            out_counters: HashMap::new(),
            forced_seq: None,
            flush_budget: None,
        }
    }

    /// Limit how many records each `flush` call moves to the wire.
    /// Simulates a transport reporting partial writes.
    pub fn set_flush_budget(&mut self, budget: Option<usize>) {
        self.flush_budget = budget;
    }

    // ------------------------------------------------------------------
    // Incoming side (test scripting)
    // ------------------------------------------------------------------

    /// Queue an arbitrary incoming record.
    pub fn push_incoming(&mut self, rec: RecordIn) {
        self.incoming.push_back(rec);
    }

    fn next_in_seq(&mut self, epoch: EpochId) -> RecordSeq {
        let c = self.in_counters.entry(epoch).or_insert(0);
        let seq = encode_rec_seq(epoch, *c);
        *c += 1;
        seq
    }

    /// Queue a handshake fragment, auto-assigning the record sequence number.
    pub fn deliver_handshake(&mut self, epoch: EpochId, hdr: FragmentHeader, payload: Vec<u8>) {
        let rec_seq = self.next_in_seq(epoch);
        self.push_incoming(RecordIn {
            epoch,
            rec_seq,
            content: RecordContent::Handshake { hdr, payload },
        });
    }

    /// Queue a handshake fragment at an explicit record counter.
    pub fn deliver_handshake_at(
        &mut self,
        epoch: EpochId,
        rec_counter: u64,
        hdr: FragmentHeader,
        payload: Vec<u8>,
    ) {
        self.push_incoming(RecordIn {
            epoch,
            rec_seq: encode_rec_seq(epoch, rec_counter),
            content: RecordContent::Handshake { hdr, payload },
        });
    }

    /// Queue incoming application data.
    pub fn deliver_application(&mut self, epoch: EpochId, payload: Vec<u8>) {
        let rec_seq = self.next_in_seq(epoch);
        self.push_incoming(RecordIn {
            epoch,
            rec_seq,
            content: RecordContent::Application(payload),
        });
    }

    /// Queue an incoming alert.
    pub fn deliver_alert(&mut self, epoch: EpochId, alert: Alert, fatal: bool) {
        let rec_seq = self.next_in_seq(epoch);
        self.push_incoming(RecordIn {
            epoch,
            rec_seq,
            content: RecordContent::Alert { alert, fatal },
        });
    }

    /// Queue an incoming ChangeCipherSpec.
    pub fn deliver_ccs(&mut self, epoch: EpochId) {
        let rec_seq = self.next_in_seq(epoch);
        self.push_incoming(RecordIn {
            epoch,
            rec_seq,
            content: RecordContent::ChangeCipherSpec,
        });
    }

    // ------------------------------------------------------------------
    // Outgoing side (test inspection)
    // ------------------------------------------------------------------

    /// Records that reached the wire, in delivery order.
    pub fn sent(&self) -> &[RecordOut] {
        &self.wire
    }

    /// Drain the wire for incremental assertions.
    pub fn take_sent(&mut self) -> Vec<RecordOut> {
        std::mem::take(&mut self.wire)
    }

    /// Records dispatched but not yet flushed.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn stage(&mut self, epoch: EpochId, content: RecordContent) -> Result<()> {
        if self.staged.is_some() {
            return Err(Error::InvalidState("outgoing record already staged"));
        }
        let rec_seq = match self.forced_seq.take() {
            Some(seq) => seq,
            None => {
                let c = self.out_counters.entry(epoch).or_insert(0);
                let seq = encode_rec_seq(epoch, *c);
                *c += 1;
                seq
            }
        };
        self.staged = Some(RecordOut {
            epoch,
            rec_seq,
            content,
        });
        Ok(())
    }
}

impl Default for MemoryRecordLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryRecordLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRecordLayer")
            .field("mtu", &self.mtu)
            .field("incoming", &self.incoming.len())
            .field("pending", &self.pending.len())
            .field("wire", &self.wire.len())
            .finish()
    }
}

impl RecordLayer for MemoryRecordLayer {
    fn read_next(&mut self) -> Result<&RecordIn> {
        if self.current_in.is_none() {
            self.current_in = self.incoming.pop_front();
        }
        self.current_in.as_ref().ok_or(Error::WantRead)
    }

    fn read_consume(&mut self) -> Result<RecordIn> {
        self.current_in
            .take()
            .ok_or(Error::InvalidState("no incoming record open"))
    }

    fn out_payload_capacity(&self, _epoch: EpochId) -> usize {
        self.mtu
    }

    fn write_handshake(
        &mut self,
        epoch: EpochId,
        hdr: &FragmentHeader,
        payload: &[u8],
    ) -> Result<()> {
        if hdr.frag_len != payload.len() {
            return Err(Error::InvalidArgument("fragment length mismatch"));
        }
        if payload.len() > self.mtu {
            return Err(Error::InvalidArgument("fragment exceeds record capacity"));
        }
        self.stage(
            epoch,
            RecordContent::Handshake {
                hdr: *hdr,
                payload: payload.to_vec(),
            },
        )
    }

    fn write_application(&mut self, epoch: EpochId, payload: &[u8]) -> Result<()> {
        if payload.len() > self.mtu {
            return Err(Error::InvalidArgument("payload exceeds record capacity"));
        }
        self.stage(epoch, RecordContent::Application(payload.to_vec()))
    }

    fn write_alert(&mut self, epoch: EpochId, alert: Alert, fatal: bool) -> Result<()> {
        self.stage(epoch, RecordContent::Alert { alert, fatal })
    }

    fn write_ccs(&mut self, epoch: EpochId) -> Result<()> {
        self.stage(epoch, RecordContent::ChangeCipherSpec)
    }

    fn dispatch(&mut self) -> Result<()> {
        let rec = self
            .staged
            .take()
            .ok_or(Error::InvalidState("dispatch without staged record"))?;
        self.pending.push_back(rec);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let budget = self.flush_budget.unwrap_or(usize::MAX);
        for _ in 0..budget {
            match self.pending.pop_front() {
                Some(rec) => self.wire.push(rec),
                None => break,
            }
        }
        if self.pending.is_empty() {
            Ok(())
        } else {
            Err(Error::WantWrite)
        }
    }

    fn force_next_record_seq(&mut self, seq: RecordSeq) -> Result<()> {
        if self.staged.is_some() {
            return Err(Error::InvalidState(
                "cannot force sequence number with a record staged",
            ));
        }
        self.forced_seq = Some(seq);
        Ok(())
    }

    fn current_record_seq(&self) -> Result<RecordSeq> {
        self.current_in
            .as_ref()
            .map(|r| r.rec_seq)
            .ok_or(Error::InvalidState("no incoming record open"))
    }
}
