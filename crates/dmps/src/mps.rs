// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The MPS instance: public read/write surface and flight controller.
//!
//! [`Mps`] sits between a record layer and the handshake logic. It exposes
//! messages as typed, streamable objects with well-defined boundaries and
//! epochs, hiding fragmentation, reassembly, replay handling and flight
//! accounting.
//!
//! # Driving loop
//!
//! Every operation returns promptly. When progress depends on the outside
//! world, [`Error::WantRead`]/[`Error::WantWrite`] is returned together
//! with a dependency bitmask (query [`read_dependencies`]/
//! [`write_dependencies`]); the caller re-invokes once the dependency
//! clears. Timeouts are driven purely by the installed [`Timer`], polled on
//! every entry.
//!
//! # A read, start to finish
//!
//! ```ignore
//! match mps.read()? {
//!     MsgKind::Handshake => {
//!         let msg = mps.read_handshake()?;
//!         // ... parse through msg.reader ...
//!         mps.read_set_flags(MsgFlags::EndsFlight)?;
//!         mps.read_consume()?;
//!     }
//!     MsgKind::Alert => { /* ... */ }
//!     _ => { /* ... */ }
//! }
//! ```
//!
//! [`read_dependencies`]: Mps::read_dependencies
//! [`write_dependencies`]: Mps::write_dependencies
//! [`Error::WantRead`]: crate::Error::WantRead
//! [`Error::WantWrite`]: crate::Error::WantWrite

use crate::config::{Mode, MpsConfig, MAX_HS_SEQUENCE_NUMBER, QUIESCENCE_FACTOR};
use crate::detect::{DetectionTable, Verdict};
use crate::epoch::{EpochId, EpochRegistry, Transform};
use crate::error::{Error, Result};
use crate::flight::{FlightState, RetransmitState, WaitState};
use crate::incoming::{FeedOutcome, HandshakeIn, Reassembly};
use crate::outgoing::{chunk_fragments, Backup, Handle, HandshakeOut, OutgoingFlight, RewriteFn};
use crate::record::{RecordContent, RecordLayer, RecordSeq, TransportCallbacks};
use crate::stream::{Reader, Writer, WriterExt};
use crate::timer::{Timer, TimerEvent};
use crate::types::{
    deps, Alert, BlockReason, ConnectionState, Deps, MsgFlags, MsgKind, ALERT_CLOSE_NOTIFY,
    ALERT_INTERNAL_ERROR,
};

/// Handle to an outgoing handshake message.
///
/// `add` carries read-only additional data that enters transcript checksum
/// computations: the handshake sequence number for DTLS, empty for TLS.
pub struct HandshakeOutHandle<'a> {
    /// Additional data bytes (first `add_len` are valid).
    pub add: [u8; 8],
    /// Length of the additional data.
    pub add_len: usize,
    /// Bounded writer over the message body.
    pub writer: &'a mut WriterExt,
}

/// Currently open incoming message.
#[derive(Debug)]
enum CurrentRead {
    None,
    /// Handshake message lent out by the reassembly engine.
    Handshake,
    Application(Reader),
    Alert { alert: Alert },
    Ccs,
}

/// Currently open outgoing message.
enum CurrentWrite {
    None,
    Handshake,
    Application(Writer),
    Alert { alert: Alert },
    Ccs,
}

/// Message processing stack over a record layer `L`.
pub struct Mps<L: RecordLayer> {
    conf: MpsConfig,
    rl: L,
    timer: Box<dyn Timer>,
    epochs: EpochRegistry,
    in_epoch: Option<EpochId>,
    out_epoch: Option<EpochId>,

    state: ConnectionState,
    block: Option<BlockReason>,
    /// Alert queued for delivery on the next flush: `(alert, fatal)`.
    alert_pending: Option<(Alert, bool)>,

    // read side
    read: CurrentRead,
    read_flags: Option<MsgFlags>,
    read_rec_seq: Option<RecordSeq>,
    /// Epoch reference held for the open app/alert/CCS record.
    read_epoch_held: Option<EpochId>,
    read_deps: Deps,

    // write side
    write: CurrentWrite,
    write_flags: Option<MsgFlags>,
    flush_pending: bool,

    // DTLS flight engine
    flight: FlightState,
    retransmit: RetransmitState,
    hs_out: HandshakeOut,
    /// Next outgoing handshake sequence number.
    out_seq: u16,
    /// Epoch reference held for the open outgoing handshake message.
    write_epoch_held: Option<EpochId>,
    wait: WaitState,
    /// Set once the intermediate timer event of the current arming fired.
    intermediate_seen: bool,
    outgoing: OutgoingFlight,
    incoming: Reassembly,
    detect: DetectionTable,
}

impl<L: RecordLayer> Mps<L> {
    /// Create an instance over `rl`, driven by `timer`.
    pub fn new(conf: MpsConfig, rl: L, timer: Box<dyn Timer>) -> Self {
        let hs_timeout_min = conf.hs_timeout_min;
        Self {
            conf,
            rl,
            timer,
            epochs: EpochRegistry::new(),
            in_epoch: None,
            out_epoch: None,
            state: ConnectionState::Open,
            block: None,
            alert_pending: None,
            read: CurrentRead::None,
            read_flags: None,
            read_rec_seq: None,
            read_epoch_held: None,
            read_deps: deps::BLOCK_READ,
            write: CurrentWrite::None,
            write_flags: None,
            flush_pending: false,
            flight: FlightState::Done,
            retransmit: RetransmitState::None,
            hs_out: HandshakeOut::new(),
            out_seq: 0,
            write_epoch_held: None,
            wait: WaitState::new(hs_timeout_min),
            intermediate_seen: false,
            outgoing: OutgoingFlight::new(),
            incoming: Reassembly::new(0),
            detect: DetectionTable::new(),
        }
    }

    fn is_datagram(&self) -> bool {
        self.conf.mode == Mode::Datagram
    }

    // ======================================================================
    // Connection state
    // ======================================================================

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    /// Why the instance is blocked, if it is.
    pub fn error_state(&self) -> Option<BlockReason> {
        self.block
    }

    /// Current flight-exchange state (diagnostics).
    pub fn flight_state(&self) -> FlightState {
        self.flight
    }

    /// Current retransmission activity (diagnostics).
    pub fn retransmit_state(&self) -> RetransmitState {
        self.retransmit
    }

    fn guard_read(&self) -> Result<()> {
        match self.state {
            ConnectionState::Blocked => Err(Error::Blocked),
            s if s.may_read() => Ok(()),
            _ => Err(Error::InvalidState("reads rejected in connection state")),
        }
    }

    fn guard_write(&self) -> Result<()> {
        match self.state {
            ConnectionState::Blocked => Err(Error::Blocked),
            s if s.may_write() => Ok(()),
            _ => Err(Error::InvalidState("writes rejected in connection state")),
        }
    }

    /// Escalate an error per the propagation policy: peer misbehaviour
    /// blocks the instance and queues a fatal alert, internal inconsistency
    /// blocks it silently, everything else passes through.
    fn escalate(&mut self, e: Error) -> Error {
        match e {
            Error::ProtocolViolation(_) => {
                log::warn!("blocking connection: {}", e);
                self.state = ConnectionState::Blocked;
                self.block = Some(BlockReason::AlertSent(ALERT_INTERNAL_ERROR));
                self.alert_pending = Some((ALERT_INTERNAL_ERROR, true));
                e
            }
            Error::InvariantViolation(msg) => {
                log::warn!("blocking connection on internal error: {}", msg);
                self.state = ConnectionState::Blocked;
                self.block = Some(BlockReason::InternalError(msg));
                e
            }
            other => other,
        }
    }

    // ======================================================================
    // Key material
    // ======================================================================

    /// Register new key material; ownership transfers to the registry.
    pub fn add_key_material(&mut self, transform: Box<dyn Transform>) -> Result<EpochId> {
        self.epochs.add(transform)
    }

    /// Use `id` for subsequent incoming records.
    pub fn set_incoming_keys(&mut self, id: EpochId) -> Result<()> {
        if !self.epochs.is_live(id) {
            return Err(Error::EpochUnknown(id));
        }
        self.epochs.acquire(id)?;
        self.epochs.set_usable_for_read(id)?;
        if let Some(old) = self.in_epoch.replace(id) {
            self.epochs.release(old)?;
        }
        log::debug!("incoming epoch set to {}", id);
        Ok(())
    }

    /// Use `id` for subsequent outgoing records.
    pub fn set_outgoing_keys(&mut self, id: EpochId) -> Result<()> {
        if !self.epochs.is_live(id) {
            return Err(Error::EpochUnknown(id));
        }
        if self.hs_out.is_active() || self.hs_out.is_paused() {
            return Err(Error::InvalidState(
                "cannot rotate outgoing keys with a handshake message open",
            ));
        }
        self.epochs.acquire(id)?;
        self.epochs.set_usable_for_write(id)?;
        if let Some(old) = self.out_epoch.replace(id) {
            self.epochs.release(old)?;
        }
        log::debug!("outgoing epoch set to {}", id);
        Ok(())
    }

    /// Reference count of an epoch (diagnostics/tests).
    pub fn epoch_refs(&self, id: EpochId) -> Result<usize> {
        self.epochs.refs(id)
    }

    /// Forward transport callbacks to the record layer.
    pub fn set_bio(&mut self, bio: TransportCallbacks) -> Result<()> {
        self.rl.set_bio(bio)
    }

    // ======================================================================
    // Timer handling
    // ======================================================================

    fn arm_timer(&mut self) {
        let t = self.wait.retransmit_timeout_ms;
        match self.flight {
            FlightState::Await | FlightState::Receive => {
                self.timer.set((t / 2).max(1), t);
            }
            FlightState::Finalize => {
                // intermediate: one defensive resend of the terminal flight;
                // final: quiescence over
                self.timer.set(
                    t,
                    QUIESCENCE_FACTOR.saturating_mul(self.conf.hs_timeout_max),
                );
            }
            _ => self.timer.set(0, 0),
        }
        self.intermediate_seen = false;
    }

    fn cancel_timer(&mut self) {
        self.timer.set(0, 0);
        self.intermediate_seen = false;
    }

    /// Poll the timer and act on elapsed deadlines.
    fn poll_timer(&mut self) -> Result<()> {
        if !self.is_datagram() {
            return Ok(());
        }
        match self.timer.get() {
            TimerEvent::Cancelled | TimerEvent::Pending => Ok(()),
            TimerEvent::Intermediate => {
                if self.flight == FlightState::Finalize && !self.intermediate_seen {
                    self.intermediate_seen = true;
                    log::debug!("finalize: intermediate timeout, resending terminal flight");
                    self.start_resend(RetransmitState::Resend)?;
                }
                Ok(())
            }
            TimerEvent::Final => match self.flight {
                FlightState::Await => {
                    log::debug!(
                        "await: retransmission timeout ({} ms)",
                        self.wait.retransmit_timeout_ms
                    );
                    self.wait.backoff(self.conf.hs_timeout_max);
                    self.arm_timer();
                    self.start_resend(RetransmitState::Resend)
                }
                FlightState::Receive => {
                    log::debug!("receive: disruption timeout, requesting retransmission");
                    self.wait.backoff(self.conf.hs_timeout_max);
                    self.arm_timer();
                    self.start_resend(RetransmitState::RequestResend)
                }
                FlightState::Finalize => {
                    log::debug!("finalize: quiescence period elapsed");
                    self.handshake_cleanup()
                }
                _ => {
                    self.cancel_timer();
                    Ok(())
                }
            },
        }
    }

    // ======================================================================
    // Resend machinery
    // ======================================================================

    fn start_resend(&mut self, kind: RetransmitState) -> Result<()> {
        if self.outgoing.is_empty() {
            return Ok(());
        }
        if self.retransmit == RetransmitState::None {
            self.retransmit = kind;
            self.wait.resend_offset = 0;
        }
        self.continue_resend()
    }

    /// Resend backups from the current offset. On `WantWrite` the offset is
    /// preserved so the resend resumes without replaying delivered messages.
    fn continue_resend(&mut self) -> Result<()> {
        while let Some(backup) = self.outgoing.get(self.wait.resend_offset) {
            let epoch = backup.epoch;
            let cap = self.rl.out_payload_capacity(epoch);
            match &backup.handle {
                Handle::Ccs => {
                    self.rl.write_ccs(epoch)?;
                    self.rl.dispatch()?;
                }
                _ => {
                    let body = backup.regenerate()?;
                    let frags =
                        chunk_fragments(backup.hs_type, backup.seq, backup.len, 0, &body, cap);
                    for (hdr, payload) in &frags {
                        self.rl.write_handshake(epoch, hdr, payload)?;
                        self.rl.dispatch()?;
                    }
                }
            }
            self.wait.resend_offset += 1;
        }
        match self.rl.flush() {
            Ok(()) => {
                log::debug!(
                    "flight of {} message(s) retransmitted",
                    self.outgoing.len()
                );
                self.retransmit = RetransmitState::None;
                self.wait.resend_offset = 0;
                Ok(())
            }
            Err(Error::WantWrite) => {
                self.flush_pending = true;
                Err(Error::WantWrite)
            }
            Err(e) => Err(e),
        }
    }

    /// Finish a pending flush and any interrupted resend before new work.
    fn process_pending_output(&mut self) -> Result<()> {
        if self.retransmit != RetransmitState::None {
            self.continue_resend()?;
        }
        if self.flush_pending {
            self.do_flush()?;
        }
        Ok(())
    }

    fn do_flush(&mut self) -> Result<()> {
        if let Some((alert, fatal)) = self.alert_pending {
            let epoch = self.out_epoch.unwrap_or_default();
            self.rl.write_alert(epoch, alert, fatal)?;
            self.rl.dispatch()?;
            self.alert_pending = None;
        }
        match self.rl.flush() {
            Ok(()) => {
                self.flush_pending = false;
                Ok(())
            }
            Err(Error::WantWrite) => {
                self.flush_pending = true;
                Err(Error::WantWrite)
            }
            Err(e) => Err(e),
        }
    }

    /// Terminal cleanup shared by `Finalize -> Done` and the consumption of
    /// a handshake-ending incoming flight.
    fn handshake_cleanup(&mut self) -> Result<()> {
        self.outgoing.clear(&mut self.epochs)?;
        self.detect.clear();
        self.incoming.clear(&mut self.epochs)?;
        self.cancel_timer();
        self.wait.reset(self.conf.hs_timeout_min);
        self.retransmit = RetransmitState::None;
        self.flight = FlightState::Done;
        log::debug!("flight exchange done");
        Ok(())
    }

    // ======================================================================
    // Read path
    // ======================================================================

    /// Attempt to read the next incoming message, returning its kind.
    ///
    /// On [`Error::WantRead`]/[`Error::WantWrite`] consult
    /// [`read_dependencies`](Self::read_dependencies) and re-invoke once the
    /// dependency clears.
    pub fn read(&mut self) -> Result<MsgKind> {
        self.guard_read()?;
        if !matches!(self.read, CurrentRead::None) {
            return Err(Error::InvalidState("incoming message already open"));
        }
        self.read_deps = deps::BLOCK_READ;

        match self.read_inner() {
            Err(Error::WantWrite) => {
                self.read_deps = deps::BLOCK_WRITE;
                Err(Error::WantWrite)
            }
            other => other,
        }
    }

    fn read_inner(&mut self) -> Result<MsgKind> {
        self.process_pending_output()?;
        self.poll_timer().map_err(|e| self.escalate(e))?;

        let in_epoch = self
            .in_epoch
            .ok_or(Error::InvalidState("no incoming keys set"))?;

        // a reassembled (or paused) message takes precedence over records
        if self.incoming.available() {
            self.read = CurrentRead::Handshake;
            return Ok(MsgKind::Handshake);
        }

        loop {
            match self.rl.read_next() {
                Ok(_) => {}
                Err(Error::WantRead) => return Err(Error::WantRead),
                Err(e) => return Err(self.escalate(e)),
            }
            let rec = self.rl.read_consume()?;

            match rec.content {
                RecordContent::Handshake { hdr, payload } => {
                    match self.on_handshake_record(in_epoch, rec.epoch, hdr, payload) {
                        Ok(Some(kind)) => {
                            self.read_rec_seq = Some(rec.rec_seq);
                            return Ok(kind);
                        }
                        Ok(None) => continue,
                        Err(e) => return Err(self.escalate(e)),
                    }
                }
                RecordContent::Application(payload) => {
                    if rec.epoch != in_epoch {
                        log::warn!(
                            "dropping application data at stale epoch {} (current {})",
                            rec.epoch,
                            in_epoch
                        );
                        continue;
                    }
                    self.epochs.acquire(rec.epoch)?;
                    self.read_epoch_held = Some(rec.epoch);
                    self.read_rec_seq = Some(rec.rec_seq);
                    self.read = CurrentRead::Application(Reader::with_fragment(payload));
                    return Ok(MsgKind::ApplicationData);
                }
                RecordContent::Alert { alert, fatal } => {
                    if fatal {
                        log::warn!("fatal alert {} received", alert);
                        self.state = ConnectionState::Blocked;
                        self.block = Some(BlockReason::AlertReceived(alert));
                        return Err(Error::FatalAlertReceived(alert));
                    }
                    self.epochs.acquire(rec.epoch)?;
                    self.read_epoch_held = Some(rec.epoch);
                    self.read_rec_seq = Some(rec.rec_seq);
                    self.read = CurrentRead::Alert { alert };
                    return Ok(MsgKind::Alert);
                }
                RecordContent::ChangeCipherSpec => {
                    if rec.epoch != in_epoch {
                        log::warn!("dropping CCS at stale epoch {}", rec.epoch);
                        continue;
                    }
                    self.epochs.acquire(rec.epoch)?;
                    self.read_epoch_held = Some(rec.epoch);
                    self.read_rec_seq = Some(rec.rec_seq);
                    self.read = CurrentRead::Ccs;
                    return Ok(MsgKind::ChangeCipherSpec);
                }
            }
        }
    }

    /// Handle one incoming handshake record: retransmission detection,
    /// flight transitions, reassembly.
    fn on_handshake_record(
        &mut self,
        in_epoch: EpochId,
        rec_epoch: EpochId,
        hdr: crate::record::FragmentHeader,
        payload: Vec<u8>,
    ) -> Result<Option<MsgKind>> {
        if !self.is_datagram() {
            // stream transports deliver whole messages in order
            if !hdr.is_whole_message() {
                return Err(Error::ProtocolViolation(
                    "fragmented handshake message on stream transport",
                ));
            }
            if rec_epoch != in_epoch {
                log::warn!("dropping handshake message at stale epoch {}", rec_epoch);
                return Ok(None);
            }
            let hdr = crate::record::FragmentHeader {
                seq: self.incoming.next_seq(),
                ..hdr
            };
            return match self.incoming.feed(&mut self.epochs, rec_epoch, &hdr, payload)? {
                FeedOutcome::Ready => {
                    self.read = CurrentRead::Handshake;
                    Ok(Some(MsgKind::Handshake))
                }
                FeedOutcome::Pending => Ok(None),
            };
        }

        // replays of the last incoming flight never reach the engine
        match self.detect.check(rec_epoch, hdr.seq) {
            Verdict::Resend => {
                self.start_resend(match self.flight {
                    FlightState::Receive => RetransmitState::RequestResend,
                    _ => RetransmitState::Resend,
                })?;
                return Ok(None);
            }
            Verdict::Ignore => return Ok(None),
            Verdict::Miss => {}
        }

        if rec_epoch != in_epoch {
            log::warn!(
                "dropping handshake fragment at epoch {} (incoming epoch {})",
                rec_epoch,
                in_epoch
            );
            return Ok(None);
        }

        // genuine progress from the peer
        match self.flight {
            FlightState::Await => {
                // First message of the reply flight implicitly acknowledges
                // our last outgoing flight. The backups stay around until we
                // start writing our next flight: a disruption while receiving
                // is answered by resending them (DTLS 1.2 retransmission
                // request). The detection table switches to the new flight.
                log::debug!("first message of next flight received");
                self.detect.clear();
                self.retransmit = RetransmitState::None;
                self.wait.reset(self.conf.hs_timeout_min);
                self.flight = FlightState::Receive;
                self.arm_timer();
            }
            FlightState::Done => {
                self.flight = FlightState::Receive;
                // nothing of ours to guard yet; the timer stays off
            }
            _ => {}
        }

        match self.incoming.feed(&mut self.epochs, rec_epoch, &hdr, payload) {
            Ok(FeedOutcome::Ready) => {
                self.read = CurrentRead::Handshake;
                Ok(Some(MsgKind::Handshake))
            }
            Ok(FeedOutcome::Pending) => Ok(None),
            Err(Error::BufferExhausted) => {
                log::warn!(
                    "no buffer for future message seq {}, dropping fragment",
                    hdr.seq
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Kind of the already-fetched message, without any processing.
    pub fn read_check(&self) -> Result<Option<MsgKind>> {
        if self.state == ConnectionState::Blocked {
            return Err(Error::Blocked);
        }
        Ok(match self.read {
            CurrentRead::None => None,
            CurrentRead::Handshake => Some(MsgKind::Handshake),
            CurrentRead::Application(_) => Some(MsgKind::ApplicationData),
            CurrentRead::Alert { .. } => Some(MsgKind::Alert),
            CurrentRead::Ccs => Some(MsgKind::ChangeCipherSpec),
        })
    }

    /// Contents of the pending handshake message.
    pub fn read_handshake(&mut self) -> Result<HandshakeIn<'_>> {
        if !matches!(self.read, CurrentRead::Handshake) {
            return Err(Error::InvalidState("no handshake message pending"));
        }
        let in_epoch = self
            .in_epoch
            .ok_or(Error::InvalidState("no incoming keys set"))?;
        self.incoming.request(in_epoch)
    }

    /// Reader over the pending application data.
    pub fn read_application(&mut self) -> Result<&mut Reader> {
        match &mut self.read {
            CurrentRead::Application(rd) => Ok(rd),
            _ => Err(Error::InvalidState("no application data pending")),
        }
    }

    /// Type of the pending alert.
    pub fn read_alert(&self) -> Result<Alert> {
        match self.read {
            CurrentRead::Alert { alert } => Ok(alert),
            _ => Err(Error::InvalidState("no alert pending")),
        }
    }

    /// Confirm the pending ChangeCipherSpec.
    pub fn read_ccs(&self) -> Result<()> {
        match self.read {
            CurrentRead::Ccs => Ok(()),
            _ => Err(Error::InvalidState("no ChangeCipherSpec pending")),
        }
    }

    /// Annotate the current incoming message's role in the flight.
    pub fn read_set_flags(&mut self, flags: MsgFlags) -> Result<()> {
        if matches!(self.read, CurrentRead::None) {
            return Err(Error::InvalidState("no incoming message open"));
        }
        self.read_flags = Some(flags);
        Ok(())
    }

    /// Pause reading the current handshake message; the unread remainder is
    /// handed back by the next successful `read()`.
    pub fn read_pause(&mut self) -> Result<()> {
        if !matches!(self.read, CurrentRead::Handshake) {
            return Err(Error::InvalidState("only handshake reads can pause"));
        }
        self.incoming.pause()?;
        self.read = CurrentRead::None;
        self.read_flags = None;
        self.read_rec_seq = None;
        Ok(())
    }

    /// Conclude the current incoming message.
    pub fn read_consume(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.read, CurrentRead::None) {
            CurrentRead::None => Err(Error::InvalidState("no incoming message open")),
            CurrentRead::Handshake => {
                let flags = if self.is_datagram() {
                    match self.read_flags {
                        Some(f) => f,
                        None => {
                            self.read = CurrentRead::Handshake;
                            return Err(Error::InvalidState(
                                "handshake message flags not set before consume",
                            ));
                        }
                    }
                } else {
                    MsgFlags::None
                };

                let (epoch, seq) = match self.incoming.consume(&mut self.epochs) {
                    Ok(v) => v,
                    Err(e @ Error::InvalidState(_)) => {
                        self.read = CurrentRead::Handshake;
                        return Err(e);
                    }
                    Err(e) => return Err(self.escalate(e)),
                };
                self.read_flags = None;
                self.read_rec_seq = None;

                if self.is_datagram() {
                    if flags.contributes() {
                        self.detect.remember(epoch, seq);
                    }
                    match flags {
                        MsgFlags::EndsFlight => {
                            log::debug!("incoming flight complete, our turn to send");
                            // the completed exchange step retires our
                            // previous flight
                            self.outgoing.clear(&mut self.epochs)?;
                            self.flight = FlightState::Send;
                            self.retransmit = RetransmitState::None;
                            self.wait.reset(self.conf.hs_timeout_min);
                            self.cancel_timer();
                        }
                        MsgFlags::EndsHandshake => {
                            self.handshake_cleanup()?;
                        }
                        _ => {}
                    }
                }
                Ok(())
            }
            CurrentRead::Application(_) => {
                self.release_read_epoch()?;
                self.read_flags = None;
                self.read_rec_seq = None;
                Ok(())
            }
            CurrentRead::Alert { alert } => {
                self.release_read_epoch()?;
                self.read_flags = None;
                self.read_rec_seq = None;
                if alert == ALERT_CLOSE_NOTIFY {
                    self.state = match self.state {
                        ConnectionState::ReadOnly => ConnectionState::Closed,
                        _ => ConnectionState::WriteOnly,
                    };
                    log::debug!("peer closed writing side: {:?}", self.state);
                }
                Ok(())
            }
            CurrentRead::Ccs => {
                self.release_read_epoch()?;
                self.read_flags = None;
                self.read_rec_seq = None;
                Ok(())
            }
        }
    }

    fn release_read_epoch(&mut self) -> Result<()> {
        if let Some(epoch) = self.read_epoch_held.take() {
            self.epochs.release(epoch)?;
        }
        Ok(())
    }

    /// External dependencies for the next read attempt.
    pub fn read_dependencies(&self) -> Deps {
        self.read_deps
    }

    /// External dependencies for the next write attempt.
    pub fn write_dependencies(&self) -> Deps {
        if self.flush_pending {
            deps::BLOCK_WRITE
        } else {
            0
        }
    }

    /// Record sequence number of the record carrying the current incoming
    /// message.
    ///
    /// Abstraction break mandated by the DTLS HelloVerifyRequest mechanism;
    /// use only between `read()` and `read_consume()`.
    pub fn get_sequence_number(&self) -> Result<RecordSeq> {
        self.read_rec_seq
            .ok_or(Error::InvalidState("no incoming message open"))
    }

    /// Force the record sequence number of the next outgoing record.
    ///
    /// Abstraction break mandated by the DTLS HelloVerifyRequest mechanism;
    /// call before opening the write it applies to.
    pub fn force_sequence_number(&mut self, seq: RecordSeq) -> Result<()> {
        if !matches!(self.write, CurrentWrite::None) {
            return Err(Error::InvalidState(
                "cannot force sequence number with a message open",
            ));
        }
        self.rl.force_next_record_seq(seq)
    }

    // ======================================================================
    // Write path
    // ======================================================================

    fn out_epoch(&self) -> Result<EpochId> {
        self.out_epoch
            .ok_or(Error::InvalidState("no outgoing keys set"))
    }

    /// Open an outgoing handshake message.
    ///
    /// `length` is the declared total body length, or `None` when it is
    /// determined at write time (pausing is then forbidden and the message
    /// is bounded by one record). A `rewriter` avoids the raw retransmission
    /// copy; it must be deterministic over its captured context.
    pub fn write_handshake(
        &mut self,
        hs_type: u8,
        length: Option<usize>,
        rewriter: Option<RewriteFn>,
    ) -> Result<HandshakeOutHandle<'_>> {
        self.guard_write()?;
        self.process_pending_output()?;
        if self.is_datagram() {
            self.poll_timer().map_err(|e| self.escalate(e))?;
        }
        if !matches!(self.write, CurrentWrite::None) {
            return Err(Error::InvalidState("outgoing message already open"));
        }
        let epoch = self.out_epoch()?;

        let continuing = self.hs_out.is_paused();
        if self.is_datagram() && !continuing {
            match self.flight {
                FlightState::Done => {
                    // first message of a new outgoing flight
                    self.outgoing.clear(&mut self.epochs)?;
                    self.wait.reset(self.conf.hs_timeout_min);
                    self.flight = FlightState::Send;
                    log::debug!("starting new outgoing flight");
                }
                FlightState::Send => {}
                _ => {
                    return Err(Error::InvalidState(
                        "cannot write handshake messages while the peer's flight is pending",
                    ));
                }
            }
            if self.out_seq == MAX_HS_SEQUENCE_NUMBER {
                return Err(Error::SequenceOverflow);
            }
            if self.outgoing.len() >= crate::config::MAX_FLIGHT_LENGTH {
                return Err(Error::FlightTooLong);
            }
        }

        let seq = if continuing {
            self.hs_out.seq()
        } else if self.is_datagram() {
            self.out_seq
        } else {
            0
        };

        let cap = self.rl.out_payload_capacity(epoch);
        self.hs_out.open(cap, hs_type, epoch, seq, length, rewriter)?;
        if !continuing {
            self.epochs.acquire(epoch)?;
            self.write_epoch_held = Some(epoch);
        }
        self.write = CurrentWrite::Handshake;

        let mut add = [0u8; 8];
        let add_len = if self.is_datagram() {
            add[..2].copy_from_slice(&seq.to_be_bytes());
            2
        } else {
            0
        };
        Ok(HandshakeOutHandle {
            add,
            add_len,
            writer: self.hs_out.writer()?,
        })
    }

    /// Open an outgoing application-data message.
    pub fn write_application(&mut self) -> Result<&mut Writer> {
        self.guard_write()?;
        self.process_pending_output()?;
        if !matches!(self.write, CurrentWrite::None) {
            return Err(Error::InvalidState("outgoing message already open"));
        }
        let epoch = self.out_epoch()?;
        let cap = self.rl.out_payload_capacity(epoch);
        self.write = CurrentWrite::Application(Writer::new(cap));
        match &mut self.write {
            CurrentWrite::Application(wr) => Ok(wr),
            _ => Err(Error::InvariantViolation("application writer slot missing")),
        }
    }

    /// Open an outgoing non-fatal alert.
    pub fn write_alert(&mut self, alert: Alert) -> Result<()> {
        self.guard_write()?;
        self.process_pending_output()?;
        if !matches!(self.write, CurrentWrite::None) {
            return Err(Error::InvalidState("outgoing message already open"));
        }
        self.out_epoch()?;
        self.write = CurrentWrite::Alert { alert };
        Ok(())
    }

    /// Open an outgoing ChangeCipherSpec message.
    pub fn write_ccs(&mut self) -> Result<()> {
        self.guard_write()?;
        self.process_pending_output()?;
        if !matches!(self.write, CurrentWrite::None) {
            return Err(Error::InvalidState("outgoing message already open"));
        }
        if self.is_datagram()
            && !matches!(self.flight, FlightState::Done | FlightState::Send)
        {
            return Err(Error::InvalidState(
                "cannot write CCS while the peer's flight is pending",
            ));
        }
        self.out_epoch()?;
        self.write = CurrentWrite::Ccs;
        Ok(())
    }

    /// Annotate the current outgoing message's role in the flight.
    pub fn write_set_flags(&mut self, flags: MsgFlags) -> Result<()> {
        if matches!(self.write, CurrentWrite::None) {
            return Err(Error::InvalidState("no outgoing message open"));
        }
        self.write_flags = Some(flags);
        Ok(())
    }

    /// Pause the current outgoing handshake message, dispatching the bytes
    /// written so far as fragments.
    pub fn write_pause(&mut self) -> Result<()> {
        if !matches!(self.write, CurrentWrite::Handshake) {
            return Err(Error::InvalidState("only handshake writes can pause"));
        }
        let epoch = self.hs_out.epoch();
        let cap = self.rl.out_payload_capacity(epoch);
        let frags = self.hs_out.pause(cap)?;
        for (hdr, payload) in &frags {
            self.rl.write_handshake(epoch, hdr, payload)?;
            self.rl.dispatch()?;
        }
        self.write = CurrentWrite::None;
        Ok(())
    }

    /// Conclude the current outgoing message.
    pub fn dispatch(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.write, CurrentWrite::None) {
            CurrentWrite::None => Err(Error::InvalidState("no outgoing message open")),
            CurrentWrite::Handshake => {
                let flags = if self.is_datagram() {
                    match self.write_flags {
                        Some(f) => f,
                        None => {
                            self.write = CurrentWrite::Handshake;
                            return Err(Error::InvalidState(
                                "handshake message flags not set before dispatch",
                            ));
                        }
                    }
                } else {
                    MsgFlags::None
                };

                let epoch = self.hs_out.epoch();
                let cap = self.rl.out_payload_capacity(epoch);
                let (frags, backup) = match self.hs_out.dispatch(cap) {
                    Ok(v) => v,
                    Err(e @ Error::InvalidState(_)) => {
                        self.write = CurrentWrite::Handshake;
                        return Err(e);
                    }
                    Err(e) => return Err(self.escalate(e)),
                };
                for (hdr, payload) in &frags {
                    self.rl.write_handshake(epoch, hdr, payload)?;
                    self.rl.dispatch()?;
                }

                if self.is_datagram() {
                    self.outgoing.install(&mut self.epochs, backup)?;
                    self.out_seq = self
                        .out_seq
                        .checked_add(1)
                        .ok_or(Error::SequenceOverflow)?;
                }
                if let Some(held) = self.write_epoch_held.take() {
                    self.epochs.release(held)?;
                }
                self.finish_outgoing_message(flags)
            }
            CurrentWrite::Application(wr) => {
                let epoch = self.out_epoch()?;
                self.rl.write_application(epoch, wr.fragment())?;
                self.rl.dispatch()?;
                self.write_flags = None;
                Ok(())
            }
            CurrentWrite::Alert { alert } => {
                let epoch = self.out_epoch()?;
                self.rl.write_alert(epoch, alert, false)?;
                self.rl.dispatch()?;
                self.write_flags = None;
                Ok(())
            }
            CurrentWrite::Ccs => {
                let epoch = self.out_epoch()?;
                self.rl.write_ccs(epoch)?;
                self.rl.dispatch()?;
                let flags = if self.is_datagram() {
                    // a CCS may open a new flight just like a handshake message
                    if self.flight == FlightState::Done {
                        self.outgoing.clear(&mut self.epochs)?;
                        self.wait.reset(self.conf.hs_timeout_min);
                        self.flight = FlightState::Send;
                    }
                    let flags = self.write_flags.unwrap_or(MsgFlags::Contributes);
                    self.outgoing.install(
                        &mut self.epochs,
                        Backup {
                            hs_type: 0,
                            seq: 0,
                            epoch,
                            len: 0,
                            handle: Handle::Ccs,
                        },
                    )?;
                    flags
                } else {
                    MsgFlags::None
                };
                self.finish_outgoing_message(flags)
            }
        }
    }

    /// Flight transitions driven by the flags of a dispatched message.
    fn finish_outgoing_message(&mut self, flags: MsgFlags) -> Result<()> {
        self.write_flags = None;
        if !self.is_datagram() {
            return Ok(());
        }
        match flags {
            MsgFlags::EndsFlight => {
                log::debug!(
                    "outgoing flight of {} message(s) complete, awaiting reply",
                    self.outgoing.len()
                );
                self.flight = FlightState::Await;
                self.wait.reset(self.conf.hs_timeout_min);
                self.arm_timer();
                self.flush_pending = true;
            }
            MsgFlags::EndsHandshake => {
                log::debug!("terminal outgoing flight complete, finalizing");
                self.flight = FlightState::Finalize;
                self.wait.reset(self.conf.hs_timeout_min);
                self.arm_timer();
                self.flush_pending = true;
            }
            _ => {}
        }
        Ok(())
    }

    /// Deliver everything dispatched since the last flush to the transport.
    ///
    /// Legal even when blocked, to push out a pending fatal alert.
    pub fn flush(&mut self) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Err(Error::InvalidState("connection closed"));
        }
        self.do_flush()
    }

    // ======================================================================
    // Shutdown
    // ======================================================================

    /// Send a fatal alert and block the instance.
    ///
    /// Returns `WantWrite` if the alert could not be delivered yet; repeat
    /// `flush()` until it succeeds, then drop the instance.
    pub fn send_fatal(&mut self, alert: Alert) -> Result<()> {
        if self.state == ConnectionState::Blocked {
            return Err(Error::Blocked);
        }
        log::warn!("sending fatal alert {}", alert);
        self.state = ConnectionState::Blocked;
        self.block = Some(BlockReason::AlertSent(alert));
        self.alert_pending = Some((alert, true));
        self.do_flush()
    }

    /// Initiate or proceed with orderly shutdown of the writing side.
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Blocked => return Err(Error::Blocked),
            ConnectionState::Open => self.state = ConnectionState::ReadOnly,
            ConnectionState::WriteOnly => self.state = ConnectionState::Closed,
            ConnectionState::ReadOnly | ConnectionState::Closed => return Ok(()),
        }
        log::debug!("closing writing side: {:?}", self.state);
        self.alert_pending = Some((ALERT_CLOSE_NOTIFY, false));
        self.do_flush()
    }

    /// Access the record layer (test support).
    pub fn record_layer(&self) -> &L {
        &self.rl
    }

    /// Mutable access to the record layer (test support).
    pub fn record_layer_mut(&mut self) -> &mut L {
        &mut self.rl
    }
}
