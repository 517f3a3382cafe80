// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Outgoing pipeline integration tests.
//!
//! Pause/continue fragmentation, unknown-length rules, rewriter-based
//! retransmission backups, and flight capacity.

use dmps::record::mem::{MemoryRecordLayer, NullTransform};
use dmps::record::RecordContent;
use dmps::timer::SharedTimer;
use dmps::{Error, Mps, MpsConfig, MsgFlags};

const T_MIN: u32 = 100;

fn setup(mtu: usize) -> (Mps<MemoryRecordLayer>, SharedTimer) {
    let clock = SharedTimer::new();
    let mut mps = Mps::new(
        MpsConfig::datagram().with_timeouts(T_MIN, 400),
        MemoryRecordLayer::with_mtu(mtu),
        Box::new(clock.clone()),
    );
    let e = mps.add_key_material(Box::new(NullTransform)).unwrap();
    mps.set_incoming_keys(e).unwrap();
    mps.set_outgoing_keys(e).unwrap();
    (mps, clock)
}

/// Helper: collect `(hs_type, seq, total_len, offset, payload)` of every
/// handshake record on the wire.
fn handshake_records(
    mps: &mut Mps<MemoryRecordLayer>,
) -> Vec<(u8, u16, usize, usize, Vec<u8>)> {
    mps.record_layer_mut()
        .take_sent()
        .into_iter()
        .filter_map(|r| match r.content {
            RecordContent::Handshake { hdr, payload } => Some((
                hdr.hs_type,
                hdr.seq,
                hdr.total_len,
                hdr.offset,
                payload,
            )),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// S5: pause/continue
// ---------------------------------------------------------------------------

#[test]
fn test_pause_continue_fragments() {
    let (mut mps, _clock) = setup(512);

    let msg = mps.write_handshake(16, Some(800), None).unwrap();
    assert_eq!(&msg.add[..msg.add_len], &[0, 0], "seq 0 as additional data");
    msg.writer.write_all(&[0x51; 300]).unwrap();
    mps.write_pause().unwrap();

    let msg = mps.write_handshake(16, Some(800), None).unwrap();
    msg.writer.write_all(&[0x52; 500]).unwrap();
    mps.write_set_flags(MsgFlags::EndsFlight).unwrap();
    mps.dispatch().unwrap();
    mps.flush().unwrap();

    let recs = handshake_records(&mut mps);
    assert_eq!(recs.len(), 2);

    let (ty, seq, total, offset, payload) = &recs[0];
    assert_eq!((*ty, *seq, *total, *offset, payload.len()), (16, 0, 800, 0, 300));
    let (ty, seq, total, offset, payload) = &recs[1];
    assert_eq!(
        (*ty, *seq, *total, *offset, payload.len()),
        (16, 0, 800, 300, 500)
    );
}

/// Property: a paused-and-continued write delivers the same message bytes
/// as an unpaused one.
#[test]
fn test_pause_equivalent_to_straight_write() {
    let body: Vec<u8> = (0..900u16).map(|i| (i % 251) as u8).collect();

    // unpaused reference
    let (mut mps, _c) = setup(256);
    let msg = mps.write_handshake(16, Some(body.len()), None).unwrap();
    msg.writer.write_all(&body).unwrap();
    mps.write_set_flags(MsgFlags::EndsFlight).unwrap();
    mps.dispatch().unwrap();
    mps.flush().unwrap();
    let straight: Vec<u8> = handshake_records(&mut mps)
        .into_iter()
        .flat_map(|(_, _, _, _, p)| p)
        .collect();

    // paused in three sittings
    let (mut mps, _c) = setup(256);
    for (lo, hi, last) in [(0usize, 200usize, false), (200, 650, false), (650, 900, true)] {
        let msg = mps.write_handshake(16, Some(body.len()), None).unwrap();
        msg.writer.write_all(&body[lo..hi]).unwrap();
        if last {
            mps.write_set_flags(MsgFlags::EndsFlight).unwrap();
            mps.dispatch().unwrap();
        } else {
            mps.write_pause().unwrap();
        }
    }
    mps.flush().unwrap();

    let recs = handshake_records(&mut mps);
    let paused: Vec<u8> = recs.iter().flat_map(|(_, _, _, _, p)| p.clone()).collect();
    assert_eq!(paused, straight);
    assert_eq!(paused, body);

    // offsets are contiguous and totals consistent
    let mut expected_offset = 0;
    for (_, seq, total, offset, payload) in &recs {
        assert_eq!(*seq, 0);
        assert_eq!(*total, body.len());
        assert_eq!(*offset, expected_offset);
        expected_offset += payload.len();
    }
}

// ---------------------------------------------------------------------------
// Unknown length
// ---------------------------------------------------------------------------

#[test]
fn test_unknown_length_forbids_pause() {
    let (mut mps, _clock) = setup(512);
    let msg = mps.write_handshake(16, None, None).unwrap();
    msg.writer.write_all(&[1; 32]).unwrap();
    assert!(matches!(mps.write_pause(), Err(Error::InvalidState(_))));

    // the message can still be dispatched normally
    mps.write_set_flags(MsgFlags::EndsFlight).unwrap();
    mps.dispatch().unwrap();
    mps.flush().unwrap();
    let recs = handshake_records(&mut mps);
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].2, 32, "total length fixed at dispatch time");
}

// ---------------------------------------------------------------------------
// Rewriter-based backups
// ---------------------------------------------------------------------------

#[test]
fn test_rewriter_resend_matches_original() {
    let (mut mps, clock) = setup(128);
    let body: Vec<u8> = (0..300u16).map(|i| (i * 3 % 256) as u8).collect();

    let cb_body = body.clone();
    let msg = mps
        .write_handshake(
            18,
            Some(body.len()),
            Some(Box::new(move |wr| {
                wr.write_all(&cb_body)?;
                Ok(())
            })),
        )
        .unwrap();
    msg.writer.write_all(&body).unwrap();
    mps.write_set_flags(MsgFlags::EndsFlight).unwrap();
    mps.dispatch().unwrap();
    mps.flush().unwrap();
    let original = handshake_records(&mut mps);
    assert_eq!(original.len(), 3, "300 bytes over mtu 128");

    clock.advance(u64::from(T_MIN));
    assert!(matches!(mps.read(), Err(Error::WantRead)));
    let resent = handshake_records(&mut mps);
    assert_eq!(resent, original, "rewriter must reproduce identical fragments");
}

// ---------------------------------------------------------------------------
// Flight capacity and sequence numbering
// ---------------------------------------------------------------------------

#[test]
fn test_flight_capacity_enforced() {
    let (mut mps, _clock) = setup(512);

    for i in 0..5u8 {
        let msg = mps.write_handshake(20 + i, Some(10), None).unwrap();
        msg.writer.write_all(&[i; 10]).unwrap();
        mps.write_set_flags(MsgFlags::Contributes).unwrap();
        mps.dispatch().unwrap();
    }

    // the sixth message is rejected before anything reaches the wire
    assert!(matches!(
        mps.write_handshake(30, Some(10), None),
        Err(Error::FlightTooLong)
    ));
}

#[test]
fn test_sequence_numbers_increment_per_message() {
    let (mut mps, _clock) = setup(512);

    for expected_seq in 0..3u16 {
        let msg = mps.write_handshake(20, Some(4), None).unwrap();
        assert_eq!(&msg.add[..msg.add_len], &expected_seq.to_be_bytes());
        msg.writer.write_all(&[0; 4]).unwrap();
        mps.write_set_flags(MsgFlags::Contributes).unwrap();
        mps.dispatch().unwrap();
    }
    mps.flush().unwrap();

    let seqs: Vec<u16> = handshake_records(&mut mps)
        .iter()
        .map(|(_, seq, _, _, _)| *seq)
        .collect();
    assert_eq!(seqs, vec![0, 1, 2]);
}

// ---------------------------------------------------------------------------
// CCS participates in the flight
// ---------------------------------------------------------------------------

#[test]
fn test_ccs_is_backed_up_and_resent() {
    let (mut mps, clock) = setup(512);

    mps.write_ccs().unwrap();
    mps.write_set_flags(MsgFlags::Contributes).unwrap();
    mps.dispatch().unwrap();

    let msg = mps.write_handshake(20, Some(8), None).unwrap();
    msg.writer.write_all(&[7; 8]).unwrap();
    mps.write_set_flags(MsgFlags::EndsFlight).unwrap();
    mps.dispatch().unwrap();
    mps.flush().unwrap();
    let original = mps.record_layer_mut().take_sent();
    assert_eq!(original.len(), 2);
    assert!(matches!(original[0].content, RecordContent::ChangeCipherSpec));

    clock.advance(u64::from(T_MIN));
    assert!(matches!(mps.read(), Err(Error::WantRead)));
    let resent = mps.record_layer_mut().take_sent();
    assert_eq!(resent.len(), 2);
    assert!(
        matches!(resent[0].content, RecordContent::ChangeCipherSpec),
        "CCS resent in flight order"
    );
}

// ---------------------------------------------------------------------------
// Epoch pinning
// ---------------------------------------------------------------------------

#[test]
fn test_key_rotation_rejected_while_message_paused() {
    let clock = SharedTimer::new();
    let mut mps = Mps::new(
        MpsConfig::datagram().with_timeouts(T_MIN, 400),
        MemoryRecordLayer::new(),
        Box::new(clock.clone()),
    );
    let e0 = mps.add_key_material(Box::new(NullTransform)).unwrap();
    let e1 = mps.add_key_material(Box::new(NullTransform)).unwrap();
    mps.set_incoming_keys(e0).unwrap();
    mps.set_outgoing_keys(e0).unwrap();

    let msg = mps.write_handshake(16, Some(100), None).unwrap();
    msg.writer.write_all(&[0; 40]).unwrap();
    mps.write_pause().unwrap();

    assert!(matches!(
        mps.set_outgoing_keys(e1),
        Err(Error::InvalidState(_))
    ));
}
