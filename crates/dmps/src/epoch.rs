// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Epoch registry: key-material identity decoupled from key-material
//! lifetime.
//!
//! An epoch binds an integer id to one transform (the opaque key material a
//! record layer protects records with) plus per-direction usage flags. The
//! registry reference-counts every holder of an epoch:
//!
//! - the active incoming and outgoing direction slots,
//! - each reassembly slot buffering a message of that epoch,
//! - each retransmission backup that must resend at that epoch,
//! - any record currently being read or written.
//!
//! A transform is reclaimed only once its count drops to zero. Keys may
//! therefore rotate at flight boundaries while old-epoch backups remain
//! resendable, which is exactly what DTLS retransmission requires.

use std::fmt;

use crate::error::{Error, Result};

/// Identifier of one set of security parameters.
pub type EpochId = u16;

/// Opaque key material owned by the registry.
///
/// The MPS never looks inside a transform; record-layer implementations
/// downcast to their concrete type when protecting records. Record
/// protection itself lives outside this crate.
pub trait Transform: fmt::Debug {}

#[derive(Debug)]
struct EpochSlot {
    /// `None` once the transform has been reclaimed.
    transform: Option<Box<dyn Transform>>,
    usable_for_read: bool,
    usable_for_write: bool,
    refs: usize,
}

/// Registry of all epochs known to one MPS instance.
#[derive(Debug, Default)]
pub struct EpochRegistry {
    slots: Vec<EpochSlot>,
}

impl EpochRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register new key material, transferring ownership to the registry.
    ///
    /// Returns the fresh epoch id. The epoch is not yet usable for either
    /// direction; see [`set_usable_for_read`](Self::set_usable_for_read) and
    /// [`set_usable_for_write`](Self::set_usable_for_write).
    pub fn add(&mut self, transform: Box<dyn Transform>) -> Result<EpochId> {
        if self.slots.len() > usize::from(EpochId::MAX) {
            return Err(Error::InvalidArgument("epoch id space exhausted"));
        }
        let id = self.slots.len() as EpochId;
        self.slots.push(EpochSlot {
            transform: Some(transform),
            usable_for_read: false,
            usable_for_write: false,
            refs: 0,
        });
        log::debug!("epoch {} registered", id);
        Ok(id)
    }

    fn slot(&self, id: EpochId) -> Result<&EpochSlot> {
        self.slots.get(usize::from(id)).ok_or(Error::EpochUnknown(id))
    }

    fn slot_mut(&mut self, id: EpochId) -> Result<&mut EpochSlot> {
        self.slots
            .get_mut(usize::from(id))
            .ok_or(Error::EpochUnknown(id))
    }

    /// Whether `id` names a live (not yet reclaimed) epoch.
    pub fn is_live(&self, id: EpochId) -> bool {
        self.slot(id).map(|s| s.transform.is_some()).unwrap_or(false)
    }

    /// Mark `id` usable for reading.
    pub fn set_usable_for_read(&mut self, id: EpochId) -> Result<()> {
        self.slot_mut(id)?.usable_for_read = true;
        Ok(())
    }

    /// Mark `id` usable for writing.
    pub fn set_usable_for_write(&mut self, id: EpochId) -> Result<()> {
        self.slot_mut(id)?.usable_for_write = true;
        Ok(())
    }

    pub fn usable_for_read(&self, id: EpochId) -> Result<bool> {
        Ok(self.slot(id)?.usable_for_read)
    }

    pub fn usable_for_write(&self, id: EpochId) -> Result<bool> {
        Ok(self.slot(id)?.usable_for_write)
    }

    /// Take one reference on `id`.
    pub fn acquire(&mut self, id: EpochId) -> Result<()> {
        let slot = self.slot_mut(id)?;
        if slot.transform.is_none() {
            return Err(Error::InvariantViolation("acquire on reclaimed epoch"));
        }
        slot.refs += 1;
        Ok(())
    }

    /// Release one reference on `id`, reclaiming the transform when the
    /// count drops to zero.
    pub fn release(&mut self, id: EpochId) -> Result<()> {
        let slot = self.slot_mut(id)?;
        if slot.refs == 0 {
            return Err(Error::InvariantViolation("epoch reference underflow"));
        }
        slot.refs -= 1;
        if slot.refs == 0 {
            slot.transform = None;
            log::debug!("epoch {} reclaimed", id);
        }
        Ok(())
    }

    /// Current reference count of `id` (test and diagnostics support).
    pub fn refs(&self, id: EpochId) -> Result<usize> {
        Ok(self.slot(id)?.refs)
    }
}
