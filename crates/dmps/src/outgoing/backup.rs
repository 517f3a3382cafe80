// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Retransmission backups.
//!
//! Every message of the current outgoing flight leaves behind a [`Backup`]
//! sufficient to reproduce it byte for byte. Three shapes exist:
//!
//! - `Raw`: a verbatim copy of the serialized body. Headers are excluded;
//!   they are regenerated from the stored metadata on resend.
//! - `Rewrite`: a deterministic callback re-authoring the body into a
//!   bounded writer. Trades the RAM of a raw copy for the obligation that
//!   two invocations produce identical bytes.
//! - `Ccs`: no payload.
//!
//! The stored epoch is the one the message was originally sent under. Keys
//! may rotate at flight boundaries; resends must not follow them.

use std::borrow::Cow;
use std::fmt;

use crate::epoch::EpochId;
use crate::error::{Error, Result};
use crate::stream::{write_all, Writer, WriterExt};

/// Deterministic body rewriter.
///
/// The closure owns its context; the context must not be mutated through
/// interior mutability. A second invocation **must** produce byte-identical
/// output. Violations are not detected by this layer.
pub type RewriteFn = Box<dyn Fn(&mut WriterExt) -> Result<()>>;

/// Message-content handle of a backup.
pub enum Handle {
    /// Verbatim copy of the serialized handshake body.
    Raw(Vec<u8>),
    /// Deterministic rewriter callback.
    Rewrite(RewriteFn),
    /// ChangeCipherSpec; no payload.
    Ccs,
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handle::Raw(buf) => f.debug_tuple("Raw").field(&buf.len()).finish(),
            Handle::Rewrite(_) => f.write_str("Rewrite(..)"),
            Handle::Ccs => f.write_str("Ccs"),
        }
    }
}

/// Backup of one outgoing flight message.
#[derive(Debug)]
pub struct Backup {
    /// Handshake message type; unused for CCS.
    pub hs_type: u8,
    /// Handshake sequence number; unused for CCS.
    pub seq: u16,
    /// Epoch the message was originally sent under.
    pub epoch: EpochId,
    /// Total handshake message length.
    pub len: usize,
    pub handle: Handle,
}

impl Backup {
    /// Reproduce the serialized message body.
    ///
    /// Raw backups are served without copying; rewrite backups re-run their
    /// callback into a writer bounded by the recorded length.
    pub fn regenerate(&self) -> Result<Cow<'_, [u8]>> {
        match &self.handle {
            Handle::Raw(buf) => Ok(Cow::Borrowed(buf.as_slice())),
            Handle::Ccs => Ok(Cow::Borrowed(&[])),
            Handle::Rewrite(cb) => {
                let mut wr = WriterExt::new(Writer::new(self.len), self.len);
                cb(&mut wr)?;
                if !wr.done() {
                    return Err(Error::InvariantViolation(
                        "rewriter produced short message body",
                    ));
                }
                Ok(Cow::Owned(wr.into_inner().fragment().to_vec()))
            }
        }
    }
}

/// Convenience constructor for tests and the pipeline: a rewriter that
/// copies a fixed body.
pub fn rewrite_fixed(body: Vec<u8>) -> RewriteFn {
    Box::new(move |wr| {
        write_all(wr, &body)?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_backup(body: &[u8]) -> Backup {
        Backup {
            hs_type: 14,
            seq: 2,
            epoch: 1,
            len: body.len(),
            handle: Handle::Raw(body.to_vec()),
        }
    }

    #[test]
    fn test_raw_regenerate_borrows() {
        let b = raw_backup(&[1, 2, 3, 4]);
        let body = b.regenerate().unwrap();
        assert!(matches!(body, Cow::Borrowed(_)));
        assert_eq!(body.as_ref(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_ccs_has_no_payload() {
        let b = Backup {
            hs_type: 0,
            seq: 0,
            epoch: 2,
            len: 0,
            handle: Handle::Ccs,
        };
        assert!(b.regenerate().unwrap().is_empty());
    }

    #[test]
    fn test_rewrite_is_repeatable() {
        let body: Vec<u8> = (0..100).collect();
        let b = Backup {
            hs_type: 1,
            seq: 0,
            epoch: 0,
            len: body.len(),
            handle: Handle::Rewrite(rewrite_fixed(body.clone())),
        };
        let first = b.regenerate().unwrap().into_owned();
        let second = b.regenerate().unwrap().into_owned();
        assert_eq!(first, body);
        assert_eq!(first, second, "rewriter must be deterministic");
    }

    #[test]
    fn test_short_rewriter_rejected() {
        let b = Backup {
            hs_type: 1,
            seq: 0,
            epoch: 0,
            len: 10,
            handle: Handle::Rewrite(rewrite_fixed(vec![0; 4])),
        };
        assert!(matches!(
            b.regenerate(),
            Err(Error::InvariantViolation(_))
        ));
    }
}
