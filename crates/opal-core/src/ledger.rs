//! Modified-object ledger.
//!
//! Ordered collection of objects pending flush within a transaction, with
//! an OID-indexed side table for O(1) identity lookup. Flushing iterates
//! forward with a cursor; objects discovered as dependencies while earlier
//! objects are being encoded may be appended without invalidating the
//! cursor. Removal mid-iteration is disallowed and fails fast via a
//! generation check. The ledger is cleared wholesale at the transaction
//! boundary.

use crate::persist::ObjRef;
use opal_common::{OpalError, Oid, Result};
use std::collections::HashMap;

/// Forward cursor over a [`ModifiedLedger`].
///
/// Stays valid across appends; invalidated by `clear()`.
#[derive(Debug, Clone, Copy)]
pub struct LedgerCursor {
    pos: usize,
    generation: u64,
}

/// Ordered + indexed collection of modified objects.
#[derive(Default)]
pub struct ModifiedLedger {
    items: Vec<ObjRef>,
    by_oid: HashMap<Oid, usize>,
    /// Bumped on clear; open cursors detect it and fail fast.
    generation: u64,
}

impl ModifiedLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an object, keyed by its OID.
    ///
    /// Returns false (without appending) if the OID is already enrolled.
    /// The object must have persistent identity.
    pub fn push(&mut self, obj: &ObjRef) -> Result<bool> {
        let oid = obj.oid();
        if oid.is_null() {
            return Err(OpalError::NoIdentity);
        }
        if self.by_oid.contains_key(&oid) {
            return Ok(false);
        }
        self.by_oid.insert(oid, self.items.len());
        self.items.push(obj.clone());
        Ok(true)
    }

    /// Returns true if an object with this OID is enrolled.
    pub fn contains(&self, oid: Oid) -> bool {
        self.by_oid.contains_key(&oid)
    }

    /// Returns the enrolled object for an OID.
    pub fn get(&self, oid: Oid) -> Option<ObjRef> {
        self.by_oid.get(&oid).map(|&i| self.items[i].clone())
    }

    /// Number of enrolled objects.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if nothing is enrolled.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Opens a forward cursor at the current head.
    pub fn cursor(&self) -> LedgerCursor {
        LedgerCursor {
            pos: 0,
            generation: self.generation,
        }
    }

    /// Advances the cursor, returning the next enrolled object.
    ///
    /// Objects appended after the cursor was opened are visited too. Fails
    /// fast if the ledger was cleared underneath the cursor.
    pub fn advance(&self, cursor: &mut LedgerCursor) -> Result<Option<ObjRef>> {
        if cursor.generation != self.generation {
            return Err(OpalError::LedgerIterationActive);
        }
        if cursor.pos >= self.items.len() {
            return Ok(None);
        }
        let obj = self.items[cursor.pos].clone();
        cursor.pos += 1;
        Ok(Some(obj))
    }

    /// Snapshot of enrolled OIDs in insertion order.
    pub fn oids(&self) -> Vec<Oid> {
        self.items.iter().map(|obj| obj.oid()).collect()
    }

    /// Empties the ledger and invalidates open cursors.
    pub fn clear(&mut self) {
        self.items.clear();
        self.by_oid.clear();
        self.generation += 1;
    }
}
