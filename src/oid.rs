use std::fmt;

use serde_derive::{Deserialize, Serialize};

/// Opaque, process-independent identifier of a persistent object.
///
/// Assigned at first commit; an unpersisted object has no `Oid` at all
/// (modelled as `Option<Oid>`, never as a reserved sentinel value).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Oid(u64);

impl Oid {
    pub(crate) fn new(value: u64) -> Self {
        Oid(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Per-object version counter, bumped on every successful commit that
/// modifies the object. The pair `(oid, serial)` uniquely identifies a
/// version of an object.
pub type Serial = u64;

/// File-level transaction identifier, equal to commit-lock acquisition
/// order.
pub type TxId = u64;
