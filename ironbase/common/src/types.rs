use std::fmt;

use serde::{Deserialize, Serialize};

/// Internal identifier associated with a transaction (engine-wide unique).
///
/// `0` is reserved for "not yet started": a session's context carries id 0
/// until its first real engine access assigns one.
pub type TxnId = u64;

/// Internal identifier associated with a client session (engine-wide unique).
pub type SessionId = u64;

/// Internal identifier associated with a table (engine-wide unique).
pub type TableId = u64;

/// A position in a transaction's undo log, used as a rewind target for
/// savepoints and statement boundaries. Positions are only comparable within
/// the transaction that produced them.
pub type UndoPosition = u64;

/// A monotonically increasing marker of progress through the write-ahead log.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Lsn(u64);

impl Lsn {
    /// Create an LSN from a raw log offset.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value of the LSN.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Externally supplied identifier of a distributed (two-phase) transaction.
///
/// The coordinator treats it as an opaque byte string; equality is the only
/// operation it relies on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DistributedId(Vec<u8>);

impl DistributedId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for DistributedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<&str> for DistributedId {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}
