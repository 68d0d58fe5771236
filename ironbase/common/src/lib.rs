//! Shared identifier types for the ironbase storage engine.

pub mod types;

pub use types::{DistributedId, Lsn, SessionId, TableId, TxnId, UndoPosition};
