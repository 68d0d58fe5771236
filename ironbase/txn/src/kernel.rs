//! The narrow interface to the storage kernel.
//!
//! The B-tree/MVCC kernel (row storage, page I/O, undo/redo internals) is
//! an external collaborator. The coordination layer only needs the
//! operations below; [`crate::memory::MemoryKernel`] implements them in
//! memory for tests and embedders.

use ironbase_common::{Lsn, TxnId, UndoPosition};

use crate::context::TransactionContext;
use crate::error::TxnResult;

pub trait StorageKernel: Send + Sync {
    /// Make the kernel aware of a newly started transaction.
    fn begin(&self, ctx: &TransactionContext) -> TxnResult<()>;

    /// Apply the transaction's committed state. The caller has already
    /// decided durability; flushing the log is a separate step.
    fn commit_low(&self, ctx: &TransactionContext) -> TxnResult<()>;

    /// Roll back the whole transaction. Deadlock or lock-wait-timeout
    /// detected on this path is surfaced as the corresponding error.
    fn rollback(&self, ctx: &TransactionContext) -> TxnResult<()>;

    /// Rewind the transaction's modifications to `pos`.
    fn rollback_to_undo_position(&self, ctx: &TransactionContext, pos: UndoPosition)
    -> TxnResult<()>;

    /// Assign a consistent read view for the transaction.
    fn assign_read_view(&self, ctx: &TransactionContext);

    /// Current position in the transaction's undo log.
    fn undo_position(&self, ctx: &TransactionContext) -> UndoPosition;

    /// Number of row locks the transaction currently holds.
    fn row_lock_count(&self, ctx: &TransactionContext) -> usize;

    /// Retract the most recently acquired row lock (semi-consistent read
    /// decided it was unnecessary).
    fn release_row_lock(&self, ctx: &TransactionContext);

    /// Cancel the specific lock wait `txn` is blocked on, if any. Keyed by
    /// id so a kill can be delivered without the victim's context lock.
    fn cancel_lock_wait(&self, txn: TxnId);

    /// Position of the last log record written (not necessarily durable).
    fn current_log_position(&self) -> Lsn;

    /// Position up to which the log is known durable.
    fn flushed_log_position(&self) -> Lsn;

    /// Flush the log. `sync` waits for the flush to reach stable storage;
    /// concurrent callers are grouped into one physical flush. Returns the
    /// new flushed position.
    fn request_log_flush(&self, sync: bool) -> Lsn;
}
