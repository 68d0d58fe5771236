//! In-memory implementation of [`StorageKernel`].
//!
//! Rows are applied in place and undone from a per-transaction undo log,
//! so savepoint and statement rollback rewind real row state. Log
//! positions are modelled as two counters: every `commit_low` appends one
//! record, and a flush advances the durable position to the written one,
//! which is how group flush collapses concurrent requests into one
//! advance.

use std::collections::{BTreeMap, HashMap};

use ironbase_common::{Lsn, TableId, TxnId, UndoPosition};
use parking_lot::{Condvar, Mutex};

use crate::context::TransactionContext;
use crate::error::{TxnError, TxnResult};
use crate::kernel::StorageKernel;

type RowKey = (TableId, u64);

enum UndoRecord {
    Insert { key: RowKey },
    Update { key: RowKey, prev: i64 },
    Delete { key: RowKey, prev: i64 },
}

#[derive(Default)]
struct TxnWorkspace {
    undo: Vec<UndoRecord>,
    row_locks: usize,
    /// Set by a kill; the next (or current) lock wait returns Interrupted.
    interrupted: bool,
    waiting: bool,
}

#[derive(Default)]
struct KernelState {
    rows: BTreeMap<RowKey, i64>,
    workspaces: HashMap<TxnId, TxnWorkspace>,
}

pub struct MemoryKernel {
    state: Mutex<KernelState>,
    wait_cancelled: Condvar,
    log: Mutex<LogPositions>,
}

#[derive(Default)]
struct LogPositions {
    written: u64,
    flushed: u64,
}

impl Default for MemoryKernel {
    fn default() -> Self {
        Self {
            state: Mutex::new(KernelState::default()),
            wait_cancelled: Condvar::new(),
            log: Mutex::new(LogPositions::default()),
        }
    }
}

impl MemoryKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `value` under `(table, key)` on behalf of `ctx`, recording the
    /// previous state in the transaction's undo log.
    pub fn write(&self, ctx: &TransactionContext, table: TableId, key: u64, value: i64) {
        let mut state = self.state.lock();
        let row_key = (table, key);
        let prev = state.rows.insert(row_key, value);
        let workspace = state.workspaces.entry(ctx.id()).or_default();
        workspace.undo.push(match prev {
            Some(prev) => UndoRecord::Update { key: row_key, prev },
            None => UndoRecord::Insert { key: row_key },
        });
    }

    /// Delete the row at `(table, key)` on behalf of `ctx`.
    pub fn delete(&self, ctx: &TransactionContext, table: TableId, key: u64) {
        let mut state = self.state.lock();
        let row_key = (table, key);
        if let Some(prev) = state.rows.remove(&row_key) {
            let workspace = state.workspaces.entry(ctx.id()).or_default();
            workspace
                .undo
                .push(UndoRecord::Delete { key: row_key, prev });
        }
    }

    /// Read the currently visible value of `(table, key)`.
    pub fn read(&self, table: TableId, key: u64) -> Option<i64> {
        self.state.lock().rows.get(&(table, key)).copied()
    }

    /// Take a row lock on behalf of `ctx`.
    pub fn acquire_row_lock(&self, ctx: &TransactionContext) {
        let mut state = self.state.lock();
        state.workspaces.entry(ctx.id()).or_default().row_locks += 1;
    }

    /// Block until the wait for `txn` is cancelled from another thread.
    /// Stands in for a contended row-lock wait; returns `Interrupted` when
    /// a kill cancels the wait primitive.
    pub fn wait_for_row_lock(&self, txn: TxnId) -> TxnResult<()> {
        let mut state = self.state.lock();
        state.workspaces.entry(txn).or_default().waiting = true;
        loop {
            let workspace = state.workspaces.entry(txn).or_default();
            if workspace.interrupted {
                workspace.interrupted = false;
                workspace.waiting = false;
                return Err(TxnError::Interrupted);
            }
            self.wait_cancelled.wait(&mut state);
        }
    }

    /// Append an empty log record, advancing the written position. Lets
    /// embedders and tests model log traffic that does not come from a
    /// transaction commit.
    pub fn append_log_record(&self) -> Lsn {
        let mut log = self.log.lock();
        log.written += 1;
        Lsn::new(log.written)
    }

    fn rewind(state: &mut KernelState, txn: TxnId, target: UndoPosition) {
        let Some(workspace) = state.workspaces.get_mut(&txn) else {
            return;
        };
        let mut tail = Vec::new();
        while workspace.undo.len() as u64 > target {
            if let Some(record) = workspace.undo.pop() {
                tail.push(record);
            }
        }
        for record in tail {
            match record {
                UndoRecord::Insert { key } => {
                    state.rows.remove(&key);
                }
                UndoRecord::Update { key, prev } | UndoRecord::Delete { key, prev } => {
                    state.rows.insert(key, prev);
                }
            }
        }
    }
}

impl StorageKernel for MemoryKernel {
    fn begin(&self, ctx: &TransactionContext) -> TxnResult<()> {
        let mut state = self.state.lock();
        state.workspaces.insert(ctx.id(), TxnWorkspace::default());
        Ok(())
    }

    fn commit_low(&self, ctx: &TransactionContext) -> TxnResult<()> {
        let mut state = self.state.lock();
        // Rows were applied in place; committing discards the undo log and
        // releases the transaction's locks.
        state.workspaces.remove(&ctx.id());
        drop(state);
        self.append_log_record();
        Ok(())
    }

    fn rollback(&self, ctx: &TransactionContext) -> TxnResult<()> {
        let mut state = self.state.lock();
        Self::rewind(&mut state, ctx.id(), 0);
        state.workspaces.remove(&ctx.id());
        Ok(())
    }

    fn rollback_to_undo_position(
        &self,
        ctx: &TransactionContext,
        pos: UndoPosition,
    ) -> TxnResult<()> {
        let mut state = self.state.lock();
        Self::rewind(&mut state, ctx.id(), pos);
        Ok(())
    }

    fn assign_read_view(&self, _ctx: &TransactionContext) {
        // Point-in-time views belong to the MVCC kernel; the in-memory
        // kernel always reads the latest state.
    }

    fn undo_position(&self, ctx: &TransactionContext) -> UndoPosition {
        self.state
            .lock()
            .workspaces
            .get(&ctx.id())
            .map(|w| w.undo.len() as u64)
            .unwrap_or(0)
    }

    fn row_lock_count(&self, ctx: &TransactionContext) -> usize {
        self.state
            .lock()
            .workspaces
            .get(&ctx.id())
            .map(|w| w.row_locks)
            .unwrap_or(0)
    }

    fn release_row_lock(&self, ctx: &TransactionContext) {
        let mut state = self.state.lock();
        if let Some(workspace) = state.workspaces.get_mut(&ctx.id()) {
            workspace.row_locks = workspace.row_locks.saturating_sub(1);
        }
    }

    fn cancel_lock_wait(&self, txn: TxnId) {
        let mut state = self.state.lock();
        // Latch the interrupt even if the victim has not parked yet; the
        // flag is consumed by its next (or current) wait.
        state.workspaces.entry(txn).or_default().interrupted = true;
        self.wait_cancelled.notify_all();
    }

    fn current_log_position(&self) -> Lsn {
        Lsn::new(self.log.lock().written)
    }

    fn flushed_log_position(&self) -> Lsn {
        Lsn::new(self.log.lock().flushed)
    }

    fn request_log_flush(&self, _sync: bool) -> Lsn {
        let mut log = self.log.lock();
        // One advance covers every record written so far: transactions
        // whose records are already in the log piggy-back on this flush.
        log.flushed = log.written;
        Lsn::new(log.flushed)
    }
}
