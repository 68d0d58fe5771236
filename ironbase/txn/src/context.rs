//! Per-session transaction handle and its state machine.

use ironbase_common::{DistributedId, Lsn, SessionId, TableId, TxnId, UndoPosition};
use serde::{Deserialize, Serialize};

use crate::lock::LockMode;
use crate::savepoint::SavepointStack;

/// Isolation level for transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Lifecycle state of a transaction. Transitions are forward-only; a
/// finished transaction is never resurrected, the session gets a fresh
/// context instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    NotStarted,
    Active,
    Prepared,
    Committed,
    RolledBack,
}

pub struct TransactionContext {
    /// Monotonic transaction id; 0 until the first real engine access.
    id: TxnId,
    /// Owning session. Ownership is exclusive: only the session thread
    /// mutates this context, plus occasional kill-signal delivery.
    session: SessionId,
    isolation: IsolationLevel,
    state: TxnState,

    // ---- Commit bookkeeping ----
    /// Registered with the commit coordinator for two-phase commit.
    registered_2pc: bool,
    /// Log position captured during the ordered commit phase.
    commit_lsn: Option<Lsn>,
    /// The ordered (fast) phase already ran for this transaction.
    ordered_commit_done: bool,
    /// Externally supplied identifier for distributed transactions.
    xid: Option<DistributedId>,

    // ---- Statement bookkeeping ----
    /// Undo position of the last statement boundary; statement-only
    /// rollback rewinds to here without changing the transaction state.
    stmt_boundary: UndoPosition,
    /// Rows reserved from AUTO_INCREMENT counters by the current statement.
    autoinc_rows: u32,
    savepoints: SavepointStack,

    // ---- Flags ----
    read_only: bool,
    /// The session declared locking intent (LOCK TABLES or a locking read).
    will_lock: bool,
    /// Deadlock victim: the surrounding layer must roll the whole
    /// transaction back before reusing the session.
    forced_rollback: bool,
}

impl TransactionContext {
    pub fn new(session: SessionId, isolation: IsolationLevel) -> Self {
        Self {
            id: 0,
            session,
            isolation,
            state: TxnState::NotStarted,
            registered_2pc: false,
            commit_lsn: None,
            ordered_commit_done: false,
            xid: None,
            stmt_boundary: 0,
            autoinc_rows: 0,
            savepoints: SavepointStack::new(),
            read_only: false,
            will_lock: false,
            forced_rollback: false,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn set_isolation(&mut self, isolation: IsolationLevel) {
        self.isolation = isolation;
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == TxnState::Active
    }

    /// NOT_STARTED -> ACTIVE on first read/write intent. Idempotent for a
    /// context that is already running.
    pub fn start(&mut self, id: TxnId) {
        match self.state {
            TxnState::NotStarted => {
                self.id = id;
                self.state = TxnState::Active;
            }
            TxnState::Active | TxnState::Prepared => {}
            state => {
                // A finished context must be replaced, not restarted.
                log::warn!("start() on transaction {} in state {state:?}", self.id);
            }
        }
    }

    /// ACTIVE -> PREPARED. A duplicate or out-of-state prepare is reported
    /// and ignored to tolerate repeated invocations from the caller.
    pub fn mark_prepared(&mut self) {
        if self.state == TxnState::Active {
            self.state = TxnState::Prepared;
        } else {
            log::warn!(
                "prepare on transaction {} in state {:?} ignored",
                self.id,
                self.state
            );
        }
    }

    /// {ACTIVE, PREPARED} -> COMMITTED.
    pub fn mark_committed(&mut self) {
        match self.state {
            TxnState::Active | TxnState::Prepared => self.state = TxnState::Committed,
            state => log::warn!("commit on transaction {} in state {state:?}", self.id),
        }
        self.savepoints.clear();
    }

    /// {ACTIVE, PREPARED} -> ROLLED_BACK.
    pub fn mark_rolled_back(&mut self) {
        match self.state {
            TxnState::Active | TxnState::Prepared => self.state = TxnState::RolledBack,
            state => log::warn!("rollback on transaction {} in state {state:?}", self.id),
        }
        self.forced_rollback = false;
        self.savepoints.clear();
    }

    pub fn registered_2pc(&self) -> bool {
        self.registered_2pc
    }

    /// Record 2PC registration. Registration implies the transaction was
    /// already marked ACTIVE; a violation is an internal inconsistency that
    /// is logged rather than escalated.
    pub fn register_2pc(&mut self, xid: Option<DistributedId>) {
        if !self.is_active() {
            log::warn!(
                "2pc registration of transaction {} in state {:?}",
                self.id,
                self.state
            );
        }
        self.registered_2pc = true;
        if xid.is_some() {
            self.xid = xid;
        }
    }

    pub fn deregister_2pc(&mut self) {
        self.registered_2pc = false;
    }

    pub fn xid(&self) -> Option<&DistributedId> {
        self.xid.as_ref()
    }

    pub fn commit_lsn(&self) -> Option<Lsn> {
        self.commit_lsn
    }

    pub fn set_commit_lsn(&mut self, lsn: Lsn) {
        self.commit_lsn = Some(lsn);
    }

    pub fn ordered_commit_done(&self) -> bool {
        self.ordered_commit_done
    }

    pub fn set_ordered_commit_done(&mut self) {
        self.ordered_commit_done = true;
    }

    pub fn stmt_boundary(&self) -> UndoPosition {
        self.stmt_boundary
    }

    pub fn set_stmt_boundary(&mut self, pos: UndoPosition) {
        self.stmt_boundary = pos;
    }

    pub fn autoinc_rows(&self) -> u32 {
        self.autoinc_rows
    }

    pub fn add_autoinc_rows(&mut self, rows: u32) {
        self.autoinc_rows = self.autoinc_rows.saturating_add(rows);
    }

    pub fn reset_autoinc_rows(&mut self) {
        self.autoinc_rows = 0;
    }

    pub fn savepoints(&self) -> &SavepointStack {
        &self.savepoints
    }

    pub fn savepoints_mut(&mut self) -> &mut SavepointStack {
        &mut self.savepoints
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub fn will_lock(&self) -> bool {
        self.will_lock
    }

    pub fn set_will_lock(&mut self) {
        self.will_lock = true;
    }

    pub fn forced_rollback(&self) -> bool {
        self.forced_rollback
    }

    /// Mark this transaction as a deadlock victim.
    pub fn mark_forced_rollback(&mut self) {
        self.forced_rollback = true;
    }
}

/// Per-table, per-statement execution context. One handle per open table;
/// it may outlive individual statements (HANDLER-style cursors reuse it).
pub struct StatementHandle {
    table: TableId,
    /// Lock mode the resolver selected for the current statement.
    lock_mode: LockMode,
    // ---- AUTO_INCREMENT bookkeeping ----
    last_value: u64,
    offset: u64,
    increment: u64,
}

impl StatementHandle {
    pub fn new(table: TableId) -> Self {
        Self {
            table,
            lock_mode: LockMode::None,
            last_value: 0,
            offset: 1,
            increment: 1,
        }
    }

    pub fn table(&self) -> TableId {
        self.table
    }

    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    pub fn set_lock_mode(&mut self, mode: LockMode) {
        self.lock_mode = mode;
    }

    pub fn last_value(&self) -> u64 {
        self.last_value
    }

    pub fn set_last_value(&mut self, value: u64) {
        self.last_value = value;
    }

    pub fn autoinc_params(&self) -> (u64, u64) {
        (self.offset, self.increment)
    }

    pub fn set_autoinc_params(&mut self, offset: u64, increment: u64) {
        self.offset = offset;
        self.increment = increment;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_only_transitions() {
        let mut ctx = TransactionContext::new(1, IsolationLevel::RepeatableRead);
        assert_eq!(ctx.state(), TxnState::NotStarted);

        ctx.start(42);
        assert_eq!(ctx.state(), TxnState::Active);
        assert_eq!(ctx.id(), 42);

        // Starting again is a no-op.
        ctx.start(43);
        assert_eq!(ctx.id(), 42);

        ctx.mark_prepared();
        assert_eq!(ctx.state(), TxnState::Prepared);

        ctx.mark_committed();
        assert_eq!(ctx.state(), TxnState::Committed);

        // No resurrection after commit.
        ctx.start(44);
        assert_eq!(ctx.state(), TxnState::Committed);
        ctx.mark_rolled_back();
        assert_eq!(ctx.state(), TxnState::Committed);
    }

    #[test]
    fn test_duplicate_prepare_is_ignored() {
        let mut ctx = TransactionContext::new(1, IsolationLevel::ReadCommitted);
        ctx.mark_prepared(); // not yet active
        assert_eq!(ctx.state(), TxnState::NotStarted);

        ctx.start(1);
        ctx.mark_prepared();
        ctx.mark_prepared();
        assert_eq!(ctx.state(), TxnState::Prepared);
    }

    #[test]
    fn test_autoinc_row_count_saturates() {
        let mut ctx = TransactionContext::new(1, IsolationLevel::RepeatableRead);
        ctx.add_autoinc_rows(u32::MAX - 1);
        ctx.add_autoinc_rows(10);
        assert_eq!(ctx.autoinc_rows(), u32::MAX);
    }

    #[test]
    fn test_rollback_clears_forced_flag() {
        let mut ctx = TransactionContext::new(1, IsolationLevel::RepeatableRead);
        ctx.start(1);
        ctx.mark_forced_rollback();
        assert!(ctx.forced_rollback());
        ctx.mark_rolled_back();
        assert!(!ctx.forced_rollback());
        assert_eq!(ctx.state(), TxnState::RolledBack);
    }
}
