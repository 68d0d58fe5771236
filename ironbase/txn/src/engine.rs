//! The facade exposed to the SQL execution layer.
//!
//! A `TxnEngine` owns the shared coordination state (commit ordering,
//! throttling, checkpoint queue, per-table AUTO_INCREMENT counters) and
//! hands out `Session`s. Each session carries exactly one live
//! transaction context; the context is created lazily on the session's
//! first engine access and replaced wholesale once finished.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use ironbase_common::{DistributedId, Lsn, SessionId, TableId};
use parking_lot::Mutex;

use crate::autoinc::{Reserved, TableAutoinc};
use crate::checkpoint::{CheckpointNotifier, CheckpointSink, CheckpointToken};
use crate::commit::{CommitCoordinator, SharedCoordinatorState, TxnHandle};
use crate::config::TxnConfig;
use crate::context::{IsolationLevel, StatementHandle, TransactionContext, TxnState};
use crate::error::{TxnError, TxnResult};
use crate::kernel::StorageKernel;
use crate::lock::{ExplicitLock, LockMode, LockModeResolver, StatementKind};

/// Per-connection state. All fields mutated outside the context lock are
/// atomics so a kill can be delivered without taking that lock.
pub struct Session {
    id: SessionId,
    handle: Arc<TxnHandle>,
    /// Id of the session's current transaction, cached for kill delivery.
    current_txn: AtomicU64,
    killed: AtomicBool,
    autocommit: AtomicBool,
    in_lock_tables: AtomicBool,
    isolation: Mutex<IsolationLevel>,
    autoinc_offset: AtomicU64,
    autoinc_increment: AtomicU64,
    /// Tables whose statement-scoped AUTO_INCREMENT lock this session holds.
    held_autoinc: Mutex<Vec<TableId>>,
}

impl Session {
    fn new(id: SessionId, isolation: IsolationLevel) -> Self {
        Self {
            id,
            handle: Arc::new(Mutex::new(TransactionContext::new(id, isolation))),
            current_txn: AtomicU64::new(0),
            killed: AtomicBool::new(false),
            autocommit: AtomicBool::new(true),
            in_lock_tables: AtomicBool::new(false),
            isolation: Mutex::new(isolation),
            autoinc_offset: AtomicU64::new(1),
            autoinc_increment: AtomicU64::new(1),
            held_autoinc: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }
}

pub struct TxnEngine {
    kernel: Arc<dyn StorageKernel>,
    config: TxnConfig,
    shared: Arc<SharedCoordinatorState>,
    coordinator: CommitCoordinator,
    notifier: CheckpointNotifier,
    resolver: LockModeResolver,
    autoinc: DashMap<TableId, Arc<TableAutoinc>>,
    /// Tables whose data is currently immutable (e.g. mid-import).
    read_only_tables: DashMap<TableId, ()>,
    sessions: DashMap<SessionId, Arc<Session>>,
    next_txn_id: AtomicU64,
    next_session_id: AtomicU64,
}

impl TxnEngine {
    pub fn new(
        kernel: Arc<dyn StorageKernel>,
        config: TxnConfig,
        sink: Arc<dyn CheckpointSink>,
    ) -> Self {
        let shared = Arc::new(SharedCoordinatorState::new(config.commit_concurrency));
        let coordinator = CommitCoordinator::new(Arc::clone(&kernel), Arc::clone(&shared));
        let notifier = CheckpointNotifier::new(Arc::clone(&kernel), sink);
        let resolver = LockModeResolver::new(config.relaxed_locking);
        Self {
            kernel,
            config,
            shared,
            coordinator,
            notifier,
            resolver,
            autoinc: DashMap::new(),
            read_only_tables: DashMap::new(),
            sessions: DashMap::new(),
            next_txn_id: AtomicU64::new(1),
            next_session_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &TxnConfig {
        &self.config
    }

    pub fn shared(&self) -> &SharedCoordinatorState {
        &self.shared
    }

    // ---- Session lifecycle ----

    pub fn create_session(&self) -> SessionId {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(id, self.config.default_isolation));
        self.sessions.insert(id, session);
        id
    }

    /// Tear down a connection. An ACTIVE transaction is rolled back; a
    /// PREPARED one is detached and stays in the coordinator registry for
    /// later `recover`/`commit_by_id`.
    pub fn close_connection(&self, session_id: SessionId) -> TxnResult<()> {
        let (_, session) = self
            .sessions
            .remove(&session_id)
            .ok_or(TxnError::SessionNotFound(session_id))?;
        self.release_autoinc_locks(&session);
        let mut ctx = session.handle.lock();
        match ctx.state() {
            TxnState::Active => self.coordinator.rollback(&mut ctx),
            TxnState::Prepared => Ok(()),
            _ => {
                self.coordinator.deregister(ctx.id());
                Ok(())
            }
        }
    }

    /// Cancel the row-lock wait `session_id`'s transaction is blocked on,
    /// if any. Delivered through the wait primitive itself; nothing is
    /// thrown across call frames, and commit-admission waits are not
    /// affected.
    pub fn kill(&self, session_id: SessionId) -> TxnResult<()> {
        let session = self.session(session_id)?;
        session.killed.store(true, Ordering::Release);
        let txn = session.current_txn.load(Ordering::Acquire);
        if txn != 0 {
            self.kernel.cancel_lock_wait(txn);
        }
        Ok(())
    }

    // ---- Session settings ----

    pub fn set_isolation(&self, session_id: SessionId, isolation: IsolationLevel) -> TxnResult<()> {
        let session = self.session(session_id)?;
        *session.isolation.lock() = isolation;
        let mut ctx = session.handle.lock();
        if ctx.state() == TxnState::NotStarted {
            ctx.set_isolation(isolation);
        }
        Ok(())
    }

    pub fn set_autocommit(&self, session_id: SessionId, autocommit: bool) -> TxnResult<()> {
        self.session(session_id)?
            .autocommit
            .store(autocommit, Ordering::Release);
        Ok(())
    }

    pub fn set_in_lock_tables(&self, session_id: SessionId, in_lock_tables: bool) -> TxnResult<()> {
        self.session(session_id)?
            .in_lock_tables
            .store(in_lock_tables, Ordering::Release);
        Ok(())
    }

    pub fn set_autoinc_params(
        &self,
        session_id: SessionId,
        offset: u64,
        increment: u64,
    ) -> TxnResult<()> {
        let session = self.session(session_id)?;
        session.autoinc_offset.store(offset, Ordering::Release);
        session
            .autoinc_increment
            .store(increment, Ordering::Release);
        Ok(())
    }

    pub fn set_read_only(&self, session_id: SessionId, read_only: bool) -> TxnResult<()> {
        let session = self.session(session_id)?;
        session.handle.lock().set_read_only(read_only);
        Ok(())
    }

    /// Mark `table` immutable or writable again.
    pub fn set_table_read_only(&self, table: TableId, read_only: bool) {
        if read_only {
            self.read_only_tables.insert(table, ());
        } else {
            self.read_only_tables.remove(&table);
        }
    }

    // ---- Statement lifecycle ----

    /// Begin a statement against `table`, lazily starting (and registering
    /// for 2PC) the session's transaction.
    pub fn start_statement(
        &self,
        session_id: SessionId,
        table: TableId,
    ) -> TxnResult<StatementHandle> {
        let session = self.session(session_id)?;
        self.ensure_active(&session)?;
        let mut stmt = StatementHandle::new(table);
        stmt.set_autoinc_params(
            session.autoinc_offset.load(Ordering::Acquire),
            session.autoinc_increment.load(Ordering::Acquire),
        );
        Ok(stmt)
    }

    /// The session's transaction handle, for passing into kernel row
    /// operations by the execution layer.
    pub fn context(&self, session_id: SessionId) -> TxnResult<Arc<TxnHandle>> {
        Ok(Arc::clone(&self.session(session_id)?.handle))
    }

    /// Resolve the row-lock mode for a statement and remember it on the
    /// statement handle for later semi-consistent-read unlocks.
    pub fn resolve_lock_mode(
        &self,
        session_id: SessionId,
        stmt: &mut StatementHandle,
        kind: StatementKind,
        explicit: ExplicitLock,
    ) -> TxnResult<LockMode> {
        let session = self.session(session_id)?;
        let mut ctx = session.handle.lock();
        let mode = self.resolver.resolve(
            kind,
            ctx.isolation(),
            explicit,
            session.in_lock_tables.load(Ordering::Acquire),
            session.autocommit.load(Ordering::Acquire),
        );
        if mode == LockMode::Exclusive {
            if ctx.read_only() {
                return Err(TxnError::ReadOnlyViolation);
            }
            if self.read_only_tables.contains_key(&stmt.table()) {
                return Err(TxnError::TableReadOnly);
            }
        }
        stmt.set_lock_mode(mode);
        if mode != LockMode::None {
            ctx.set_will_lock();
        }
        Ok(mode)
    }

    /// Retract a row lock that a semi-consistent read showed unnecessary.
    /// Only meaningful when the statement actually took locks.
    pub fn unlock_row(&self, session_id: SessionId, stmt: &StatementHandle) -> TxnResult<()> {
        if stmt.lock_mode() == LockMode::None {
            return Ok(());
        }
        let session = self.session(session_id)?;
        let ctx = session.handle.lock();
        self.kernel.release_row_lock(&ctx);
        Ok(())
    }

    // ---- Commit / rollback ----

    /// Commit either the whole transaction or, inside an open
    /// multi-statement transaction, just the statement: the latter records
    /// the statement-undo boundary and releases statement-scoped
    /// AUTO_INCREMENT locks without running either commit phase.
    pub fn commit(&self, session_id: SessionId, whole: bool) -> TxnResult<()> {
        let session = self.session(session_id)?;
        if whole {
            let flushed = {
                let mut ctx = session.handle.lock();
                self.coordinator.commit(&mut ctx)?
            };
            session.current_txn.store(0, Ordering::Release);
            self.release_autoinc_locks(&session);
            if let Some(flushed) = flushed {
                self.notifier.on_log_flushed(flushed);
            }
        } else {
            let mut ctx = session.handle.lock();
            if ctx.is_active() {
                let boundary = self.kernel.undo_position(&ctx);
                ctx.set_stmt_boundary(boundary);
            }
            ctx.reset_autoinc_rows();
            drop(ctx);
            self.release_autoinc_locks(&session);
        }
        Ok(())
    }

    /// Roll back the whole transaction, or only to the last statement
    /// boundary.
    pub fn rollback(&self, session_id: SessionId, whole: bool) -> TxnResult<()> {
        let session = self.session(session_id)?;
        let result = {
            let mut ctx = session.handle.lock();
            if whole {
                let result = self.coordinator.rollback(&mut ctx);
                session.current_txn.store(0, Ordering::Release);
                result
            } else {
                self.coordinator.rollback_statement(&ctx)
            }
        };
        if whole {
            self.release_autoinc_locks(&session);
        }
        result
    }

    /// Apply the configured lock-wait-timeout policy: roll back either the
    /// statement or the whole transaction, then surface the timeout.
    pub fn handle_lock_wait_timeout(&self, session_id: SessionId) -> TxnResult<()> {
        self.rollback(session_id, self.config.rollback_on_timeout)?;
        Err(TxnError::LockWaitTimeout)
    }

    /// Mark the session's transaction a deadlock victim, roll it back, and
    /// surface the deadlock. The forced-rollback mark keeps the statement
    /// layer from continuing to use the transaction.
    pub fn handle_deadlock(&self, session_id: SessionId) -> TxnResult<()> {
        let session = self.session(session_id)?;
        session.handle.lock().mark_forced_rollback();
        self.rollback(session_id, true)?;
        Err(TxnError::Deadlock)
    }

    // ---- Two-phase commit ----

    /// First phase of an external two-phase commit. With `whole` false
    /// (a statement boundary under autocommit off), only the statement
    /// bookkeeping is updated.
    pub fn prepare(
        &self,
        session_id: SessionId,
        whole: bool,
        xid: Option<DistributedId>,
    ) -> TxnResult<()> {
        let session = self.session(session_id)?;
        if whole {
            let mut ctx = session.handle.lock();
            self.coordinator.prepare(&mut ctx, xid);
        } else {
            self.commit(session_id, false)?;
        }
        Ok(())
    }

    /// Distributed transactions left PREPARED, e.g. after a restart.
    pub fn recover(&self) -> Vec<DistributedId> {
        self.coordinator.recover()
    }

    pub fn commit_by_id(&self, xid: &DistributedId) -> TxnResult<()> {
        if let Some(flushed) = self.coordinator.commit_by_id(xid)? {
            self.notifier.on_log_flushed(flushed);
        }
        Ok(())
    }

    pub fn rollback_by_id(&self, xid: &DistributedId) -> TxnResult<()> {
        self.coordinator.rollback_by_id(xid)
    }

    // ---- Savepoints ----

    pub fn savepoint_set(&self, session_id: SessionId, name: &str) -> TxnResult<()> {
        let session = self.session(session_id)?;
        self.ensure_active(&session)?;
        let mut ctx = session.handle.lock();
        let pos = self.kernel.undo_position(&ctx);
        ctx.savepoints_mut().set(name, pos);
        Ok(())
    }

    pub fn savepoint_rollback(&self, session_id: SessionId, name: &str) -> TxnResult<()> {
        let session = self.session(session_id)?;
        let mut ctx = session.handle.lock();
        let pos = ctx.savepoints_mut().rollback_to(name)?;
        self.kernel.rollback_to_undo_position(&ctx, pos)
    }

    pub fn savepoint_release(&self, session_id: SessionId, name: &str) -> TxnResult<()> {
        let session = self.session(session_id)?;
        let mut ctx = session.handle.lock();
        ctx.savepoints_mut().release(name)
    }

    /// Whether schema-level locks acquired after the savepoint may be
    /// released once the transaction has rolled back to it.
    pub fn can_release_metadata_locks_after_rollback(
        &self,
        session_id: SessionId,
        name: &str,
    ) -> TxnResult<bool> {
        let session = self.session(session_id)?;
        let ctx = session.handle.lock();
        let row_locks = self.kernel.row_lock_count(&ctx);
        ctx.savepoints()
            .can_release_metadata_locks_after_rollback(name, row_locks)
    }

    // ---- AUTO_INCREMENT ----

    /// Reserve `need` AUTO_INCREMENT values for the statement. Returns the
    /// first value and the number of values reserved.
    pub fn reserve_autoincrement(
        &self,
        session_id: SessionId,
        stmt: &mut StatementHandle,
        need: u64,
    ) -> TxnResult<(u64, u64)> {
        let session = self.session(session_id)?;
        self.ensure_active(&session)?;

        let table = Arc::clone(
            &self
                .autoinc
                .entry(stmt.table())
                .or_insert_with(|| Arc::new(TableAutoinc::new(0))),
        );
        let (offset, increment) = stmt.autoinc_params();
        let reserved = table.reserve(
            session.id,
            need,
            increment,
            offset,
            u64::MAX,
            self.config.autoinc_lock_mode,
            need > 1,
        );
        match reserved {
            Reserved::Block { first, .. } => {
                stmt.set_last_value(first);
                if table.held_by(session.id) {
                    let mut held = session.held_autoinc.lock();
                    if !held.contains(&stmt.table()) {
                        held.push(stmt.table());
                    }
                }
                let mut ctx = session.handle.lock();
                ctx.add_autoinc_rows(need.min(u32::MAX as u64) as u32);
                Ok((first, need))
            }
            Reserved::Exhausted => Err(TxnError::AutoincExhausted(stmt.table())),
        }
    }

    /// Current AUTO_INCREMENT high-water mark of `table`, for observation.
    pub fn autoinc_current(&self, table: TableId) -> u64 {
        self.autoinc
            .get(&table)
            .map(|entry| entry.current())
            .unwrap_or(0)
    }

    // ---- Durability checkpoints ----

    /// Ask for `token` to be notified once everything committed so far is
    /// durable.
    pub fn request_commit_checkpoint(&self, token: CheckpointToken) {
        self.notifier.request_checkpoint(token);
    }

    /// Relay from the log subsystem: the flushed position advanced.
    pub fn on_log_flushed(&self, flushed: Lsn) {
        self.notifier.on_log_flushed(flushed);
    }

    // ---- Internals ----

    fn session(&self, session_id: SessionId) -> TxnResult<Arc<Session>> {
        self.sessions
            .get(&session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(TxnError::SessionNotFound(session_id))
    }

    /// Lazily create/start the session's transaction on first engine
    /// access. A finished context is replaced with a fresh one rather than
    /// resurrected.
    fn ensure_active(&self, session: &Arc<Session>) -> TxnResult<()> {
        let mut ctx = session.handle.lock();
        if ctx.forced_rollback() {
            // Deadlock victim: nothing may run until the rollback happens.
            return Err(TxnError::InvalidState(
                "transaction was chosen as a deadlock victim and must be rolled back".to_owned(),
            ));
        }
        match ctx.state() {
            TxnState::Active | TxnState::Prepared => return Ok(()),
            TxnState::Committed | TxnState::RolledBack => {
                *ctx = TransactionContext::new(session.id, *session.isolation.lock());
                session.killed.store(false, Ordering::Release);
            }
            TxnState::NotStarted => {}
        }
        let id = self.next_txn_id.fetch_add(1, Ordering::Relaxed);
        ctx.start(id);
        session.current_txn.store(id, Ordering::Release);
        self.kernel.begin(&ctx)?;
        if ctx.isolation() >= IsolationLevel::RepeatableRead {
            self.kernel.assign_read_view(&ctx);
        }
        self.coordinator.register(&session.handle, &mut ctx);
        Ok(())
    }

    fn release_autoinc_locks(&self, session: &Arc<Session>) {
        let held: Vec<TableId> = std::mem::take(&mut *session.held_autoinc.lock());
        for table in held {
            if let Some(entry) = self.autoinc.get(&table) {
                entry.release(session.id);
            }
        }
    }
}
