//! Row-lock mode selection for statements.
//!
//! The resolver maps (statement kind, isolation level, explicit lock
//! request, session lock state) to the row-lock mode the statement's reads
//! should take. The mapping is a small decision table over statement
//! classes followed by a short ordered rule list.

use serde::{Deserialize, Serialize};

use crate::context::IsolationLevel;

/// Row-lock mode chosen for a statement's reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    /// Non-locking consistent read.
    None,
    Shared,
    Exclusive,
}

/// An explicit lock clause supplied with the statement, if any
/// (`... LOCK IN SHARE MODE` / `... FOR UPDATE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExplicitLock {
    None,
    Share,
    Exclusive,
}

/// Kind of SQL statement being executed against the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Replace,
    /// CREATE TABLE with rows written as part of the statement.
    CreateTableWrite,
    /// INSERT INTO t SELECT ... (the read side).
    InsertSelect,
    /// REPLACE INTO t SELECT ... (the read side).
    ReplaceSelect,
    /// UPDATE t SET c = (SELECT ...) (the subquery read).
    UpdateSubquery,
    /// CREATE TABLE ... SELECT ... (the read side).
    CreateTableSelect,
}

/// How a statement's table access participates in locking decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatementClass {
    /// Modifies rows; always takes exclusive row locks.
    Write,
    /// A read feeding a write in the same statement; takes a shared
    /// locking read unless the engine configuration relaxes it.
    FeedingRead,
    /// A plain read.
    PlainRead,
}

/// Decision table keyed by statement kind.
const STATEMENT_CLASSES: [(StatementKind, StatementClass); 10] = [
    (StatementKind::Select, StatementClass::PlainRead),
    (StatementKind::Insert, StatementClass::Write),
    (StatementKind::Update, StatementClass::Write),
    (StatementKind::Delete, StatementClass::Write),
    (StatementKind::Replace, StatementClass::Write),
    (StatementKind::CreateTableWrite, StatementClass::Write),
    (StatementKind::InsertSelect, StatementClass::FeedingRead),
    (StatementKind::ReplaceSelect, StatementClass::FeedingRead),
    (StatementKind::UpdateSubquery, StatementClass::FeedingRead),
    (StatementKind::CreateTableSelect, StatementClass::FeedingRead),
];

fn class_of(kind: StatementKind) -> StatementClass {
    STATEMENT_CLASSES
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, class)| *class)
        .unwrap_or(StatementClass::PlainRead)
}

/// Maps a statement to the row-lock mode its reads should take.
#[derive(Debug, Clone, Copy)]
pub struct LockModeResolver {
    /// Engine-wide flag: serializability across binlog replay is not
    /// required, so reads feeding writes may skip locking.
    relaxed_locking: bool,
}

impl LockModeResolver {
    pub fn new(relaxed_locking: bool) -> Self {
        Self { relaxed_locking }
    }

    /// Rules, evaluated in order:
    ///
    /// 1. Explicit write intent, or an explicit lock clause, wins.
    /// 2. A plain read under SERIALIZABLE outside autocommit, or inside a
    ///    LOCK TABLES session, becomes a shared locking read.
    /// 3. A read feeding a write skips locking when isolation is at or
    ///    below READ COMMITTED or relaxed locking is configured.
    /// 4. Everything else is a non-locking consistent read.
    pub fn resolve(
        &self,
        kind: StatementKind,
        isolation: IsolationLevel,
        explicit: ExplicitLock,
        in_lock_tables: bool,
        autocommit: bool,
    ) -> LockMode {
        match class_of(kind) {
            StatementClass::Write => LockMode::Exclusive,
            _ if explicit == ExplicitLock::Exclusive => LockMode::Exclusive,
            _ if explicit == ExplicitLock::Share => LockMode::Shared,
            StatementClass::PlainRead => {
                if (isolation == IsolationLevel::Serializable && !autocommit) || in_lock_tables {
                    // Equivalent to SELECT ... LOCK IN SHARE MODE.
                    LockMode::Shared
                } else {
                    LockMode::None
                }
            }
            StatementClass::FeedingRead => {
                if isolation <= IsolationLevel::ReadCommitted || self.relaxed_locking {
                    LockMode::None
                } else {
                    LockMode::Shared
                }
            }
        }
    }
}
