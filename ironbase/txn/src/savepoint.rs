//! Named, rewindable points within a transaction's modification history.

use ironbase_common::UndoPosition;

use crate::error::{TxnError, TxnResult};

/// A named checkpoint inside one transaction.
#[derive(Debug, Clone)]
pub struct SavepointRecord {
    name: String,
    undo_pos: UndoPosition,
}

impl SavepointRecord {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn undo_pos(&self) -> UndoPosition {
        self.undo_pos
    }
}

/// Savepoints of a single transaction, ordered by creation.
///
/// Names are caller-supplied opaque strings with no uniqueness requirement;
/// setting an existing name drops the old record (last write wins). The
/// whole stack is invalidated when the transaction commits or rolls back.
#[derive(Debug, Default)]
pub struct SavepointStack {
    records: Vec<SavepointRecord>,
}

impl SavepointStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `pos` under `name`, replacing any prior savepoint of the
    /// same name.
    pub fn set(&mut self, name: &str, pos: UndoPosition) {
        self.records.retain(|r| r.name != name);
        self.records.push(SavepointRecord {
            name: name.to_owned(),
            undo_pos: pos,
        });
    }

    /// Return the undo position recorded under `name` and drop every
    /// savepoint created after it. The named savepoint itself survives, so
    /// the caller can roll back to it again.
    pub fn rollback_to(&mut self, name: &str) -> TxnResult<UndoPosition> {
        let idx = self.find(name)?;
        let pos = self.records[idx].undo_pos;
        self.records.truncate(idx + 1);
        Ok(pos)
    }

    /// Remove the bookkeeping entry for `name` without rewinding anything.
    /// Savepoints created after it are untouched.
    pub fn release(&mut self, name: &str) -> TxnResult<()> {
        let idx = self.find(name)?;
        self.records.remove(idx);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&SavepointRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Invalidate all savepoints (transaction commit or rollback).
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Rolling back to a savepoint while row locks are still held makes it
    /// unsafe to release schema-level locks acquired after that savepoint.
    /// The caller passes the transaction's current row-lock count.
    pub fn can_release_metadata_locks_after_rollback(
        &self,
        name: &str,
        row_locks_held: usize,
    ) -> TxnResult<bool> {
        self.find(name)?;
        Ok(row_locks_held == 0)
    }

    fn find(&self, name: &str) -> TxnResult<usize> {
        self.records
            .iter()
            .position(|r| r.name == name)
            .ok_or_else(|| TxnError::NoSuchSavepoint(name.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_rollback_to() {
        let mut stack = SavepointStack::new();
        stack.set("a", 10);
        stack.set("b", 20);
        stack.set("c", 30);

        assert_eq!(stack.rollback_to("b").unwrap(), 20);
        // "c" was created after "b" and is gone; "b" survives.
        assert!(stack.get("c").is_none());
        assert_eq!(stack.rollback_to("b").unwrap(), 20);
        assert_eq!(stack.rollback_to("a").unwrap(), 10);
    }

    #[test]
    fn test_last_write_wins() {
        let mut stack = SavepointStack::new();
        stack.set("a", 10);
        stack.set("b", 20);
        stack.set("a", 30);

        assert_eq!(stack.len(), 2);
        assert_eq!(stack.rollback_to("a").unwrap(), 30);
        // Re-setting "a" moved it after "b", so "b" is older and survives
        // the rollback.
        assert!(stack.get("b").is_some());
    }

    #[test]
    fn test_release_frees_only_the_named_savepoint() {
        let mut stack = SavepointStack::new();
        stack.set("a", 10);
        stack.set("b", 20);

        stack.release("a").unwrap();
        assert!(stack.get("a").is_none());
        // "b" was created after "a" and survives the release.
        assert_eq!(stack.rollback_to("b").unwrap(), 20);
        assert!(matches!(
            stack.release("a"),
            Err(TxnError::NoSuchSavepoint(_))
        ));
    }

    #[test]
    fn test_metadata_lock_release_check() {
        let mut stack = SavepointStack::new();
        stack.set("a", 10);

        assert!(
            stack
                .can_release_metadata_locks_after_rollback("a", 0)
                .unwrap()
        );
        assert!(
            !stack
                .can_release_metadata_locks_after_rollback("a", 3)
                .unwrap()
        );
        assert!(
            stack
                .can_release_metadata_locks_after_rollback("missing", 0)
                .is_err()
        );
    }
}
