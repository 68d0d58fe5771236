//! AUTO_INCREMENT interval reservation.
//!
//! Values for a column form the arithmetic sequence `offset + k*step`. A
//! statement reserves a contiguous block of `need` slots; the arithmetic is
//! fully checked, so an exhausted stream is reported as a tagged result
//! instead of a wrapped or sentinel value.

use ironbase_common::SessionId;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

/// Locking strategy for AUTO_INCREMENT reservation, selected by
/// configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutoincLockMode {
    /// Old style: a table-level lock held for the rest of the statement.
    Traditional,
    /// New style: multi-value statements take the statement-scoped table
    /// lock so their block stays consecutive; single-value reservations use
    /// only the counter mutex but wait while that lock is held.
    Consecutive,
    /// No locking beyond the short counter mutex.
    Interleaved,
}

/// Result of an interval computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reserved {
    /// `first` is the first value of the block; `next` is the new counter
    /// high-water mark (`first + need*step`).
    Block { first: u64, next: u64 },
    /// The sequence cannot supply `need` more values without exceeding
    /// `max_value` or the representable range.
    Exhausted,
}

/// Compute the next block of `need` values from the sequence
/// `offset + k*step`, starting at or after `current`.
///
/// Every intermediate operation is overflow-checked; any overflow, or a
/// block that does not fit under `max_value`, yields [`Reserved::Exhausted`].
pub fn next_interval(current: u64, need: u64, step: u64, offset: u64, max_value: u64) -> Reserved {
    if need == 0 || step == 0 || offset > max_value {
        return Reserved::Exhausted;
    }

    let Some(block) = need.checked_mul(step) else {
        return Reserved::Exhausted;
    };

    // Round `current` down to the nearest sequence member, then step past
    // it if that member was already consumed. The rounding itself cannot
    // overflow: the result is never above `current`.
    let first = if offset >= current {
        offset
    } else {
        let rounded = offset + (current - offset) / step * step;
        if rounded < current {
            match rounded.checked_add(step) {
                Some(first) => first,
                None => return Reserved::Exhausted,
            }
        } else {
            rounded
        }
    };

    if first > max_value {
        return Reserved::Exhausted;
    }
    match first.checked_add(block) {
        Some(next) if next <= max_value => Reserved::Block { first, next },
        _ => Reserved::Exhausted,
    }
}

struct AutoincState {
    /// Current high-water value; monotonically non-decreasing for the
    /// lifetime of the table object.
    value: u64,
    /// Session holding the statement-scoped table lock, if any.
    holder: Option<SessionId>,
}

/// Per-table AUTO_INCREMENT counter.
///
/// The counter mutex is held only for the interval computation, never
/// across the caller's row write. Under [`AutoincLockMode::Traditional`]
/// (and for consecutive-mode multi-value statements) a logical table lock
/// additionally stays with the session until the statement ends.
pub struct TableAutoinc {
    inner: Mutex<AutoincState>,
    lock_released: Condvar,
}

impl TableAutoinc {
    pub fn new(start: u64) -> Self {
        Self {
            inner: Mutex::new(AutoincState {
                value: start,
                holder: None,
            }),
            lock_released: Condvar::new(),
        }
    }

    /// Current high-water value, for observation only.
    pub fn current(&self) -> u64 {
        self.inner.lock().value
    }

    /// Force the counter to at least `value` (e.g. after an explicit
    /// insert of a larger key). Never decreases it.
    pub fn advance_to(&self, value: u64) {
        let mut state = self.inner.lock();
        state.value = state.value.max(value);
    }

    /// Reserve a block of `need` values for `session`.
    ///
    /// `multi_value` marks statements that may generate several rows, which
    /// is what takes the table lock under consecutive mode.
    pub fn reserve(
        &self,
        session: SessionId,
        need: u64,
        step: u64,
        offset: u64,
        max_value: u64,
        mode: AutoincLockMode,
        multi_value: bool,
    ) -> Reserved {
        let mut state = self.inner.lock();

        let (respect_table_lock, take_table_lock) = match mode {
            AutoincLockMode::Traditional => (true, true),
            AutoincLockMode::Consecutive => (true, multi_value),
            AutoincLockMode::Interleaved => (false, false),
        };

        if respect_table_lock {
            while state.holder.is_some_and(|holder| holder != session) {
                self.lock_released.wait(&mut state);
            }
            if take_table_lock {
                state.holder = Some(session);
            }
        }

        let reserved = next_interval(state.value, need, step, offset, max_value);
        if let Reserved::Block { next, .. } = reserved {
            debug_assert!(next >= state.value);
            state.value = next;
        }
        reserved
    }

    /// Release the statement-scoped table lock, if `session` holds it.
    /// Called at statement end.
    pub fn release(&self, session: SessionId) {
        let mut state = self.inner.lock();
        if state.holder == Some(session) {
            state.holder = None;
            self.lock_released.notify_all();
        }
    }

    /// True if `session` currently holds the statement-scoped table lock.
    pub fn held_by(&self, session: SessionId) -> bool {
        self.inner.lock().holder == Some(session)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use rand::Rng;

    use super::*;

    #[test]
    fn test_next_interval_reference_case() {
        // Sequence 2, 7, 12, 17, 22, ...: rounding 18 down gives 17 < 18,
        // so the block starts at 22 and reserves 3*5 = 15.
        assert_eq!(next_interval(18, 3, 5, 2, 100), Reserved::Block {
            first: 22,
            next: 37
        });
    }

    #[test]
    fn test_next_interval_on_sequence_member() {
        // 17 is itself a member and not yet consumed.
        assert_eq!(next_interval(17, 1, 5, 2, 100), Reserved::Block {
            first: 17,
            next: 22
        });
    }

    #[test]
    fn test_next_interval_offset_ahead_of_current() {
        assert_eq!(next_interval(3, 2, 10, 5, 100), Reserved::Block {
            first: 5,
            next: 25
        });
    }

    #[test]
    fn test_next_interval_exhaustion() {
        // Block does not fit under max_value.
        assert_eq!(next_interval(95, 2, 5, 0, 100), Reserved::Exhausted);
        // Multiplication overflow.
        assert_eq!(
            next_interval(0, u64::MAX, 2, 0, u64::MAX),
            Reserved::Exhausted
        );
        // Addition overflow.
        assert_eq!(
            next_interval(u64::MAX - 1, 1, 4, 0, u64::MAX),
            Reserved::Exhausted
        );
        // Offset beyond the column maximum.
        assert_eq!(next_interval(0, 1, 1, 200, 100), Reserved::Exhausted);
    }

    #[test]
    fn test_next_interval_is_sequence_member() {
        let mut rng = rand::rng();
        for _ in 0..1000 {
            let step = rng.random_range(1..100u64);
            let offset = rng.random_range(0..step);
            let current = rng.random_range(0..1_000_000u64);
            let need = rng.random_range(1..10u64);
            match next_interval(current, need, step, offset, u64::MAX) {
                Reserved::Block { first, next } => {
                    assert!(first >= current);
                    assert_eq!((first - offset) % step, 0);
                    assert_eq!(next, first + need * step);
                }
                Reserved::Exhausted => panic!("unexpected exhaustion"),
            }
        }
    }

    #[test]
    fn test_counter_is_monotonic() {
        let table = TableAutoinc::new(0);
        let mut last = 0;
        for _ in 0..100 {
            match table.reserve(1, 3, 2, 1, u64::MAX, AutoincLockMode::Interleaved, true) {
                Reserved::Block { first, .. } => {
                    assert!(first >= last);
                    last = first;
                }
                Reserved::Exhausted => panic!("unexpected exhaustion"),
            }
        }
        assert!(table.current() >= last);
    }

    #[test]
    fn test_concurrent_reservations_never_collide() {
        let table = Arc::new(TableAutoinc::new(0));
        let mut handles = Vec::new();
        for session in 0..8u64 {
            let table = Arc::clone(&table);
            handles.push(thread::spawn(move || {
                let mut firsts = Vec::new();
                for _ in 0..200 {
                    match table.reserve(
                        session,
                        2,
                        1,
                        0,
                        u64::MAX,
                        AutoincLockMode::Interleaved,
                        true,
                    ) {
                        Reserved::Block { first, .. } => firsts.push(first),
                        Reserved::Exhausted => panic!("unexpected exhaustion"),
                    }
                }
                firsts
            }));
        }
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 8 * 200);
    }

    #[test]
    fn test_consecutive_multi_value_takes_table_lock() {
        let table = Arc::new(TableAutoinc::new(0));
        let first = table.reserve(1, 3, 1, 0, u64::MAX, AutoincLockMode::Consecutive, true);
        assert!(matches!(first, Reserved::Block { .. }));
        assert!(table.held_by(1));

        // Another session's multi-value reservation blocks on the lock.
        let other = Arc::clone(&table);
        let waiter = thread::spawn(move || {
            other.reserve(2, 3, 1, 0, u64::MAX, AutoincLockMode::Consecutive, true)
        });
        thread::sleep(std::time::Duration::from_millis(20));
        assert!(!waiter.is_finished());

        table.release(1);
        assert!(matches!(waiter.join().unwrap(), Reserved::Block { .. }));
        assert!(table.held_by(2));
        table.release(2);
    }

    #[test]
    fn test_consecutive_single_value_leaves_lock_free() {
        let table = TableAutoinc::new(0);
        let first = table.reserve(1, 1, 1, 0, u64::MAX, AutoincLockMode::Consecutive, false);
        assert!(matches!(first, Reserved::Block { .. }));
        assert!(!table.held_by(1));
    }

    #[test]
    fn test_traditional_lock_is_statement_scoped() {
        let table = Arc::new(TableAutoinc::new(0));
        let first = table.reserve(1, 1, 1, 0, u64::MAX, AutoincLockMode::Traditional, false);
        assert!(matches!(first, Reserved::Block { .. }));
        assert!(table.held_by(1));

        // A second session blocks until the holder releases.
        let other = Arc::clone(&table);
        let waiter = thread::spawn(move || {
            other.reserve(2, 1, 1, 0, u64::MAX, AutoincLockMode::Traditional, false)
        });
        thread::sleep(std::time::Duration::from_millis(20));
        assert!(!waiter.is_finished());

        table.release(1);
        assert!(matches!(waiter.join().unwrap(), Reserved::Block { .. }));
        assert!(table.held_by(2));
        table.release(2);
    }
}
