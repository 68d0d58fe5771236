//! Transaction lifecycle and commit coordination for the ironbase engine.
//!
//! This crate turns statement/transaction boundaries into engine-level
//! state transitions, resolves the row-lock mode a statement needs, drives
//! the two-phase (ordered/durable) commit protocol that keeps engine
//! commit order consistent with the external replication log, manages
//! savepoints, tracks durability checkpoints, and allocates collision-free
//! AUTO_INCREMENT intervals. The storage kernel itself sits behind the
//! [`kernel::StorageKernel`] trait.

pub mod autoinc;
pub mod checkpoint;
pub mod commit;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod kernel;
pub mod lock;
pub mod memory;
pub mod savepoint;

// Re-export commonly used types
pub use autoinc::{AutoincLockMode, Reserved, TableAutoinc, next_interval};
pub use checkpoint::{CheckpointNotifier, CheckpointSink, CheckpointToken};
pub use commit::{CommitCoordinator, CommitThrottle, SharedCoordinatorState, TxnHandle};
pub use config::TxnConfig;
pub use context::{IsolationLevel, StatementHandle, TransactionContext, TxnState};
pub use engine::{Session, TxnEngine};
pub use error::{TxnError, TxnResult};
pub use kernel::StorageKernel;
pub use lock::{ExplicitLock, LockMode, LockModeResolver, StatementKind};
pub use memory::MemoryKernel;
pub use savepoint::{SavepointRecord, SavepointStack};
