use ironbase_common::{DistributedId, TableId};
use thiserror::Error;

pub type TxnResult<T> = Result<T, TxnError>;

#[derive(Error, Debug)]
pub enum TxnError {
    #[error("lock wait timeout exceeded")]
    LockWaitTimeout,
    #[error("deadlock found when trying to get lock")]
    Deadlock,
    #[error("query interrupted")]
    Interrupted,
    #[error("savepoint {0} does not exist")]
    NoSuchSavepoint(String),
    #[error("cannot modify data in a read-only transaction")]
    ReadOnlyViolation,
    #[error("table is in read-only mode")]
    TableReadOnly,
    #[error("unknown distributed transaction id {0}")]
    DistributedIdNotFound(DistributedId),
    #[error("auto-increment values exhausted for table {0}")]
    AutoincExhausted(TableId),
    #[error("invalid transaction state: {0}")]
    InvalidState(String),
    #[error("session {0} not found")]
    SessionNotFound(u64),
}
