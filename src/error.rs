use thiserror::Error;

/// Errors surfaced at the store API boundary.
///
/// Input errors never mutate state; `OutOfMemory` and `Timeout` are
/// retryable; I/O trouble degrades the spooler instead of aborting.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sector pool exhausted")]
    OutOfMemory,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("invalid chain entry")]
    InvalidEntry,
    #[error("timed out (clock not established or deadline exceeded)")]
    Timeout,
    #[error("no data available")]
    NoData,
    #[error("store is draining")]
    Unavailable,
    #[error("init failed: {0}")]
    Init(String),
    #[error("corrupt data: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
