//! Engine error types.
//!
//! Every contract method returns [`Result`]; backend failures are kept as
//! the `#[source]` of a [`StoreError`] so callers can inspect the
//! underlying fjall or redb error.

use std::fmt;
use std::path::PathBuf;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Contract operation that failed, carried in [`Error::Transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Push,
    Pop,
    Len,
    Del,
    Queues,
    Close,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Push => "push",
            Self::Pop => "pop",
            Self::Len => "len",
            Self::Del => "del",
            Self::Queues => "queues",
            Self::Close => "close",
        };
        f.write_str(name)
    }
}

/// Engine errors surfaced to callers.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The queue identifier could not be allocated or persisted.
    #[error("failed to register queue '{queue}'")]
    Allocation {
        queue: String,
        #[source]
        source: StoreError,
    },

    /// A backend transaction failed; nothing was committed.
    #[error("{op} on queue '{queue}' failed")]
    Transaction {
        op: Op,
        queue: String,
        #[source]
        source: StoreError,
    },

    /// An engine-wide operation (listing, shutdown) failed.
    #[error("{op} failed")]
    Store {
        op: Op,
        #[source]
        source: StoreError,
    },

    /// Caller supplied an argument the contract rejects.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The store could not be opened or warmed up.
    #[error("failed to open store at {}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: StoreError,
    },

    /// The engine was closed before this call.
    #[error("engine is closed")]
    Closed,
}

impl Error {
    /// Create a transaction error for `op` on the named queue.
    pub fn transaction(op: Op, queue: &[u8], source: impl Into<StoreError>) -> Self {
        Self::Transaction {
            op,
            queue: display_name(queue),
            source: source.into(),
        }
    }

    /// Create an allocation error for the named queue.
    pub fn allocation(queue: &[u8], source: impl Into<StoreError>) -> Self {
        Self::Allocation {
            queue: display_name(queue),
            source: source.into(),
        }
    }

    /// Create an open error for the store at `path`.
    pub fn open(path: impl Into<PathBuf>, source: impl Into<StoreError>) -> Self {
        Self::Open {
            path: path.into(),
            source: source.into(),
        }
    }
}

/// Failures raised by the underlying key-value store.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error(transparent)]
    Fjall(#[from] fjall::Error),

    #[error(transparent)]
    Redb(#[from] redb::Error),

    /// A concurrent transaction committed a write this one had read.
    /// Nothing was applied; the caller may retry.
    #[error("transaction conflict")]
    Conflict,

    /// A persisted key does not follow the queue key layout.
    #[error("malformed key {}: {reason}", hex::encode(key))]
    MalformedKey { key: Vec<u8>, reason: &'static str },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A blocking task running the operation panicked or was cancelled.
    #[error("background task failed: {0}")]
    Join(String),
}

impl StoreError {
    pub(crate) fn malformed(key: &[u8], reason: &'static str) -> Self {
        Self::MalformedKey {
            key: key.to_vec(),
            reason,
        }
    }
}

// redb reports a distinct error type per stage; fold them into `redb::Error`.
macro_rules! redb_stage_errors {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for StoreError {
                fn from(e: $ty) -> Self {
                    Self::Redb(e.into())
                }
            }
        )*
    };
}

redb_stage_errors!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

/// Render a queue name for error messages and logs.
pub(crate) fn display_name(name: &[u8]) -> String {
    String::from_utf8_lossy(name).into_owned()
}
