//! Delayed-queue storage engines.
//!
//! A [`QueueEngine`] stores opaque payloads with a ready time and hands
//! them out, oldest ready time first, once that time has passed. Each
//! payload is returned by exactly one successful [`QueueEngine::pop`]
//! commit. Two engines implement the contract:
//!
//! - **[`FjallEngine`]**: log-structured keyspace; queues are scoped by a
//!   numeric key prefix allocated from a durable counter and replayed from
//!   `queue_name.<id>` entries on open. Needs value-log compaction, which
//!   runs on a background [`Maintenance`] thread.
//! - **[`RedbEngine`]**: single-file copy-on-write B-tree; every queue is
//!   its own table. Writers are serialized across the whole file.
//!
//! # Example
//!
//! ```no_run
//! use delayq::engine::{FjallEngine, FjallOptions, QueueEngine};
//! use std::time::Duration;
//!
//! # fn main() -> delayq::engine::Result<()> {
//! let engine = FjallEngine::open(FjallOptions::new("./queue_data"))?;
//! engine.push(b"emails", b"welcome:42", Duration::from_secs(30))?;
//!
//! // Nothing is ready yet.
//! assert!(engine.pop(b"emails", 10)?.is_empty());
//! engine.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Custom Engines
//!
//! Implement [`QueueEngine`] and wrap it with
//! [`QueueStore::custom`](crate::store::QueueStore::custom).

mod error;
mod fjall;
mod key;
mod maintenance;
mod property_tests;
mod redb;
mod registry;
mod sequence;


pub use self::error::{Error, Op, Result, StoreError};
pub use self::fjall::{FjallEngine, FjallOptions};
pub use self::key::Uniquifier;
pub use self::maintenance::{Compact, Maintenance, MaintenanceConfig};
pub use self::redb::{RedbEngine, RedbOptions};

use std::time::Duration;

/// Behaviour shared by every delayed-queue backend.
///
/// Implementations must be thread-safe: requests arrive concurrently from
/// one task per connection. Every method either returns a complete result
/// or an error with nothing committed. Absent queues are not errors; they
/// read as empty.
pub trait QueueEngine: Send + Sync + 'static {
    /// Store `payload` in queue `name`, ready after `delay`.
    ///
    /// Creates the queue on first use. Identical pushes create distinct
    /// items.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an empty name,
    /// [`Error::Allocation`] if a new queue cannot be registered and
    /// [`Error::Transaction`] if the write does not commit.
    fn push(&self, name: &[u8], payload: &[u8], delay: Duration) -> Result<()>;

    /// Remove and return up to `limit` ready payloads, in ready-time order.
    ///
    /// `limit == 0` returns an empty list without touching the store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transaction`] if the scan or commit fails; in that
    /// case no payload was removed.
    fn pop(&self, name: &[u8], limit: usize) -> Result<Vec<Vec<u8>>>;

    /// Number of items in the queue, ready or not.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transaction`] if the read fails.
    fn len(&self, name: &[u8]) -> Result<usize>;

    /// Delete every item of the queue and forget the queue, returning how
    /// many items were removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transaction`] if the delete does not commit.
    fn del(&self, name: &[u8]) -> Result<usize>;

    /// Names of all known queues, unordered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] if the backend cannot list its queues.
    fn queues(&self) -> Result<Vec<Vec<u8>>>;

    /// Stop background work, wait for in-flight requests, flush the store
    /// and release its files. Later calls fail with [`Error::Closed`].
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] if releasing the counter or flushing fails.
    fn close(&self) -> Result<()>;
}

/// Reject queue names the contract does not accept.
pub(crate) fn validate_name(name: &[u8]) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument(
            "queue name must not be empty".to_string(),
        ));
    }
    Ok(())
}
