//! Durable monotonic counter for queue identifiers.
//!
//! The counter persists an upper bound ("lease") rather than every value:
//! identifiers below the persisted lease may be handed out without a
//! write, and a crash at worst skips the unused remainder of a lease.
//! Identifiers are never reused. [`Sequence::release`] writes back the
//! exact next value on shutdown so a clean restart wastes nothing.

use super::error::StoreError;
use super::fjall::commit;
use fjall::{TxKeyspace, TxPartitionHandle, WriteTransaction};
use parking_lot::{Mutex, MutexGuard};

#[derive(Debug)]
struct Lease {
    next: u64,
    leased: u64,
}

/// Leased counter stored under a single key of a fjall partition.
pub struct Sequence {
    key: &'static [u8],
    bandwidth: u64,
    lease: Mutex<Lease>,
}

/// Identifier taken from a [`Sequence`], applied with [`Reservation::confirm`]
/// once the enclosing transaction commits.
///
/// Holds the sequence lock, so reservations are strictly serialized.
pub struct Reservation<'a> {
    lease: MutexGuard<'a, Lease>,
    id: u64,
    leased: u64,
}

impl Reservation<'_> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Advance the in-memory counter. Call only after the transaction that
    /// carried this reservation has committed.
    pub fn confirm(mut self) {
        self.lease.next = self.id + 1;
        self.lease.leased = self.leased;
    }
}

impl Sequence {
    /// Load the counter stored at `key`, starting at zero if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or the stored value is not a
    /// big-endian `u64`.
    pub fn open(
        keyspace: &TxKeyspace,
        partition: &TxPartitionHandle,
        key: &'static [u8],
        bandwidth: u64,
    ) -> Result<Self, StoreError> {
        let next = match keyspace.read_tx().get(partition, key)? {
            Some(value) => {
                let bytes: [u8; 8] = value
                    .as_ref()
                    .try_into()
                    .map_err(|_| StoreError::malformed(key, "sequence value is not 8 bytes"))?;
                u64::from_be_bytes(bytes)
            },
            None => 0,
        };

        Ok(Self {
            key,
            bandwidth: bandwidth.max(1),
            lease: Mutex::new(Lease { next, leased: next }),
        })
    }

    /// Take the next identifier. When the current lease is exhausted the
    /// extended lease is written into `tx`, so allocation and whatever else
    /// `tx` persists commit together.
    pub fn reserve(
        &self,
        tx: &mut WriteTransaction,
        partition: &TxPartitionHandle,
    ) -> Reservation<'_> {
        let lease = self.lease.lock();
        let id = lease.next;
        let leased = if id >= lease.leased {
            let leased = id.saturating_add(self.bandwidth);
            tx.insert(partition, self.key, leased.to_be_bytes().to_vec());
            leased
        } else {
            lease.leased
        };

        Reservation { lease, id, leased }
    }

    /// Persist the exact next value, returning the unused part of the lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the write transaction fails to commit.
    pub fn release(
        &self,
        keyspace: &TxKeyspace,
        partition: &TxPartitionHandle,
    ) -> Result<(), StoreError> {
        let mut lease = self.lease.lock();
        if lease.next < lease.leased {
            let mut tx = keyspace.write_tx()?;
            tx.insert(partition, self.key, lease.next.to_be_bytes().to_vec());
            commit(tx)?;
            lease.leased = lease.next;
        }
        Ok(())
    }

    /// Next identifier that [`Sequence::reserve`] would hand out.
    pub fn peek(&self) -> u64 {
        self.lease.lock().next
    }
}
