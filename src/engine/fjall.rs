//! Fjall-backed queue engine.
//!
//! All queues share one log-structured partition. Items are scoped by a
//! numeric queue identifier prefix (see [`key`](super::key)), and the
//! registry family `queue_name.<id>` maps identifiers back to names so the
//! in-memory registry can be rebuilt on open. Payloads live in fjall's
//! value log; the maintenance loop reclaims space left behind by popped
//! items.
//!
//! Write transactions are optimistic: two pops that read the same ready
//! items cannot both commit, and the loser fails with
//! [`StoreError::Conflict`] without removing anything. Pushes only write
//! fresh keys and never conflict. Readers (`len`) run on snapshots.

use super::error::{Error, Op, Result, StoreError};
use super::key::{self, Uniquifier};
use super::maintenance::{Compact, Maintenance, MaintenanceConfig};
use super::registry::Registry;
use super::sequence::Sequence;
use super::{QueueEngine, validate_name};
use fjall::{
    Config, GarbageCollection, KvSeparationOptions, PartitionCreateOptions, PersistMode, Slice,
    TxKeyspace, TxPartitionHandle, WriteTransaction,
};
use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Partition holding items, registry entries and the identifier counter.
const PARTITION: &str = "queues";

/// Key of the identifier counter.
const SEQUENCE_KEY: &[u8] = b"queue_id";

/// Options for [`FjallEngine::open`].
#[derive(Debug, Clone)]
pub struct FjallOptions {
    /// Keyspace directory.
    pub path: PathBuf,
    /// Identifiers leased per counter write.
    pub sequence_bandwidth: u64,
    /// Tie-break strategy for equal ready times.
    pub uniquifier: Uniquifier,
    /// Fsync the journal after every commit.
    pub fsync: bool,
    /// Value-log compaction schedule.
    pub maintenance: MaintenanceConfig,
}

impl FjallOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sequence_bandwidth: 4,
            uniquifier: Uniquifier::default(),
            fsync: true,
            maintenance: MaintenanceConfig::default(),
        }
    }
}

/// Reclaims value-log space on the shared partition.
struct ValueLog {
    partition: TxPartitionHandle,
}

impl Compact for ValueLog {
    fn compact(&self, discard_ratio: f32) -> std::result::Result<u64, StoreError> {
        self.partition.gc_scan()?;
        Ok(self.partition.gc_with_staleness_threshold(discard_ratio)?)
    }
}

/// Commit `tx`, folding an optimistic conflict into [`StoreError::Conflict`].
pub(super) fn commit(tx: WriteTransaction) -> std::result::Result<(), StoreError> {
    tx.commit()?.map_err(|_| StoreError::Conflict)
}

/// Open keyspace and partition. Dropping the last copy releases the files.
struct Handles {
    keyspace: TxKeyspace,
    partition: TxPartitionHandle,
}

/// Queue engine over a fjall transactional keyspace.
pub struct FjallEngine {
    /// `None` once closed. Requests hold it shared; `del` and `close`
    /// hold it exclusively.
    store: RwLock<Option<Handles>>,
    sequence: Sequence,
    registry: Registry<u64>,
    uniquifier: Uniquifier,
    fsync: bool,
    maintenance: Maintenance,
    path: PathBuf,
}

impl FjallEngine {
    /// Open (or create) the keyspace, replay the registry and start the
    /// maintenance loop. No request can be served before replay finishes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Open`] if the directory or keyspace cannot be
    /// opened, a registry entry is malformed, or the maintenance thread
    /// cannot be started.
    pub fn open(options: FjallOptions) -> Result<Self> {
        let path = options.path.clone();
        std::fs::create_dir_all(&path).map_err(|e| Error::open(&path, e))?;

        let keyspace = Config::new(&path)
            .open_transactional()
            .map_err(|e| Error::open(&path, e))?;
        let partition = keyspace
            .open_partition(
                PARTITION,
                PartitionCreateOptions::default()
                    .with_kv_separation(KvSeparationOptions::default()),
            )
            .map_err(|e| Error::open(&path, e))?;

        let sequence = Sequence::open(
            &keyspace,
            &partition,
            SEQUENCE_KEY,
            options.sequence_bandwidth,
        )
        .map_err(|e| Error::open(&path, e))?;

        let registry = Registry::new();
        replay_registry(&keyspace, &partition, &registry).map_err(|e| Error::open(&path, e))?;

        let maintenance = Maintenance::spawn(
            ValueLog {
                partition: partition.clone(),
            },
            options.maintenance,
        )
        .map_err(|e| Error::open(&path, e))?;

        info!(
            path = %path.display(),
            queues = registry.len(),
            next_id = sequence.peek(),
            "Opened fjall queue engine"
        );

        Ok(Self {
            store: RwLock::new(Some(Handles {
                keyspace,
                partition,
            })),
            sequence,
            registry,
            uniquifier: options.uniquifier,
            fsync: options.fsync,
            maintenance,
            path,
        })
    }

    /// Keyspace directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Enter a request: share the store handle, or fail if closed.
    fn enter(&self) -> Result<MappedRwLockReadGuard<'_, Handles>> {
        RwLockReadGuard::try_map(self.store.read(), Option::as_ref).map_err(|_| Error::Closed)
    }

    /// Resolve or register the identifier for `name`.
    fn resolve(&self, store: &Handles, name: &[u8]) -> Result<u64> {
        self.registry
            .resolve(name, || self.register(store, name))
            .map_err(|e| Error::allocation(name, e))
    }

    /// Allocate an identifier and persist `queue_name.<id> -> name` in one
    /// transaction. Runs under the registry's registration lock.
    fn register(&self, store: &Handles, name: &[u8]) -> std::result::Result<u64, StoreError> {
        let mut tx = store.keyspace.write_tx()?;
        let reservation = self.sequence.reserve(&mut tx, &store.partition);
        let id = reservation.id();
        tx.insert(&store.partition, key::registry_key(id), name);
        commit(tx)?;
        reservation.confirm();
        self.sync(store)?;

        debug!(queue = %String::from_utf8_lossy(name), id, "Registered queue");
        Ok(id)
    }

    fn sync(&self, store: &Handles) -> std::result::Result<(), StoreError> {
        if self.fsync {
            store.keyspace.persist(PersistMode::SyncAll)?;
        }
        Ok(())
    }

    fn push_item(
        &self,
        store: &Handles,
        item_key: Vec<u8>,
        payload: &[u8],
    ) -> std::result::Result<(), StoreError> {
        let mut tx = store.keyspace.write_tx()?;
        tx.insert(&store.partition, item_key, payload);
        commit(tx)?;
        self.sync(store)
    }

    fn pop_ready(
        &self,
        store: &Handles,
        id: u64,
        limit: usize,
    ) -> std::result::Result<Vec<Vec<u8>>, StoreError> {
        let prefix = key::scope_prefix(id);
        let now = key::now_ms();

        let mut tx = store.keyspace.write_tx()?;
        let ready = scan_ready(&mut tx, &store.partition, &prefix, now, limit)?;
        if ready.is_empty() {
            return Ok(Vec::new());
        }

        let mut payloads = Vec::with_capacity(ready.len());
        for (item_key, payload) in ready {
            tx.remove(&store.partition, item_key);
            payloads.push(payload.to_vec());
        }
        commit(tx)?;
        self.sync(store)?;
        Ok(payloads)
    }

    fn count(&self, store: &Handles, id: u64) -> std::result::Result<usize, StoreError> {
        let prefix = key::scope_prefix(id);
        let snapshot = store.keyspace.read_tx();
        let mut count = 0;
        for entry in snapshot.prefix(&store.partition, &prefix) {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    fn delete_queue(&self, store: &Handles, id: u64) -> std::result::Result<usize, StoreError> {
        let prefix = key::scope_prefix(id);
        let mut tx = store.keyspace.write_tx()?;
        let keys = scan_keys(&mut tx, &store.partition, &prefix)?;
        let removed = keys.len();
        for item_key in keys {
            tx.remove(&store.partition, item_key);
        }
        tx.remove(&store.partition, key::registry_key(id));
        commit(tx)?;
        self.sync(store)?;
        Ok(removed)
    }
}

impl QueueEngine for FjallEngine {
    fn push(&self, name: &[u8], payload: &[u8], delay: Duration) -> Result<()> {
        validate_name(name)?;
        let store = self.enter()?;
        let id = self.resolve(&store, name)?;
        let ready_at = key::ready_at(key::now_ms(), delay);
        let item_key = key::scoped_item_key(id, ready_at, self.uniquifier.next());
        self.push_item(&store, item_key, payload)
            .map_err(|e| Error::transaction(Op::Push, name, e))
    }

    fn pop(&self, name: &[u8], limit: usize) -> Result<Vec<Vec<u8>>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let store = self.enter()?;
        let Some(id) = self.registry.get(name) else {
            return Ok(Vec::new());
        };
        self.pop_ready(&store, id, limit)
            .map_err(|e| Error::transaction(Op::Pop, name, e))
    }

    fn len(&self, name: &[u8]) -> Result<usize> {
        let store = self.enter()?;
        let Some(id) = self.registry.get(name) else {
            return Ok(0);
        };
        self.count(&store, id)
            .map_err(|e| Error::transaction(Op::Len, name, e))
    }

    fn del(&self, name: &[u8]) -> Result<usize> {
        // Exclusive: no push may hold an identifier resolved before the delete.
        let guard = self.store.write();
        let store = guard.as_ref().ok_or(Error::Closed)?;
        let Some(id) = self.registry.get(name) else {
            return Ok(0);
        };
        let removed = self
            .delete_queue(store, id)
            .map_err(|e| Error::transaction(Op::Del, name, e))?;
        self.registry.remove(name);

        info!(queue = %String::from_utf8_lossy(name), id, removed, "Deleted queue");
        Ok(removed)
    }

    fn queues(&self) -> Result<Vec<Vec<u8>>> {
        let _store = self.enter()?;
        Ok(self.registry.names())
    }

    fn close(&self) -> Result<()> {
        self.maintenance.stop();

        // Waits for in-flight requests; later ones observe `None`.
        let mut guard = self.store.write();
        let Some(store) = guard.take() else {
            return Ok(());
        };
        self.sequence
            .release(&store.keyspace, &store.partition)
            .map_err(|source| Error::Store {
                op: Op::Close,
                source,
            })?;
        store
            .keyspace
            .persist(PersistMode::SyncAll)
            .map_err(|e| Error::Store {
                op: Op::Close,
                source: e.into(),
            })?;
        drop(store);

        info!(path = %self.path.display(), "Closed fjall queue engine");
        Ok(())
    }
}

/// Rebuild the registry cache from every persisted `queue_name.*` key.
fn replay_registry(
    keyspace: &TxKeyspace,
    partition: &TxPartitionHandle,
    registry: &Registry<u64>,
) -> std::result::Result<(), StoreError> {
    let snapshot = keyspace.read_tx();
    for entry in snapshot.prefix(partition, key::REGISTRY_PREFIX) {
        let (registry_key, name) = entry?;
        let id = key::parse_registry_key(&registry_key)?;
        registry.insert(&name, id);
    }
    Ok(())
}

/// Leading entries under `prefix` that are ready at `now`, at most `limit`.
///
/// Keys are ordered by ready time, so the walk stops at the first entry
/// that is still in the future.
fn scan_ready(
    tx: &mut WriteTransaction,
    partition: &TxPartitionHandle,
    prefix: &[u8],
    now: u64,
    limit: usize,
) -> std::result::Result<Vec<(Slice, Slice)>, StoreError> {
    let mut ready = Vec::new();
    for entry in tx.prefix(partition, prefix) {
        let (item_key, payload) = entry?;
        if key::parse_scoped(&item_key, prefix.len())? > now {
            break;
        }
        ready.push((item_key, payload));
        if ready.len() >= limit {
            break;
        }
    }
    Ok(ready)
}

/// Every key under `prefix`.
fn scan_keys(
    tx: &mut WriteTransaction,
    partition: &TxPartitionHandle,
    prefix: &[u8],
) -> std::result::Result<Vec<Slice>, StoreError> {
    let mut keys = Vec::new();
    for entry in tx.prefix(partition, prefix) {
        let (item_key, _) = entry?;
        keys.push(item_key);
    }
    Ok(keys)
}
