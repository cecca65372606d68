//! Redb-backed queue engine.
//!
//! Each queue is its own table inside a single redb file, so a queue's
//! scope is native and its keys are just `<ready_at><uniquifier>`. Tables
//! are created lazily by the first push and remembered in the registry's
//! known-namespace set; table existence is the durable registry, so no
//! replay is needed on open.
//!
//! # Throughput
//!
//! redb admits one write transaction at a time for the whole file. Every
//! push, pop and del therefore serializes engine-wide, regardless of which
//! queue it touches. Use the fjall engine when many queues are written
//! concurrently.

use super::error::{Error, Op, Result, StoreError};
use super::key::{self, Uniquifier};
use super::registry::Registry;
use super::{QueueEngine, validate_name};
use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use redb::{
    Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition, TableError,
    TableHandle, WriteTransaction,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Prefix of every queue table name; the rest is the hex-encoded queue name.
const TABLE_PREFIX: &str = "queue:";

type QueueTable<'a> = TableDefinition<'a, &'static [u8], &'static [u8]>;

/// Options for [`RedbEngine::open`].
#[derive(Debug, Clone)]
pub struct RedbOptions {
    /// Database file.
    pub path: PathBuf,
    /// Tie-break strategy for equal ready times.
    pub uniquifier: Uniquifier,
}

impl RedbOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            uniquifier: Uniquifier::default(),
        }
    }
}

/// Queue engine over a single redb file, one table per queue.
pub struct RedbEngine {
    /// `None` once closed, which releases the file lock. Requests hold it
    /// shared; `del` and `close` hold it exclusively.
    db: RwLock<Option<Database>>,
    registry: Registry<()>,
    uniquifier: Uniquifier,
    path: PathBuf,
}

fn table_name(queue: &[u8]) -> String {
    format!("{TABLE_PREFIX}{}", hex::encode(queue))
}

fn queue_name(table: &str) -> Option<Vec<u8>> {
    hex::decode(table.strip_prefix(TABLE_PREFIX)?).ok()
}

fn definition(table: &str) -> QueueTable<'_> {
    TableDefinition::new(table)
}

impl RedbEngine {
    /// Open or create the database file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Open`] if the directory cannot be created or the
    /// file cannot be opened (permissions, corruption, lock held).
    pub fn open(options: RedbOptions) -> Result<Self> {
        let path = options.path.clone();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::open(&path, e))?;
        }

        let db = Database::create(&path).map_err(|e| Error::open(&path, e))?;
        info!(path = %path.display(), "Opened redb queue engine");

        Ok(Self {
            db: RwLock::new(Some(db)),
            registry: Registry::new(),
            uniquifier: options.uniquifier,
            path,
        })
    }

    /// Database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn enter(&self) -> Result<MappedRwLockReadGuard<'_, Database>> {
        RwLockReadGuard::try_map(self.db.read(), Option::as_ref).map_err(|_| Error::Closed)
    }

    /// Whether the queue's table exists, consulting the known-namespace set
    /// before listing tables.
    fn exists(
        &self,
        txn: &WriteTransaction,
        name: &[u8],
        table: &str,
    ) -> std::result::Result<bool, StoreError> {
        if self.registry.get(name).is_some() {
            return Ok(true);
        }
        let found = txn.list_tables()?.any(|handle| handle.name() == table);
        if found {
            self.registry.insert(name, ());
        }
        Ok(found)
    }

    fn push_item(
        &self,
        db: &Database,
        name: &[u8],
        suffix: &[u8],
        payload: &[u8],
    ) -> std::result::Result<(), StoreError> {
        let table = table_name(name);
        let txn = db.begin_write()?;
        {
            let mut items = txn.open_table(definition(&table))?;
            items.insert(suffix, payload)?;
        }
        txn.commit()?;
        self.registry.insert(name, ());
        Ok(())
    }

    fn pop_ready(
        &self,
        db: &Database,
        name: &[u8],
        limit: usize,
    ) -> std::result::Result<Vec<Vec<u8>>, StoreError> {
        let table = table_name(name);
        let txn = db.begin_write()?;
        if !self.exists(&txn, name, &table)? {
            txn.abort()?;
            return Ok(Vec::new());
        }

        let now = key::now_ms();
        let mut payloads = Vec::new();
        {
            let mut items = txn.open_table(definition(&table))?;
            let mut ready = Vec::new();
            for entry in items.iter()? {
                let (suffix, payload) = entry?;
                if key::parse_suffix(suffix.value())? > now {
                    break;
                }
                ready.push(suffix.value().to_vec());
                payloads.push(payload.value().to_vec());
                if payloads.len() >= limit {
                    break;
                }
            }
            for suffix in &ready {
                items.remove(suffix.as_slice())?;
            }
        }

        if payloads.is_empty() {
            txn.abort()?;
        } else {
            txn.commit()?;
        }
        Ok(payloads)
    }

    fn count(&self, db: &Database, name: &[u8]) -> std::result::Result<usize, StoreError> {
        let table = table_name(name);
        let txn = db.begin_read()?;
        let items = match txn.open_table(definition(&table)) {
            Ok(items) => items,
            Err(TableError::TableDoesNotExist(_)) => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let len = items.len()?;
        Ok(usize::try_from(len).unwrap_or(usize::MAX))
    }

    fn delete_queue(&self, db: &Database, name: &[u8]) -> std::result::Result<usize, StoreError> {
        let table = table_name(name);
        let txn = db.begin_write()?;
        if !self.exists(&txn, name, &table)? {
            txn.abort()?;
            return Ok(0);
        }

        let removed = {
            let items = txn.open_table(definition(&table))?;
            items.len()?
        };
        txn.delete_table(definition(&table))?;
        txn.commit()?;
        Ok(usize::try_from(removed).unwrap_or(usize::MAX))
    }

    fn list_queues(&self, db: &Database) -> std::result::Result<Vec<Vec<u8>>, StoreError> {
        let txn = db.begin_read()?;
        let names: Vec<Vec<u8>> = txn
            .list_tables()?
            .filter_map(|handle| queue_name(handle.name()))
            .collect();
        for name in &names {
            self.registry.insert(name, ());
        }
        Ok(names)
    }
}

impl QueueEngine for RedbEngine {
    fn push(&self, name: &[u8], payload: &[u8], delay: Duration) -> Result<()> {
        validate_name(name)?;
        let db = self.enter()?;
        let ready_at = key::ready_at(key::now_ms(), delay);
        let suffix = key::item_suffix(ready_at, self.uniquifier.next());
        self.push_item(&db, name, &suffix, payload)
            .map_err(|e| Error::transaction(Op::Push, name, e))
    }

    fn pop(&self, name: &[u8], limit: usize) -> Result<Vec<Vec<u8>>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let db = self.enter()?;
        self.pop_ready(&db, name, limit)
            .map_err(|e| Error::transaction(Op::Pop, name, e))
    }

    fn len(&self, name: &[u8]) -> Result<usize> {
        let db = self.enter()?;
        self.count(&db, name)
            .map_err(|e| Error::transaction(Op::Len, name, e))
    }

    fn del(&self, name: &[u8]) -> Result<usize> {
        let guard = self.db.write();
        let db = guard.as_ref().ok_or(Error::Closed)?;
        let removed = self
            .delete_queue(db, name)
            .map_err(|e| Error::transaction(Op::Del, name, e))?;
        self.registry.remove(name);

        info!(queue = %String::from_utf8_lossy(name), removed, "Deleted queue");
        Ok(removed)
    }

    fn queues(&self) -> Result<Vec<Vec<u8>>> {
        let db = self.enter()?;
        self.list_queues(&db).map_err(|source| Error::Store {
            op: Op::Queues,
            source,
        })
    }

    fn close(&self) -> Result<()> {
        // Waits for in-flight transactions; every commit is already durable.
        let mut guard = self.db.write();
        let Some(db) = guard.take() else {
            return Ok(());
        };
        drop(db);
        info!(path = %self.path.display(), "Closed redb queue engine");
        Ok(())
    }
}
