//! High-level `QueueStore` wrapper over engine implementations.
//!
//! Engines are synchronous; the store moves every call onto tokio's
//! blocking pool so async callers (the RESP front-end) never stall a
//! runtime worker on disk I/O.

use crate::config::{Backend, Config};
use crate::engine::{
    Error, FjallEngine, FjallOptions, Op, QueueEngine, RedbEngine, RedbOptions, Result,
    StoreError,
};
use std::sync::Arc;
use std::time::Duration;

/// Async handle to a delayed-queue engine.
///
/// `QueueStore` is `Clone`; clones share one engine.
///
/// # Example
///
/// ```no_run
/// use delayq::engine::FjallOptions;
/// use delayq::store::QueueStore;
/// use std::time::Duration;
///
/// # async fn demo() -> delayq::engine::Result<()> {
/// let store = QueueStore::fjall(FjallOptions::new("./queue_data"))?;
/// store.push(b"emails", b"welcome:42", Duration::from_secs(30)).await?;
/// let ready = store.pop(b"emails", 10).await?;
/// assert!(ready.is_empty());
/// store.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct QueueStore {
    engine: Arc<dyn QueueEngine>,
}

impl QueueStore {
    /// Open a store over a fjall keyspace.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Open`] if the keyspace cannot be opened or its
    /// registry cannot be replayed.
    pub fn fjall(options: FjallOptions) -> Result<Self> {
        Ok(Self::custom(FjallEngine::open(options)?))
    }

    /// Open a store over a single redb file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Open`] if the database cannot be opened.
    pub fn redb(options: RedbOptions) -> Result<Self> {
        Ok(Self::custom(RedbEngine::open(options)?))
    }

    /// Open the backend selected by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Open`] if the selected backend cannot be opened.
    pub fn open(config: &Config) -> Result<Self> {
        match config.engine.backend {
            Backend::Fjall => Self::fjall(config.fjall_options()),
            Backend::Redb => Self::redb(config.redb_options()),
        }
    }

    /// Wrap a custom engine.
    pub fn custom<E: QueueEngine>(engine: E) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }

    /// Store `payload` in queue `name`, ready after `delay`.
    ///
    /// # Errors
    ///
    /// See [`QueueEngine::push`].
    pub async fn push(&self, name: &[u8], payload: &[u8], delay: Duration) -> Result<()> {
        let (name, payload) = (name.to_vec(), payload.to_vec());
        self.run(Op::Push, name.clone(), move |engine| {
            engine.push(&name, &payload, delay)
        })
        .await
    }

    /// Remove and return up to `limit` ready payloads.
    ///
    /// # Errors
    ///
    /// See [`QueueEngine::pop`].
    pub async fn pop(&self, name: &[u8], limit: usize) -> Result<Vec<Vec<u8>>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let name = name.to_vec();
        self.run(Op::Pop, name.clone(), move |engine| engine.pop(&name, limit))
            .await
    }

    /// Number of items in the queue, ready or not.
    ///
    /// # Errors
    ///
    /// See [`QueueEngine::len`].
    pub async fn len(&self, name: &[u8]) -> Result<usize> {
        let name = name.to_vec();
        self.run(Op::Len, name.clone(), move |engine| engine.len(&name))
            .await
    }

    /// Delete the queue, returning how many items it held.
    ///
    /// # Errors
    ///
    /// See [`QueueEngine::del`].
    pub async fn del(&self, name: &[u8]) -> Result<usize> {
        let name = name.to_vec();
        self.run(Op::Del, name.clone(), move |engine| engine.del(&name))
            .await
    }

    /// Names of all known queues.
    ///
    /// # Errors
    ///
    /// See [`QueueEngine::queues`].
    pub async fn queues(&self) -> Result<Vec<Vec<u8>>> {
        self.run(Op::Queues, Vec::new(), |engine| engine.queues())
            .await
    }

    /// Close the engine. Pending calls finish first.
    ///
    /// # Errors
    ///
    /// See [`QueueEngine::close`].
    pub async fn close(&self) -> Result<()> {
        self.run(Op::Close, Vec::new(), |engine| engine.close())
            .await
    }

    async fn run<T, F>(&self, op: Op, name: Vec<u8>, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn QueueEngine) -> Result<T> + Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        match tokio::task::spawn_blocking(move || f(engine.as_ref())).await {
            Ok(result) => result,
            Err(e) => Err(Error::transaction(op, &name, StoreError::Join(e.to_string()))),
        }
    }
}

impl std::fmt::Debug for QueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueStore").finish_non_exhaustive()
    }
}
