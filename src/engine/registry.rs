//! In-memory queue registry.
//!
//! Maps queue names to their storage identifier: a numeric scope for the
//! fjall engine, or plain existence (`()`) for redb where every queue is
//! its own table. Reads go through a sharded map and never block each
//! other. First registration of a name runs inside one critical section
//! covering lookup, allocation, persistence and cache insert, so two
//! concurrent first pushes cannot allocate two identifiers.
//!
//! The registry does not order deletes against pushes; engines hold their
//! store handle behind a lock that `del` takes exclusively.

use dashmap::DashMap;
use parking_lot::Mutex;

/// Name-to-identifier cache shared by all requests of one engine.
pub struct Registry<I> {
    entries: DashMap<Vec<u8>, I>,
    registration: Mutex<()>,
}

impl<I: Copy> Registry<I> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            registration: Mutex::new(()),
        }
    }

    /// Cached identifier for `name`, without touching the store.
    pub fn get(&self, name: &[u8]) -> Option<I> {
        self.entries.get(name).map(|entry| *entry.value())
    }

    /// Resolve `name`, calling `register` at most once per new name.
    ///
    /// `register` must allocate and durably persist the identifier; it
    /// runs with the registration lock held and only after a second cache
    /// check, so concurrent callers for the same unseen name observe a
    /// single identifier. Nothing is cached if `register` fails.
    pub fn resolve<E>(
        &self,
        name: &[u8],
        register: impl FnOnce() -> Result<I, E>,
    ) -> Result<I, E> {
        if let Some(id) = self.get(name) {
            return Ok(id);
        }

        let _registration = self.registration.lock();
        if let Some(id) = self.get(name) {
            return Ok(id);
        }
        let id = register()?;
        self.entries.insert(name.to_vec(), id);
        Ok(id)
    }

    /// Record an identifier that is already persisted (startup replay or a
    /// namespace discovered in the store).
    pub fn insert(&self, name: &[u8], id: I) {
        self.entries.insert(name.to_vec(), id);
    }

    /// Drop `name` from the cache, returning its identifier.
    pub fn remove(&self, name: &[u8]) -> Option<I> {
        self.entries.remove(name).map(|(_, id)| id)
    }

    /// All cached names, in no particular order.
    pub fn names(&self) -> Vec<Vec<u8>> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<I: Copy> Default for Registry<I> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;

    #[test]
    fn test_resolve_caches_identifier() {
        let registry = Registry::new();
        let calls = AtomicU64::new(0);

        for _ in 0..3 {
            let id = registry
                .resolve(b"jobs", || Ok::<_, ()>(calls.fetch_add(1, Ordering::SeqCst) + 10))
                .unwrap();
            assert_eq!(id, 10);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.get(b"jobs"), Some(10));
    }

    #[test]
    fn test_failed_registration_is_not_cached() {
        let registry: Registry<u64> = Registry::new();
        let result = registry.resolve(b"jobs", || Err("disk full"));
        assert_eq!(result, Err("disk full"));
        assert!(registry.get(b"jobs").is_none());

        let id = registry.resolve(b"jobs", || Ok::<_, &str>(3)).unwrap();
        assert_eq!(id, 3);
    }

    #[test]
    fn test_concurrent_first_registration_allocates_once() {
        let registry = Arc::new(Registry::new());
        let counter = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    registry
                        .resolve(b"fresh", || {
                            thread::yield_now();
                            Ok::<_, ()>(counter.fetch_add(1, Ordering::SeqCst))
                        })
                        .unwrap()
                })
            })
            .collect();

        let ids: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(ids.iter().all(|id| *id == ids[0]));
    }

    #[test]
    fn test_names_and_remove() {
        let registry = Registry::new();
        registry.insert(b"a", ());
        registry.insert(b"b", ());

        let mut names = registry.names();
        names.sort();
        assert_eq!(names, vec![b"a".to_vec(), b"b".to_vec()]);

        assert_eq!(registry.remove(b"a"), Some(()));
        assert_eq!(registry.remove(b"a"), None);
        assert_eq!(registry.len(), 1);
    }
}
