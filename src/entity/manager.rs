//! Cache manager - keyed registry of live entity wrappers.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::debug;

use super::{CacheError, EntityWrapper, Record};
use crate::database::RecordStore;
use crate::sync::{SyncStream, Synchronizer};

type Slot<T> = Arc<OnceCell<EntityWrapper<T>>>;

/// Registry of wrappers for one record type.
///
/// `fetch` loads a key at most once no matter how many callers race for it.
/// Entries leave the registry when their wrapper is evicted.
pub struct CacheManager<T: Record, S> {
    store: Arc<S>,
    synchronizer: Option<Arc<Synchronizer<T, T::Key>>>,
    entries: Arc<DashMap<T::Key, Slot<T>>>,
}

impl<T: Record, S: RecordStore<T>> CacheManager<T, S> {
    /// Manager whose wrappers follow `synchronizer`.
    pub fn new(store: Arc<S>, synchronizer: Arc<Synchronizer<T, T::Key>>) -> Self {
        Self {
            store,
            synchronizer: Some(synchronizer),
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Manager whose wrappers only change through explicit updates.
    #[cfg(test)]
    pub fn unsynced(store: Arc<S>) -> Self {
        Self {
            store,
            synchronizer: None,
            entries: Arc::new(DashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Get the wrapper for `key`, loading it from the store on a miss.
    pub async fn fetch(&self, key: &T::Key) -> Result<EntityWrapper<T>, CacheError> {
        loop {
            let slot = Arc::clone(&self.entries.entry(key.clone()).or_default());

            match slot.get_or_try_init(|| self.load(key)).await {
                Ok(wrapper) if wrapper.is_tracked() => {
                    let current = self
                        .entries
                        .get(key)
                        .is_some_and(|entry| Arc::ptr_eq(entry.value(), &slot));
                    if current {
                        return Ok(wrapper.clone());
                    }
                    // `insert` replaced the slot mid-load, the loaded wrapper is orphaned
                    wrapper.evict();
                }
                Ok(_) => {
                    // evicted while we looked it up
                    self.entries.remove_if(key, |_, current| Arc::ptr_eq(current, &slot));
                }
                Err(err) => {
                    // the last waiter of a failed load clears the empty slot
                    self.entries.remove_if(key, |_, current| {
                        Arc::ptr_eq(current, &slot)
                            && !current.initialized()
                            && Arc::strong_count(current) == 2
                    });
                    return Err(err);
                }
            }
        }
    }

    /// Register a wrapper for a value that is already known, replacing
    /// (and evicting) any current entry. A load still in flight for `key`
    /// is discarded when it completes.
    pub fn insert(&self, key: T::Key, value: Option<T>) -> Result<EntityWrapper<T>, CacheError> {
        let stream = self.subscribe(&key)?;
        let wrapper = self.wrap(key.clone(), value, stream);

        let previous = self.entries.insert(key, Arc::new(OnceCell::from(wrapper.clone())));
        if let Some(old) = previous.as_deref().and_then(OnceCell::get) {
            old.evict();
        }
        Ok(wrapper)
    }

    /// Cached wrapper for `key`, without touching the store.
    pub fn get(&self, key: &T::Key) -> Option<EntityWrapper<T>> {
        let wrapper = self.entries.get(key).and_then(|slot| slot.value().get().cloned());
        wrapper.filter(EntityWrapper::is_tracked)
    }

    /// Evict the wrapper for `key`, if cached.
    pub fn evict(&self, key: &T::Key) -> bool {
        match self.get(key) {
            Some(wrapper) => wrapper.evict(),
            None => false,
        }
    }

    /// Number of live cached wrappers.
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|slot| slot.value().get().is_some_and(EntityWrapper::is_tracked))
            .count()
    }

    async fn load(&self, key: &T::Key) -> Result<EntityWrapper<T>, CacheError> {
        // subscribe before reading so no write can fall between the two
        let stream = self.subscribe(key)?;

        let loaded = match self.store.find_by_key(key).await {
            Ok(loaded) => loaded,
            Err(err) => {
                if let Some(sync) = &self.synchronizer {
                    sync.remove_sync_stream(key);
                }
                return Err(err.into());
            }
        };

        debug!("Loaded {} {:?} into cache", T::COLLECTION, key);
        Ok(self.wrap(key.clone(), loaded, stream))
    }

    fn subscribe(&self, key: &T::Key) -> Result<Option<SyncStream<T>>, CacheError> {
        match &self.synchronizer {
            Some(sync) => Ok(Some(sync.get_sync_stream(key)?)),
            None => Ok(None),
        }
    }

    fn wrap(&self, key: T::Key, value: Option<T>, stream: Option<SyncStream<T>>) -> EntityWrapper<T> {
        let wrapper = match stream {
            Some(stream) => EntityWrapper::synced(value, stream),
            None => EntityWrapper::detached(value),
        };

        let entries = Arc::downgrade(&self.entries);
        let synchronizer = self.synchronizer.clone();
        wrapper.on_untracked(move || {
            if let Some(entries) = entries.upgrade() {
                // only a stale slot goes; a newer wrapper for the key stays
                entries.remove_if(&key, |_, slot| {
                    slot.get().is_some_and(|current| !current.is_tracked())
                });
            }
            if let Some(sync) = synchronizer {
                sync.remove_sync_stream(&key);
            }
            debug!("Evicted {} {:?} from cache", T::COLLECTION, key);
        });

        wrapper
    }
}

impl<T: Record, S> std::fmt::Debug for CacheManager<T, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("record_type", &T::COLLECTION)
            .field("entries", &self.entries.len())
            .field("synced", &self.synchronizer.is_some())
            .finish()
    }
}
