//! In-memory `RecordStore` for tests.
//!
//! Every committed write is echoed on an optional change feed, the same way
//! the MongoDB change stream reports it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::channel::mpsc;
use mongodb::bson;
use parking_lot::Mutex;

use super::{RecordStore, StoreError};
use crate::entity::Record;
use crate::sync::{ChangeEvent, FeedError};

pub type FeedSender = mpsc::UnboundedSender<Result<ChangeEvent, FeedError>>;

pub struct MemoryStore<T: Record> {
    rows: Mutex<HashMap<T::Key, T>>,
    feed: Option<FeedSender>,
    load_delay: Duration,
    write_delay: Mutex<Duration>,
    failing: AtomicBool,
    loads: AtomicUsize,
    deletes: AtomicUsize,
}

impl<T: Record> MemoryStore<T> {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            feed: None,
            load_delay: Duration::ZERO,
            write_delay: Mutex::new(Duration::ZERO),
            failing: AtomicBool::new(false),
            loads: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }

    pub fn with_feed(feed: FeedSender) -> Self {
        Self {
            feed: Some(feed),
            ..Self::new()
        }
    }

    #[must_use]
    pub fn load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// Delay every later `upsert` before it commits.
    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock() = delay;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn get(&self, key: &T::Key) -> Option<T> {
        self.rows.lock().get(key).cloned()
    }

    /// Write made by some other process.
    pub fn external_upsert(&self, record: T) {
        self.emit_upsert(&record);
        self.rows.lock().insert(record.key(), record);
    }

    pub fn external_delete(&self, key: &T::Key) {
        if self.rows.lock().remove(key).is_some() {
            self.emit_delete(key);
        }
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store set to fail".into()));
        }
        Ok(())
    }

    fn emit_upsert(&self, record: &T) {
        if let Some(feed) = &self.feed {
            let document = bson::to_document(record).expect("record encodes as a document");
            let _ = feed.unbounded_send(Ok(ChangeEvent::upsert(T::COLLECTION, document)));
        }
    }

    fn emit_delete(&self, key: &T::Key) {
        if let Some(feed) = &self.feed {
            let id = bson::to_bson(key).expect("key encodes as bson");
            let _ = feed.unbounded_send(Ok(ChangeEvent::delete(T::COLLECTION, id)));
        }
    }
}

impl<T: Record> RecordStore<T> for MemoryStore<T> {
    async fn find_by_key(&self, key: &T::Key) -> Result<Option<T>, StoreError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        self.check()?;
        Ok(self.get(key))
    }

    async fn find_all(&self) -> Result<Vec<T>, StoreError> {
        self.check()?;
        Ok(self.rows.lock().values().cloned().collect())
    }

    async fn upsert(&self, record: &T) -> Result<(), StoreError> {
        let delay = *self.write_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check()?;
        self.rows.lock().insert(record.key(), record.clone());
        self.emit_upsert(record);
        Ok(())
    }

    async fn delete(&self, key: &T::Key) -> Result<bool, StoreError> {
        self.check()?;
        self.deletes.fetch_add(1, Ordering::SeqCst);
        let existed = self.rows.lock().remove(key).is_some();
        if existed {
            self.emit_delete(key);
        }
        Ok(existed)
    }
}
