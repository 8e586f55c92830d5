//! Per-record-type change multiplexer.
//!
//! One upstream hub subscription per record type, fanned out into one
//! broadcast stream per key. Keys nobody watches are not buffered.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Weak};

use mongodb::bson;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{Change, EventHub, HubItem, SyncError};
use crate::entity::Record;

/// Value pushed to a key stream: the new record, `None` when deleted,
/// or a terminal error.
pub type SyncItem<T> = Result<Option<T>, SyncError>;

/// Receiving end of a key stream.
pub type SyncStream<T> = broadcast::Receiver<SyncItem<T>>;

type KeyFn<T, K> = Arc<dyn Fn(&T) -> K + Send + Sync>;

struct KeyStream<T> {
    sender: broadcast::Sender<SyncItem<T>>,
    subscribers: usize,
}

struct StreamTable<T, K> {
    streams: HashMap<K, KeyStream<T>>,
    terminal: Option<SyncError>,
    initialized: bool,
}

/// Routes hub events of one record type to per-key streams.
pub struct Synchronizer<T, K> {
    hub: Arc<EventHub>,
    record_type: String,
    key_of: KeyFn<T, K>,
    capacity: usize,
    table: Arc<Mutex<StreamTable<T, K>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Record> Synchronizer<T, T::Key> {
    /// Synchronizer keyed by the record's own key and collection.
    pub fn for_record(hub: Arc<EventHub>) -> Self {
        Self::new(hub, T::COLLECTION, T::key)
    }
}

impl<T, K> Synchronizer<T, K>
where
    T: Clone + DeserializeOwned + Send + Sync + 'static,
    K: Clone + Eq + Hash + Debug + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new<F>(hub: Arc<EventHub>, record_type: impl Into<String>, key_of: F) -> Self
    where
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        Self {
            hub,
            record_type: record_type.into(),
            key_of: Arc::new(key_of),
            capacity: 16,
            table: Arc::new(Mutex::new(StreamTable {
                streams: HashMap::new(),
                terminal: None,
                initialized: false,
            })),
            dispatcher: Mutex::new(None),
        }
    }

    /// Set the buffer size of each key stream.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn record_type(&self) -> &str {
        &self.record_type
    }

    /// Subscribe to the hub. Calling it again is a no-op.
    pub fn initialize(&self) -> Result<(), SyncError> {
        let mut dispatcher = self.dispatcher.lock();
        if dispatcher.is_some() {
            debug!("Synchronizer for {} already initialized", self.record_type);
            return Ok(());
        }

        let receiver = self.hub.subscribe(&self.record_type)?;
        self.table.lock().initialized = true;

        *dispatcher = Some(tokio::spawn(dispatch(
            receiver,
            self.record_type.clone(),
            Arc::clone(&self.key_of),
            Arc::downgrade(&self.table),
        )));

        info!("Synchronizer for {} initialized", self.record_type);
        Ok(())
    }

    /// Get (creating if needed) the change stream for `key`.
    ///
    /// Every successful call must be paired with one `remove_sync_stream`.
    pub fn get_sync_stream(&self, key: &K) -> Result<SyncStream<T>, SyncError> {
        let mut table = self.table.lock();
        if let Some(err) = &table.terminal {
            return Err(err.clone());
        }
        if !table.initialized {
            return Err(SyncError::NotInitialized(self.record_type.clone()));
        }

        let capacity = self.capacity;
        let stream = table.streams.entry(key.clone()).or_insert_with(|| KeyStream {
            sender: broadcast::channel(capacity).0,
            subscribers: 0,
        });
        stream.subscribers += 1;

        trace!(
            "Sync stream {}/{:?} now has {} subscribers",
            self.record_type, key, stream.subscribers
        );
        Ok(stream.sender.subscribe())
    }

    /// Release one subscription to `key`'s stream. No-op if already gone.
    pub fn remove_sync_stream(&self, key: &K) {
        let mut table = self.table.lock();
        let Some(stream) = table.streams.get_mut(key) else {
            return;
        };

        stream.subscribers = stream.subscribers.saturating_sub(1);
        if stream.subscribers == 0 {
            table.streams.remove(key);
            debug!("Removed sync stream {}/{:?}", self.record_type, key);
        }
    }

    /// Number of keys currently being synchronized.
    pub fn active_streams(&self) -> usize {
        self.table.lock().streams.len()
    }
}

impl<T, K> Drop for Synchronizer<T, K> {
    fn drop(&mut self) {
        if let Some(task) = self.dispatcher.get_mut().take() {
            task.abort();
        }
    }
}

impl<T, K> Debug for Synchronizer<T, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.lock();
        f.debug_struct("Synchronizer")
            .field("record_type", &self.record_type)
            .field("active_streams", &table.streams.len())
            .field("terminal", &table.terminal)
            .finish()
    }
}

async fn dispatch<T, K>(
    mut receiver: broadcast::Receiver<HubItem>,
    record_type: String,
    key_of: KeyFn<T, K>,
    table: Weak<Mutex<StreamTable<T, K>>>,
) where
    T: Clone + DeserializeOwned + Send + Sync + 'static,
    K: Clone + Eq + Hash + Debug + DeserializeOwned + Send + Sync + 'static,
{
    loop {
        let item = receiver.recv().await;
        let Some(table) = table.upgrade() else {
            return;
        };

        match item {
            Ok(Ok(change)) => route(&table, &record_type, &key_of, &change),
            Ok(Err(err)) => {
                terminate(&table, &record_type, err);
                return;
            }
            Err(RecvError::Lagged(missed)) => desync(&table, &record_type, missed),
            Err(RecvError::Closed) => {
                let mut table = table.lock();
                table.terminal = Some(SyncError::ShutDown);
                table.streams.clear();
                debug!("Synchronizer for {} closed with the hub", record_type);
                return;
            }
        }
    }
}

fn route<T, K>(
    table: &Mutex<StreamTable<T, K>>,
    record_type: &str,
    key_of: &KeyFn<T, K>,
    change: &Change,
) where
    T: DeserializeOwned,
    K: Eq + Hash + Debug + DeserializeOwned,
{
    let (key, value) = match change {
        Change::Upsert(document) => match bson::from_document::<T>(document.clone()) {
            Ok(record) => (key_of(&record), Some(record)),
            Err(e) => {
                warn!("Dropping undecodable {} document: {}", record_type, e);
                return;
            }
        },
        Change::Delete(id) => match bson::from_bson::<K>(id.clone()) {
            Ok(key) => (key, None),
            Err(e) => {
                warn!("Dropping {} delete with undecodable key {}: {}", record_type, id, e);
                return;
            }
        },
    };

    let table = table.lock();
    match table.streams.get(&key) {
        Some(stream) => {
            // a send error only means the last wrapper is mid-teardown
            let _ = stream.sender.send(Ok(value));
        }
        None => trace!("{} {:?} is not cached, change dropped", record_type, key),
    }
}

/// Skipped hub events may have touched any live key, so every key stream
/// gets `Lagged` and its wrappers drop out. The streams themselves stay open.
fn desync<T, K>(table: &Mutex<StreamTable<T, K>>, record_type: &str, missed: u64) {
    let table = table.lock();
    warn!(
        "Synchronizer for {} lagged behind the hub, {} change events lost, desyncing {} live keys",
        record_type,
        missed,
        table.streams.len()
    );
    for stream in table.streams.values() {
        let _ = stream.sender.send(Err(SyncError::Lagged(missed)));
    }
}

fn terminate<T, K>(table: &Mutex<StreamTable<T, K>>, record_type: &str, err: SyncError) {
    let streams = {
        let mut table = table.lock();
        table.terminal = Some(err.clone());
        std::mem::take(&mut table.streams)
    };

    warn!(
        "Synchronizer for {} terminated ({} live keys): {}",
        record_type,
        streams.len(),
        err
    );
    for stream in streams.into_values() {
        let _ = stream.sender.send(Err(err.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::ChangeEvent;
    use mongodb::bson::doc;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    struct Row {
        #[serde(rename = "_id")]
        id: i64,
        label: String,
    }

    fn synchronizer(hub: &Arc<EventHub>) -> Synchronizer<Row, i64> {
        let sync = Synchronizer::new(Arc::clone(hub), "rows", |row: &Row| row.id);
        sync.initialize().unwrap();
        sync
    }

    async fn next(stream: &mut SyncStream<Row>) -> SyncItem<Row> {
        tokio::time::timeout(std::time::Duration::from_secs(1), stream.recv())
            .await
            .expect("no change delivered")
            .expect("stream closed")
    }

    #[tokio::test]
    async fn routes_upserts_and_deletes_by_key() {
        let hub = EventHub::new(16);
        let sync = synchronizer(&hub);
        let mut one = sync.get_sync_stream(&1).unwrap();
        let mut two = sync.get_sync_stream(&2).unwrap();

        hub.publish(ChangeEvent::upsert("rows", doc! { "_id": 1_i64, "label": "a" }));
        hub.publish(ChangeEvent::delete("rows", 2_i64));

        let row = next(&mut one).await.unwrap();
        assert_eq!(row, Some(Row { id: 1, label: "a".into() }));
        assert_eq!(next(&mut two).await.unwrap(), None);
    }

    #[tokio::test]
    async fn shares_one_stream_per_key_and_ref_counts_it() {
        let hub = EventHub::new(16);
        let sync = synchronizer(&hub);
        let mut first = sync.get_sync_stream(&1).unwrap();
        let mut second = sync.get_sync_stream(&1).unwrap();
        assert_eq!(sync.active_streams(), 1);

        hub.publish(ChangeEvent::upsert("rows", doc! { "_id": 1_i64, "label": "b" }));
        assert!(next(&mut first).await.unwrap().is_some());
        assert!(next(&mut second).await.unwrap().is_some());

        sync.remove_sync_stream(&1);
        assert_eq!(sync.active_streams(), 1);
        sync.remove_sync_stream(&1);
        assert_eq!(sync.active_streams(), 0);
        // already gone
        sync.remove_sync_stream(&1);
        assert_eq!(sync.active_streams(), 0);
    }

    #[tokio::test]
    async fn drops_undecodable_documents() {
        let hub = EventHub::new(16);
        let sync = synchronizer(&hub);
        let mut stream = sync.get_sync_stream(&1).unwrap();

        hub.publish(ChangeEvent::upsert("rows", doc! { "_id": 1_i64 }));
        hub.publish(ChangeEvent::upsert("rows", doc! { "_id": 1_i64, "label": "ok" }));

        let row = next(&mut stream).await.unwrap().unwrap();
        assert_eq!(row.label, "ok");
    }

    #[tokio::test]
    async fn requires_initialize_and_tolerates_repeats() {
        let hub = EventHub::new(16);
        let sync: Synchronizer<Row, i64> = Synchronizer::new(Arc::clone(&hub), "rows", |r: &Row| r.id);

        assert_eq!(
            sync.get_sync_stream(&1).unwrap_err(),
            SyncError::NotInitialized("rows".into())
        );
        sync.initialize().unwrap();
        sync.initialize().unwrap();
        assert!(sync.get_sync_stream(&1).is_ok());
    }

    #[tokio::test]
    async fn hub_lag_desyncs_every_key_stream() {
        let hub = EventHub::new(2);
        let sync = synchronizer(&hub);
        let mut one = sync.get_sync_stream(&1).unwrap();
        let mut two = sync.get_sync_stream(&2).unwrap();

        // published before the dispatcher runs, so its hub receiver overflows
        for id in 1..=5_i64 {
            hub.publish(ChangeEvent::upsert("rows", doc! { "_id": id, "label": "x" }));
        }

        assert_eq!(next(&mut one).await.unwrap_err(), SyncError::Lagged(3));
        assert_eq!(next(&mut two).await.unwrap_err(), SyncError::Lagged(3));

        // not terminal, keys can be followed again
        assert_eq!(sync.active_streams(), 2);
        let mut again = sync.get_sync_stream(&1).unwrap();
        hub.publish(ChangeEvent::upsert("rows", doc! { "_id": 1_i64, "label": "y" }));
        assert_eq!(next(&mut again).await.unwrap().unwrap().label, "y");
    }

    #[tokio::test]
    async fn hub_failure_reaches_every_key_stream() {
        use futures::channel::mpsc;

        let hub = EventHub::new(16);
        let (feed, rx) = mpsc::unbounded();
        hub.initialize(rx).unwrap();
        let sync = synchronizer(&hub);
        let mut one = sync.get_sync_stream(&1).unwrap();
        let mut two = sync.get_sync_stream(&2).unwrap();

        feed.unbounded_send(Err(crate::sync::FeedError::Disconnected("gone".into())))
            .unwrap();

        let expected = SyncError::TransportClosed("gone".into());
        assert_eq!(next(&mut one).await.unwrap_err(), expected);
        assert_eq!(next(&mut two).await.unwrap_err(), expected);
        assert_eq!(sync.get_sync_stream(&3).unwrap_err(), expected);
    }
}
