//! Process-wide change event hub.
//!
//! Receives the store's change feed and broadcasts each event to the
//! subscribers of its record type. No filtering, no replay.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures::{Stream, StreamExt};
use mongodb::bson::{Bson, Document};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::{FeedError, SyncError};

/// A committed mutation, as reported by the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Full document after an insert, update or replace.
    Upsert(Document),
    /// The `_id` of a deleted document.
    Delete(Bson),
}

/// A change tagged with its record type (the collection name).
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub record_type: String,
    pub change: Change,
}

impl ChangeEvent {
    pub fn upsert(record_type: impl Into<String>, document: Document) -> Self {
        Self {
            record_type: record_type.into(),
            change: Change::Upsert(document),
        }
    }

    pub fn delete(record_type: impl Into<String>, id: impl Into<Bson>) -> Self {
        Self {
            record_type: record_type.into(),
            change: Change::Delete(id.into()),
        }
    }
}

/// Item delivered to hub subscribers. `Err` is terminal.
pub type HubItem = Result<Arc<Change>, SyncError>;

struct HubState {
    channels: HashMap<String, broadcast::Sender<HubItem>>,
    terminal: Option<SyncError>,
    connected: bool,
}

/// Broadcaster of store change events, one per process.
pub struct EventHub {
    state: Mutex<HubState>,
    capacity: usize,
    closed: watch::Sender<Option<SyncError>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl EventHub {
    /// Create a hub whose per-type channels buffer `capacity` events.
    pub fn new(capacity: usize) -> Arc<Self> {
        let (closed, _) = watch::channel(None);
        Arc::new(Self {
            state: Mutex::new(HubState {
                channels: HashMap::new(),
                terminal: None,
                connected: false,
            }),
            capacity: capacity.max(1),
            closed,
            pump: Mutex::new(None),
        })
    }

    /// Attach the change feed transport and start pumping events.
    ///
    /// Only one feed may ever be attached to a hub.
    pub fn initialize<F>(self: &Arc<Self>, feed: F) -> Result<(), SyncError>
    where
        F: Stream<Item = Result<ChangeEvent, FeedError>> + Send + 'static,
    {
        {
            let mut state = self.state.lock();
            if let Some(err) = &state.terminal {
                return Err(err.clone());
            }
            if state.connected {
                return Err(SyncError::AlreadyInitialized);
            }
            state.connected = true;
        }

        let handle = tokio::spawn(pump(Arc::downgrade(self), feed));
        *self.pump.lock() = Some(handle);
        info!("Event hub attached to change feed");
        Ok(())
    }

    /// Deliver an event to the current subscribers of its record type.
    pub fn publish(&self, event: ChangeEvent) {
        let mut state = self.state.lock();
        if state.terminal.is_some() {
            return;
        }

        let Some(sender) = state.channels.get(&event.record_type) else {
            trace!("No subscribers for {}, event dropped", event.record_type);
            return;
        };

        if sender.send(Ok(Arc::new(event.change))).is_err() {
            // every receiver is gone
            state.channels.remove(&event.record_type);
            trace!("Pruned idle channel for {}", event.record_type);
        }
    }

    /// Subscribe to the events of one record type.
    ///
    /// Fails once the hub has terminated.
    pub fn subscribe(&self, record_type: &str) -> Result<broadcast::Receiver<HubItem>, SyncError> {
        let mut state = self.state.lock();
        if let Some(err) = &state.terminal {
            return Err(err.clone());
        }

        let capacity = self.capacity;
        let sender = state
            .channels
            .entry(record_type.to_string())
            .or_insert_with(|| broadcast::channel(capacity).0);

        debug!("New hub subscriber for {}", record_type);
        Ok(sender.subscribe())
    }

    /// Whether the hub has reached its terminal state.
    pub fn is_closed(&self) -> bool {
        self.state.lock().terminal.is_some()
    }

    /// Wait until the hub terminates, returning the reason.
    pub async fn closed(&self) -> SyncError {
        let mut rx = self.closed.subscribe();
        loop {
            if let Some(err) = rx.borrow_and_update().clone() {
                return err;
            }
            if rx.changed().await.is_err() {
                return SyncError::ShutDown;
            }
        }
    }

    /// Detach the transport and close every channel.
    ///
    /// Subscribers see their stream end without an error.
    pub fn shutdown(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }

        let channels = {
            let mut state = self.state.lock();
            if state.terminal.is_some() {
                return;
            }
            state.terminal = Some(SyncError::ShutDown);
            std::mem::take(&mut state.channels)
        };
        drop(channels);

        info!("Event hub shut down");
        self.closed.send_replace(Some(SyncError::ShutDown));
    }

    /// Enter the terminal state and push `err` to every subscriber.
    fn fail(&self, err: SyncError) {
        let channels = {
            let mut state = self.state.lock();
            if state.terminal.is_some() {
                return;
            }
            state.terminal = Some(err.clone());
            std::mem::take(&mut state.channels)
        };

        error!("Event hub terminated: {}", err);
        for (record_type, sender) in channels {
            if sender.send(Err(err.clone())).is_err() {
                trace!("No live subscribers for {} at termination", record_type);
            }
        }

        self.closed.send_replace(Some(err));
    }
}

impl Drop for EventHub {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("EventHub")
            .field("channels", &state.channels.keys().collect::<Vec<_>>())
            .field("terminal", &state.terminal)
            .finish()
    }
}

async fn pump<F>(hub: Weak<EventHub>, feed: F)
where
    F: Stream<Item = Result<ChangeEvent, FeedError>> + Send + 'static,
{
    let mut feed = Box::pin(feed);

    let reason = loop {
        let item = feed.next().await;
        let Some(live) = hub.upgrade() else {
            return;
        };

        match item {
            Some(Ok(event)) => live.publish(event),
            Some(Err(FeedError::Malformed(reason))) => {
                warn!("Dropping malformed change event: {}", reason);
            }
            Some(Err(FeedError::Disconnected(reason))) => break reason,
            None => break "change feed ended".to_string(),
        }
    };

    if let Some(live) = hub.upgrade() {
        live.fail(SyncError::TransportClosed(reason));
    }
}
