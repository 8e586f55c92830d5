//! Entity wrapper - a tracked handle to one stored record.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::sync::{SyncError, SyncStream};

type UntrackedCallback = Box<dyn FnOnce() + Send>;

/// Handle to a stored record (or its absence).
///
/// A wrapper is *tracked* until `evict()` is called once; after that its value is
/// frozen and every `on_untracked` callback has run exactly once.
///
/// Wrappers built with [`EntityWrapper::synced`] also follow a change stream and
/// adopt every value that differs from the current one.
///
/// Cloning is cheap and shares the same underlying state.
pub struct EntityWrapper<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for EntityWrapper<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T> {
    state: Mutex<State<T>>,
    changes: broadcast::Sender<Option<T>>,
    untracked: watch::Sender<bool>,
    sync_task: Mutex<Option<JoinHandle<()>>>,
    sync_error: Mutex<Option<SyncError>>,
}

struct State<T> {
    value: Option<T>,
    tracked: bool,
    on_untracked: Vec<UntrackedCallback>,
}

#[derive(Debug, PartialEq, Eq)]
enum Merge {
    Changed,
    Unchanged,
    Untracked,
}

impl<T> EntityWrapper<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Wrapper that only changes through `update()`.
    pub fn detached(value: Option<T>) -> Self {
        let (changes, _) = broadcast::channel(16);
        let (untracked, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    value,
                    tracked: true,
                    on_untracked: Vec::new(),
                }),
                changes,
                untracked,
                sync_task: Mutex::new(None),
                sync_error: Mutex::new(None),
            }),
        }
    }

    /// Wrapper that also merges values arriving on `stream`.
    pub fn synced(value: Option<T>, stream: SyncStream<T>) -> Self {
        let wrapper = Self::detached(value);
        let task = tokio::spawn(follow(Arc::downgrade(&wrapper.inner), stream));
        *wrapper.inner.sync_task.lock() = Some(task);
        wrapper
    }

    /// Snapshot of the current value.
    pub fn value(&self) -> Option<T> {
        self.inner.state.lock().value.clone()
    }

    pub fn is_tracked(&self) -> bool {
        self.inner.state.lock().tracked
    }

    /// Receive every future value change, in order.
    pub fn changes(&self) -> broadcast::Receiver<Option<T>> {
        self.inner.changes.subscribe()
    }

    /// Apply a locally made change.
    ///
    /// Returns `true` if the value actually changed. Ignored once evicted.
    pub fn update(&self, value: Option<T>) -> bool {
        self.inner.merge(value) == Merge::Changed
    }

    /// Stop tracking. Returns `true` only for the call that evicted.
    pub fn evict(&self) -> bool {
        self.inner.evict()
    }

    /// Run `callback` once this wrapper is evicted (immediately if it already is).
    pub fn on_untracked<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.inner.state.lock();
            if state.tracked {
                state.on_untracked.push(Box::new(callback));
                return;
            }
        }
        callback();
    }

    /// Resolves once the wrapper has been evicted.
    pub async fn untracked(&self) {
        let mut rx = self.inner.untracked.subscribe();
        let _ = rx.wait_for(|evicted| *evicted).await;
    }

    /// The terminal sync error that evicted this wrapper, if any.
    pub fn sync_error(&self) -> Option<SyncError> {
        self.inner.sync_error.lock().clone()
    }

    /// Whether both handles point at the same wrapper.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Clone + PartialEq> Inner<T> {
    fn merge(&self, value: Option<T>) -> Merge {
        let mut state = self.state.lock();
        if !state.tracked {
            return Merge::Untracked;
        }
        if state.value == value {
            return Merge::Unchanged;
        }

        state.value = value.clone();
        // sent under the lock so listeners see commit order
        let _ = self.changes.send(value);
        Merge::Changed
    }

    fn evict(&self) -> bool {
        let callbacks = {
            let mut state = self.state.lock();
            if !state.tracked {
                return false;
            }
            state.tracked = false;
            std::mem::take(&mut state.on_untracked)
        };

        if let Some(task) = self.sync_task.lock().take() {
            task.abort();
        }
        for callback in callbacks {
            callback();
        }

        self.untracked.send_replace(true);
        true
    }
}

async fn follow<T>(inner: Weak<Inner<T>>, mut stream: SyncStream<T>)
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    loop {
        let item = stream.recv().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };

        match item {
            Ok(Ok(value)) => {
                if inner.merge(value) == Merge::Untracked {
                    return;
                }
            }
            Ok(Err(err)) => {
                warn!("Evicting entity after sync failure: {}", err);
                *inner.sync_error.lock() = Some(err);
                inner.evict();
                return;
            }
            Err(RecvError::Lagged(missed)) => {
                warn!("Entity wrapper lagged, {} updates skipped", missed);
            }
            Err(RecvError::Closed) => {
                debug!("Sync stream closed, entity no longer follows the store");
                return;
            }
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for EntityWrapper<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("EntityWrapper")
            .field("value", &state.value)
            .field("tracked", &state.tracked)
            .finish()
    }
}
