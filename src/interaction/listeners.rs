//! Side-listener registry for interaction triggers.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tracing::{debug, trace};

use super::TriggerKey;

type Listener = Arc<dyn Fn(TriggerKey) -> BoxFuture<'static, ()> + Send + Sync>;

/// Maps trigger keys to the interaction waiting for them.
///
/// Shared by every interaction cache; the gateway feeds it through `dispatch`.
#[derive(Clone, Default)]
pub struct TriggerListeners {
    listeners: Arc<DashMap<TriggerKey, Listener>>,
}

impl TriggerListeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a listener, replacing any previous one for `key`.
    pub fn attach<F>(&self, key: TriggerKey, listener: F)
    where
        F: Fn(TriggerKey) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        trace!("Listening for {:?}", key);
        self.listeners.insert(key, Arc::new(listener));
    }

    pub fn detach(&self, key: &TriggerKey) -> bool {
        let removed = self.listeners.remove(key).is_some();
        if removed {
            trace!("Stopped listening for {:?}", key);
        }
        removed
    }

    /// Run the listener for `key`. Returns `false` if nobody listens.
    pub async fn dispatch(&self, key: TriggerKey) -> bool {
        let listener = self
            .listeners
            .get(&key)
            .map(|entry| Arc::clone(entry.value()));

        match listener {
            Some(listener) => {
                listener(key).await;
                true
            }
            None => {
                debug!("No listener for {:?}", key);
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }
}

impl std::fmt::Debug for TriggerListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerListeners")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
