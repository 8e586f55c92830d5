use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use mongodb::bson::oid::ObjectId;
use tracing::{debug, info, warn};

use super::{InteractionPayload, InteractionRecord, TriggerKey, TriggerListeners};
use crate::database::{RecordStore, StoreError};
use crate::entity::{CacheError, CacheManager, EntityWrapper};
use crate::sync::Synchronizer;

/// Follow-up logic of a command, run when one of its triggers fires.
pub trait Continuation<P: InteractionPayload>: Send + Sync + 'static {
    fn resume(
        &self,
        interaction: Interaction<P>,
        trigger: TriggerKey,
    ) -> BoxFuture<'static, anyhow::Result<()>>;
}

/// Lifecycle of an interaction. Only `Pending` can be claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Pending = 0,
    Resolving = 1,
    Resolved = 2,
    Expired = 3,
    /// Evicted by something other than resolution or expiry.
    Abandoned = 4,
}

impl From<u8> for Phase {
    fn from(value: u8) -> Self {
        match value {
            0 => Phase::Pending,
            1 => Phase::Resolving,
            2 => Phase::Resolved,
            3 => Phase::Expired,
            _ => Phase::Abandoned,
        }
    }
}

trait Backend<P: InteractionPayload>: Send + Sync + 'static {
    fn save(&self, record: InteractionRecord<P>) -> BoxFuture<'_, Result<(), StoreError>>;
    fn remove(&self, id: ObjectId) -> BoxFuture<'_, ()>;
    fn listeners(&self) -> &TriggerListeners;
    fn continuation(&self) -> Arc<dyn Continuation<P>>;
}

struct Shared<P: InteractionPayload, S> {
    store: Arc<S>,
    manager: CacheManager<InteractionRecord<P>, S>,
    listeners: TriggerListeners,
    continuation: Arc<dyn Continuation<P>>,
}

impl<P, S> Backend<P> for Shared<P, S>
where
    P: InteractionPayload,
    S: RecordStore<InteractionRecord<P>>,
{
    fn save(&self, record: InteractionRecord<P>) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move { self.store.upsert(&record).await })
    }

    fn remove(&self, id: ObjectId) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            match self.store.delete(&id).await {
                Ok(true) => debug!("Deleted interaction {}", id),
                Ok(false) => debug!("Interaction {} was already gone", id),
                Err(e) => warn!("Failed to delete interaction {}: {}", id, e),
            }
        })
    }

    fn listeners(&self) -> &TriggerListeners {
        &self.listeners
    }

    fn continuation(&self) -> Arc<dyn Continuation<P>> {
        Arc::clone(&self.continuation)
    }
}

/// Handle to one pending interaction.
pub struct Interaction<P: InteractionPayload> {
    inner: Arc<InteractionInner<P>>,
}

struct InteractionInner<P: InteractionPayload> {
    id: ObjectId,
    expires_at: DateTime<Utc>,
    wrapper: EntityWrapper<InteractionRecord<P>>,
    phase: Arc<AtomicU8>,
    backend: Arc<dyn Backend<P>>,
}

impl<P: InteractionPayload> Clone for Interaction<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: InteractionPayload> Interaction<P> {
    pub fn id(&self) -> ObjectId {
        self.inner.id
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.inner.expires_at
    }

    pub fn phase(&self) -> Phase {
        Phase::from(self.inner.phase.load(Ordering::SeqCst))
    }

    pub fn is_pending(&self) -> bool {
        self.phase() == Phase::Pending
    }

    pub fn record(&self) -> Option<InteractionRecord<P>> {
        self.inner.wrapper.value()
    }

    pub fn payload(&self) -> Option<P> {
        self.record().map(|record| record.payload)
    }

    /// Wait until the interaction is resolved, expired or otherwise evicted.
    pub async fn untracked(&self) {
        self.inner.wrapper.untracked().await
    }

    /// Persist `keys` as triggers of this interaction and start listening.
    ///
    /// Listening on a settled interaction is a no-op.
    pub async fn listen<I>(&self, keys: I) -> Result<(), CacheError>
    where
        I: IntoIterator<Item = TriggerKey>,
    {
        let keys: Vec<TriggerKey> = keys.into_iter().collect();
        let Some(mut record) = self.record() else {
            return Ok(());
        };
        if !self.is_pending() {
            return Ok(());
        }

        record.triggers.extend(keys.iter().cloned());
        self.inner.backend.save(record.clone()).await?;

        match self.phase() {
            Phase::Pending => {
                self.inner.wrapper.update(Some(record));
                self.attach(keys);
            }
            // settled while saving, and the save may have revived a deleted row
            Phase::Resolved | Phase::Expired => self.inner.backend.remove(self.id()).await,
            // the resolver deletes after us, an abandoned row is kept
            Phase::Resolving | Phase::Abandoned => {}
        }
        Ok(())
    }

    /// Resolve with `trigger`, running the continuation.
    ///
    /// Returns `false` if the interaction was already resolving, resolved,
    /// expired or evicted; nothing runs in that case.
    pub async fn resolve(&self, trigger: TriggerKey) -> bool {
        if !self.claim(Phase::Resolving) {
            debug!(
                "Interaction {} is {:?}, ignoring {:?}",
                self.id(),
                self.phase(),
                trigger
            );
            return false;
        }

        debug!("Resolving interaction {} with {:?}", self.id(), trigger);
        let continuation = self.inner.backend.continuation();
        if let Err(e) = continuation.resume(self.clone(), trigger).await {
            warn!("Continuation of interaction {} failed: {:#}", self.id(), e);
        }

        self.inner
            .phase
            .store(Phase::Resolved as u8, Ordering::SeqCst);
        self.inner.wrapper.evict();
        self.inner.backend.remove(self.id()).await;
        true
    }

    async fn expire(&self) {
        if !self.claim(Phase::Expired) {
            return;
        }

        info!("Interaction {} expired", self.id());
        self.inner.wrapper.evict();
        self.inner.backend.remove(self.id()).await;
    }

    fn claim(&self, to: Phase) -> bool {
        self.inner
            .phase
            .compare_exchange(
                Phase::Pending as u8,
                to as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Register listeners for `keys`, detached again once the entry is untracked.
    fn attach(&self, keys: Vec<TriggerKey>) {
        if keys.is_empty() {
            return;
        }

        let listeners = self.inner.backend.listeners().clone();
        for key in &keys {
            let weak = Arc::downgrade(&self.inner);
            listeners.attach(key.clone(), move |trigger| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        Interaction { inner }.resolve(trigger).await;
                    }
                }
                .boxed()
            });
        }

        self.inner.wrapper.on_untracked(move || {
            for key in &keys {
                listeners.detach(key);
            }
        });
    }
}

impl<P: InteractionPayload> std::fmt::Debug for Interaction<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interaction")
            .field("id", &self.inner.id)
            .field("command", &P::COMMAND)
            .field("expires_at", &self.inner.expires_at)
            .field("phase", &self.phase())
            .finish()
    }
}

/// Cache of pending interactions of one command.
pub struct InteractionCache<P: InteractionPayload, S> {
    shared: Arc<Shared<P, S>>,
}

impl<P: InteractionPayload, S> Clone for InteractionCache<P, S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P, S> InteractionCache<P, S>
where
    P: InteractionPayload,
    S: RecordStore<InteractionRecord<P>>,
{
    pub fn new(
        store: Arc<S>,
        synchronizer: Arc<Synchronizer<InteractionRecord<P>, ObjectId>>,
        listeners: TriggerListeners,
        continuation: Arc<dyn Continuation<P>>,
    ) -> Self {
        let manager = CacheManager::new(Arc::clone(&store), synchronizer);
        Self {
            shared: Arc::new(Shared {
                store,
                manager,
                listeners,
                continuation,
            }),
        }
    }

    /// Store a new interaction expiring at `deadline` and start its timer.
    pub async fn create(
        &self,
        deadline: DateTime<Utc>,
        payload: P,
    ) -> Result<Interaction<P>, CacheError> {
        let record = InteractionRecord::new(deadline, payload);
        let id = record.id;
        self.shared.store.upsert(&record).await?;

        match self.arm(record) {
            Ok(interaction) => {
                debug!("Created {} interaction {}", P::COMMAND, id);
                Ok(interaction)
            }
            Err(e) => {
                self.shared.remove(id).await;
                Err(e)
            }
        }
    }

    /// Re-arm every stored interaction, dropping the ones already past
    /// their deadline. Returns how many were restored.
    pub async fn restore(&self) -> Result<usize, CacheError> {
        let now = Utc::now();
        let mut restored = 0;

        for record in self.shared.store.find_all().await? {
            if record.is_expired(now) {
                debug!("Dropping stale interaction {}", record.id);
                self.shared.remove(record.id).await;
                continue;
            }

            let triggers = record.triggers.clone();
            let interaction = self.arm(record)?;
            interaction.attach(triggers);
            restored += 1;
        }

        if restored > 0 {
            info!("Restored {} pending {} interactions", restored, P::COMMAND);
        }
        Ok(restored)
    }

    pub fn listeners(&self) -> &TriggerListeners {
        &self.shared.listeners
    }

    /// Re-arm `id` from its stored row after its entry was dropped while
    /// still pending. Fails quietly when sync is gone for good, leaving the
    /// row to the next `restore()`.
    async fn recover(&self, id: ObjectId) {
        let record = match self.shared.store.find_by_key(&id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!("Interaction {} is gone, nothing to recover", id);
                return;
            }
            Err(e) => {
                warn!("Could not reload interaction {}: {}", id, e);
                return;
            }
        };

        if record.is_expired(Utc::now()) {
            self.shared.remove(id).await;
            return;
        }

        let triggers = record.triggers.clone();
        match self.arm(record) {
            Ok(interaction) => {
                interaction.attach(triggers);
                info!("Re-armed interaction {} after losing sync", id);
            }
            Err(e) => debug!("Interaction {} left for restore: {}", id, e),
        }
    }

    pub fn len(&self) -> usize {
        self.shared.manager.len()
    }

    fn arm(&self, record: InteractionRecord<P>) -> Result<Interaction<P>, CacheError> {
        let id = record.id;
        let expires_at = record.expires_at;
        let wrapper = self.shared.manager.insert(id, Some(record))?;

        let backend: Arc<dyn Backend<P>> = self.shared.clone();
        let interaction = Interaction {
            inner: Arc::new(InteractionInner {
                id,
                expires_at,
                wrapper: wrapper.clone(),
                phase: Arc::new(AtomicU8::new(Phase::Pending as u8)),
                backend,
            }),
        };

        let timer = tokio::spawn({
            let interaction = interaction.clone();
            async move {
                let remaining = (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(remaining).await;
                interaction.expire().await;
            }
        });

        let phase = Arc::clone(&interaction.inner.phase);
        let timer = timer.abort_handle();
        let shared = Arc::downgrade(&self.shared);
        wrapper.on_untracked(move || {
            let abandoned = phase
                .compare_exchange(
                    Phase::Pending as u8,
                    Phase::Abandoned as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok();
            // The expiry path evicts from inside the timer task itself.
            if Phase::from(phase.load(Ordering::SeqCst)) != Phase::Expired {
                timer.abort();
            }

            if abandoned {
                if let Some(shared) = shared.upgrade() {
                    tokio::spawn(async move { InteractionCache { shared }.recover(id).await });
                }
            }
        });

        Ok(interaction)
    }
}

impl<P: InteractionPayload, S> std::fmt::Debug for InteractionCache<P, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractionCache")
            .field("command", &P::COMMAND)
            .field("listeners", &self.shared.listeners)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use futures::channel::mpsc;
    use serde::{Deserialize, Serialize};

    use crate::database::MemoryStore;
    use crate::database::memory::FeedSender;
    use crate::sync::{ChangeEvent, EventHub, FeedError};

    type FeedReceiver = mpsc::UnboundedReceiver<Result<ChangeEvent, FeedError>>;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Probe {
        target: u64,
    }

    impl InteractionPayload for Probe {
        const COMMAND: &'static str = "probe";
        const COLLECTION: &'static str = "probe_interactions";
    }

    struct Recorder {
        calls: Arc<AtomicUsize>,
        actions: Arc<parking_lot::Mutex<Vec<String>>>,
        delay: Duration,
    }

    impl Continuation<Probe> for Recorder {
        fn resume(
            &self,
            interaction: Interaction<Probe>,
            trigger: TriggerKey,
        ) -> BoxFuture<'static, anyhow::Result<()>> {
            let calls = Arc::clone(&self.calls);
            let actions = Arc::clone(&self.actions);
            let delay = self.delay;
            Box::pin(async move {
                assert_eq!(interaction.payload(), Some(Probe { target: 7 }));
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                actions.lock().push(trigger.action);
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    type Store = MemoryStore<InteractionRecord<Probe>>;

    struct Fixture {
        feed: FeedSender,
        hub: Arc<EventHub>,
        store: Arc<Store>,
        listeners: TriggerListeners,
        cache: InteractionCache<Probe, Store>,
        calls: Arc<AtomicUsize>,
        actions: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    fn build(
        feed: FeedSender,
        rx: FeedReceiver,
        store: Store,
        delay: Duration,
        capacity: usize,
    ) -> Fixture {
        let hub = EventHub::new(capacity);
        hub.initialize(rx).unwrap();
        let sync = Arc::new(Synchronizer::for_record(Arc::clone(&hub)));
        sync.initialize().unwrap();

        let store = Arc::new(store);
        let listeners = TriggerListeners::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let actions = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let continuation = Arc::new(Recorder {
            calls: Arc::clone(&calls),
            actions: Arc::clone(&actions),
            delay,
        });
        let cache =
            InteractionCache::new(Arc::clone(&store), sync, listeners.clone(), continuation);

        Fixture {
            feed,
            hub,
            store,
            listeners,
            cache,
            calls,
            actions,
        }
    }

    fn fixture(delay: Duration) -> Fixture {
        fixture_sized(delay, 64)
    }

    /// Fixture whose hub buffers only `capacity` events per record type.
    fn fixture_sized(delay: Duration, capacity: usize) -> Fixture {
        let (feed, rx) = mpsc::unbounded();
        let store = MemoryStore::with_feed(feed.clone());
        build(feed, rx, store, delay, capacity)
    }

    /// Fixture over rows written before the cache existed.
    fn fixture_with(store: Store) -> Fixture {
        let (feed, rx) = mpsc::unbounded();
        build(feed, rx, store, Duration::ZERO, 64)
    }

    fn key(action: &str) -> TriggerKey {
        TriggerKey {
            chat_id: 42,
            message_id: 100,
            user_id: 7,
            action: action.to_string(),
        }
    }

    fn minutes(n: u64) -> Duration {
        Duration::from_secs(n * 60)
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    fn deadline_in(n: i64) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::minutes(n)
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_once_and_cancels_timer() {
        let f = fixture(Duration::ZERO);
        let interaction = f.cache.create(deadline_in(15), Probe { target: 7 }).await.unwrap();
        interaction.listen([key("accept"), key("reject")]).await.unwrap();
        assert_eq!(f.store.get(&interaction.id()).unwrap().triggers.len(), 2);

        tokio::time::advance(minutes(5)).await;
        assert!(f.listeners.dispatch(key("accept")).await);

        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
        assert_eq!(interaction.phase(), Phase::Resolved);
        assert!(f.store.get(&interaction.id()).is_none());
        assert_eq!(f.store.deletes(), 1);
        assert_eq!(f.listeners.len(), 0);
        assert!(!f.listeners.dispatch(key("reject")).await);

        tokio::time::advance(minutes(15)).await;
        settle().await;
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.store.deletes(), 1);
        assert_eq!(*f.actions.lock(), vec!["accept".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn expires_at_deadline_without_running_handler() {
        let f = fixture(Duration::ZERO);
        let interaction = f.cache.create(deadline_in(15), Probe { target: 7 }).await.unwrap();
        interaction.listen([key("accept")]).await.unwrap();

        tokio::time::advance(minutes(15) + Duration::from_secs(1)).await;
        settle().await;

        assert_eq!(interaction.phase(), Phase::Expired);
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.store.deletes(), 1);
        assert!(f.store.get(&interaction.id()).is_none());
        assert_eq!(f.listeners.len(), 0);
        assert!(!interaction.resolve(key("accept")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_triggers_resolve_once() {
        let f = fixture(Duration::from_secs(1));
        let interaction = f.cache.create(deadline_in(15), Probe { target: 7 }).await.unwrap();

        let (first, second) = tokio::join!(
            interaction.resolve(key("accept")),
            interaction.resolve(key("reject")),
        );

        assert!(first ^ second);
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.store.deletes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_during_handler_is_ignored() {
        let f = fixture(minutes(20));
        let interaction = f.cache.create(deadline_in(15), Probe { target: 7 }).await.unwrap();

        let resolving = tokio::spawn({
            let interaction = interaction.clone();
            async move { interaction.resolve(key("accept")).await }
        });
        settle().await;
        assert_eq!(interaction.phase(), Phase::Resolving);

        assert!(resolving.await.unwrap());
        assert_eq!(interaction.phase(), Phase::Resolved);
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.store.deletes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restore_rearms_pending_and_drops_stale() {
        let store = MemoryStore::new();
        let mut pending = InteractionRecord::new(deadline_in(10), Probe { target: 7 });
        pending.triggers.push(key("accept"));
        let stale = InteractionRecord::new(deadline_in(-1), Probe { target: 7 });
        store.upsert(&pending).await.unwrap();
        store.upsert(&stale).await.unwrap();

        let f = fixture_with(store);
        assert_eq!(f.cache.restore().await.unwrap(), 1);
        assert!(f.store.get(&stale.id).is_none());
        assert!(f.store.get(&pending.id).is_some());

        assert!(f.listeners.dispatch(key("accept")).await);
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
        assert!(f.store.get(&pending.id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn restored_interaction_still_expires() {
        let store = MemoryStore::new();
        let pending = InteractionRecord::new(deadline_in(10), Probe { target: 7 });
        store.upsert(&pending).await.unwrap();

        let f = fixture_with(store);
        f.cache.restore().await.unwrap();

        tokio::time::advance(minutes(11)).await;
        settle().await;
        assert!(f.store.get(&pending.id).is_none());
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_feed_abandons_but_keeps_row() {
        let f = fixture(Duration::ZERO);
        let interaction = f.cache.create(deadline_in(15), Probe { target: 7 }).await.unwrap();
        interaction.listen([key("accept")]).await.unwrap();
        settle().await;

        f.feed
            .unbounded_send(Err(FeedError::Disconnected("replica set gone".into())))
            .unwrap();
        settle().await;
        settle().await;

        assert_eq!(interaction.phase(), Phase::Abandoned);
        assert!(f.store.get(&interaction.id()).is_some());
        assert_eq!(f.listeners.len(), 0);
        assert!(!f.listeners.dispatch(key("accept")).await);

        // the deadline passing later must not delete the row either
        tokio::time::advance(minutes(16)).await;
        settle().await;
        assert!(f.store.get(&interaction.id()).is_some());
        assert_eq!(f.store.deletes(), 0);
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hub_lag_rearms_pending_interaction() {
        let f = fixture_sized(Duration::ZERO, 2);
        let interaction = f.cache.create(deadline_in(15), Probe { target: 7 }).await.unwrap();
        interaction.listen([key("accept")]).await.unwrap();
        settle().await;

        for _ in 0..5 {
            let other = InteractionRecord::new(deadline_in(15), Probe { target: 8 });
            let document = mongodb::bson::to_document(&other).unwrap();
            f.hub.publish(ChangeEvent::upsert(Probe::COLLECTION, document));
        }
        settle().await;
        settle().await;

        assert_eq!(interaction.phase(), Phase::Abandoned);
        assert_eq!(f.cache.len(), 1);
        assert_eq!(f.listeners.len(), 1);

        assert!(f.listeners.dispatch(key("accept")).await);
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
        assert!(f.store.get(&interaction.id()).is_none());
        assert_eq!(f.store.deletes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn listen_racing_expiry_leaves_no_row() {
        let f = fixture(Duration::ZERO);
        let interaction = f.cache.create(deadline_in(1), Probe { target: 7 }).await.unwrap();
        f.store.set_write_delay(minutes(2));

        // the deadline passes while the trigger save is still in flight
        interaction.listen([key("accept")]).await.unwrap();

        assert_eq!(interaction.phase(), Phase::Expired);
        assert!(f.store.get(&interaction.id()).is_none());
        assert_eq!(f.listeners.len(), 0);
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_create_leaves_nothing_armed() {
        let f = fixture(Duration::ZERO);
        f.store.set_failing(true);

        let result = f.cache.create(deadline_in(15), Probe { target: 7 }).await;
        assert!(matches!(result, Err(CacheError::Store(_))));
        assert_eq!(f.cache.len(), 0);
    }
}
