use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use shared::{domain::UserId, protocol::PresenceRecord};
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod config;
pub mod error;
pub mod event_bus;
pub mod http;
pub mod interest;
mod notifier;
pub mod store;
pub mod timer;
pub mod transport;
pub mod ws;

pub use config::{load_settings, load_settings_from, PresenceSettings};
pub use error::PresenceError;
pub use event_bus::{Delivery, EventBus, Handler, ListenerId};
pub use http::HttpPresenceFetcher;
pub use interest::{Cycle, InterestTracker, Phase};
pub use store::PresenceStore;
pub use timer::DebounceTimer;
pub use transport::{
    MissingPresenceFetcher, MissingPresenceSubscription, PresenceFetcher, PresenceSubscription,
};
pub use ws::{http_to_ws_url, WsPresenceChannel};

use notifier::Notification;

/// Observer callback. `None` means the presence of that user is unknown
/// again (connection reset).
pub type PresenceHandler = Handler<Option<PresenceRecord>>;

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    Updated { id: UserId, record: PresenceRecord },
    Removed(UserId),
    Reset,
    Restart,
}

pub(crate) struct PresenceState {
    store: PresenceStore,
    bus: EventBus<UserId, Option<PresenceRecord>>,
    tracker: InterestTracker,
    timer: DebounceTimer,
    awaiting_restart: Option<BTreeSet<UserId>>,
}

/// Client-side presence cache.
///
/// Observers `listen` to a user; the first observer of an uncached user
/// queues it for a debounced batch fetch and for the live subscription.
/// Observers leave through `stop`, which only takes effect after a grace
/// period so a quick re-listen does not churn the server subscription.
pub struct Presence {
    settings: PresenceSettings,
    fetcher: Arc<dyn PresenceFetcher>,
    subscription: Arc<dyn PresenceSubscription>,
    inner: Mutex<PresenceState>,
    /// Taken before `inner` is released and held while observers run, so
    /// deliveries reach them in the order the state changed.
    delivery_order: Mutex<()>,
    events: broadcast::Sender<PresenceEvent>,
}

impl Presence {
    pub fn new(settings: PresenceSettings) -> Arc<Self> {
        Self::new_with_dependencies(
            settings,
            Arc::new(MissingPresenceFetcher),
            Arc::new(MissingPresenceSubscription),
        )
    }

    pub fn new_with_dependencies(
        settings: PresenceSettings,
        fetcher: Arc<dyn PresenceFetcher>,
        subscription: Arc<dyn PresenceSubscription>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        let tracker = InterestTracker::new(settings.debounce(), settings.max_backoff());
        Arc::new(Self {
            settings,
            fetcher,
            subscription,
            inner: Mutex::new(PresenceState {
                store: PresenceStore::new(),
                bus: EventBus::new(),
                tracker,
                timer: DebounceTimer::new(),
                awaiting_restart: None,
            }),
            delivery_order: Mutex::new(()),
            events,
        })
    }

    pub fn settings(&self) -> &PresenceSettings {
        &self.settings
    }

    /// Registers `handler` for `id`. Returns `None` for a blank identifier.
    ///
    /// A cached user only gets future updates; an uncached one is queued
    /// for resolution and the handler receives the fetched record.
    pub async fn listen<F>(
        self: &Arc<Self>,
        id: impl Into<UserId>,
        handler: F,
    ) -> Option<ListenerId>
    where
        F: Fn(Option<PresenceRecord>) + Send + Sync + 'static,
    {
        self.listen_handler(id.into(), Arc::new(handler)).await
    }

    pub async fn listen_handler(
        self: &Arc<Self>,
        id: UserId,
        handler: PresenceHandler,
    ) -> Option<ListenerId> {
        if id.is_empty() {
            return None;
        }
        let mut guard = self.inner.lock().await;
        Some(self.register_locked(&mut guard, id, handler))
    }

    /// Drops `listener` after the release grace period. If no observer of
    /// `id` is left by then, the cached record is evicted and the user is
    /// released from the live subscription.
    pub fn stop(self: &Arc<Self>, id: impl Into<UserId>, listener: ListenerId) {
        let id = id.into();
        if id.is_empty() {
            return;
        }

        let presence = Arc::clone(self);
        let grace = self.settings.release_grace();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut guard = presence.inner.lock().await;
            guard.bus.off(&id, listener);
            presence.dispatch_control(&mut guard, PresenceEvent::Removed(id));
        });
    }

    /// Resolves the presence of `id` once. Blank identifiers resolve to `None`.
    pub async fn get(self: &Arc<Self>, id: impl Into<UserId>) -> Option<PresenceRecord> {
        self.get_with_cancel(id, CancellationToken::new())
            .await
            .unwrap_or_default()
    }

    /// Like [`Presence::get`], but gives up with [`PresenceError::Cancelled`]
    /// when `cancel` fires first. The temporary observer is handed to
    /// [`Presence::stop`] however the call ends, including when the future
    /// is dropped.
    pub async fn get_with_cancel(
        self: &Arc<Self>,
        id: impl Into<UserId>,
        cancel: CancellationToken,
    ) -> Result<Option<PresenceRecord>, PresenceError> {
        let id = id.into();
        if id.is_empty() {
            return Ok(None);
        }

        let (tx, rx) = oneshot::channel();
        let slot = StdMutex::new(Some(tx));
        let handler: PresenceHandler = Arc::new(move |record: Option<PresenceRecord>| {
            if let Ok(mut slot) = slot.lock() {
                if let Some(tx) = slot.take() {
                    let _ = tx.send(record);
                }
            }
        });

        let _release = {
            let mut guard = self.inner.lock().await;
            if let Some(record) = guard.store.get(&id) {
                return Ok(Some(record.clone()));
            }
            let listener = self.register_locked(&mut guard, id.clone(), handler);
            ReleaseOnDrop {
                presence: Arc::clone(self),
                id,
                listener,
            }
        };

        tokio::select! {
            record = rx => Ok(record.ok().flatten()),
            _ = cancel.cancelled() => Err(PresenceError::Cancelled),
        }
    }

    /// Applies a (possibly partial) record and notifies the observers of
    /// that user with the merged value. Records with a blank id are ignored.
    pub async fn notify(&self, record: PresenceRecord) {
        let (notification, _in_order) = {
            let mut guard = self.inner.lock().await;
            let notification = guard.apply(&record);
            (notification, self.delivery_order.lock().await)
        };
        self.publish(notification);
    }

    /// Drops every cached record and tells all current observers that
    /// presence is unknown. Observed users are re-requested on `restart`.
    pub async fn reset(self: &Arc<Self>) {
        let (deliveries, _in_order) = {
            let mut guard = self.inner.lock().await;
            guard.store.clear();
            let deliveries = self.dispatch_control(&mut guard, PresenceEvent::Reset);
            (deliveries, self.delivery_order.lock().await)
        };
        for delivery in deliveries {
            delivery.deliver();
        }
    }

    pub async fn restart(self: &Arc<Self>) {
        let mut guard = self.inner.lock().await;
        self.dispatch_control(&mut guard, PresenceEvent::Restart);
    }

    pub async fn cached(&self, id: &UserId) -> Option<PresenceRecord> {
        self.inner.lock().await.store.get(id).cloned()
    }

    pub async fn store_snapshot(&self) -> HashMap<UserId, PresenceRecord> {
        self.inner.lock().await.store.snapshot()
    }

    pub async fn phase(&self) -> Phase {
        self.inner.lock().await.tracker.phase()
    }

    pub async fn listened_ids(&self) -> Vec<UserId> {
        let mut ids = self.inner.lock().await.bus.keys();
        ids.sort();
        ids
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }

    fn register_locked(
        self: &Arc<Self>,
        state: &mut PresenceState,
        id: UserId,
        handler: PresenceHandler,
    ) -> ListenerId {
        let listener = state.bus.on(id.clone(), handler);
        if !state.store.has(&id) {
            self.request_interest_locked(state, id);
        }
        listener
    }

    fn request_interest_locked(self: &Arc<Self>, state: &mut PresenceState, id: UserId) {
        debug!(user_id = %id, "presence: interest requested");
        let delay = state.tracker.request_interest(id);
        self.arm_timer(state, delay);
    }

    fn arm_timer(self: &Arc<Self>, state: &mut PresenceState, delay: Duration) {
        let presence = Arc::clone(self);
        state.timer.arm(delay, move |token| async move {
            presence.run_cycle(token, delay).await;
        });
    }

    /// Handles a control event and mirrors it to `subscribe_events`.
    /// Returns the observer deliveries the caller must run once unlocked.
    fn dispatch_control(
        self: &Arc<Self>,
        state: &mut PresenceState,
        event: PresenceEvent,
    ) -> Vec<Delivery<Option<PresenceRecord>>> {
        let mut deliveries = Vec::new();
        match &event {
            PresenceEvent::Removed(id) => {
                if !state.bus.has(id) {
                    state.store.delete(id);
                    debug!(user_id = %id, "presence: last observer gone, releasing");
                    let delay = state.tracker.request_release(id.clone());
                    self.arm_timer(state, delay);
                }
            }
            PresenceEvent::Reset => {
                let ids = state.bus.keys();
                info!(observed = ids.len(), "presence: reset, cached state invalidated");
                for id in &ids {
                    deliveries.push(state.bus.emit(id, None));
                }
                state
                    .awaiting_restart
                    .get_or_insert_with(BTreeSet::new)
                    .extend(ids);
            }
            PresenceEvent::Restart => {
                let ids = state.awaiting_restart.take().unwrap_or_default();
                info!(observed = ids.len(), "presence: restart, re-requesting observed users");
                for id in ids {
                    if state.bus.has(&id) {
                        self.request_interest_locked(state, id);
                    }
                }
            }
            PresenceEvent::Updated { .. } => {}
        }
        let _ = self.events.send(event);
        deliveries
    }

    async fn run_cycle(self: Arc<Self>, token: CancellationToken, delay: Duration) {
        let cycle = {
            let mut guard = self.inner.lock().await;
            if token.is_cancelled() {
                return;
            }
            guard.timer.mark_fired(&token);
            guard.tracker.begin_cycle(delay)
        };

        debug!(
            added = cycle.added.len(),
            removed = cycle.removed.len(),
            delay_ms = cycle.delay.as_millis() as u64,
            "presence: debounce cycle fired"
        );

        let update = cycle.subscription_update();
        if !update.is_empty() {
            if let Err(err) = self.subscription.update(update).await {
                warn!(error = %err, "presence: failed to update live subscription");
            }
        }

        if !cycle.needs_fetch() {
            return;
        }

        let result = self.fetcher.fetch_presence(&cycle.added).await;

        let mut notifications = Vec::new();
        let _in_order = {
            let mut guard = self.inner.lock().await;
            match result {
                Ok(payload) => {
                    guard.tracker.finish_cycle(cycle.seq);
                    let mut unresolved: BTreeSet<UserId> = cycle.added.into_iter().collect();
                    for record in payload.users {
                        unresolved.remove(&record.id);
                        if guard.store.has(&record.id) || !guard.bus.has(&record.id) {
                            continue;
                        }
                        notifications.extend(guard.apply(&record));
                    }
                    for id in unresolved {
                        if guard.store.has(&id) || !guard.bus.has(&id) {
                            continue;
                        }
                        notifications.extend(guard.apply(&PresenceRecord::offline(id)));
                    }
                }
                Err(err) => {
                    let unresolved: Vec<UserId> = cycle
                        .added
                        .into_iter()
                        .filter(|id| !guard.store.has(id))
                        .collect();
                    let requeued = unresolved.len();
                    let next = guard.tracker.requeue(cycle.seq, unresolved, cycle.delay);
                    warn!(
                        error = %err,
                        requeued,
                        retry_in_ms = next.as_millis() as u64,
                        "presence: batch fetch failed, backing off"
                    );
                    self.arm_timer(&mut guard, next);
                }
            }
            self.delivery_order.lock().await
        };

        for notification in notifications {
            self.publish(Some(notification));
        }
    }

    fn publish(&self, notification: Option<Notification>) {
        let Some(Notification { record, delivery }) = notification else {
            return;
        };
        delivery.deliver();
        let _ = self.events.send(PresenceEvent::Updated {
            id: record.id.clone(),
            record,
        });
    }
}

/// Hands a temporary `get` observer to [`Presence::stop`], including when
/// the `get` future is dropped before it resolves.
struct ReleaseOnDrop {
    presence: Arc<Presence>,
    id: UserId,
    listener: ListenerId,
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        // `stop` spawns the grace timer; there is nothing to spawn on after
        // the runtime is gone.
        if tokio::runtime::Handle::try_current().is_ok() {
            self.presence.stop(self.id.clone(), self.listener);
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
