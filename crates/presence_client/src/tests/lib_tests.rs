use super::*;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::UserStatus,
    protocol::{SubscriptionUpdate, UsersPresencePayload},
};
use tokio::{
    sync::mpsc,
    time::{sleep, timeout, Instant},
};

const DEBOUNCE: Duration = Duration::from_millis(500);
const GRACE: Duration = Duration::from_secs(5);

/// Batch fetcher whose answers are fed by the test, one per request.
struct ScriptedFetcher {
    requests: mpsc::UnboundedSender<(Instant, Vec<UserId>)>,
    responses: Mutex<mpsc::UnboundedReceiver<Result<UsersPresencePayload>>>,
}

#[async_trait]
impl PresenceFetcher for ScriptedFetcher {
    async fn fetch_presence(&self, ids: &[UserId]) -> Result<UsersPresencePayload> {
        let _ = self.requests.send((Instant::now(), ids.to_vec()));
        self.responses
            .lock()
            .await
            .recv()
            .await
            .unwrap_or_else(|| Err(anyhow!("response script closed")))
    }
}

struct RecordingSubscription {
    updates: mpsc::UnboundedSender<(Instant, SubscriptionUpdate)>,
}

#[async_trait]
impl PresenceSubscription for RecordingSubscription {
    async fn update(&self, update: SubscriptionUpdate) -> Result<()> {
        let _ = self.updates.send((Instant::now(), update));
        Ok(())
    }
}

struct Harness {
    presence: Arc<Presence>,
    fetches: mpsc::UnboundedReceiver<(Instant, Vec<UserId>)>,
    respond: mpsc::UnboundedSender<Result<UsersPresencePayload>>,
    updates: mpsc::UnboundedReceiver<(Instant, SubscriptionUpdate)>,
}

impl Harness {
    fn new() -> Self {
        let (requests, fetches) = mpsc::unbounded_channel();
        let (respond, responses) = mpsc::unbounded_channel();
        let (updates_tx, updates) = mpsc::unbounded_channel();
        let presence = Presence::new_with_dependencies(
            PresenceSettings::default(),
            Arc::new(ScriptedFetcher {
                requests,
                responses: Mutex::new(responses),
            }),
            Arc::new(RecordingSubscription {
                updates: updates_tx,
            }),
        );
        Self {
            presence,
            fetches,
            respond,
            updates,
        }
    }

    fn reply(&self, users: Vec<PresenceRecord>) {
        let _ = self.respond.send(Ok(UsersPresencePayload { users, full: true }));
    }

    fn fail(&self, reason: &str) {
        let _ = self.respond.send(Err(anyhow!(reason.to_string())));
    }

    async fn next_fetch(&mut self) -> (Instant, Vec<UserId>) {
        timeout(Duration::from_secs(120), self.fetches.recv())
            .await
            .expect("fetch expected")
            .expect("fetcher alive")
    }

    async fn next_update(&mut self) -> (Instant, SubscriptionUpdate) {
        timeout(Duration::from_secs(120), self.updates.recv())
            .await
            .expect("subscription update expected")
            .expect("subscription alive")
    }

    async fn assert_no_fetch(&mut self) {
        assert!(
            timeout(Duration::from_secs(30), self.fetches.recv())
                .await
                .is_err(),
            "unexpected batch fetch"
        );
    }
}

type Observed = mpsc::UnboundedReceiver<Option<PresenceRecord>>;

fn observer() -> (
    impl Fn(Option<PresenceRecord>) + Send + Sync + 'static,
    Observed,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |record| {
            let _ = tx.send(record);
        },
        rx,
    )
}

async fn next_seen(rx: &mut Observed) -> Option<PresenceRecord> {
    timeout(Duration::from_secs(120), rx.recv())
        .await
        .expect("observer notified")
        .expect("observer alive")
}

async fn settle() {
    sleep(Duration::from_millis(1)).await;
}

fn ids(values: &[&str]) -> Vec<UserId> {
    values.iter().map(|value| UserId::from(*value)).collect()
}

fn online(id: &str) -> PresenceRecord {
    PresenceRecord::new(id).with_status(UserStatus::Online)
}

#[tokio::test(start_paused = true)]
async fn listen_resolves_through_batch_fetch_after_debounce() {
    let mut h = Harness::new();
    h.reply(vec![online("u1")]);
    let (handler, mut seen) = observer();

    let start = Instant::now();
    assert!(h.presence.listen("u1", handler).await.is_some());
    assert_eq!(h.presence.phase().await, Phase::Scheduled);

    let (_, update) = h.next_update().await;
    assert_eq!(update.added, Some(ids(&["u1"])));
    assert_eq!(update.removed, None);

    let (fetched_at, requested) = h.next_fetch().await;
    assert_eq!(requested, ids(&["u1"]));
    assert!(fetched_at.duration_since(start) >= DEBOUNCE);

    assert_eq!(next_seen(&mut seen).await, Some(online("u1")));
    assert_eq!(
        h.presence.cached(&UserId::from("u1")).await,
        Some(online("u1"))
    );
    assert_eq!(h.presence.phase().await, Phase::Idle);
}

#[tokio::test(start_paused = true)]
async fn cached_user_is_not_fetched_again() {
    let mut h = Harness::new();
    h.presence.notify(online("u1")).await;
    let (handler, mut seen) = observer();

    h.presence.listen("u1", handler).await;

    h.assert_no_fetch().await;
    assert!(seen.try_recv().is_err());

    h.presence
        .notify(PresenceRecord::new("u1").with_status_text("lunch"))
        .await;
    let merged = next_seen(&mut seen).await.expect("record");
    assert_eq!(merged.status, Some(UserStatus::Online));
    assert_eq!(merged.status_text.as_deref(), Some("lunch"));
}

#[tokio::test(start_paused = true)]
async fn requests_within_window_share_one_fetch() {
    let mut h = Harness::new();
    h.reply(vec![online("a"), online("b"), online("c")]);

    let start = Instant::now();
    for id in ["c", "a", "b"] {
        let (handler, _seen) = observer();
        h.presence.listen(id, handler).await;
        sleep(Duration::from_millis(200)).await;
    }

    let (fetched_at, requested) = h.next_fetch().await;
    assert_eq!(requested, ids(&["a", "b", "c"]));
    assert!(fetched_at.duration_since(start) >= Duration::from_millis(400) + DEBOUNCE);
    h.assert_no_fetch().await;
}

#[tokio::test(start_paused = true)]
async fn identifiers_missing_from_response_become_offline() {
    let mut h = Harness::new();
    h.reply(vec![online("a")]);
    let (on_a, _seen_a) = observer();
    let (on_b, mut seen_b) = observer();

    h.presence.listen("a", on_a).await;
    h.presence.listen("b", on_b).await;
    let (_, requested) = h.next_fetch().await;
    assert_eq!(requested, ids(&["a", "b"]));

    assert_eq!(
        next_seen(&mut seen_b).await,
        Some(PresenceRecord::offline("b"))
    );
    let store = h.presence.store_snapshot().await;
    assert_eq!(store.get(&UserId::from("a")), Some(&online("a")));
    assert_eq!(
        store.get(&UserId::from("b")),
        Some(&PresenceRecord::offline("b"))
    );
}

#[tokio::test(start_paused = true)]
async fn failed_fetch_retries_with_longer_delay() {
    let mut h = Harness::new();
    h.fail("server unavailable");
    h.reply(vec![online("a")]);
    let (on_a, mut seen_a) = observer();
    let (on_b, mut seen_b) = observer();

    h.presence.listen("a", on_a).await;
    h.presence.listen("b", on_b).await;

    let (first_at, first) = h.next_fetch().await;
    let (second_at, second) = h.next_fetch().await;
    assert_eq!(first, ids(&["a", "b"]));
    assert_eq!(second, ids(&["a", "b"]));
    assert!(second_at.duration_since(first_at) >= DEBOUNCE * 2);
    assert!(second_at.duration_since(first_at) > DEBOUNCE);

    assert_eq!(next_seen(&mut seen_a).await, Some(online("a")));
    assert_eq!(
        next_seen(&mut seen_b).await,
        Some(PresenceRecord::offline("b"))
    );
}

#[tokio::test(start_paused = true)]
async fn users_pushed_during_failed_fetch_are_not_retried() {
    let mut h = Harness::new();
    let (on_a, _seen_a) = observer();
    let (on_b, _seen_b) = observer();
    h.presence.listen("a", on_a).await;
    h.presence.listen("b", on_b).await;

    let (_, first) = h.next_fetch().await;
    assert_eq!(first, ids(&["a", "b"]));
    assert_eq!(h.presence.phase().await, Phase::Resolving);

    h.presence.notify(online("b")).await;
    h.fail("timeout");

    let (_, retry) = h.next_fetch().await;
    assert_eq!(retry, ids(&["a"]));
    h.reply(Vec::new());
    settle().await;

    assert_eq!(
        h.presence.cached(&UserId::from("a")).await,
        Some(PresenceRecord::offline("a"))
    );
    assert_eq!(
        h.presence.cached(&UserId::from("b")).await,
        Some(online("b"))
    );
}

#[tokio::test(start_paused = true)]
async fn push_update_wins_over_stale_fetch_result() {
    let mut h = Harness::new();
    let (handler, mut seen) = observer();
    h.presence.listen("a", handler).await;

    h.next_fetch().await;
    let busy = PresenceRecord::new("a").with_status(UserStatus::Busy);
    h.presence.notify(busy.clone()).await;
    assert_eq!(next_seen(&mut seen).await, Some(busy.clone()));

    h.reply(vec![online("a")]);
    settle().await;

    assert_eq!(h.presence.cached(&UserId::from("a")).await, Some(busy));
    assert!(seen.try_recv().is_err());
    assert_eq!(h.presence.phase().await, Phase::Idle);
}

#[tokio::test(start_paused = true)]
async fn interest_arriving_mid_fetch_gets_its_own_cycle() {
    let mut h = Harness::new();
    let (on_a, _seen_a) = observer();
    let (on_b, mut seen_b) = observer();

    h.presence.listen("a", on_a).await;
    let (_, first) = h.next_fetch().await;
    assert_eq!(first, ids(&["a"]));

    h.presence.listen("b", on_b).await;
    assert_eq!(h.presence.phase().await, Phase::Scheduled);
    h.reply(vec![online("a")]);

    let (_, second) = h.next_fetch().await;
    assert_eq!(second, ids(&["b"]));
    h.reply(vec![online("b")]);
    assert_eq!(next_seen(&mut seen_b).await, Some(online("b")));
}

#[tokio::test(start_paused = true)]
async fn last_observer_leaving_releases_user_after_grace() {
    let mut h = Harness::new();
    h.reply(vec![online("a")]);
    let mut events = h.presence.subscribe_events();
    let (handler, mut seen) = observer();

    let listener = h.presence.listen("a", handler).await.expect("listener");
    next_seen(&mut seen).await;
    let (_, added) = h.next_update().await;
    assert_eq!(added.added, Some(ids(&["a"])));

    let stopped_at = Instant::now();
    h.presence.stop("a", listener);

    let (released_at, update) = h.next_update().await;
    assert_eq!(update.added, None);
    assert_eq!(update.removed, Some(ids(&["a"])));
    assert!(released_at.duration_since(stopped_at) >= GRACE + DEBOUNCE);
    assert_eq!(h.presence.cached(&UserId::from("a")).await, None);
    assert!(h.presence.listened_ids().await.is_empty());

    let mut saw_removed = false;
    while let Ok(event) = events.try_recv() {
        saw_removed |= event == PresenceEvent::Removed(UserId::from("a"));
    }
    assert!(saw_removed);
}

#[tokio::test(start_paused = true)]
async fn relisten_within_grace_keeps_user_subscribed() {
    let mut h = Harness::new();
    h.reply(vec![online("a")]);
    let (first, mut seen) = observer();

    let listener = h.presence.listen("a", first).await.expect("listener");
    next_seen(&mut seen).await;
    h.next_update().await;
    h.next_fetch().await;

    h.presence.stop("a", listener);
    sleep(Duration::from_secs(1)).await;
    let (second, _seen_second) = observer();
    h.presence.listen("a", second).await;

    assert!(timeout(Duration::from_secs(30), h.updates.recv())
        .await
        .is_err());
    h.assert_no_fetch().await;
    assert_eq!(
        h.presence.cached(&UserId::from("a")).await,
        Some(online("a"))
    );
    assert_eq!(h.presence.listened_ids().await, ids(&["a"]));
}

#[tokio::test(start_paused = true)]
async fn reset_invalidates_and_restart_requests_observed_users_again() {
    let mut h = Harness::new();
    h.reply(vec![online("a"), online("b")]);
    let (on_a, mut seen_a) = observer();
    let (on_b, mut seen_b) = observer();
    h.presence.listen("a", on_a).await;
    h.presence.listen("b", on_b).await;
    h.next_fetch().await;
    next_seen(&mut seen_a).await;
    next_seen(&mut seen_b).await;
    h.next_update().await;

    h.presence.reset().await;
    assert!(h.presence.store_snapshot().await.is_empty());
    assert_eq!(next_seen(&mut seen_a).await, None);
    assert_eq!(next_seen(&mut seen_b).await, None);
    h.assert_no_fetch().await;

    h.reply(vec![online("a")]);
    h.presence.restart().await;

    let (_, update) = h.next_update().await;
    assert_eq!(update.added, Some(ids(&["a", "b"])));
    let (_, requested) = h.next_fetch().await;
    assert_eq!(requested, ids(&["a", "b"]));
    assert_eq!(next_seen(&mut seen_a).await, Some(online("a")));
    assert_eq!(
        next_seen(&mut seen_b).await,
        Some(PresenceRecord::offline("b"))
    );
}

#[tokio::test(start_paused = true)]
async fn restart_without_reset_does_nothing() {
    let mut h = Harness::new();
    h.presence.restart().await;
    h.assert_no_fetch().await;
}

#[tokio::test(start_paused = true)]
async fn get_resolves_once_then_releases_its_observer() {
    let mut h = Harness::new();
    h.reply(vec![online("u1")]);

    assert_eq!(h.presence.get("u1").await, Some(online("u1")));
    assert_eq!(h.presence.listened_ids().await, ids(&["u1"]));

    let (_, added) = h.next_update().await;
    assert_eq!(added.added, Some(ids(&["u1"])));
    let (_, released) = h.next_update().await;
    assert_eq!(released.removed, Some(ids(&["u1"])));
    assert!(h.presence.listened_ids().await.is_empty());
    assert_eq!(h.presence.cached(&UserId::from("u1")).await, None);
}

#[tokio::test(start_paused = true)]
async fn get_answers_from_cache_without_fetching() {
    let mut h = Harness::new();
    h.presence.notify(online("u1")).await;

    assert_eq!(h.presence.get("u1").await, Some(online("u1")));
    assert!(h.presence.listened_ids().await.is_empty());
    h.assert_no_fetch().await;
}

#[tokio::test(start_paused = true)]
async fn get_reports_unknown_presence_after_reset() {
    let h = Harness::new();
    let presence = Arc::clone(&h.presence);
    let pending = tokio::spawn(async move { presence.get("u1").await });

    sleep(Duration::from_millis(100)).await;
    h.presence.reset().await;

    assert_eq!(pending.await.expect("join"), None);
}

#[tokio::test(start_paused = true)]
async fn cancelled_get_still_releases_observer() {
    let mut h = Harness::new();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let outcome = h.presence.get_with_cancel("u1", cancel).await;
    assert!(matches!(outcome, Err(PresenceError::Cancelled)));

    h.next_fetch().await;
    h.reply(Vec::new());
    sleep(GRACE + Duration::from_millis(10)).await;
    assert!(h.presence.listened_ids().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn dropped_get_future_releases_observer() {
    let mut h = Harness::new();
    h.reply(vec![online("u1")]);

    let abandoned = timeout(Duration::from_millis(100), h.presence.get("u1")).await;
    assert!(abandoned.is_err());
    assert_eq!(h.presence.listened_ids().await, ids(&["u1"]));

    let (_, requested) = h.next_fetch().await;
    assert_eq!(requested, ids(&["u1"]));
    let (_, added) = h.next_update().await;
    assert_eq!(added.added, Some(ids(&["u1"])));

    let (_, released) = h.next_update().await;
    assert_eq!(released.removed, Some(ids(&["u1"])));
    assert!(h.presence.listened_ids().await.is_empty());
    assert_eq!(h.presence.cached(&UserId::from("u1")).await, None);
}

#[tokio::test(start_paused = true)]
async fn blank_identifiers_are_ignored() {
    let mut h = Harness::new();
    let (handler, _seen) = observer();

    assert!(h.presence.listen("", handler).await.is_none());
    assert_eq!(h.presence.get("  ").await, None);
    h.presence.notify(PresenceRecord::new("")).await;

    h.assert_no_fetch().await;
    assert!(h.presence.store_snapshot().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn control_words_are_ordinary_identifiers() {
    let mut h = Harness::new();
    h.reply(vec![online("reset"), online("remove")]);
    let (on_reset, mut seen_reset) = observer();
    let (on_remove, mut seen_remove) = observer();

    h.presence.listen("reset", on_reset).await;
    h.presence.listen("remove", on_remove).await;

    let (_, requested) = h.next_fetch().await;
    assert_eq!(requested, ids(&["remove", "reset"]));
    assert_eq!(next_seen(&mut seen_reset).await, Some(online("reset")));
    assert_eq!(next_seen(&mut seen_remove).await, Some(online("remove")));
}

#[tokio::test(start_paused = true)]
async fn missing_fetcher_keeps_users_queued() {
    let presence = Presence::new(PresenceSettings::default());
    let (handler, mut seen) = observer();
    presence.listen("u1", handler).await;

    sleep(Duration::from_secs(10)).await;
    assert!(seen.try_recv().is_err());
    assert_eq!(presence.phase().await, Phase::Scheduled);

    presence.notify(online("u1")).await;
    assert_eq!(next_seen(&mut seen).await, Some(online("u1")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_updates_reach_observers_in_state_order() {
    let presence = Presence::new(PresenceSettings::default());
    presence.notify(online("u1")).await;

    let last_seen = Arc::new(StdMutex::new(None));
    let sink = Arc::clone(&last_seen);
    presence
        .listen("u1", move |record: Option<PresenceRecord>| {
            if let Ok(mut last) = sink.lock() {
                *last = record;
            }
        })
        .await;

    let mut writers = Vec::new();
    for writer in 0..4 {
        let presence = Arc::clone(&presence);
        writers.push(tokio::spawn(async move {
            for step in 0..50 {
                presence
                    .notify(PresenceRecord::new("u1").with_status_text(format!("{writer}-{step}")))
                    .await;
            }
        }));
    }
    for writer in writers {
        writer.await.expect("join");
    }

    let delivered = last_seen.lock().expect("observer lock").clone();
    assert_eq!(delivered, presence.cached(&UserId::from("u1")).await);
}
