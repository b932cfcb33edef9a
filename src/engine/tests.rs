//! Engine tests: a manual clock, an in-memory store and in-process fakes.

use super::*;
use async_trait::async_trait;
use chrono::{Duration, TimeZone};
use nudge_core::{
    clock::ManualClock,
    message::{Inbound, OutgoingMessage},
    task::{CompletionReason, NewTask, TaskAction},
    traits::{ParseOutcome, ParseRequest},
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeChannel {
    sent: Mutex<Vec<OutgoingMessage>>,
    edits: Mutex<Vec<(String, String, String)>>,
    /// Number of upcoming sends that fail.
    fail_next: AtomicUsize,
    /// Every send fails while set.
    down: AtomicBool,
}

impl FakeChannel {
    fn sent(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Channel for FakeChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn start(&self) -> Result<mpsc::Receiver<Inbound>, NudgeError> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }

    async fn send(&self, message: OutgoingMessage) -> Result<String, NudgeError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(NudgeError::Channel("connection reset".into()));
        }
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(NudgeError::Channel("502 bad gateway".into()));
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(message);
        Ok(format!("{}", 100 + sent.len()))
    }

    async fn edit_message(
        &self,
        target: &str,
        message_ref: &str,
        text: &str,
    ) -> Result<(), NudgeError> {
        self.edits
            .lock()
            .unwrap()
            .push((target.into(), message_ref.into(), text.into()));
        Ok(())
    }

    async fn stop(&self) -> Result<(), NudgeError> {
        Ok(())
    }
}

struct CannedParser {
    outcome: Mutex<ParseOutcome>,
    calls: AtomicUsize,
}

impl CannedParser {
    fn new(outcome: ParseOutcome) -> Self {
        Self {
            outcome: Mutex::new(outcome),
            calls: AtomicUsize::new(0),
        }
    }

    fn set(&self, outcome: ParseOutcome) {
        *self.outcome.lock().unwrap() = outcome;
    }
}

#[async_trait]
impl ReminderParser for CannedParser {
    async fn parse(&self, _request: &ParseRequest) -> Result<ParseOutcome, NudgeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        Ok(self.outcome.lock().unwrap().clone())
    }
}

#[derive(Default)]
struct FakeMirror {
    calls: Mutex<Vec<String>>,
    failing: AtomicBool,
}

impl FakeMirror {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn push(&self, call: String) -> Result<(), NudgeError> {
        self.calls.lock().unwrap().push(call);
        if self.failing.load(Ordering::SeqCst) {
            return Err(NudgeError::Calendar("503 backend error".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CalendarMirror for FakeMirror {
    fn name(&self) -> &str {
        "fake"
    }

    async fn create_mirror(&self, task: &Task) -> Result<String, NudgeError> {
        self.push(format!("create:{}", task.id))?;
        Ok(format!("evt-{}", task.short_id()))
    }

    async fn update_mirror(&self, event_ref: &str, task: &Task) -> Result<(), NudgeError> {
        self.push(format!("update:{event_ref}:{}", task.due_at.format("%H:%M")))
    }

    async fn mark_mirror_done(&self, event_ref: &str, _task: &Task) -> Result<(), NudgeError> {
        self.push(format!("done:{event_ref}"))
    }

    async fn delete_mirror(&self, event_ref: &str) -> Result<(), NudgeError> {
        self.push(format!("delete:{event_ref}"))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
}

fn config() -> SchedulerConfig {
    SchedulerConfig {
        retry_backoff_ms: 10,
        send_timeout_secs: 1,
        ..SchedulerConfig::default()
    }
}

async fn test_store() -> Store {
    let opts = SqliteConnectOptions::from_str("sqlite::memory:")
        .unwrap()
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(opts)
        .await
        .unwrap();
    Store::from_pool(pool).await.unwrap()
}

struct Harness {
    engine: Arc<Engine>,
    clock: Arc<ManualClock>,
    channel: Arc<FakeChannel>,
    parser: Arc<CannedParser>,
    mirror: Arc<FakeMirror>,
}

fn build(store: Store, config: SchedulerConfig, with_mirror: bool) -> Harness {
    let clock = Arc::new(ManualClock::new(t0()));
    let channel = Arc::new(FakeChannel::default());
    let parser = Arc::new(CannedParser::new(ParseOutcome::Parsed {
        due_at: t0() + Duration::hours(2),
        description: "Call mom".into(),
    }));
    let mirror = Arc::new(FakeMirror::default());

    let mut channels: HashMap<String, Arc<dyn Channel>> = HashMap::new();
    channels.insert("telegram".into(), channel.clone());
    let engine = Arc::new(Engine::new(
        store,
        clock.clone(),
        channels,
        parser.clone(),
        with_mirror.then(|| mirror.clone() as Arc<dyn CalendarMirror>),
        config,
        2,
    ));

    Harness {
        engine,
        clock,
        channel,
        parser,
        mirror,
    }
}

async fn harness() -> Harness {
    build(test_store().await, config(), false)
}

fn new_task(key: &str, due_at: DateTime<Utc>) -> NewTask {
    NewTask {
        owner: "42".into(),
        channel: "telegram".into(),
        reply_target: "42".into(),
        description: "Call mom".into(),
        due_at,
        dedup_key: key.into(),
    }
}

fn ingest_request(key: &str) -> IngestRequest {
    IngestRequest {
        dedup_key: key.into(),
        owner: "42".into(),
        channel: "telegram".into(),
        reply_target: "42".into(),
        text: "remind me to call mom in 2 hours".into(),
        timezone: chrono_tz::Europe::Berlin,
    }
}

fn created(outcome: IngestOutcome) -> Task {
    match outcome {
        IngestOutcome::Created(task) => task,
        other => panic!("expected Created, got {other:?}"),
    }
}

fn applied(outcome: Outcome) -> Task {
    match outcome {
        Outcome::Applied(task) => task,
        other => panic!("expected Applied, got {other:?}"),
    }
}

fn act(task: &Task, action: TaskAction) -> InteractionEvent {
    InteractionEvent {
        task_id: task.id.clone(),
        actor: task.owner.clone(),
        action,
    }
}

/// Poll until `check` holds, in real time.
async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn wait_for<F: Fn(&Task) -> bool>(engine: &Engine, id: &str, what: &str, check: F) -> Task {
    for _ in 0..300 {
        let task = engine.store.require_task(id).await.unwrap();
        if check(&task) {
            return task;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Give spawned timers a chance to run.
async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
}

// ---------------------------------------------------------------------------
// Sweep and dispatch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_far_task_waits_for_sweep_then_fires_on_time() {
    let h = harness().await;
    let task = created(
        h.engine
            .create(new_task("telegram:42:1", t0() + Duration::hours(2)))
            .await
            .unwrap(),
    );
    assert_eq!(task.status, TaskStatus::Created);

    let report = h.engine.sweep_once().await.unwrap();
    assert_eq!(report.promoted, 0);
    assert_eq!(h.engine.armed_timers(), 0);

    h.clock.advance(Duration::minutes(115));
    let report = h.engine.sweep_once().await.unwrap();
    assert_eq!(report.promoted, 1);
    assert_eq!(report.overdue, 0);
    let scheduled = h.engine.store.require_task(&task.id).await.unwrap();
    assert_eq!(scheduled.status, TaskStatus::Scheduled);
    assert_eq!(scheduled.delay_from(h.clock.now()).as_secs(), 300);
    assert!(h.engine.timers.is_armed(&task.id));

    h.clock.advance(Duration::minutes(4));
    settle().await;
    assert_eq!(h.channel.sent(), 0, "must not fire before due_at");

    h.clock.advance(Duration::minutes(1));
    let sent = wait_for(&h.engine, &task.id, "SENT", |t| t.status == TaskStatus::Sent).await;
    assert_eq!(h.channel.sent(), 1);
    assert_eq!(sent.message_ref.as_deref(), Some("101"));
    assert_eq!(sent.due_at, task.due_at);
    assert_eq!(sent.version, 2);
    assert!(h.engine.timers.is_empty());
}

#[tokio::test]
async fn test_imminent_task_is_scheduled_at_creation() {
    let h = harness().await;
    let task = created(
        h.engine
            .create(new_task("telegram:42:2", t0() + Duration::minutes(2)))
            .await
            .unwrap(),
    );
    assert_eq!(task.status, TaskStatus::Scheduled);
    assert_eq!(task.delay_from(h.clock.now()).as_secs(), 120);

    h.clock.advance(Duration::minutes(2));
    wait_for(&h.engine, &task.id, "SENT", |t| t.status == TaskStatus::Sent).await;

    let msg = h.channel.sent.lock().unwrap()[0].clone();
    assert_eq!(msg.reply_target, "42");
    assert!(msg.text.contains("Call mom"));
    assert_eq!(msg.buttons.len(), 2);
}

#[tokio::test]
async fn test_overdue_task_fires_with_zero_delay() {
    let h = harness().await;
    // Stored directly: ingestion would reject a due time this far back.
    let task = h
        .engine
        .store
        .insert_task(&new_task("telegram:42:3", t0() - Duration::minutes(30)), t0())
        .await
        .unwrap()
        .into_task();

    let report = h.engine.sweep_once().await.unwrap();
    assert_eq!(report.promoted, 1);
    assert_eq!(report.overdue, 1);

    // No clock movement needed.
    wait_for(&h.engine, &task.id, "SENT", |t| t.status == TaskStatus::Sent).await;
    assert_eq!(h.channel.sent(), 1);
}

#[tokio::test]
async fn test_sweep_skips_task_changed_concurrently() {
    let h = harness().await;
    let task = created(
        h.engine
            .create(new_task("telegram:42:4", t0() + Duration::hours(1)))
            .await
            .unwrap(),
    );
    h.clock.advance(Duration::minutes(56));

    // Another writer cancels between the sweep's read and its write.
    let stale = h.engine.sweep_candidates().await.unwrap();
    assert_eq!(stale.len(), 1);
    applied(h.engine.handle(act(&task, TaskAction::Cancel)).await.unwrap());

    let committed = h
        .engine
        .commit(&stale[0], &TaskEvent::Promote, h.clock.now())
        .await
        .unwrap();
    assert!(committed.is_none());
    assert_eq!(h.engine.sweep_once().await.unwrap(), SweepReport::default());
}

// ---------------------------------------------------------------------------
// Interactions racing the dispatcher
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cancel_before_fire_never_sends() {
    let h = harness().await;
    let task = created(
        h.engine
            .create(new_task("telegram:42:5", t0() + Duration::minutes(4)))
            .await
            .unwrap(),
    );
    assert_eq!(task.status, TaskStatus::Scheduled);

    h.clock.advance(Duration::minutes(2));
    let cancelled = applied(h.engine.handle(act(&task, TaskAction::Cancel)).await.unwrap());
    assert_eq!(cancelled.status, TaskStatus::Completed);
    assert_eq!(cancelled.completion_reason, Some(CompletionReason::Cancelled));
    assert_eq!(cancelled.completed_at, Some(t0() + Duration::minutes(2)));
    assert_eq!(h.engine.armed_timers(), 0);

    h.clock.advance(Duration::minutes(10));
    settle().await;
    assert_eq!(h.channel.sent(), 0);
}

#[tokio::test]
async fn test_snooze_scheduled_task_makes_old_timer_a_noop() {
    let h = harness().await;
    let task = created(
        h.engine
            .create(new_task("telegram:42:6", t0() + Duration::minutes(4)))
            .await
            .unwrap(),
    );

    h.clock.advance(Duration::minutes(1));
    let snoozed = applied(
        h.engine
            .handle(act(&task, TaskAction::Snooze { minutes: 60 }))
            .await
            .unwrap(),
    );
    assert_eq!(snoozed.status, TaskStatus::Created);
    assert_eq!(snoozed.due_at, t0() + Duration::minutes(61));
    assert_eq!(h.engine.armed_timers(), 0);

    // The original due time passes silently.
    h.clock.advance(Duration::minutes(5));
    settle().await;
    assert_eq!(h.channel.sent(), 0);

    h.clock.set(t0() + Duration::minutes(57));
    assert_eq!(h.engine.sweep_once().await.unwrap().promoted, 1);
    h.clock.set(t0() + Duration::minutes(61));
    wait_for(&h.engine, &task.id, "SENT", |t| t.status == TaskStatus::Sent).await;
    assert_eq!(h.channel.sent(), 1);
}

#[tokio::test]
async fn test_snooze_into_horizon_rearms_immediately() {
    let h = harness().await;
    let task = created(
        h.engine
            .create(new_task("telegram:42:7", t0() + Duration::minutes(4)))
            .await
            .unwrap(),
    );

    h.clock.advance(Duration::minutes(1));
    let snoozed = applied(
        h.engine
            .handle(act(&task, TaskAction::Snooze { minutes: 2 }))
            .await
            .unwrap(),
    );
    assert_eq!(snoozed.status, TaskStatus::Scheduled);
    assert_eq!(snoozed.due_at, t0() + Duration::minutes(3));
    assert_eq!(snoozed.version, task.version + 2);

    h.clock.set(t0() + Duration::minutes(3));
    wait_for(&h.engine, &task.id, "SENT", |t| t.status == TaskStatus::Sent).await;
    h.clock.set(t0() + Duration::minutes(5));
    settle().await;
    assert_eq!(h.channel.sent(), 1, "the superseded timer must not fire");
}

#[tokio::test]
async fn test_done_twice_is_idempotent() {
    let h = harness().await;
    let task = created(
        h.engine
            .create(new_task("telegram:42:8", t0() + Duration::hours(3)))
            .await
            .unwrap(),
    );

    let done = applied(h.engine.handle(act(&task, TaskAction::Complete)).await.unwrap());
    assert_eq!(done.completion_reason, Some(CompletionReason::Done));

    let again = h.engine.handle(act(&task, TaskAction::Complete)).await.unwrap();
    assert!(matches!(again, Outcome::AlreadyResolved(_)));
    assert_eq!(again.task().version, done.version);

    let cancel = h.engine.handle(act(&task, TaskAction::Cancel)).await.unwrap();
    assert!(matches!(cancel, Outcome::AlreadyResolved(_)));
}

#[tokio::test]
async fn test_only_the_owner_can_act() {
    let h = harness().await;
    let task = created(
        h.engine
            .create(new_task("telegram:42:9", t0() + Duration::hours(3)))
            .await
            .unwrap(),
    );
    let mut event = act(&task, TaskAction::Cancel);
    event.actor = "666".into();
    let err = h.engine.handle(event).await.unwrap_err();
    assert!(matches!(err, NudgeError::Auth(_)));

    let unchanged = h.engine.store.require_task(&task.id).await.unwrap();
    assert_eq!(unchanged.status, TaskStatus::Created);
}

#[tokio::test]
async fn test_sent_task_can_be_completed_but_not_cancelled() {
    let h = harness().await;
    let task = created(
        h.engine
            .create(new_task("telegram:42:10", t0() + Duration::minutes(1)))
            .await
            .unwrap(),
    );
    h.clock.advance(Duration::minutes(1));
    let sent = wait_for(&h.engine, &task.id, "SENT", |t| t.status == TaskStatus::Sent).await;

    let err = h.engine.handle(act(&task, TaskAction::Cancel)).await.unwrap_err();
    assert!(matches!(
        err,
        NudgeError::InvalidTransition {
            from: TaskStatus::Sent,
            event: "cancel"
        }
    ));

    let done = applied(h.engine.handle(act(&task, TaskAction::Complete)).await.unwrap());
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.due_at, sent.due_at, "due_at is frozen once sent");

    let edits = h.channel.edits.lock().unwrap().clone();
    assert_eq!(edits.len(), 1);
    assert_eq!(edits[0].0, "42");
    assert_eq!(edits[0].1, "101");
    assert!(edits[0].2.ends_with("Done."));
}

#[tokio::test]
async fn test_snooze_after_send_follows_policy() {
    for allowed in [true, false] {
        let h = build(
            test_store().await,
            SchedulerConfig {
                snooze_after_send: allowed,
                ..config()
            },
            false,
        );
        let task = created(
            h.engine
                .create(new_task("telegram:42:11", t0() + Duration::minutes(1)))
                .await
                .unwrap(),
        );
        h.clock.advance(Duration::minutes(1));
        wait_for(&h.engine, &task.id, "SENT", |t| t.status == TaskStatus::Sent).await;

        let result = h
            .engine
            .handle(act(&task, TaskAction::Snooze { minutes: 15 }))
            .await;
        if allowed {
            let snoozed = applied(result.unwrap());
            assert_eq!(snoozed.status, TaskStatus::Created);
            assert_eq!(snoozed.due_at, t0() + Duration::minutes(16));
            let edits = h.channel.edits.lock().unwrap().clone();
            assert!(edits[0].2.contains("Snoozed until 01.03.2026 09:16"), "{edits:?}");
        } else {
            assert!(matches!(
                result.unwrap_err(),
                NudgeError::InvalidTransition {
                    from: TaskStatus::Sent,
                    ..
                }
            ));
            let task = h.engine.store.require_task(&task.id).await.unwrap();
            assert_eq!(task.status, TaskStatus::Sent);
        }
    }
}

// ---------------------------------------------------------------------------
// Delivery failures and recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_failed_send_is_retried() {
    let h = harness().await;
    h.channel.fail_next.store(1, Ordering::SeqCst);
    let task = created(
        h.engine
            .create(new_task("telegram:42:12", t0() + Duration::minutes(1)))
            .await
            .unwrap(),
    );

    h.clock.advance(Duration::minutes(1));
    let sent = wait_for(&h.engine, &task.id, "SENT", |t| t.status == TaskStatus::Sent).await;
    assert_eq!(sent.attempts, 1);
    assert!(sent.last_error.is_none());
    assert_eq!(h.channel.sent(), 1);
}

#[tokio::test]
async fn test_gives_up_then_requeue_recovers() {
    let h = harness().await;
    h.channel.down.store(true, Ordering::SeqCst);
    let task = created(
        h.engine
            .create(new_task("telegram:42:13", t0() + Duration::minutes(1)))
            .await
            .unwrap(),
    );

    h.clock.advance(Duration::minutes(1));
    let parked = wait_for(&h.engine, &task.id, "give up", |t| t.attempts == 3).await;
    assert_eq!(parked.status, TaskStatus::Scheduled, "never silently dropped");
    assert!(parked.last_error.as_deref().unwrap().contains("connection reset"));
    let mut gave_up = false;
    for _ in 0..300 {
        let history = h.engine.audit.history(&task.id).await.unwrap();
        if history.iter().any(|e| e.event == "give_up") {
            gave_up = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(gave_up);

    // Parked tasks are not re-armed on restart.
    assert_eq!(h.engine.recover().await.unwrap(), 0);
    assert_eq!(h.engine.stats().await.unwrap().stuck, 1);

    h.channel.down.store(false, Ordering::SeqCst);
    let requeued = h.engine.requeue(&task.id).await.unwrap();
    assert_eq!(requeued.status, TaskStatus::Created);
    assert_eq!(requeued.attempts, 0);
    assert!(requeued.last_error.is_none());

    assert_eq!(h.engine.sweep_once().await.unwrap().overdue, 1);
    wait_for(&h.engine, &task.id, "SENT", |t| t.status == TaskStatus::Sent).await;
}

#[tokio::test]
async fn test_requeue_rejects_non_scheduled_task() {
    let h = harness().await;
    let task = created(
        h.engine
            .create(new_task("telegram:42:14", t0() + Duration::hours(1)))
            .await
            .unwrap(),
    );
    let err = h.engine.requeue(&task.id).await.unwrap_err();
    assert!(matches!(err, NudgeError::InvalidTransition { .. }));
    assert!(matches!(
        h.engine.requeue("missing").await.unwrap_err(),
        NudgeError::NotFound(_)
    ));
}

#[tokio::test]
async fn test_recover_rearms_scheduled_tasks_after_restart() {
    let store = test_store().await;
    let first = build(store.clone(), config(), false);
    let task = created(
        first
            .engine
            .create(new_task("telegram:42:15", t0() + Duration::minutes(3)))
            .await
            .unwrap(),
    );
    assert_eq!(task.status, TaskStatus::Scheduled);

    // A fresh process over the same store; the first one's clock never moves.
    let second = build(store, config(), false);
    assert_eq!(second.engine.recover().await.unwrap(), 1);
    second.clock.advance(Duration::minutes(3));
    wait_for(&second.engine, &task.id, "SENT", |t| t.status == TaskStatus::Sent).await;
    assert_eq!(second.channel.sent(), 1);
    assert_eq!(first.channel.sent(), 0);
}

#[tokio::test]
async fn test_restart_during_backoff_resumes_delivery() {
    let store = test_store().await;
    let slow_retry = SchedulerConfig {
        retry_backoff_ms: 60_000,
        ..config()
    };
    let first = build(store.clone(), slow_retry.clone(), false);
    first.channel.down.store(true, Ordering::SeqCst);
    let task = created(
        first
            .engine
            .create(new_task("telegram:42:17", t0() + Duration::minutes(2)))
            .await
            .unwrap(),
    );
    first.clock.advance(Duration::minutes(2));
    let failed_once = wait_for(&first.engine, &task.id, "first failure", |t| t.attempts == 1).await;
    assert!(failed_once.last_error.is_some());
    assert_eq!(first.engine.stats().await.unwrap().stuck, 0, "still retrying");

    // The process dies while backing off; the next one picks the task up.
    let second = build(store, slow_retry, false);
    assert_eq!(second.engine.recover().await.unwrap(), 1);
    second.clock.advance(Duration::minutes(2));
    let sent = wait_for(&second.engine, &task.id, "SENT", |t| t.status == TaskStatus::Sent).await;
    assert!(sent.last_error.is_none());
    assert_eq!(second.channel.sent(), 1);
}

#[tokio::test]
async fn test_duplicate_timers_deliver_once() {
    let h = harness().await;
    let task = created(
        h.engine
            .create(new_task("telegram:42:16", t0() + Duration::minutes(2)))
            .await
            .unwrap(),
    );
    // A second arm of the same version, e.g. from a recovery pass.
    h.engine.arm(&task);
    assert_eq!(h.engine.armed_timers(), 1);

    h.clock.advance(Duration::minutes(2));
    wait_for(&h.engine, &task.id, "SENT", |t| t.status == TaskStatus::Sent).await;
    settle().await;
    assert_eq!(h.channel.sent(), 1);
}

// ---------------------------------------------------------------------------
// Ingestion and the duplicate guard
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_ingest_is_idempotent_per_dedup_key() {
    let h = harness().await;
    let first = created(h.engine.ingest(ingest_request("telegram:42:20")).await.unwrap());
    assert_eq!(first.description, "Call mom");
    assert_eq!(first.due_at, t0() + Duration::hours(2));

    let second = h.engine.ingest(ingest_request("telegram:42:20")).await.unwrap();
    assert_eq!(second, IngestOutcome::Duplicate(first.clone()));
    assert_eq!(h.parser.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrent_ingest_of_one_request_creates_one_task() {
    let h = harness().await;
    let (a, b) = tokio::join!(
        h.engine.ingest(ingest_request("telegram:42:21")),
        h.engine.ingest(ingest_request("telegram:42:21")),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    let ids: Vec<_> = [&a, &b]
        .iter()
        .map(|o| match o {
            IngestOutcome::Created(t) | IngestOutcome::Duplicate(t) => t.id.clone(),
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(ids[0], ids[1]);
    assert_eq!(
        [&a, &b]
            .iter()
            .filter(|o| matches!(o, IngestOutcome::Created(_)))
            .count(),
        1
    );
    assert_eq!(h.engine.stats().await.unwrap().created, 1);
}

#[tokio::test]
async fn test_unparseable_text_creates_nothing() {
    let h = harness().await;
    h.parser.set(ParseOutcome::Unparseable {
        reason: "unknown_request".into(),
    });
    let outcome = h.engine.ingest(ingest_request("telegram:42:22")).await.unwrap();
    assert_eq!(
        outcome,
        IngestOutcome::Unparseable {
            reason: "unknown_request".into()
        }
    );
    assert!(h.engine.store.find_by_dedup_key("telegram:42:22").await.unwrap().is_none());
}

#[tokio::test]
async fn test_far_future_due_times_cannot_stall_the_sweep() {
    let h = harness().await;
    let far = created(
        h.engine
            .create(new_task("telegram:42:26", t0() + Duration::hours(2)))
            .await
            .unwrap(),
    );
    let near = created(
        h.engine
            .create(new_task("telegram:42:27", t0() + Duration::hours(1)))
            .await
            .unwrap(),
    );

    let err = h
        .engine
        .handle(act(&far, TaskAction::Snooze { minutes: u32::MAX }))
        .await
        .unwrap_err();
    assert!(matches!(err, NudgeError::Rejected(_)), "{err}");
    let unchanged = h.engine.store.require_task(&far.id).await.unwrap();
    assert_eq!(unchanged.due_at, far.due_at);
    assert_eq!(unchanged.version, far.version);

    assert_eq!(
        h.engine
            .create(new_task("telegram:42:28", t0() + Duration::days(365 * 20)))
            .await
            .unwrap(),
        IngestOutcome::Rejected {
            reason: "due_too_far".into()
        }
    );

    h.clock.advance(Duration::minutes(56));
    let report = h.engine.sweep_once().await.unwrap();
    assert_eq!(report.promoted, 1);
    let promoted = h.engine.store.require_task(&near.id).await.unwrap();
    assert_eq!(promoted.status, TaskStatus::Scheduled);
}

#[tokio::test]
async fn test_past_due_and_empty_requests_are_rejected() {
    let h = harness().await;
    h.parser.set(ParseOutcome::Parsed {
        due_at: t0() - Duration::hours(1),
        description: "Call mom".into(),
    });
    assert_eq!(
        h.engine.ingest(ingest_request("telegram:42:23")).await.unwrap(),
        IngestOutcome::Rejected {
            reason: "due_in_past".into()
        }
    );

    // Inside the grace period it is accepted and fires at once.
    let late = created(
        h.engine
            .create(new_task("telegram:42:24", t0() - Duration::seconds(30)))
            .await
            .unwrap(),
    );
    assert_eq!(late.status, TaskStatus::Scheduled);
    wait_for(&h.engine, &late.id, "SENT", |t| t.status == TaskStatus::Sent).await;

    let mut blank = new_task("telegram:42:25", t0() + Duration::hours(1));
    blank.description = "  ".into();
    assert_eq!(
        h.engine.create(blank).await.unwrap(),
        IngestOutcome::Rejected {
            reason: "empty_description".into()
        }
    );
}

#[tokio::test]
async fn test_audit_trail_follows_transitions() {
    let h = harness().await;
    let task = created(
        h.engine
            .create(new_task("telegram:42:26", t0() + Duration::minutes(1)))
            .await
            .unwrap(),
    );
    h.clock.advance(Duration::minutes(1));
    wait_for(&h.engine, &task.id, "SENT", |t| t.status == TaskStatus::Sent).await;
    applied(h.engine.handle(act(&task, TaskAction::Complete)).await.unwrap());

    let events: Vec<_> = h
        .engine
        .audit
        .history(&task.id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event)
        .collect();
    assert_eq!(events, vec!["create", "promote", "deliver", "complete"]);
}

// ---------------------------------------------------------------------------
// Calendar mirror
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_mirror_follows_task() {
    let h = build(test_store().await, config(), true);
    let task = created(
        h.engine
            .create(new_task("telegram:42:30", t0() + Duration::hours(2)))
            .await
            .unwrap(),
    );
    let event_ref = format!("evt-{}", task.short_id());
    let stored = wait_for(&h.engine, &task.id, "mirror ref", |t| {
        t.external_event_ref.is_some()
    })
    .await;
    assert_eq!(stored.external_event_ref.as_deref(), Some(event_ref.as_str()));
    assert_eq!(stored.version, task.version, "mirror bookkeeping is status-neutral");

    applied(
        h.engine
            .handle(act(&task, TaskAction::Snooze { minutes: 15 }))
            .await
            .unwrap(),
    );
    let expected = format!("update:{event_ref}:09:15");
    eventually("retime", || h.mirror.calls().contains(&expected)).await;

    applied(h.engine.handle(act(&task, TaskAction::Cancel)).await.unwrap());
    let expected = format!("delete:{event_ref}");
    eventually("delete", || h.mirror.calls().contains(&expected)).await;
    wait_for(&h.engine, &task.id, "ref cleared", |t| {
        t.external_event_ref.is_none()
    })
    .await;
}

#[tokio::test]
async fn test_mirror_ends_on_the_last_transition() {
    let h = build(test_store().await, config(), true);
    let task = created(
        h.engine
            .create(new_task("telegram:42:33", t0() + Duration::hours(2)))
            .await
            .unwrap(),
    );
    wait_for(&h.engine, &task.id, "mirror ref", |t| {
        t.external_event_ref.is_some()
    })
    .await;

    // Back to back, so both mirror updates are in flight together.
    applied(
        h.engine
            .handle(act(&task, TaskAction::Snooze { minutes: 15 }))
            .await
            .unwrap(),
    );
    applied(h.engine.handle(act(&task, TaskAction::Complete)).await.unwrap());

    let done = format!("done:evt-{}", task.short_id());
    eventually("done", || h.mirror.calls().contains(&done)).await;
    settle().await;
    let calls = h.mirror.calls();
    assert_eq!(calls.last(), Some(&done), "a retime landed after completion: {calls:?}");
}

#[tokio::test]
async fn test_mirror_marked_done_on_completion() {
    let h = build(test_store().await, config(), true);
    let task = created(
        h.engine
            .create(new_task("telegram:42:31", t0() + Duration::hours(2)))
            .await
            .unwrap(),
    );
    wait_for(&h.engine, &task.id, "mirror ref", |t| {
        t.external_event_ref.is_some()
    })
    .await;
    applied(h.engine.handle(act(&task, TaskAction::Complete)).await.unwrap());
    let expected = format!("done:evt-{}", task.short_id());
    eventually("done", || h.mirror.calls().contains(&expected)).await;
}

#[tokio::test]
async fn test_mirror_failure_never_blocks_transitions() {
    let h = build(test_store().await, config(), true);
    h.mirror.failing.store(true, Ordering::SeqCst);
    let task = created(
        h.engine
            .create(new_task("telegram:42:32", t0() + Duration::hours(2)))
            .await
            .unwrap(),
    );
    // Bounded: two attempts, then the create is abandoned.
    eventually("create attempts", || h.mirror.calls().len() == 2).await;

    let done = applied(h.engine.handle(act(&task, TaskAction::Complete)).await.unwrap());
    assert_eq!(done.status, TaskStatus::Completed);
    assert!(done.external_event_ref.is_none());
    settle().await;
    assert_eq!(h.mirror.calls().len(), 2, "no mirror, nothing to complete");
}
