use super::Store;
use crate::audit::{AuditEntry, AuditLogger};
use chrono::{DateTime, Duration, TimeZone, Utc};
use nudge_core::lifecycle::{apply, LifecyclePolicy, TaskEvent};
use nudge_core::task::{CompletionReason, NewTask, TaskStatus};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;

/// Create an in-memory store for testing.
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

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
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

#[tokio::test]
async fn test_insert_and_get_task() {
    let store = test_store().await;
    let inserted = store
        .insert_task(&new_task("telegram:42:1", t0() + Duration::hours(2)), t0())
        .await
        .unwrap();
    assert!(inserted.is_new());

    let task = store.require_task(&inserted.task().id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Created);
    assert_eq!(task.due_at, t0() + Duration::hours(2));
    assert_eq!(task.created_at, t0());
    assert_eq!(task.version, 0);
    assert!(task.completed_at.is_none());
}

#[tokio::test]
async fn test_same_dedup_key_yields_same_task() {
    let store = test_store().await;
    let first = store
        .insert_task(&new_task("telegram:42:7", t0()), t0())
        .await
        .unwrap();
    let mut retry = new_task("telegram:42:7", t0() + Duration::hours(1));
    retry.description = "something else".into();
    let second = store.insert_task(&retry, t0()).await.unwrap();

    assert!(!second.is_new());
    assert_eq!(first.task().id, second.task().id);
    assert_eq!(second.task().description, "Call mom");
    assert_eq!(store.tasks_for_owner("42", true).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_concurrent_inserts_of_one_key_resolve_to_one_row() {
    let store = test_store().await;
    let a = store.clone();
    let b = store.clone();
    let (ra, rb) = tokio::join!(
        async move { a.insert_task(&new_task("k", t0()), t0()).await },
        async move { b.insert_task(&new_task("k", t0()), t0()).await },
    );
    let (ra, rb) = (ra.unwrap(), rb.unwrap());
    assert_eq!(ra.task().id, rb.task().id);
    assert_ne!(ra.is_new(), rb.is_new());
}

#[tokio::test]
async fn test_get_missing_task() {
    let store = test_store().await;
    assert!(store.get_task("nope").await.unwrap().is_none());
    assert!(store.require_task("nope").await.is_err());
}

#[tokio::test]
async fn test_due_before_filters_status_and_time() {
    let store = test_store().await;
    store
        .insert_task(&new_task("a", t0() + Duration::minutes(3)), t0())
        .await
        .unwrap();
    store
        .insert_task(&new_task("b", t0() - Duration::minutes(10)), t0())
        .await
        .unwrap();
    store
        .insert_task(&new_task("c", t0() + Duration::hours(2)), t0())
        .await
        .unwrap();

    let due = store
        .due_before(TaskStatus::Created, t0() + Duration::minutes(5))
        .await
        .unwrap();
    let keys: Vec<_> = due.iter().map(|t| t.dedup_key.as_str()).collect();
    assert_eq!(keys, vec!["b", "a"], "overdue first, far-future excluded");

    assert!(store
        .due_before(TaskStatus::Scheduled, t0() + Duration::days(1))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_compare_and_set_rejects_stale_version() {
    let store = test_store().await;
    let task = store
        .insert_task(&new_task("k", t0()), t0())
        .await
        .unwrap()
        .into_task();
    let policy = LifecyclePolicy::default();

    let promoted = apply(&task, &TaskEvent::Promote, t0(), &policy).unwrap().task;
    assert!(store.compare_and_set(&task, &promoted).await.unwrap());

    // A second writer still holding the original snapshot loses.
    let cancelled = apply(&task, &TaskEvent::Cancel, t0(), &policy).unwrap().task;
    assert!(!store.compare_and_set(&task, &cancelled).await.unwrap());

    let stored = store.require_task(&task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Scheduled);
    assert_eq!(stored.version, 1);
}

#[tokio::test]
async fn test_completion_columns_round_trip() {
    let store = test_store().await;
    let task = store
        .insert_task(&new_task("k", t0()), t0())
        .await
        .unwrap()
        .into_task();
    let done_at = t0() + Duration::minutes(1);
    let next = apply(&task, &TaskEvent::Cancel, done_at, &LifecyclePolicy::default())
        .unwrap()
        .task;
    assert!(store.compare_and_set(&task, &next).await.unwrap());

    let stored = store.require_task(&task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert_eq!(stored.completion_reason, Some(CompletionReason::Cancelled));
    assert_eq!(stored.completed_at, Some(done_at));
}

#[tokio::test]
async fn test_check_constraint_rejects_completed_without_timestamp() {
    let store = test_store().await;
    let task = store
        .insert_task(&new_task("k", t0()), t0())
        .await
        .unwrap()
        .into_task();
    let mut broken = task.clone();
    broken.status = TaskStatus::Completed;
    broken.version += 1;
    assert!(store.compare_and_set(&task, &broken).await.is_err());
}

#[tokio::test]
async fn test_attempt_failures_are_version_scoped() {
    let store = test_store().await;
    let task = store
        .insert_task(&new_task("k", t0()), t0())
        .await
        .unwrap()
        .into_task();

    assert!(store
        .record_attempt_failure(&task.id, 0, "timeout")
        .await
        .unwrap());
    assert!(!store
        .record_attempt_failure(&task.id, 5, "stale")
        .await
        .unwrap());

    let stored = store.require_task(&task.id).await.unwrap();
    assert_eq!(stored.attempts, 1);
    assert_eq!(stored.last_error.as_deref(), Some("timeout"));
    assert_eq!(stored.version, 0);
    assert_eq!(stored.status, TaskStatus::Created);
}

#[tokio::test]
async fn test_external_ref_and_owner_listing() {
    let store = test_store().await;
    let open = store
        .insert_task(&new_task("a", t0()), t0())
        .await
        .unwrap()
        .into_task();
    let done = store
        .insert_task(&new_task("b", t0()), t0())
        .await
        .unwrap()
        .into_task();
    let next = apply(&done, &TaskEvent::Complete, t0(), &LifecyclePolicy::default())
        .unwrap()
        .task;
    store.compare_and_set(&done, &next).await.unwrap();
    store.set_external_ref(&open.id, Some("evt-1")).await.unwrap();

    let listed = store.tasks_for_owner("42", false).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].external_event_ref.as_deref(), Some("evt-1"));
    assert_eq!(store.tasks_for_owner("42", true).await.unwrap().len(), 2);
    assert!(store.tasks_for_owner("7", true).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stats_counts_stuck_tasks() {
    let store = test_store().await;
    let task = store
        .insert_task(&new_task("a", t0()), t0())
        .await
        .unwrap()
        .into_task();
    store.insert_task(&new_task("b", t0()), t0()).await.unwrap();
    let promoted = apply(&task, &TaskEvent::Promote, t0(), &LifecyclePolicy::default())
        .unwrap()
        .task;
    store.compare_and_set(&task, &promoted).await.unwrap();
    store
        .record_attempt_failure(&task.id, promoted.version, "down")
        .await
        .unwrap();

    let stats = store.stats(1).await.unwrap();
    assert_eq!(stats.created, 1);
    assert_eq!(stats.scheduled, 1);
    assert_eq!(stats.stuck, 1);
    assert_eq!(stats.completed, 0);

    // One failure out of three allowed is a retry in progress, not stuck.
    assert_eq!(store.stats(3).await.unwrap().stuck, 0);
}

#[tokio::test]
async fn test_user_timezone() {
    let store = test_store().await;
    assert!(store.register_user("42", t0()).await.unwrap());
    assert!(!store.register_user("42", t0()).await.unwrap());
    assert_eq!(store.get_timezone("42").await.unwrap(), None);

    store.set_timezone("42", "Europe/Moscow", t0()).await.unwrap();
    assert_eq!(
        store.get_timezone("42").await.unwrap().as_deref(),
        Some("Europe/Moscow")
    );

    store.set_timezone("7", "Asia/Tokyo", t0()).await.unwrap();
    assert_eq!(
        store.get_timezone("7").await.unwrap().as_deref(),
        Some("Asia/Tokyo")
    );
    assert_eq!(store.get_timezone("nobody").await.unwrap(), None);
}

#[tokio::test]
async fn test_audit_history() {
    let store = test_store().await;
    let audit = AuditLogger::new(store.pool().clone());
    for (event, from, to) in [
        ("create", None, TaskStatus::Created),
        ("promote", Some(TaskStatus::Created), TaskStatus::Scheduled),
    ] {
        audit
            .log(&AuditEntry {
                task_id: "t1".into(),
                event: event.into(),
                from_status: from,
                to_status: to,
                detail: None,
                at: t0(),
            })
            .await
            .unwrap();
    }

    let history = audit.history("t1").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].event, "create");
    assert_eq!(history[0].from_status, None);
    assert_eq!(history[1].to_status, TaskStatus::Scheduled);
    assert!(audit.history("t2").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_migrations_are_idempotent() {
    let store = test_store().await;
    Store::run_migrations(store.pool()).await.unwrap();
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM _migrations")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(count, 2);
}
