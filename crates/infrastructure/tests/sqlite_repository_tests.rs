use std::collections::HashSet;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};
use taskq_domain::entities::{NewCronTask, NewTask, TaskFilter, TaskStatus, WorkerStatus};
use taskq_domain::value_objects::{QueueDepth, RetryDecision, RetryTransition};
use taskq_errors::QueueError;
use taskq_infrastructure::{DatabaseManager, DatabasePool};

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

async fn memory_db() -> DatabaseManager {
    DatabaseManager::connect("sqlite::memory:").await.unwrap()
}

fn retry_at(retry_count: i32, failed_at: DateTime<Utc>, delay: Duration) -> RetryDecision {
    RetryDecision {
        retry_count,
        failed_at,
        transition: RetryTransition::Retry {
            next_retry_at: failed_at + delay,
        },
    }
}

fn dead_letter(retry_count: i32, failed_at: DateTime<Utc>) -> RetryDecision {
    RetryDecision {
        retry_count,
        failed_at,
        transition: RetryTransition::DeadLetter,
    }
}

#[tokio::test]
async fn test_claim_follows_priority_then_fifo() {
    let db = memory_db().await;
    let tasks = db.task_repository();
    let t0 = base_time();

    let low = tasks
        .enqueue(&NewTask::new("echo", json!({"n": 1})).with_created_at(t0))
        .await
        .unwrap();
    let high_late = tasks
        .enqueue(
            &NewTask::new("echo", json!({"n": 2}))
                .with_priority(10)
                .with_created_at(t0 + Duration::seconds(2)),
        )
        .await
        .unwrap();
    let high_early = tasks
        .enqueue(
            &NewTask::new("echo", json!({"n": 3}))
                .with_priority(10)
                .with_created_at(t0 + Duration::seconds(1)),
        )
        .await
        .unwrap();

    let now = t0 + Duration::minutes(1);
    let order: Vec<i64> = {
        let mut ids = Vec::new();
        while let Some(task) = tasks.claim_next(now).await.unwrap() {
            assert_eq!(task.status, TaskStatus::Processing);
            assert_eq!(task.started_at, Some(now));
            ids.push(task.id);
        }
        ids
    };

    assert_eq!(order, vec![high_early, high_late, low]);
}

#[tokio::test]
async fn test_claim_on_empty_queue_returns_none() {
    let db = memory_db().await;
    assert!(db
        .task_repository()
        .claim_next(base_time())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_payload_survives_storage() {
    let db = memory_db().await;
    let tasks = db.task_repository();
    let payload = json!({"to": "ops@example.com", "tags": ["a", "b"], "attempt": null});

    let id = tasks
        .enqueue(&NewTask::new("send_email", payload.clone()).with_created_at(base_time()))
        .await
        .unwrap();

    let stored = tasks.get(id).await.unwrap().unwrap();
    assert_eq!(stored.payload, payload);
    assert_eq!(stored.status, TaskStatus::Pending);
    assert_eq!(stored.retry_count, 0);
    assert_eq!(stored.max_retries, 3);
}

#[tokio::test]
async fn test_retry_is_not_claimable_before_next_retry_at() {
    let db = memory_db().await;
    let tasks = db.task_repository();
    let t0 = base_time();

    let id = tasks
        .enqueue(&NewTask::new("flaky", json!({})).with_created_at(t0))
        .await
        .unwrap();
    let claimed = tasks.claim_next(t0).await.unwrap().unwrap();
    assert_eq!(claimed.id, id);

    tasks
        .fail(id, "connection reset", &retry_at(1, t0, Duration::seconds(60)))
        .await
        .unwrap();

    let stored = tasks.get(id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Pending);
    assert_eq!(stored.retry_count, 1);
    assert_eq!(stored.next_retry_at, Some(t0 + Duration::seconds(60)));
    assert_eq!(stored.error.as_deref(), Some("connection reset"));

    assert!(tasks
        .claim_next(t0 + Duration::seconds(59))
        .await
        .unwrap()
        .is_none());
    let reclaimed = tasks
        .claim_next(t0 + Duration::seconds(60))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reclaimed.id, id);
    assert_eq!(reclaimed.retry_count, 1);
}

#[tokio::test]
async fn test_dead_letter_is_terminal_until_reset() {
    let db = memory_db().await;
    let tasks = db.task_repository();
    let t0 = base_time();

    let id = tasks
        .enqueue(&NewTask::new("broken", json!({})).with_created_at(t0))
        .await
        .unwrap();
    tasks.claim_next(t0).await.unwrap().unwrap();
    tasks
        .fail(id, "permanent failure", &dead_letter(4, t0))
        .await
        .unwrap();

    let stored = tasks.get(id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::DeadLetter);
    assert_eq!(stored.retry_count, 4);
    assert_eq!(stored.completed_at, Some(t0));
    assert!(stored.next_retry_at.is_none());
    assert!(tasks
        .claim_next(t0 + Duration::days(1))
        .await
        .unwrap()
        .is_none());

    let reset = tasks.reset_to_pending(id).await.unwrap();
    assert_eq!(reset.status, TaskStatus::Pending);
    assert_eq!(reset.retry_count, 0);
    assert!(reset.error.is_none());
    assert!(reset.started_at.is_none());
    assert!(reset.completed_at.is_none());

    // 对 pending 任务重复重置不报错
    let again = tasks.reset_to_pending(id).await.unwrap();
    assert_eq!(again.status, TaskStatus::Pending);

    assert_eq!(tasks.claim_next(t0).await.unwrap().unwrap().id, id);
}

#[tokio::test]
async fn test_illegal_transitions_are_rejected() {
    let db = memory_db().await;
    let tasks = db.task_repository();
    let t0 = base_time();

    let id = tasks
        .enqueue(&NewTask::new("echo", json!({})).with_created_at(t0))
        .await
        .unwrap();

    let err = tasks.complete(id, t0).await.unwrap_err();
    assert!(matches!(
        err,
        QueueError::InvalidStateTransition { ref from, .. } if from == "pending"
    ));

    tasks.claim_next(t0).await.unwrap().unwrap();
    let err = tasks.reset_to_pending(id).await.unwrap_err();
    assert!(matches!(
        err,
        QueueError::InvalidStateTransition { ref from, .. } if from == "processing"
    ));

    tasks.complete(id, t0 + Duration::seconds(1)).await.unwrap();
    let err = tasks
        .fail(id, "late failure", &dead_letter(1, t0))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::InvalidStateTransition { .. }));

    let err = tasks.complete(9_999, t0).await.unwrap_err();
    assert!(matches!(err, QueueError::TaskNotFound { id: 9_999 }));
    let err = tasks.reset_to_pending(9_999).await.unwrap_err();
    assert!(matches!(err, QueueError::TaskNotFound { id: 9_999 }));
}

#[tokio::test]
async fn test_complete_keeps_previous_error() {
    let db = memory_db().await;
    let tasks = db.task_repository();
    let t0 = base_time();

    let id = tasks
        .enqueue(&NewTask::new("flaky", json!({})).with_created_at(t0))
        .await
        .unwrap();
    tasks.claim_next(t0).await.unwrap();
    tasks
        .fail(id, "timeout", &retry_at(1, t0, Duration::seconds(1)))
        .await
        .unwrap();
    tasks
        .claim_next(t0 + Duration::seconds(5))
        .await
        .unwrap()
        .unwrap();
    tasks.complete(id, t0 + Duration::seconds(6)).await.unwrap();

    let stored = tasks.get(id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert_eq!(stored.completed_at, Some(t0 + Duration::seconds(6)));
    assert!(stored.next_retry_at.is_none());
    assert_eq!(stored.error.as_deref(), Some("timeout"));
}

#[tokio::test]
async fn test_list_count_and_purge() {
    let db = memory_db().await;
    let tasks = db.task_repository();
    let t0 = base_time();

    for i in 0..4 {
        tasks
            .enqueue(
                &NewTask::new(if i % 2 == 0 { "echo" } else { "shell" }, json!({ "i": i }))
                    .with_priority(i)
                    .with_created_at(t0 + Duration::seconds(i as i64)),
            )
            .await
            .unwrap();
    }

    let done = tasks.claim_next(t0).await.unwrap().unwrap();
    tasks.complete(done.id, t0).await.unwrap();
    let dead = tasks.claim_next(t0).await.unwrap().unwrap();
    tasks
        .fail(dead.id, "bad input", &dead_letter(1, t0 + Duration::days(10)))
        .await
        .unwrap();

    let depth = QueueDepth::from_counts(&tasks.count_by_status().await.unwrap());
    assert_eq!(depth.pending, 2);
    assert_eq!(depth.completed, 1);
    assert_eq!(depth.dead_letter, 1);
    assert_eq!(depth.total(), 4);

    let pending = tasks
        .list(&TaskFilter::default().with_status(TaskStatus::Pending))
        .await
        .unwrap();
    assert_eq!(pending.len(), 2);
    assert!(pending[0].priority >= pending[1].priority);

    let echo_only = tasks
        .list(&TaskFilter {
            name: Some("echo".to_string()),
            ..TaskFilter::default()
        })
        .await
        .unwrap();
    assert!(echo_only.iter().all(|t| t.name == "echo"));
    assert_eq!(echo_only.len(), 2);

    let page = tasks
        .list(&TaskFilter::default().page(1, 1))
        .await
        .unwrap();
    assert_eq!(page.len(), 1);

    // 只有 completed_at 早于截止时间的任务被删除
    let purged = tasks
        .purge_finished(t0 + Duration::days(1))
        .await
        .unwrap();
    assert_eq!(purged, 1);
    assert!(tasks.get(done.id).await.unwrap().is_none());
    assert!(tasks.get(dead.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_concurrent_claims_never_share_a_task() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("queue.db").display());
    let db = DatabaseManager::connect(&url).await.unwrap();
    let tasks = db.task_repository();
    let t0 = base_time();

    for i in 0..20 {
        tasks
            .enqueue(&NewTask::new("echo", json!({ "i": i })).with_created_at(t0))
            .await
            .unwrap();
    }

    let claims = (0..30).map(|_| {
        let tasks = tasks.clone();
        async move { tasks.claim_next(t0).await }
    });
    let results = futures::future::join_all(claims).await;

    let mut seen = HashSet::new();
    for result in results {
        if let Some(task) = result.unwrap() {
            assert!(seen.insert(task.id), "任务 {} 被认领了两次", task.id);
        }
    }
    assert_eq!(seen.len(), 20);

    db.close().await;
}

#[tokio::test]
async fn test_cron_fire_advances_schedule_once() {
    let db = memory_db().await;
    let crons = db.cron_task_repository();
    let tasks = db.task_repository();
    let t0 = base_time();

    let def = crons
        .create(&NewCronTask::new(
            "hourly-report",
            "report",
            "0 * * * *",
            json!({"kind": "hourly"}),
        ))
        .await
        .unwrap();
    assert!(def.is_active);
    assert!(def.next_run.is_none());
    assert_eq!(crons.due(t0).await.unwrap().len(), 1);

    let next = t0 + Duration::hours(1);
    let job = NewTask::new(&def.handler, def.payload_template.clone())
        .with_priority(10)
        .with_created_at(t0);
    let task_id = crons
        .fire(def.id, None, t0, next, &job)
        .await
        .unwrap()
        .unwrap();

    // 第二个 worker 持有过期的 next_run，不会重复触发
    assert!(crons.fire(def.id, None, t0, next, &job).await.unwrap().is_none());

    let stored = crons.get(def.id).await.unwrap().unwrap();
    assert_eq!(stored.last_run, Some(t0));
    assert_eq!(stored.next_run, Some(next));
    assert!(crons.due(t0 + Duration::minutes(59)).await.unwrap().is_empty());
    assert_eq!(crons.due(next).await.unwrap().len(), 1);

    let task = tasks.get(task_id).await.unwrap().unwrap();
    assert_eq!(task.name, "report");
    assert_eq!(task.priority, 10);
    assert_eq!(task.payload, json!({"kind": "hourly"}));
    assert_eq!(
        tasks
            .list(&TaskFilter::default())
            .await
            .unwrap()
            .len(),
        1
    );

    let again = crons
        .fire(def.id, Some(next), next, next + Duration::hours(1), &job)
        .await
        .unwrap();
    assert!(again.is_some());
}

#[tokio::test]
async fn test_cron_definitions_management() {
    let db = memory_db().await;
    let crons = db.cron_task_repository();
    let t0 = base_time();

    let def = crons
        .create(&NewCronTask::new("nightly", "echo", "0 2 * * *", json!({})).inactive())
        .await
        .unwrap();
    assert!(!def.is_active);
    assert!(crons.due(t0).await.unwrap().is_empty());

    crons.set_active(def.id, true).await.unwrap();
    assert_eq!(crons.due(t0).await.unwrap().len(), 1);
    assert_eq!(
        crons.get_by_name("nightly").await.unwrap().unwrap().id,
        def.id
    );

    let err = crons
        .create(&NewCronTask::new("nightly", "echo", "0 3 * * *", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Validation(_)));

    let err = crons.set_active(404, false).await.unwrap_err();
    assert!(matches!(err, QueueError::CronTaskNotFound { id: 404 }));

    assert_eq!(crons.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_heartbeat_counters_accumulate() {
    let db = memory_db().await;
    let heartbeats = db.heartbeat_repository();
    let t0 = base_time();

    heartbeats.beat("w-1", "host-a", 3, 1, t0).await.unwrap();
    heartbeats
        .beat("w-1", "host-a", 2, 0, t0 + Duration::seconds(30))
        .await
        .unwrap();

    let hb = heartbeats.get("w-1").await.unwrap().unwrap();
    assert_eq!(hb.tasks_processed, 5);
    assert_eq!(hb.tasks_failed, 1);
    assert_eq!(hb.last_heartbeat, t0 + Duration::seconds(30));
    assert_eq!(hb.status, WorkerStatus::Running);

    heartbeats
        .mark_stopped("w-1", t0 + Duration::minutes(1))
        .await
        .unwrap();
    let hb = heartbeats.get("w-1").await.unwrap().unwrap();
    assert_eq!(hb.status, WorkerStatus::Stopped);
    assert_eq!(hb.tasks_processed, 5);

    let err = heartbeats.mark_stopped("ghost", t0).await.unwrap_err();
    assert!(matches!(err, QueueError::WorkerNotFound { .. }));

    heartbeats.beat("w-2", "host-b", 0, 0, t0).await.unwrap();
    assert_eq!(heartbeats.list().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_claim_hands_over_non_json_payload_as_string() {
    let db = memory_db().await;
    let pool = match db.pool() {
        DatabasePool::SQLite(pool) => pool.clone(),
        DatabasePool::PostgreSQL(_) => panic!("expected sqlite pool"),
    };
    // 外部写入的行，payload 不是JSON
    sqlx::query(
        "INSERT INTO tasks (name, payload, priority, status, retry_count, max_retries, created_at) \
         VALUES ('echo', 'plain text', 0, 'pending', 0, 3, $1)",
    )
    .bind(base_time())
    .execute(&pool)
    .await
    .unwrap();

    let tasks = db.task_repository();
    let task = tasks
        .claim_next(base_time() + Duration::minutes(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Processing);
    assert_eq!(task.payload, Value::String("plain text".to_string()));

    tasks
        .complete(task.id, base_time() + Duration::minutes(2))
        .await
        .unwrap();
    let stored = tasks.get(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_store_enqueue_does_not_validate() {
    let db = memory_db().await;
    let tasks = db.task_repository();

    let id = tasks
        .enqueue(&NewTask::new("", json!({})).with_created_at(base_time()))
        .await
        .unwrap();
    let task = tasks.get(id).await.unwrap().unwrap();
    assert_eq!(task.name, "");
    assert_eq!(task.status, TaskStatus::Pending);
}
