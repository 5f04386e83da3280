//! Test suite for the job execution pipeline
//!
//! Business retries, contention retries of the failure listener, panic
//! wrapping and the success path.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use procflow::core::{init_test_tracing, ManualClock, SystemClock};
use procflow::execution::{ExecutionId, ExecutionTree};
use procflow::jobs::{CommandContext, JobHandler, JobOutcome, JobRecord};
use procflow::storage::{Expected, Write, WriteBatch};
use procflow::{EngineConfig, EngineError, MemoryStorage, ProcessEngine, Result, Storage};

/// How the contended storage interferes with commits touching the watched job
#[derive(Clone, Copy)]
enum Interference {
    /// Another writer updates the job just before the commit
    ConcurrentUpdate,
    /// The commit lands but the caller is told it conflicted
    CommitThenConflict,
}

/// Storage that injects optimistic locking conflicts into the first `conflicts` job writes
struct ContendedStorage {
    inner: MemoryStorage,
    job_id: String,
    conflicts: AtomicU32,
    mode: Interference,
}

impl ContendedStorage {
    fn touches_job(&self, batch: &WriteBatch) -> bool {
        batch.writes().iter().any(|w| match w {
            Write::PutJob { job, .. } => job.id == self.job_id,
            _ => false,
        })
    }

    fn take_conflict(&self) -> bool {
        self.conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Storage for ContendedStorage {
    async fn load_process(&self, process_instance_id: &str) -> Result<Option<ExecutionTree>> {
        self.inner.load_process(process_instance_id).await
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        self.inner.get_job(job_id).await
    }

    async fn jobs_for_execution(
        &self,
        process_instance_id: &str,
        execution: ExecutionId,
    ) -> Result<Vec<JobRecord>> {
        self.inner
            .jobs_for_execution(process_instance_id, execution)
            .await
    }

    async fn acquirable_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobRecord>> {
        self.inner.acquirable_jobs(now, limit).await
    }

    async fn list_jobs(&self) -> Result<Vec<JobRecord>> {
        self.inner.list_jobs().await
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        if !self.touches_job(&batch) || !self.take_conflict() {
            return self.inner.commit(batch).await;
        }
        match self.mode {
            Interference::ConcurrentUpdate => {
                let current = self.inner.get_job(&self.job_id).await?.unwrap();
                let version = current.version;
                let mut touch = WriteBatch::new();
                touch.put_job(current, Expected::Version(version));
                self.inner.commit(touch).await?;
                self.inner.commit(batch).await
            }
            Interference::CommitThenConflict => {
                self.inner.commit(batch).await?;
                Err(EngineError::optimistic_lock(
                    "job",
                    self.job_id.clone(),
                    None,
                    None,
                ))
            }
        }
    }
}

struct FailingHandler {
    calls: AtomicU32,
}

#[async_trait]
impl JobHandler for FailingHandler {
    fn handler_type(&self) -> &str {
        "charge-card"
    }

    async fn execute(&self, _job: &JobRecord, _cx: &mut CommandContext) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(anyhow::anyhow!("payment service unavailable").into())
    }
}

struct PanickingHandler;

#[async_trait]
impl JobHandler for PanickingHandler {
    fn handler_type(&self) -> &str {
        "explode"
    }

    async fn execute(&self, _job: &JobRecord, _cx: &mut CommandContext) -> Result<()> {
        panic!("handler exploded");
    }
}

struct ConflictingHandler;

#[async_trait]
impl JobHandler for ConflictingHandler {
    fn handler_type(&self) -> &str {
        "join-branch"
    }

    async fn execute(&self, _job: &JobRecord, _cx: &mut CommandContext) -> Result<()> {
        Err(EngineError::optimistic_lock("process", "pi-1", Some(3), Some(4)))
    }
}

struct SucceedingHandler {
    calls: AtomicU32,
}

#[async_trait]
impl JobHandler for SucceedingHandler {
    fn handler_type(&self) -> &str {
        "send-mail"
    }

    async fn execute(&self, _job: &JobRecord, _cx: &mut CommandContext) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn seed_job(storage: &dyn Storage, job: JobRecord) -> String {
    let id = job.id.clone();
    let mut batch = WriteBatch::new();
    batch.put_job(job, Expected::Absent);
    storage.commit(batch).await.unwrap();
    id
}

fn engine_on(storage: Arc<dyn Storage>) -> ProcessEngine {
    ProcessEngine::with_storage(EngineConfig::development(), storage, Arc::new(SystemClock)).unwrap()
}

// A job with 3 retries that keeps failing ends at 0 and is rejected afterwards
#[tokio::test]
async fn test_business_retries_decrement_to_exhaustion() {
    init_test_tracing();

    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let engine = engine_on(Arc::clone(&storage));
    let handler = Arc::new(FailingHandler {
        calls: AtomicU32::new(0),
    });
    engine.register_handler(handler.clone());
    let job_id = seed_job(storage.as_ref(), JobRecord::new("charge-card", 3, Utc::now())).await;

    for expected_retries in [2, 1, 0] {
        let err = engine.execute_job(&job_id).await.unwrap_err();
        assert!(matches!(err, EngineError::Handler(_)));
        assert_eq!(err.to_string(), "payment service unavailable");

        let job = storage.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.retries, expected_retries);
        assert_eq!(
            job.exception_message.as_deref(),
            Some("payment service unavailable")
        );
        assert!(job.lock_owner.is_none());
    }

    // exhausted jobs are never handed to workers again
    let far_future = Utc::now() + chrono::Duration::days(365);
    assert!(storage
        .acquirable_jobs(far_future, 10)
        .await
        .unwrap()
        .is_empty());

    // a forced fourth attempt is rejected without running the handler
    let err = engine.execute_job(&job_id).await.unwrap_err();
    assert!(matches!(err, EngineError::RetriesExhausted { .. }));
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

    let job = storage.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.retries, 0);
    assert_eq!(
        job.exception_message.as_deref(),
        Some("payment service unavailable")
    );

    let metrics = engine.pipeline().metrics().snapshot();
    assert_eq!(metrics.jobs_failed, 3);
    assert_eq!(metrics.jobs_exhausted, 1);
}

// Conflicts on the first k listener commits are retried and decrement exactly once
#[tokio::test]
async fn test_listener_contention_retried_below_bound() {
    init_test_tracing();

    let max = EngineConfig::development().failed_job_listener_max_retries;
    for k in 0..max {
        let job = JobRecord::new("charge-card", 3, Utc::now());
        let storage = Arc::new(ContendedStorage {
            inner: MemoryStorage::new(),
            job_id: job.id.clone(),
            conflicts: AtomicU32::new(k),
            mode: Interference::ConcurrentUpdate,
        });
        let job_id = seed_job(&storage.inner, job).await;
        let engine = engine_on(storage.clone());
        engine.register_handler(Arc::new(FailingHandler {
            calls: AtomicU32::new(0),
        }));

        let err = engine.execute_job(&job_id).await.unwrap_err();
        assert!(matches!(err, EngineError::Handler(_)), "k = {k}");

        let job = storage.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.retries, 2, "k = {k}");
        // seeded at 1, one bump per injected conflict, then the listener's own write
        assert_eq!(job.version, 1 + k as u64 + 1, "k = {k}");
        assert_eq!(
            engine.pipeline().metrics().snapshot().listener_conflicts,
            k as u64
        );
    }
}

// Once the bound is reached the unrecorded failure replaces the business error
#[tokio::test]
async fn test_listener_contention_exhausted_propagates_conflict() {
    let max = EngineConfig::development().failed_job_listener_max_retries;
    let job = JobRecord::new("charge-card", 3, Utc::now());
    let storage = Arc::new(ContendedStorage {
        inner: MemoryStorage::new(),
        job_id: job.id.clone(),
        conflicts: AtomicU32::new(max),
        mode: Interference::ConcurrentUpdate,
    });
    let job_id = seed_job(&storage.inner, job).await;
    let engine = engine_on(storage.clone());
    engine.register_handler(Arc::new(FailingHandler {
        calls: AtomicU32::new(0),
    }));

    match engine.execute_job(&job_id).await {
        Err(EngineError::FailureNotRecorded {
            job_id: failed,
            source,
        }) => {
            assert_eq!(failed, job_id);
            assert!(source.is_optimistic_lock());
        }
        other => panic!("expected unrecorded failure, got {other:?}"),
    }

    let job = storage.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.retries, 3);
    assert!(job.exception_message.is_none());
}

// A commit that landed before the conflict was reported is not applied twice
#[tokio::test]
async fn test_listener_retry_after_landed_commit_does_not_double_decrement() {
    let job = JobRecord::new("charge-card", 3, Utc::now());
    let storage = Arc::new(ContendedStorage {
        inner: MemoryStorage::new(),
        job_id: job.id.clone(),
        conflicts: AtomicU32::new(1),
        mode: Interference::CommitThenConflict,
    });
    let job_id = seed_job(&storage.inner, job).await;
    let engine = engine_on(storage.clone());
    engine.register_handler(Arc::new(FailingHandler {
        calls: AtomicU32::new(0),
    }));

    let err = engine.execute_job(&job_id).await.unwrap_err();
    assert!(matches!(err, EngineError::Handler(_)));

    let job = storage.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.retries, 2);
    assert_eq!(engine.pipeline().metrics().snapshot().jobs_failed, 1);
}

// A conflict inside the job's own command is an ordinary, recorded failure
#[tokio::test]
async fn test_business_conflict_recorded_as_failure() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let engine = engine_on(Arc::clone(&storage));
    engine.register_handler(Arc::new(ConflictingHandler));
    let job_id = seed_job(storage.as_ref(), JobRecord::new("join-branch", 3, Utc::now())).await;

    let err = engine.execute_job(&job_id).await.unwrap_err();
    assert!(err.is_optimistic_lock());
    assert!(!matches!(err, EngineError::FailureNotRecorded { .. }));

    let job = storage.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.retries, 2);
    assert!(job
        .exception_message
        .as_deref()
        .unwrap()
        .contains("process 'pi-1'"));

    let metrics = engine.pipeline().metrics().snapshot();
    assert_eq!(metrics.jobs_failed, 1);
    assert_eq!(metrics.listener_conflicts, 0);
}

// A panicking handler surfaces as a wrapped failure carrying the job id
#[tokio::test]
async fn test_panic_is_wrapped_and_recorded() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let engine = engine_on(Arc::clone(&storage));
    engine.register_handler(Arc::new(PanickingHandler));
    let job_id = seed_job(storage.as_ref(), JobRecord::new("explode", 3, Utc::now())).await;

    match engine.execute_job(&job_id).await {
        Err(EngineError::JobExecutionFailed {
            job_id: failed,
            message,
        }) => {
            assert_eq!(failed, job_id);
            assert!(message.contains("handler exploded"));
        }
        other => panic!("expected wrapped failure, got {other:?}"),
    }

    let job = storage.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.retries, 2);
    assert!(job
        .exception_message
        .as_deref()
        .unwrap()
        .contains("handler exploded"));
}

// Success deletes the job and runs the success listener once
#[tokio::test]
async fn test_success_deletes_job() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let engine = engine_on(Arc::clone(&storage));
    let handler = Arc::new(SucceedingHandler {
        calls: AtomicU32::new(0),
    });
    engine.register_handler(handler.clone());
    let job_id = seed_job(storage.as_ref(), JobRecord::new("send-mail", 3, Utc::now())).await;

    assert_eq!(
        engine.execute_job(&job_id).await.unwrap(),
        JobOutcome::Succeeded
    );
    assert!(storage.get_job(&job_id).await.unwrap().is_none());
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

    let metrics = engine.pipeline().metrics().snapshot();
    assert_eq!(metrics.jobs_succeeded, 1);
    assert_eq!(metrics.jobs_failed, 0);
}

// A job that no longer exists is skipped without listeners
#[tokio::test]
async fn test_vanished_job_skips_listeners() {
    let engine = engine_on(Arc::new(MemoryStorage::new()));
    assert_eq!(
        engine.execute_job("no-such-job").await.unwrap(),
        JobOutcome::Vanished
    );
    let metrics = engine.pipeline().metrics().snapshot();
    assert_eq!(metrics.jobs_succeeded + metrics.jobs_failed, 0);
}

// A job whose execution is gone is deleted instead of dispatched
#[tokio::test]
async fn test_orphaned_job_not_dispatched() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let engine = engine_on(Arc::clone(&storage));
    let handler = Arc::new(SucceedingHandler {
        calls: AtomicU32::new(0),
    });
    engine.register_handler(handler.clone());

    let job = JobRecord::new("send-mail", 3, Utc::now()).for_execution("gone", ExecutionId(4));
    let job_id = seed_job(storage.as_ref(), job).await;

    assert_eq!(
        engine.execute_job(&job_id).await.unwrap(),
        JobOutcome::Orphaned
    );
    assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    assert!(storage.get_job(&job_id).await.unwrap().is_none());
}

// An unknown job type is a failure like any other
#[tokio::test]
async fn test_missing_handler_recorded_as_failure() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let engine = engine_on(Arc::clone(&storage));
    let job_id = seed_job(storage.as_ref(), JobRecord::new("unknown", 3, Utc::now())).await;

    let err = engine.execute_job(&job_id).await.unwrap_err();
    assert!(matches!(err, EngineError::HandlerNotFound { .. }));
    assert_eq!(storage.get_job(&job_id).await.unwrap().unwrap().retries, 2);
}

// A failed attempt pushes the due date by the configured delay
#[tokio::test]
async fn test_failure_pushes_due_date() {
    let start = Utc::now();
    let clock = Arc::new(ManualClock::new(start));
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let config = EngineConfig::builder()
        .failed_job_retry_delay(Duration::from_secs(60))
        .build()
        .unwrap();
    let engine = ProcessEngine::with_storage(config, Arc::clone(&storage), clock.clone()).unwrap();
    engine.register_handler(Arc::new(FailingHandler {
        calls: AtomicU32::new(0),
    }));
    let job_id = seed_job(storage.as_ref(), JobRecord::new("charge-card", 3, start)).await;

    assert!(engine.execute_job(&job_id).await.is_err());

    let job = storage.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.due_date, start + chrono::Duration::seconds(60));
    assert!(!job.is_acquirable(start));
    assert!(job.is_acquirable(start + chrono::Duration::seconds(60)));
}
