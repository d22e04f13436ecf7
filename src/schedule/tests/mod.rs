use super::*;
use crate::concurrent::JobCancelled;
use crate::storage::task::memory::InMemoryTaskStorage;
use crate::storage::task::sqlite::SqliteTaskStorage;
use crate::storage::task::{TaskQuery, TaskService, TaskStats};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

type Script = Arc<dyn Fn(&Task, &JobContext) -> Result<JobOutput> + Send + Sync>;

// In-process runner whose job body is supplied by the test.
struct ScriptedRunner {
    task_type: TaskType,
    available: AtomicBool,
    runs: AtomicUsize,
    script: Script,
}

impl ScriptedRunner {
    fn new<F>(task_type: TaskType, script: F) -> Arc<Self>
    where
        F: Fn(&Task, &JobContext) -> Result<JobOutput> + Send + Sync + 'static,
    {
        Arc::new(Self {
            task_type,
            available: AtomicBool::new(true),
            runs: AtomicUsize::new(0),
            script: Arc::new(script),
        })
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl JobRunner for ScriptedRunner {
    fn task_type(&self) -> TaskType {
        self.task_type
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn unavailable_reason(&self) -> String {
        "scripted tool missing".to_string()
    }

    fn create_task(&self, request: TaskRequest) -> Result<Task, ServiceError> {
        let url = request
            .url_str()
            .ok_or_else(|| ServiceError::validation("url is required"))?
            .to_string();
        let mut task = request.into_task(self.task_type);
        task.file_name = format!("{}.mp4", url);
        task.set_source(DownloadSource::Bilibili);
        Ok(task)
    }

    fn run(&self, task: &Task, ctx: &JobContext) -> Result<JobOutput> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        (self.script)(task, ctx)
    }
}

// In-memory store whose writes can be slowed down or made to fail.
#[derive(Default)]
struct FlakyStorage {
    inner: InMemoryTaskStorage,
    fail_writes: AtomicBool,
    write_delay: Duration,
    failed_writes: AtomicUsize,
}

impl FlakyStorage {
    fn failing() -> Self {
        Self {
            fail_writes: AtomicBool::new(true),
            ..Self::default()
        }
    }

    fn slow(write_delay: Duration) -> Self {
        Self {
            write_delay,
            ..Self::default()
        }
    }

    async fn write(&self) -> Result<()> {
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            self.failed_writes.fetch_add(1, Ordering::SeqCst);
            return Err(anyhow!("disk I/O error"));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStorage for FlakyStorage {
    async fn upsert(&self, task: &Task) -> Result<()> {
        self.write().await?;
        self.inner.upsert(task).await
    }

    async fn get(&self, task_id: &str) -> Result<Option<Task>> {
        self.inner.get(task_id).await
    }

    async fn list(&self, query: &TaskQuery) -> Result<Vec<Task>> {
        self.inner.list(query).await
    }

    async fn delete(&self, task_id: &str) -> Result<bool> {
        self.write().await?;
        self.inner.delete(task_id).await
    }

    async fn delete_by_status(&self, status: TaskStatus) -> Result<u64> {
        self.write().await?;
        self.inner.delete_by_status(status).await
    }

    async fn update_status(&self, task_id: &str, status: TaskStatus, at: DateTime<Utc>) -> Result<bool> {
        self.write().await?;
        self.inner.update_status(task_id, status, at).await
    }

    async fn update_progress(
        &self,
        task_id: &str,
        progress: f64,
        speed: &str,
        eta: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        self.write().await?;
        self.inner
            .update_progress(task_id, progress, speed, eta, at)
            .await
    }

    async fn statistics(&self, since: DateTime<Utc>) -> Result<TaskStats> {
        self.inner.statistics(since).await
    }

    async fn cleanup_old(&self, before: DateTime<Utc>, keep_successful: bool) -> Result<u64> {
        self.write().await?;
        self.inner.cleanup_old(before, keep_successful).await
    }
}

struct Harness {
    service: BaseService,
    db: TaskService,
    events: broadcast::Receiver<TaskEvent>,
}

impl Harness {
    async fn new(runner: Arc<ScriptedRunner>) -> Result<Self> {
        Self::with_storage(runner, Arc::new(SqliteTaskStorage::in_memory().await?))
    }

    fn with_storage(runner: Arc<ScriptedRunner>, storage: Arc<dyn TaskStorage>) -> Result<Self> {
        let db = TaskService::new(storage);
        let bus = EventBus::new(256);
        let events = bus.subscribe();
        let ctx = ServiceContext::new(db.clone(), bus, test_settings());
        let service = BaseService::new(runner, &ctx)?;
        Ok(Self { service, db, events })
    }

    // lifecycle events only, log lines dropped
    fn drain_events(&mut self) -> Vec<TaskEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if !matches!(event, TaskEvent::Log { .. }) {
                drained.push(event);
            }
        }
        drained
    }

    async fn stored(&self, task_id: &str) -> Task {
        self.db.get(task_id).await.expect("task should be stored")
    }
}

fn test_settings() -> ServiceSettings {
    ServiceSettings {
        max_workers: 2,
        shutdown_timeout: Duration::from_millis(200),
        log_cache_size: 100,
    }
}

fn succeed_with_output() -> Arc<ScriptedRunner> {
    ScriptedRunner::new(TaskType::Download, |_, ctx| {
        ctx.progress(ProgressUpdate::new(50.0).with_speed("1MiB/s").with_eta("00:01"));
        ctx.info("halfway");
        Ok(JobOutput::file("/out/file.mp4"))
    })
}

/// A job that blocks until the test sends on the returned channel.
fn gated_runner() -> (Arc<ScriptedRunner>, std_mpsc::Sender<()>) {
    let (release_tx, release_rx) = std_mpsc::channel::<()>();
    let release_rx = Mutex::new(release_rx);
    let runner = ScriptedRunner::new(TaskType::Download, move |_, _| {
        let _ = release_rx.lock().unwrap().recv_timeout(Duration::from_secs(5));
        Ok(JobOutput::default())
    });
    (runner, release_tx)
}

async fn wait_for_runs(runner: &ScriptedRunner, runs: usize) {
    for _ in 0..500 {
        if runner.runs() >= runs {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job never started");
}

fn status_of(event: &TaskEvent) -> Option<TaskStatus> {
    event.task().map(|task| task.status)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_download_success_lifecycle() -> Result<()> {
    let mut h = Harness::new(succeed_with_output()).await?;

    let task = h.service.create_task(TaskRequest::from_url("BVxxxxxx")).await?;
    assert_eq!(task.status, TaskStatus::Running);
    assert!(task.start_time.is_some());
    assert_eq!(task.file_name, "BVxxxxxx.mp4");
    assert!(h.service.is_in_flight(&task.id));
    assert_eq!(h.stored(&task.id).await.status, TaskStatus::Running);

    h.service.run_until_idle().await;

    let done = h.stored(&task.id).await;
    assert_eq!(done.status, TaskStatus::Success);
    assert_eq!(done.progress, 100.0);
    assert_eq!(done.speed, "1MiB/s");
    assert_eq!(done.output_path, "/out/file.mp4");
    assert!(done.end_time.is_some());
    assert!(done.error_msg.is_empty());
    assert!(!h.service.is_in_flight(&task.id));

    let events = h.drain_events();
    let statuses: Vec<_> = events.iter().filter_map(status_of).collect();
    assert_eq!(
        statuses,
        vec![
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Running,
            TaskStatus::Success,
        ]
    );
    assert!(matches!(events[0], TaskEvent::Created { .. }));
    match events.last() {
        Some(TaskEvent::Finished {
            success, error_msg, ..
        }) => {
            assert!(*success);
            assert_eq!(error_msg, "");
        }
        other => panic!("unexpected event: {:?}", other),
    }
    assert!(h.service.logs().any(|entry| entry.message == "halfway"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_job_records_error() -> Result<()> {
    let runner = ScriptedRunner::new(TaskType::Download, |_, _| {
        Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no such video").into())
    });
    let mut h = Harness::new(runner).await?;

    let task = h.service.create_task(TaskRequest::from_url("BVxxxxxx")).await?;
    h.service.run_until_idle().await;

    let failed = h.stored(&task.id).await;
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.error_msg, "no such video");
    assert_eq!(failed.error_code, "io_error");
    assert!(failed.end_time.is_some());
    assert!(failed.can_retry());

    match h.drain_events().last() {
        Some(TaskEvent::Finished {
            success, error_msg, ..
        }) => {
            assert!(!*success);
            assert_eq!(error_msg, "no such video");
        }
        other => panic!("unexpected event: {:?}", other),
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_job_fails_task() -> Result<()> {
    let runner = ScriptedRunner::new(TaskType::Download, |_, _| panic!("decoder crashed"));
    let mut h = Harness::new(runner).await?;

    let task = h.service.create_task(TaskRequest::from_url("BVxxxxxx")).await?;
    h.service.run_until_idle().await;

    let failed = h.stored(&task.id).await;
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(failed.error_msg.contains("decoder crashed"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_ignores_late_progress() -> Result<()> {
    let (started_tx, started_rx) = std_mpsc::channel::<()>();
    let (done_tx, done_rx) = std_mpsc::channel::<()>();
    let started_tx = Mutex::new(started_tx);
    let done_tx = Mutex::new(done_tx);
    let runner = ScriptedRunner::new(TaskType::Download, move |_, ctx| {
        let _ = started_tx.lock().unwrap().send(());
        while !ctx.is_cancelled() {
            std::thread::sleep(Duration::from_millis(5));
        }
        // a job that ignores the request and keeps reporting
        ctx.set_progress(50.0);
        let _ = done_tx.lock().unwrap().send(());
        Ok(JobOutput::file("/out/late.mp4"))
    });
    let mut h = Harness::new(runner).await?;

    let task = h.service.create_task(TaskRequest::from_url("BVxxxxxx")).await?;
    tokio::task::spawn_blocking(move || started_rx.recv_timeout(Duration::from_secs(5))).await??;
    assert!(h.service.cancel(&task.id).await);
    assert!(!h.service.is_in_flight(&task.id));

    let cancelled = h.stored(&task.id).await;
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert!(cancelled.end_time.is_some());

    tokio::task::spawn_blocking(move || done_rx.recv_timeout(Duration::from_secs(5))).await??;
    h.service.process_pending().await;

    let after = h.stored(&task.id).await;
    assert_eq!(after.status, TaskStatus::Cancelled);
    assert_eq!(after.progress, 0.0);
    assert!(after.output_path.is_empty());

    let events = h.drain_events();
    assert!(matches!(
        events.last(),
        Some(TaskEvent::Updated { task, .. }) if task.status == TaskStatus::Cancelled
    ));
    assert!(!events.iter().any(|e| matches!(e, TaskEvent::Finished { .. })));

    assert!(!h.service.cancel(&task.id).await);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_job_observing_cancel_ends_cancelled() -> Result<()> {
    let runner = ScriptedRunner::new(TaskType::Download, |_, ctx| {
        ctx.checkpoint()?;
        Err(JobCancelled.into())
    });
    let mut h = Harness::new(runner).await?;

    let task = h.service.create_task(TaskRequest::from_url("BVxxxxxx")).await?;
    h.service.run_until_idle().await;

    assert_eq!(h.stored(&task.id).await.status, TaskStatus::Cancelled);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_failed_task() -> Result<()> {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let runner = ScriptedRunner::new(TaskType::Download, move |_, ctx| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            ctx.set_progress(30.0);
            return Err(anyhow!("network dropped"));
        }
        Ok(JobOutput::file("/out/file.mp4"))
    });
    let mut h = Harness::new(runner).await?;

    let task = h.service.create_task(TaskRequest::from_url("BVxxxxxx")).await?;
    h.service.run_until_idle().await;
    let mut failed = h.stored(&task.id).await;
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.progress, 30.0);
    h.drain_events();

    assert!(h.service.restart(&mut failed).await);
    assert_eq!(failed.status, TaskStatus::Running);
    assert_eq!(failed.progress, 0.0);
    assert!(failed.error_msg.is_empty());
    assert!(failed.end_time.is_none());
    assert!(failed.start_time.is_some());

    let statuses: Vec<_> = h.drain_events().iter().filter_map(status_of).collect();
    assert_eq!(statuses, vec![TaskStatus::Pending, TaskStatus::Running]);

    h.service.run_until_idle().await;
    let done = h.stored(&task.id).await;
    assert_eq!(done.status, TaskStatus::Success);
    assert_eq!(done.progress, 100.0);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_start_is_rejected() -> Result<()> {
    let (runner, release) = gated_runner();
    let mut h = Harness::new(runner.clone()).await?;

    let mut task = h.service.create_task(TaskRequest::from_url("BVxxxxxx")).await?;
    let before = h.stored(&task.id).await;
    h.drain_events();

    assert!(!h.service.start(&mut task).await);
    assert_eq!(h.stored(&task.id).await, before);
    assert!(h.drain_events().is_empty());

    release.send(())?;
    h.service.run_until_idle().await;
    assert_eq!(runner.runs(), 1);
    assert_eq!(h.stored(&task.id).await.status, TaskStatus::Success);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_refuses_finished_task() -> Result<()> {
    let mut h = Harness::new(succeed_with_output()).await?;
    let task = h.service.create_task(TaskRequest::from_url("BVxxxxxx")).await?;
    h.service.run_until_idle().await;

    let mut done = h.stored(&task.id).await;
    assert!(!h.service.start(&mut done).await);
    assert_eq!(h.stored(&task.id).await.status, TaskStatus::Success);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_validation_and_availability_errors() -> Result<()> {
    let runner = succeed_with_output();
    let mut h = Harness::new(runner.clone()).await?;

    let err = h.service.create_task(TaskRequest::default()).await.unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));

    runner.available.store(false, Ordering::SeqCst);
    let err = h
        .service
        .create_task(TaskRequest::from_url("BVxxxxxx"))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ServiceError::Unavailable(TaskType::Download, "scripted tool missing".to_string())
    );

    assert!(h.db.list_by(&TaskQuery::new()).await.is_empty());
    assert!(h.drain_events().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deferred_task_stays_pending() -> Result<()> {
    let mut h = Harness::new(succeed_with_output()).await?;
    let mut task = h
        .service
        .create_task(TaskRequest::from_url("BVxxxxxx").deferred())
        .await?;
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(!h.service.is_in_flight(&task.id));

    assert!(h.service.start(&mut task).await);
    h.service.run_until_idle().await;
    assert_eq!(h.stored(&task.id).await.status, TaskStatus::Success);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pause_and_resume() -> Result<()> {
    let steps = Arc::new(AtomicUsize::new(0));
    let counter = steps.clone();
    let runner = ScriptedRunner::new(TaskType::Download, move |_, ctx| {
        for step in 1..=20 {
            ctx.checkpoint()?;
            counter.store(step, Ordering::SeqCst);
            ctx.set_progress(step as f64 * 5.0);
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok(JobOutput::default())
    });
    let mut h = Harness::new(runner).await?;

    let task = h.service.create_task(TaskRequest::from_url("BVxxxxxx")).await?;
    assert!(h.service.pause(&task.id).await);
    assert!(!h.service.pause(&task.id).await);
    assert_eq!(h.stored(&task.id).await.status, TaskStatus::Paused);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let parked_at = steps.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(steps.load(Ordering::SeqCst), parked_at);

    // progress while paused keeps the paused status
    h.service.process_pending().await;
    assert_eq!(h.stored(&task.id).await.status, TaskStatus::Paused);

    assert!(h.service.resume(&task.id).await);
    h.service.run_until_idle().await;
    assert_eq!(steps.load(Ordering::SeqCst), 20);
    assert_eq!(h.stored(&task.id).await.status, TaskStatus::Success);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retry_counts_attempts() -> Result<()> {
    let runner = ScriptedRunner::new(TaskType::Download, |_, _| Err(anyhow!("still broken")));
    let mut h = Harness::new(runner.clone()).await?;

    let task = h
        .service
        .create_task(TaskRequest::from_url("BVxxxxxx").with_max_retry(1))
        .await?;
    h.service.run_until_idle().await;

    let mut failed = h.stored(&task.id).await;
    assert!(h.service.retry(&mut failed).await);
    assert_eq!(failed.retry_count, 1);
    h.service.run_until_idle().await;

    let mut failed = h.stored(&task.id).await;
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(!failed.can_retry());
    assert!(!h.service.retry(&mut failed).await);
    assert_eq!(runner.runs(), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cleanup_cancels_in_flight() -> Result<()> {
    let (runner, release) = gated_runner();
    let mut h = Harness::new(runner.clone()).await?;

    let task = h.service.create_task(TaskRequest::from_url("BVxxxxxx")).await?;
    wait_for_runs(&runner, 1).await;
    let abandoned = h.service.cleanup().await;
    assert_eq!(abandoned, 1);
    assert_eq!(h.service.in_flight_count(), 0);

    let stored = h.stored(&task.id).await;
    assert_eq!(stored.status, TaskStatus::Cancelled);
    assert!(stored.end_time.is_some());

    release.send(())?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_manager_routes_by_task_type() -> Result<()> {
    let db = TaskService::in_memory();
    let bus = EventBus::new(256);
    let ctx = ServiceContext::new(db.clone(), bus, test_settings());
    let mut manager = TaskManager::new(ctx);

    let (gated, release) = gated_runner();
    manager.register(gated)?;
    manager.register(ScriptedRunner::new(TaskType::Translate, |_, _| {
        Ok(JobOutput::file("/out/subs.zh-CN.srt"))
    }))?;
    assert_eq!(manager.task_types(), vec![TaskType::Download, TaskType::Translate]);

    let err = manager
        .create_task(TaskType::VocalSeparate, TaskRequest::from_url("x"))
        .await
        .unwrap_err();
    assert_eq!(err, ServiceError::NoService(TaskType::VocalSeparate));

    let download = manager
        .create_task(TaskType::Download, TaskRequest::from_url("BVxxxxxx"))
        .await?;
    let translate = manager
        .create_task(TaskType::Translate, TaskRequest::from_url("subs.srt"))
        .await?;
    assert_eq!(manager.in_flight_count(), 2);

    while manager.get_task(&translate.id).await.map(|t| t.status) != Some(TaskStatus::Success) {
        manager.wait().await;
    }
    assert!(manager.service(TaskType::Download).unwrap().is_in_flight(&download.id));

    assert!(manager.delete_task(&download.id).await);
    assert!(db.get(&download.id).await.is_none());
    assert_eq!(manager.in_flight_count(), 0);

    assert!(manager.restart(&translate.id).await);
    manager.run_until_idle().await;
    assert_eq!(db.get(&translate.id).await.unwrap().status, TaskStatus::Success);

    release.send(())?;
    assert_eq!(manager.cleanup().await, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_storage_failures_do_not_stall_tasks() -> Result<()> {
    let storage = Arc::new(FlakyStorage::failing());
    let mut h = Harness::with_storage(succeed_with_output(), storage.clone())?;

    let mut detached = TaskRequest::from_url("BVdetached").into_task(TaskType::Download);
    assert!(!h.db.save(&mut detached).await);

    let task = h.service.create_task(TaskRequest::from_url("BVxxxxxx")).await?;
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(
        h.service.in_flight_task(&task.id).map(|t| t.status),
        Some(TaskStatus::Running)
    );
    assert!(h.db.get(&task.id).await.is_none());

    h.service.run_until_idle().await;
    assert!(!h.service.is_in_flight(&task.id));
    assert!(storage.failed_writes.load(Ordering::SeqCst) >= 4);

    let events = h.drain_events();
    assert!(matches!(events.first(), Some(TaskEvent::Created { .. })));
    let statuses: Vec<_> = events.iter().filter_map(status_of).collect();
    assert_eq!(
        statuses,
        vec![
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Running,
            TaskStatus::Success,
        ]
    );
    match events.last() {
        Some(TaskEvent::Finished { task: done, success, .. }) => {
            assert!(*success);
            assert_eq!(done.output_path, "/out/file.mp4");
            assert!(done.end_time.is_some());
        }
        other => panic!("unexpected event: {:?}", other),
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_interrupted_wait_still_records_finish() -> Result<()> {
    let db = TaskService::new(Arc::new(FlakyStorage::slow(Duration::from_millis(50))));
    let ctx = ServiceContext::new(db.clone(), EventBus::new(256), test_settings());
    let mut manager = TaskManager::new(ctx);
    manager.register(ScriptedRunner::new(TaskType::Download, |_, _| {
        Ok(JobOutput::file("/out/file.mp4"))
    }))?;

    let task = manager
        .create_task(TaskType::Download, TaskRequest::from_url("BVxxxxxx"))
        .await?;

    // each interrupt is shorter than a single store write
    let mut rounds = 0;
    while manager.in_flight_count() > 0 {
        manager
            .wait_or(tokio::time::sleep(Duration::from_millis(5)))
            .await;
        rounds += 1;
        assert!(rounds < 500, "task never finished");
    }

    let stored = db.get(&task.id).await.expect("task should be stored");
    assert_eq!(stored.status, TaskStatus::Success);
    assert!(stored.end_time.is_some());
    Ok(())
}
