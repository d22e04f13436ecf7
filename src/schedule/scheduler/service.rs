use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use super::worker::{JobContext, Mailbox, WorkerMessage};
use crate::concurrent::{CancelToken, FutureError, JobCancelled, Outcome, TaskExecutor, TaskFuture};
use crate::schedule::callback::EventBus;
use crate::schedule::error::ServiceError;
use crate::schedule::processors::JobRunner;
use crate::schedule::types::{JobOutput, LogLevel, Task, TaskRequest, TaskStatus, TaskType};
use crate::storage::task::TaskService;

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub max_workers: usize,
    pub shutdown_timeout: Duration,
    pub log_cache_size: usize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            max_workers: 2,
            shutdown_timeout: Duration::from_secs(3),
            log_cache_size: 1000,
        }
    }
}

/// What every service shares: the store, the event bus and the owner's wake-up signal.
#[derive(Clone)]
pub struct ServiceContext {
    pub db: TaskService,
    pub events: EventBus,
    pub wake: Arc<Notify>,
    pub settings: ServiceSettings,
}

impl ServiceContext {
    pub fn new(db: TaskService, events: EventBus, settings: ServiceSettings) -> Self {
        Self {
            db,
            events,
            wake: Arc::new(Notify::new()),
            settings,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

struct InFlight {
    run_id: u64,
    task: Task,
    future: TaskFuture<JobOutput>,
    token: CancelToken,
}

/// Drives the task state machine for one task type.
///
/// All mutation happens through `&mut self` on the owning task. Worker threads
/// only post messages, which are applied by `process_pending` / `process_next`.
/// Every state change is persisted before its event is emitted.
pub struct BaseService {
    task_type: TaskType,
    runner: Arc<dyn JobRunner>,
    db: TaskService,
    events: EventBus,
    executor: TaskExecutor,
    settings: ServiceSettings,
    in_flight: HashMap<String, InFlight>,
    mailbox: Mailbox,
    rx: mpsc::UnboundedReceiver<WorkerMessage>,
    next_run_id: u64,
    logs: VecDeque<LogEntry>,
}

impl BaseService {
    pub fn new(runner: Arc<dyn JobRunner>, ctx: &ServiceContext) -> Result<Self> {
        let task_type = runner.task_type();
        let executor = TaskExecutor::new(format!("{}-executor", task_type), ctx.settings.max_workers)?;
        let (tx, rx) = mpsc::unbounded_channel();

        Ok(Self {
            task_type,
            runner,
            db: ctx.db.clone(),
            events: ctx.events.clone(),
            executor,
            settings: ctx.settings.clone(),
            in_flight: HashMap::new(),
            mailbox: Mailbox::new(tx, Arc::clone(&ctx.wake)),
            rx,
            next_run_id: 0,
            logs: VecDeque::new(),
        })
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    pub fn is_available(&self) -> bool {
        self.runner.is_available()
    }

    pub fn is_in_flight(&self, task_id: &str) -> bool {
        self.in_flight.contains_key(task_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn in_flight_ids(&self) -> Vec<String> {
        self.in_flight.keys().cloned().collect()
    }

    /// Live copy of an in-flight task.
    pub fn in_flight_task(&self, task_id: &str) -> Option<&Task> {
        self.in_flight.get(task_id).map(|entry| &entry.task)
    }

    pub fn logs(&self) -> impl Iterator<Item = &LogEntry> {
        self.logs.iter()
    }

    pub fn add_log(&mut self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => debug!("[{}] {}", self.task_type, message),
            LogLevel::Info => info!("[{}] {}", self.task_type, message),
            LogLevel::Warning => warn!("[{}] {}", self.task_type, message),
            LogLevel::Error => error!("[{}] {}", self.task_type, message),
        }

        if self.logs.len() >= self.settings.log_cache_size.max(1) {
            self.logs.pop_front();
        }
        self.logs.push_back(LogEntry {
            time: Utc::now(),
            level,
            message: message.clone(),
        });
        self.events.log_generated(self.task_type, level, &message);
    }

    /// Validates, persists and announces a new task, then starts it unless
    /// the request is deferred.
    pub async fn create_task(&mut self, request: TaskRequest) -> Result<Task, ServiceError> {
        if !self.runner.is_available() {
            let reason = self.runner.unavailable_reason();
            self.add_log(LogLevel::Warning, format!("Service unavailable: {}", reason));
            return Err(ServiceError::Unavailable(self.task_type, reason));
        }

        let defer_start = request.defer_start;
        let mut task = match self.runner.create_task(request) {
            Ok(task) if task.task_type == self.task_type => task,
            Ok(task) => {
                let message = format!("runner produced a {} task", task.task_type);
                self.add_log(LogLevel::Error, format!("Failed to create task: {}", message));
                return Err(ServiceError::Validation(message));
            }
            Err(e) => {
                self.add_log(LogLevel::Error, format!("Failed to create task: {}", e));
                return Err(e);
            }
        };
        task.status = TaskStatus::Pending;

        self.db.save(&mut task).await;
        self.events.task_created(&task);
        self.add_log(
            LogLevel::Info,
            format!("Created task {} ({})", task.id, task.display_name()),
        );

        if !defer_start {
            self.start(&mut task).await;
        }
        Ok(task)
    }

    /// pending -> running. Refuses duplicates, finished tasks and unavailable services.
    pub async fn start(&mut self, task: &mut Task) -> bool {
        if task.task_type != self.task_type {
            self.add_log(
                LogLevel::Warning,
                format!("Task {} is a {} task", task.id, task.task_type),
            );
            return false;
        }
        if self.in_flight.contains_key(&task.id) {
            self.add_log(LogLevel::Warning, format!("Task {} is already running", task.id));
            return false;
        }
        if task.status.is_terminal() {
            self.add_log(
                LogLevel::Warning,
                format!("Task {} is {}; restart it instead", task.id, task.status),
            );
            return false;
        }
        if !self.runner.is_available() {
            let reason = self.runner.unavailable_reason();
            self.add_log(
                LogLevel::Warning,
                format!("Cannot start task {}: {}", task.id, reason),
            );
            return false;
        }

        self.next_run_id += 1;
        let run_id = self.next_run_id;

        task.status = TaskStatus::Running;
        task.start_time = Some(Utc::now());
        task.end_time = None;
        self.db.save(task).await;
        self.events.task_updated(task);

        let token = CancelToken::new();
        let ctx = JobContext::new(task.id.clone(), run_id, token.clone(), self.mailbox.clone());
        let runner = Arc::clone(&self.runner);
        let snapshot = task.clone();
        let job_ctx = ctx.clone();
        let future = self
            .executor
            .async_run(move || runner.run(&snapshot, &job_ctx));

        // a cancelled future needs no message, the owner already settled the task
        future.on_done(move |outcome| match outcome {
            Outcome::Success(output) => ctx.finished(Ok(output.as_ref().clone())),
            Outcome::Failure(error) => ctx.finished(Err(error.clone())),
            Outcome::Cancelled => {}
        });

        self.in_flight.insert(
            task.id.clone(),
            InFlight {
                run_id,
                task: task.clone(),
                future,
                token,
            },
        );
        self.add_log(LogLevel::Info, format!("Started task {}", task.id));
        true
    }

    /// Cancels an in-flight task. The job is asked to stop; whatever it
    /// reports afterwards is ignored.
    pub async fn cancel(&mut self, task_id: &str) -> bool {
        let Some(entry) = self.in_flight.remove(task_id) else {
            return false;
        };
        entry.token.cancel();
        entry.future.cancel();

        let mut task = entry.task;
        task.status = TaskStatus::Cancelled;
        task.end_time = Some(Utc::now());
        self.db.save(&mut task).await;
        self.events.task_updated(&task);
        self.add_log(LogLevel::Info, format!("Cancelled task {}", task.id));
        true
    }

    /// Resets a task that is not in flight back to pending and starts it again.
    pub async fn restart(&mut self, task: &mut Task) -> bool {
        if self.in_flight.contains_key(&task.id) {
            self.add_log(
                LogLevel::Warning,
                format!("Task {} is still running; cancel it first", task.id),
            );
            return false;
        }

        task.reset();
        self.db.save(task).await;
        self.events.task_updated(task);
        self.add_log(LogLevel::Info, format!("Restarting task {}", task.id));
        self.start(task).await
    }

    /// Restart that counts against `max_retry`; only for failed tasks.
    pub async fn retry(&mut self, task: &mut Task) -> bool {
        if !task.can_retry() {
            self.add_log(
                LogLevel::Warning,
                format!(
                    "Task {} cannot be retried ({}, {}/{} retries)",
                    task.id, task.status, task.retry_count, task.max_retry
                ),
            );
            return false;
        }
        task.retry_count += 1;
        self.restart(task).await
    }

    pub async fn pause(&mut self, task_id: &str) -> bool {
        self.set_paused(task_id, true).await
    }

    pub async fn resume(&mut self, task_id: &str) -> bool {
        self.set_paused(task_id, false).await
    }

    async fn set_paused(&mut self, task_id: &str, paused: bool) -> bool {
        let (from, to) = if paused {
            (TaskStatus::Running, TaskStatus::Paused)
        } else {
            (TaskStatus::Paused, TaskStatus::Running)
        };
        let Some(entry) = self.in_flight.get_mut(task_id) else {
            return false;
        };
        if entry.task.status != from {
            return false;
        }

        if paused {
            entry.token.pause();
        } else {
            entry.token.resume();
        }
        entry.task.status = to;
        self.db.save(&mut entry.task).await;
        self.events.task_updated(&entry.task);
        self.add_log(LogLevel::Info, format!("Task {} is now {}", task_id, to));
        true
    }

    /// Applies every queued worker message without waiting. Returns the count.
    pub async fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(message) = self.rx.try_recv() {
            self.handle_message(message).await;
            handled += 1;
        }
        handled
    }

    /// Waits for the next worker message and applies it.
    pub async fn process_next(&mut self) {
        if let Some(message) = self.rx.recv().await {
            self.handle_message(message).await;
        }
    }

    /// Applies messages until nothing is in flight.
    pub async fn run_until_idle(&mut self) {
        while !self.in_flight.is_empty() {
            self.process_next().await;
        }
        self.process_pending().await;
    }

    async fn handle_message(&mut self, message: WorkerMessage) {
        let current = self
            .in_flight
            .get(message.task_id())
            .is_some_and(|entry| entry.run_id == message.run_id());
        if !current {
            debug!(
                "[{}] Ignoring late message for task {}",
                self.task_type,
                message.task_id()
            );
            return;
        }

        match message {
            WorkerMessage::Progress { task_id, update, .. } => {
                let Some(entry) = self.in_flight.get_mut(&task_id) else {
                    return;
                };
                let task = &mut entry.task;
                task.progress = update.progress.clamp(0.0, 100.0);
                if let Some(speed) = update.speed {
                    task.speed = speed;
                }
                if let Some(eta) = update.eta {
                    task.eta = eta;
                }
                if let Some(step) = update.step {
                    task.current_step = step;
                }
                self.db.save(task).await;
                self.events.task_updated(task);
            }
            WorkerMessage::Log { level, message, .. } => {
                self.add_log(level, message);
            }
            WorkerMessage::Finished { task_id, result, .. } => {
                if let Some(entry) = self.in_flight.remove(&task_id) {
                    self.finish(entry.task, result).await;
                }
            }
        }
    }

    async fn finish(&mut self, mut task: Task, result: Result<JobOutput, FutureError>) {
        task.end_time = Some(Utc::now());
        match result {
            Ok(output) => {
                output.apply(&mut task);
                task.status = TaskStatus::Success;
                task.progress = 100.0;
                task.error_msg.clear();
                task.error_code.clear();
                self.db.save(&mut task).await;
                self.events.task_finished(&task, true, "");
                self.add_log(LogLevel::Info, format!("Task {} completed", task.id));
            }
            Err(error) if error.is_cancelled() || error.downcast_ref::<JobCancelled>().is_some() => {
                task.status = TaskStatus::Cancelled;
                self.db.save(&mut task).await;
                self.events.task_updated(&task);
                self.add_log(LogLevel::Info, format!("Task {} stopped by cancellation", task.id));
            }
            Err(error) => {
                let message = error_message(&error);
                task.status = TaskStatus::Failed;
                task.error_msg = message.clone();
                task.error_code = error_code(&error).to_string();
                self.db.save(&mut task).await;
                self.events.task_finished(&task, false, &message);
                self.add_log(LogLevel::Error, format!("Task {} failed: {}", task.id, message));
            }
        }
    }

    /// Cancels everything in flight, records it, and shuts the executor down
    /// within the configured timeout. Returns the number of abandoned jobs.
    pub async fn cleanup(&mut self) -> usize {
        let entries: Vec<InFlight> = self.in_flight.drain().map(|(_, entry)| entry).collect();
        for entry in entries {
            entry.token.cancel();
            entry.future.cancel();
            let mut task = entry.task;
            task.status = TaskStatus::Cancelled;
            task.end_time = Some(Utc::now());
            self.db.save(&mut task).await;
            self.events.task_updated(&task);
            self.add_log(LogLevel::Info, format!("Cancelled task {} at shutdown", task.id));
        }

        let abandoned = self.executor.shutdown(self.settings.shutdown_timeout).await;
        self.process_pending().await;
        abandoned
    }
}

fn error_message(error: &FutureError) -> String {
    match error {
        FutureError::Failed(cause) => format!("{:#}", cause),
        other => other.to_string(),
    }
}

fn error_code(error: &FutureError) -> &'static str {
    use crate::utils::process::ProcessError;

    match error.downcast_ref::<ProcessError>() {
        Some(ProcessError::Spawn { .. }) => "spawn_failed",
        Some(ProcessError::Failed { .. }) => "process_failed",
        None if error.downcast_ref::<std::io::Error>().is_some() => "io_error",
        None => "job_failed",
    }
}
