use std::sync::Arc;

use tokio::sync::{mpsc, Notify};

use crate::concurrent::{CancelToken, FutureError, JobCancelled};
use crate::schedule::types::{JobOutput, LogLevel, ProgressUpdate};

/// Sent from worker threads to the owning service, drained on the owner's tick.
#[derive(Debug)]
pub(crate) enum WorkerMessage {
    Progress {
        task_id: String,
        run_id: u64,
        update: ProgressUpdate,
    },
    Log {
        task_id: String,
        run_id: u64,
        level: LogLevel,
        message: String,
    },
    Finished {
        task_id: String,
        run_id: u64,
        result: Result<JobOutput, FutureError>,
    },
}

impl WorkerMessage {
    pub(crate) fn task_id(&self) -> &str {
        match self {
            WorkerMessage::Progress { task_id, .. }
            | WorkerMessage::Log { task_id, .. }
            | WorkerMessage::Finished { task_id, .. } => task_id,
        }
    }

    pub(crate) fn run_id(&self) -> u64 {
        match self {
            WorkerMessage::Progress { run_id, .. }
            | WorkerMessage::Log { run_id, .. }
            | WorkerMessage::Finished { run_id, .. } => *run_id,
        }
    }
}

/// Posts worker messages and wakes whoever drives the owning loop.
#[derive(Debug, Clone)]
pub(crate) struct Mailbox {
    tx: mpsc::UnboundedSender<WorkerMessage>,
    wake: Arc<Notify>,
}

impl Mailbox {
    pub(crate) fn new(tx: mpsc::UnboundedSender<WorkerMessage>, wake: Arc<Notify>) -> Self {
        Self { tx, wake }
    }

    pub(crate) fn post(&self, message: WorkerMessage) {
        // the service is gone at shutdown; nothing left to update
        if self.tx.send(message).is_ok() {
            self.wake.notify_one();
        }
    }
}

/// Handed to a job function: progress/log reporting and cooperative
/// cancellation. Safe to use from the worker thread.
#[derive(Debug, Clone)]
pub struct JobContext {
    task_id: String,
    run_id: u64,
    token: CancelToken,
    mailbox: Mailbox,
}

impl JobContext {
    pub(crate) fn new(task_id: String, run_id: u64, token: CancelToken, mailbox: Mailbox) -> Self {
        Self {
            task_id,
            run_id,
            token,
            mailbox,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Parks while the task is paused and fails once it is cancelled.
    pub fn checkpoint(&self) -> Result<(), JobCancelled> {
        self.token.checkpoint()
    }

    pub fn progress(&self, update: ProgressUpdate) {
        self.mailbox.post(WorkerMessage::Progress {
            task_id: self.task_id.clone(),
            run_id: self.run_id,
            update,
        });
    }

    pub fn set_progress(&self, progress: f64) {
        self.progress(ProgressUpdate::new(progress));
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.mailbox.post(WorkerMessage::Log {
            task_id: self.task_id.clone(),
            run_id: self.run_id,
            level,
            message: message.into(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message);
    }

    pub(crate) fn finished(&self, result: Result<JobOutput, FutureError>) {
        self.mailbox.post(WorkerMessage::Finished {
            task_id: self.task_id.clone(),
            run_id: self.run_id,
            result,
        });
    }
}
