use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use super::future::TaskFuture;

trait QueuedJob: Send {
    fn is_settled(&self) -> bool;
    fn run(self: Box<Self>);
    fn drop_unstarted(self: Box<Self>);
}

struct Queued<T, F> {
    job: F,
    future: TaskFuture<T>,
}

impl<T, F> QueuedJob for Queued<T, F>
where
    T: Send + Sync + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    fn is_settled(&self) -> bool {
        self.future.is_done()
    }

    fn run(self: Box<Self>) {
        let Queued { job, future } = *self;
        if future.is_done() {
            return;
        }
        match catch_unwind(AssertUnwindSafe(job)) {
            Ok(Ok(value)) => {
                future.complete(value);
            }
            Ok(Err(e)) => {
                future.fail(e);
            }
            Err(payload) => {
                future.fail(anyhow!("job panicked: {}", panic_message(payload.as_ref())));
            }
        }
    }

    fn drop_unstarted(self: Box<Self>) {
        self.future.cancel();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs blocking job functions on the runtime's blocking pool, at most
/// `max_workers` at a time, in submission order.
pub struct TaskExecutor {
    name: String,
    max_workers: usize,
    permits: Arc<Semaphore>,
    closing: Arc<AtomicBool>,
    queue: Mutex<Option<mpsc::UnboundedSender<Box<dyn QueuedJob>>>>,
}

impl TaskExecutor {
    /// Must be called from inside a tokio runtime.
    pub fn new(name: impl Into<String>, max_workers: usize) -> Result<Self> {
        let name = name.into();
        let max_workers = max_workers.max(1);
        let handle = Handle::try_current()
            .with_context(|| format!("executor {} needs a running tokio runtime", name))?;

        let permits = Arc::new(Semaphore::new(max_workers));
        let closing = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();

        handle.spawn(dispatch(
            name.clone(),
            rx,
            Arc::clone(&permits),
            Arc::clone(&closing),
        ));
        info!("Executor {} started with {} workers", name, max_workers);

        Ok(Self {
            name,
            max_workers,
            permits,
            closing,
            queue: Mutex::new(Some(tx)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn active_count(&self) -> usize {
        if self.permits.is_closed() {
            return 0;
        }
        self.max_workers - self.permits.available_permits()
    }

    pub fn is_shutdown(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Queues `job` and returns its future without blocking. Errors and panics
    /// raised by the job resolve the future as failed.
    pub fn async_run<T, F>(&self, job: F) -> TaskFuture<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let future = TaskFuture::new();
        let queued: Box<dyn QueuedJob> = Box::new(Queued {
            job,
            future: future.clone(),
        });

        let queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        match queue.as_ref() {
            Some(tx) if !self.is_shutdown() => {
                if tx.send(queued).is_err() {
                    future.fail(anyhow!("executor {} is not running", self.name));
                }
            }
            _ => {
                future.fail(anyhow!("executor {} is shut down", self.name));
            }
        }
        future
    }

    /// Stops accepting jobs, cancels queued ones and waits up to `timeout`
    /// for running jobs. Returns how many running jobs were abandoned.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        if self.closing.swap(true, Ordering::AcqRel) {
            return 0;
        }
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).take();

        let all = self.max_workers as u32;
        let abandoned = match tokio::time::timeout(timeout, self.permits.acquire_many(all)).await {
            Ok(Ok(permits)) => {
                permits.forget();
                0
            }
            Ok(Err(_)) => 0,
            Err(_) => self.max_workers - self.permits.available_permits(),
        };
        self.permits.close();

        if abandoned > 0 {
            warn!(
                "Executor {} abandoned {} running job(s) after {:?}",
                self.name, abandoned, timeout
            );
        } else {
            info!("Executor {} shut down", self.name);
        }
        abandoned
    }
}

async fn dispatch(
    name: String,
    mut rx: mpsc::UnboundedReceiver<Box<dyn QueuedJob>>,
    permits: Arc<Semaphore>,
    closing: Arc<AtomicBool>,
) {
    while let Some(job) = rx.recv().await {
        if closing.load(Ordering::Acquire) {
            job.drop_unstarted();
            continue;
        }
        if job.is_settled() {
            debug!("Executor {} skipped a job cancelled while queued", name);
            continue;
        }

        let permit = match Arc::clone(&permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                job.drop_unstarted();
                continue;
            }
        };
        if closing.load(Ordering::Acquire) {
            job.drop_unstarted();
            continue;
        }

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job.run();
        });
    }
    debug!("Executor {} dispatcher stopped", name);
}
