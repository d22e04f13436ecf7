use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::Notify;

const PENDING: u8 = 0;
const SUCCEEDED: u8 = 1;
const FAILED: u8 = 2;
const CANCELLED: u8 = 3;

#[derive(Debug, Clone, Error)]
pub enum FutureError {
    #[error("{0}")]
    Failed(Arc<anyhow::Error>),
    #[error("future was cancelled")]
    Cancelled,
    #[error("{} of the gathered futures did not succeed", .0.len())]
    Gathered(Vec<(usize, FutureError)>),
}

impl FutureError {
    pub fn failed(error: impl Into<anyhow::Error>) -> Self {
        FutureError::Failed(Arc::new(error.into()))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, FutureError::Cancelled)
    }

    /// Looks through a `Failed` error for a concrete cause.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        match self {
            FutureError::Failed(error) => error.downcast_ref::<E>(),
            _ => None,
        }
    }
}

/// The single terminal outcome of a [`TaskFuture`].
pub enum Outcome<T> {
    Success(Arc<T>),
    Failure(FutureError),
    Cancelled,
}

impl<T> Outcome<T> {
    fn code(&self) -> u8 {
        match self {
            Outcome::Success(_) => SUCCEEDED,
            Outcome::Failure(_) => FAILED,
            Outcome::Cancelled => CANCELLED,
        }
    }
}

impl<T> Clone for Outcome<T> {
    fn clone(&self) -> Self {
        match self {
            Outcome::Success(value) => Outcome::Success(Arc::clone(value)),
            Outcome::Failure(error) => Outcome::Failure(error.clone()),
            Outcome::Cancelled => Outcome::Cancelled,
        }
    }
}

impl<T> fmt::Debug for Outcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success(_) => write!(f, "Success(..)"),
            Outcome::Failure(error) => write!(f, "Failure({})", error),
            Outcome::Cancelled => write!(f, "Cancelled"),
        }
    }
}

type DoneCallback<T> = Box<dyn FnOnce(&Outcome<T>) + Send>;

struct Slot<T> {
    outcome: Option<Outcome<T>>,
    callbacks: Vec<DoneCallback<T>>,
}

struct Shared<T> {
    state: AtomicU8,
    slot: Mutex<Slot<T>>,
    notify: Notify,
}

/// Single-assignment result container shared between a producer and any
/// number of observers.
///
/// Exactly one of `complete`, `fail` or `cancel` takes effect; later calls
/// return `false` and change nothing. Callbacks registered after resolution
/// fire immediately on the registering thread. Callbacks registered before
/// resolution fire on the resolving thread, after the outcome is published.
pub struct TaskFuture<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for TaskFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for TaskFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.shared.state.load(Ordering::Acquire) {
            PENDING => "pending",
            SUCCEEDED => "succeeded",
            FAILED => "failed",
            _ => "cancelled",
        };
        f.debug_struct("TaskFuture").field("state", &state).finish()
    }
}

impl<T: Send + Sync + 'static> Default for TaskFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> TaskFuture<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: AtomicU8::new(PENDING),
                slot: Mutex::new(Slot {
                    outcome: None,
                    callbacks: Vec::new(),
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// A future that has already failed.
    pub fn failed(error: impl Into<anyhow::Error>) -> Self {
        let future = Self::new();
        future.fail(error);
        future
    }

    fn slot(&self) -> MutexGuard<'_, Slot<T>> {
        // callbacks never run under the lock, so a poisoned slot is still consistent
        self.shared.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_done(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) != PENDING
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) == CANCELLED
    }

    pub fn outcome(&self) -> Option<Outcome<T>> {
        self.slot().outcome.clone()
    }

    pub fn result(&self) -> Option<Arc<T>> {
        match self.outcome() {
            Some(Outcome::Success(value)) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<FutureError> {
        match self.outcome() {
            Some(Outcome::Failure(error)) => Some(error),
            Some(Outcome::Cancelled) => Some(FutureError::Cancelled),
            _ => None,
        }
    }

    /// Registers a callback for whichever outcome arrives.
    pub fn on_done<F>(&self, callback: F)
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        let mut slot = self.slot();
        match slot.outcome.clone() {
            Some(outcome) => {
                drop(slot);
                callback(&outcome);
            }
            None => slot.callbacks.push(Box::new(callback)),
        }
    }

    pub fn on_result<F>(&self, callback: F)
    where
        F: FnOnce(&T) + Send + 'static,
    {
        self.on_done(move |outcome| {
            if let Outcome::Success(value) = outcome {
                callback(value);
            }
        });
    }

    pub fn on_failure<F>(&self, callback: F)
    where
        F: FnOnce(&FutureError) + Send + 'static,
    {
        self.on_done(move |outcome| {
            if let Outcome::Failure(error) = outcome {
                callback(error);
            }
        });
    }

    pub fn on_cancelled<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_done(move |outcome| {
            if let Outcome::Cancelled = outcome {
                callback();
            }
        });
    }

    pub fn complete(&self, value: T) -> bool {
        self.resolve(Outcome::Success(Arc::new(value)))
    }

    pub fn fail(&self, error: impl Into<anyhow::Error>) -> bool {
        self.fail_with(FutureError::failed(error))
    }

    pub fn fail_with(&self, error: FutureError) -> bool {
        match error {
            FutureError::Cancelled => self.resolve(Outcome::Cancelled),
            error => self.resolve(Outcome::Failure(error)),
        }
    }

    /// Resolves to cancelled unless an outcome is already set. Work that is
    /// already running is not interrupted; its eventual result is dropped.
    pub fn cancel(&self) -> bool {
        self.resolve(Outcome::Cancelled)
    }

    fn resolve(&self, outcome: Outcome<T>) -> bool {
        let mut slot = self.slot();
        if slot.outcome.is_some() {
            return false;
        }
        slot.outcome = Some(outcome.clone());
        self.shared.state.store(outcome.code(), Ordering::Release);
        let callbacks = std::mem::take(&mut slot.callbacks);
        drop(slot);

        for callback in callbacks {
            callback(&outcome);
        }
        self.shared.notify.notify_waiters();
        true
    }

    /// Suspends until the future resolves.
    pub async fn wait(&self) -> Outcome<T> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(outcome) = self.outcome() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Combines futures into one that succeeds with every value in input
    /// order, or fails once all inputs settled and at least one did not succeed.
    pub fn gather(futures: Vec<TaskFuture<T>>) -> TaskFuture<Vec<Arc<T>>> {
        let gathered = TaskFuture::new();
        if futures.is_empty() {
            gathered.complete(Vec::new());
            return gathered;
        }

        let state = Arc::new(Mutex::new(GatherState {
            remaining: futures.len(),
            values: vec![None; futures.len()],
            errors: Vec::new(),
        }));

        for (index, future) in futures.into_iter().enumerate() {
            let state = Arc::clone(&state);
            let gathered = gathered.clone();
            future.on_done(move |outcome| {
                let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                match outcome {
                    Outcome::Success(value) => state.values[index] = Some(Arc::clone(value)),
                    Outcome::Failure(error) => state.errors.push((index, error.clone())),
                    Outcome::Cancelled => state.errors.push((index, FutureError::Cancelled)),
                }
                state.remaining -= 1;
                if state.remaining > 0 {
                    return;
                }
                if state.errors.is_empty() {
                    let values = state.values.iter_mut().filter_map(Option::take).collect();
                    drop(state);
                    gathered.complete(values);
                } else {
                    let mut errors = std::mem::take(&mut state.errors);
                    drop(state);
                    errors.sort_by_key(|(index, _)| *index);
                    gathered.fail_with(FutureError::Gathered(errors));
                }
            });
        }
        gathered
    }
}

struct GatherState<T> {
    remaining: usize,
    values: Vec<Option<Arc<T>>>,
    errors: Vec<(usize, FutureError)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_callback_after_completion_still_fires() {
        let future = TaskFuture::new();
        assert!(future.complete(7));

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = seen.clone();
        future.on_result(move |value| {
            seen_cb.store(*value, Ordering::SeqCst);
        });
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_first_resolution_wins() {
        let future = TaskFuture::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_cb = calls.clone();
        future.on_result(move |_| {
            calls_cb.fetch_add(1, Ordering::SeqCst);
        });

        assert!(future.complete(1));
        assert!(!future.complete(2));
        assert!(!future.fail(anyhow::anyhow!("late failure")));
        assert!(!future.cancel());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*future.result().unwrap(), 1);
        assert!(future.is_done());
        assert!(!future.is_cancelled());
    }

    #[test]
    fn test_cancel_discards_late_result() {
        let future = TaskFuture::new();
        let cancelled = Arc::new(AtomicUsize::new(0));
        let cancelled_cb = cancelled.clone();
        future.on_cancelled(move || {
            cancelled_cb.fetch_add(1, Ordering::SeqCst);
        });
        future.on_result(|_: &i32| panic!("result must not be delivered"));

        assert!(future.cancel());
        assert!(!future.complete(5));
        assert!(future.is_cancelled());
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        assert!(future.error().unwrap().is_cancelled());
    }

    #[test]
    fn test_failure_carries_message() {
        let future: TaskFuture<()> = TaskFuture::new();
        let message = Arc::new(Mutex::new(String::new()));
        let message_cb = message.clone();
        future.on_failure(move |error| {
            *message_cb.lock().unwrap() = error.to_string();
        });

        future.fail(anyhow::anyhow!("no such video"));
        assert_eq!(*message.lock().unwrap(), "no such video");
    }

    #[tokio::test]
    async fn test_wait_from_other_thread() {
        let future = TaskFuture::new();
        let producer = future.clone();
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            producer.complete("done".to_string());
        });

        match future.wait().await {
            Outcome::Success(value) => assert_eq!(value.as_str(), "done"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_gather_collects_in_order() {
        let first = TaskFuture::new();
        let second = TaskFuture::new();
        let gathered = TaskFuture::gather(vec![first.clone(), second.clone()]);

        second.complete(2);
        assert!(!gathered.is_done());
        first.complete(1);

        let values = gathered.result().unwrap();
        let values: Vec<i32> = values.iter().map(|v| **v).collect();
        assert_eq!(values, vec![1, 2]);
    }

    #[test]
    fn test_gather_reports_failed_inputs() {
        let ok = TaskFuture::new();
        let bad = TaskFuture::new();
        let dropped = TaskFuture::new();
        let gathered = TaskFuture::gather(vec![ok.clone(), bad.clone(), dropped.clone()]);

        ok.complete(1);
        bad.fail(anyhow::anyhow!("boom"));
        assert!(!gathered.is_done());
        dropped.cancel();

        match gathered.error() {
            Some(FutureError::Gathered(errors)) => {
                assert_eq!(errors.len(), 2);
                assert_eq!(errors[0].0, 1);
                assert_eq!(errors[0].1.to_string(), "boom");
                assert!(errors[1].1.is_cancelled());
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_gather_empty_resolves() {
        let gathered = TaskFuture::<u8>::gather(Vec::new());
        assert!(gathered.result().unwrap().is_empty());
    }
}
