//! Typed lifecycle events broadcast to observers.

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::schedule::types::{LogLevel, Task, TaskType};

#[derive(Debug, Clone)]
pub enum TaskEvent {
    Created {
        service: TaskType,
        task: Task,
    },
    /// Progress or a non-terminal state change, including cancellation.
    Updated {
        service: TaskType,
        task: Task,
    },
    Finished {
        service: TaskType,
        task: Task,
        success: bool,
        error_msg: String,
    },
    Log {
        service: TaskType,
        level: LogLevel,
        message: String,
    },
}

impl TaskEvent {
    pub fn service(&self) -> TaskType {
        match self {
            TaskEvent::Created { service, .. }
            | TaskEvent::Updated { service, .. }
            | TaskEvent::Finished { service, .. }
            | TaskEvent::Log { service, .. } => *service,
        }
    }

    pub fn task(&self) -> Option<&Task> {
        match self {
            TaskEvent::Created { task, .. }
            | TaskEvent::Updated { task, .. }
            | TaskEvent::Finished { task, .. } => Some(task),
            TaskEvent::Log { .. } => None,
        }
    }
}

/// Observer interface; every method defaults to doing nothing.
pub trait TaskCallback: Send + 'static {
    fn on_created(&mut self, _task: &Task) {}
    fn on_updated(&mut self, _task: &Task) {}
    fn on_finished(&mut self, _task: &Task, _success: bool, _error_msg: &str) {}
    fn on_log(&mut self, _service: TaskType, _level: LogLevel, _message: &str) {}
}

/// Adapts a closure over raw events into a [`TaskCallback`].
pub struct FunctionCallback<F> {
    callback: F,
}

impl<F> FunctionCallback<F>
where
    F: FnMut(&TaskEvent) + Send + 'static,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> TaskCallback for FunctionCallback<F>
where
    F: FnMut(&TaskEvent) + Send + 'static,
{
    fn on_created(&mut self, task: &Task) {
        (self.callback)(&TaskEvent::Created {
            service: task.task_type,
            task: task.clone(),
        });
    }

    fn on_updated(&mut self, task: &Task) {
        (self.callback)(&TaskEvent::Updated {
            service: task.task_type,
            task: task.clone(),
        });
    }

    fn on_finished(&mut self, task: &Task, success: bool, error_msg: &str) {
        (self.callback)(&TaskEvent::Finished {
            service: task.task_type,
            task: task.clone(),
            success,
            error_msg: error_msg.to_string(),
        });
    }

    fn on_log(&mut self, service: TaskType, level: LogLevel, message: &str) {
        (self.callback)(&TaskEvent::Log {
            service,
            level,
            message: message.to_string(),
        });
    }
}

fn dispatch(callback: &mut dyn TaskCallback, event: &TaskEvent) {
    match event {
        TaskEvent::Created { task, .. } => callback.on_created(task),
        TaskEvent::Updated { task, .. } => callback.on_updated(task),
        TaskEvent::Finished {
            task,
            success,
            error_msg,
            ..
        } => callback.on_finished(task, *success, error_msg),
        TaskEvent::Log {
            service,
            level,
            message,
        } => callback.on_log(*service, *level, message),
    }
}

/// Broadcast channel shared by every service.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: TaskEvent) {
        // no subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn task_created(&self, task: &Task) {
        self.emit(TaskEvent::Created {
            service: task.task_type,
            task: task.clone(),
        });
    }

    pub fn task_updated(&self, task: &Task) {
        self.emit(TaskEvent::Updated {
            service: task.task_type,
            task: task.clone(),
        });
    }

    pub fn task_finished(&self, task: &Task, success: bool, error_msg: &str) {
        self.emit(TaskEvent::Finished {
            service: task.task_type,
            task: task.clone(),
            success,
            error_msg: error_msg.to_string(),
        });
    }

    pub fn log_generated(&self, service: TaskType, level: LogLevel, message: &str) {
        self.emit(TaskEvent::Log {
            service,
            level,
            message: message.to_string(),
        });
    }

    /// Feeds every event to `callback` on a background task until the bus is dropped.
    pub fn spawn_listener<C: TaskCallback>(&self, mut callback: C) -> JoinHandle<()> {
        let mut receiver = self.subscribe();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => dispatch(&mut callback, &event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Event listener lagged, skipped {} events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::types::TaskStatus;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_subscribers_receive_events_in_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let mut task = Task::new(TaskType::Download);

        bus.task_created(&task);
        task.status = TaskStatus::Running;
        bus.task_updated(&task);
        bus.task_finished(&task, false, "no such video");

        assert!(matches!(rx.recv().await, Ok(TaskEvent::Created { .. })));
        match rx.recv().await {
            Ok(TaskEvent::Updated { task: updated, .. }) => {
                assert_eq!(updated.status, TaskStatus::Running)
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.recv().await {
            Ok(TaskEvent::Finished {
                success, error_msg, ..
            }) => {
                assert!(!success);
                assert_eq!(error_msg, "no such video");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_emit_without_subscribers() {
        let bus = EventBus::new(4);
        bus.log_generated(TaskType::Translate, LogLevel::Info, "nobody listens");
    }

    #[tokio::test]
    async fn test_listener_dispatches_to_callback() {
        let bus = EventBus::new(16);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handle = bus.spawn_listener(FunctionCallback::new(move |event: &TaskEvent| {
            sink.lock().unwrap().push(event.service());
        }));

        bus.log_generated(TaskType::MediaSplit, LogLevel::Warning, "careful");
        bus.task_created(&Task::new(TaskType::Transcribe));
        drop(bus);
        handle.await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![TaskType::MediaSplit, TaskType::Transcribe]
        );
    }
}
