use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use super::service::{BaseService, ServiceContext};
use crate::schedule::error::ServiceError;
use crate::schedule::processors::JobRunner;
use crate::schedule::types::{Task, TaskRequest, TaskType};
use crate::storage::task::TaskService;

/// Registry of services keyed by task type; routes commands by `task.task_type`.
pub struct TaskManager {
    ctx: ServiceContext,
    services: BTreeMap<TaskType, BaseService>,
}

impl TaskManager {
    pub fn new(ctx: ServiceContext) -> Self {
        Self {
            ctx,
            services: BTreeMap::new(),
        }
    }

    pub fn db(&self) -> &TaskService {
        &self.ctx.db
    }

    pub fn register(&mut self, runner: Arc<dyn JobRunner>) -> Result<()> {
        let task_type = runner.task_type();
        info!("Registering service for task type: {}", task_type);
        let service = BaseService::new(runner, &self.ctx)?;
        if self.services.insert(task_type, service).is_some() {
            warn!("Replaced existing service for task type: {}", task_type);
        }
        Ok(())
    }

    pub fn task_types(&self) -> Vec<TaskType> {
        self.services.keys().copied().collect()
    }

    pub fn service(&self, task_type: TaskType) -> Option<&BaseService> {
        self.services.get(&task_type)
    }

    pub fn service_mut(&mut self, task_type: TaskType) -> Option<&mut BaseService> {
        self.services.get_mut(&task_type)
    }

    pub fn is_available(&self, task_type: TaskType) -> bool {
        self.service(task_type).is_some_and(BaseService::is_available)
    }

    pub fn in_flight_count(&self) -> usize {
        self.services.values().map(BaseService::in_flight_count).sum()
    }

    pub fn in_flight_ids(&self) -> Vec<String> {
        self.services
            .values()
            .flat_map(BaseService::in_flight_ids)
            .collect()
    }

    fn owner_of(&mut self, task_id: &str) -> Option<&mut BaseService> {
        self.services
            .values_mut()
            .find(|service| service.is_in_flight(task_id))
    }

    pub async fn create_task(&mut self, task_type: TaskType, request: TaskRequest) -> Result<Task, ServiceError> {
        match self.services.get_mut(&task_type) {
            Some(service) => service.create_task(request).await,
            None => {
                warn!("No service registered for task type: {}", task_type);
                Err(ServiceError::NoService(task_type))
            }
        }
    }

    pub async fn start(&mut self, task: &mut Task) -> bool {
        match self.services.get_mut(&task.task_type) {
            Some(service) => service.start(task).await,
            None => {
                warn!("No service registered for task type: {}", task.task_type);
                false
            }
        }
    }

    /// Prefers the live in-flight copy over the stored one.
    pub async fn get_task(&self, task_id: &str) -> Option<Task> {
        let live = self
            .services
            .values()
            .find_map(|service| service.in_flight_task(task_id).cloned());
        match live {
            Some(task) => Some(task),
            None => self.ctx.db.get(task_id).await,
        }
    }

    pub async fn start_by_id(&mut self, task_id: &str) -> bool {
        let Some(mut task) = self.ctx.db.get(task_id).await else {
            warn!("Task {} not found", task_id);
            return false;
        };
        self.start(&mut task).await
    }

    pub async fn cancel(&mut self, task_id: &str) -> bool {
        match self.owner_of(task_id) {
            Some(service) => service.cancel(task_id).await,
            None => false,
        }
    }

    pub async fn restart(&mut self, task_id: &str) -> bool {
        let Some(mut task) = self.ctx.db.get(task_id).await else {
            warn!("Task {} not found", task_id);
            return false;
        };
        match self.services.get_mut(&task.task_type) {
            Some(service) => service.restart(&mut task).await,
            None => false,
        }
    }

    pub async fn retry(&mut self, task_id: &str) -> bool {
        let Some(mut task) = self.ctx.db.get(task_id).await else {
            warn!("Task {} not found", task_id);
            return false;
        };
        match self.services.get_mut(&task.task_type) {
            Some(service) => service.retry(&mut task).await,
            None => false,
        }
    }

    pub async fn pause(&mut self, task_id: &str) -> bool {
        match self.owner_of(task_id) {
            Some(service) => service.pause(task_id).await,
            None => false,
        }
    }

    pub async fn resume(&mut self, task_id: &str) -> bool {
        match self.owner_of(task_id) {
            Some(service) => service.resume(task_id).await,
            None => false,
        }
    }

    /// Cancels the task if it is running, then removes it from the store.
    pub async fn delete_task(&mut self, task_id: &str) -> bool {
        self.cancel(task_id).await;
        let deleted = self.ctx.db.delete(task_id).await;
        if deleted {
            info!("Deleted task {}", task_id);
        }
        deleted
    }

    /// Applies pending worker messages for every service.
    pub async fn tick(&mut self) -> usize {
        let mut handled = 0;
        for service in self.services.values_mut() {
            handled += service.process_pending().await;
        }
        handled
    }

    /// Sleeps until a worker posts something, then ticks. Not cancel safe:
    /// dropping it mid-tick can leave a finished task unsaved.
    pub async fn wait(&mut self) -> usize {
        self.ctx.wake.notified().await;
        self.tick().await
    }

    /// Like `wait`, but also returns when `interrupt` resolves. Only the wake-up
    /// is raced; queued messages are always applied afterwards. Returns true
    /// when `interrupt` won.
    pub async fn wait_or<F: Future>(&mut self, interrupt: F) -> bool {
        let interrupted = tokio::select! {
            _ = self.ctx.wake.notified() => false,
            _ = interrupt => true,
        };
        self.tick().await;
        interrupted
    }

    pub async fn run_until_idle(&mut self) {
        loop {
            self.tick().await;
            if self.in_flight_count() == 0 {
                break;
            }
            self.ctx.wake.notified().await;
        }
    }

    /// Shuts every service down. Returns the number of abandoned jobs.
    pub async fn cleanup(&mut self) -> usize {
        let mut abandoned = 0;
        for service in self.services.values_mut() {
            abandoned += service.cleanup().await;
        }
        info!("Task manager stopped, {} job(s) abandoned", abandoned);
        abandoned
    }
}
