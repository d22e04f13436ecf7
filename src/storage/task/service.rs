use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use tracing::error;

use super::memory::InMemoryTaskStorage;
use super::query::{OrderBy, TaskQuery};
use super::sqlite::SqliteTaskStorage;
use super::{TaskStats, TaskStorage};
use crate::schedule::types::{Task, TaskStatus};

/// Storage facade used by the orchestration layer.
///
/// Storage errors are logged here and reported as `false`, `None` or an empty
/// result; callers keep running on their in-memory state.
#[derive(Clone)]
pub struct TaskService {
    storage: Arc<dyn TaskStorage>,
}

impl TaskService {
    pub fn new(storage: Arc<dyn TaskStorage>) -> Self {
        Self { storage }
    }

    pub async fn sqlite(database_url: &str) -> Result<Self> {
        Ok(Self::new(Arc::new(SqliteTaskStorage::new(database_url).await?)))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryTaskStorage::new()))
    }

    pub fn storage(&self) -> &Arc<dyn TaskStorage> {
        &self.storage
    }

    /// Stamps `update_time` and upserts.
    pub async fn save(&self, task: &mut Task) -> bool {
        task.update_time = Some(Utc::now());
        match self.storage.upsert(task).await {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to save task {}: {}", task.id, e);
                false
            }
        }
    }

    pub async fn get(&self, task_id: &str) -> Option<Task> {
        match self.storage.get(task_id).await {
            Ok(task) => task,
            Err(e) => {
                error!("Failed to load task {}: {}", task_id, e);
                None
            }
        }
    }

    pub async fn list_by(&self, query: &TaskQuery) -> Vec<Task> {
        self.storage.list(query).await.unwrap_or_else(|e| {
            error!("Failed to list tasks: {}", e);
            Vec::new()
        })
    }

    pub async fn list_all(&self, order_by: OrderBy, ascending: bool) -> Vec<Task> {
        self.list_by(&TaskQuery::new().order_by(order_by, ascending))
            .await
    }

    /// Substring search over name, file name, description and url, narrowed by `filters`.
    pub async fn search(&self, keyword: &str, filters: TaskQuery) -> Vec<Task> {
        self.list_by(&filters.keyword(keyword)).await
    }

    pub async fn delete(&self, task_id: &str) -> bool {
        self.storage.delete(task_id).await.unwrap_or_else(|e| {
            error!("Failed to delete task {}: {}", task_id, e);
            false
        })
    }

    pub async fn delete_by_status(&self, status: TaskStatus) -> u64 {
        self.storage
            .delete_by_status(status)
            .await
            .unwrap_or_else(|e| {
                error!("Failed to delete {} tasks: {}", status, e);
                0
            })
    }

    pub async fn update_status(&self, task_id: &str, status: TaskStatus) -> bool {
        self.storage
            .update_status(task_id, status, Utc::now())
            .await
            .unwrap_or_else(|e| {
                error!("Failed to update status of task {}: {}", task_id, e);
                false
            })
    }

    pub async fn update_progress(&self, task_id: &str, progress: f64, speed: &str, eta: &str) -> bool {
        self.storage
            .update_progress(task_id, progress.clamp(0.0, 100.0), speed, eta, Utc::now())
            .await
            .unwrap_or_else(|e| {
                error!("Failed to update progress of task {}: {}", task_id, e);
                false
            })
    }

    pub async fn statistics(&self) -> TaskStats {
        let today = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|midnight| midnight.and_utc())
            .unwrap_or_else(Utc::now);
        self.storage.statistics(today).await.unwrap_or_else(|e| {
            error!("Failed to collect task statistics: {}", e);
            TaskStats::default()
        })
    }

    /// Deletes tasks created more than `days` ago.
    pub async fn cleanup_old(&self, days: i64, keep_successful: bool) -> u64 {
        let before = Utc::now() - Duration::days(days.max(0));
        self.storage
            .cleanup_old(before, keep_successful)
            .await
            .unwrap_or_else(|e| {
                error!("Failed to clean up old tasks: {}", e);
                0
            })
    }
}
