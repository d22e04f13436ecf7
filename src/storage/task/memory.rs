use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::query::TaskQuery;
use super::{TaskStats, TaskStorage};
use crate::schedule::types::{Task, TaskStatus};

/// Process-local store with the same semantics as the SQLite one.
#[derive(Default)]
pub struct InMemoryTaskStorage {
    tasks: RwLock<HashMap<String, Task>>,
}

impl InMemoryTaskStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStorage for InMemoryTaskStorage {
    async fn upsert(&self, task: &Task) -> Result<()> {
        let mut tasks = self.tasks.write().map_err(|e| anyhow!(e.to_string()))?;
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Option<Task>> {
        let tasks = self.tasks.read().map_err(|e| anyhow!(e.to_string()))?;
        Ok(tasks.get(task_id).cloned())
    }

    async fn list(&self, query: &TaskQuery) -> Result<Vec<Task>> {
        let tasks = self.tasks.read().map_err(|e| anyhow!(e.to_string()))?;
        Ok(query.apply(tasks.values()))
    }

    async fn delete(&self, task_id: &str) -> Result<bool> {
        let mut tasks = self.tasks.write().map_err(|e| anyhow!(e.to_string()))?;
        Ok(tasks.remove(task_id).is_some())
    }

    async fn delete_by_status(&self, status: TaskStatus) -> Result<u64> {
        let mut tasks = self.tasks.write().map_err(|e| anyhow!(e.to_string()))?;
        let before = tasks.len();
        tasks.retain(|_, task| task.status != status);
        Ok((before - tasks.len()) as u64)
    }

    async fn update_status(&self, task_id: &str, status: TaskStatus, at: DateTime<Utc>) -> Result<bool> {
        let mut tasks = self.tasks.write().map_err(|e| anyhow!(e.to_string()))?;
        Ok(match tasks.get_mut(task_id) {
            Some(task) => {
                task.status = status;
                task.update_time = Some(at);
                true
            }
            None => false,
        })
    }

    async fn update_progress(
        &self,
        task_id: &str,
        progress: f64,
        speed: &str,
        eta: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tasks = self.tasks.write().map_err(|e| anyhow!(e.to_string()))?;
        Ok(match tasks.get_mut(task_id) {
            Some(task) => {
                task.progress = progress;
                task.speed = speed.to_string();
                task.eta = eta.to_string();
                task.update_time = Some(at);
                true
            }
            None => false,
        })
    }

    async fn statistics(&self, since: DateTime<Utc>) -> Result<TaskStats> {
        let tasks = self.tasks.read().map_err(|e| anyhow!(e.to_string()))?;
        let mut stats = TaskStats {
            total: tasks.len() as u64,
            ..TaskStats::default()
        };
        for task in tasks.values() {
            *stats.by_status.entry(task.status.to_string()).or_default() += 1;
            *stats.by_type.entry(task.task_type.to_string()).or_default() += 1;
            if task.create_time >= since {
                stats.today += 1;
            }
        }
        Ok(stats)
    }

    async fn cleanup_old(&self, before: DateTime<Utc>, keep_successful: bool) -> Result<u64> {
        let mut tasks = self.tasks.write().map_err(|e| anyhow!(e.to_string()))?;
        let count = tasks.len();
        tasks.retain(|_, task| {
            task.create_time >= before || (keep_successful && task.status == TaskStatus::Success)
        });
        Ok((count - tasks.len()) as u64)
    }
}
