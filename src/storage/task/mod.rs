use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::schedule::types::{Task, TaskStatus};

pub mod entity;
pub mod mapping;
pub mod memory;
pub mod query;
pub mod service;
pub mod sqlite;

pub use query::{OrderBy, TaskQuery};
pub use service::TaskService;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
    pub by_type: BTreeMap<String, u64>,
    /// Tasks created since the start of the current UTC day.
    pub today: u64,
}

/// Task store shared by every service. Implementations serialize writes.
#[async_trait]
pub trait TaskStorage: Send + Sync + 'static {
    /// Insert or replace by id.
    async fn upsert(&self, task: &Task) -> Result<()>;
    async fn get(&self, task_id: &str) -> Result<Option<Task>>;
    async fn list(&self, query: &TaskQuery) -> Result<Vec<Task>>;
    async fn delete(&self, task_id: &str) -> Result<bool>;
    async fn delete_by_status(&self, status: TaskStatus) -> Result<u64>;
    async fn update_status(&self, task_id: &str, status: TaskStatus, at: DateTime<Utc>) -> Result<bool>;
    async fn update_progress(
        &self,
        task_id: &str,
        progress: f64,
        speed: &str,
        eta: &str,
        at: DateTime<Utc>,
    ) -> Result<bool>;
    async fn statistics(&self, since: DateTime<Utc>) -> Result<TaskStats>;
    async fn cleanup_old(&self, before: DateTime<Utc>, keep_successful: bool) -> Result<u64>;
}
