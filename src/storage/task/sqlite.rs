use std::collections::BTreeMap;

use async_trait::async_trait;
use anyhow::Result;
use chrono::{DateTime, Utc};
use sea_query::{QueryStatementWriter, SqliteQueryBuilder};
use sea_orm::{ColumnTrait, Condition, EntityTrait, Order, QueryFilter, QueryOrder, QuerySelect, QueryTrait};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::entity::{Column, Entity as TaskEntity, Model as TaskModel};
use super::mapping::format_time;
use super::query::{OrderBy, TaskQuery};
use super::{TaskStats, TaskStorage};
use crate::schedule::types::{Task, TaskStatus};

const COLUMNS: [&str; 32] = [
    "id",
    "task_type",
    "status",
    "name",
    "file_name",
    "description",
    "url",
    "input_path",
    "output_path",
    "output_paths",
    "log_file",
    "progress",
    "speed",
    "eta",
    "current_step",
    "total_steps",
    "current_step_index",
    "file_size",
    "duration",
    "create_time",
    "start_time",
    "end_time",
    "update_time",
    "error_msg",
    "error_code",
    "retry_count",
    "max_retry",
    "config",
    "metadata",
    "tags",
    "category",
    "priority",
];

pub struct SqliteTaskStorage {
    pool: SqlitePool,
    // one writer at a time
    write_lock: Mutex<()>,
}

impl SqliteTaskStorage {
    pub async fn new(database_url: &str) -> Result<Self> {
        info!("Initializing SQLite task storage at {}", database_url);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Self::with_pool(pool).await
    }

    /// Private in-memory database; a single connection keeps every query on it.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        let storage = Self {
            pool,
            write_lock: Mutex::new(()),
        };
        storage.migrate().await?;
        Ok(storage)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                task_type TEXT NOT NULL,
                status TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                file_name TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                url TEXT NOT NULL DEFAULT '',
                input_path TEXT NOT NULL DEFAULT '',
                output_path TEXT NOT NULL DEFAULT '',
                output_paths TEXT NOT NULL DEFAULT '[]',
                log_file TEXT NOT NULL DEFAULT '',
                progress REAL NOT NULL DEFAULT 0,
                speed TEXT NOT NULL DEFAULT '',
                eta TEXT NOT NULL DEFAULT '',
                current_step TEXT NOT NULL DEFAULT '',
                total_steps INTEGER NOT NULL DEFAULT 1,
                current_step_index INTEGER NOT NULL DEFAULT 0,
                file_size INTEGER NOT NULL DEFAULT 0,
                duration REAL NOT NULL DEFAULT 0,
                create_time TEXT NOT NULL,
                start_time TEXT,
                end_time TEXT,
                update_time TEXT,
                error_msg TEXT NOT NULL DEFAULT '',
                error_code TEXT NOT NULL DEFAULT '',
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retry INTEGER NOT NULL DEFAULT 3,
                config TEXT NOT NULL DEFAULT '{}',
                metadata TEXT NOT NULL DEFAULT '{}',
                tags TEXT NOT NULL DEFAULT '[]',
                category TEXT NOT NULL DEFAULT '',
                priority INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for (index, column) in [
            ("idx_tasks_type", "task_type"),
            ("idx_tasks_status", "status"),
            ("idx_tasks_create_time", "create_time"),
            ("idx_tasks_priority", "priority"),
        ] {
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS {} ON tasks({})",
                index, column
            ))
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    fn row_to_model(row: &SqliteRow) -> Result<TaskModel> {
        Ok(TaskModel {
            id: row.try_get("id")?,
            task_type: row.try_get("task_type")?,
            status: row.try_get("status")?,
            name: row.try_get("name")?,
            file_name: row.try_get("file_name")?,
            description: row.try_get("description")?,
            url: row.try_get("url")?,
            input_path: row.try_get("input_path")?,
            output_path: row.try_get("output_path")?,
            output_paths: row.try_get("output_paths")?,
            log_file: row.try_get("log_file")?,
            progress: row.try_get("progress")?,
            speed: row.try_get("speed")?,
            eta: row.try_get("eta")?,
            current_step: row.try_get("current_step")?,
            total_steps: row.try_get("total_steps")?,
            current_step_index: row.try_get("current_step_index")?,
            file_size: row.try_get("file_size")?,
            duration: row.try_get("duration")?,
            create_time: row.try_get("create_time")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            update_time: row.try_get("update_time")?,
            error_msg: row.try_get("error_msg")?,
            error_code: row.try_get("error_code")?,
            retry_count: row.try_get("retry_count")?,
            max_retry: row.try_get("max_retry")?,
            config: row.try_get("config")?,
            metadata: row.try_get("metadata")?,
            tags: row.try_get("tags")?,
            category: row.try_get("category")?,
            priority: row.try_get("priority")?,
        })
    }

    fn row_to_task(row: &SqliteRow) -> Result<Task> {
        Task::try_from(Self::row_to_model(row)?)
    }

    fn order_column(order_by: OrderBy) -> Column {
        match order_by {
            OrderBy::CreateTime => Column::CreateTime,
            OrderBy::UpdateTime => Column::UpdateTime,
            OrderBy::StartTime => Column::StartTime,
            OrderBy::EndTime => Column::EndTime,
            OrderBy::Priority => Column::Priority,
            OrderBy::Progress => Column::Progress,
            OrderBy::Name => Column::Name,
        }
    }

    fn list_sql(query: &TaskQuery) -> String {
        let mut select = TaskEntity::find();
        if let Some(status) = query.status {
            select = select.filter(Column::Status.eq(status.as_str()));
        }
        if let Some(task_type) = query.task_type {
            select = select.filter(Column::TaskType.eq(task_type.as_str()));
        }
        if let Some(category) = &query.category {
            select = select.filter(Column::Category.eq(category.as_str()));
        }
        if let Some(term) = query.search_term() {
            let pattern = format!("%{}%", term);
            select = select.filter(
                Condition::any()
                    .add(Column::Name.like(pattern.as_str()))
                    .add(Column::FileName.like(pattern.as_str()))
                    .add(Column::Description.like(pattern.as_str()))
                    .add(Column::Url.like(pattern.as_str())),
            );
        }

        let order = if query.ascending { Order::Asc } else { Order::Desc };
        select = select
            .order_by(Self::order_column(query.order_by), order)
            .order_by(Column::Id, Order::Asc);

        // sqlite needs a LIMIT before any OFFSET
        match (query.limit, query.offset) {
            (Some(limit), offset) => select = select.limit(limit).offset(offset),
            (None, offset) if offset > 0 => select = select.limit(i64::MAX as u64).offset(offset),
            _ => {}
        }

        select.into_query().to_string(SqliteQueryBuilder)
    }

    async fn count_grouped(&self, column: &str) -> Result<BTreeMap<String, u64>> {
        let rows = sqlx::query(&format!(
            "SELECT {col} AS key, COUNT(*) AS n FROM tasks GROUP BY {col}",
            col = column
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let key: String = row.try_get("key")?;
            let n: i64 = row.try_get("n")?;
            counts.insert(key, n as u64);
        }
        Ok(counts)
    }
}

#[async_trait]
impl TaskStorage for SqliteTaskStorage {
    async fn upsert(&self, task: &Task) -> Result<()> {
        let model = TaskModel::from(task);
        let placeholders = vec!["?"; COLUMNS.len()].join(", ");
        let sql = format!(
            "INSERT OR REPLACE INTO tasks ({}) VALUES ({})",
            COLUMNS.join(", "),
            placeholders
        );

        let _guard = self.write_lock.lock().await;
        sqlx::query(&sql)
            .bind(&model.id)
            .bind(&model.task_type)
            .bind(&model.status)
            .bind(&model.name)
            .bind(&model.file_name)
            .bind(&model.description)
            .bind(&model.url)
            .bind(&model.input_path)
            .bind(&model.output_path)
            .bind(&model.output_paths)
            .bind(&model.log_file)
            .bind(model.progress)
            .bind(&model.speed)
            .bind(&model.eta)
            .bind(&model.current_step)
            .bind(model.total_steps)
            .bind(model.current_step_index)
            .bind(model.file_size)
            .bind(model.duration)
            .bind(&model.create_time)
            .bind(&model.start_time)
            .bind(&model.end_time)
            .bind(&model.update_time)
            .bind(&model.error_msg)
            .bind(&model.error_code)
            .bind(model.retry_count)
            .bind(model.max_retry)
            .bind(&model.config)
            .bind(&model.metadata)
            .bind(&model.tags)
            .bind(&model.category)
            .bind(model.priority)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn list(&self, query: &TaskQuery) -> Result<Vec<Task>> {
        let rows = sqlx::query(&Self::list_sql(query))
            .fetch_all(&self.pool)
            .await?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            match Self::row_to_task(&row) {
                Ok(task) => tasks.push(task),
                Err(e) => warn!("Skipping unreadable task row: {}", e),
            }
        }
        Ok(tasks)
    }

    async fn delete(&self, task_id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_by_status(&self, status: TaskStatus) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM tasks WHERE status = ?")
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn update_status(&self, task_id: &str, status: TaskStatus, at: DateTime<Utc>) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("UPDATE tasks SET status = ?, update_time = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(format_time(&at))
            .bind(task_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_progress(
        &self,
        task_id: &str,
        progress: f64,
        speed: &str,
        eta: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "UPDATE tasks SET progress = ?, speed = ?, eta = ?, update_time = ? WHERE id = ?",
        )
        .bind(progress)
        .bind(speed)
        .bind(eta)
        .bind(format_time(&at))
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn statistics(&self, since: DateTime<Utc>) -> Result<TaskStats> {
        let total: i64 = sqlx::query("SELECT COUNT(*) AS n FROM tasks")
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;
        let today: i64 = sqlx::query("SELECT COUNT(*) AS n FROM tasks WHERE create_time >= ?")
            .bind(format_time(&since))
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;

        Ok(TaskStats {
            total: total as u64,
            by_status: self.count_grouped("status").await?,
            by_type: self.count_grouped("task_type").await?,
            today: today as u64,
        })
    }

    async fn cleanup_old(&self, before: DateTime<Utc>, keep_successful: bool) -> Result<u64> {
        let sql = if keep_successful {
            "DELETE FROM tasks WHERE create_time < ? AND status != 'success'"
        } else {
            "DELETE FROM tasks WHERE create_time < ?"
        };

        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(sql)
            .bind(format_time(&before))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
