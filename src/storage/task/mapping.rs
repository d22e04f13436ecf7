use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::schedule::types::Task;
use crate::storage::task::entity::Model as TaskModel;

/// Nanosecond precision with a `Z` suffix: round-trips exactly and sorts as text.
pub fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("invalid timestamp: {}", value))?
        .with_timezone(&Utc))
}

fn parse_optional_time(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value
        .filter(|v| !v.is_empty())
        .map(|v| parse_time(&v))
        .transpose()
}

// Broken JSON columns come back empty instead of hiding the whole row.
fn parse_json_or_default<T: DeserializeOwned + Default>(task_id: &str, field: &str, value: &str) -> T {
    if value.trim().is_empty() {
        return T::default();
    }
    serde_json::from_str(value).unwrap_or_else(|e| {
        warn!("Task {} has malformed {} ({}), using empty value", task_id, field, e);
        T::default()
    })
}

impl TryFrom<TaskModel> for Task {
    type Error = anyhow::Error;

    fn try_from(model: TaskModel) -> Result<Self> {
        let id = model.id;
        Ok(Task {
            task_type: model.task_type.parse()?,
            status: model.status.parse()?,
            name: model.name,
            file_name: model.file_name,
            description: model.description,
            url: model.url,
            input_path: model.input_path,
            output_path: model.output_path,
            output_paths: parse_json_or_default(&id, "output_paths", &model.output_paths),
            log_file: model.log_file,
            progress: model.progress,
            speed: model.speed,
            eta: model.eta,
            current_step: model.current_step,
            total_steps: model.total_steps.max(0) as u32,
            current_step_index: model.current_step_index.max(0) as u32,
            file_size: model.file_size.max(0) as u64,
            duration: model.duration,
            create_time: parse_time(&model.create_time)?,
            start_time: parse_optional_time(model.start_time)?,
            end_time: parse_optional_time(model.end_time)?,
            update_time: parse_optional_time(model.update_time)?,
            error_msg: model.error_msg,
            error_code: model.error_code,
            retry_count: model.retry_count.max(0) as u32,
            max_retry: model.max_retry.max(0) as u32,
            config: parse_json_or_default(&id, "config", &model.config),
            metadata: parse_json_or_default(&id, "metadata", &model.metadata),
            tags: parse_json_or_default(&id, "tags", &model.tags),
            category: model.category,
            priority: model.priority as i32,
            id,
        })
    }
}

impl From<&Task> for TaskModel {
    fn from(task: &Task) -> Self {
        TaskModel {
            id: task.id.clone(),
            task_type: task.task_type.as_str().to_string(),
            status: task.status.as_str().to_string(),
            name: task.name.clone(),
            file_name: task.file_name.clone(),
            description: task.description.clone(),
            url: task.url.clone(),
            input_path: task.input_path.clone(),
            output_path: task.output_path.clone(),
            output_paths: serde_json::Value::from(task.output_paths.clone()).to_string(),
            log_file: task.log_file.clone(),
            progress: task.progress,
            speed: task.speed.clone(),
            eta: task.eta.clone(),
            current_step: task.current_step.clone(),
            total_steps: task.total_steps as i64,
            current_step_index: task.current_step_index as i64,
            file_size: task.file_size as i64,
            duration: task.duration,
            create_time: format_time(&task.create_time),
            start_time: task.start_time.as_ref().map(format_time),
            end_time: task.end_time.as_ref().map(format_time),
            update_time: task.update_time.as_ref().map(format_time),
            error_msg: task.error_msg.clone(),
            error_code: task.error_code.clone(),
            retry_count: task.retry_count as i64,
            max_retry: task.max_retry as i64,
            config: serde_json::Value::Object(task.config.clone()).to_string(),
            metadata: serde_json::Value::Object(task.metadata.clone()).to_string(),
            tags: serde_json::Value::from(task.tags.clone()).to_string(),
            category: task.category.clone(),
            priority: task.priority as i64,
        }
    }
}
