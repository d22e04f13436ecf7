use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Row shape of the `tasks` table. Timestamps are fixed-width RFC 3339 text,
/// list and map fields are JSON text.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tasks")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub task_type: String,
    pub status: String,
    pub name: String,
    pub file_name: String,
    pub description: String,
    pub url: String,
    pub input_path: String,
    pub output_path: String,
    pub output_paths: String,
    pub log_file: String,
    pub progress: f64,
    pub speed: String,
    pub eta: String,
    pub current_step: String,
    pub total_steps: i64,
    pub current_step_index: i64,
    pub file_size: i64,
    pub duration: f64,
    pub create_time: String,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub update_time: Option<String>,
    pub error_msg: String,
    pub error_code: String,
    pub retry_count: i64,
    pub max_retry: i64,
    pub config: String,
    pub metadata: String,
    pub tags: String,
    pub category: String,
    pub priority: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
