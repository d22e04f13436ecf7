use std::fmt::{self, Display};
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Download,
    Translate,
    Transcribe,
    VocalSeparate,
    MediaSplit,
}

impl TaskType {
    pub const ALL: [TaskType; 5] = [
        TaskType::Download,
        TaskType::Translate,
        TaskType::Transcribe,
        TaskType::VocalSeparate,
        TaskType::MediaSplit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Download => "download",
            TaskType::Translate => "translate",
            TaskType::Transcribe => "transcribe",
            TaskType::VocalSeparate => "vocal_separate",
            TaskType::MediaSplit => "media_split",
        }
    }
}

impl Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| anyhow!("Invalid task type: {}", s))
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
    Paused,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Success,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
        TaskStatus::Paused,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Paused => "paused",
        }
    }

    /// success, failed and cancelled: nothing happens until an explicit restart.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| anyhow!("Invalid task status: {}", s))
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadSource {
    Bilibili,
    Youtube,
    Local,
    Other,
}

impl DownloadSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadSource::Bilibili => "bilibili",
            DownloadSource::Youtube => "youtube",
            DownloadSource::Local => "local",
            DownloadSource::Other => "other",
        }
    }
}

impl Display for DownloadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bilibili" => Ok(DownloadSource::Bilibili),
            "youtube" => Ok(DownloadSource::Youtube),
            "local" => Ok(DownloadSource::Local),
            "other" => Ok(DownloadSource::Other),
            _ => Err(anyhow!("Invalid download source: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        }
    }
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work and everything known about its execution.
///
/// `config` is opaque here; only the service owning `task_type` reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,

    pub name: String,
    pub file_name: String,
    pub description: String,
    pub url: String,
    pub input_path: String,
    pub output_path: String,
    pub output_paths: Vec<String>,
    pub log_file: String,

    pub progress: f64,
    pub speed: String,
    pub eta: String,
    pub current_step: String,
    pub total_steps: u32,
    pub current_step_index: u32,
    pub file_size: u64,
    pub duration: f64,

    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,

    pub error_msg: String,
    pub error_code: String,
    pub retry_count: u32,
    pub max_retry: u32,

    pub config: Map<String, Value>,
    pub metadata: Map<String, Value>,
    pub tags: Vec<String>,
    pub category: String,
    pub priority: i32,
}

impl Task {
    pub fn new(task_type: TaskType) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_type,
            status: TaskStatus::Pending,
            name: String::new(),
            file_name: String::new(),
            description: String::new(),
            url: String::new(),
            input_path: String::new(),
            output_path: String::new(),
            output_paths: Vec::new(),
            log_file: String::new(),
            progress: 0.0,
            speed: String::new(),
            eta: String::new(),
            current_step: String::new(),
            total_steps: 1,
            current_step_index: 0,
            file_size: 0,
            duration: 0.0,
            create_time: Utc::now(),
            start_time: None,
            end_time: None,
            update_time: None,
            error_msg: String::new(),
            error_code: String::new(),
            retry_count: 0,
            max_retry: 3,
            config: Map::new(),
            metadata: Map::new(),
            tags: Vec::new(),
            category: String::new(),
            priority: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == TaskStatus::Running
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_successful(&self) -> bool {
        self.status == TaskStatus::Success
    }

    pub fn is_failed(&self) -> bool {
        self.status == TaskStatus::Failed
    }

    pub fn can_retry(&self) -> bool {
        self.is_failed() && self.retry_count < self.max_retry
    }

    /// Time spent running; open-ended tasks are measured up to now.
    pub fn elapsed(&self) -> Option<Duration> {
        let start = self.start_time?;
        let end = self.end_time.unwrap_or_else(Utc::now);
        Some(end - start)
    }

    pub fn progress_percentage(&self) -> String {
        format!("{:.1}%", self.progress)
    }

    pub fn source(&self) -> Option<DownloadSource> {
        self.metadata
            .get("source")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
    }

    pub fn set_source(&mut self, source: DownloadSource) {
        self.metadata
            .insert("source".to_string(), Value::from(source.as_str()));
    }

    /// Back to a fresh pending state, keeping identity, inputs and config.
    pub fn reset(&mut self) {
        self.status = TaskStatus::Pending;
        self.progress = 0.0;
        self.speed.clear();
        self.eta.clear();
        self.current_step.clear();
        self.current_step_index = 0;
        self.error_msg.clear();
        self.error_code.clear();
        self.start_time = None;
        self.end_time = None;
    }

    pub fn display_name(&self) -> &str {
        [&self.name, &self.file_name, &self.url, &self.input_path]
            .into_iter()
            .find(|s| !s.is_empty())
            .map(String::as_str)
            .unwrap_or(self.id.as_str())
    }
}

/// Parameters for creating a task; the owning service validates and fills in the rest.
#[derive(Debug, Clone, Default)]
pub struct TaskRequest {
    pub url: Option<String>,
    pub input_path: Option<PathBuf>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub config: Map<String, Value>,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub priority: i32,
    pub max_retry: Option<u32>,
    /// Persist the task but leave it pending.
    pub defer_start: bool,
}

impl TaskRequest {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            input_path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = Some(max_retry);
        self
    }

    pub fn deferred(mut self) -> Self {
        self.defer_start = true;
        self
    }

    /// Trimmed url, `None` when missing or blank.
    pub fn url_str(&self) -> Option<&str> {
        self.url.as_deref().map(str::trim).filter(|u| !u.is_empty())
    }

    /// Builds a pending task carrying the request's common fields.
    pub fn into_task(self, task_type: TaskType) -> Task {
        let mut task = Task::new(task_type);
        if let Some(url) = self.url {
            task.url = url.trim().to_string();
        }
        if let Some(path) = self.input_path {
            task.input_path = path.to_string_lossy().into_owned();
        }
        task.name = self.name.unwrap_or_default();
        task.description = self.description.unwrap_or_default();
        task.config = self.config;
        task.category = self.category.unwrap_or_default();
        task.tags = self.tags;
        task.priority = self.priority;
        if let Some(max_retry) = self.max_retry {
            task.max_retry = max_retry;
        }
        task
    }
}

/// Progress reported by a running job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub progress: f64,
    pub speed: Option<String>,
    pub eta: Option<String>,
    pub step: Option<String>,
}

impl ProgressUpdate {
    pub fn new(progress: f64) -> Self {
        Self {
            progress,
            ..Self::default()
        }
    }

    pub fn with_speed(mut self, speed: impl Into<String>) -> Self {
        self.speed = Some(speed.into());
        self
    }

    pub fn with_eta(mut self, eta: impl Into<String>) -> Self {
        self.eta = Some(eta.into());
        self
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }
}

/// What a successful job hands back to its service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOutput {
    pub output_path: Option<String>,
    pub output_paths: Vec<String>,
    pub file_size: Option<u64>,
    pub duration: Option<f64>,
    pub metadata: Map<String, Value>,
}

impl JobOutput {
    pub fn file(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            output_paths: vec![path.clone()],
            output_path: Some(path),
            ..Self::default()
        }
    }

    pub fn files(paths: Vec<String>) -> Self {
        Self {
            output_path: paths.first().cloned(),
            output_paths: paths,
            ..Self::default()
        }
    }

    /// Copies the result onto the task record.
    pub fn apply(&self, task: &mut Task) {
        if let Some(path) = &self.output_path {
            task.output_path = path.clone();
        }
        if !self.output_paths.is_empty() {
            task.output_paths = self.output_paths.clone();
        }
        if let Some(size) = self.file_size {
            task.file_size = size;
        }
        if let Some(duration) = self.duration {
            task.duration = duration;
        }
        for (key, value) in &self.metadata {
            task.metadata.insert(key.clone(), value.clone());
        }
    }
}
