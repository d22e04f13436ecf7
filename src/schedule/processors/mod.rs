pub mod download;
pub mod media_split;
pub mod transcribe;
pub mod translate;

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::schedule::error::ServiceError;
use crate::schedule::scheduler::JobContext;
use crate::schedule::types::{JobOutput, Task, TaskRequest, TaskType};

pub use download::DownloadRunner;
pub use media_split::MediaSplitRunner;
pub use transcribe::TranscribeRunner;
pub use translate::TranslateRunner;

/// The job-specific half of a service. Everything else (state machine,
/// persistence, events, worker pool) lives in `BaseService`.
pub trait JobRunner: Send + Sync + 'static {
    fn task_type(&self) -> TaskType;

    fn is_available(&self) -> bool;

    fn unavailable_reason(&self) -> String {
        format!("required tools for {} are not installed", self.task_type())
    }

    /// Validates the request and builds a pending task. No side effects.
    fn create_task(&self, request: TaskRequest) -> Result<Task, ServiceError>;

    /// The job function. Runs on a worker thread; report through `ctx` and
    /// return early with `JobCancelled` once `ctx` is cancelled.
    fn run(&self, task: &Task, ctx: &JobContext) -> Result<JobOutput>;
}

/// Reads a runner's typed view of `task.config`. Missing keys take defaults.
pub fn parse_config<C: DeserializeOwned>(config: &Map<String, Value>) -> Result<C, ServiceError> {
    serde_json::from_value(Value::Object(config.clone()))
        .map_err(|e| ServiceError::validation(format!("invalid task config: {}", e)))
}

pub(crate) fn require_input_file(request: &TaskRequest) -> Result<PathBuf, ServiceError> {
    let path = request
        .input_path
        .clone()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| ServiceError::validation("input file is required"))?;
    if !path.is_file() {
        return Err(ServiceError::validation(format!(
            "input file not found: {}",
            path.display()
        )));
    }
    Ok(path)
}

/// `outputDir` from the task config, else `default`.
pub(crate) fn output_dir(task: &Task, default: &Path) -> PathBuf {
    task.config
        .get("outputDir")
        .and_then(Value::as_str)
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| default.to_path_buf())
}

pub(crate) fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub(crate) fn file_size(path: &Path) -> Option<u64> {
    std::fs::metadata(path).ok().map(|m| m.len())
}
