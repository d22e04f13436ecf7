pub mod callback;
pub mod error;
pub mod processors;
pub mod scheduler;
pub mod types;

#[cfg(test)]
mod tests;

pub use callback::{EventBus, FunctionCallback, TaskCallback, TaskEvent};
pub use error::ServiceError;
pub use processors::JobRunner;
pub use scheduler::{BaseService, JobContext, ServiceContext, ServiceSettings, TaskManager};
pub use types::{
    DownloadSource, JobOutput, LogLevel, ProgressUpdate, Task, TaskRequest, TaskStatus, TaskType,
};

pub use crate::storage::task::TaskStorage;
