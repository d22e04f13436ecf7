mod service;
mod task_manager;
mod worker;

pub use service::{BaseService, LogEntry, ServiceContext, ServiceSettings};
pub use task_manager::TaskManager;
pub use worker::JobContext;
