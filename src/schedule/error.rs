use thiserror::Error;

use crate::schedule::types::TaskType;

/// Why a service refused to create a task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("{0} service is unavailable: {1}")]
    Unavailable(TaskType, String),
    #[error("no service registered for task type {0}")]
    NoService(TaskType),
}

impl ServiceError {
    pub fn validation(message: impl Into<String>) -> Self {
        ServiceError::Validation(message.into())
    }
}
