use thiserror::Error;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("task {0} not found in failed tasks")]
    FailedTaskNotFound(String),

    #[error("smart dispatch is not enabled")]
    SmartDispatchDisabled,

    #[error("dispatch already running")]
    DispatchInProgress,

    #[error("{0}")]
    DirectoryNotAllowed(String),

    #[error("budget_exceeded: {0}")]
    BudgetExceeded(String),

    #[error("provider {0:?} not configured")]
    ProviderNotConfigured(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type HubResult<T> = Result<T, HubError>;
