use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device already exists: {0}")]
    DeviceAlreadyExists(String),

    #[error("Version conflict on device {device}: expected {expected}, found {actual}")]
    Conflict {
        device: String,
        expected: u64,
        actual: u64,
    },

    #[error("Invalid notification: {0}")]
    InvalidNotification(String),

    #[error("Notification handler stopped")]
    HandlerStopped,

    #[error("Repository error: {0}")]
    RepositoryError(#[from] anyhow::Error),
}

impl DomainError {
    /// The device record no longer exists; retrying cannot help.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DomainError::DeviceNotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, DomainError::Conflict { .. })
    }
}
