use domain::{DomainError, GatewayError, ImageHostError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("authentication error: {0}")]
    Auth(GatewayError),
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("failed to persist {operation}: {source}")]
    Persistence {
        operation: &'static str,
        #[source]
        source: GatewayError,
    },
    #[error("upload error: {0}")]
    Upload(#[from] ImageHostError),
    #[error("change feed error: {0}")]
    Feed(GatewayError),
    #[error("validation failed: {field}: {message}")]
    Validation { field: String, message: String },
}

impl ApplicationError {
    /// 创建持久化错误
    pub fn persistence(operation: &'static str, source: GatewayError) -> Self {
        ApplicationError::Persistence { operation, source }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ApplicationError::Auth(_) | ApplicationError::NotAuthenticated)
    }
}

impl From<DomainError> for ApplicationError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::ValidationError { field, message } => {
                ApplicationError::Validation { field, message }
            }
        }
    }
}
