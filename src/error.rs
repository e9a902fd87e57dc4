use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InferenceError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("coordination error: {0}")]
    Coordination(String),
    #[error("model error: {0}")]
    Model(String),
}

pub type Result<T, E = InferenceError> = std::result::Result<T, E>;

impl InferenceError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn coordination(message: impl Into<String>) -> Self {
        Self::Coordination(message.into())
    }

    pub fn model(message: impl Into<String>) -> Self {
        Self::Model(message.into())
    }
}
