use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("failed to load tickets: {0}")]
    Load(String),
    #[error("ticket creation failed, please try again")]
    Submission,
    #[error("description has {length} characters, at least {minimum} are required")]
    DescriptionTooShort { length: usize, minimum: usize },
    #[error("change feed error: {0}")]
    Feed(String),
    #[error("classification service error: {0}")]
    Service(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type AppResult<T> = Result<T, AppError>;
