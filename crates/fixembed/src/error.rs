use thiserror::Error;

use crate::retry::RetryError;

#[derive(Debug, Error)]
pub enum ServiceSetError {
    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("unsupported service set encoding version {0}")]
    UnsupportedVersion(u32),

    #[error("malformed service set: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The store stayed busy/locked for every permitted attempt.
    #[error("store still busy after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("invalid value for setting `{key}`: {source}")]
    InvalidSetting {
        key: String,
        #[source]
        source: ServiceSetError,
    },
}

impl From<RetryError<sqlx::Error>> for StoreError {
    fn from(err: RetryError<sqlx::Error>) -> Self {
        match err {
            RetryError::Exhausted { attempts, last } => StoreError::Exhausted {
                attempts,
                source: last,
            },
            RetryError::Fatal(e) => StoreError::Database(e),
        }
    }
}

impl StoreError {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, StoreError::Exhausted { .. })
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
