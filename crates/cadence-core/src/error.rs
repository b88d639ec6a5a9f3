//! Error types for cadence-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Lease contention on cron job {0}")]
    LeaseContention(String),

    #[error("Provider failure: {0}")]
    Provider(String),

    #[error("Corrupt orchestration state for release {0}: {1}")]
    Corruption(String, String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// HTTP status code the service boundary reports for this error kind.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) | Error::Conflict(_) => 400,
            Error::NotFound(_) => 404,
            Error::LeaseContention(_) => 409,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::Validation("bad".into()).status_code(), 400);
        assert_eq!(Error::Conflict("busy".into()).status_code(), 400);
        assert_eq!(Error::NotFound("gone".into()).status_code(), 404);
        assert_eq!(Error::LeaseContention("x".into()).status_code(), 409);
        assert_eq!(Error::Other("boom".into()).status_code(), 500);
    }
}
