use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Compile error: {0}")]
    Compile(String),

    #[error("Unknown input parameters: {0}")]
    Bind(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Database error")]
    Database,

    #[error("Query timeout after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Query cancelled")]
    Cancelled,

    #[error("Autotest error: {0}")]
    Autotest(String),

    #[error("Session collision detected")]
    SessionCollision,

    #[error("Query not found: {0}")]
    QueryNotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err.to_string())
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Execution(err.to_string())
    }
}

impl Error {
    pub fn status_code(&self) -> u16 {
        match self {
            Error::QueryNotFound(_) => 404,
            Error::Timeout(_) => 504,
            Error::Unauthorized(_) => 401,
            Error::Forbidden(_) | Error::SessionCollision => 403,
            Error::Bind(_) | Error::InvalidRequest(_) => 400,
            Error::Compile(_)
            | Error::Execution(_)
            | Error::Database
            | Error::Cancelled
            | Error::Autotest(_)
            | Error::Config(_)
            | Error::Json(_)
            | Error::Internal(_) => 500,
        }
    }

    /// Short label used for the `kind` metric dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Compile(_) => "compile",
            Error::Bind(_) => "bind",
            Error::Execution(_) => "execution",
            Error::Database => "database",
            Error::Timeout(_) => "timeout",
            Error::Cancelled => "cancelled",
            Error::Autotest(_) => "autotest",
            Error::SessionCollision => "session_collision",
            Error::QueryNotFound(_) => "not_found",
            Error::Unauthorized(_) => "unauthorized",
            Error::Forbidden(_) => "forbidden",
            Error::InvalidRequest(_) => "invalid_request",
            Error::Config(_) => "config",
            Error::Json(_) => "json",
            Error::Internal(_) => "internal",
        }
    }

    pub fn with_query(self, name: &str) -> Self {
        match self {
            Error::Compile(msg) => Error::Compile(format!("[query={}] {}", name, msg)),
            Error::Execution(msg) => Error::Execution(format!("[query={}] {}", name, msg)),
            Error::Internal(msg) => Error::Internal(format!("[query={}] {}", name, msg)),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
