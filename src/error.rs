// src/error.rs
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use warp::http::StatusCode;
use warp::reject::Reject;

/// Rejection carried out of warp handlers; rendered by `api::handle_rejection`.
#[derive(Debug)]
pub struct CustomError {
    pub status: StatusCode,
    pub message: String,
}

impl CustomError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl fmt::Display for CustomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CustomError {}

impl Reject for CustomError {}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed record {}: {source}", path.display())]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid username: {0:?}")]
    InvalidUsername(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Password hashing task failed: {0}")]
    Hashing(#[from] tokio::task::JoinError),
}

#[derive(Error, Debug)]
pub enum QuoteError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status} for {ticker}")]
    Status { ticker: String, status: u16 },

    #[error("{0}")]
    Source(String),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Not logged in")]
    NotAuthenticated,

    #[error("{0}")]
    InvalidInput(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<tokio::task::JoinError> for SessionError {
    fn from(err: tokio::task::JoinError) -> Self {
        SessionError::Store(StoreError::Hashing(err))
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

impl From<SessionError> for CustomError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotAuthenticated => CustomError::unauthorized(err.to_string()),
            SessionError::InvalidInput(message) => CustomError::bad_request(message),
            SessionError::Store(e) => CustomError::internal(e.to_string()),
        }
    }
}
