//! Error types for grove-fulfillment

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FulfillmentError {
    /// Bad input or mismatched id sets. Raised before any write.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The reservation would exceed the request's pledged count.
    #[error(
        "Cannot reserve more trees than originally requested: {already_reserved} reserved + {requested} requested > {pledged} pledged"
    )]
    Overbooking {
        requested: usize,
        already_reserved: usize,
        pledged: usize,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Failure of a templating, rendering, storage or notification call.
    #[error("External service error: {0}")]
    External(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FulfillmentError {
    /// Whether a retry of the failed call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, FulfillmentError::External(_) | FulfillmentError::Io(_))
    }
}

impl From<rusqlite::Error> for FulfillmentError {
    fn from(e: rusqlite::Error) -> Self {
        FulfillmentError::Persistence(e.to_string())
    }
}

impl From<reqwest::Error> for FulfillmentError {
    fn from(e: reqwest::Error) -> Self {
        FulfillmentError::External(e.to_string())
    }
}

impl From<tokio::task::JoinError> for FulfillmentError {
    fn from(e: tokio::task::JoinError) -> Self {
        FulfillmentError::Task(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FulfillmentError>;
