//! Error Signals
//!
//! Most plumbing returns `anyhow::Result`. The variants below are the distinct
//! conditions callers and the HTTP boundary need to tell apart, so they are
//! raised as `StoreError` and recovered with `downcast_ref`.

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Entry not found: {table}/{id}")]
    NotFound { table: String, id: String },

    #[error("File not found: {table}/{id}/{file}")]
    FileNotFound {
        table: String,
        id: String,
        file: String,
    },

    #[error("Incompatible schema version: required {required}, actual {actual}")]
    IncompatibleVersion { required: u32, actual: u32 },

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Invalid identifier: {0:?}")]
    InvalidId(String),

    #[error("Client certificate required")]
    Unauthorized,

    #[error("Host {0} is not allowed to talk to this node")]
    Forbidden(String),
}

impl StoreError {
    pub fn not_found(table: &str, id: &str) -> Self {
        StoreError::NotFound {
            table: table.to_string(),
            id: id.to_string(),
        }
    }

    /// Status code used when the error crosses the `/wf/db` boundary.
    pub fn status_code(&self) -> StatusCode {
        match self {
            StoreError::NotFound { .. }
            | StoreError::FileNotFound { .. }
            | StoreError::UnknownTable(_) => StatusCode::NOT_FOUND,
            StoreError::IncompatibleVersion { .. } => StatusCode::IM_A_TEAPOT,
            StoreError::InvalidId(_) => StatusCode::BAD_REQUEST,
            StoreError::Unauthorized => StatusCode::UNAUTHORIZED,
            StoreError::Forbidden(_) => StatusCode::FORBIDDEN,
        }
    }
}

/// Returns true when `error` carries the "entry not found" signal.
pub fn is_not_found(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<StoreError>(),
        Some(StoreError::NotFound { .. })
    )
}
