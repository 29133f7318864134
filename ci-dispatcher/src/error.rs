// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Missing/malformed environment or config file; fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variables: {0:?}")]
    MissingEnv(Vec<&'static str>),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors surfaced across the HTTP boundary, and by the record store /
/// forge client to their in-process callers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("forge error: {0}")]
    Forge(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::Forge(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            ApiError::Internal(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
