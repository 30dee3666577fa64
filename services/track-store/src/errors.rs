//!
//! src/errors.rs
//!
//! Defines the service error enum, conversions from the libraries
//! we call into, and how each error is rendered as an http response
//!
//!

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("config error: {0}")]
    Config(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("catalog error: {0}")]
    Catalog(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("rate limited: retry {0:?}")]
    RateLimited(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("db error: {0}")]
    Db(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error)
}

impl ServiceError {
    /// Validation is the caller's fault, NotFound is a miss,
    /// anything else is ours or upstream's
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_)   => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.to_string() });
        (self.status(), Json(body)).into_response()
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(e: reqwest::Error) -> Self { ServiceError::Http(e.to_string()) }
}

impl From<serde_json::Error> for ServiceError {
    fn from(e: serde_json::Error) -> Self { ServiceError::Parse(e.to_string()) }
}

impl From<sqlx::Error> for ServiceError {
    fn from(e: sqlx::Error) -> Self { ServiceError::Db(e.to_string()) }
}

impl From<url::ParseError> for ServiceError {
    fn from(e: url::ParseError) -> Self { ServiceError::Config(e.to_string()) }
}
