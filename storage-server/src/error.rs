//! Request error taxonomy.
//!
//! Every request handler funnels failures through [`RequestError`] so no
//! code path can leave a connection without a response. Recoverable
//! conditions (daemon refresh failures, transient peer unreachability,
//! storage-test retries) are handled locally and never reach this type.

use crate::store::StoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use common::SnodeRecord;
use thiserror::Error;

/// HTTP code 432 is unassigned; clients interpret it as "PoW rejected".
pub const STATUS_INVALID_POW: u16 = 432;

#[derive(Debug, Error)]
pub enum RequestError {
    /// Malformed or incomplete client input.
    #[error("{0}")]
    BadRequest(String),
    /// The pubkey belongs to another swarm; the body carries its members.
    #[error("client request for a different swarm")]
    WrongSwarm(Vec<SnodeRecord>),
    #[error("provided TTL is not valid")]
    InvalidTtl,
    #[error("timestamp error: check your clock")]
    InvalidTimestamp,
    /// Nonce rejected; the body carries the current difficulty.
    #[error("invalid PoW nonce")]
    InvalidPow(u64),
    #[error("{0}")]
    Unauthorized(String),
    #[error("too many requests")]
    RateLimited,
    #[error("service node is not ready: {0}")]
    NotReady(String),
    #[error("database failure")]
    Storage(#[from] StoreError),
}

impl RequestError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::WrongSwarm(_) => StatusCode::MISDIRECTED_REQUEST,
            Self::InvalidTtl => StatusCode::FORBIDDEN,
            Self::InvalidTimestamp => StatusCode::NOT_ACCEPTABLE,
            Self::InvalidPow(_) => {
                StatusCode::from_u16(STATUS_INVALID_POW).unwrap_or(StatusCode::FORBIDDEN)
            }
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Plaintext response parts, before any channel encryption is applied.
    pub fn to_parts(&self) -> (StatusCode, String, &'static str) {
        match self {
            Self::WrongSwarm(snodes) => (
                self.status(),
                crate::handlers::snodes_to_json(snodes).to_string(),
                "application/json",
            ),
            Self::InvalidPow(difficulty) => (
                self.status(),
                serde_json::json!({ "difficulty": difficulty }).to_string(),
                "application/json",
            ),
            _ => (self.status(), format!("{self}\n"), "text/plain"),
        }
    }
}

impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        let (status, body, content_type) = self.to_parts();
        (
            status,
            [(axum::http::header::CONTENT_TYPE, content_type)],
            body,
        )
            .into_response()
    }
}
