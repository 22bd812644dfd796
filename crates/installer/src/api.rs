//! Shared error type and response handling for the HTTP API clients
//! (Civo DNS, GitLab, Vault).

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::warn;

/// Errors that can occur talking to a remote HTTP API.
#[derive(Error, Debug)]
pub enum ApiError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ApiError {
    /// Whether the same request may succeed later: transport failures,
    /// throttling and server errors.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            Self::NotFound(_) | Self::Serialization(_) => false,
        }
    }
}

/// Decode a JSON body on success, otherwise map the status to an [`ApiError`].
pub(crate) async fn handle_response<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ApiError> {
    let status = response.status();
    let text = response.text().await?;

    if status.is_success() {
        serde_json::from_str(&text).map_err(|e| {
            warn!(error = %e, body = %text, "Failed to parse response");
            ApiError::Serialization(e)
        })
    } else if status == StatusCode::NOT_FOUND {
        Err(ApiError::NotFound(text))
    } else {
        Err(ApiError::Api {
            status: status.as_u16(),
            message: text,
        })
    }
}

/// Like [`handle_response`] for endpoints whose body is not needed.
pub(crate) async fn expect_success(response: reqwest::Response) -> Result<(), ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let text = response.text().await.unwrap_or_default();
    if status == StatusCode::NOT_FOUND {
        Err(ApiError::NotFound(text))
    } else {
        Err(ApiError::Api {
            status: status.as_u16(),
            message: text,
        })
    }
}
