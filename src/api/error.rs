// Error types for the dashboard API client.
// Distinguishes session, server and transport failures so the sync engine can
// tell what is worth retrying.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
  #[error("Request failed: {0}")]
  Network(#[from] reqwest::Error),

  #[error("Session invalid: the API answered 401")]
  Unauthorized,

  #[error("API returned {status}: {body}")]
  Status { status: u16, body: String },

  #[error("Invalid JSON in response: {0}")]
  Decode(#[from] serde_json::Error),

  #[error("Invalid endpoint '{endpoint}': {source}")]
  Endpoint {
    endpoint: String,
    source: url::ParseError,
  },
}

impl ApiError {
  /// Whether trying again later could succeed.
  ///
  /// Transport errors, timeouts, throttling and 5xx are transient; a 401 or a
  /// rejected payload will fail the same way every time.
  pub fn is_transient(&self) -> bool {
    match self {
      ApiError::Network(_) => true,
      ApiError::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
      ApiError::Unauthorized | ApiError::Decode(_) | ApiError::Endpoint { .. } => false,
    }
  }
}

pub type Result<T> = std::result::Result<T, ApiError>;
