//! Error types for the outbox engine.

use thiserror::Error;

/// Failure of a single remote mutation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
  /// The call could not complete (network, timeout, overloaded server).
  #[error("transient remote failure: {0}")]
  Transient(String),

  /// The remote store refused the mutation (validation, permissions).
  #[error("rejected by remote: {0}")]
  Rejected(String),
}

impl RemoteError {
  pub fn transient(message: impl Into<String>) -> Self {
    Self::Transient(message.into())
  }

  pub fn rejected(message: impl Into<String>) -> Self {
    Self::Rejected(message.into())
  }

  /// Returns true if retrying the same call may succeed.
  pub fn is_retryable(&self) -> bool {
    matches!(self, RemoteError::Transient(_))
  }

  /// Classify an HTTP status returned by the remote store.
  pub fn from_status(status: u16, body: &str) -> Self {
    let message = if body.is_empty() {
      format!("HTTP {}", status)
    } else {
      format!("HTTP {}: {}", status, body)
    };

    match status {
      408 | 429 | 500..=599 => Self::Transient(message),
      _ => Self::Rejected(message),
    }
  }
}

impl From<reqwest::Error> for RemoteError {
  fn from(err: reqwest::Error) -> Self {
    match err.status() {
      Some(status) => Self::from_status(status.as_u16(), ""),
      None => Self::Transient(err.to_string()),
    }
  }
}

/// Failure of the local persistence layer.
///
/// Any of these means a queued mutation may not be durable, so callers must
/// surface it instead of swallowing it.
#[derive(Error, Debug)]
pub enum StoreError {
  #[error("storage backend error: {0}")]
  Backend(String),

  #[error("failed to (de)serialize record '{record}': {source}")]
  Serialization {
    record: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("record '{record}' in scope '{scope}' is corrupted (checksum mismatch)")]
  Corrupted { scope: String, record: String },

  #[error("store lock poisoned")]
  LockPoisoned,

  #[error("no dead letter with id {0}")]
  UnknownDeadLetter(uuid::Uuid),
}

impl From<rusqlite::Error> for StoreError {
  fn from(err: rusqlite::Error) -> Self {
    Self::Backend(err.to_string())
  }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_status_classification() {
    assert!(RemoteError::from_status(503, "").is_retryable());
    assert!(RemoteError::from_status(429, "slow down").is_retryable());
    assert!(RemoteError::from_status(408, "").is_retryable());
    assert!(!RemoteError::from_status(400, "bad payload").is_retryable());
    assert!(!RemoteError::from_status(403, "").is_retryable());
    assert!(!RemoteError::from_status(409, "duplicate key").is_retryable());
  }

  #[test]
  fn test_status_message_includes_body() {
    let err = RemoteError::from_status(422, "name is required");
    assert_eq!(
      err.to_string(),
      "rejected by remote: HTTP 422: name is required"
    );
  }
}
