//! Outbound dispatch client.
//!
//! Forwards requests to a remote dispatcher with a fixed per-request timeout
//! and a bounded attempt count. Transient faults (connection refused,
//! timeout) are retried; everything else converts to a structured
//! [`ClientError`] immediately, so a slow or unavailable dispatcher degrades
//! the caller gracefully instead of cascading failures.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// Classification of an outbound failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientErrorKind {
    /// The connection could not be established. Retryable.
    ConnectionError,
    /// The request timed out. Retryable.
    TimeoutError,
    /// The request was sent but failed (HTTP error status, bad payload).
    RequestError,
    /// Anything unclassified.
    UnknownError,
}

impl ClientErrorKind {
    /// True for fault classes worth another attempt.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::ConnectionError | Self::TimeoutError)
    }

    /// Returns the stable token for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionError => "CONNECTION_ERROR",
            Self::TimeoutError => "TIMEOUT_ERROR",
            Self::RequestError => "REQUEST_ERROR",
            Self::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

/// A structured outbound failure. Returned, never panicked.
#[derive(Debug, Clone, Error)]
#[error("{} after {attempts} attempt(s): {message}", kind.as_str())]
pub struct ClientError {
    /// Fault classification.
    pub kind: ClientErrorKind,
    /// Description.
    pub message: String,
    /// Attempts made before giving up.
    pub attempts: u32,
}

/// Pause between retry attempts. Fixed, not exponential: the retry budget is
/// small and the caller is synchronous.
const RETRY_PAUSE: Duration = Duration::from_millis(250);

/// Client for a remote cad-bridge dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchClient {
    http: reqwest::Client,
    base_url: String,
    max_attempts: u32,
}

impl DispatchClient {
    /// Creates a client for `base_url` with a fixed per-request timeout and
    /// attempt budget (`max_attempts` includes the first try).
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`] if the underlying HTTP client cannot be
    /// constructed.
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        max_attempts: u32,
    ) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError {
                kind: ClientErrorKind::UnknownError,
                message: format!("failed to build HTTP client: {e}"),
                attempts: 0,
            })?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_attempts: max_attempts.max(1),
        })
    }

    /// Sends `data` to `endpoint` with `method`, retrying transient faults
    /// up to the attempt budget.
    ///
    /// # Errors
    ///
    /// Returns a structured [`ClientError`]; never panics on transport
    /// faults.
    pub async fn send(
        &self,
        endpoint: &str,
        data: &Value,
        method: &str,
    ) -> Result<Value, ClientError> {
        let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| ClientError {
                kind: ClientErrorKind::RequestError,
                message: format!("invalid HTTP method '{method}'"),
                attempts: 0,
            })?;
        let url = format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'));

        let mut attempts = 0;
        loop {
            attempts += 1;

            match self.attempt(&method, &url, data).await {
                Ok(value) => {
                    if attempts > 1 {
                        tracing::debug!(url, attempts, "Outbound request succeeded after retry");
                    }
                    return Ok(value);
                }
                Err((kind, message)) => {
                    if kind.is_retryable() && attempts < self.max_attempts {
                        tracing::debug!(
                            url,
                            attempt = attempts,
                            kind = kind.as_str(),
                            "Retrying outbound request"
                        );
                        tokio::time::sleep(RETRY_PAUSE).await;
                        continue;
                    }
                    return Err(ClientError {
                        kind,
                        message,
                        attempts,
                    });
                }
            }
        }
    }

    async fn attempt(
        &self,
        method: &reqwest::Method,
        url: &str,
        data: &Value,
    ) -> Result<Value, (ClientErrorKind, String)> {
        let response = self
            .http
            .request(method.clone(), url)
            .json(data)
            .send()
            .await
            .map_err(|e| (classify(&e), e.to_string()))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| (ClientErrorKind::RequestError, format!("invalid response body: {e}")))?;

        if status.is_success() {
            Ok(body)
        } else {
            Err((
                ClientErrorKind::RequestError,
                format!("dispatcher returned {status}: {body}"),
            ))
        }
    }
}

/// Maps a transport error onto the retry taxonomy.
fn classify(error: &reqwest::Error) -> ClientErrorKind {
    if error.is_timeout() {
        ClientErrorKind::TimeoutError
    } else if error.is_connect() {
        ClientErrorKind::ConnectionError
    } else if error.is_request() || error.is_decode() || error.is_status() {
        ClientErrorKind::RequestError
    } else {
        ClientErrorKind::UnknownError
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn retryable_classes() {
        assert!(ClientErrorKind::ConnectionError.is_retryable());
        assert!(ClientErrorKind::TimeoutError.is_retryable());
        assert!(!ClientErrorKind::RequestError.is_retryable());
        assert!(!ClientErrorKind::UnknownError.is_retryable());
    }

    #[test]
    fn error_display_includes_kind_and_attempts() {
        let error = ClientError {
            kind: ClientErrorKind::TimeoutError,
            message: "deadline exceeded".to_string(),
            attempts: 3,
        };
        let text = error.to_string();
        assert!(text.contains("TIMEOUT_ERROR"));
        assert!(text.contains('3'));
    }

    #[tokio::test]
    async fn invalid_method_is_request_error_without_attempts() {
        let client =
            DispatchClient::new("http://127.0.0.1:1", Duration::from_millis(100), 3).unwrap();
        let err = client
            .send("/op", &json!({}), "NOT A METHOD")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ClientErrorKind::RequestError);
        assert_eq!(err.attempts, 0);
    }

    #[tokio::test]
    async fn connection_refused_exhausts_attempts() {
        // Port 1 on localhost is essentially guaranteed closed.
        let client =
            DispatchClient::new("http://127.0.0.1:1", Duration::from_millis(200), 2).unwrap();
        let err = client.send("/op", &json!({}), "POST").await.unwrap_err();
        assert_eq!(err.kind, ClientErrorKind::ConnectionError);
        assert_eq!(err.attempts, 2);
    }
}
