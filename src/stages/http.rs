//! Shared HTTP plumbing: client construction and failure classification.
//!
//! | failure                                   | class     |
//! |-------------------------------------------|-----------|
//! | 408, 429, 5xx                             | retryable |
//! | connect error, timeout, truncated body    | retryable |
//! | 401/403 and every other 4xx               | permanent |

use std::time::Duration;

use reqwest::{Response, StatusCode};

use super::ExecutorError;

const USER_AGENT: &str = concat!("arxiv-to-speech/", env!("CARGO_PKG_VERSION"));

/// Longest response body quoted in an error message.
const MAX_ERROR_BODY: usize = 300;

/// Client shared by one executor.  The per-step timeout is enforced by the
/// state machine; this only bounds connection setup.
pub fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Classify a non-success status.
pub fn classify_status(status: StatusCode, body: &str) -> ExecutorError {
    let body = body.trim();
    let detail = if body.is_empty() {
        String::new()
    } else {
        let cut = body
            .char_indices()
            .nth(MAX_ERROR_BODY)
            .map_or(body.len(), |(i, _)| i);
        format!(": {}", &body[..cut])
    };
    let message = format!("HTTP {}{detail}", status.as_u16());

    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            ExecutorError::retryable(message)
        }
        s if s.is_server_error() => ExecutorError::retryable(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ExecutorError::permanent(format!("authentication failed ({message})"))
        }
        _ => ExecutorError::permanent(message),
    }
}

impl From<reqwest::Error> for ExecutorError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            classify_status(status, "")
        } else if e.is_timeout() {
            ExecutorError::retryable(format!("request timed out: {e}"))
        } else if e.is_connect() {
            ExecutorError::retryable(format!("connection failed: {e}"))
        } else if e.is_builder() {
            ExecutorError::permanent(format!("invalid request: {e}"))
        } else {
            // Body read / decode failures mid-transfer.
            ExecutorError::retryable(e.to_string())
        }
    }
}

/// Pass a successful response through; turn anything else into a classified
/// error carrying (the start of) the body.
pub async fn check_response(response: Response) -> Result<Response, ExecutorError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, &body))
}

/// Attach `Authorization: Bearer …` only for a non-empty key.
pub fn with_auth(req: reqwest::RequestBuilder, api_key: Option<&str>) -> reqwest::RequestBuilder {
    match api_key {
        Some(key) if !key.is_empty() => req.bearer_auth(key),
        _ => req,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::ErrorClass;

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        for code in [408u16, 429, 500, 502, 503, 504] {
            let status = StatusCode::from_u16(code).unwrap();
            assert_eq!(classify_status(status, "").class, ErrorClass::Retryable, "{code}");
        }
    }

    #[test]
    fn client_errors_are_permanent() {
        for code in [400u16, 401, 403, 404, 413, 422] {
            let status = StatusCode::from_u16(code).unwrap();
            assert_eq!(classify_status(status, "").class, ErrorClass::Permanent, "{code}");
        }
    }

    #[test]
    fn auth_failures_are_labelled() {
        let e = classify_status(StatusCode::UNAUTHORIZED, "invalid api key");
        assert_eq!(e.message, "authentication failed (HTTP 401: invalid api key)");
    }

    #[test]
    fn long_bodies_are_clipped() {
        let body = "x".repeat(1000);
        let e = classify_status(StatusCode::BAD_REQUEST, &body);
        assert_eq!(e.message.len(), "HTTP 400: ".len() + MAX_ERROR_BODY);
    }

    #[test]
    fn build_client_does_not_panic() {
        let _client = build_client();
    }

    #[test]
    fn auth_header_only_for_non_empty_key() {
        let client = reqwest::Client::new();
        let with = with_auth(client.get("http://localhost/"), Some("sk-test"))
            .build()
            .unwrap();
        assert_eq!(
            with.headers().get("authorization").unwrap(),
            "Bearer sk-test"
        );

        let without = with_auth(client.get("http://localhost/"), Some(""))
            .build()
            .unwrap();
        assert!(without.headers().get("authorization").is_none());
    }
}
