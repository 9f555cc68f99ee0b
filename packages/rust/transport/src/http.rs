//! HTTP client construction and response classification.
//!
//! Every provider response goes through [`check_response`], which maps the
//! status line onto the [`EnrichError`] taxonomy the [`Retrier`](crate::Retrier)
//! understands.

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use leadenrich_shared::{EnrichError, Result};

/// User-Agent string for outbound requests.
pub const USER_AGENT: &str = concat!("leadenrich/", env!("CARGO_PKG_VERSION"));

/// Maximum number of redirects to follow.
const MAX_REDIRECTS: usize = 3;

/// Longest provider error message kept in a diagnostic trail.
const MAX_ERROR_MESSAGE: usize = 300;

/// Build a reqwest client with the standard user agent and a request timeout.
pub fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .timeout(timeout)
        .build()
        .map_err(|e| EnrichError::Network(format!("failed to build HTTP client: {e}")))
}

/// Classify a transport-level failure. Timeouts are transient; everything
/// else (refused connection, DNS, TLS) is a network error.
pub fn classify_send_error(provider: &str, err: reqwest::Error) -> EnrichError {
    if err.is_timeout() {
        EnrichError::transient(format!("{provider}: request timed out"))
    } else {
        EnrichError::Network(format!("{provider}: {err}"))
    }
}

/// Pass 2xx responses through; map everything else to an error.
///
/// | status | error |
/// |---|---|
/// | 429 | `RateLimited`, `Retry-After` header carried verbatim |
/// | 401 | `Unauthorized` |
/// | 404 | `NotFound` |
/// | 408, 5xx | `Transient` |
/// | other 4xx | `Rejected`, message from the JSON `error` field |
pub async fn check_response(provider: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    debug!(provider, status = status.as_u16(), "non-success response");

    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            Err(EnrichError::RateLimited {
                provider: provider.to_string(),
                retry_after,
            })
        }
        StatusCode::UNAUTHORIZED => Err(EnrichError::Unauthorized {
            provider: provider.to_string(),
        }),
        StatusCode::NOT_FOUND => {
            let message = error_message(response).await;
            Err(EnrichError::not_found(format!(
                "{provider}: {}",
                message.unwrap_or_else(|| "no match".into())
            )))
        }
        s if s.is_server_error() || s == StatusCode::REQUEST_TIMEOUT => {
            Err(EnrichError::Transient {
                message: format!("{provider}: HTTP {s}"),
                status: Some(s.as_u16()),
            })
        }
        s => {
            let message = error_message(response).await;
            Err(EnrichError::Rejected {
                status: s.as_u16(),
                message: format!(
                    "{provider}: {}",
                    message.unwrap_or_else(|| s.canonical_reason().unwrap_or("error").into())
                ),
            })
        }
    }
}

/// Decode a JSON body. A body that does not parse is an ambiguous payload,
/// which is transient.
pub async fn read_json<T: DeserializeOwned>(provider: &str, response: Response) -> Result<T> {
    let body = response
        .text()
        .await
        .map_err(|e| EnrichError::transient(format!("{provider}: failed to read body: {e}")))?;
    serde_json::from_str(&body)
        .map_err(|e| EnrichError::transient(format!("{provider}: malformed response: {e}")))
}

/// The provider's error text from a JSON body (`error`, `message`, or
/// `error.message`), if there is one.
async fn error_message(response: Response) -> Option<String> {
    let body = response.text().await.ok()?;
    let value: Value = serde_json::from_str(&body).ok()?;
    let text = match value.get("error") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Object(obj)) => obj.get("message").and_then(Value::as_str).map(String::from),
        _ => value.get("message").and_then(Value::as_str).map(String::from),
    }?;
    Some(text.chars().take(MAX_ERROR_MESSAGE).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn classify(template: ResponseTemplate) -> Result<Response> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/lookup"))
            .respond_with(template)
            .mount(&server)
            .await;

        let client = build_client(Duration::from_secs(5)).expect("client");
        let response = client
            .get(format!("{}/lookup", server.uri()))
            .send()
            .await
            .expect("send");
        check_response("carrier", response).await
    }

    #[tokio::test]
    async fn success_passes_through() {
        let response = classify(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .await
            .expect("2xx");
        let body: Value = read_json("carrier", response).await.expect("json");
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn rate_limit_keeps_retry_after_verbatim() {
        let err = classify(
            ResponseTemplate::new(429).insert_header("Retry-After", "Wed, 21 Oct 2026 07:28:00 GMT"),
        )
        .await
        .unwrap_err();
        assert_eq!(err.retry_after(), Some("Wed, 21 Oct 2026 07:28:00 GMT"));
    }

    #[tokio::test]
    async fn unauthorized_is_distinct_from_authentication() {
        let err = classify(ResponseTemplate::new(401)).await.unwrap_err();
        assert!(matches!(err, EnrichError::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let err = classify(ResponseTemplate::new(503)).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, EnrichError::Transient { status: Some(503), .. }));
    }

    #[tokio::test]
    async fn client_errors_carry_provider_message() {
        let err = classify(
            ResponseTemplate::new(400).set_body_json(serde_json::json!({"error": "phone is malformed"})),
        )
        .await
        .unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("phone is malformed"));
    }

    #[tokio::test]
    async fn not_found_is_reported() {
        let err = classify(ResponseTemplate::new(404)).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn malformed_body_is_transient() {
        let response = classify(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .await
            .expect("2xx");
        let err = read_json::<Value>("carrier", response).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn refused_connection_is_network_error() {
        let client = build_client(Duration::from_secs(2)).expect("client");
        let err = client
            .get("http://127.0.0.1:1/unreachable")
            .send()
            .await
            .map_err(|e| classify_send_error("carrier", e))
            .unwrap_err();
        assert_eq!(err.kind(), "network");
    }
}
