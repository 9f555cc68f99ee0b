//! Token exchange against the token-issuing provider.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument};

use leadenrich_shared::{EnrichError, Result};
use leadenrich_transport::{Retrier, check_response, classify_send_error, read_json};

/// Label used for exchange calls in errors and logs.
const PROVIDER: &str = "token-endpoint";

/// A successful grant.
#[derive(Debug, Clone)]
pub struct Grant {
    pub access_token: String,
    pub expires_in: Option<i64>,
    /// A rotated refresh token, when the provider issues one.
    pub refresh_token: Option<String>,
}

/// The two grant types the broker can fall back through.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<Grant>;

    async fn password(&self, username: &str, password: &str) -> Result<Grant>;
}

/// Wire shape of a grant response. Field spellings vary between providers.
#[derive(Debug, Deserialize)]
struct GrantResponse {
    #[serde(default, rename = "accessToken", alias = "access_token")]
    access_token: Option<String>,
    #[serde(default, rename = "idToken", alias = "id_token")]
    id_token: Option<String>,
    #[serde(default, rename = "expiresIn", alias = "expires_in")]
    expires_in: Option<i64>,
    #[serde(default, rename = "refreshToken", alias = "refresh_token")]
    refresh_token: Option<String>,
    #[serde(default)]
    error: Option<Value>,
}

impl GrantResponse {
    fn into_grant(self) -> Result<Grant> {
        if let Some(error) = self.error.filter(|e| !e.is_null()) {
            let message = match error {
                Value::String(s) => s,
                other => other.to_string(),
            };
            return Err(EnrichError::authentication(format!("{PROVIDER}: {message}")));
        }
        let token = self
            .access_token
            .or(self.id_token)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| EnrichError::transient(format!("{PROVIDER}: response carried no token")))?;
        Ok(Grant {
            access_token: token,
            expires_in: self.expires_in,
            refresh_token: self.refresh_token.filter(|t| !t.trim().is_empty()),
        })
    }
}

/// JSON-over-HTTP token endpoint accepting `grant_type` = `refresh_token`
/// or `password`.
pub struct HttpTokenExchange {
    client: Client,
    token_url: String,
    retrier: Retrier,
}

impl HttpTokenExchange {
    pub fn new(client: Client, token_url: impl Into<String>, retrier: Retrier) -> Self {
        Self {
            client,
            token_url: token_url.into(),
            retrier,
        }
    }

    async fn grant(&self, body: Value) -> Result<Grant> {
        self.retrier
            .execute(PROVIDER, || async {
                let response = self
                    .client
                    .post(&self.token_url)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| classify_send_error(PROVIDER, e))?;
                let response = check_response(PROVIDER, response).await.map_err(as_auth_error)?;
                let parsed: GrantResponse = read_json(PROVIDER, response).await?;
                parsed.into_grant()
            })
            .await
    }
}

/// An explicit refusal from the token endpoint is an authentication failure.
fn as_auth_error(err: EnrichError) -> EnrichError {
    match err {
        EnrichError::Unauthorized { provider } => {
            EnrichError::authentication(format!("{provider} refused the credentials"))
        }
        EnrichError::Rejected { message, .. } | EnrichError::NotFound { message } => {
            EnrichError::authentication(message)
        }
        other => other,
    }
}

#[async_trait]
impl TokenExchange for HttpTokenExchange {
    #[instrument(skip_all)]
    async fn refresh(&self, refresh_token: &str) -> Result<Grant> {
        debug!("refresh-token grant");
        self.grant(json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
        }))
        .await
    }

    #[instrument(skip_all)]
    async fn password(&self, username: &str, password: &str) -> Result<Grant> {
        debug!("password grant");
        self.grant(json!({
            "grant_type": "password",
            "username": username,
            "password": password,
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use leadenrich_transport::{RetryPolicy, build_client};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn exchange(server: &MockServer) -> HttpTokenExchange {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            call_timeout: Some(Duration::from_secs(2)),
        };
        HttpTokenExchange::new(
            build_client(Duration::from_secs(2)).expect("client"),
            format!("{}/token", server.uri()),
            Retrier::with_seed(policy, 1),
        )
    }

    #[tokio::test]
    async fn parses_camel_case_grant() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_partial_json(json!({"grant_type": "refresh_token"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "idToken": "id-abc",
                "expiresIn": 3600,
                "refreshToken": "rotated"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let grant = exchange(&server).refresh("r-1").await.expect("grant");
        assert_eq!(grant.access_token, "id-abc");
        assert_eq!(grant.expires_in, Some(3600));
        assert_eq!(grant.refresh_token.as_deref(), Some("rotated"));
    }

    #[tokio::test]
    async fn explicit_error_payload_is_authentication_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_grant"})))
            .expect(1)
            .mount(&server)
            .await;

        let err = exchange(&server).refresh("stale").await.unwrap_err();
        assert!(matches!(err, EnrichError::Authentication { .. }));
        assert!(err.to_string().contains("invalid_grant"));
    }

    #[tokio::test]
    async fn malformed_grant_is_retried_then_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"unexpected": true})))
            .expect(2)
            .mount(&server)
            .await;

        let err = exchange(&server).password("u", "p").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
