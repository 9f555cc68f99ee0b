//! Bearer-token acquisition for authenticated lookup providers.
//!
//! [`CredentialBroker`] is constructed once per process and shared (behind
//! an `Arc`) by every phase that needs a token. It implements
//! [`TokenSource`](leadenrich_transport::TokenSource), so the Retrier can
//! drive the invalidate-and-reauth-once flow on a 401.

mod broker;
mod exchange;

use std::sync::Arc;

use reqwest::Client;

use leadenrich_shared::AppConfig;
use leadenrich_transport::Retrier;

pub use broker::{CredentialBroker, CredentialState, Credentials, TokenTier};
pub use exchange::{Grant, HttpTokenExchange, TokenExchange};

/// Build the broker described by `[auth]`, reading credentials from the
/// configured environment variables. `override_token`, when given, is used
/// as-is for every call.
pub fn broker_from_config(
    config: &AppConfig,
    override_token: Option<String>,
    client: Client,
    retrier: Retrier,
) -> CredentialBroker {
    let mut credentials = Credentials::from_env(&config.auth);
    credentials.override_token = override_token;
    let exchange = config.auth.token_url.as_ref().map(|url| {
        Arc::new(HttpTokenExchange::new(client, url.clone(), retrier)) as Arc<dyn TokenExchange>
    });
    CredentialBroker::new(
        credentials,
        exchange,
        config.auth.expiry_skew_secs,
    )
}
