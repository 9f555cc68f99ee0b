//! Process-wide bearer-token cache with single-flight refresh.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use leadenrich_shared::{AuthConfig, EnrichError, Result, env_secret};
use leadenrich_transport::TokenSource;

use crate::exchange::{Grant, TokenExchange};

/// Lifetime assumed when a grant omits `expiresIn`.
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

// ---------------------------------------------------------------------------
// Credential state
// ---------------------------------------------------------------------------

/// How the current token was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenTier {
    Override,
    Static,
    Refresh,
    Password,
}

impl TokenTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Override => "override",
            Self::Static => "static",
            Self::Refresh => "refresh",
            Self::Password => "password",
        }
    }
}

/// The cached token for one credential scope.
#[derive(Debug, Clone)]
pub struct CredentialState {
    pub token: String,
    /// `None` for static tokens, which carry no expiry of their own.
    pub expires_at: Option<DateTime<Utc>>,
    pub tier: TokenTier,
    pub cached_at: DateTime<Utc>,
    /// Set once a 401 is observed against this token.
    pub invalidated: bool,
}

impl CredentialState {
    fn is_usable(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        !self.invalidated && self.expires_at.is_none_or(|at| now + skew < at)
    }
}

/// The credential sources the broker can draw on, in resolution order.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// Caller-supplied token, used as-is on every call.
    pub override_token: Option<String>,
    pub static_token: Option<String>,
    pub refresh_token: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    /// Read the sources named in `[auth]` from the environment.
    pub fn from_env(config: &AuthConfig) -> Self {
        Self {
            override_token: None,
            static_token: env_secret(&config.static_token_env),
            refresh_token: env_secret(&config.refresh_token_env),
            username: env_secret(&config.username_env),
            password: env_secret(&config.password_env),
        }
    }
}

struct BrokerState {
    current: Option<CredentialState>,
    refresh_token: Option<String>,
    /// The static token drew a 401 and is not offered again.
    static_rejected: bool,
}

// ---------------------------------------------------------------------------
// CredentialBroker
// ---------------------------------------------------------------------------

/// Obtains and caches bearer tokens.
///
/// The state mutex is held across the whole resolution, including any
/// exchange call, so concurrent callers queue behind an in-flight refresh
/// and then find the fresh token in the cache.
pub struct CredentialBroker {
    override_token: Option<String>,
    static_token: Option<String>,
    login: Option<(String, String)>,
    exchange: Option<Arc<dyn TokenExchange>>,
    skew: Duration,
    state: Mutex<BrokerState>,
}

impl CredentialBroker {
    pub fn new(
        credentials: Credentials,
        exchange: Option<Arc<dyn TokenExchange>>,
        expiry_skew_secs: i64,
    ) -> Self {
        let login = match (credentials.username, credentials.password) {
            (Some(user), Some(pass)) => Some((user, pass)),
            _ => None,
        };
        Self {
            override_token: credentials.override_token,
            static_token: credentials.static_token,
            login,
            exchange,
            skew: Duration::seconds(expiry_skew_secs.max(0)),
            state: Mutex::new(BrokerState {
                current: None,
                refresh_token: credentials.refresh_token,
                static_rejected: false,
            }),
        }
    }

    /// Resolve a token: override, cached (unless `force_refresh`), static,
    /// refresh grant, password grant. Exchange failures fall through to the
    /// next source; only when every source is exhausted is an error returned.
    #[instrument(skip_all, fields(force_refresh = force_refresh))]
    pub async fn get_token(&self, force_refresh: bool) -> Result<String> {
        if let Some(token) = &self.override_token {
            return Ok(token.clone());
        }

        let mut state = self.state.lock().await;
        let now = Utc::now();

        if !force_refresh {
            if let Some(current) = state.current.as_ref().filter(|c| c.is_usable(now, self.skew)) {
                debug!(tier = current.tier.as_str(), "using cached token");
                return Ok(current.token.clone());
            }
        }

        if let Some(token) = self.static_token.as_ref().filter(|_| !state.static_rejected) {
            state.current = Some(CredentialState {
                token: token.clone(),
                expires_at: None,
                tier: TokenTier::Static,
                cached_at: now,
                invalidated: false,
            });
            info!(tier = TokenTier::Static.as_str(), "token resolved");
            return Ok(token.clone());
        }

        let mut last_error = None;

        if let (Some(exchange), Some(refresh_token)) = (&self.exchange, state.refresh_token.clone()) {
            match exchange.refresh(&refresh_token).await {
                Ok(grant) => return Ok(self.adopt(&mut state, grant, TokenTier::Refresh)),
                Err(e) => {
                    warn!(error = %e, "refresh grant failed; trying next credential source");
                    last_error = Some(e);
                }
            }
        }

        if let (Some(exchange), Some((user, pass))) = (&self.exchange, &self.login) {
            match exchange.password(user, pass).await {
                Ok(grant) => return Ok(self.adopt(&mut state, grant, TokenTier::Password)),
                Err(e) => {
                    warn!(error = %e, "password grant failed");
                    last_error = Some(e);
                }
            }
        }

        state.current = None;
        Err(EnrichError::authentication(match last_error {
            Some(e) => format!("every credential source failed; last error: {e}"),
            None => "no credential source is configured".to_string(),
        }))
    }

    /// Mark `token` as rejected. A no-op if the cache has already moved on
    /// to a different token.
    pub async fn invalidate(&self, token: &str) {
        let mut state = self.state.lock().await;
        if self.static_token.as_deref() == Some(token) {
            state.static_rejected = true;
        }
        if let Some(current) = state.current.as_mut().filter(|c| c.token == token) {
            current.invalidated = true;
            info!(tier = current.tier.as_str(), "cached token invalidated after 401");
        }
    }

    /// Drop the cached token.
    pub async fn clear(&self) {
        self.state.lock().await.current = None;
    }

    /// A copy of the current state, for status reporting.
    pub async fn snapshot(&self) -> Option<CredentialState> {
        self.state.lock().await.current.clone()
    }

    fn adopt(&self, state: &mut BrokerState, grant: Grant, tier: TokenTier) -> String {
        let now = Utc::now();
        let lifetime = grant.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
        let expires_at = now + Duration::seconds(lifetime);
        if let Some(rotated) = grant.refresh_token {
            debug!("refresh token rotated");
            state.refresh_token = Some(rotated);
        }
        state.current = Some(CredentialState {
            token: grant.access_token.clone(),
            expires_at: Some(expires_at),
            tier,
            cached_at: now,
            invalidated: false,
        });
        info!(tier = tier.as_str(), %expires_at, "token resolved");
        grant.access_token
    }
}

#[async_trait]
impl TokenSource for CredentialBroker {
    async fn token(&self, force_refresh: bool) -> Result<String> {
        self.get_token(force_refresh).await
    }

    async fn invalidate(&self, token: &str) {
        CredentialBroker::invalidate(self, token).await;
    }
}
