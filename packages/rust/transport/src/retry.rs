//! Bounded retry with exponential backoff and jitter.
//!
//! Per outbound call:
//!
//! ```text
//! PENDING --success--------------------------> DONE
//! PENDING --transient, attempts left---------> PENDING
//! PENDING --transient, exhausted-------------> FAILED
//! PENDING --429------------------------------> RATE_LIMITED   (terminal, hint returned)
//! PENDING --401--> REAUTH_PENDING --fresh token--> PENDING (once) --> DONE | FAILED
//! ```
//!
//! Nothing outside this module loops on a failed call.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use leadenrich_shared::{AppConfig, EnrichError, Result};

/// Largest shift applied to the base delay.
const MAX_BACKOFF_EXPONENT: u32 = 10;

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Retry policy for one class of outbound call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Each attempt is abandoned (and classified transient) after this long.
    pub call_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for RetryPolicy {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_attempts: config.retry.max_attempts.max(1),
            base_delay: Duration::from_millis(config.retry.base_delay_ms),
            max_delay: Duration::from_millis(config.retry.max_delay_ms),
            call_timeout: Some(Duration::from_secs(config.defaults.call_timeout_secs.max(1))),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`, given `jitter` in `[0, 1)`.
    fn backoff(&self, attempt: u32, jitter: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        let base = self.base_delay.saturating_mul(1u32 << exponent);
        (base + base.mul_f64(jitter)).min(self.max_delay)
    }
}

// ---------------------------------------------------------------------------
// Call state
// ---------------------------------------------------------------------------

/// Where an outbound call stands; logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Pending,
    Done,
    Failed,
    RateLimited,
    ReauthPending,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::RateLimited => "rate_limited",
            Self::ReauthPending => "reauth_pending",
        }
    }

    fn after(result: &Result<impl Sized>) -> Self {
        match result {
            Ok(_) => Self::Done,
            Err(EnrichError::RateLimited { .. }) => Self::RateLimited,
            Err(EnrichError::Unauthorized { .. }) => Self::ReauthPending,
            Err(_) => Self::Failed,
        }
    }
}

// ---------------------------------------------------------------------------
// Token seam
// ---------------------------------------------------------------------------

/// Supplies bearer tokens to authenticated calls.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// A usable token. `force_refresh` bypasses any cached value.
    async fn token(&self, force_refresh: bool) -> Result<String>;

    /// Record that `token` was rejected with a 401. A no-op if the cached
    /// token has already moved on.
    async fn invalidate(&self, token: &str);
}

// ---------------------------------------------------------------------------
// Retrier
// ---------------------------------------------------------------------------

/// Executes outbound calls under a [`RetryPolicy`].
#[derive(Clone)]
pub struct Retrier {
    policy: RetryPolicy,
    rng: Arc<Mutex<StdRng>>,
}

impl Retrier {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            rng: Arc::new(Mutex::new(StdRng::from_entropy())),
        }
    }

    /// Deterministic jitter, for tests.
    pub fn with_seed(policy: RetryPolicy, seed: u64) -> Self {
        Self {
            policy,
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `call` until it succeeds, fails non-transiently, or the attempt
    /// budget is spent. 429 and 401 come back on the first occurrence.
    pub async fn execute<T, F, Fut>(&self, label: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            debug!(label, attempt, state = CallState::Pending.as_str(), "outbound call");

            let result = match self.policy.call_timeout {
                Some(limit) => match tokio::time::timeout(limit, call()).await {
                    Ok(result) => result,
                    Err(_) => Err(EnrichError::transient(format!(
                        "{label}: timed out after {}ms",
                        limit.as_millis()
                    ))),
                },
                None => call().await,
            };

            match result {
                Err(err) if err.is_retryable() && attempt < self.policy.max_attempts => {
                    let delay = self.next_delay(attempt);
                    warn!(
                        label,
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "transient failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                result => {
                    let state = CallState::after(&result);
                    debug!(label, attempt, state = state.as_str(), "outbound call settled");
                    return result;
                }
            }
        }
    }

    /// Like [`execute`](Self::execute), but `call` receives a bearer token.
    ///
    /// A 401 invalidates the token and the call is re-run once with a fresh
    /// one. A second 401 is terminal.
    pub async fn execute_authenticated<T, F, Fut>(
        &self,
        label: &str,
        tokens: &dyn TokenSource,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let token = tokens.token(false).await?;
        let first = self.execute(label, || call(token.clone())).await;

        let provider = match first {
            Err(EnrichError::Unauthorized { provider }) => provider,
            other => return other,
        };

        debug!(label, %provider, state = CallState::ReauthPending.as_str(), "401 observed; reauthenticating");
        tokens.invalidate(&token).await;
        let fresh = tokens.token(false).await?;

        match self.execute(label, || call(fresh.clone())).await {
            Err(EnrichError::Unauthorized { provider }) => {
                tokens.invalidate(&fresh).await;
                warn!(label, %provider, "401 after reauthentication");
                Err(EnrichError::authentication(format!(
                    "{provider} rejected a freshly issued token"
                )))
            }
            other => other,
        }
    }

    fn next_delay(&self, attempt: u32) -> Duration {
        let jitter = match self.rng.lock() {
            Ok(mut rng) => rng.gen_range(0.0..1.0),
            Err(_) => 0.5,
        };
        self.policy.backoff(attempt, jitter)
    }
}
