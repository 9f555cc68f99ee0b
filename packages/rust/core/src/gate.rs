//! Batch-level rate-limit gate.
//!
//! A 429 is never retried per call. Instead the pipeline reports it here and
//! every paid call (and every not-yet-scheduled record) waits until the
//! provider's retry-after hint has elapsed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::info;

/// Pause applied when a 429 carries no usable retry-after hint.
pub const DEFAULT_RATE_LIMIT_PAUSE: Duration = Duration::from_secs(30);

/// Parse a `Retry-After` value: delta-seconds or an HTTP-date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

/// Shared pause deadline. Clones share state.
#[derive(Clone)]
pub struct RateLimitGate {
    until: Arc<Mutex<Option<Instant>>>,
    default_pause: Duration,
}

impl Default for RateLimitGate {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_LIMIT_PAUSE)
    }
}

impl RateLimitGate {
    pub fn new(default_pause: Duration) -> Self {
        Self {
            until: Arc::new(Mutex::new(None)),
            default_pause,
        }
    }

    fn deadline(&self) -> Option<Instant> {
        match self.until.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Record a 429. Extends the pause; never shortens it. Returns the pause
    /// derived from `retry_after`.
    pub fn observe(&self, provider: &str, retry_after: Option<&str>) -> Duration {
        let pause = retry_after
            .and_then(|v| parse_retry_after(v, Utc::now()))
            .unwrap_or(self.default_pause);
        let deadline = Instant::now() + pause;
        let mut guard = match self.until.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.is_none_or(|current| current < deadline) {
            *guard = Some(deadline);
        }
        info!(%provider, pause_ms = pause.as_millis() as u64, "rate limited; pausing paid calls");
        pause
    }

    /// Time left before calls may resume.
    pub fn remaining(&self) -> Duration {
        self.deadline()
            .map(|d| d.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    /// Wait until no pause is in effect.
    pub async fn wait(&self) {
        while let Some(deadline) = self.deadline() {
            if deadline <= Instant::now() {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_seconds_and_http_dates() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 27, 0).unwrap();
        assert_eq!(parse_retry_after("120", now), Some(Duration::from_secs(120)));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT", now),
            Some(Duration::from_secs(60))
        );
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:00:00 GMT", now),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn missing_hint_uses_default_pause() {
        let gate = RateLimitGate::new(Duration::from_secs(30));
        assert_eq!(gate.observe("tracer", None), Duration::from_secs(30));
        assert!(gate.remaining() > Duration::from_secs(25));
    }

    #[test]
    fn shorter_hint_never_shortens_pause() {
        let gate = RateLimitGate::default();
        gate.observe("tracer", Some("60"));
        gate.observe("tracer", Some("1"));
        assert!(gate.remaining() > Duration::from_secs(50));
    }

    #[tokio::test]
    async fn wait_blocks_until_pause_elapses() {
        let gate = RateLimitGate::new(Duration::from_millis(60));
        gate.observe("tracer", None);
        let started = std::time::Instant::now();
        gate.wait().await;
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(gate.remaining(), Duration::ZERO);
    }
}
