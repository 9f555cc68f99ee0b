//! Free-text location → provider id resolution.
//!
//! Tiers, each consulted only when the previous one missed:
//!
//! 1. built-in table ([`static_table`]), no I/O
//! 2. persistent cache ([`LocationCache`]), keyed by lowercase-trimmed text
//! 3. discovery ([`LocationDiscovery`]), written back to the cache
//! 4. state-level fallback: tiers 1-3 on the broader administrative unit
//! 5. `failed`: the caller degrades to keyword search plus
//!    [`retain_matching_location`]
//!
//! Failed lookups are cached as negative entries with a short TTL.

mod cache;
mod discovery;
mod filter;
pub mod static_table;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use leadenrich_shared::normalize::{normalize_state, state_name};
use leadenrich_shared::{LocationCacheEntry, LocationTier, ResolverSettings};

pub use cache::{InMemoryLocationCache, LocationCache};
pub use discovery::{Discovered, HttpDiscovery, LocationDiscovery, normalize_suggestion};
pub use filter::{location_matches, retain_matching_location};

/// Trailing segments treated as a country and stripped in tier 4.
const COUNTRY_SUFFIXES: [&str; 4] = ["united states", "united states of america", "usa", "us"];

/// Outcome of one resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// The text that was asked for, as given.
    pub query: String,
    pub id: Option<String>,
    pub full_id: Option<String>,
    pub tier: LocationTier,
}

impl Resolution {
    fn failed(query: &str) -> Self {
        Self {
            query: query.to_string(),
            id: None,
            full_id: None,
            tier: LocationTier::Failed,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.tier == LocationTier::Failed
    }
}

/// Lowercase, trim, and collapse internal whitespace.
pub fn normalize_key(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Broader forms of `key` for tier 4, most specific first: the text without
/// a trailing country, then the state segment, then the spelled-out state.
fn broader_candidates(key: &str) -> Vec<String> {
    let mut segments: Vec<&str> = key.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
    let original_len = segments.len();
    while segments.len() > 1 && segments.last().is_some_and(|s| COUNTRY_SUFFIXES.contains(s)) {
        segments.pop();
    }

    let mut out = Vec::new();
    if segments.len() < original_len {
        out.push(segments.join(", "));
    }
    if segments.len() > 1 {
        if let Some(state) = segments.last() {
            out.push((*state).to_string());
        }
    }
    if let Some(state) = segments.last() {
        if let Some(name) = normalize_state(state).as_deref().and_then(state_name) {
            out.push(name.to_string());
        }
    }

    out.retain(|c| c != key);
    out.dedup();
    out
}

// ---------------------------------------------------------------------------
// Batch scope
// ---------------------------------------------------------------------------

/// In-flight resolutions for one processing batch.
///
/// Concurrent [`LocationResolver::resolve_in`] calls for the same text share
/// one resolution. Drop the batch when processing finishes.
#[derive(Default)]
pub struct ResolveBatch {
    inflight: Mutex<HashMap<String, Arc<OnceCell<Resolution>>>>,
}

impl ResolveBatch {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, key: &str) -> Arc<OnceCell<Resolution>> {
        let mut map = match self.inflight.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(map.entry(key.to_string()).or_default())
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

enum TierOutcome {
    Hit(Resolution),
    /// A live negative cache entry.
    KnownMiss,
    Miss { errored: bool },
}

/// Tiered location resolver.
pub struct LocationResolver {
    cache: Arc<dyn LocationCache>,
    discovery: Option<Arc<dyn LocationDiscovery>>,
    settings: ResolverSettings,
}

impl LocationResolver {
    pub fn new(
        cache: Arc<dyn LocationCache>,
        discovery: Option<Arc<dyn LocationDiscovery>>,
        settings: ResolverSettings,
    ) -> Self {
        Self {
            cache,
            discovery,
            settings,
        }
    }

    /// Resolve within `batch`, sharing any identical in-flight resolution.
    pub async fn resolve_in(&self, batch: &ResolveBatch, text: &str) -> Resolution {
        let cell = batch.cell(&normalize_key(text));
        cell.get_or_init(|| self.resolve(text)).await.clone()
    }

    /// Run the full cascade for `text`. Never errors: anything that cannot be
    /// resolved comes back with tier `failed`.
    #[instrument(skip_all, fields(text = %text))]
    pub async fn resolve(&self, text: &str) -> Resolution {
        let key = normalize_key(text);
        if key.is_empty() {
            return Resolution::failed(text);
        }

        let mut errored = false;
        match self.try_tiers(text, &key).await {
            TierOutcome::Hit(resolution) => return resolution,
            TierOutcome::KnownMiss => {
                debug!("negative cache hit");
                return Resolution::failed(text);
            }
            TierOutcome::Miss { errored: e } => errored |= e,
        }

        for broader in broader_candidates(&key) {
            match self.try_tiers(text, &broader).await {
                TierOutcome::Hit(found) => {
                    let resolution = Resolution {
                        tier: LocationTier::StateFallback,
                        ..found
                    };
                    self.write(&key, &resolution).await;
                    info!(%broader, id = ?resolution.id, "resolved via state fallback");
                    return resolution;
                }
                TierOutcome::KnownMiss => {}
                TierOutcome::Miss { errored: e } => errored |= e,
            }
        }

        // A discovery error says nothing about the text, so it is not cached.
        if !errored {
            self.write(&key, &Resolution::failed(text)).await;
        }
        warn!("location unresolved");
        Resolution::failed(text)
    }

    async fn try_tiers(&self, query: &str, key: &str) -> TierOutcome {
        if let Some(id) = static_table::lookup(key) {
            let resolution = Resolution {
                query: query.to_string(),
                id: Some(id.to_string()),
                full_id: Some(id.to_string()),
                tier: LocationTier::Static,
            };
            if key == normalize_key(query) {
                self.write(key, &resolution).await;
            }
            return TierOutcome::Hit(resolution);
        }

        match self.cache.get(key).await {
            Ok(Some(entry)) if !entry.is_expired(Utc::now()) => {
                if entry.is_negative() {
                    return TierOutcome::KnownMiss;
                }
                return TierOutcome::Hit(Resolution {
                    query: query.to_string(),
                    id: entry.id,
                    full_id: entry.full_id,
                    tier: LocationTier::Cache,
                });
            }
            Ok(_) => {}
            Err(e) => warn!(%key, error = %e, "location cache read failed"),
        }

        let Some(discovery) = &self.discovery else {
            return TierOutcome::Miss { errored: false };
        };
        match discovery.discover(key).await {
            Ok(Some(found)) => {
                let resolution = Resolution {
                    query: query.to_string(),
                    id: Some(found.id),
                    full_id: Some(found.full_id),
                    tier: LocationTier::Discovered,
                };
                self.write(key, &resolution).await;
                TierOutcome::Hit(resolution)
            }
            Ok(None) => TierOutcome::Miss { errored: false },
            Err(e) => {
                warn!(%key, error = %e, "location discovery failed");
                TierOutcome::Miss { errored: true }
            }
        }
    }

    async fn write(&self, key: &str, resolution: &Resolution) {
        let ttl = if resolution.is_failed() {
            self.settings.negative_ttl
        } else {
            self.settings.positive_ttl
        };
        let entry = LocationCacheEntry {
            key: key.to_string(),
            id: resolution.id.clone(),
            full_id: resolution.full_id.clone(),
            tier: resolution.tier,
            created_at: Utc::now(),
            ttl_secs: ttl.as_secs() as i64,
        };
        if let Err(e) = self.cache.put(&entry).await {
            warn!(%key, error = %e, "location cache write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use leadenrich_shared::Result;
    use leadenrich_storage::Storage;
    use leadenrich_transport::{Retrier, RetryPolicy, build_client};
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Discovery double that knows a fixed set of texts and counts calls.
    struct FakeDiscovery {
        known: HashMap<String, String>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl FakeDiscovery {
        fn new(known: &[(&str, &str)]) -> Self {
            Self {
                known: known.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl LocationDiscovery for FakeDiscovery {
        async fn discover(&self, text: &str) -> Result<Option<Discovered>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(self.known.get(text).map(|id| Discovered {
                id: id.clone(),
                full_id: format!("urn:li:geo:{id}"),
            }))
        }
    }

    fn resolver_with(
        cache: Arc<dyn LocationCache>,
        discovery: Option<Arc<dyn LocationDiscovery>>,
    ) -> LocationResolver {
        LocationResolver::new(cache, discovery, ResolverSettings::default())
    }

    #[test]
    fn key_normalization() {
        assert_eq!(normalize_key("  Denver,   CO "), "denver, co");
    }

    #[test]
    fn broader_candidates_strip_country_and_city() {
        assert_eq!(
            broader_candidates("annapolis, md, united states"),
            vec!["annapolis, md", "md", "maryland"]
        );
        assert_eq!(broader_candidates("maryland"), Vec::<String>::new());
    }

    #[tokio::test]
    async fn static_table_needs_no_io() {
        let discovery = Arc::new(FakeDiscovery::new(&[]));
        let resolver = resolver_with(Arc::new(InMemoryLocationCache::new()), Some(discovery.clone()));
        let r = resolver.resolve("Denver, CO").await;
        assert_eq!(r.tier, LocationTier::Static);
        assert_eq!(r.id.as_deref(), Some("90000052"));
        assert_eq!(discovery.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn discovered_then_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/typeahead"))
            .and(query_param("q", "maryland"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "elements": [{"targetUrn": "urn:li:fs_geo:100809221", "text": "Maryland, United States"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let policy = RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            call_timeout: Some(Duration::from_secs(2)),
        };
        let discovery = HttpDiscovery::new(
            build_client(Duration::from_secs(2)).expect("client"),
            format!("{}/typeahead", server.uri()),
            Retrier::new(policy),
        );
        let cache = Arc::new(Storage::open_in_memory().await.expect("storage"));
        let resolver = resolver_with(cache, Some(Arc::new(discovery)));

        let first = resolver.resolve("Maryland").await;
        assert_eq!(first.id.as_deref(), Some("100809221"));
        assert_eq!(first.full_id.as_deref(), Some("urn:li:fs_geo:100809221"));
        assert_eq!(first.tier, LocationTier::Discovered);

        let second = resolver.resolve("Maryland").await;
        assert_eq!(second.id.as_deref(), Some("100809221"));
        assert_eq!(second.tier, LocationTier::Cache);
    }

    #[tokio::test]
    async fn negative_entry_suppresses_discovery() {
        let discovery = Arc::new(FakeDiscovery::new(&[]));
        let resolver = resolver_with(Arc::new(InMemoryLocationCache::new()), Some(discovery.clone()));

        assert!(resolver.resolve("Atlantis").await.is_failed());
        assert_eq!(discovery.calls.load(Ordering::SeqCst), 1);

        assert!(resolver.resolve("atlantis").await.is_failed());
        assert_eq!(discovery.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_negative_entry_allows_discovery_again() {
        let cache = Arc::new(InMemoryLocationCache::new());
        cache
            .put(&LocationCacheEntry {
                key: "atlantis".into(),
                id: None,
                full_id: None,
                tier: LocationTier::Failed,
                created_at: Utc::now() - chrono::Duration::hours(2),
                ttl_secs: 60,
            })
            .await
            .unwrap();
        let discovery = Arc::new(FakeDiscovery::new(&[("atlantis", "123456")]));
        let resolver = resolver_with(cache, Some(discovery.clone()));

        let r = resolver.resolve("Atlantis").await;
        assert_eq!(r.tier, LocationTier::Discovered);
        assert_eq!(discovery.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn state_fallback_uses_broader_unit() {
        let cache = Arc::new(InMemoryLocationCache::new());
        let resolver = resolver_with(cache.clone(), None);

        let r = resolver.resolve("Springfield, CO, United States").await;
        assert_eq!(r.tier, LocationTier::StateFallback);
        assert_eq!(r.id.as_deref(), Some("105763813"));

        let cached = cache.get("springfield, co, united states").await.unwrap().expect("written back");
        assert_eq!(cached.tier, LocationTier::StateFallback);
    }

    #[tokio::test]
    async fn batch_deduplicates_in_flight_discovery() {
        let mut fake = FakeDiscovery::new(&[("maryland", "100809221")]);
        fake.delay = Duration::from_millis(50);
        let discovery = Arc::new(fake);
        let resolver = resolver_with(Arc::new(InMemoryLocationCache::new()), Some(discovery.clone()));
        let batch = ResolveBatch::new();

        let (a, b) = tokio::join!(
            resolver.resolve_in(&batch, "Maryland"),
            resolver.resolve_in(&batch, " maryland ")
        );
        assert_eq!(a.id, b.id);
        assert_eq!(discovery.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn discovery_errors_are_not_negatively_cached() {
        struct Broken;

        #[async_trait]
        impl LocationDiscovery for Broken {
            async fn discover(&self, _text: &str) -> Result<Option<Discovered>> {
                Err(leadenrich_shared::EnrichError::transient("HTTP 503"))
            }
        }

        let cache = Arc::new(InMemoryLocationCache::new());
        let resolver = resolver_with(cache.clone(), Some(Arc::new(Broken)));
        assert!(resolver.resolve("Atlantis").await.is_failed());
        assert_eq!(cache.len().await, 0);
    }
}
