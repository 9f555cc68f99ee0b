//! Bounded-parallel batch runner.
//!
//! Records are enriched independently, at most `workers` at a time. Each
//! finished record is persisted immediately, including cancelled ones. A
//! store failure fails only the record it happened on.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

use leadenrich_shared::{ContactRecord, EnrichError, Field, FieldSet, PersistedResult, PhaseFailure, RunId};
use leadenrich_storage::ResultStore;

use crate::gate::RateLimitGate;
use crate::intake::intake_batch;
use crate::phase::{CancelFlag, PhaseContext};
use crate::pipeline::{EnrichOutcome, EnrichmentPipeline, ProgressReporter, StopReason};

/// Final state of one input record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Required fields satisfied and saved.
    Complete,
    /// Phases exhausted with required fields missing; saved.
    Partial,
    /// Interrupted by cancellation; saved with what it had.
    Cancelled,
    /// Rejected at intake; never entered the pipeline.
    Invalid,
    /// Enriched but could not be persisted.
    Failed,
}

/// Per-record outcome for the caller.
#[derive(Debug, Clone, Serialize)]
pub struct RecordReport {
    /// Position in the input batch.
    pub index: usize,
    pub key: Option<String>,
    pub status: RecordStatus,
    pub phases_run: Vec<String>,
    pub missing: Vec<Field>,
    pub external_calls: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub trail: Vec<PhaseFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RecordReport {
    fn invalid(index: usize, error: &EnrichError) -> Self {
        Self {
            index,
            key: None,
            status: RecordStatus::Invalid,
            phases_run: Vec::new(),
            missing: Vec::new(),
            external_calls: 0,
            trail: Vec::new(),
            error: Some(error.to_string()),
        }
    }

    fn from_outcome(index: usize, outcome: &EnrichOutcome, saved: &Result<PersistedResult, EnrichError>) -> Self {
        let status = match (saved, outcome.stop) {
            (Err(_), _) => RecordStatus::Failed,
            (Ok(_), StopReason::Satisfied) => RecordStatus::Complete,
            (Ok(_), StopReason::Exhausted) if outcome.missing.is_empty() => RecordStatus::Complete,
            (Ok(_), StopReason::Exhausted) => RecordStatus::Partial,
            (Ok(_), StopReason::Cancelled) => RecordStatus::Cancelled,
        };
        Self {
            index,
            key: outcome.record.identity_key(),
            status,
            phases_run: outcome.phases_run.clone(),
            missing: outcome.missing.clone(),
            external_calls: outcome.external_calls,
            trail: outcome.record.trail.clone(),
            error: saved.as_ref().err().map(ToString::to_string),
        }
    }
}

/// Counts across a batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchTotals {
    pub records: usize,
    pub complete: usize,
    pub partial: usize,
    pub cancelled: usize,
    pub invalid: usize,
    pub failed: usize,
    pub external_calls: usize,
}

/// Everything a caller needs after a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub run_id: RunId,
    /// Ordered by input position.
    pub records: Vec<RecordReport>,
    pub totals: BatchTotals,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_key: Option<String>,
}

impl BatchReport {
    fn new(run_id: RunId, mut records: Vec<RecordReport>, elapsed_ms: u64, summary_key: Option<String>) -> Self {
        records.sort_by_key(|r| r.index);
        let mut totals = BatchTotals {
            records: records.len(),
            ..Default::default()
        };
        for r in &records {
            totals.external_calls += r.external_calls;
            match r.status {
                RecordStatus::Complete => totals.complete += 1,
                RecordStatus::Partial => totals.partial += 1,
                RecordStatus::Cancelled => totals.cancelled += 1,
                RecordStatus::Invalid => totals.invalid += 1,
                RecordStatus::Failed => totals.failed += 1,
            }
        }
        Self {
            run_id,
            records,
            totals,
            elapsed_ms,
            summary_key,
        }
    }
}

/// Runs batches through one pipeline into one result store.
pub struct BatchRunner {
    pipeline: Arc<EnrichmentPipeline>,
    store: ResultStore,
    workers: usize,
    required: FieldSet,
    gate: RateLimitGate,
}

impl BatchRunner {
    pub fn new(pipeline: EnrichmentPipeline, store: ResultStore, workers: usize, required: FieldSet) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            store,
            workers: workers.max(1),
            required,
            gate: RateLimitGate::default(),
        }
    }

    pub fn with_gate(mut self, gate: RateLimitGate) -> Self {
        self.gate = gate;
        self
    }

    /// Enrich and persist every record in `raw`.
    ///
    /// Location resolutions are shared within this call only. After
    /// `cancel` fires, unfinished records are still saved with the fields
    /// they already hold.
    #[instrument(skip_all, fields(run_id = %self.store.run_id(), records = raw.len()))]
    pub async fn run(
        &self,
        raw: &[Value],
        cancel: CancelFlag,
        progress: Arc<dyn ProgressReporter>,
    ) -> BatchReport {
        let start = Instant::now();
        let intake = intake_batch(raw);
        let mut reports: Vec<RecordReport> = Vec::with_capacity(raw.len());

        for rejected in &intake.rejected {
            let report = RecordReport::invalid(rejected.index, &rejected.error);
            progress.record_done(&report);
            reports.push(report);
        }

        info!(
            accepted = intake.records.len(),
            rejected = intake.rejected.len(),
            workers = self.workers,
            "starting batch"
        );

        let ctx = Arc::new(PhaseContext::new(cancel.clone(), self.gate.clone()));
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut handles = Vec::new();

        for (index, record) in intake.records {
            if !cancel.is_cancelled() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {}
                    _ = self.gate.wait() => {}
                }
            }
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };

            let pipeline = Arc::clone(&self.pipeline);
            let store = self.store.clone();
            let required = self.required.clone();
            let ctx = Arc::clone(&ctx);
            let progress = Arc::clone(&progress);
            let fallback = record.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                let outcome = pipeline.enrich(record, &required, &ctx, progress.as_ref()).await;
                let saved = store.save_incremental(&outcome.record).await;
                if let Err(e) = &saved {
                    warn!(index, error = %e, "failed to persist record");
                }
                let report = RecordReport::from_outcome(index, &outcome, &saved);
                progress.record_done(&report);
                (report, saved.ok())
            });
            handles.push((index, fallback, handle));
        }

        let mut saved = Vec::new();
        for (index, fallback, handle) in handles {
            match handle.await {
                Ok((report, result)) => {
                    reports.push(report);
                    saved.extend(result);
                }
                Err(e) => {
                    warn!(index, error = %e, "record task failed");
                    let (report, result) = self.salvage(index, fallback, &e.to_string()).await;
                    progress.record_done(&report);
                    reports.push(report);
                    saved.extend(result);
                }
            }
        }

        let summary_key = if saved.is_empty() {
            None
        } else {
            match self.store.write_summary(&saved).await {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!(error = %e, "failed to write batch summary");
                    None
                }
            }
        };

        let report = BatchReport::new(
            self.store.run_id().clone(),
            reports,
            start.elapsed().as_millis() as u64,
            summary_key,
        );
        info!(
            complete = report.totals.complete,
            partial = report.totals.partial,
            cancelled = report.totals.cancelled,
            invalid = report.totals.invalid,
            failed = report.totals.failed,
            external_calls = report.totals.external_calls,
            elapsed_ms = report.elapsed_ms,
            "batch finished"
        );
        report
    }

    /// Persist the input form of a record whose task died.
    async fn salvage(
        &self,
        index: usize,
        record: ContactRecord,
        cause: &str,
    ) -> (RecordReport, Option<PersistedResult>) {
        let (error, result) = match self.store.save_incremental(&record).await {
            Ok(result) => (cause.to_string(), Some(result)),
            Err(e) => (format!("{cause}; {e}"), None),
        };
        let report = RecordReport {
            index,
            key: record.identity_key(),
            status: RecordStatus::Failed,
            phases_run: Vec::new(),
            missing: record.missing(&self.required),
            external_calls: 0,
            trail: record.trail,
            error: Some(error),
        };
        (report, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use leadenrich_shared::{AppConfig, ProviderAuth, ProviderConfig, ProviderKind, Result, StoreSettings};
    use leadenrich_storage::{BlobLock, BlobStore, FsBlobStore};
    use leadenrich_transport::{Retrier, RetryPolicy, build_client};
    use serde_json::json;
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::catalog::build_phases;
    use crate::phase::{Phase, PhaseCall, merge_first_non_empty};
    use crate::pipeline::SilentProgress;
    use crate::providers::ProviderDeps;

    fn temp_root() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("leadenrich-batch-{}", Uuid::now_v7()))
    }

    fn result_store(root: &std::path::Path) -> ResultStore {
        let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(root, StoreSettings::default()));
        ResultStore::new(blobs, RunId::new())
    }

    fn provider(server: &MockServer, name: &str, kind: ProviderKind, path: &str) -> ProviderConfig {
        ProviderConfig {
            name: name.into(),
            kind,
            base_url: server.uri(),
            path: path.into(),
            auth: ProviderAuth::None,
            api_key_env: None,
            api_key_header: "x-api-key".into(),
        }
    }

    fn deps(max_attempts: u32) -> ProviderDeps {
        ProviderDeps {
            client: build_client(Duration::from_secs(2)).expect("client"),
            retrier: Retrier::with_seed(
                RetryPolicy {
                    max_attempts,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(2),
                    call_timeout: Some(Duration::from_secs(2)),
                },
                5,
            ),
            tokens: None,
            resolver: None,
        }
    }

    #[tokio::test]
    async fn denver_lead_stops_after_one_paid_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/skip"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([{"phone": "303-555-1234"}])),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(path("/carrier"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(path("/people"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(0)
            .mount(&server)
            .await;

        let mut config = AppConfig::default();
        config.providers = vec![
            provider(&server, "skip-trace", ProviderKind::SkipTrace, "/skip"),
            provider(&server, "carrier-lookup", ProviderKind::CarrierLookup, "/carrier"),
            provider(&server, "people-search", ProviderKind::PeopleSearch, "/people"),
        ];
        config.pipeline.phases = ["zip-from-city", "skip-trace", "carrier-lookup", "people-search"]
            .map(String::from)
            .to_vec();

        let root = temp_root();
        let store = result_store(&root);
        let runner = BatchRunner::new(
            EnrichmentPipeline::new(build_phases(&config, &deps(1)).unwrap()),
            store.clone(),
            2,
            FieldSet::new([Field::Phone, Field::Zip]),
        );

        let raw = vec![json!({"name": "John Doe", "city": "Denver", "state": "CO"})];
        let report = runner.run(&raw, CancelFlag::new(), Arc::new(SilentProgress)).await;

        assert_eq!(report.totals.external_calls, 1);
        let record = &report.records[0];
        assert_eq!(record.status, RecordStatus::Complete);
        assert_eq!(record.phases_run, vec!["zip-from-city", "skip-trace"]);

        let aggregate = store.load_aggregate().await.unwrap();
        assert_eq!(aggregate.len(), 1);
        let saved = &aggregate[0].record;
        assert_eq!(saved.get(Field::Phone), Some("3035551234"));
        assert_eq!(saved.get(Field::Zip), Some("80201"));
        assert_eq!(saved.source_of(Field::Zip), Some("zip-from-city"));
        assert_eq!(saved.source_of(Field::Phone), Some("skip-trace"));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn rate_limit_is_not_retried_and_keeps_hint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = AppConfig::default();
        config.providers = vec![provider(&server, "skip-trace", ProviderKind::SkipTrace, "/skip")];
        config.pipeline.phases = vec!["skip-trace".into()];

        let root = temp_root();
        let runner = BatchRunner::new(
            EnrichmentPipeline::new(build_phases(&config, &deps(3)).unwrap()),
            result_store(&root),
            1,
            FieldSet::new([Field::Phone]),
        );
        let raw = vec![json!({"name": "John Doe", "zip": "80201"})];
        let report = runner.run(&raw, CancelFlag::new(), Arc::new(SilentProgress)).await;

        let record = &report.records[0];
        assert_eq!(record.status, RecordStatus::Partial);
        assert_eq!(record.trail.len(), 1);
        assert_eq!(record.trail[0].kind, "rate_limited");
        assert!(record.trail[0].message.contains("retry-after: 0"));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn invalid_records_are_reported_not_saved() {
        let root = temp_root();
        let store = result_store(&root);
        let runner = BatchRunner::new(EnrichmentPipeline::new(Vec::new()), store.clone(), 2, FieldSet::default());

        let raw = vec![json!({"city": "Denver"}), json!({"email": "a@b.com"})];
        let report = runner.run(&raw, CancelFlag::new(), Arc::new(SilentProgress)).await;

        assert_eq!(report.totals.invalid, 1);
        assert_eq!(report.totals.complete, 1);
        assert_eq!(report.records[0].status, RecordStatus::Invalid);
        assert_eq!(store.load_aggregate().await.unwrap().len(), 1);

        let _ = std::fs::remove_dir_all(&root);
    }

    struct Slow {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PhaseCall for Slow {
        async fn call(&self, _record: &ContactRecord, _ctx: &PhaseContext) -> Result<ContactRecord> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(ContactRecord::from_pairs([(Field::Phone, "3035551234")]))
        }
    }

    #[tokio::test]
    async fn cancelled_batch_persists_partial_records() {
        let calls = Arc::new(AtomicUsize::new(0));
        let slow = Phase {
            id: "slow".into(),
            source: "test".into(),
            paid: true,
            precondition: |_| true,
            call: Arc::new(Slow {
                calls: Arc::clone(&calls),
            }),
            merge: merge_first_non_empty,
        };
        let mut phases = build_phases(&AppConfig::default(), &deps(1)).unwrap();
        phases.push(slow);

        let root = temp_root();
        let store = result_store(&root);
        let runner = BatchRunner::new(
            EnrichmentPipeline::new(phases),
            store.clone(),
            1,
            FieldSet::new([Field::Phone]),
        );

        let cancel = CancelFlag::new();
        let trigger = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            })
        };
        let raw = vec![
            json!({"name": "John Doe", "city": "Denver", "state": "CO"}),
            json!({"name": "Jane Roe", "city": "Boulder", "state": "CO"}),
        ];
        let report = tokio::time::timeout(
            Duration::from_secs(5),
            runner.run(&raw, cancel, Arc::new(SilentProgress)),
        )
        .await
        .expect("batch stops promptly");
        trigger.await.unwrap();

        assert_eq!(report.totals.cancelled, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let aggregate = store.load_aggregate().await.unwrap();
        assert_eq!(aggregate.len(), 2);
        let john = aggregate
            .iter()
            .find(|r| r.key == "john doe")
            .expect("john persisted");
        assert_eq!(john.record.get(Field::Zip), Some("80201"));

        let _ = std::fs::remove_dir_all(&root);
    }

    struct Panics;

    #[async_trait]
    impl PhaseCall for Panics {
        async fn call(&self, _record: &ContactRecord, _ctx: &PhaseContext) -> Result<ContactRecord> {
            panic!("lookup blew up");
        }
    }

    #[tokio::test]
    async fn panicked_record_is_salvaged_into_the_summary() {
        let phases = vec![Phase {
            id: "explodes".into(),
            source: "test".into(),
            paid: false,
            precondition: |_| true,
            call: Arc::new(Panics),
            merge: merge_first_non_empty,
        }];
        let root = temp_root();
        let store = result_store(&root);
        let runner = BatchRunner::new(
            EnrichmentPipeline::new(phases),
            store.clone(),
            1,
            FieldSet::new([Field::Phone]),
        );

        let raw = vec![json!({"name": "John Doe", "city": "Denver"})];
        let report = runner.run(&raw, CancelFlag::new(), Arc::new(SilentProgress)).await;
        assert_eq!(report.totals.failed, 1);
        assert!(report.records[0].error.as_deref().unwrap_or_default().contains("panic"));

        let summary_key = report.summary_key.expect("summary written");
        let bytes = std::fs::read(root.join(&summary_key)).expect("summary file");
        let summary: Vec<PersistedResult> = serde_json::from_slice(&bytes).expect("summary json");
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].key, "john doe");
        assert_eq!(summary[0].record.get(Field::City), Some("Denver"));

        let _ = std::fs::remove_dir_all(&root);
    }

    /// Blob store that refuses every write.
    struct ReadOnlyBlobs;

    #[async_trait]
    impl BlobStore for ReadOnlyBlobs {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
        async fn put(&self, _key: &str, _bytes: &[u8]) -> Result<()> {
            Err(EnrichError::Storage("read-only".into()))
        }
        async fn append(&self, _key: &str, _bytes: &[u8]) -> Result<()> {
            Err(EnrichError::Storage("read-only".into()))
        }
        async fn list(&self, _prefix: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn lock(&self, _key: &str) -> Result<BlobLock> {
            Ok(BlobLock::new(|| {}))
        }
    }

    #[tokio::test]
    async fn store_failure_fails_only_that_record() {
        let store = ResultStore::new(Arc::new(ReadOnlyBlobs), RunId::new());
        let runner = BatchRunner::new(EnrichmentPipeline::new(Vec::new()), store, 2, FieldSet::default());
        let raw = vec![json!({"name": "A"}), json!({"city": "Nowhere"}), json!({"name": "B"})];
        let report = runner.run(&raw, CancelFlag::new(), Arc::new(SilentProgress)).await;

        assert_eq!(report.totals.records, 3);
        assert_eq!(report.totals.failed, 2);
        assert_eq!(report.totals.invalid, 1);
        assert!(report.records[0].error.as_deref().unwrap_or_default().contains("read-only"));
        assert!(report.summary_key.is_none());
    }
}
