//! The enrichment driver: one record, phases in table order.

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use leadenrich_shared::{ContactRecord, EnrichError, Field, FieldSet};

use crate::batch::RecordReport;
use crate::phase::{Phase, PhaseContext};

/// Why a record's pipeline ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Every required field is populated.
    Satisfied,
    /// All phases ran; some required fields may still be missing.
    Exhausted,
    /// The batch was cancelled; the record keeps what it had.
    Cancelled,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Satisfied => "satisfied",
            Self::Exhausted => "exhausted",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Result of enriching one record.
#[derive(Debug, Clone)]
pub struct EnrichOutcome {
    pub record: ContactRecord,
    pub stop: StopReason,
    /// Phases whose call was invoked, in order.
    pub phases_run: Vec<String>,
    /// Phases skipped because their precondition was false.
    pub skipped: Vec<String>,
    pub missing: Vec<Field>,
    /// Paid calls made for this record.
    pub external_calls: usize,
}

/// Progress callback for reporting enrichment status.
pub trait ProgressReporter: Send + Sync {
    /// Called when a phase call starts for the record identified by `key`.
    fn phase(&self, key: &str, phase: &str);
    /// Called after a phase merged. `added` is what it newly populated.
    fn fields_found(&self, key: &str, phase: &str, added: &[Field], record: &ContactRecord);
    /// Called once per record, after it has been persisted (or failed to be).
    fn record_done(&self, report: &RecordReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _key: &str, _phase: &str) {}
    fn fields_found(&self, _key: &str, _phase: &str, _added: &[Field], _record: &ContactRecord) {}
    fn record_done(&self, _report: &RecordReport) {}
}

/// Drives the phase table over single records.
#[derive(Debug, Clone)]
pub struct EnrichmentPipeline {
    phases: Vec<Phase>,
}

impl EnrichmentPipeline {
    pub fn new(phases: Vec<Phase>) -> Self {
        Self { phases }
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    /// Run the phases over `record` until `required` is satisfied, every
    /// phase has run, or the batch is cancelled.
    ///
    /// The required set is re-checked before every phase. An empty required
    /// set never exits early. Phase errors go to the record's trail and the
    /// next phase still runs.
    #[instrument(skip_all, fields(key = %record.identity_key().unwrap_or_default()))]
    pub async fn enrich(
        &self,
        mut record: ContactRecord,
        required: &FieldSet,
        ctx: &PhaseContext,
        progress: &dyn ProgressReporter,
    ) -> EnrichOutcome {
        let key = record.identity_key().unwrap_or_default();
        let early_exit = !required.is_empty();
        let mut phases_run = Vec::new();
        let mut skipped = Vec::new();
        let mut external_calls = 0;
        let mut stop = StopReason::Exhausted;

        for phase in &self.phases {
            if early_exit && record.satisfies(required) {
                stop = StopReason::Satisfied;
                break;
            }
            if ctx.cancel.is_cancelled() {
                stop = StopReason::Cancelled;
                break;
            }
            if !(phase.precondition)(&record) {
                debug!(phase = %phase.id, "precondition false; skipped");
                skipped.push(phase.id.clone());
                continue;
            }

            if phase.paid {
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => {
                        stop = StopReason::Cancelled;
                        break;
                    }
                    _ = ctx.gate.wait() => {}
                }
                external_calls += 1;
            }

            progress.phase(&key, &phase.id);
            phases_run.push(phase.id.clone());

            let result = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => Err(EnrichError::Cancelled),
                found = phase.call.call(&record, ctx) => found,
            };

            match result {
                Ok(found) => {
                    let added = (phase.merge)(&mut record, &found, &phase.id);
                    debug!(phase = %phase.id, added = added.len(), "phase merged");
                    progress.fields_found(&key, &phase.id, &added, &record);
                }
                Err(EnrichError::Cancelled) => {
                    record.record_failure(&phase.id, &EnrichError::Cancelled);
                    stop = StopReason::Cancelled;
                    break;
                }
                Err(e) => {
                    if let EnrichError::RateLimited { provider, retry_after } = &e {
                        ctx.gate.observe(provider, retry_after.as_deref());
                    }
                    match &e {
                        EnrichError::NotFound { .. } => debug!(phase = %phase.id, error = %e, "no match"),
                        _ => warn!(phase = %phase.id, kind = e.kind(), error = %e, "phase failed"),
                    }
                    record.record_failure(&phase.id, &e);
                }
            }
        }

        if stop == StopReason::Exhausted && early_exit && record.satisfies(required) {
            stop = StopReason::Satisfied;
        }

        let missing = record.missing(required);
        info!(
            stop = stop.as_str(),
            phases = phases_run.len(),
            external_calls,
            missing = missing.len(),
            "record enriched"
        );
        EnrichOutcome {
            record,
            stop,
            phases_run,
            skipped,
            missing,
            external_calls,
        }
    }
}
