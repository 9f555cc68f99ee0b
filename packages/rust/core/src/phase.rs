//! The declarative phase table.
//!
//! A phase is data: an id, whether it costs money, a precondition over the
//! current record, the call that fetches new fields, and the merge function
//! that folds them in. [`EnrichmentPipeline`](crate::EnrichmentPipeline)
//! iterates the table; nothing else knows phase order.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Notify;

use leadenrich_resolver::ResolveBatch;
use leadenrich_shared::{ContactRecord, Field, Result};

use crate::gate::RateLimitGate;

/// Predicate over the record as it stands before the phase runs.
pub type Precondition = fn(&ContactRecord) -> bool;

/// Fold a phase's partial record into the target. Returns the fields that
/// were newly populated.
pub type MergeFn = fn(&mut ContactRecord, &ContactRecord, &str) -> Vec<Field>;

/// Per-batch state handed to every phase call.
#[derive(Default)]
pub struct PhaseContext {
    /// In-flight location resolutions for this batch.
    pub locations: ResolveBatch,
    pub cancel: CancelFlag,
    pub gate: RateLimitGate,
}

impl PhaseContext {
    pub fn new(cancel: CancelFlag, gate: RateLimitGate) -> Self {
        Self {
            locations: ResolveBatch::new(),
            cancel,
            gate,
        }
    }
}

/// The external (or derived) lookup behind a phase.
#[async_trait]
pub trait PhaseCall: Send + Sync {
    /// Produce a partial record from what `record` already knows.
    async fn call(&self, record: &ContactRecord, ctx: &PhaseContext) -> Result<ContactRecord>;
}

/// One row of the phase table.
#[derive(Clone)]
pub struct Phase {
    pub id: String,
    /// Human-readable data source, for reports.
    pub source: String,
    /// Whether invoking the phase makes a paid external call.
    pub paid: bool,
    pub precondition: Precondition,
    pub call: Arc<dyn PhaseCall>,
    pub merge: MergeFn,
}

impl std::fmt::Debug for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Phase")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("paid", &self.paid)
            .finish_non_exhaustive()
    }
}

/// First non-empty value wins: copy each populated field of `found` that is
/// still empty in `target`, tagged with `source`.
pub fn merge_first_non_empty(target: &mut ContactRecord, found: &ContactRecord, source: &str) -> Vec<Field> {
    found
        .populated()
        .filter_map(|(field, value)| target.set_if_empty(field, value, source).then_some(field))
        .collect()
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Batch-wide cancellation signal. Cheap to clone; all clones share state.
#[derive(Clone, Default)]
pub struct CancelFlag {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
