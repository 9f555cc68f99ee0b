//! Enrichment orchestration for leadenrich.
//!
//! This crate ties the phase table, lookup providers, the location resolver
//! and the result store into end-to-end workflows: one record through
//! [`EnrichmentPipeline::enrich`], a whole batch through [`BatchRunner::run`].

pub mod batch;
pub mod catalog;
pub mod derive;
pub mod gate;
pub mod intake;
pub mod phase;
pub mod pipeline;
pub mod providers;

pub use batch::{BatchReport, BatchRunner, BatchTotals, RecordReport, RecordStatus};
pub use catalog::{build_phases, builtin_phase};
pub use gate::{RateLimitGate, parse_retry_after};
pub use intake::{Intake, RejectedRecord, intake_batch, parse_input};
pub use phase::{CancelFlag, Phase, PhaseCall, PhaseContext, merge_first_non_empty};
pub use pipeline::{EnrichOutcome, EnrichmentPipeline, ProgressReporter, SilentProgress, StopReason};
pub use providers::{AuthMode, HttpLookup, ProviderDeps};
