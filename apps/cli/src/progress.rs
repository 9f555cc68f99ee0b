//! Terminal progress for `enrich`.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

use leadenrich_core::{ProgressReporter, RecordReport, RecordStatus};
use leadenrich_shared::{ContactRecord, Field};

/// CLI progress reporter using an indicatif bar.
pub(crate) struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    pub(crate) fn new(total: usize) -> Self {
        let bar = ProgressBar::new(total as u64);
        let style = ProgressStyle::with_template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
            .progress_chars("=> ");
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar }
    }

    pub(crate) fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, key: &str, phase: &str) {
        self.bar.set_message(format!("{key}: {phase}"));
    }

    fn fields_found(&self, key: &str, phase: &str, added: &[Field], _record: &ContactRecord) {
        if !added.is_empty() {
            let names: Vec<&str> = added.iter().map(Field::as_str).collect();
            self.bar
                .set_message(format!("{key}: {phase} found {}", names.join(", ")));
        }
    }

    fn record_done(&self, report: &RecordReport) {
        if report.status == RecordStatus::Invalid || report.status == RecordStatus::Failed {
            self.bar.println(format!(
                "  record {}: {}",
                report.index,
                report.error.as_deref().unwrap_or("failed")
            ));
        }
        self.bar.inc(1);
    }
}
