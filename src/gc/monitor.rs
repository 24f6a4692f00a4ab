//! Observability hooks for generational garbage collection, independent of
//! the `log` crate output so embedding applications can drive their own
//! metrics/alerting off real GC lifecycle events.

use super::cleanup::CleanupReport;

/// Callback interface for compaction/cleanup lifecycle events.
///
/// All methods have no-op default bodies; implement only the ones a
/// particular monitor cares about.
pub trait GcMonitor: Send + Sync {
    fn compaction_started(&self) {}
    fn compaction_skipped(&self, reclaimable_pct: u8, threshold_pct: u8) {
        let _ = (reclaimable_pct, threshold_pct);
    }
    fn compaction_succeeded(&self, generation: u32, segments_copied: usize) {
        let _ = (generation, segments_copied);
    }
    fn compaction_abandoned(&self, retries: u32) {
        let _ = retries;
    }
    fn cleanup_succeeded(&self, report: &CleanupReport) {
        let _ = report;
    }
}

/// The default monitor: observes nothing.
pub struct NoopGcMonitor;

impl GcMonitor for NoopGcMonitor {}

/// A monitor that forwards every event to the `log` crate at an appropriate
/// level. Useful for applications that just want GC visibility in their
/// existing log stream without implementing [`GcMonitor`] themselves.
pub struct LoggingGcMonitor;

impl GcMonitor for LoggingGcMonitor {
    fn compaction_started(&self) {
        log::info!("compaction started");
    }

    fn compaction_skipped(&self, reclaimable_pct: u8, threshold_pct: u8) {
        log::debug!("compaction skipped: {reclaimable_pct}% reclaimable, below {threshold_pct}% threshold");
    }

    fn compaction_succeeded(&self, generation: u32, segments_copied: usize) {
        log::info!("compaction succeeded: generation {generation}, {segments_copied} segments copied forward");
    }

    fn compaction_abandoned(&self, retries: u32) {
        log::warn!("compaction abandoned after {retries} retries: head kept changing");
    }

    fn cleanup_succeeded(&self, report: &CleanupReport) {
        log::info!(
            "cleanup: {} archives rewritten, {} removed, {} bytes reclaimed",
            report.archives_rewritten,
            report.archives_removed,
            report.bytes_reclaimed
        );
    }
}
