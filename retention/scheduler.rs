use crate::retention::RetentionManager;
use crate::types::MaintenanceReport;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};

/// Automated maintenance scheduler
pub struct RetentionScheduler {
    manager: Arc<RetentionManager>,
    interval_secs: u64,
}

impl RetentionScheduler {
    pub fn new(manager: Arc<RetentionManager>, interval_secs: u64) -> Self {
        Self {
            manager,
            interval_secs: interval_secs.max(1),
        }
    }

    /// Start the scheduler (runs until the task is aborted)
    pub async fn start(self) {
        info!(
            "Starting retention scheduler (interval: {} seconds)",
            self.interval_secs
        );

        let mut ticker = interval(Duration::from_secs(self.interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let manager = self.manager.clone();
            match tokio::task::spawn_blocking(move || manager.run_cycle()).await {
                Ok(reports) => log_reports(&reports),
                Err(e) => error!("Maintenance task panicked: {}", e),
            }
        }
    }

    /// Run one cycle on the current thread (for testing or manual execution)
    pub fn run_once(&self) -> Vec<MaintenanceReport> {
        info!("Running one-time maintenance cycle");
        let reports = self.manager.run_cycle();
        log_reports(&reports);
        reports
    }
}

fn log_reports(reports: &[MaintenanceReport]) {
    for report in reports {
        if report.error.is_some() {
            continue;
        }
        let merged = report
            .compaction
            .as_ref()
            .map_or(0, |c| c.records_removed());
        let vacuumed = report.vacuum.as_ref().map_or(0, |v| v.records_deleted);
        info!(
            "Maintenance of '{}' completed: {} records compacted, {} vacuumed",
            report.namespace, merged, vacuumed
        );
    }
}
