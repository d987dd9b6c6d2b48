use std::path::Path;

use anyhow::{Context, Result};
use tracing as log;

/// Run metrics for the textfile exporter. Written atomically; the
/// exporter's own formatting quirks are out of scope, this is the stable
/// core gauge set.
#[derive(Debug, Clone, Default)]
pub struct RunMetrics {
    pub exit_code: i32,
    pub started_at: u64,
    pub duration_seconds: u64,
    pub files_collected: u64,
    pub files_failed: u64,
    pub archive_bytes: u64,
    pub tiers_succeeded: u64,
    pub tiers_failed: u64,
    pub retention_deleted: u64,
}

impl RunMetrics {
    fn render(&self) -> String {
        let mut out = String::new();
        let mut gauge = |name: &str, help: &str, value: u64| {
            out.push_str(&format!(
                "# HELP proxsave_{name} {help}\n# TYPE proxsave_{name} gauge\nproxsave_{name} {value}\n"
            ));
        };
        gauge(
            "last_run_timestamp_seconds",
            "Unix time the last backup run started",
            self.started_at,
        );
        gauge(
            "last_run_duration_seconds",
            "Wall-clock duration of the last run",
            self.duration_seconds,
        );
        gauge(
            "last_run_exit_code",
            "Exit code of the last run",
            self.exit_code.max(0) as u64,
        );
        gauge(
            "files_collected",
            "Files staged by the last run",
            self.files_collected,
        );
        gauge(
            "files_failed",
            "Per-file collection failures in the last run",
            self.files_failed,
        );
        gauge(
            "archive_bytes",
            "Size of the archive produced by the last run",
            self.archive_bytes,
        );
        gauge(
            "tiers_succeeded",
            "Storage tiers that accepted the backup",
            self.tiers_succeeded,
        );
        gauge(
            "tiers_failed",
            "Storage tiers that failed during fan-out",
            self.tiers_failed,
        );
        gauge(
            "retention_deleted",
            "Backups deleted by retention in the last run",
            self.retention_deleted,
        );
        out
    }
}

/// Best-effort: metrics must never change the run's outcome.
pub fn write(metrics: &RunMetrics, path: Option<&Path>) {
    let Some(path) = path else {
        log::debug!("no metrics path configured");
        return;
    };
    if let Err(e) = write_atomic(metrics, path) {
        log::warn!("metrics write failed: {e:#}");
    }
}

fn write_atomic(metrics: &RunMetrics, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create {}", dir.display()))?;
    }
    let tmp = path.with_extension("prom.tmp");
    std::fs::write(&tmp, metrics.render())
        .with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("rename to {}", path.display()))?;
    Ok(())
}
