use crate::bk::backup;
use crate::bk::config::KeeperConfig;
use crate::bk::disk::{fmt_bytes, DiskProbe};
use crate::bk::drift;
use crate::bk::guard::{self, Acquire};
use crate::bk::journal::Journal;
use crate::bk::model::{
    BackupOutcome, BackupRecord, DependencyDriftReport, DiskCheckReport, DiskVerdict, HostUpdateReport,
    MaintenanceReport,
};
use crate::bk::retention;
use chrono::Local;
use std::sync::Arc;
use std::time::SystemTime;

pub const GUARD_ENTRY: &str = "maintenance";

pub struct MaintenanceEngine {
    cfg: Arc<KeeperConfig>,
    disk: Arc<dyn DiskProbe>,
    journal: Journal,
}

impl MaintenanceEngine {
    pub fn new(cfg: Arc<KeeperConfig>, disk: Arc<dyn DiskProbe>) -> Self {
        let journal = Journal::new(&cfg.paths.logs_dir);
        Self { cfg, disk, journal }
    }

    /// One maintenance pass: backup, disk check, dependency drift, host updates.
    ///
    /// `Ok(None)` when another pass holds the guard. A failing step is recorded in the report and
    /// the remaining steps still run.
    pub async fn run_maintenance(&self) -> anyhow::Result<Option<MaintenanceReport>> {
        let _guard = match guard::try_acquire(&self.cfg.paths.state_dir, GUARD_ENTRY)? {
            Acquire::Acquired(g) => g,
            Acquire::Held { holder } => {
                let who = holder.map(|p| format!(" by pid {p}")).unwrap_or_default();
                self.note("maintenance", format!("skipped: guard held{who}"));
                return Ok(None);
            }
        };

        let started_at = Local::now();
        self.note("maintenance", "started");

        let backups = self.backup_step();
        let disk = self.disk_step();
        let drift = self.drift_step().await;
        let host_updates = self.host_updates_step().await;

        let report = MaintenanceReport {
            started_at,
            finished_at: Local::now(),
            backups,
            disk,
            drift,
            host_updates,
        };
        let took = (report.finished_at - report.started_at).num_milliseconds();
        let state = if report.is_degraded() { "degraded" } else { "ok" };
        self.note("maintenance", format!("finished {state} in {took}ms"));
        Ok(Some(report))
    }

    fn backup_step(&self) -> Vec<BackupRecord> {
        let records = backup::run_backups(&self.cfg, Local::now());
        for r in &records {
            let msg = match &r.outcome {
                BackupOutcome::Copied { files, bytes } => format!(
                    "{} {} -> {} ({files} files, {})",
                    r.artifact_kind.as_str(),
                    r.source_path.display(),
                    r.destination_path.display(),
                    fmt_bytes(*bytes)
                ),
                BackupOutcome::SkippedMissing => {
                    format!("{} {} skipped: missing", r.artifact_kind.as_str(), r.source_path.display())
                }
                BackupOutcome::Failed { error } => {
                    format!("{} {} FAILED: {error}", r.artifact_kind.as_str(), r.source_path.display())
                }
            };
            self.note("backup", msg);
        }
        if records.is_empty() {
            self.note("backup", "nothing configured");
        }
        records
    }

    fn disk_step(&self) -> DiskCheckReport {
        let mark = self.cfg.disk.high_water_percent;
        let mut report = DiskCheckReport {
            verdict: DiskVerdict::Failed,
            high_water_percent: mark,
            before: None,
            after: None,
            cleanup: None,
            error: None,
        };

        let before = match self.disk.sample(&self.cfg.disk.path) {
            Ok(s) => s,
            Err(e) => {
                report.error = Some(format!("{e:#}"));
                self.note("disk", format!("FAILED: {e:#}"));
                return report;
            }
        };
        let used = before.used_percent;
        report.before = Some(before);

        if used < mark {
            report.verdict = DiskVerdict::Ok;
            self.note("disk", format!("{} used={used:.1}% mark={mark}%", report.verdict.as_str()));
            return report;
        }

        let rules = retention::matching_rules(&self.cfg.retention, used);
        let protected = [self.journal.health_path(), self.journal.maintenance_path()];
        let summary = retention::apply_rules(&rules, &self.cfg.artifact_dirs, &protected, SystemTime::now());
        self.note(
            "disk",
            format!(
                "used={used:.1}% >= {mark}%: applied [{}], removed {} files ({}){}",
                summary.rules_applied.join(", "),
                summary.deleted_files,
                fmt_bytes(summary.reclaimed_bytes),
                if summary.failures.is_empty() {
                    String::new()
                } else {
                    format!(", {} failures", summary.failures.len())
                }
            ),
        );
        report.cleanup = Some(summary);

        match self.disk.sample(&self.cfg.disk.path) {
            Ok(after) => {
                report.verdict = if after.used_percent < mark {
                    DiskVerdict::Cleaned
                } else {
                    DiskVerdict::StillOverThreshold
                };
                self.note(
                    "disk",
                    format!("{} used={:.1}% mark={mark}%", report.verdict.as_str(), after.used_percent),
                );
                if report.verdict == DiskVerdict::StillOverThreshold {
                    tracing::warn!(used = after.used_percent, mark, "disk still over threshold after cleanup");
                }
                report.after = Some(after);
            }
            Err(e) => {
                report.error = Some(format!("re-sample after cleanup: {e:#}"));
                self.note("disk", format!("FAILED re-sample: {e:#}"));
            }
        }
        report
    }

    async fn drift_step(&self) -> DependencyDriftReport {
        let r = drift::check_dependency_drift(
            &self.cfg.drift,
            &self.cfg.paths.base_dir,
            self.cfg.service.command_timeout,
        )
        .await;
        if !self.cfg.drift.enabled {
            self.note("drift", "disabled");
            return r;
        }
        let outdated = r
            .outdated_count
            .map(|n| n.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let vcs = match (r.vcs_behind, r.commits_behind) {
            (Some(true), Some(n)) => format!("{n} commits behind upstream"),
            (Some(false), _) => "up to date with upstream".to_string(),
            _ => "no upstream comparison".to_string(),
        };
        self.note("drift", format!("outdated packages={outdated}; {vcs}"));
        for e in &r.errors {
            self.note("drift", format!("advisory: {e}"));
        }
        r
    }

    async fn host_updates_step(&self) -> HostUpdateReport {
        let r = drift::check_host_updates(&self.cfg.host_updates, self.cfg.service.command_timeout).await;
        let msg = match (&r.error, r.available_updates, r.security_updates) {
            _ if !self.cfg.host_updates.enabled => "disabled".to_string(),
            (Some(e), _, _) => format!("advisory: check failed: {e}"),
            (None, Some(all), Some(sec)) => format!("{all} updates available ({sec} security), not applied"),
            _ => "no data".to_string(),
        };
        self.note("host_updates", msg);
        r
    }

    /// Maintenance log line; a log write failure must not stop the pass.
    fn note(&self, step: &str, msg: impl AsRef<str>) {
        if let Err(e) = self.journal.maintenance_event(step, msg) {
            tracing::error!(error = %e, step, "failed to write maintenance log");
        }
    }
}
