use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

// ---------------- Health ----------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    Running,
    Down,
    RestartInProgress,
    RestartFailed,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Running => "RUNNING",
            ServiceStatus::Down => "DOWN",
            ServiceStatus::RestartInProgress => "RESTART_IN_PROGRESS",
            ServiceStatus::RestartFailed => "RESTART_FAILED",
        }
    }

    pub fn from_active(active: bool) -> Self {
        if active {
            ServiceStatus::Running
        } else {
            ServiceStatus::Down
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionTaken {
    None,
    Restart,
    /// Another invocation held the guard; nothing was queried or changed.
    Skipped,
}

impl ActionTaken {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionTaken::None => "none",
            ActionTaken::Restart => "restart",
            ActionTaken::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartOutcome {
    Success,
    Failure,
    NotAttempted,
}

impl RestartOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartOutcome::Success => "success",
            RestartOutcome::Failure => "failure",
            RestartOutcome::NotAttempted => "not_attempted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Scheduled,
    Manual,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Scheduled => "scheduled",
            Trigger::Manual => "manual",
        }
    }
}

/// One line of `health.log`. Exactly one is appended per health cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckRecord {
    pub timestamp: DateTime<Local>,
    pub service: String,
    pub trigger: Trigger,
    /// `None` only for skipped cycles, which never query the controller.
    #[serde(default)]
    pub observed_status: Option<ServiceStatus>,
    #[serde(default)]
    pub final_status: Option<ServiceStatus>,
    pub action_taken: ActionTaken,
    pub restart_outcome: RestartOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Bounded tail of the managed process output, captured on failed restarts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,
}

impl HealthCheckRecord {
    pub fn skipped(service: &str, trigger: Trigger, holder: Option<u32>) -> Self {
        Self {
            timestamp: Local::now(),
            service: service.to_string(),
            trigger,
            observed_status: None,
            final_status: None,
            action_taken: ActionTaken::Skipped,
            restart_outcome: RestartOutcome::NotAttempted,
            error: holder.map(|pid| format!("cycle guard held by pid {pid}")),
            diagnostics: vec![],
        }
    }

    /// The status query itself failed, so nothing was decided this cycle.
    pub fn unobserved(service: &str, trigger: Trigger, error: String) -> Self {
        Self {
            timestamp: Local::now(),
            service: service.to_string(),
            trigger,
            observed_status: None,
            final_status: None,
            action_taken: ActionTaken::None,
            restart_outcome: RestartOutcome::NotAttempted,
            error: Some(error),
            diagnostics: vec![],
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.restart_outcome == RestartOutcome::Failure
            || (self.observed_status.is_none() && self.action_taken == ActionTaken::None)
    }
}

// ---------------- Disk ----------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskUsageSample {
    pub timestamp: DateTime<Local>,
    pub used_percent: f64,
    pub free_bytes: u64,
    pub total_bytes: u64,
}

// ---------------- Retention ----------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactClass {
    Log,
    BacktestResult,
    Report,
    Backup,
}

impl ArtifactClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactClass::Log => "log",
            ArtifactClass::BacktestResult => "backtest_result",
            ArtifactClass::Report => "report",
            ArtifactClass::Backup => "backup",
        }
    }
}

impl fmt::Display for ArtifactClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum RetentionTrigger {
    /// Applies whenever cleanup runs.
    #[default]
    Always,
    /// Applies only when the pre-cleanup sample is at or above this percent.
    DiskUsageAbove(f64),
}

impl RetentionTrigger {
    pub fn matches(&self, used_percent: f64) -> bool {
        match *self {
            RetentionTrigger::Always => true,
            RetentionTrigger::DiskUsageAbove(threshold) => used_percent >= threshold,
        }
    }
}

impl fmt::Display for RetentionTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetentionTrigger::Always => f.write_str("always"),
            RetentionTrigger::DiskUsageAbove(t) => write!(f, "disk_usage_above({t})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetentionRule {
    pub class: ArtifactClass,
    pub max_age: Duration,
    pub trigger: RetentionTrigger,
}

// ---------------- Backup ----------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Config,
    State,
    Logs,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Config => "config",
            ArtifactKind::State => "state",
            ArtifactKind::Logs => "logs",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BackupOutcome {
    Copied { files: usize, bytes: u64 },
    SkippedMissing,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub timestamp: DateTime<Local>,
    pub artifact_kind: ArtifactKind,
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    pub outcome: BackupOutcome,
}

impl BackupRecord {
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, BackupOutcome::Failed { .. })
    }
}

// ---------------- Advisory ----------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyDriftReport {
    pub checked_at: DateTime<Local>,
    /// `None` when the check is disabled or the probe failed.
    pub outdated_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outdated: Vec<String>,
    /// `None` when no version-control root is configured or it could not be compared.
    pub vcs_behind: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commits_behind: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostUpdateReport {
    pub checked_at: DateTime<Local>,
    pub available_updates: Option<usize>,
    pub security_updates: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------- Maintenance ----------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskVerdict {
    /// Below the high-water mark; cleanup skipped.
    Ok,
    /// Cleanup ran and brought usage below the mark.
    Cleaned,
    /// Cleanup ran and usage is still at or above the mark. Needs an operator.
    StillOverThreshold,
    Failed,
}

impl DiskVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskVerdict::Ok => "disk OK",
            DiskVerdict::Cleaned => "cleaned",
            DiskVerdict::StillOverThreshold => "disk still over threshold",
            DiskVerdict::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupSummary {
    pub rules_applied: Vec<String>,
    pub deleted_files: usize,
    pub reclaimed_bytes: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskCheckReport {
    pub verdict: DiskVerdict,
    pub high_water_percent: f64,
    pub before: Option<DiskUsageSample>,
    pub after: Option<DiskUsageSample>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<CleanupSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub backups: Vec<BackupRecord>,
    pub disk: DiskCheckReport,
    pub drift: DependencyDriftReport,
    pub host_updates: HostUpdateReport,
}

impl MaintenanceReport {
    /// Backup failures and disk trouble need an operator; advisory probe errors do not.
    pub fn is_degraded(&self) -> bool {
        self.backups.iter().any(BackupRecord::is_failure)
            || matches!(
                self.disk.verdict,
                DiskVerdict::StillOverThreshold | DiskVerdict::Failed
            )
    }
}
