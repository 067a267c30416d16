use crate::bk::config::KeeperConfig;
use crate::bk::controller::ServiceController;
use crate::bk::disk::{fmt_bytes, DiskProbe};
use crate::bk::journal::{Journal, TS_FORMAT};
use crate::bk::model::{DiskUsageSample, HealthCheckRecord, ServiceStatus};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

const RECENT_CHECKS: usize = 3;
const MAINTENANCE_TAIL: usize = 8;
/// How far back the health log is scanned to find the start of the current running streak.
const UPTIME_SCAN: usize = 2000;

/// Point-in-time view for an operator. Building it never changes anything.
#[derive(Debug, Clone, Serialize)]
pub struct HumanReadableReport {
    pub generated_at: DateTime<Local>,
    pub service: String,
    /// `None` when the controller could not be queried; see `status_error`.
    pub status: Option<ServiceStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_error: Option<String>,
    pub running_since: Option<DateTime<Local>>,
    pub uptime_ms: Option<i64>,
    pub recent_checks: Vec<HealthCheckRecord>,
    pub disk: Option<DiskUsageSample>,
    pub high_water_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_error: Option<String>,
    /// Activity lines in the configured window, when an activity dir is configured.
    pub recent_activity: Option<usize>,
    pub maintenance_tail: Vec<String>,
}

pub struct Inspector {
    cfg: Arc<KeeperConfig>,
    controller: Arc<dyn ServiceController>,
    disk: Arc<dyn DiskProbe>,
    journal: Journal,
}

impl Inspector {
    pub fn new(cfg: Arc<KeeperConfig>, controller: Arc<dyn ServiceController>, disk: Arc<dyn DiskProbe>) -> Self {
        let journal = Journal::new(&cfg.paths.logs_dir);
        Self {
            cfg,
            controller,
            disk,
            journal,
        }
    }

    pub async fn summarize(&self) -> anyhow::Result<HumanReadableReport> {
        let name = self.cfg.service.name.as_str();
        let now = Local::now();

        let (status, status_error) = match self.controller.is_active(name).await {
            Ok(active) => (Some(ServiceStatus::from_active(active)), None),
            Err(e) => (None, Some(e.to_string())),
        };

        let running_since = if status == Some(ServiceStatus::Running) {
            match self.controller.active_since(name).await {
                Ok(Some(ts)) => Some(ts),
                Ok(None) => running_since_from_log(&self.journal.recent_records(UPTIME_SCAN)?),
                Err(e) => {
                    tracing::debug!(error = %e, "active_since unavailable; using health log");
                    running_since_from_log(&self.journal.recent_records(UPTIME_SCAN)?)
                }
            }
        } else {
            None
        };
        let uptime_ms = running_since.map(|ts| (now - ts).num_milliseconds());

        let (disk, disk_error) = match self.disk.sample(&self.cfg.disk.path) {
            Ok(s) => (Some(s), None),
            Err(e) => (None, Some(format!("{e:#}"))),
        };

        let recent_activity = self
            .cfg
            .paths
            .activity_dir
            .as_deref()
            .map(|dir| count_activity(dir, self.cfg.paths.activity_window, SystemTime::now()));

        Ok(HumanReadableReport {
            generated_at: now,
            service: name.to_string(),
            status,
            status_error,
            running_since,
            uptime_ms,
            recent_checks: self.journal.recent_records(RECENT_CHECKS)?,
            disk,
            high_water_percent: self.cfg.disk.high_water_percent,
            disk_error,
            recent_activity,
            maintenance_tail: self.journal.recent_maintenance_lines(MAINTENANCE_TAIL)?,
        })
    }
}

/// Timestamp of the earliest record in the newest unbroken run of RUNNING outcomes.
/// Skipped cycles observed nothing and neither extend nor break the run.
pub fn running_since_from_log(records: &[HealthCheckRecord]) -> Option<DateTime<Local>> {
    let mut since = None;
    for rec in records.iter().rev() {
        match rec.final_status {
            None => continue,
            Some(ServiceStatus::Running) => since = Some(rec.timestamp),
            Some(_) => break,
        }
    }
    since
}

/// Non-empty lines across files in `dir` modified within `window` of `now`.
/// A missing or unreadable dir counts as zero.
pub fn count_activity(dir: &Path, window: std::time::Duration, now: SystemTime) -> usize {
    let Ok(rd) = fs::read_dir(dir) else { return 0 };
    let cutoff = now.checked_sub(window).unwrap_or(SystemTime::UNIX_EPOCH);
    rd.flatten()
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter(|e| {
            e.metadata()
                .and_then(|m| m.modified())
                .map(|t| t >= cutoff)
                .unwrap_or(false)
        })
        .filter_map(|e| fs::File::open(e.path()).ok())
        .map(count_non_empty_lines)
        .sum()
}

/// Streams the file; a read error ends the count for that file.
fn count_non_empty_lines(file: fs::File) -> usize {
    BufReader::new(file)
        .split(b'\n')
        .map_while(Result::ok)
        .filter(|line| !line.trim_ascii().is_empty())
        .count()
}

impl HumanReadableReport {
    pub fn render_text(&self) -> String {
        let mut out = format!(
            "{} at {}\n",
            self.service,
            self.generated_at.format(TS_FORMAT)
        );

        let status = match (&self.status, &self.status_error) {
            (Some(s), _) => s.as_str().to_string(),
            (None, Some(e)) => format!("UNKNOWN ({e})"),
            (None, None) => "UNKNOWN".to_string(),
        };
        let uptime = self.uptime_ms.map(fmt_uptime_ms).unwrap_or_else(|| "-".to_string());
        let disk = match (&self.disk, &self.disk_error) {
            (Some(d), _) => format!(
                "{:.1}% used, {} free (mark {}%)",
                d.used_percent,
                fmt_bytes(d.free_bytes),
                self.high_water_percent
            ),
            (None, Some(e)) => format!("unavailable ({e})"),
            (None, None) => "-".to_string(),
        };
        let activity = self
            .recent_activity
            .map(|n| n.to_string())
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&table(
            &["service", "status", "uptime", "disk", "activity"],
            &[vec![self.service.clone(), status, uptime, disk, activity]],
        ));

        out.push_str("\nrecent checks:\n");
        if self.recent_checks.is_empty() {
            out.push_str("(no checks recorded)\n");
        } else {
            let rows: Vec<Vec<String>> = self
                .recent_checks
                .iter()
                .rev()
                .map(|r| {
                    vec![
                        r.timestamp.format(TS_FORMAT).to_string(),
                        r.trigger.as_str().to_string(),
                        r.observed_status.map(|s| s.as_str()).unwrap_or("-").to_string(),
                        r.action_taken.as_str().to_string(),
                        r.restart_outcome.as_str().to_string(),
                        r.final_status.map(|s| s.as_str()).unwrap_or("-").to_string(),
                        r.error.clone().unwrap_or_else(|| "-".to_string()),
                    ]
                })
                .collect();
            out.push_str(&table(
                &["time", "trigger", "observed", "action", "outcome", "final", "error"],
                &rows,
            ));
        }

        out.push_str("\nmaintenance:\n");
        if self.maintenance_tail.is_empty() {
            out.push_str("(no maintenance runs recorded)\n");
        }
        for line in &self.maintenance_tail {
            out.push_str("  ");
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

fn pad(s: &str, width: usize) -> String {
    let len = s.chars().count();
    if len >= width {
        return s.to_string();
    }
    let mut out = String::with_capacity(width);
    out.push_str(s);
    out.push_str(&" ".repeat(width - len));
    out
}

fn border(widths: &[usize]) -> String {
    let mut out = String::from("+");
    for w in widths {
        // 1 leading + 1 trailing padding space per cell.
        out.push_str(&"-".repeat(w + 2));
        out.push('+');
    }
    out
}

fn row_line(cols: &[String], widths: &[usize]) -> String {
    let mut out = String::from("|");
    for (i, w) in widths.iter().enumerate() {
        let v = cols.get(i).map(|s| s.as_str()).unwrap_or("");
        out.push(' ');
        out.push_str(&pad(v, *w));
        out.push_str(" |");
    }
    out
}

fn table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for r in rows {
        for (i, c) in r.iter().enumerate() {
            if let Some(w) = widths.get_mut(i) {
                *w = (*w).max(c.chars().count());
            }
        }
    }
    let top = border(&widths);
    let header: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
    let mut out = String::new();
    for line in [&top, &row_line(&header, &widths), &top] {
        out.push_str(line);
        out.push('\n');
    }
    for r in rows {
        out.push_str(&row_line(r, &widths));
        out.push('\n');
    }
    out.push_str(&top);
    out.push('\n');
    out
}

pub fn fmt_uptime_ms(ms: i64) -> String {
    if ms < 0 {
        return "-".to_string();
    }
    let mut s = (ms as u64 + 500) / 1000;
    let days = s / 86_400;
    s %= 86_400;
    let hours = s / 3_600;
    s %= 3_600;
    let mins = s / 60;
    let secs = s % 60;
    if days > 0 {
        format!("{days}d{hours:02}h")
    } else if hours > 0 {
        format!("{hours}h{mins:02}m")
    } else if mins > 0 {
        format!("{mins}m{secs:02}s")
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bk::controller::testing::ScriptedController;
    use crate::bk::disk::testing::ScriptedDisk;
    use crate::bk::model::{ActionTaken, RestartOutcome, Trigger};
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    fn rec(ago_min: i64, final_status: Option<ServiceStatus>, action: ActionTaken) -> HealthCheckRecord {
        HealthCheckRecord {
            timestamp: Local::now() - ChronoDuration::minutes(ago_min),
            service: "trading-bot".to_string(),
            trigger: Trigger::Scheduled,
            observed_status: final_status,
            final_status,
            action_taken: action,
            restart_outcome: RestartOutcome::NotAttempted,
            error: None,
            diagnostics: vec![],
        }
    }

    #[test]
    fn uptime_starts_at_the_latest_running_streak() {
        let records = vec![
            rec(60, Some(ServiceStatus::Running), ActionTaken::None),
            rec(50, Some(ServiceStatus::RestartFailed), ActionTaken::Restart),
            rec(40, Some(ServiceStatus::Running), ActionTaken::Restart),
            rec(35, None, ActionTaken::Skipped),
            rec(30, Some(ServiceStatus::Running), ActionTaken::None),
        ];
        assert_eq!(running_since_from_log(&records), Some(records[2].timestamp));
        assert_eq!(running_since_from_log(&records[..2]), None);
        assert_eq!(running_since_from_log(&[]), None);
    }

    #[test]
    fn activity_counts_recent_non_empty_lines() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("trades.log"), "buy\n\nsell\n").unwrap();
        let old = dir.path().join("old.log");
        fs::write(&old, "a\nb\nc\n").unwrap();
        fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(3 * 86_400))
            .unwrap();
        let n = count_activity(dir.path(), Duration::from_secs(86_400), SystemTime::now());
        assert_eq!(n, 2);
        assert_eq!(count_activity(&dir.path().join("missing"), Duration::from_secs(1), SystemTime::now()), 0);
    }

    #[test]
    fn activity_streams_large_and_unterminated_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut big = String::new();
        for i in 0..20_000 {
            big.push_str(&format!("fill {i} qty=1\n"));
            if i % 4 == 0 {
                big.push_str("   \n");
            }
        }
        fs::write(dir.path().join("fills.log"), big).unwrap();
        // Last line has no newline; invalid UTF-8 still counts as a line.
        fs::write(dir.path().join("signals.log"), b"long\n\xff\xfe short\nflat").unwrap();
        let n = count_activity(dir.path(), Duration::from_secs(86_400), SystemTime::now());
        assert_eq!(n, 20_000 + 3);
    }

    #[test]
    fn uptime_formatting() {
        assert_eq!(fmt_uptime_ms(-1), "-");
        assert_eq!(fmt_uptime_ms(4_400), "4s");
        assert_eq!(fmt_uptime_ms(125_000), "2m05s");
        assert_eq!(fmt_uptime_ms(2 * 86_400_000 + 3 * 3_600_000), "2d03h");
    }

    #[test]
    fn table_aligns_columns() {
        let t = table(&["a", "bb"], &[vec!["xyz".to_string(), "1".to_string()]]);
        let lines: Vec<&str> = t.lines().collect();
        assert_eq!(lines[0], "+-----+----+");
        assert_eq!(lines[1], "| a   | bb |");
        assert_eq!(lines[3], "| xyz | 1  |");
        assert!(lines.iter().all(|l| l.len() == lines[0].len()));
    }

    #[tokio::test]
    async fn summary_is_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = KeeperConfig::defaults("trading-bot", dir.path());
        cfg.paths.activity_dir = Some(dir.path().join("activity"));
        let cfg = Arc::new(cfg);

        let journal = Journal::new(&cfg.paths.logs_dir);
        for ago in [20, 15, 10, 5] {
            journal
                .append_record(&rec(ago, Some(ServiceStatus::Running), ActionTaken::None))
                .unwrap();
        }
        journal.maintenance_event("disk", "disk OK used=41.0%").unwrap();
        let health_before = fs::read(journal.health_path()).unwrap();

        // Down: the report must show it, never act on it.
        let ctl = Arc::new(ScriptedController::new(&[false]));
        let inspector = Inspector::new(cfg.clone(), ctl.clone(), Arc::new(ScriptedDisk::new(&[55.0])));
        let report = inspector.summarize().await.unwrap();

        assert_eq!(ctl.restart_count(), 0);
        assert_eq!(fs::read(journal.health_path()).unwrap(), health_before);
        assert_eq!(report.status, Some(ServiceStatus::Down));
        assert_eq!(report.uptime_ms, None);
        assert_eq!(report.recent_checks.len(), 3);
        assert_eq!(report.recent_activity, Some(0));
        assert_eq!(report.maintenance_tail.len(), 1);

        let text = report.render_text();
        assert!(text.contains("| DOWN "));
        assert!(text.contains("55.0% used"));
        assert!(text.contains("[disk] disk OK used=41.0%"));

        let json: serde_json::Value = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "DOWN");
        assert_eq!(json["recent_checks"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn running_uptime_falls_back_to_health_log() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Arc::new(KeeperConfig::defaults("trading-bot", dir.path()));
        let journal = Journal::new(&cfg.paths.logs_dir);
        journal
            .append_record(&rec(90, Some(ServiceStatus::Running), ActionTaken::Restart))
            .unwrap();
        journal
            .append_record(&rec(85, Some(ServiceStatus::Running), ActionTaken::None))
            .unwrap();

        let inspector = Inspector::new(
            cfg,
            Arc::new(ScriptedController::new(&[true])),
            Arc::new(ScriptedDisk::failing()),
        );
        let report = inspector.summarize().await.unwrap();
        let up = report.uptime_ms.unwrap();
        assert!((90 * 60_000 - 5_000..=90 * 60_000 + 60_000).contains(&up));
        assert!(report.disk_error.is_some());
        assert!(report.render_text().contains("1h30m"));
    }

    #[tokio::test]
    async fn unreachable_controller_is_shown_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Arc::new(KeeperConfig::defaults("trading-bot", dir.path()));
        let inspector = Inspector::new(
            cfg,
            Arc::new(ScriptedController::new(&[true]).unavailable()),
            Arc::new(ScriptedDisk::new(&[10.0])),
        );
        let report = inspector.summarize().await.unwrap();
        assert_eq!(report.status, None);
        assert!(report.render_text().contains("UNKNOWN (service controller unavailable"));
    }
}
