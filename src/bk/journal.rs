use crate::bk::model::HealthCheckRecord;
use anyhow::Context as _;
use chrono::Local;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const HEALTH_LOG: &str = "health.log";
pub const MAINTENANCE_LOG: &str = "maintenance.log";

pub const TS_FORMAT: &str = "%Y-%m-%d_%H:%M:%S%.3f";

/// Cap on how far back a tail reads (~4 MiB).
const TAIL_MAX_CHUNKS: usize = 512;
const TAIL_CHUNK: u64 = 8192;

pub fn timestamp() -> String {
    Local::now().format(TS_FORMAT).to_string()
}

/// Append-only, line-oriented logs under `logs_dir`.
///
/// Every line is `"<ts> [<component>] <body>"`. Health records put their JSON in the body so the
/// report can read history back from the log alone.
#[derive(Debug, Clone)]
pub struct Journal {
    logs_dir: PathBuf,
}

impl Journal {
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
        }
    }

    pub fn health_path(&self) -> PathBuf {
        self.logs_dir.join(HEALTH_LOG)
    }

    pub fn maintenance_path(&self) -> PathBuf {
        self.logs_dir.join(MAINTENANCE_LOG)
    }

    pub fn append_record(&self, rec: &HealthCheckRecord) -> anyhow::Result<()> {
        let body = serde_json::to_string(rec).context("serialize health record")?;
        let line = format!("{} [health] {body}", rec.timestamp.format(TS_FORMAT));
        append_line(&self.health_path(), &line)
    }

    /// Plain event line in the health log (fatal conditions that produce no record).
    pub fn health_event(&self, msg: impl AsRef<str>) -> anyhow::Result<()> {
        let line = format!("{} [health] {}", timestamp(), msg.as_ref());
        tracing::warn!(target: "botkeeper::health", "{}", msg.as_ref());
        append_line(&self.health_path(), &line)
    }

    pub fn maintenance_event(&self, step: &str, msg: impl AsRef<str>) -> anyhow::Result<()> {
        let line = format!("{} [{step}] {}", timestamp(), msg.as_ref());
        tracing::info!(target: "botkeeper::maintenance", step, "{}", msg.as_ref());
        append_line(&self.maintenance_path(), &line)
    }

    /// Most recent `n` health records, oldest first. Non-record lines are ignored.
    pub fn recent_records(&self, n: usize) -> anyhow::Result<Vec<HealthCheckRecord>> {
        if n == 0 {
            return Ok(vec![]);
        }
        let path = self.health_path();
        if !path.exists() {
            return Ok(vec![]);
        }
        tail_matching(&path, n, parse_record_line)
    }

    pub fn recent_maintenance_lines(&self, n: usize) -> anyhow::Result<Vec<String>> {
        let path = self.maintenance_path();
        if !path.exists() {
            return Ok(vec![]);
        }
        tail_lines(&path, n)
    }
}

pub fn parse_record_line(line: &str) -> Option<HealthCheckRecord> {
    let (_, body) = line.split_once("] ")?;
    if !body.starts_with('{') {
        return None;
    }
    serde_json::from_str(body).ok()
}

/// Writes one full line with a single `write_all` on an O_APPEND handle.
pub fn append_line(path: &Path, line: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create log dir {}", parent.display()))?;
    }
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open log {}", path.display()))?;
    let mut s = line.trim_end_matches('\n').to_string();
    s.push('\n');
    f.write_all(s.as_bytes())
        .with_context(|| format!("append to {}", path.display()))?;
    Ok(())
}

/// Last `n` lines of a file, read backwards in chunks.
pub fn tail_lines(path: &Path, n: usize) -> anyhow::Result<Vec<String>> {
    tail_matching(path, n, |line| Some(line.to_string()))
}

/// Last `n` lines that `pick` accepts, oldest first.
///
/// Reads backwards chunk by chunk until enough lines matched or the start of the file is reached,
/// so a long run of unmatched lines at the end does not hide older matches. Bounded by
/// `TAIL_MAX_CHUNKS`.
pub fn tail_matching<T>(path: &Path, n: usize, mut pick: impl FnMut(&str) -> Option<T>) -> anyhow::Result<Vec<T>> {
    if n == 0 {
        return Ok(vec![]);
    }
    let mut f = OpenOptions::new().read(true).open(path)?;
    let mut pos = f.metadata()?.len();

    let mut found: Vec<T> = Vec::new();
    // Bytes of the line that straddles the boundary with the region not yet read.
    let mut partial: Vec<u8> = Vec::new();
    let mut chunks = 0;
    while pos > 0 && found.len() < n && chunks < TAIL_MAX_CHUNKS {
        let read_size = std::cmp::min(TAIL_CHUNK, pos) as usize;
        pos -= read_size as u64;
        f.seek(SeekFrom::Start(pos))?;
        let mut buf = vec![0u8; read_size];
        f.read_exact(&mut buf)?;
        buf.extend_from_slice(&partial);
        chunks += 1;

        let complete_from = if pos == 0 {
            0
        } else {
            match buf.iter().position(|&b| b == b'\n') {
                Some(i) => i + 1,
                None => {
                    partial = buf;
                    continue;
                }
            }
        };
        let text = String::from_utf8_lossy(&buf[complete_from..]);
        for line in text.split_terminator('\n').rev() {
            if let Some(item) = pick(line) {
                found.push(item);
                if found.len() == n {
                    break;
                }
            }
        }
        partial = buf[..complete_from.saturating_sub(1)].to_vec();
    }
    found.reverse();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bk::model::{ActionTaken, RestartOutcome, ServiceStatus, Trigger};

    fn record(status: ServiceStatus) -> HealthCheckRecord {
        HealthCheckRecord {
            timestamp: Local::now(),
            service: "bot".to_string(),
            trigger: Trigger::Scheduled,
            observed_status: Some(status),
            final_status: Some(status),
            action_taken: ActionTaken::None,
            restart_outcome: RestartOutcome::NotAttempted,
            error: None,
            diagnostics: vec![],
        }
    }

    #[test]
    fn records_round_trip_through_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let j = Journal::new(dir.path().join("logs"));
        j.append_record(&record(ServiceStatus::Running)).unwrap();
        j.health_event("fatal: service controller unavailable").unwrap();
        j.append_record(&record(ServiceStatus::Down)).unwrap();

        let recs = j.recent_records(5).unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[1].observed_status, Some(ServiceStatus::Down));

        let raw = fs::read_to_string(j.health_path()).unwrap();
        assert_eq!(raw.lines().count(), 3);
        assert!(raw.lines().all(|l| l.contains(" [health] ")));
    }

    #[test]
    fn recent_records_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let j = Journal::new(dir.path());
        for _ in 0..5 {
            j.append_record(&record(ServiceStatus::Running)).unwrap();
        }
        j.append_record(&record(ServiceStatus::Down)).unwrap();
        let recs = j.recent_records(3).unwrap();
        assert_eq!(recs.len(), 3);
        assert_eq!(recs[2].observed_status, Some(ServiceStatus::Down));
    }

    #[test]
    fn records_survive_a_long_run_of_fatal_events() {
        let dir = tempfile::tempdir().unwrap();
        let j = Journal::new(dir.path());
        j.append_record(&record(ServiceStatus::Down)).unwrap();
        j.append_record(&record(ServiceStatus::Running)).unwrap();
        j.append_record(&record(ServiceStatus::Running)).unwrap();
        for _ in 0..30 {
            j.health_event("fatal: service controller unavailable: systemctl not found on PATH")
                .unwrap();
        }
        let recs = j.recent_records(3).unwrap();
        assert_eq!(recs.len(), 3);
        assert_eq!(recs[0].observed_status, Some(ServiceStatus::Down));

        // Enough events to push the records several chunks back.
        for _ in 0..2000 {
            j.health_event("fatal: service controller unavailable").unwrap();
        }
        assert_eq!(j.recent_records(3).unwrap().len(), 3);
        assert_eq!(j.recent_records(10).unwrap().len(), 3);
    }

    #[test]
    fn missing_log_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let j = Journal::new(dir.path().join("nope"));
        assert!(j.recent_records(3).unwrap().is_empty());
        assert!(j.recent_maintenance_lines(3).unwrap().is_empty());
    }

    #[test]
    fn tail_spans_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("big.log");
        let mut body = String::new();
        for i in 0..5000 {
            body.push_str(&format!("line-{i}\n"));
        }
        fs::write(&p, body).unwrap();
        let t = tail_lines(&p, 3).unwrap();
        assert_eq!(t, vec!["line-4997", "line-4998", "line-4999"]);
        assert_eq!(tail_lines(&p, 4000).unwrap().len(), 4000);
        let all = tail_lines(&p, 10_000).unwrap();
        assert_eq!(all.len(), 5000);
        assert_eq!(all[0], "line-0");
    }

    #[test]
    fn maintenance_events_are_timestamp_prefixed() {
        let dir = tempfile::tempdir().unwrap();
        let j = Journal::new(dir.path());
        j.maintenance_event("disk", "disk OK used=41.0%").unwrap();
        let lines = j.recent_maintenance_lines(10).unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("[disk] disk OK used=41.0%"));
        assert_eq!(lines[0].split_once(' ').unwrap().0.len(), "2026-01-01_00:00:00.000".len());
    }
}
