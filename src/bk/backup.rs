use crate::bk::config::KeeperConfig;
use crate::bk::model::{ArtifactKind, BackupOutcome, BackupRecord};
use crate::bk::retention::age_of;
use anyhow::Context as _;
use chrono::{DateTime, Local};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Copies config, state and recent logs into a fresh `backups/<date>/<time>/` partition.
///
/// Never overwrites or deletes an existing partition. Every configured source yields exactly one
/// record; if the partition itself cannot be created, every present source is recorded as failed.
pub fn run_backups(cfg: &KeeperConfig, now: DateTime<Local>) -> Vec<BackupRecord> {
    let sources: Vec<(ArtifactKind, &PathBuf)> = cfg
        .backup
        .config
        .iter()
        .map(|p| (ArtifactKind::Config, p))
        .chain(cfg.backup.state.iter().map(|p| (ArtifactKind::State, p)))
        .chain(cfg.backup.logs.iter().map(|p| (ArtifactKind::Logs, p)))
        .collect();

    // Created on the first present source, so an all-missing run leaves no empty partition.
    let mut partition: Option<Result<PathBuf, String>> = None;
    let now_sys = SystemTime::from(now);

    let mut records = Vec::with_capacity(sources.len());
    for (kind, src) in sources {
        let base = BackupRecord {
            timestamp: Local::now(),
            artifact_kind: kind,
            source_path: src.clone(),
            destination_path: PathBuf::new(),
            outcome: BackupOutcome::SkippedMissing,
        };
        if !src.exists() {
            records.push(base);
            continue;
        }
        let part = partition
            .get_or_insert_with(|| create_partition(&cfg.paths.backups_dir, now).map_err(|e| format!("{e:#}")));
        let part = match part {
            Ok(p) => p,
            Err(e) => {
                records.push(BackupRecord {
                    destination_path: cfg.paths.backups_dir.clone(),
                    outcome: BackupOutcome::Failed { error: e.clone() },
                    ..base
                });
                continue;
            }
        };
        let lookback = (kind == ArtifactKind::Logs).then_some(cfg.backup.logs_lookback);
        let dest = unique_dest(&part.join(kind.as_str()), src);
        let outcome = match copy_source(src, &dest, lookback, &cfg.paths.backups_dir, now_sys) {
            Ok((files, bytes)) => BackupOutcome::Copied { files, bytes },
            Err(e) => BackupOutcome::Failed {
                error: format!("{e:#}"),
            },
        };
        records.push(BackupRecord {
            destination_path: dest,
            outcome,
            ..base
        });
    }
    records
}

fn create_partition(backups_dir: &Path, now: DateTime<Local>) -> anyhow::Result<PathBuf> {
    let day = backups_dir.join(now.format("%Y-%m-%d").to_string());
    fs::create_dir_all(&day).with_context(|| format!("create backup dir {}", day.display()))?;
    let stem = now.format("%H%M%S").to_string();
    for n in 0..1000u32 {
        let candidate = if n == 0 {
            day.join(&stem)
        } else {
            day.join(format!("{stem}-{n}"))
        };
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e).with_context(|| format!("create partition {}", candidate.display())),
        }
    }
    anyhow::bail!("no free backup partition under {}", day.display())
}

/// Destination for `src` under `kind_dir`, suffixed if two sources share a file name.
fn unique_dest(kind_dir: &Path, src: &Path) -> PathBuf {
    let name = src
        .file_name()
        .map(|s| s.to_os_string())
        .unwrap_or_else(|| "root".into());
    let first = kind_dir.join(&name);
    if !first.exists() {
        return first;
    }
    (1..)
        .map(|i| {
            let mut n = name.clone();
            n.push(format!(".{i}"));
            kind_dir.join(n)
        })
        .find(|p| !p.exists())
        .unwrap_or(first)
}

fn copy_source(
    src: &Path,
    dest: &Path,
    lookback: Option<Duration>,
    backups_dir: &Path,
    now: SystemTime,
) -> anyhow::Result<(usize, u64)> {
    let meta = fs::metadata(src).with_context(|| format!("stat {}", src.display()))?;
    if meta.is_file() {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let bytes = fs::copy(src, dest).with_context(|| format!("copy {} -> {}", src.display(), dest.display()))?;
        return Ok((1, bytes));
    }

    let mut files = 0usize;
    let mut bytes = 0u64;
    copy_tree(src, dest, lookback, backups_dir, now, &mut files, &mut bytes)?;
    Ok((files, bytes))
}

fn copy_tree(
    src: &Path,
    dest: &Path,
    lookback: Option<Duration>,
    backups_dir: &Path,
    now: SystemTime,
    files: &mut usize,
    bytes: &mut u64,
) -> anyhow::Result<()> {
    fs::create_dir_all(dest).with_context(|| format!("create {}", dest.display()))?;
    for entry in fs::read_dir(src).with_context(|| format!("read_dir {}", src.display()))? {
        let entry = entry?;
        let p = entry.path();
        // Never back up the backup tree into itself.
        if p.starts_with(backups_dir) {
            continue;
        }
        let ft = entry.file_type()?;
        if ft.is_dir() {
            copy_tree(&p, &dest.join(entry.file_name()), lookback, backups_dir, now, files, bytes)?;
        } else if ft.is_file() {
            if let Some(window) = lookback {
                match age_of(&p, now) {
                    Some(age) if age > window => continue,
                    _ => {}
                }
            }
            let target = dest.join(entry.file_name());
            *bytes += fs::copy(&p, &target).with_context(|| format!("copy {} -> {}", p.display(), target.display()))?;
            *files += 1;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(root: &Path) -> KeeperConfig {
        let mut cfg = KeeperConfig::defaults("bot", root);
        cfg.backup.config = vec![root.join("config.yaml")];
        cfg.backup.state = vec![root.join("data/state.json"), root.join("data/missing.db")];
        cfg
    }

    fn seed(root: &Path) {
        fs::create_dir_all(root.join("data")).unwrap();
        fs::create_dir_all(root.join("logs")).unwrap();
        fs::write(root.join("config.yaml"), "service:\n  name: bot\n").unwrap();
        fs::write(root.join("data/state.json"), "{\"positions\":[]}").unwrap();
        fs::write(root.join("logs/bot.log"), "started\n").unwrap();
        let old = root.join("logs/bot.log.1");
        fs::write(&old, "ancient\n").unwrap();
        fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(10 * 86_400))
            .unwrap();
    }

    #[test]
    fn copies_present_sources_and_skips_missing() {
        let tmp = tempfile::tempdir().unwrap();
        seed(tmp.path());
        let records = run_backups(&cfg(tmp.path()), Local::now());
        assert_eq!(records.len(), 4);

        let by_src = |s: &str| records.iter().find(|r| r.source_path.ends_with(s)).unwrap();
        assert_eq!(by_src("config.yaml").outcome, BackupOutcome::Copied { files: 1, bytes: 21 });
        assert_eq!(by_src("missing.db").outcome, BackupOutcome::SkippedMissing);
        // Only the log modified within the lookback window is copied.
        let logs = by_src("logs");
        assert!(matches!(logs.outcome, BackupOutcome::Copied { files: 1, .. }));
        assert!(logs.destination_path.join("bot.log").exists());
        assert!(!logs.destination_path.join("bot.log.1").exists());

        let state = by_src("state.json");
        assert!(state.destination_path.starts_with(tmp.path().join("backups")));
        assert_eq!(fs::read_to_string(&state.destination_path).unwrap(), "{\"positions\":[]}");
    }

    #[test]
    fn second_run_gets_a_fresh_partition() {
        let tmp = tempfile::tempdir().unwrap();
        seed(tmp.path());
        let c = cfg(tmp.path());
        let now = Local::now();
        let first = run_backups(&c, now);
        let second = run_backups(&c, now);
        let dest = |rs: &[BackupRecord]| {
            rs.iter()
                .find(|r| r.artifact_kind == ArtifactKind::Config)
                .unwrap()
                .destination_path
                .clone()
        };
        assert_ne!(dest(&first), dest(&second));
        assert!(dest(&first).exists());
        assert_eq!(fs::read(dest(&first)).unwrap(), fs::read(dest(&second)).unwrap());
    }

    #[test]
    fn unwritable_destination_marks_every_present_source_failed() {
        let tmp = tempfile::tempdir().unwrap();
        seed(tmp.path());
        let mut c = cfg(tmp.path());
        // A regular file where a directory is needed fails even for root.
        fs::write(tmp.path().join("blocker"), "").unwrap();
        c.paths.backups_dir = tmp.path().join("blocker/backups");

        let records = run_backups(&c, Local::now());
        assert_eq!(records.len(), 4);
        assert_eq!(records.iter().filter(|r| r.is_failure()).count(), 3);
        assert!(records
            .iter()
            .any(|r| r.outcome == BackupOutcome::SkippedMissing && r.source_path.ends_with("missing.db")));
    }

    #[test]
    fn all_sources_missing_creates_no_partition() {
        let tmp = tempfile::tempdir().unwrap();
        let records = run_backups(&cfg(tmp.path()), Local::now());
        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|r| r.outcome == BackupOutcome::SkippedMissing));
        assert!(!tmp.path().join("backups").exists());
    }

    #[test]
    fn present_sources_share_one_partition() {
        let tmp = tempfile::tempdir().unwrap();
        seed(tmp.path());
        let records = run_backups(&cfg(tmp.path()), Local::now());
        let day_dirs: Vec<_> = fs::read_dir(tmp.path().join("backups")).unwrap().flatten().collect();
        assert_eq!(day_dirs.len(), 1);
        assert_eq!(fs::read_dir(day_dirs[0].path()).unwrap().count(), 1);
        assert_eq!(records.iter().filter(|r| matches!(r.outcome, BackupOutcome::Copied { .. })).count(), 3);
    }

    #[test]
    fn colliding_names_do_not_overwrite() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("a")).unwrap();
        fs::create_dir_all(tmp.path().join("b")).unwrap();
        fs::write(tmp.path().join("a/state.json"), "A").unwrap();
        fs::write(tmp.path().join("b/state.json"), "B").unwrap();
        let mut c = KeeperConfig::defaults("bot", tmp.path());
        c.backup.logs = vec![];
        c.backup.state = vec![tmp.path().join("a/state.json"), tmp.path().join("b/state.json")];
        let records = run_backups(&c, Local::now());
        assert_ne!(records[0].destination_path, records[1].destination_path);
        assert_eq!(fs::read_to_string(&records[1].destination_path).unwrap(), "B");
    }
}
