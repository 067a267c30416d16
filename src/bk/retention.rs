use crate::bk::model::{ArtifactClass, CleanupSummary, RetentionRule};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Rules whose trigger matches the pre-cleanup usage sample.
pub fn matching_rules(rules: &[RetentionRule], used_percent: f64) -> Vec<&RetentionRule> {
    rules.iter().filter(|r| r.trigger.matches(used_percent)).collect()
}

/// Deletes files strictly older than each matching rule's `max_age`, scoped to that rule's
/// artifact directories. Files in `protected` are never touched.
///
/// Age is measured from mtime. A file whose mtime cannot be read is kept.
pub fn apply_rules(
    rules: &[&RetentionRule],
    artifact_dirs: &BTreeMap<ArtifactClass, Vec<PathBuf>>,
    protected: &[PathBuf],
    now: SystemTime,
) -> CleanupSummary {
    let mut summary = CleanupSummary::default();
    for rule in rules {
        summary
            .rules_applied
            .push(format!("{}>{}d", rule.class, rule.max_age.as_secs() / 86_400));
        let Some(dirs) = artifact_dirs.get(&rule.class) else {
            continue;
        };
        let cutoff = now.checked_sub(rule.max_age).unwrap_or(SystemTime::UNIX_EPOCH);
        for dir in dirs {
            if !dir.exists() {
                continue;
            }
            purge_older_than(dir, cutoff, protected, &mut summary, true);
        }
    }
    summary
}

fn purge_older_than(dir: &Path, cutoff: SystemTime, protected: &[PathBuf], summary: &mut CleanupSummary, root: bool) {
    let rd = match fs::read_dir(dir) {
        Ok(r) => r,
        Err(e) => {
            summary.failures.push(format!("read_dir {}: {e}", dir.display()));
            return;
        }
    };
    for entry in rd.flatten() {
        let p = entry.path();
        if protected.iter().any(|x| x == &p) {
            continue;
        }
        // symlink_metadata: never follow links out of the artifact tree.
        let Ok(meta) = fs::symlink_metadata(&p) else { continue };
        if meta.is_dir() {
            purge_older_than(&p, cutoff, protected, summary, false);
            continue;
        }
        let Ok(mtime) = meta.modified() else { continue };
        if mtime >= cutoff {
            continue;
        }
        match fs::remove_file(&p) {
            Ok(()) => {
                summary.deleted_files += 1;
                summary.reclaimed_bytes += meta.len();
                tracing::debug!(path = %p.display(), "retention removed");
            }
            Err(e) => summary.failures.push(format!("remove {}: {e}", p.display())),
        }
    }
    // Date partitions left empty by the pass above go too; the configured root stays.
    if !root && is_empty_dir(dir) {
        let _ = fs::remove_dir(dir);
    }
}

fn is_empty_dir(dir: &Path) -> bool {
    fs::read_dir(dir).map(|mut rd| rd.next().is_none()).unwrap_or(false)
}

/// Age of a file relative to `now`; `None` for future mtimes.
pub fn age_of(path: &Path, now: SystemTime) -> Option<Duration> {
    let mtime = fs::metadata(path).ok()?.modified().ok()?;
    now.duration_since(mtime).ok()
}
