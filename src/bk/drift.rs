use crate::bk::config::{DriftConfig, HostUpdatesConfig};
use crate::bk::exec::{self, CommandOutput};
use crate::bk::model::{DependencyDriftReport, HostUpdateReport};
use chrono::Local;
use std::path::Path;
use std::time::Duration;

/// Names listed in the report; the count is always complete.
const MAX_LISTED: usize = 20;

/// Outdated dependencies plus local-vs-upstream revision. Never changes anything.
pub async fn check_dependency_drift(cfg: &DriftConfig, cwd: &Path, timeout: Duration) -> DependencyDriftReport {
    let mut report = DependencyDriftReport {
        checked_at: Local::now(),
        outdated_count: None,
        outdated: vec![],
        vcs_behind: None,
        commits_behind: None,
        errors: vec![],
    };
    if !cfg.enabled {
        return report;
    }

    match exec::run(&cfg.outdated_command, Some(cwd), timeout).await {
        Ok(out) if out.success() => {
            let names = parse_outdated(&out.stdout);
            report.outdated_count = Some(names.len());
            report.outdated = names.into_iter().take(MAX_LISTED).collect();
        }
        Ok(out) => report.errors.push(format!("outdated check failed: {}", out.diagnostic())),
        Err(e) => report.errors.push(format!("outdated check failed: {e}")),
    }

    if let Some(root) = cfg.vcs_root.as_deref() {
        if root.join(".git").exists() {
            match commits_behind(root, timeout, &mut report.errors).await {
                Some(n) => {
                    report.commits_behind = Some(n);
                    report.vcs_behind = Some(n > 0);
                }
                None => report.vcs_behind = None,
            }
        }
    }
    report
}

/// `pip list --outdated --format=json` gives a JSON array; anything else is read as a table.
fn parse_outdated(stdout: &str) -> Vec<String> {
    if let Ok(serde_json::Value::Array(items)) = serde_json::from_str::<serde_json::Value>(stdout.trim()) {
        return items
            .iter()
            .map(|it| match it.get("name").and_then(|v| v.as_str()) {
                Some(name) => match (
                    it.get("version").and_then(|v| v.as_str()),
                    it.get("latest_version").and_then(|v| v.as_str()),
                ) {
                    (Some(cur), Some(latest)) => format!("{name} {cur}->{latest}"),
                    _ => name.to_string(),
                },
                None => it.to_string(),
            })
            .collect();
    }
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter(|l| !l.starts_with("Package") && !l.starts_with("---"))
        .map(|l| l.split_whitespace().next().unwrap_or(l).to_string())
        .collect()
}

async fn commits_behind(root: &Path, timeout: Duration, errors: &mut Vec<String>) -> Option<u64> {
    let git = |args: &[&str]| {
        let mut argv = vec!["git".to_string(), "-C".to_string(), root.display().to_string()];
        argv.extend(args.iter().map(|s| s.to_string()));
        argv
    };

    // A failed fetch still lets us compare against the last known upstream.
    match exec::run(&git(&["fetch", "--quiet"]), None, timeout).await {
        Ok(out) if out.success() => {}
        Ok(out) => errors.push(format!("git fetch failed: {}", out.diagnostic())),
        Err(e) => {
            errors.push(format!("git fetch failed: {e}"));
            return None;
        }
    }

    match exec::run(&git(&["rev-list", "--count", "HEAD..@{u}"]), None, timeout).await {
        Ok(out) if out.success() => match out.stdout.trim().parse::<u64>() {
            Ok(n) => Some(n),
            Err(e) => {
                errors.push(format!("unexpected rev-list output {:?}: {e}", out.stdout.trim()));
                None
            }
        },
        Ok(out) => {
            errors.push(format!("upstream compare failed: {}", out.diagnostic()));
            None
        }
        Err(e) => {
            errors.push(format!("upstream compare failed: {e}"));
            None
        }
    }
}

/// Counts pending OS package updates. Never applies them.
pub async fn check_host_updates(cfg: &HostUpdatesConfig, timeout: Duration) -> HostUpdateReport {
    let mut report = HostUpdateReport {
        checked_at: Local::now(),
        available_updates: None,
        security_updates: None,
        error: None,
    };
    if !cfg.enabled {
        return report;
    }
    match exec::run(&cfg.command, None, timeout).await {
        Ok(out) if out.success() => {
            let (all, security) = count_updates(&out);
            report.available_updates = Some(all);
            report.security_updates = Some(security);
        }
        Ok(out) => report.error = Some(out.diagnostic()),
        Err(e) => report.error = Some(e.to_string()),
    }
    report
}

/// `apt list --upgradable` lines look like
/// `openssl/jammy-security 3.0.2-0ubuntu1.15 amd64 [upgradable from: 3.0.2-0ubuntu1.14]`.
fn count_updates(out: &CommandOutput) -> (usize, usize) {
    let lines: Vec<&str> = out
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("Listing") && !l.starts_with("WARNING"))
        .collect();
    let security = lines.iter().filter(|l| l.contains("-security")).count();
    (lines.len(), security)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bk::exec::argv;

    fn drift_cfg(cmd: &str) -> DriftConfig {
        DriftConfig {
            enabled: true,
            outdated_command: argv(["sh", "-c", cmd]),
            vcs_root: None,
        }
    }

    #[tokio::test]
    async fn counts_pip_json_output() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = drift_cfg(
            r#"echo '[{"name":"requests","version":"2.31.0","latest_version":"2.32.3"},{"name":"numpy"}]'"#,
        );
        let r = check_dependency_drift(&cfg, dir.path(), Duration::from_secs(5)).await;
        assert_eq!(r.outdated_count, Some(2));
        assert_eq!(r.outdated, vec!["requests 2.31.0->2.32.3", "numpy"]);
        assert_eq!(r.vcs_behind, None);
        assert!(r.errors.is_empty());
    }

    #[tokio::test]
    async fn reads_column_output_and_ignores_headers() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = drift_cfg("printf 'Package Version Latest Type\\n------- ------- ------ -----\\nccxt 4.1.0 4.3.2 wheel\\n'");
        let r = check_dependency_drift(&cfg, dir.path(), Duration::from_secs(5)).await;
        assert_eq!(r.outdated_count, Some(1));
        assert_eq!(r.outdated, vec!["ccxt"]);
    }

    #[tokio::test]
    async fn probe_failure_is_advisory() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = DriftConfig {
            enabled: true,
            outdated_command: argv(["no-such-pip-binary-7d1f", "list"]),
            vcs_root: Some(dir.path().to_path_buf()),
        };
        let r = check_dependency_drift(&cfg, dir.path(), Duration::from_secs(5)).await;
        assert_eq!(r.outdated_count, None);
        assert_eq!(r.errors.len(), 1);
        // no .git under the root: no comparison attempted
        assert_eq!(r.vcs_behind, None);
    }

    #[tokio::test]
    async fn disabled_checks_do_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = drift_cfg("exit 1");
        cfg.enabled = false;
        let r = check_dependency_drift(&cfg, dir.path(), Duration::from_secs(5)).await;
        assert!(r.errors.is_empty());
        assert_eq!(r.outdated_count, None);
    }

    #[tokio::test]
    async fn counts_security_updates() {
        let cfg = HostUpdatesConfig {
            enabled: true,
            command: argv([
                "sh",
                "-c",
                "printf 'Listing... Done\\nopenssl/jammy-security 3.0.2 amd64 [upgradable from: 3.0.1]\\ncurl/jammy-updates 7.81 amd64 [upgradable from: 7.80]\\n'",
            ]),
        };
        let r = check_host_updates(&cfg, Duration::from_secs(5)).await;
        assert_eq!(r.available_updates, Some(2));
        assert_eq!(r.security_updates, Some(1));
        assert_eq!(r.error, None);
    }
}
