use crate::bk::model::{ArtifactClass, RetentionRule, RetentionTrigger};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct KeeperConfig {
    pub service: ServiceConfig,
    pub paths: PathsConfig,
    pub backup: BackupConfig,
    pub disk: DiskConfig,
    pub retention: Vec<RetentionRule>,
    /// Directories scanned by retention rules, per artifact class.
    pub artifact_dirs: BTreeMap<ArtifactClass, Vec<PathBuf>>,
    pub drift: DriftConfig,
    pub host_updates: HostUpdatesConfig,
    pub schedule: ScheduleConfig,
    /// File this config was loaded from, if any.
    pub source_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Unit name handed to the service controller, e.g. `trading-bot`.
    pub name: String,
    /// Talk to the per-user service manager (`systemctl --user`).
    pub user_unit: bool,
    /// Upper bound on the post-restart wait before re-checking status.
    pub settle: Duration,
    pub diagnostics_lines: usize,
    /// Upper bound for any external command (systemctl, git, pip, apt).
    pub command_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PathsConfig {
    pub base_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub backups_dir: PathBuf,
    pub state_dir: PathBuf,
    /// Optional directory holding trade/activity records for the report.
    pub activity_dir: Option<PathBuf>,
    pub activity_window: Duration,
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub config: Vec<PathBuf>,
    pub state: Vec<PathBuf>,
    pub logs: Vec<PathBuf>,
    /// Only log files modified within this window are copied.
    pub logs_lookback: Duration,
}

#[derive(Debug, Clone)]
pub struct DiskConfig {
    pub path: PathBuf,
    pub high_water_percent: f64,
}

#[derive(Debug, Clone)]
pub struct DriftConfig {
    pub enabled: bool,
    pub outdated_command: Vec<String>,
    pub vcs_root: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct HostUpdatesConfig {
    pub enabled: bool,
    pub command: Vec<String>,
}

/// Cadences the external scheduler is expected to use. Only consumed by `crontab`.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub health_every: Duration,
    pub maintenance_every: Duration,
}

impl KeeperConfig {
    /// Built-in defaults rooted at `base_dir`. The 80% mark and the 30/60/90 day windows
    /// are starting points, not tuned values.
    pub fn defaults(service_name: &str, base_dir: &Path) -> Self {
        let base = base_dir.to_path_buf();
        let logs_dir = base.join("logs");
        let backups_dir = base.join("backups");

        let mut artifact_dirs = BTreeMap::new();
        artifact_dirs.insert(ArtifactClass::Log, vec![logs_dir.clone()]);
        artifact_dirs.insert(ArtifactClass::BacktestResult, vec![base.join("backtest_results")]);
        artifact_dirs.insert(ArtifactClass::Report, vec![base.join("reports")]);
        artifact_dirs.insert(ArtifactClass::Backup, vec![backups_dir.clone()]);

        Self {
            service: ServiceConfig {
                name: service_name.to_string(),
                user_unit: false,
                settle: Duration::from_secs(10),
                diagnostics_lines: 50,
                command_timeout: Duration::from_secs(60),
            },
            paths: PathsConfig {
                base_dir: base.clone(),
                logs_dir: logs_dir.clone(),
                backups_dir,
                state_dir: base.join("state"),
                activity_dir: None,
                activity_window: DAY,
            },
            backup: BackupConfig {
                config: vec![],
                state: vec![],
                logs: vec![logs_dir],
                logs_lookback: DAY,
            },
            disk: DiskConfig {
                path: base.clone(),
                high_water_percent: 80.0,
            },
            retention: vec![
                RetentionRule {
                    class: ArtifactClass::Log,
                    max_age: 30 * DAY,
                    trigger: RetentionTrigger::Always,
                },
                RetentionRule {
                    class: ArtifactClass::BacktestResult,
                    max_age: 60 * DAY,
                    trigger: RetentionTrigger::DiskUsageAbove(80.0),
                },
                RetentionRule {
                    class: ArtifactClass::Report,
                    max_age: 90 * DAY,
                    trigger: RetentionTrigger::DiskUsageAbove(80.0),
                },
            ],
            artifact_dirs,
            drift: DriftConfig {
                enabled: true,
                outdated_command: ["pip", "list", "--outdated", "--format=json"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                vcs_root: Some(base),
            },
            host_updates: HostUpdatesConfig {
                enabled: true,
                command: ["apt", "list", "--upgradable"].iter().map(|s| s.to_string()).collect(),
            },
            schedule: ScheduleConfig {
                health_every: Duration::from_secs(5 * 60),
                maintenance_every: DAY,
            },
            source_file: None,
        }
    }
}

// -------- YAML file schema (grouped; strict) --------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct KeeperConfigFile {
    service: ServiceSectionFile,
    #[serde(default)]
    paths: Option<PathsSectionFile>,
    #[serde(default)]
    backup: Option<BackupSectionFile>,
    #[serde(default)]
    disk: Option<DiskSectionFile>,
    #[serde(default)]
    retention: Option<Vec<RetentionRuleFile>>,
    #[serde(default)]
    artifact_dirs: Option<BTreeMap<ArtifactClass, Vec<PathBuf>>>,
    #[serde(default)]
    drift: Option<DriftSectionFile>,
    #[serde(default)]
    host_updates: Option<HostUpdatesSectionFile>,
    #[serde(default)]
    schedule: Option<ScheduleSectionFile>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServiceSectionFile {
    name: String,
    #[serde(default)]
    user_unit: bool,
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    settle: Option<Duration>,
    #[serde(default)]
    diagnostics_lines: Option<usize>,
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    command_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct PathsSectionFile {
    #[serde(default)]
    base_dir: Option<PathBuf>,
    #[serde(default)]
    logs_dir: Option<PathBuf>,
    #[serde(default)]
    backups_dir: Option<PathBuf>,
    #[serde(default)]
    state_dir: Option<PathBuf>,
    #[serde(default)]
    activity_dir: Option<PathBuf>,
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    activity_window: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct BackupSectionFile {
    #[serde(default)]
    config: Option<Vec<PathBuf>>,
    #[serde(default)]
    state: Option<Vec<PathBuf>>,
    #[serde(default)]
    logs: Option<Vec<PathBuf>>,
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    logs_lookback: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct DiskSectionFile {
    #[serde(default)]
    path: Option<PathBuf>,
    #[serde(default)]
    high_water_percent: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RetentionRuleFile {
    class: ArtifactClass,
    #[serde(deserialize_with = "deserialize_duration")]
    max_age: Duration,
    #[serde(default, deserialize_with = "deserialize_trigger")]
    trigger: RetentionTrigger,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct DriftSectionFile {
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    outdated_command: Option<Vec<String>>,
    #[serde(default)]
    vcs_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct HostUpdatesSectionFile {
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    command: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScheduleSectionFile {
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    health_every: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    maintenance_every: Option<Duration>,
}

fn default_true() -> bool {
    true
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    deserialize_opt_duration(deserializer)?.ok_or_else(|| D::Error::custom("duration must not be null"))
}

fn deserialize_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    let v = serde_yaml::Value::deserialize(deserializer)?;
    match v {
        serde_yaml::Value::Null => Ok(None),
        serde_yaml::Value::Number(n) => n
            .as_u64()
            .map(|ms| Some(Duration::from_millis(ms)))
            .ok_or_else(|| D::Error::custom("duration must be a non-negative integer (ms)")),
        serde_yaml::Value::String(s) => parse_duration_str(&s).map(Some).map_err(D::Error::custom),
        _ => Err(D::Error::custom(
            "duration must be integer milliseconds or a string like \"10s\" or \"30d\"",
        )),
    }
}

/// Accepts `always`, `disk_usage_above(80)`, or `{ disk_usage_above: 80 }`.
fn deserialize_trigger<'de, D>(deserializer: D) -> Result<RetentionTrigger, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    let v = serde_yaml::Value::deserialize(deserializer)?;
    let threshold = match v {
        serde_yaml::Value::Null => return Ok(RetentionTrigger::Always),
        serde_yaml::Value::String(s) => {
            let t = s.trim().to_ascii_lowercase();
            if t == "always" {
                return Ok(RetentionTrigger::Always);
            }
            let inner = t
                .strip_prefix("disk_usage_above(")
                .and_then(|r| r.strip_suffix(')'))
                .ok_or_else(|| {
                    D::Error::custom(format!(
                        "unknown retention trigger {s:?} (use \"always\" or \"disk_usage_above(80)\")"
                    ))
                })?;
            inner
                .trim()
                .parse::<f64>()
                .map_err(|e| D::Error::custom(format!("invalid trigger threshold {s:?}: {e}")))?
        }
        serde_yaml::Value::Mapping(m) => {
            single_threshold_key(&m).ok_or_else(|| {
                D::Error::custom("retention trigger mapping must be { disk_usage_above: <percent> }")
            })?
        }
        _ => return Err(D::Error::custom("retention trigger must be a string or mapping")),
    };
    if !(0.0..=100.0).contains(&threshold) {
        return Err(D::Error::custom(format!(
            "trigger threshold must be within 0..=100, got {threshold}"
        )));
    }
    Ok(RetentionTrigger::DiskUsageAbove(threshold))
}

fn single_threshold_key(m: &serde_yaml::Mapping) -> Option<f64> {
    if m.len() != 1 {
        return None;
    }
    m.get("disk_usage_above").and_then(|v| v.as_f64())
}

/// Parses `1500ms`, `10s`, `5m`, `2h`, `30d`. A bare number is milliseconds.
pub fn parse_duration_str(s: &str) -> Result<Duration, String> {
    let t = s.trim();
    if t.is_empty() {
        return Err("empty duration".to_string());
    }
    let idx = t
        .char_indices()
        .find(|(_, ch)| !(ch.is_ascii_digit() || *ch == '.'))
        .map(|(i, _)| i)
        .unwrap_or(t.len());
    if idx == 0 {
        return Err(format!("invalid duration: {s}"));
    }
    let (num_s, unit_s) = t.split_at(idx);
    let num: f64 = num_s.parse().map_err(|e| format!("invalid duration number: {e}"))?;
    let unit = unit_s.trim().to_ascii_lowercase();
    let mult_ms: f64 = match unit.as_str() {
        "" | "ms" => 1.0,
        "s" => 1000.0,
        "m" => 60_000.0,
        "h" => 3_600_000.0,
        "d" => 86_400_000.0,
        _ => return Err(format!("unknown duration unit {unit_s:?} (use ms/s/m/h/d)")),
    };
    Ok(Duration::from_millis((num * mult_ms).round() as u64))
}

fn resolve(base: &Path, p: PathBuf) -> PathBuf {
    if p.is_relative() {
        base.join(p)
    } else {
        p
    }
}

fn validate_command(section: &str, cmd: &[String]) -> anyhow::Result<()> {
    anyhow::ensure!(!cmd.is_empty(), "{section} must not be empty");
    anyhow::ensure!(
        !cmd[0].trim().is_empty(),
        "{section}: program name must not be empty"
    );
    Ok(())
}

pub fn load_keeper_config(config_path: &Path) -> anyhow::Result<KeeperConfig> {
    let raw = std::fs::read_to_string(config_path)
        .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", config_path.display()))?;
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut cfg = parse_keeper_config(&raw, config_dir)
        .map_err(|e| anyhow::anyhow!("invalid config {}: {e}", config_path.display()))?;

    // The active config is always part of the `config` backup set.
    let own = std::fs::canonicalize(config_path).unwrap_or_else(|_| config_path.to_path_buf());
    if !cfg.backup.config.iter().any(|p| p == &own || p == config_path) {
        cfg.backup.config.insert(0, own.clone());
    }
    cfg.source_file = Some(own);
    Ok(cfg)
}

/// Parses a config document. Relative paths resolve against `config_dir`, then `paths.base_dir`.
pub fn parse_keeper_config(raw: &str, config_dir: &Path) -> anyhow::Result<KeeperConfig> {
    let file_cfg: KeeperConfigFile = serde_yaml::from_str(raw)?;

    let name = file_cfg.service.name.trim().to_string();
    anyhow::ensure!(!name.is_empty(), "service.name must not be empty");
    anyhow::ensure!(
        !name.chars().any(|c| c.is_whitespace() || c == '/'),
        "service.name must not contain whitespace or '/': {name:?}"
    );

    let base_dir = file_cfg
        .paths
        .as_ref()
        .and_then(|p| p.base_dir.clone())
        .map(|p| resolve(config_dir, p))
        .unwrap_or_else(|| config_dir.to_path_buf());

    // Start from defaults and overlay provided groups.
    let mut cfg = KeeperConfig::defaults(&name, &base_dir);

    let svc = file_cfg.service;
    cfg.service.user_unit = svc.user_unit;
    if let Some(settle) = svc.settle {
        cfg.service.settle = settle;
    }
    if let Some(n) = svc.diagnostics_lines {
        cfg.service.diagnostics_lines = n;
    }
    if let Some(t) = svc.command_timeout {
        anyhow::ensure!(!t.is_zero(), "service.command_timeout must be > 0");
        cfg.service.command_timeout = t;
    }

    if let Some(p) = file_cfg.paths {
        if let Some(d) = p.logs_dir {
            cfg.paths.logs_dir = resolve(&base_dir, d);
            cfg.backup.logs = vec![cfg.paths.logs_dir.clone()];
            cfg.artifact_dirs.insert(ArtifactClass::Log, vec![cfg.paths.logs_dir.clone()]);
        }
        if let Some(d) = p.backups_dir {
            cfg.paths.backups_dir = resolve(&base_dir, d);
            cfg.artifact_dirs.insert(ArtifactClass::Backup, vec![cfg.paths.backups_dir.clone()]);
        }
        if let Some(d) = p.state_dir {
            cfg.paths.state_dir = resolve(&base_dir, d);
        }
        cfg.paths.activity_dir = p.activity_dir.map(|d| resolve(&base_dir, d));
        if let Some(w) = p.activity_window {
            cfg.paths.activity_window = w;
        }
    }

    if let Some(b) = file_cfg.backup {
        if let Some(v) = b.config {
            cfg.backup.config = v.into_iter().map(|p| resolve(&base_dir, p)).collect();
        }
        if let Some(v) = b.state {
            cfg.backup.state = v.into_iter().map(|p| resolve(&base_dir, p)).collect();
        }
        if let Some(v) = b.logs {
            cfg.backup.logs = v.into_iter().map(|p| resolve(&base_dir, p)).collect();
        }
        if let Some(l) = b.logs_lookback {
            cfg.backup.logs_lookback = l;
        }
    }

    if let Some(d) = file_cfg.disk {
        if let Some(p) = d.path {
            cfg.disk.path = resolve(&base_dir, p);
        }
        if let Some(hw) = d.high_water_percent {
            anyhow::ensure!(
                hw > 0.0 && hw <= 100.0,
                "disk.high_water_percent must be within (0, 100], got {hw}"
            );
            cfg.disk.high_water_percent = hw;
        }
    }

    if let Some(rules) = file_cfg.retention {
        cfg.retention = rules
            .into_iter()
            .map(|r| RetentionRule {
                class: r.class,
                max_age: r.max_age,
                trigger: r.trigger,
            })
            .collect();
    }
    for rule in &cfg.retention {
        anyhow::ensure!(
            !rule.max_age.is_zero(),
            "retention rule for {} must have max_age > 0",
            rule.class
        );
    }

    if let Some(dirs) = file_cfg.artifact_dirs {
        for (class, paths) in dirs {
            cfg.artifact_dirs
                .insert(class, paths.into_iter().map(|p| resolve(&base_dir, p)).collect());
        }
    }

    if let Some(d) = file_cfg.drift {
        cfg.drift.enabled = d.enabled;
        if let Some(cmd) = d.outdated_command {
            validate_command("drift.outdated_command", &cmd)?;
            cfg.drift.outdated_command = cmd;
        }
        if let Some(root) = d.vcs_root {
            cfg.drift.vcs_root = Some(resolve(&base_dir, root));
        }
    }

    if let Some(h) = file_cfg.host_updates {
        cfg.host_updates.enabled = h.enabled;
        if let Some(cmd) = h.command {
            validate_command("host_updates.command", &cmd)?;
            cfg.host_updates.command = cmd;
        }
    }

    if let Some(s) = file_cfg.schedule {
        if let Some(h) = s.health_every {
            cfg.schedule.health_every = h;
        }
        if let Some(m) = s.maintenance_every {
            cfg.schedule.maintenance_every = m;
        }
    }
    anyhow::ensure!(
        cfg.service.settle < cfg.schedule.health_every,
        "service.settle must be shorter than schedule.health_every"
    );

    Ok(cfg)
}
