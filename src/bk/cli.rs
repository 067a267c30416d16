use crate::bk::build_info;
use crate::bk::config::{self, KeeperConfig};
use crate::bk::controller::{ServiceController, SystemdController};
use crate::bk::disk::{DiskProbe, StatvfsProbe};
use crate::bk::health::HealthMonitor;
use crate::bk::journal::{tail_lines, Journal};
use crate::bk::maintenance::MaintenanceEngine;
use crate::bk::model::{BackupOutcome, DiskUsageSample, HealthCheckRecord, MaintenanceReport};
use crate::bk::report::Inspector;
use clap::{Parser, Subcommand, ValueEnum};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "botkeeper", version, about = "keeps a trading bot running and its host tidy")]
pub struct Args {
    /// Path to config YAML
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Run one health cycle: check the service, restart it once if down
    Health {
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
    },
    /// Run one maintenance pass: backup, disk check, dependency drift, host updates
    Maintain {
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
    },
    /// Show service status, recent checks, disk usage and recent maintenance
    Report {
        /// Output format: text (default) or json
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
        /// Restart the service after showing the report (asks first)
        #[arg(long = "restart")]
        restart: bool,
        /// Do not ask before restarting
        #[arg(long = "yes", requires = "restart")]
        yes: bool,
    },
    /// Show the tail of the health and maintenance logs
    Events {
        /// Number of lines per log
        #[arg(short = 'n', default_value_t = 20)]
        n: usize,
    },
    /// Print crontab lines for the configured cadences
    Crontab,
    /// Print version and build info
    Version,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// How a successful invocation ended. Errors map to exit code 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Normal,
    /// A restart failed, disk is still over the mark, or a maintenance step failed.
    Degraded,
}

impl Outcome {
    pub fn exit_code(self) -> ExitCode {
        match self {
            Outcome::Normal => ExitCode::SUCCESS,
            Outcome::Degraded => ExitCode::from(2),
        }
    }
}

pub async fn run(args: Args) -> anyhow::Result<Outcome> {
    if let Cmd::Version = args.cmd {
        println!("{}", build_info::banner());
        return Ok(Outcome::Normal);
    }

    let cfg = Arc::new(config::load_keeper_config(&args.config)?);
    tracing::debug!(service = %cfg.service.name, base = %cfg.paths.base_dir.display(), "config loaded");
    let controller: Arc<dyn ServiceController> =
        Arc::new(SystemdController::new(cfg.service.user_unit, cfg.service.command_timeout));
    let disk: Arc<dyn DiskProbe> = Arc::new(StatvfsProbe);

    match args.cmd {
        Cmd::Version => Ok(Outcome::Normal),
        Cmd::Health { format } => {
            let rec = HealthMonitor::new(cfg, controller).check_and_heal().await?;
            match format {
                OutputFormat::Text => println!("{}", render_record(&rec)),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rec)?),
            }
            Ok(degraded_if(rec.is_degraded()))
        }
        Cmd::Maintain { format } => {
            let Some(report) = MaintenanceEngine::new(cfg, disk).run_maintenance().await? else {
                println!("maintenance skipped: another run holds the guard");
                return Ok(Outcome::Normal);
            };
            match format {
                OutputFormat::Text => println!("{}", render_maintenance(&report)),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
            Ok(degraded_if(report.is_degraded()))
        }
        Cmd::Report { format, restart, yes } => {
            let report = Inspector::new(cfg.clone(), controller.clone(), disk).summarize().await?;
            match format {
                OutputFormat::Text => print!("{}", report.render_text()),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
            if !restart {
                return Ok(Outcome::Normal);
            }
            let question = format!("restart {} now? [y/N] ", cfg.service.name);
            if !yes && !confirm(&question, &mut std::io::stdin().lock())? {
                eprintln!("restart cancelled");
                return Ok(Outcome::Normal);
            }
            let rec = HealthMonitor::new(cfg, controller).manual_restart().await?;
            eprintln!("{}", render_record(&rec));
            Ok(degraded_if(rec.is_degraded()))
        }
        Cmd::Events { n } => {
            let journal = Journal::new(&cfg.paths.logs_dir);
            for path in [journal.health_path(), journal.maintenance_path()] {
                println!("== {} ==", path.display());
                if !path.exists() {
                    println!("(empty)");
                    continue;
                }
                for line in tail_lines(&path, n)? {
                    println!("{line}");
                }
            }
            Ok(Outcome::Normal)
        }
        Cmd::Crontab => {
            let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("botkeeper"));
            for line in crontab_lines(&cfg, &exe)? {
                println!("{line}");
            }
            Ok(Outcome::Normal)
        }
    }
}

fn degraded_if(b: bool) -> Outcome {
    if b {
        Outcome::Degraded
    } else {
        Outcome::Normal
    }
}

/// Prompts on stderr and reads one answer. Only an explicit yes confirms.
pub fn confirm(question: &str, input: &mut impl BufRead) -> anyhow::Result<bool> {
    eprint!("{question}");
    std::io::stderr().flush()?;
    let mut line = String::new();
    input.read_line(&mut line)?;
    Ok(matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn render_record(rec: &HealthCheckRecord) -> String {
    let mut out = format!(
        "{}: observed={} action={} outcome={} final={}",
        rec.service,
        rec.observed_status.map(|s| s.as_str()).unwrap_or("-"),
        rec.action_taken.as_str(),
        rec.restart_outcome.as_str(),
        rec.final_status.map(|s| s.as_str()).unwrap_or("-"),
    );
    if let Some(e) = &rec.error {
        out.push_str(&format!("\n  error: {e}"));
    }
    for line in &rec.diagnostics {
        out.push_str(&format!("\n  | {line}"));
    }
    out
}

fn render_maintenance(r: &MaintenanceReport) -> String {
    let copied = r
        .backups
        .iter()
        .filter(|b| matches!(b.outcome, BackupOutcome::Copied { .. }))
        .count();
    let failed = r.backups.iter().filter(|b| b.is_failure()).count();
    let mut out = format!(
        "backup: {copied} copied, {failed} failed, {} missing\n",
        r.backups.len() - copied - failed
    );
    for b in r.backups.iter().filter(|b| b.is_failure()) {
        if let BackupOutcome::Failed { error } = &b.outcome {
            out.push_str(&format!("  {}: {error}\n", b.source_path.display()));
        }
    }

    let used = |s: &Option<DiskUsageSample>| {
        s.as_ref()
            .map(|s| format!("{:.1}%", s.used_percent))
            .unwrap_or_else(|| "-".to_string())
    };
    out.push_str(&format!(
        "disk: {} (before {}, after {}, mark {}%)\n",
        r.disk.verdict.as_str(),
        used(&r.disk.before),
        used(&r.disk.after),
        r.disk.high_water_percent
    ));
    if let Some(e) = &r.disk.error {
        out.push_str(&format!("  {e}\n"));
    }

    let outdated = r
        .drift
        .outdated_count
        .map(|n| n.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let behind = r
        .drift
        .commits_behind
        .map(|n| n.to_string())
        .unwrap_or_else(|| "-".to_string());
    out.push_str(&format!("drift: {outdated} outdated packages, {behind} commits behind\n"));
    let updates = match (r.host_updates.available_updates, r.host_updates.security_updates) {
        (Some(a), Some(s)) => format!("{a} available ({s} security)"),
        _ => "unknown".to_string(),
    };
    out.push_str(&format!("host updates: {updates}"));
    out
}

/// One crontab line per entry point, for the external scheduler.
pub fn crontab_lines(cfg: &KeeperConfig, exe: &Path) -> anyhow::Result<Vec<String>> {
    let config = cfg
        .source_file
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "config.yaml".to_string());
    let invoke = |sub: &str| format!("{} -c {config} {sub}", exe.display());
    Ok(vec![
        format!("{} {}", cron_expr(cfg.schedule.health_every)?, invoke("health")),
        format!("{} {}", cron_expr(cfg.schedule.maintenance_every)?, invoke("maintain")),
    ])
}

/// Cron schedule for a fixed cadence. Daily and longer cadences run at 03:30.
pub fn cron_expr(every: Duration) -> anyhow::Result<String> {
    let secs = every.as_secs();
    anyhow::ensure!(
        secs >= 60 && secs % 60 == 0 && every.subsec_nanos() == 0,
        "cadence {}ms is not a whole number of minutes",
        every.as_millis()
    );
    let mins = secs / 60;
    if mins < 60 {
        return Ok(if mins == 1 {
            "* * * * *".to_string()
        } else {
            format!("*/{mins} * * * *")
        });
    }
    anyhow::ensure!(mins % 60 == 0, "cadence of {mins} minutes cannot be expressed in cron");
    let hours = mins / 60;
    if hours < 24 {
        return Ok(if hours == 1 {
            "0 * * * *".to_string()
        } else {
            format!("0 */{hours} * * *")
        });
    }
    anyhow::ensure!(hours % 24 == 0, "cadence of {hours} hours cannot be expressed in cron");
    let days = hours / 24;
    Ok(if days == 1 {
        "30 3 * * *".to_string()
    } else {
        format!("30 3 */{days} * *")
    })
}
