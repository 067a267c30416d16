use crate::bk::exec::{self, CommandOutput, ExecError};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// The supervision subsystem itself is missing or unreachable. Fatal for the cycle.
    #[error("service controller unavailable: {0}")]
    Unavailable(String),
    /// The controller answered but the operation failed.
    #[error("service controller command failed: {0}")]
    Command(String),
}

/// Boundary to whatever actually runs the managed process.
#[async_trait]
pub trait ServiceController: Send + Sync {
    async fn is_active(&self, name: &str) -> Result<bool, ControllerError>;

    async fn restart(&self, name: &str) -> Result<(), ControllerError>;

    /// Last `n` lines of the managed process output, oldest first.
    async fn recent_diagnostics(&self, name: &str, n: usize) -> Result<Vec<String>, ControllerError>;

    /// When the process last entered the running state, if the controller knows.
    async fn active_since(&self, _name: &str) -> Result<Option<DateTime<Local>>, ControllerError> {
        Ok(None)
    }
}

/// Drives a unit through `systemctl` and reads its output through `journalctl`.
#[derive(Debug, Clone)]
pub struct SystemdController {
    user_unit: bool,
    timeout: Duration,
}

impl SystemdController {
    pub fn new(user_unit: bool, timeout: Duration) -> Self {
        Self { user_unit, timeout }
    }

    fn systemctl(&self, args: &[&str]) -> Vec<String> {
        let mut argv = vec!["systemctl".to_string()];
        if self.user_unit {
            argv.push("--user".to_string());
        }
        argv.extend(args.iter().map(|s| s.to_string()));
        argv
    }

    async fn call(&self, argv: Vec<String>) -> Result<CommandOutput, ControllerError> {
        let out = exec::run(&argv, None, self.timeout).await.map_err(|e| match e {
            ExecError::NotFound(p) => ControllerError::Unavailable(format!("{p} not found on PATH")),
            ExecError::Spawn { .. } => ControllerError::Unavailable(e.to_string()),
            // A hung call is an operation failure, not a missing controller.
            ExecError::Timeout { .. } => ControllerError::Command(e.to_string()),
        })?;
        if let Some(reason) = bus_unreachable(&out.stderr) {
            return Err(ControllerError::Unavailable(reason));
        }
        Ok(out)
    }
}

fn bus_unreachable(stderr: &str) -> Option<String> {
    const MARKERS: [&str; 3] = [
        "Failed to connect to bus",
        "System has not been booted with systemd",
        "Failed to get D-Bus connection",
    ];
    stderr
        .lines()
        .find(|l| MARKERS.iter().any(|m| l.contains(m)))
        .map(|l| l.trim().to_string())
}

#[async_trait]
impl ServiceController for SystemdController {
    async fn is_active(&self, name: &str) -> Result<bool, ControllerError> {
        // is-active: 0 when active, 3 (or 4 for unknown units) otherwise.
        let out = self.call(self.systemctl(&["is-active", "--quiet", name])).await?;
        Ok(out.success())
    }

    async fn restart(&self, name: &str) -> Result<(), ControllerError> {
        let out = self.call(self.systemctl(&["restart", name])).await?;
        if out.success() {
            Ok(())
        } else {
            Err(ControllerError::Command(out.diagnostic()))
        }
    }

    async fn recent_diagnostics(&self, name: &str, n: usize) -> Result<Vec<String>, ControllerError> {
        if n == 0 {
            return Ok(vec![]);
        }
        let mut argv = vec!["journalctl".to_string()];
        if self.user_unit {
            argv.push("--user".to_string());
        }
        let lines = n.to_string();
        argv.extend(
            ["-u", name, "-n", lines.as_str(), "--no-pager", "-o", "short-iso"]
                .iter()
                .map(|s| s.to_string()),
        );
        let out = self.call(argv).await?;
        if !out.success() {
            return Err(ControllerError::Command(out.diagnostic()));
        }
        Ok(last_lines(&out.stdout, n))
    }

    async fn active_since(&self, name: &str) -> Result<Option<DateTime<Local>>, ControllerError> {
        let out = self
            .call(self.systemctl(&[
                "show",
                name,
                "--property=ActiveEnterTimestampMonotonic",
                "--value",
            ]))
            .await?;
        if !out.success() {
            return Ok(None);
        }
        let Ok(mono_us) = out.stdout.trim().parse::<u64>() else {
            return Ok(None);
        };
        if mono_us == 0 {
            return Ok(None);
        }
        let Some(uptime_s) = read_system_uptime_seconds() else {
            return Ok(None);
        };
        let running_for_ms = ((uptime_s - mono_us as f64 / 1_000_000.0).max(0.0) * 1000.0) as i64;
        Ok(Some(Local::now() - chrono::Duration::milliseconds(running_for_ms)))
    }
}

fn read_system_uptime_seconds() -> Option<f64> {
    let s = std::fs::read_to_string("/proc/uptime").ok()?;
    s.split_whitespace().next()?.parse::<f64>().ok()
}

fn last_lines(s: &str, n: usize) -> Vec<String> {
    let lines: Vec<&str> = s.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].iter().map(|l| l.to_string()).collect()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_missing_bus() {
        assert!(bus_unreachable("System has not been booted with systemd as init system (PID 1).").is_some());
        assert!(bus_unreachable("Failed to connect to bus: No medium found").is_some());
        assert!(bus_unreachable("Unit foo.service could not be found.").is_none());
    }

    #[test]
    fn last_lines_is_bounded() {
        let text = "a\nb\n\nc\nd\n";
        assert_eq!(last_lines(text, 2), vec!["c", "d"]);
        assert_eq!(last_lines(text, 10), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn user_units_pass_flag_first() {
        let c = SystemdController::new(true, Duration::from_secs(1));
        assert_eq!(c.systemctl(&["is-active", "bot"]), vec!["systemctl", "--user", "is-active", "bot"]);
    }
}
