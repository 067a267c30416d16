use crate::bk::config::KeeperConfig;
use crate::bk::controller::{ControllerError, ServiceController};
use crate::bk::guard::{self, Acquire};
use crate::bk::journal::Journal;
use crate::bk::model::{ActionTaken, HealthCheckRecord, RestartOutcome, ServiceStatus, Trigger};
use chrono::Local;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub const GUARD_ENTRY: &str = "health";

/// Re-check cadence while waiting for a restarted process to come up.
const SETTLE_POLL: Duration = Duration::from_millis(500);

pub struct HealthMonitor {
    cfg: Arc<KeeperConfig>,
    controller: Arc<dyn ServiceController>,
    journal: Journal,
}

impl HealthMonitor {
    pub fn new(cfg: Arc<KeeperConfig>, controller: Arc<dyn ServiceController>) -> Self {
        let journal = Journal::new(&cfg.paths.logs_dir);
        Self {
            cfg,
            controller,
            journal,
        }
    }

    /// One scheduled health cycle. `Err` only for fatal configuration problems.
    pub async fn check_and_heal(&self) -> anyhow::Result<HealthCheckRecord> {
        self.cycle(Trigger::Scheduled).await
    }

    /// Operator-confirmed restart, through the same guard and restart path as scheduled cycles.
    pub async fn manual_restart(&self) -> anyhow::Result<HealthCheckRecord> {
        self.cycle(Trigger::Manual).await
    }

    async fn cycle(&self, trigger: Trigger) -> anyhow::Result<HealthCheckRecord> {
        let name = self.cfg.service.name.as_str();

        let _guard = match guard::try_acquire(&self.cfg.paths.state_dir, GUARD_ENTRY)? {
            Acquire::Acquired(g) => g,
            Acquire::Held { holder } => {
                tracing::info!(service = name, ?holder, "health cycle skipped: guard held");
                let rec = HealthCheckRecord::skipped(name, trigger, holder);
                self.journal.append_record(&rec)?;
                return Ok(rec);
            }
        };

        let observed = match self.controller.is_active(name).await {
            Ok(active) => ServiceStatus::from_active(active),
            Err(e @ ControllerError::Unavailable(_)) => return Err(self.fatal(e)),
            Err(ControllerError::Command(msg)) => {
                tracing::warn!(service = name, error = %msg, "status query failed; no action this cycle");
                let rec = HealthCheckRecord::unobserved(name, trigger, format!("status query failed: {msg}"));
                self.journal.append_record(&rec)?;
                return Ok(rec);
            }
        };

        let rec = if observed == ServiceStatus::Running && trigger == Trigger::Scheduled {
            HealthCheckRecord {
                timestamp: Local::now(),
                service: name.to_string(),
                trigger,
                observed_status: Some(observed),
                final_status: Some(observed),
                action_taken: ActionTaken::None,
                restart_outcome: RestartOutcome::NotAttempted,
                error: None,
                diagnostics: vec![],
            }
        } else {
            self.restart_and_settle(observed, trigger).await?
        };

        self.journal.append_record(&rec)?;
        match rec.restart_outcome {
            RestartOutcome::Failure => tracing::warn!(
                service = name,
                error = rec.error.as_deref().unwrap_or("-"),
                "restart failed; next cycle will retry"
            ),
            RestartOutcome::Success => tracing::info!(service = name, trigger = trigger.as_str(), "restart succeeded"),
            RestartOutcome::NotAttempted => tracing::debug!(service = name, "service running"),
        }
        Ok(rec)
    }

    async fn restart_and_settle(&self, observed: ServiceStatus, trigger: Trigger) -> anyhow::Result<HealthCheckRecord> {
        let name = self.cfg.service.name.as_str();
        tracing::info!(
            service = name,
            from = observed.as_str(),
            to = ServiceStatus::RestartInProgress.as_str(),
            trigger = trigger.as_str(),
            "issuing restart"
        );

        let mut rec = HealthCheckRecord {
            timestamp: Local::now(),
            service: name.to_string(),
            trigger,
            observed_status: Some(observed),
            final_status: Some(ServiceStatus::RestartInProgress),
            action_taken: ActionTaken::Restart,
            restart_outcome: RestartOutcome::NotAttempted,
            error: None,
            diagnostics: vec![],
        };

        match self.controller.restart(name).await {
            Ok(()) => match self.settle().await {
                Ok(true) => {
                    rec.final_status = Some(ServiceStatus::Running);
                    rec.restart_outcome = RestartOutcome::Success;
                    return Ok(rec);
                }
                Ok(false) => {
                    rec.error = Some(format!(
                        "still down after {}ms settle",
                        self.cfg.service.settle.as_millis()
                    ));
                }
                // The restart went out, so the record must still be written.
                Err(e) => rec.error = Some(format!("settle check failed: {e}")),
            },
            Err(e @ ControllerError::Unavailable(_)) => return Err(self.fatal(e)),
            Err(ControllerError::Command(msg)) => rec.error = Some(format!("restart command failed: {msg}")),
        }

        rec.final_status = Some(ServiceStatus::RestartFailed);
        rec.restart_outcome = RestartOutcome::Failure;
        rec.diagnostics = match self
            .controller
            .recent_diagnostics(name, self.cfg.service.diagnostics_lines)
            .await
        {
            Ok(lines) => lines,
            Err(e) => vec![format!("diagnostics unavailable: {e}")],
        };
        Ok(rec)
    }

    /// Polls until running or the settle interval runs out. Always checks at least once.
    async fn settle(&self) -> Result<bool, ControllerError> {
        let name = self.cfg.service.name.as_str();
        let deadline = Instant::now() + self.cfg.service.settle;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(remaining.min(SETTLE_POLL)).await;
            if self.controller.is_active(name).await? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
        }
    }

    fn fatal(&self, e: ControllerError) -> anyhow::Error {
        // Best effort: the operator should find the reason next to the records.
        if let Err(log_err) = self.journal.health_event(format!("fatal: {e}")) {
            tracing::error!(error = %log_err, "failed to write health log");
        }
        anyhow::Error::new(e).context(format!("health cycle for {} aborted", self.cfg.service.name))
    }
}
