use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("command not found: {0}")]
    NotFound(String),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} did not finish within {}ms", .timeout.as_millis())]
    Timeout { program: String, timeout: Duration },
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Trimmed stderr, falling back to stdout, for error messages.
    pub fn diagnostic(&self) -> String {
        let err = self.stderr.trim();
        if !err.is_empty() {
            return err.to_string();
        }
        let out = self.stdout.trim();
        if !out.is_empty() {
            return out.to_string();
        }
        match self.code {
            Some(c) => format!("exit code {c}"),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Runs `argv` to completion, killing it if it outlives `timeout`.
pub async fn run(argv: &[String], cwd: Option<&Path>, timeout: Duration) -> Result<CommandOutput, ExecError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(ExecError::NotFound(String::new()));
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let child = cmd.spawn().map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            ExecError::NotFound(program.clone())
        } else {
            ExecError::Spawn {
                program: program.clone(),
                source: e,
            }
        }
    })?;

    let out = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| ExecError::Timeout {
            program: program.clone(),
            timeout,
        })?
        .map_err(|e| ExecError::Spawn {
            program: program.clone(),
            source: e,
        })?;

    Ok(CommandOutput {
        code: out.status.code(),
        stdout: String::from_utf8_lossy(&out.stdout).to_string(),
        stderr: String::from_utf8_lossy(&out.stderr).to_string(),
    })
}

pub fn argv<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let out = run(&argv(["sh", "-c", "echo hi; echo oops >&2; exit 3"]), None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.code, Some(3));
        assert_eq!(out.stdout.trim(), "hi");
        assert_eq!(out.diagnostic(), "oops");
        assert!(!out.success());
    }

    #[tokio::test]
    async fn missing_program_is_not_found() {
        let err = run(&argv(["definitely-not-a-real-binary-7d1f"]), None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::NotFound(_)));
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let err = run(&argv(["sleep", "5"]), None, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
    }
}
