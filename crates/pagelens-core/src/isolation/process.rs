//! Child-process sandbox backend.
//!
//! Each execution gets a fresh process with a cleared environment. The
//! invocation is written to stdin; stdout and stderr are read up to the
//! configured cap and the child is killed once either crosses it. Dropping the execution future (deadline, abandoned request) kills the
//! child.

use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::BoxFuture;

use super::{IsolationError, SandboxBackend, SandboxConfig, SandboxResult};

/// Host variables every child inherits.
const BASE_ENV: [&str; 2] = ["PATH", "HOME"];

/// Runs commands as plain child processes with a scrubbed environment.
pub struct ProcessBackend;

impl SandboxBackend for ProcessBackend {
    fn name(&self) -> &str {
        "process"
    }

    fn available(&self) -> bool {
        true
    }

    fn execute(
        &self,
        config: &SandboxConfig,
        command: &[String],
        stdin: Vec<u8>,
    ) -> BoxFuture<'_, Result<SandboxResult, IsolationError>> {
        let config = config.clone();
        let cmd = command.to_vec();

        Box::pin(async move {
            config.validate()?;
            let Some((program, args)) = cmd.split_first() else {
                return Err(IsolationError::Execution(
                    "command must not be empty".to_string(),
                ));
            };

            let start = std::time::Instant::now();

            let mut proc = tokio::process::Command::new(program);
            proc.args(args)
                .current_dir(&config.workdir)
                .env_clear()
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            for name in BASE_ENV.iter().copied().chain(config.pass_env.iter().map(String::as_str)) {
                if let Ok(value) = std::env::var(name) {
                    proc.env(name, value);
                }
            }
            proc.envs(&config.env);

            let mut child = proc
                .spawn()
                .map_err(|e| IsolationError::Execution(format!("spawn failed: {e}")))?;

            if let Some(mut pipe) = child.stdin.take() {
                let label = config.label.clone();
                tokio::spawn(async move {
                    // The child may exit without reading its input.
                    if let Err(e) = pipe.write_all(&stdin).await {
                        tracing::debug!(label = %label, error = %e, "stdin write failed");
                    }
                });
            }

            let max = config.limits.max_output_bytes;
            let run = async {
                let (stdout, stderr) = tokio::try_join!(
                    read_capped(child.stdout.take(), max, "stdout"),
                    read_capped(child.stderr.take(), max, "stderr"),
                )?;
                let status = child
                    .wait()
                    .await
                    .map_err(|e| IsolationError::Execution(format!("wait failed: {e}")))?;
                Ok::<_, IsolationError>((status, stdout, stderr))
            };
            let (status, stdout, stderr) = match config.limits.timeout {
                Some(dur) => tokio::time::timeout(dur, run)
                    .await
                    .map_err(|_| IsolationError::Timeout(dur))??,
                None => run.await?,
            };

            let elapsed = start.elapsed();

            tracing::debug!(
                backend = "process",
                label = %config.label,
                exit_code = status.code().unwrap_or(-1),
                elapsed_ms = elapsed.as_millis() as u64,
                "Sandboxed command finished"
            );

            Ok(SandboxResult {
                exit_code: status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
                elapsed,
            })
        })
    }
}

/// Read a child pipe to EOF, failing as soon as it yields more than `max` bytes.
async fn read_capped<R>(pipe: Option<R>, max: usize, stream: &str) -> Result<Vec<u8>, IsolationError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let Some(pipe) = pipe else {
        return Ok(buf);
    };
    let limit = u64::try_from(max).unwrap_or(u64::MAX).saturating_add(1);
    pipe.take(limit)
        .read_to_end(&mut buf)
        .await
        .map_err(|e| IsolationError::Execution(format!("reading {stream} failed: {e}")))?;
    if buf.len() > max {
        return Err(IsolationError::ResourceLimit(format!(
            "{stream} exceeds the {max} byte limit"
        )));
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_process_backend_available() {
        assert!(ProcessBackend.available());
        assert_eq!(ProcessBackend.name(), "process");
    }

    #[tokio::test]
    async fn test_stdin_reaches_child() {
        let config = SandboxConfig::new("cat").with_timeout(Duration::from_secs(5));
        let result = ProcessBackend
            .execute(&config, &sh("cat"), b"[1,2,3]".to_vec())
            .await
            .unwrap();
        assert!(result.success());
        assert_eq!(result.stdout, "[1,2,3]");
    }

    #[tokio::test]
    async fn test_environment_is_scrubbed() {
        let config = SandboxConfig::new("env")
            .with_env("JIRA_KEY", "scoped")
            .with_timeout(Duration::from_secs(5));
        let result = ProcessBackend
            .execute(&config, &sh("env"), Vec::new())
            .await
            .unwrap();
        let names: Vec<&str> = result
            .stdout
            .lines()
            .filter_map(|l| l.split('=').next())
            .collect();
        assert!(names.contains(&"JIRA_KEY"));
        // Shell-maintained variables aside, nothing from the host leaks through.
        for name in &names {
            assert!(
                ["JIRA_KEY", "PATH", "HOME", "PWD", "OLDPWD", "SHLVL", "_"].contains(name),
                "unexpected variable {name}"
            );
        }
    }

    #[tokio::test]
    async fn test_non_zero_exit_reported() {
        let config = SandboxConfig::new("fail").with_timeout(Duration::from_secs(5));
        let result = ProcessBackend
            .execute(&config, &sh("echo boom >&2; exit 3"), Vec::new())
            .await
            .unwrap();
        assert!(!result.success());
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stderr.trim(), "boom");
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let config = SandboxConfig::new("slow").with_timeout(Duration::from_millis(100));
        let result = ProcessBackend
            .execute(&config, &sh("sleep 5"), Vec::new())
            .await;
        assert!(matches!(result, Err(IsolationError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_output_cap_enforced() {
        let config = SandboxConfig::new("chatty")
            .with_timeout(Duration::from_secs(5))
            .with_max_output(4);
        let result = ProcessBackend
            .execute(&config, &sh("echo 0123456789"), Vec::new())
            .await;
        assert!(matches!(result, Err(IsolationError::ResourceLimit(_))));
    }

    #[tokio::test]
    async fn test_endless_output_stopped_at_cap() {
        let config = SandboxConfig::new("flood")
            .with_timeout(Duration::from_secs(30))
            .with_max_output(1024);
        let start = std::time::Instant::now();
        let result = ProcessBackend
            .execute(&config, &sh("yes flood"), Vec::new())
            .await;
        assert!(matches!(result, Err(IsolationError::ResourceLimit(_))));
        assert!(start.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let result = ProcessBackend
            .execute(&SandboxConfig::new("empty"), &[], Vec::new())
            .await;
        assert!(matches!(result, Err(IsolationError::Execution(_))));
    }
}
