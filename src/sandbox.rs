use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::warn;

use crate::cleanup;

const MAX_OUTPUT_DEFAULT: usize = 64 * 1024;

pub struct SandboxOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

impl SandboxOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

pub struct SandboxConfig {
    pub timeout: Duration,
    pub max_output_bytes: usize,
    pub memory_limit_mb: Option<u64>,
    pub nice: Option<i32>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_output_bytes: MAX_OUTPUT_DEFAULT,
            memory_limit_mb: Some(2048),
            nice: Some(10),
        }
    }
}

fn truncate_output(s: &[u8], max: usize) -> String {
    if s.len() <= max {
        String::from_utf8_lossy(s).to_string()
    } else {
        let truncated = String::from_utf8_lossy(&s[..max]).to_string();
        format!("{}\n\n... [truncated at {} bytes, total {}]", truncated, max, s.len())
    }
}

/// Build a shell command string with optional resource limits.
fn wrap_command(cmd: &str, cfg: &SandboxConfig) -> String {
    let mut parts = Vec::new();

    if let Some(mem_mb) = cfg.memory_limit_mb {
        let kb = mem_mb * 1024;
        parts.push(format!("ulimit -v {} 2>/dev/null;", kb));
    }

    if let Some(nice) = cfg.nice {
        parts.push(format!("nice -n {}", nice));
    }

    parts.push(cmd.to_string());
    parts.join(" ")
}

/// Run `cmd args...` through `sh -c` in `cwd`. A timeout kills the whole
/// process group and is reported in the output, not as an error.
pub async fn run(
    cmd: &str,
    args: &[&str],
    cwd: &Path,
    cfg: &SandboxConfig,
    env: Option<&[(&str, &str)]>,
) -> Result<SandboxOutput> {
    let full_cmd = if args.is_empty() {
        cmd.to_string()
    } else {
        format!("{} {}", cmd, args.join(" "))
    };

    let wrapped = wrap_command(&full_cmd, cfg);

    let mut command = Command::new("sh");
    command.arg("-c").arg(&wrapped).current_dir(cwd);
    // New process group so a timeout can kill the tree
    command.process_group(0);
    command.kill_on_drop(true);

    if let Some(env_vars) = env {
        for (k, v) in env_vars {
            command.env(k, v);
        }
    }

    command
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    let child = command.spawn().context("Failed to spawn process")?;
    let pid = child.id();

    match tokio::time::timeout(cfg.timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(SandboxOutput {
            stdout: truncate_output(&output.stdout, cfg.max_output_bytes),
            stderr: truncate_output(&output.stderr, cfg.max_output_bytes),
            exit_code: output.status.code().unwrap_or(-1),
            timed_out: false,
        }),
        Ok(Err(e)) => anyhow::bail!("Process error: {}", e),
        Err(_) => {
            warn!(
                "Command timed out after {}s: {}",
                cfg.timeout.as_secs_f32(),
                full_cmd.chars().take(100).collect::<String>()
            );
            if let Some(pgid) = pid {
                cleanup::kill_process_group(pgid).await;
            }
            Ok(SandboxOutput {
                stdout: String::new(),
                stderr: format!("timed out after {:?}", cfg.timeout),
                exit_code: -1,
                timed_out: true,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_echo() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = SandboxConfig::default();
        let out = run("echo", &["hello"], tmp.path(), &cfg, None).await.unwrap();
        assert_eq!(out.exit_code, 0);
        assert!(out.success());
        assert!(out.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = SandboxConfig {
            timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let out = run("sleep", &["10"], tmp.path(), &cfg, None).await.unwrap();
        assert!(out.timed_out);
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_run_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = SandboxConfig::default();
        let out = run("false", &[], tmp.path(), &cfg, None).await.unwrap();
        assert_ne!(out.exit_code, 0);
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_run_env() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = SandboxConfig::default();
        let out = run("echo $GREETING", &[], tmp.path(), &cfg, Some(&[("GREETING", "hi")]))
            .await
            .unwrap();
        assert!(out.stdout.contains("hi"));
    }

    #[test]
    fn test_truncate_output() {
        let data = vec![b'A'; 2000];
        let result = truncate_output(&data, 100);
        assert!(result.contains("truncated"));
        assert!(result.len() < 2000);
    }

    #[test]
    fn test_wrap_command_limits() {
        let cfg = SandboxConfig {
            nice: Some(15),
            memory_limit_mb: Some(1),
            ..Default::default()
        };
        let wrapped = wrap_command("python3 candidate.py", &cfg);
        assert!(wrapped.starts_with("ulimit -v 1024"));
        assert!(wrapped.contains("nice -n 15 python3 candidate.py"));
    }
}
