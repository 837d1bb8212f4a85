//! Control probe adapter
//!
//! Runs commands against named endpoints through an external
//! command-execution transport. Output is returned verbatim; deciding
//! whether it is correct is the matcher's job.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{HarnessError, HarnessResult, ProbeError};

/// Completed command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProbeOutput {
    pub fn ok(stdout: &str) -> Self {
        Self { exit_code: 0, stdout: stdout.to_string(), stderr: String::new() }
    }

    pub fn failed(exit_code: i32, stderr: &str) -> Self {
        Self { exit_code, stdout: String::new(), stderr: stderr.to_string() }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into `CommandFailure`
    pub fn check_success(self) -> Result<Self, ProbeError> {
        if self.success() {
            Ok(self)
        } else {
            Err(ProbeError::CommandFailure { exit_code: self.exit_code, stderr: self.stderr })
        }
    }
}

/// Command-execution capability: synchronous request/response, no streaming
#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn exec(&self, endpoint: &str, command: &str, timeout: Duration) -> Result<ProbeOutput, ProbeError>;
}

/// Adapter the case engine uses to run probes. Enforces the timeout itself
/// so a transport that never answers still resolves as `Timeout`.
#[derive(Clone)]
pub struct ProbeAdapter {
    transport: Arc<dyn CommandTransport>,
}

impl ProbeAdapter {
    pub fn new(transport: Arc<dyn CommandTransport>) -> Self {
        Self { transport }
    }

    pub async fn run(&self, endpoint: &str, command: &str, timeout: Duration) -> Result<ProbeOutput, ProbeError> {
        debug!(endpoint, command, "running probe");
        match tokio::time::timeout(timeout, self.transport.exec(endpoint, command, timeout)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(endpoint, command, "probe timed out after {:?}", timeout);
                Err(ProbeError::Timeout(timeout))
            }
        }
    }

    /// Like [`run`](Self::run) but a non-zero exit is an error
    pub async fn run_checked(&self, endpoint: &str, command: &str, timeout: Duration) -> Result<ProbeOutput, ProbeError> {
        self.run(endpoint, command, timeout).await?.check_success()
    }
}

/// Runs commands as local subprocesses built from an argv template.
///
/// `{endpoint}` and `{command}` placeholders are substituted per call, so
/// `["docker", "exec", "{endpoint}", "sh", "-c", "{command}"]` targets
/// containerlab nodes and `["sh", "-c", "{command}"]` runs on the host.
#[derive(Debug, Clone)]
pub struct ShellTransport {
    argv: Vec<String>,
}

impl ShellTransport {
    pub fn new(argv: Vec<String>) -> HarnessResult<Self> {
        if argv.is_empty() {
            return Err(HarnessError::InvalidCase("empty exec template".to_string()));
        }
        if !argv.iter().any(|a| a.contains("{command}")) {
            return Err(HarnessError::InvalidCase(
                "exec template must contain a {command} placeholder".to_string(),
            ));
        }
        Ok(Self { argv })
    }

    /// `docker exec <endpoint> sh -c <command>`
    pub fn docker() -> Self {
        Self {
            argv: ["docker", "exec", "{endpoint}", "sh", "-c", "{command}"]
                .map(String::from)
                .to_vec(),
        }
    }

    /// `sh -c <command>` on the local host; the endpoint is ignored
    pub fn local() -> Self {
        Self { argv: ["sh", "-c", "{command}"].map(String::from).to_vec() }
    }

    fn render(&self, endpoint: &str, command: &str) -> Vec<String> {
        self.argv
            .iter()
            .map(|a| a.replace("{endpoint}", endpoint).replace("{command}", command))
            .collect()
    }
}

#[async_trait]
impl CommandTransport for ShellTransport {
    async fn exec(&self, endpoint: &str, command: &str, _timeout: Duration) -> Result<ProbeOutput, ProbeError> {
        let argv = self.render(endpoint, command);

        // Dropping the future (timeout) kills the child
        let output = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProbeError::ConnectError {
                endpoint: endpoint.to_string(),
                reason: format!("failed to spawn {}: {}", argv[0], e),
            })?;

        Ok(ProbeOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::ScriptedCommands;

    #[test]
    fn test_template_rendering() {
        let docker = ShellTransport::docker();
        assert_eq!(
            docker.render("clab-sonic-lab-sonic1", "ip route show"),
            vec!["docker", "exec", "clab-sonic-lab-sonic1", "sh", "-c", "ip route show"]
        );
        assert!(ShellTransport::new(vec!["ssh".to_string(), "{endpoint}".to_string()]).is_err());
    }

    #[test]
    fn test_check_success() {
        assert!(ProbeOutput::ok("true").check_success().is_ok());
        let err = ProbeOutput::failed(2, "boom").check_success().unwrap_err();
        assert_eq!(err, ProbeError::CommandFailure { exit_code: 2, stderr: "boom".to_string() });
    }

    #[tokio::test]
    async fn test_local_shell_captures_output() {
        let adapter = ProbeAdapter::new(Arc::new(ShellTransport::local()));
        let out = adapter
            .run("localhost", "echo hello; echo oops >&2; exit 3", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout, "hello");
        assert_eq!(out.stderr, "oops");
    }

    #[tokio::test]
    async fn test_local_shell_timeout_is_distinct() {
        let adapter = ProbeAdapter::new(Arc::new(ShellTransport::local()));
        let err = adapter
            .run("localhost", "sleep 5", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_missing_binary_is_connect_error() {
        let transport = ShellTransport::new(vec![
            "/nonexistent/netcheck-exec".to_string(),
            "{command}".to_string(),
        ])
        .unwrap();
        let adapter = ProbeAdapter::new(Arc::new(transport));
        let err = adapter.run("x", "true", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ProbeError::ConnectError { .. }));
    }

    #[tokio::test]
    async fn test_hanging_transport_times_out() {
        let scripted = ScriptedCommands::new();
        scripted.hang("sonic1", "ping -c 3 10.0.0.2");
        let adapter = ProbeAdapter::new(Arc::new(scripted));

        let start = std::time::Instant::now();
        let err = adapter
            .run("sonic1", "ping -c 3 10.0.0.2", Duration::from_millis(80))
            .await
            .unwrap_err();
        assert_eq!(err, ProbeError::Timeout(Duration::from_millis(80)));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_run_checked_rejects_nonzero_exit() {
        let scripted = ScriptedCommands::new();
        scripted.reply("sonic1", "false", ProbeOutput::failed(1, ""));
        let adapter = ProbeAdapter::new(Arc::new(scripted));
        let err = adapter.run_checked("sonic1", "false", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ProbeError::CommandFailure { exit_code: 1, .. }));
    }
}
