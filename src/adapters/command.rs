//! External Tool Execution
//!
//! Runs host tools (virsh, chcon, getenforce, systemctl) with a time budget
//! and maps failures onto `AdapterError`.

use std::time::Duration;
use tokio::process::Command;
use tokio::time;
use tracing::debug;

use super::{AdapterError, AdapterResult};

/// Tool runner with a per-invocation timeout
#[derive(Debug, Clone)]
pub struct ToolRunner {
    timeout: Duration,
}

impl Default for ToolRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

/// Captured output of a finished tool
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub success: bool,
    pub status: String,
    pub stdout: String,
    pub stderr: String,
}

impl ToolRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run a tool and return its output regardless of exit status
    pub async fn output(&self, program: &str, args: &[&str]) -> AdapterResult<ToolOutput> {
        let rendered = render(program, args);
        debug!("Running: {}", rendered);

        let child = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output();

        let output = match time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(AdapterError::io(format!("Failed to run `{}`", rendered), e)),
            Err(_) => {
                return Err(AdapterError::Timeout {
                    operation: rendered,
                    after: self.timeout,
                })
            }
        };

        Ok(ToolOutput {
            success: output.status.success(),
            status: output.status.to_string(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Run a tool and return stdout, failing on a non-zero exit
    pub async fn run(&self, program: &str, args: &[&str]) -> AdapterResult<String> {
        let output = self.output(program, args).await?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(AdapterError::CommandFailed {
                command: render(program, args),
                status: output.status,
                stderr: output.stderr,
            })
        }
    }
}

fn render(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}
