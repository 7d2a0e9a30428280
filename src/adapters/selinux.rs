// SELinux Label Store
//
// Host adapter over SELinux tooling:
// - file contexts via `stat -c %C` and `chcon`
// - enforcement mode via `getenforce` / `setenforce`
// - process contexts via /proc/<pid>/attr/current

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::command::ToolRunner;
use super::{AdapterError, AdapterResult, LabelStore};
use crate::label::EnforcementMode;

/// Label store backed by the host's SELinux tools
#[derive(Debug, Clone)]
pub struct SelinuxLabelStore {
    runner: ToolRunner,
    proc_root: PathBuf,
}

impl SelinuxLabelStore {
    pub fn new(runner: ToolRunner) -> Self {
        Self {
            runner,
            proc_root: PathBuf::from("/proc"),
        }
    }

    async fn ensure_exists(path: &Path) -> AdapterResult<()> {
        tokio::fs::metadata(path)
            .await
            .map(|_| ())
            .map_err(|e| AdapterError::from_path_io(path, e))
    }
}

#[async_trait]
impl LabelStore for SelinuxLabelStore {
    async fn label_of(&self, path: &Path) -> AdapterResult<String> {
        Self::ensure_exists(path).await?;
        let path_str = path.to_string_lossy();
        let out = self.runner.run("stat", &["-c", "%C", &path_str]).await?;
        let context = out.trim();
        if context.is_empty() || context == "?" {
            return Err(AdapterError::Unsupported(format!(
                "no SELinux context on {}",
                path.display()
            )));
        }
        Ok(context.to_string())
    }

    async fn set_label(&self, path: &Path, label: &str) -> AdapterResult<()> {
        Self::ensure_exists(path).await?;
        let path_str = path.to_string_lossy();
        debug!("chcon {} {}", label, path_str);
        match self.runner.run("chcon", &[label, &path_str]).await {
            Ok(_) => Ok(()),
            Err(AdapterError::CommandFailed { stderr, .. })
                if stderr.contains("Permission denied") || stderr.contains("not permitted") =>
            {
                Err(AdapterError::PermissionDenied(path.to_path_buf()))
            }
            Err(e) => Err(e),
        }
    }

    async fn host_mode(&self) -> AdapterResult<EnforcementMode> {
        let out = self.runner.run("getenforce", &[]).await?;
        out.parse()
            .map_err(|e: String| AdapterError::parse("getenforce output", e))
    }

    async fn set_host_mode(&self, mode: EnforcementMode) -> AdapterResult<()> {
        let current = self.host_mode().await?;
        if current == mode {
            return Ok(());
        }

        let arg = match (current, mode) {
            (EnforcementMode::Disabled, _) | (_, EnforcementMode::Disabled) => {
                return Err(AdapterError::Unsupported(format!(
                    "switching SELinux between {} and {} requires a reboot",
                    current, mode
                )));
            }
            (_, EnforcementMode::Enforcing) => "1",
            (_, EnforcementMode::Permissive) => "0",
        };

        self.runner.run("setenforce", &[arg]).await?;
        info!("Host SELinux mode changed: {} -> {}", current, mode);
        Ok(())
    }

    async fn process_label(&self, pid: u32) -> AdapterResult<String> {
        let path = self
            .proc_root
            .join(pid.to_string())
            .join("attr")
            .join("current");
        let raw = tokio::fs::read(&path)
            .await
            .map_err(|e| AdapterError::from_path_io(&path, e))?;
        let context = clean_context(&raw);
        if context.is_empty() {
            return Err(AdapterError::parse(
                path.display().to_string(),
                "empty process context",
            ));
        }
        Ok(context)
    }
}

// /proc attr files are NUL-terminated
fn clean_context(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(['\0', '\n'])
        .trim()
        .to_string()
}
