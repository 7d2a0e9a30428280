// libvirtd Service Manager
//
// Applies persisted overrides to the qemu driver configuration
// (/etc/libvirt/qemu.conf) and restarts the daemon through systemd.
// The first override snapshots the file so restore_overrides can put it
// back byte for byte.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::info;

use super::command::ToolRunner;
use super::{AdapterError, AdapterResult, ServiceManager};

/// Service manager for libvirtd and its qemu.conf
#[derive(Debug)]
pub struct LibvirtdService {
    runner: ToolRunner,
    conf_path: PathBuf,
    daemon: String,
    backup: Mutex<Option<String>>,
}

impl LibvirtdService {
    pub fn new(
        runner: ToolRunner,
        conf_path: impl Into<PathBuf>,
        daemon: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            conf_path: conf_path.into(),
            daemon: daemon.into(),
            backup: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ServiceManager for LibvirtdService {
    async fn apply_override(&self, key: &str, value: &str) -> AdapterResult<()> {
        let content = tokio::fs::read_to_string(&self.conf_path)
            .await
            .map_err(|e| AdapterError::from_path_io(&self.conf_path, e))?;

        let mut backup = self.backup.lock().await;
        if backup.is_none() {
            *backup = Some(content.clone());
        }

        let updated = set_conf_value(&content, key, value);
        tokio::fs::write(&self.conf_path, updated)
            .await
            .map_err(|e| AdapterError::from_path_io(&self.conf_path, e))?;

        info!("{}: {} = {}", self.conf_path.display(), key, value);
        Ok(())
    }

    async fn restore_overrides(&self) -> AdapterResult<()> {
        let mut backup = self.backup.lock().await;
        if let Some(original) = backup.as_ref() {
            tokio::fs::write(&self.conf_path, original)
                .await
                .map_err(|e| AdapterError::from_path_io(&self.conf_path, e))?;
            *backup = None;
            info!("Restored {}", self.conf_path.display());
        }
        Ok(())
    }

    async fn restart_daemon(&self) -> AdapterResult<()> {
        self.runner
            .run("systemctl", &["restart", &self.daemon])
            .await?;
        info!("Restarted {}", self.daemon);
        Ok(())
    }
}

/// Set `key = value` in a libvirt-style config, replacing the first active
/// or commented-out assignment of `key`, appending otherwise
pub fn set_conf_value(content: &str, key: &str, value: &str) -> String {
    let assignment = format!("{} = {}", key, value);
    let mut replaced = false;

    let mut lines: Vec<String> = content
        .lines()
        .map(|line| {
            if !replaced && assigns(line, key) {
                replaced = true;
                assignment.clone()
            } else {
                line.to_string()
            }
        })
        .collect();

    if !replaced {
        lines.push(assignment);
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn assigns(line: &str, key: &str) -> bool {
    let body = line.trim_start().trim_start_matches('#').trim_start();
    match body.strip_prefix(key) {
        Some(rest) => rest.trim_start().starts_with('='),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QEMU_CONF: &str = "# Master configuration file for the QEMU driver.\n\
#vnc_listen = \"0.0.0.0\"\n\
#security_driver = \"selinux\"\n\
#security_default_confined = 1\n";

    #[test]
    fn test_set_conf_value_replaces_commented_line() {
        let out = set_conf_value(QEMU_CONF, "security_driver", "\"none\"");
        assert!(out.contains("\nsecurity_driver = \"none\"\n"));
        assert!(!out.contains("#security_driver"));
        // Similar prefixes untouched
        assert!(out.contains("#security_default_confined = 1"));
    }

    #[test]
    fn test_set_conf_value_appends_when_absent() {
        let out = set_conf_value("user = \"qemu\"\n", "security_driver", "\"selinux\"");
        assert_eq!(out, "user = \"qemu\"\nsecurity_driver = \"selinux\"\n");
    }

    #[tokio::test]
    async fn test_apply_and_restore_override() {
        let temp = tempfile::tempdir().unwrap();
        let conf = temp.path().join("qemu.conf");
        std::fs::write(&conf, QEMU_CONF).unwrap();

        let service = LibvirtdService::new(ToolRunner::default(), &conf, "libvirtd");
        service
            .apply_override("security_driver", "\"none\"")
            .await
            .unwrap();
        service
            .apply_override("security_default_confined", "0")
            .await
            .unwrap();

        let content = std::fs::read_to_string(&conf).unwrap();
        assert!(content.contains("security_driver = \"none\""));
        assert!(content.contains("security_default_confined = 0"));

        service.restore_overrides().await.unwrap();
        assert_eq!(std::fs::read_to_string(&conf).unwrap(), QEMU_CONF);

        // Nothing to restore the second time
        service.restore_overrides().await.unwrap();
        assert_eq!(std::fs::read_to_string(&conf).unwrap(), QEMU_CONF);
    }

    #[tokio::test]
    async fn test_apply_override_missing_file() {
        let service = LibvirtdService::new(
            ToolRunner::default(),
            "/nonexistent/svirt-verify/qemu.conf",
            "libvirtd",
        );
        assert!(matches!(
            service.apply_override("security_driver", "\"none\"").await,
            Err(AdapterError::NotFound(_))
        ));
    }
}
