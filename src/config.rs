// Configuration File Support
//
// TOML configuration for svirt-verify with environment variable overrides.
// The default file lives in the XDG config directory:
// ~/.config/svirt-verify/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::label::EnforcementMode;
use crate::verifier::{RestoreExpectation, Teardown, VerifierOptions};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,

    /// Host security settings
    pub host: HostConfig,

    /// VM under test
    pub vm: VmConfig,

    /// Labels used by the scenario matrix
    pub labels: LabelsConfig,

    pub report: ReportConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Log file path (if log_to_file is true)
    pub log_file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
            log_to_file: false,
            log_file: None,
        }
    }
}

/// Host configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HostConfig {
    /// Enforcement mode forced for the duration of a run
    pub enforcement_mode: EnforcementMode,

    /// libvirt connection URI (virsh -c)
    pub libvirt_uri: Option<String>,

    /// Temporary `security_driver` override for the qemu driver
    pub security_driver: Option<String>,

    pub qemu_conf_path: String,

    /// systemd unit restarted after driver overrides
    pub daemon: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            enforcement_mode: EnforcementMode::Enforcing,
            libvirt_uri: Some("qemu:///system".to_string()),
            security_driver: None,
            qemu_conf_path: "/etc/libvirt/qemu.conf".to_string(),
            daemon: "libvirtd".to_string(),
        }
    }
}

/// VM configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VmConfig {
    /// Domain name
    pub name: String,

    /// Disk images whose labels are verified; empty means every disk
    /// source of the domain
    pub disks: Vec<String>,

    pub teardown: Teardown,

    pub start_timeout_secs: u64,
    pub teardown_timeout_secs: u64,

    /// Timeout for each external command (virsh, chcon, ...)
    pub command_timeout_secs: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            name: "avocado-vt-vm1".to_string(),
            disks: Vec::new(),
            teardown: Teardown::Destroy,
            start_timeout_secs: 120,
            teardown_timeout_secs: 120,
            command_timeout_secs: 30,
        }
    }
}

/// Label configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LabelsConfig {
    /// MAC model written into the descriptor
    pub model: String,

    /// Process context declared by static policies
    pub static_label: String,

    /// Image context readable by `static_label`
    pub matching_image_label: String,

    /// Image context `static_label` is denied access to
    pub mismatched_image_label: String,

    pub restore_expectation: RestoreExpectation,
}

impl Default for LabelsConfig {
    fn default() -> Self {
        Self {
            model: "selinux".to_string(),
            static_label: "system_u:system_r:svirt_t:s0:c1,c2".to_string(),
            matching_image_label: "system_u:object_r:svirt_image_t:s0".to_string(),
            mismatched_image_label: "system_u:object_r:svirt_image_t:s0:c3,c4".to_string(),
            restore_expectation: RestoreExpectation::Auto,
        }
    }
}

/// Report configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReportConfig {
    /// Directory for matrix reports
    pub output_dir: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: ".".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the default XDG config directory
    ///
    /// Returns default configuration when the file does not exist.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed or
    /// fails validation.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        let config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Default configuration file path
    ///
    /// Returns `~/.config/svirt-verify/config.toml` on Linux
    pub fn config_path() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "svirt-verify") {
            proj_dirs.config_dir().join("config.toml")
        } else {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home)
                .join(".config")
                .join("svirt-verify")
                .join("config.toml")
        }
    }

    /// Apply environment variable overrides
    ///
    /// - SVIRT_VERIFY_LOG_LEVEL
    /// - SVIRT_VERIFY_LOG_FORMAT
    /// - SVIRT_VERIFY_VM_NAME
    /// - SVIRT_VERIFY_LIBVIRT_URI
    /// - SVIRT_VERIFY_ENFORCEMENT_MODE
    /// - SVIRT_VERIFY_START_TIMEOUT_SECS
    /// - SVIRT_VERIFY_OUTPUT_DIR
    fn apply_env_overrides(mut self) -> Self {
        if let Ok(level) = std::env::var("SVIRT_VERIFY_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("SVIRT_VERIFY_LOG_FORMAT") {
            self.logging.format = format;
        }

        if let Ok(name) = std::env::var("SVIRT_VERIFY_VM_NAME") {
            if !name.is_empty() {
                self.vm.name = name;
            }
        }
        if let Ok(uri) = std::env::var("SVIRT_VERIFY_LIBVIRT_URI") {
            self.host.libvirt_uri = Some(uri).filter(|u| !u.is_empty());
        }
        if let Ok(mode) = std::env::var("SVIRT_VERIFY_ENFORCEMENT_MODE") {
            if let Ok(mode) = mode.parse::<EnforcementMode>() {
                self.host.enforcement_mode = mode;
            }
        }
        if let Ok(secs) = std::env::var("SVIRT_VERIFY_START_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse::<u64>() {
                if secs > 0 {
                    self.vm.start_timeout_secs = secs;
                }
            }
        }
        if let Ok(dir) = std::env::var("SVIRT_VERIFY_OUTPUT_DIR") {
            self.report.output_dir = dir;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }
        if self.logging.log_to_file && self.logging.log_file.is_none() {
            anyhow::bail!("log_to_file is set but no log_file is configured");
        }

        if self.host.enforcement_mode == EnforcementMode::Disabled {
            anyhow::bail!("Enforcement mode cannot be forced to disabled at runtime");
        }
        if self.host.daemon.is_empty() {
            anyhow::bail!("Daemon name must not be empty");
        }

        if self.vm.name.is_empty() {
            anyhow::bail!("VM name must not be empty");
        }
        if self.vm.start_timeout_secs == 0 || self.vm.teardown_timeout_secs == 0 {
            anyhow::bail!("VM start and teardown timeouts must be > 0");
        }
        if self.vm.command_timeout_secs == 0 {
            anyhow::bail!("Command timeout must be > 0");
        }

        if self.labels.model.is_empty() {
            anyhow::bail!("Label model must not be empty");
        }
        for (name, label) in [
            ("static_label", &self.labels.static_label),
            ("matching_image_label", &self.labels.matching_image_label),
            ("mismatched_image_label", &self.labels.mismatched_image_label),
        ] {
            if label.split(':').count() < 4 {
                anyhow::bail!(
                    "labels.{} is not a security context (user:role:type:level): {}",
                    name,
                    label
                );
            }
        }
        if self.labels.matching_image_label == self.labels.mismatched_image_label {
            anyhow::bail!("Matching and mismatched image labels must differ");
        }

        Ok(())
    }

    pub fn verifier_options(&self) -> VerifierOptions {
        VerifierOptions {
            start_timeout: Duration::from_secs(self.vm.start_timeout_secs),
            teardown_timeout: Duration::from_secs(self.vm.teardown_timeout_secs),
            restore_expectation: self.labels.restore_expectation,
            security_driver: self.host.security_driver.clone(),
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.vm.command_timeout_secs)
    }
}
