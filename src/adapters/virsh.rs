// virsh VM Control
//
// VM control plane adapter over the `virsh` command line:
// - descriptors: `dumpxml [--inactive]` / `define`
// - lifecycle: `start` / `destroy` / `shutdown` + `domstate` polling
// - runtime pid from the qemu driver's pid file

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::command::ToolRunner;
use super::{AdapterError, AdapterResult, StartError, VmControl};
use crate::descriptor::VmDescriptor;

/// VM control backed by virsh
#[derive(Debug, Clone)]
pub struct VirshControl {
    runner: ToolRunner,
    uri: Option<String>,
    pid_dir: PathBuf,
    poll_interval: Duration,
}

impl VirshControl {
    pub fn new(runner: ToolRunner, uri: Option<String>) -> Self {
        Self {
            runner,
            uri,
            pid_dir: PathBuf::from("/run/libvirt/qemu"),
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Override the directory holding `<name>.pid` files
    pub fn with_pid_dir(mut self, pid_dir: impl Into<PathBuf>) -> Self {
        self.pid_dir = pid_dir.into();
        self
    }

    fn args<'a>(&'a self, args: &[&'a str]) -> Vec<&'a str> {
        let mut full = Vec::with_capacity(args.len() + 2);
        if let Some(uri) = &self.uri {
            full.push("-c");
            full.push(uri.as_str());
        }
        full.extend_from_slice(args);
        full
    }

    async fn virsh(&self, args: &[&str]) -> AdapterResult<String> {
        self.runner.run("virsh", &self.args(args)).await
    }

    async fn dumpxml(&self, name: &str, inactive: bool) -> AdapterResult<VmDescriptor> {
        let xml = if inactive {
            self.virsh(&["dumpxml", "--inactive", "--security-info", name])
                .await?
        } else {
            self.virsh(&["dumpxml", "--security-info", name]).await?
        };
        VmDescriptor::from_xml(xml).map_err(|e| AdapterError::parse("domain XML", e))
    }

    async fn domstate(&self, name: &str) -> AdapterResult<String> {
        Ok(self.virsh(&["domstate", name]).await?.trim().to_string())
    }
}

#[async_trait]
impl VmControl for VirshControl {
    async fn read_descriptor(&self, name: &str) -> AdapterResult<VmDescriptor> {
        self.dumpxml(name, true).await
    }

    async fn write_descriptor(&self, descriptor: &VmDescriptor) -> AdapterResult<()> {
        let path = std::env::temp_dir().join(format!("svirt-verify-{}.xml", Uuid::new_v4()));
        tokio::fs::write(&path, descriptor.xml())
            .await
            .map_err(|e| AdapterError::from_path_io(&path, e))?;

        let path_str = path.to_string_lossy().into_owned();
        let result = self.virsh(&["define", &path_str]).await;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            debug!("Failed to remove {}: {}", path.display(), e);
        }
        result?;

        info!("Defined domain {}", descriptor.name());
        Ok(())
    }

    async fn start_vm(&self, descriptor: &VmDescriptor) -> Result<(), StartError> {
        let name = descriptor.name();
        match self.virsh(&["start", name]).await {
            Ok(_) => {
                info!("Started domain {}", name);
                Ok(())
            }
            Err(e) => Err(classify_start_failure(name, e)),
        }
    }

    async fn destroy_vm(&self, name: &str) -> AdapterResult<()> {
        self.virsh(&["destroy", name]).await?;
        info!("Destroyed domain {}", name);
        Ok(())
    }

    async fn shutdown_vm(&self, name: &str) -> AdapterResult<()> {
        self.virsh(&["shutdown", name]).await?;
        // Completion depends on the guest acting on the ACPI event; the
        // caller bounds the wait.
        loop {
            let state = self.domstate(name).await?;
            if state == "shut off" {
                info!("Domain {} shut down", name);
                return Ok(());
            }
            debug!("Waiting for {} to shut down (state: {})", name, state);
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn vm_pid(&self, name: &str) -> AdapterResult<u32> {
        let path = self.pid_dir.join(format!("{}.pid", name));
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AdapterError::VmNotRunning(name.to_string()))
            }
            Err(e) => return Err(AdapterError::from_path_io(&path, e)),
        };
        raw.trim()
            .parse()
            .map_err(|e| AdapterError::parse(path.display().to_string(), e))
    }

    async fn live_descriptor(&self, name: &str) -> AdapterResult<VmDescriptor> {
        self.dumpxml(name, false).await
    }
}

// stderr fragments of failures that say nothing about the label policy
const ENVIRONMENT_FAILURES: &[&str] = &[
    "failed to connect to the hypervisor",
    "no connection driver available",
    "failed to get domain",
    "domain not found",
    "domain is already running",
    "domain is already active",
    "no such file or directory",
];

// stderr fragments of the control plane refusing the security context
const LABEL_REFUSALS: &[&str] = &[
    "permission denied",
    "could not open",
    "security",
    "selinux",
    "seclabel",
    "unable to set",
];

/// Map a failed `virsh start` to a refusal or an unavailable control plane.
///
/// Only refusals that name the security context count as `Rejected`;
/// anything else is an environment problem.
fn classify_start_failure(vm: &str, error: AdapterError) -> StartError {
    let stderr = match &error {
        AdapterError::CommandFailed { stderr, .. } => stderr.to_lowercase(),
        _ => return StartError::Unavailable(error),
    };

    let environment = ENVIRONMENT_FAILURES.iter().any(|f| stderr.contains(f));
    let refusal = LABEL_REFUSALS.iter().any(|f| stderr.contains(f));
    if refusal && !environment {
        match error {
            AdapterError::CommandFailed { stderr, .. } => StartError::Rejected {
                vm: vm.to_string(),
                message: stderr.trim().to_string(),
            },
            other => StartError::Unavailable(other),
        }
    } else {
        StartError::Unavailable(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed_start(stderr: &str) -> StartError {
        classify_start_failure(
            "vm1",
            AdapterError::CommandFailed {
                command: "virsh start vm1".to_string(),
                status: "exit status: 1".to_string(),
                stderr: stderr.to_string(),
            },
        )
    }

    #[test]
    fn test_label_refusals_are_rejected() {
        for stderr in [
            "error: Failed to start domain 'vm1'\nerror: internal error: qemu unexpectedly closed the monitor: \
qemu-kvm: -blockdev {...}: Could not open '/var/lib/libvirt/images/vm1.qcow2': Permission denied",
            "error: Failed to start domain 'vm1'\nerror: unable to set security context \
'system_u:object_r:svirt_image_t:s0:c1,c2' on '/var/lib/libvirt/images/vm1.qcow2'",
            "error: Failed to start domain 'vm1'\nerror: internal error: security label is missing",
        ] {
            match failed_start(stderr) {
                StartError::Rejected { vm, message } => {
                    assert_eq!(vm, "vm1");
                    assert!(message.starts_with("error: Failed to start domain"));
                }
                other => panic!("expected rejection for {:?}, got {:?}", stderr, other),
            }
        }
    }

    #[test]
    fn test_environment_failures_are_unavailable() {
        for stderr in [
            "error: failed to connect to the hypervisor\nerror: Failed to connect socket to \
'/var/run/libvirt/virtqemud-sock': No such file or directory",
            "error: failed to get domain 'vm1'",
            "error: Domain not found: no domain with matching name 'vm1'",
            "error: Failed to start domain 'vm1'\nerror: Requested operation is not valid: domain is already running",
            "error: Failed to start domain 'vm1'\nerror: Cannot access storage file \
'/var/lib/libvirt/images/vm1.qcow2': No such file or directory",
            "error: Failed to start domain 'vm1'\nerror: internal error: process exited while connecting to monitor",
        ] {
            assert!(
                matches!(failed_start(stderr), StartError::Unavailable(_)),
                "expected unavailable for {:?}",
                stderr
            );
        }
    }

    #[test]
    fn test_non_command_errors_are_unavailable() {
        let error = AdapterError::Timeout {
            operation: "virsh start vm1".to_string(),
            after: Duration::from_secs(30),
        };
        assert!(matches!(
            classify_start_failure("vm1", error),
            StartError::Unavailable(AdapterError::Timeout { .. })
        ));
    }

    #[test]
    fn test_args_with_uri() {
        let control = VirshControl::new(ToolRunner::default(), Some("qemu:///system".into()));
        assert_eq!(
            control.args(&["start", "vm1"]),
            vec!["-c", "qemu:///system", "start", "vm1"]
        );

        let control = VirshControl::new(ToolRunner::default(), None);
        assert_eq!(control.args(&["destroy", "vm1"]), vec!["destroy", "vm1"]);
    }

    #[tokio::test]
    async fn test_vm_pid_from_pid_file() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("vm1.pid"), "12345\n").unwrap();

        let control = VirshControl::new(ToolRunner::default(), None).with_pid_dir(temp.path());
        assert_eq!(control.vm_pid("vm1").await.unwrap(), 12345);
    }

    #[tokio::test]
    async fn test_vm_pid_not_running() {
        let temp = tempfile::tempdir().unwrap();
        let control = VirshControl::new(ToolRunner::default(), None).with_pid_dir(temp.path());
        assert!(matches!(
            control.vm_pid("vm1").await,
            Err(AdapterError::VmNotRunning(name)) if name == "vm1"
        ));
    }

    #[tokio::test]
    async fn test_vm_pid_garbage() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("vm1.pid"), "not-a-pid").unwrap();
        let control = VirshControl::new(ToolRunner::default(), None).with_pid_dir(temp.path());
        assert!(matches!(
            control.vm_pid("vm1").await,
            Err(AdapterError::Parse { .. })
        ));
    }
}
