// Host Collaborator Adapters
//
// Narrow interfaces over the host facilities the verifier drives:
// - LabelStore: SELinux file/process contexts and enforcement mode
// - VmControl: libvirt domain lifecycle and descriptors
// - ServiceManager: daemon config overrides and restarts
//
// Each trait has a command-backed implementation and the in-memory FakeHost.

pub mod command;
pub mod error;
pub mod fake;
pub mod libvirtd;
pub mod selinux;
pub mod virsh;

use async_trait::async_trait;
use std::path::Path;

use crate::descriptor::VmDescriptor;
use crate::label::EnforcementMode;

pub use error::{AdapterError, StartError};
pub use fake::FakeHost;
pub use libvirtd::LibvirtdService;
pub use selinux::SelinuxLabelStore;
pub use virsh::VirshControl;

pub type AdapterResult<T> = Result<T, AdapterError>;

/// Host security-context subsystem
#[async_trait]
pub trait LabelStore: Send + Sync {
    /// Current label of a file path
    async fn label_of(&self, path: &Path) -> AdapterResult<String>;

    /// Relabel a file path
    async fn set_label(&self, path: &Path, label: &str) -> AdapterResult<()>;

    /// Current host enforcement mode
    async fn host_mode(&self) -> AdapterResult<EnforcementMode>;

    /// Change host enforcement mode
    async fn set_host_mode(&self, mode: EnforcementMode) -> AdapterResult<()>;

    /// Label of a running process
    async fn process_label(&self, pid: u32) -> AdapterResult<String>;
}

/// VM control plane and descriptor store
#[async_trait]
pub trait VmControl: Send + Sync {
    /// Persistent (inactive) configuration of a VM
    async fn read_descriptor(&self, name: &str) -> AdapterResult<VmDescriptor>;

    /// Persist a configuration record
    async fn write_descriptor(&self, descriptor: &VmDescriptor) -> AdapterResult<()>;

    /// Start the VM described by `descriptor`
    async fn start_vm(&self, descriptor: &VmDescriptor) -> Result<(), StartError>;

    /// Hard stop
    async fn destroy_vm(&self, name: &str) -> AdapterResult<()>;

    /// Orderly stop; needs guest cooperation and may take a while
    async fn shutdown_vm(&self, name: &str) -> AdapterResult<()>;

    /// Process id of the running VM
    async fn vm_pid(&self, name: &str) -> AdapterResult<u32>;

    /// Configuration of the running VM, including control-plane-assigned labels
    async fn live_descriptor(&self, name: &str) -> AdapterResult<VmDescriptor>;
}

/// Host service manager
#[async_trait]
pub trait ServiceManager: Send + Sync {
    /// Persist a daemon configuration override
    async fn apply_override(&self, key: &str, value: &str) -> AdapterResult<()>;

    /// Return the daemon configuration to its state before any override
    async fn restore_overrides(&self) -> AdapterResult<()>;

    /// Restart the daemon so overrides take effect
    async fn restart_daemon(&self) -> AdapterResult<()>;
}
