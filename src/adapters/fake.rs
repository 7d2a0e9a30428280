//! In-Memory Host
//!
//! `FakeHost` implements every adapter trait over one simulated host: file
//! contexts, enforcement mode, libvirt domains and the qemu driver config.
//! It models the svirt behaviour the verifier checks:
//!
//! - static labels are enforced: in enforcing mode the VM is refused when a
//!   disk's context is not readable by the static process context
//! - dynamic labels get a fresh MCS category pair
//! - with relabel active, disks are relabeled to the image label on start
//!   and reset to their default context on stop
//!
//! Faults can be injected to exercise inconclusive and restoration paths.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{AdapterError, AdapterResult, LabelStore, ServiceManager, StartError, VmControl};
use crate::descriptor::xml::escape;
use crate::descriptor::{SecLabel, VmDescriptor};
use crate::label::{image_label_for, EnforcementMode, SecType};

const UNCONFINED_LABEL: &str = "system_u:system_r:unconfined_t:s0";

/// Simulated host shared by all adapter handles cloned from it
#[derive(Debug, Clone)]
pub struct FakeHost {
    state: Arc<Mutex<FakeState>>,
}

#[derive(Debug)]
struct FakeState {
    files: BTreeMap<PathBuf, FakeFile>,
    mode: EnforcementMode,
    domains: BTreeMap<String, FakeDomain>,
    conf: BTreeMap<String, String>,
    conf_backup: Option<BTreeMap<String, String>>,
    restarts: u32,
    next_pid: u32,
    faults: Faults,
    events: Vec<String>,
}

#[derive(Debug, Clone)]
struct FakeFile {
    label: String,
    /// Context the policy assigns to the path (what a restorecon yields)
    default_label: String,
}

#[derive(Debug)]
struct FakeDomain {
    inactive: VmDescriptor,
    running: Option<RunningDomain>,
}

#[derive(Debug)]
struct RunningDomain {
    pid: u32,
    process_label: String,
    live: VmDescriptor,
    relabeled: Vec<PathBuf>,
}

#[derive(Debug, Default)]
struct Faults {
    unreadable: HashSet<PathBuf>,
    unwritable: HashSet<PathBuf>,
    host_mode_unavailable: bool,
    start_delay: Option<Duration>,
    shutdown_hangs: bool,
    leak_relabel: bool,
    control_plane_down: bool,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHost {
    /// Empty host in enforcing mode
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                files: BTreeMap::new(),
                mode: EnforcementMode::Enforcing,
                domains: BTreeMap::new(),
                conf: BTreeMap::new(),
                conf_backup: None,
                restarts: 0,
                next_pid: 4000,
                faults: Faults::default(),
                events: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        // A panicking test thread must not wedge the other handles
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a file whose current and default context is `label`
    pub fn with_file(self, path: impl Into<PathBuf>, label: &str) -> Self {
        self.lock().files.insert(
            path.into(),
            FakeFile {
                label: label.to_string(),
                default_label: label.to_string(),
            },
        );
        self
    }

    /// Define a domain from its XML
    pub fn with_domain(self, xml: &str) -> Result<Self, crate::descriptor::DescriptorError> {
        let descriptor = VmDescriptor::from_xml(xml)?;
        self.lock().domains.insert(
            descriptor.name().to_string(),
            FakeDomain {
                inactive: descriptor,
                running: None,
            },
        );
        Ok(self)
    }

    /// Host with one stopped domain `vm_name` whose disks all carry `label`
    pub fn simulated(
        vm_name: &str,
        disks: &[PathBuf],
        label: &str,
    ) -> Result<Self, crate::descriptor::DescriptorError> {
        let mut devices = String::new();
        for (index, disk) in disks.iter().enumerate() {
            devices.push_str(&format!(
                "    <disk type='file' device='disk'>\n      \
<driver name='qemu' type='qcow2'/>\n      \
<source file='{}'/>\n      \
<target dev='vd{}' bus='virtio'/>\n    \
</disk>\n",
                escape(&disk.to_string_lossy()),
                char::from(b'a' + (index % 26) as u8)
            ));
        }
        let xml = format!(
            "<domain type='kvm'>\n  <name>{}</name>\n  <memory unit='KiB'>1048576</memory>\n  \
<devices>\n{}  </devices>\n</domain>\n",
            escape(vm_name),
            devices
        );

        disks
            .iter()
            .fold(Self::new(), |host, disk| host.with_file(disk.clone(), label))
            .with_conf("security_driver", "\"selinux\"")
            .with_domain(&xml)
    }

    pub fn with_mode(self, mode: EnforcementMode) -> Self {
        self.lock().mode = mode;
        self
    }

    pub fn with_conf(self, key: &str, value: &str) -> Self {
        self.lock().conf.insert(key.to_string(), value.to_string());
        self
    }

    /// Reads of `path` fail with PermissionDenied
    pub fn fail_reads(&self, path: impl Into<PathBuf>) {
        self.lock().faults.unreadable.insert(path.into());
    }

    /// Writes to `path` fail with PermissionDenied
    pub fn fail_writes(&self, path: impl Into<PathBuf>) {
        self.lock().faults.unwritable.insert(path.into());
    }

    /// Enforcement mode queries and changes fail
    pub fn fail_host_mode(&self) {
        self.lock().faults.host_mode_unavailable = true;
    }

    /// Every start takes `delay` before the control plane answers
    pub fn delay_start(&self, delay: Duration) {
        self.lock().faults.start_delay = Some(delay);
    }

    /// Orderly shutdown never completes
    pub fn hang_shutdown(&self) {
        self.lock().faults.shutdown_hangs = true;
    }

    /// Relabeled disks keep the image label after the VM stops
    pub fn leak_relabel(&self) {
        self.lock().faults.leak_relabel = true;
    }

    /// VM control calls fail as if the daemon were unreachable
    pub fn control_plane_down(&self) {
        self.lock().faults.control_plane_down = true;
    }

    pub fn file_label(&self, path: &Path) -> Option<String> {
        self.lock().files.get(path).map(|f| f.label.clone())
    }

    pub fn mode(&self) -> EnforcementMode {
        self.lock().mode
    }

    pub fn inactive_xml(&self, name: &str) -> Option<String> {
        self.lock()
            .domains
            .get(name)
            .map(|d| d.inactive.xml().to_string())
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.lock()
            .domains
            .get(name)
            .map_or(false, |d| d.running.is_some())
    }

    pub fn conf_value(&self, key: &str) -> Option<String> {
        self.lock().conf.get(key).cloned()
    }

    pub fn restarts(&self) -> u32 {
        self.lock().restarts
    }

    /// Adapter calls in order, e.g. `start vm1`, `set_mode permissive`
    pub fn events(&self) -> Vec<String> {
        self.lock().events.clone()
    }
}

impl FakeState {
    fn record(&mut self, event: String) {
        self.events.push(event);
    }

    fn control_plane(&self) -> AdapterResult<()> {
        if self.faults.control_plane_down {
            return Err(AdapterError::Io {
                context: "Failed to connect to the hypervisor".to_string(),
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            });
        }
        Ok(())
    }

    fn domain_mut(&mut self, name: &str) -> AdapterResult<&mut FakeDomain> {
        self.domains.get_mut(name).ok_or_else(|| AdapterError::CommandFailed {
            command: format!("virsh dumpxml {}", name),
            status: "exit status: 1".to_string(),
            stderr: format!("error: failed to get domain '{}'", name),
        })
    }

    fn start(&mut self, name: &str) -> Result<(), StartError> {
        let rejected = |message: String| StartError::Rejected {
            vm: name.to_string(),
            message,
        };

        let unavailable = |stderr: String| {
            StartError::Unavailable(AdapterError::CommandFailed {
                command: format!("virsh start {}", name),
                status: "exit status: 1".to_string(),
                stderr,
            })
        };

        let mode = self.mode;
        let domain = self.domain_mut(name)?;
        if domain.running.is_some() {
            return Err(unavailable(
                "Requested operation is not valid: domain is already running".into(),
            ));
        }
        let inactive = domain.inactive.clone();
        let seclabel = inactive
            .seclabel()
            .map_err(|e| rejected(e.to_string()))?;
        let disks = inactive.disk_sources();

        for disk in &disks {
            if !self.files.contains_key(disk) {
                return Err(unavailable(format!(
                    "Cannot access storage file '{}': No such file or directory",
                    disk.display()
                )));
            }
        }

        let active = seclabel
            .as_ref()
            .filter(|s| s.sec_type != SecType::None && s.model.is_some());

        let (process_label, live_seclabel) = match active {
            None => (UNCONFINED_LABEL.to_string(), None),
            Some(section) => {
                let process_label = match section.sec_type {
                    SecType::Static => section
                        .label
                        .clone()
                        .ok_or_else(|| {
                            rejected("security label is missing for static type".into())
                        })?,
                    _ => dynamic_label(),
                };

                if section.sec_type == SecType::Static && mode == EnforcementMode::Enforcing {
                    for disk in &disks {
                        let file_label = &self.files[disk].label;
                        if !can_open(&process_label, file_label) {
                            return Err(rejected(format!(
                                "qemu: could not open '{}': Permission denied",
                                disk.display()
                            )));
                        }
                    }
                }

                let relabel = section.relabel.unwrap_or(true);
                let live = SecLabel {
                    sec_type: section.sec_type,
                    model: section.model.clone(),
                    relabel: Some(relabel),
                    label: Some(process_label.clone()),
                    image_label: relabel.then(|| image_label_for(&process_label)),
                };
                (process_label, Some(live))
            }
        };

        let mut relabeled = Vec::new();
        if let Some(image_label) = live_seclabel.as_ref().and_then(|s| s.image_label.clone()) {
            for disk in &disks {
                if let Some(file) = self.files.get_mut(disk) {
                    file.label = image_label.clone();
                    relabeled.push(disk.clone());
                }
            }
        }

        let live = match &live_seclabel {
            Some(section) => inactive.with_seclabel(section),
            None => inactive,
        };
        let pid = self.next_pid;
        self.next_pid += 1;

        let domain = self.domain_mut(name)?;
        domain.running = Some(RunningDomain {
            pid,
            process_label,
            live,
            relabeled,
        });
        Ok(())
    }

    fn stop(&mut self, name: &str) -> AdapterResult<()> {
        let leak = self.faults.leak_relabel;
        let domain = self.domain_mut(name)?;
        let running = domain
            .running
            .take()
            .ok_or_else(|| AdapterError::VmNotRunning(name.to_string()))?;

        if !leak {
            for path in running.relabeled {
                if let Some(file) = self.files.get_mut(&path) {
                    file.label = file.default_label.clone();
                }
            }
        }
        Ok(())
    }
}

fn dynamic_label() -> String {
    let low = fastrand::u32(0..1023);
    let high = fastrand::u32(low + 1..1024);
    format!("system_u:system_r:svirt_t:s0:c{},c{}", low, high)
}

// MCS check: the image type must be svirt_image_t and its categories a
// subset of the process categories
fn can_open(process_label: &str, file_label: &str) -> bool {
    let file_fields: Vec<&str> = file_label.splitn(4, ':').collect();
    if file_fields.get(2) != Some(&"svirt_image_t") {
        return false;
    }
    let categories = |label: &str| -> HashSet<String> {
        label
            .splitn(5, ':')
            .nth(4)
            .map(|cats| cats.split(',').map(str::to_string).collect())
            .unwrap_or_default()
    };
    categories(file_label).is_subset(&categories(process_label))
}

#[async_trait]
impl LabelStore for FakeHost {
    async fn label_of(&self, path: &Path) -> AdapterResult<String> {
        let state = self.lock();
        if state.faults.unreadable.contains(path) {
            return Err(AdapterError::PermissionDenied(path.to_path_buf()));
        }
        state
            .files
            .get(path)
            .map(|f| f.label.clone())
            .ok_or_else(|| AdapterError::NotFound(path.to_path_buf()))
    }

    async fn set_label(&self, path: &Path, label: &str) -> AdapterResult<()> {
        let mut state = self.lock();
        if state.faults.unwritable.contains(path) {
            return Err(AdapterError::PermissionDenied(path.to_path_buf()));
        }
        let file = state
            .files
            .get_mut(path)
            .ok_or_else(|| AdapterError::NotFound(path.to_path_buf()))?;
        file.label = label.to_string();
        state.record(format!("set_label {} {}", path.display(), label));
        Ok(())
    }

    async fn host_mode(&self) -> AdapterResult<EnforcementMode> {
        let state = self.lock();
        if state.faults.host_mode_unavailable {
            return Err(AdapterError::Unsupported("getenforce unavailable".to_string()));
        }
        Ok(state.mode)
    }

    async fn set_host_mode(&self, mode: EnforcementMode) -> AdapterResult<()> {
        let mut state = self.lock();
        if state.faults.host_mode_unavailable {
            return Err(AdapterError::Unsupported("setenforce unavailable".to_string()));
        }
        state.mode = mode;
        state.record(format!("set_mode {}", mode));
        Ok(())
    }

    async fn process_label(&self, pid: u32) -> AdapterResult<String> {
        let state = self.lock();
        state
            .domains
            .values()
            .filter_map(|d| d.running.as_ref())
            .find(|r| r.pid == pid)
            .map(|r| r.process_label.clone())
            .ok_or_else(|| AdapterError::NotFound(PathBuf::from(format!("/proc/{}", pid))))
    }
}

#[async_trait]
impl VmControl for FakeHost {
    async fn read_descriptor(&self, name: &str) -> AdapterResult<VmDescriptor> {
        let mut state = self.lock();
        state.control_plane()?;
        Ok(state.domain_mut(name)?.inactive.clone())
    }

    async fn write_descriptor(&self, descriptor: &VmDescriptor) -> AdapterResult<()> {
        let mut state = self.lock();
        state.control_plane()?;
        let name = descriptor.name().to_string();
        match state.domains.get_mut(&name) {
            Some(domain) => domain.inactive = descriptor.clone(),
            None => {
                state.domains.insert(
                    name.clone(),
                    FakeDomain {
                        inactive: descriptor.clone(),
                        running: None,
                    },
                );
            }
        }
        state.record(format!("define {}", name));
        Ok(())
    }

    async fn start_vm(&self, descriptor: &VmDescriptor) -> Result<(), StartError> {
        let delay = {
            let state = self.lock();
            state.control_plane()?;
            state.faults.start_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        state.record(format!("start {}", descriptor.name()));
        state.start(descriptor.name())
    }

    async fn destroy_vm(&self, name: &str) -> AdapterResult<()> {
        let mut state = self.lock();
        state.control_plane()?;
        state.record(format!("destroy {}", name));
        state.stop(name)
    }

    async fn shutdown_vm(&self, name: &str) -> AdapterResult<()> {
        let hangs = {
            let mut state = self.lock();
            state.control_plane()?;
            state.record(format!("shutdown {}", name));
            state.faults.shutdown_hangs
        };
        if hangs {
            std::future::pending::<()>().await;
        }
        self.lock().stop(name)
    }

    async fn vm_pid(&self, name: &str) -> AdapterResult<u32> {
        let mut state = self.lock();
        state.control_plane()?;
        state
            .domain_mut(name)?
            .running
            .as_ref()
            .map(|r| r.pid)
            .ok_or_else(|| AdapterError::VmNotRunning(name.to_string()))
    }

    async fn live_descriptor(&self, name: &str) -> AdapterResult<VmDescriptor> {
        let mut state = self.lock();
        state.control_plane()?;
        let domain = state.domain_mut(name)?;
        Ok(match &domain.running {
            Some(running) => running.live.clone(),
            None => domain.inactive.clone(),
        })
    }
}

#[async_trait]
impl ServiceManager for FakeHost {
    async fn apply_override(&self, key: &str, value: &str) -> AdapterResult<()> {
        let mut state = self.lock();
        if state.conf_backup.is_none() {
            state.conf_backup = Some(state.conf.clone());
        }
        state.conf.insert(key.to_string(), value.to_string());
        state.record(format!("conf {} = {}", key, value));
        Ok(())
    }

    async fn restore_overrides(&self) -> AdapterResult<()> {
        let mut state = self.lock();
        if let Some(backup) = state.conf_backup.take() {
            state.conf = backup;
            state.record("conf restored".to_string());
        }
        Ok(())
    }

    async fn restart_daemon(&self) -> AdapterResult<()> {
        let mut state = self.lock();
        state.restarts += 1;
        state.record("restart libvirtd".to_string());
        Ok(())
    }
}
