// Restoration Guard
//
// Holds everything the run changed on the host and puts it back. The guard is
// created before the first mutation; `restore` performs phases 9 and 10 and
// consumes it. A guard dropped without `restore` (the run future was dropped)
// spawns the same restoration on the current runtime.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use super::locks::{self, HostLease};
use super::outcome::RestorationFailure;
use crate::adapters::{LabelStore, ServiceManager, VmControl};
use crate::descriptor::VmDescriptor;
use crate::label::{EnforcementMode, ResourceLabelRecord};

/// Adapter handles shared by the verifier and its guards
#[derive(Clone)]
pub struct HostAdapters {
    pub store: Arc<dyn LabelStore>,
    pub vm: Arc<dyn VmControl>,
    pub services: Option<Arc<dyn ServiceManager>>,
}

impl HostAdapters {
    pub fn new(
        store: Arc<dyn LabelStore>,
        vm: Arc<dyn VmControl>,
        services: Option<Arc<dyn ServiceManager>>,
    ) -> Self {
        Self { store, vm, services }
    }
}

impl std::fmt::Debug for HostAdapters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostAdapters")
            .field("services", &self.services.is_some())
            .finish_non_exhaustive()
    }
}

/// Host state captured before mutation
#[derive(Debug, Default)]
struct Baseline {
    vm_name: String,
    records: Vec<ResourceLabelRecord>,
    prior_mode: Option<EnforcementMode>,
    descriptor: Option<VmDescriptor>,
    driver_overridden: bool,
    vm_may_run: bool,
}

/// Failures of the two restoration phases
#[derive(Debug, Default)]
pub struct RestorationReport {
    /// Phase 9
    pub labels: Vec<RestorationFailure>,
    /// Phase 10
    pub host: Vec<RestorationFailure>,
    pub labels_ms: f64,
    pub host_ms: f64,
}

impl RestorationReport {
    pub fn is_clean(&self) -> bool {
        self.labels.is_empty() && self.host.is_empty()
    }
}

pub struct RestorationGuard {
    adapters: HostAdapters,
    baseline: Option<Baseline>,
    lease: Option<HostLease>,
}

impl RestorationGuard {
    pub fn new(adapters: HostAdapters, vm_name: impl Into<String>, lease: HostLease) -> Self {
        Self {
            adapters,
            baseline: Some(Baseline {
                vm_name: vm_name.into(),
                ..Baseline::default()
            }),
            lease: Some(lease),
        }
    }

    fn baseline(&mut self) -> Option<&mut Baseline> {
        self.baseline.as_mut()
    }

    pub fn set_records(&mut self, records: Vec<ResourceLabelRecord>) {
        if let Some(b) = self.baseline() {
            b.records = records;
        }
    }

    pub fn set_prior_mode(&mut self, mode: EnforcementMode) {
        if let Some(b) = self.baseline() {
            b.prior_mode = Some(mode);
        }
    }

    pub fn set_descriptor(&mut self, descriptor: VmDescriptor) {
        if let Some(b) = self.baseline() {
            b.descriptor = Some(descriptor);
        }
    }

    pub fn mark_driver_overridden(&mut self) {
        if let Some(b) = self.baseline() {
            b.driver_overridden = true;
        }
    }

    /// The VM may be running and must be stopped before labels are restored
    pub fn mark_vm_may_run(&mut self, may_run: bool) {
        if let Some(b) = self.baseline() {
            b.vm_may_run = may_run;
        }
    }

    /// Run phases 9 and 10 and release the host.
    ///
    /// Restoration runs as its own task holding the host lease, so dropping
    /// the returned future does not interrupt it.
    pub async fn restore(mut self) -> RestorationReport {
        let Some(baseline) = self.baseline.take() else {
            self.lease.take();
            return RestorationReport::default();
        };
        let lease = self.lease.take();
        let adapters = self.adapters.clone();
        let vm_name = baseline.vm_name.clone();

        let task = tokio::spawn(async move {
            let _lease = lease;
            restore_host(&adapters, baseline).await
        });

        match task.await {
            Ok(report) => report,
            Err(e) => {
                error!("Restoration of {} did not complete: {}", vm_name, e);
                RestorationReport {
                    host: vec![RestorationFailure {
                        target: format!("restoration of {}", vm_name),
                        message: e.to_string(),
                    }],
                    ..RestorationReport::default()
                }
            }
        }
    }
}

impl Drop for RestorationGuard {
    fn drop(&mut self) {
        let Some(baseline) = self.baseline.take() else {
            return;
        };
        let lease = self.lease.take();
        let adapters = self.adapters.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(
                    "Run for {} abandoned before restoration, restoring in background",
                    baseline.vm_name
                );
                handle.spawn(async move {
                    let _lease = lease;
                    let report = restore_host(&adapters, baseline).await;
                    if !report.is_clean() {
                        error!(
                            "Background restoration left {} item(s) unrestored",
                            report.labels.len() + report.host.len()
                        );
                    }
                });
            }
            Err(_) => {
                error!(
                    "No runtime to restore host state for {}; host may have drifted",
                    baseline.vm_name
                );
            }
        }
    }
}

async fn restore_host(adapters: &HostAdapters, baseline: Baseline) -> RestorationReport {
    let mut report = RestorationReport::default();

    if baseline.vm_may_run {
        stop_leftover_vm(adapters, &baseline.vm_name).await;
    }

    // Phase 9
    let started = Instant::now();
    let labels: Vec<(PathBuf, String)> = baseline
        .records
        .iter()
        .map(|r| (r.path.clone(), r.original_label.clone()))
        .collect();
    for (path, result) in locks::write_labels(adapters.store.as_ref(), &labels).await {
        if let Err(e) = result {
            warn!("Failed to restore label of {}: {}", path.display(), e);
            report.labels.push(RestorationFailure {
                target: path.display().to_string(),
                message: e.to_string(),
            });
        }
    }

    report.labels_ms = started.elapsed().as_secs_f64() * 1000.0;

    // Phase 10
    let started = Instant::now();
    if let Some(descriptor) = &baseline.descriptor {
        if let Err(e) = adapters.vm.write_descriptor(descriptor).await {
            warn!("Failed to restore descriptor of {}: {}", baseline.vm_name, e);
            report.host.push(RestorationFailure {
                target: format!("descriptor {}", baseline.vm_name),
                message: e.to_string(),
            });
        }
    }

    if let Some(mode) = baseline.prior_mode {
        if let Err(e) = adapters.store.set_host_mode(mode).await {
            warn!("Failed to restore host enforcement mode {}: {}", mode, e);
            report.host.push(RestorationFailure {
                target: "host enforcement mode".to_string(),
                message: e.to_string(),
            });
        }
    }

    if baseline.driver_overridden {
        if let Some(services) = &adapters.services {
            let reverted = match services.restore_overrides().await {
                Ok(()) => services.restart_daemon().await,
                Err(e) => Err(e),
            };
            if let Err(e) = reverted {
                warn!("Failed to revert security driver override: {}", e);
                report.host.push(RestorationFailure {
                    target: "security driver override".to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    report.host_ms = started.elapsed().as_secs_f64() * 1000.0;

    if report.is_clean() {
        info!("Host state restored for {}", baseline.vm_name);
    }
    report
}

async fn stop_leftover_vm(adapters: &HostAdapters, vm_name: &str) {
    match adapters.vm.destroy_vm(vm_name).await {
        Ok(()) => info!("Destroyed leftover VM {} before restoration", vm_name),
        Err(crate::adapters::AdapterError::VmNotRunning(_)) => {}
        Err(e) => warn!("Failed to stop leftover VM {}: {}", vm_name, e),
    }
}
