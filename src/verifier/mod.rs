//! Lifecycle Verifier
//!
//! Drives one scenario through the label lifecycle of a VM:
//!
//! 1. capture the baseline label of every resource
//! 2. force the host enforcement mode (2a: optionally override the
//!    hypervisor's security driver and restart the daemon)
//! 3. write the pre-start labels
//! 4. inject the label policy into the VM descriptor
//! 5. start the VM
//! 6. check the running process and resource labels
//! 7. stop the VM
//! 8. check the resource labels after teardown
//! 9. restore resource labels
//! 10. restore the host enforcement mode, descriptor and daemon config
//!
//! Phases 9 and 10 always run, through a [`RestorationGuard`]. The host-mode
//! lock is held from before phase 1 until restoration is done.

pub mod guard;
pub mod locks;
pub mod outcome;

pub use guard::{HostAdapters, RestorationGuard, RestorationReport};
pub use outcome::{
    FailKind, FailReason, Phase, PhaseOutcome, PhaseRecord, RestorationFailure, ScenarioResult,
    Verdict,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::adapters::{AdapterError, AdapterResult, StartError};
use crate::descriptor::{self, VmDescriptor};
use crate::label::{
    EnforcementMode, LabelPolicy, ResourceLabelRecord, ResourceTarget, SecType, VmSecuritySnapshot,
};

/// Label each resource must carry once the VM has stopped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreExpectation {
    /// The label captured in phase 1
    Baseline,
    /// The label written in phase 3
    PreStart,
    /// Baseline when the control plane relabeled the resource, pre-start
    /// label when it had no reason to touch it
    #[default]
    Auto,
}

impl RestoreExpectation {
    fn expected<'a>(&self, policy: &LabelPolicy, record: &'a ResourceLabelRecord) -> &'a str {
        let relabeled = policy.relabel && policy.labeling_active();
        match self {
            Self::Baseline => &record.original_label,
            Self::PreStart => &record.policy_label,
            Self::Auto if relabeled => &record.original_label,
            Self::Auto => &record.policy_label,
        }
    }
}

impl FromStr for RestoreExpectation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "baseline" => Ok(Self::Baseline),
            "pre_start" | "prestart" => Ok(Self::PreStart),
            "auto" => Ok(Self::Auto),
            _ => Err(format!("Invalid restore expectation: {}", s)),
        }
    }
}

/// How the VM is stopped in phase 7
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Teardown {
    /// Hard stop
    #[default]
    Destroy,
    /// Orderly guest shutdown
    Shutdown,
}

impl fmt::Display for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Destroy => f.write_str("destroy"),
            Self::Shutdown => f.write_str("shutdown"),
        }
    }
}

impl FromStr for Teardown {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "destroy" => Ok(Self::Destroy),
            "shutdown" => Ok(Self::Shutdown),
            _ => Err(format!("Invalid teardown mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerifierOptions {
    pub start_timeout: Duration,
    pub teardown_timeout: Duration,
    pub restore_expectation: RestoreExpectation,

    /// Value for the hypervisor's `security_driver` setting, applied for the
    /// duration of the run
    pub security_driver: Option<String>,
}

impl Default for VerifierOptions {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(120),
            teardown_timeout: Duration::from_secs(120),
            restore_expectation: RestoreExpectation::default(),
            security_driver: None,
        }
    }
}

/// One scenario to verify
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioRequest {
    pub name: String,
    pub vm_name: String,
    pub policy: LabelPolicy,
    pub resources: Vec<ResourceTarget>,
    pub expect_failure: bool,
    pub host_mode: EnforcementMode,
    pub teardown: Teardown,
}

/// Phase records collected during a run
#[derive(Debug, Default)]
struct RunLog {
    phases: Vec<PhaseRecord>,
    running: Option<VmSecuritySnapshot>,
    after_teardown: Option<VmSecuritySnapshot>,
}

impl RunLog {
    fn record(&mut self, phase: Phase, outcome: PhaseOutcome, started: Instant) -> bool {
        self.push(phase, outcome, started.elapsed().as_secs_f64() * 1000.0)
    }

    fn push(&mut self, phase: Phase, outcome: PhaseOutcome, elapsed_ms: f64) -> bool {
        match &outcome {
            PhaseOutcome::Pass => debug!("{} PASS", phase),
            other => warn!("{} {}", phase, other),
        }
        let passed = outcome.is_pass();
        self.phases.push(PhaseRecord {
            phase,
            outcome,
            elapsed_ms,
        });
        passed
    }

    fn has(&self, phase: Phase) -> bool {
        self.phases.iter().any(|r| r.phase == phase)
    }
}

const CANCELLED: &str = "cancelled";

/// Runs a mutation phase: Pass on success, Inconclusive on adapter error or
/// cancellation
async fn mutate<T, E, F>(
    log: &mut RunLog,
    cancel: &CancellationToken,
    phase: Phase,
    work: F,
) -> Option<T>
where
    E: fmt::Display,
    F: Future<Output = Result<T, E>>,
{
    let started = Instant::now();
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CANCELLED.to_string()),
        result = work => result.map_err(|e| e.to_string()),
    };
    match result {
        Ok(value) => {
            log.record(phase, PhaseOutcome::Pass, started);
            Some(value)
        }
        Err(reason) => {
            log.record(phase, PhaseOutcome::Inconclusive(reason), started);
            None
        }
    }
}

/// Check running-state labels against the policy
pub fn check_running(
    policy: &LabelPolicy,
    records: &[ResourceLabelRecord],
    snapshot: &VmSecuritySnapshot,
    image_label: Option<&str>,
) -> PhaseOutcome {
    let mut problems = Vec::new();

    if policy.effective_type() == SecType::Static {
        let declared = policy.label.as_deref();
        if snapshot.process_label.as_deref() != declared {
            problems.push(format!(
                "process label {} does not match declared {}",
                snapshot.process_label.as_deref().unwrap_or("<none>"),
                declared.unwrap_or("<none>")
            ));
        }
    }

    let expected_for = |record: &ResourceLabelRecord| -> Option<Result<String, String>> {
        if !policy.relabel {
            Some(Ok(record.policy_label.clone()))
        } else if policy.labeling_active() {
            Some(
                image_label
                    .map(str::to_string)
                    .ok_or_else(|| "control plane recorded no image label".to_string()),
            )
        } else {
            None
        }
    };

    for record in records {
        let expected = match expected_for(record) {
            None => continue,
            Some(Ok(expected)) => expected,
            Some(Err(problem)) => {
                problems.push(problem);
                break;
            }
        };
        match snapshot.resource_labels.get(&record.path) {
            Some(observed) if *observed == expected => {}
            Some(observed) => problems.push(format!(
                "{} is labeled {}, expected {}",
                record.path.display(),
                observed,
                expected
            )),
            None => problems.push(format!("{} was not observed", record.path.display())),
        }
    }

    if problems.is_empty() {
        PhaseOutcome::Pass
    } else {
        PhaseOutcome::fail(FailKind::Assertion, problems.join("; "))
    }
}

/// Check resource labels after teardown
pub fn check_restored(
    expectation: RestoreExpectation,
    policy: &LabelPolicy,
    records: &[ResourceLabelRecord],
    snapshot: &VmSecuritySnapshot,
) -> PhaseOutcome {
    let leaked: Vec<String> = records
        .iter()
        .filter_map(|record| {
            let expected = expectation.expected(policy, record);
            match snapshot.resource_labels.get(&record.path) {
                Some(observed) if observed == expected => None,
                Some(observed) => Some(format!(
                    "{} is labeled {} after teardown, expected {}",
                    record.path.display(),
                    observed,
                    expected
                )),
                None => Some(format!("{} was not observed", record.path.display())),
            }
        })
        .collect();

    if leaked.is_empty() {
        PhaseOutcome::Pass
    } else {
        PhaseOutcome::fail(FailKind::RestorationIntegrity, leaked.join("; "))
    }
}

fn restoration_outcome(failures: &[RestorationFailure]) -> PhaseOutcome {
    if failures.is_empty() {
        PhaseOutcome::Pass
    } else {
        PhaseOutcome::Inconclusive(
            failures
                .iter()
                .map(|f| format!("{}: {}", f.target, f.message))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// Security label lifecycle verifier
#[derive(Debug, Clone)]
pub struct LifecycleVerifier {
    adapters: HostAdapters,
    options: VerifierOptions,
}

impl LifecycleVerifier {
    pub fn new(adapters: HostAdapters, options: VerifierOptions) -> Self {
        Self { adapters, options }
    }

    pub fn options(&self) -> &VerifierOptions {
        &self.options
    }

    pub async fn run(&self, request: ScenarioRequest) -> ScenarioResult {
        self.run_with_cancel(request, CancellationToken::new()).await
    }

    /// Run a scenario; cancelling `cancel` stops verification early, but
    /// restoration still completes before this returns
    pub async fn run_with_cancel(
        &self,
        request: ScenarioRequest,
        cancel: CancellationToken,
    ) -> ScenarioResult {
        let run_id = Uuid::new_v4();
        let span = info_span!("scenario", name = %request.name, %run_id);
        self.execute(request, run_id, cancel).instrument(span).await
    }

    async fn execute(
        &self,
        request: ScenarioRequest,
        run_id: Uuid,
        cancel: CancellationToken,
    ) -> ScenarioResult {
        let started = Instant::now();
        let lease = locks::acquire_host().await;
        info!(
            "Verifying {} on {} (host mode {}, expect failure: {})",
            request.policy, request.vm_name, request.host_mode, request.expect_failure
        );

        let mut guard = RestorationGuard::new(self.adapters.clone(), &request.vm_name, lease);
        let mut log = RunLog::default();

        self.verify(&request, &cancel, &mut guard, &mut log).await;

        let report = guard.restore().await;
        log.push(
            Phase::RestoreResourceLabels,
            restoration_outcome(&report.labels),
            report.labels_ms,
        );
        log.push(
            Phase::RestoreHostState,
            restoration_outcome(&report.host),
            report.host_ms,
        );

        let restoration_failures: Vec<RestorationFailure> =
            report.labels.into_iter().chain(report.host).collect();
        for failure in &restoration_failures {
            warn!("Host drift: {} was not restored: {}", failure.target, failure.message);
        }

        let skipped = Phase::SEQUENCE
            .iter()
            .copied()
            .filter(|phase| {
                *phase != Phase::ConfigureSecurityDriver || self.options.security_driver.is_some()
            })
            .filter(|phase| !log.has(*phase))
            .collect();

        let result = ScenarioResult {
            scenario: request.name,
            run_id,
            policy: request.policy,
            expect_failure: request.expect_failure,
            host_mode: request.host_mode,
            phases: log.phases,
            skipped,
            restoration_failures,
            running: log.running,
            after_teardown: log.after_teardown,
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
        };

        match result.first_problem() {
            None => info!("Verdict: {}", result.verdict()),
            Some(record) => warn!(
                "Verdict: {} at {}: {}",
                result.verdict(),
                record.phase,
                record.outcome
            ),
        }
        result
    }

    /// Phases 1 to 8; returns at the first phase that ends the run early
    async fn verify(
        &self,
        request: &ScenarioRequest,
        cancel: &CancellationToken,
        guard: &mut RestorationGuard,
        log: &mut RunLog,
    ) -> Option<()> {
        let store = self.adapters.store.as_ref();
        let vm = self.adapters.vm.as_ref();

        let records = mutate(
            log,
            cancel,
            Phase::CaptureBaseline,
            capture_baseline(store, &request.resources),
        )
        .await?;
        guard.set_records(records.clone());

        mutate(log, cancel, Phase::ForceHostMode, async {
            let prior = store.host_mode().await?;
            guard.set_prior_mode(prior);
            if prior != request.host_mode {
                store.set_host_mode(request.host_mode).await?;
            }
            AdapterResult::Ok(())
        })
        .await?;

        if let Some(driver) = &self.options.security_driver {
            let services = self.adapters.services.clone();
            mutate(log, cancel, Phase::ConfigureSecurityDriver, async {
                let services = services.ok_or_else(|| {
                    AdapterError::Unsupported(
                        "no service manager to override security_driver".into(),
                    )
                })?;
                guard.mark_driver_overridden();
                services
                    .apply_override("security_driver", &format!("\"{}\"", driver))
                    .await?;
                services.restart_daemon().await
            })
            .await?;
        }

        let writes: Vec<(PathBuf, String)> = records
            .iter()
            .filter(|r| r.policy_label != r.original_label)
            .map(|r| (r.path.clone(), r.policy_label.clone()))
            .collect();
        mutate(log, cancel, Phase::ApplyResourceLabels, async {
            let failures: Vec<String> = locks::write_labels(store, &writes)
                .await
                .into_iter()
                .filter_map(|(_, result)| result.err().map(|e| e.to_string()))
                .collect();
            if failures.is_empty() {
                Ok(())
            } else {
                Err(failures.join("; "))
            }
        })
        .await?;

        let applied = mutate(log, cancel, Phase::ApplyDescriptor, async {
            let original = vm.read_descriptor(&request.vm_name).await?;
            guard.set_descriptor(original.clone());
            let applied = descriptor::apply(&original, &request.policy);
            vm.write_descriptor(&applied).await?;
            AdapterResult::Ok(applied)
        })
        .await?;

        if !self.start(request, &applied, cancel, guard, log).await {
            return None;
        }

        let started = Instant::now();
        let observed = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CANCELLED.to_string()),
            observed = self.observe_running(request, &records) => {
                observed.map_err(|e| e.to_string())
            }
        };
        let outcome = match observed {
            Ok((snapshot, image_label)) => {
                let outcome =
                    check_running(&request.policy, &records, &snapshot, image_label.as_deref());
                log.running = Some(snapshot);
                outcome
            }
            Err(reason) => PhaseOutcome::Inconclusive(reason),
        };
        let running_ok = log.record(Phase::VerifyRunning, outcome, started);

        let stopped = self.teardown(request, guard, log).await;
        if !running_ok || !stopped {
            return None;
        }

        let started = Instant::now();
        let observed = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CANCELLED.to_string()),
            observed = observe_labels(store, &records) => observed.map_err(|e| e.to_string()),
        };
        let outcome = match observed {
            Ok(snapshot) => {
                let outcome = check_restored(
                    self.options.restore_expectation,
                    &request.policy,
                    &records,
                    &snapshot,
                );
                log.after_teardown = Some(snapshot);
                outcome
            }
            Err(reason) => PhaseOutcome::Inconclusive(reason),
        };
        log.record(Phase::VerifyRestored, outcome, started);
        Some(())
    }

    /// Phase 5; true when the run continues with phase 6
    async fn start(
        &self,
        request: &ScenarioRequest,
        applied: &VmDescriptor,
        cancel: &CancellationToken,
        guard: &mut RestorationGuard,
        log: &mut RunLog,
    ) -> bool {
        let started = Instant::now();
        guard.mark_vm_may_run(true);

        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            attempt = time::timeout(
                self.options.start_timeout,
                self.adapters.vm.start_vm(applied),
            ) => Some(attempt),
        };

        match attempt {
            None => {
                log.record(Phase::StartVm, PhaseOutcome::inconclusive(CANCELLED), started);
                self.teardown(request, guard, log).await;
                false
            }
            Some(Err(_)) => {
                log.record(
                    Phase::StartVm,
                    PhaseOutcome::inconclusive(format!(
                        "start did not complete within {:?}",
                        self.options.start_timeout
                    )),
                    started,
                );
                self.teardown(request, guard, log).await;
                false
            }
            Some(Ok(Err(StartError::Rejected { message, .. }))) => {
                guard.mark_vm_may_run(false);
                let outcome = if request.expect_failure {
                    info!("Start rejected as expected: {}", message);
                    PhaseOutcome::Pass
                } else {
                    PhaseOutcome::fail(FailKind::StartRejected, message)
                };
                log.record(Phase::StartVm, outcome, started);
                false
            }
            Some(Ok(Err(StartError::Unavailable(e)))) => {
                log.record(Phase::StartVm, PhaseOutcome::Inconclusive(e.to_string()), started);
                self.teardown(request, guard, log).await;
                false
            }
            Some(Ok(Ok(()))) if request.expect_failure => {
                log.record(
                    Phase::StartVm,
                    PhaseOutcome::fail(
                        FailKind::UnexpectedStart,
                        "expected rejection, got success",
                    ),
                    started,
                );
                self.teardown(request, guard, log).await;
                false
            }
            Some(Ok(Ok(()))) => log.record(Phase::StartVm, PhaseOutcome::Pass, started),
        }
    }

    /// Phase 7; not cancellable, bounded by the teardown timeout
    async fn teardown(
        &self,
        request: &ScenarioRequest,
        guard: &mut RestorationGuard,
        log: &mut RunLog,
    ) -> bool {
        let started = Instant::now();
        let vm = self.adapters.vm.as_ref();
        let stop = async {
            match request.teardown {
                Teardown::Destroy => vm.destroy_vm(&request.vm_name).await,
                Teardown::Shutdown => vm.shutdown_vm(&request.vm_name).await,
            }
        };

        let outcome = match time::timeout(self.options.teardown_timeout, stop).await {
            Ok(Ok(())) => {
                guard.mark_vm_may_run(false);
                PhaseOutcome::Pass
            }
            Ok(Err(e)) => PhaseOutcome::inconclusive(format!("{} failed: {}", request.teardown, e)),
            Err(_) => PhaseOutcome::inconclusive(format!(
                "{} did not complete within {:?}",
                request.teardown, self.options.teardown_timeout
            )),
        };
        log.record(Phase::Teardown, outcome, started)
    }

    async fn observe_running(
        &self,
        request: &ScenarioRequest,
        records: &[ResourceLabelRecord],
    ) -> AdapterResult<(VmSecuritySnapshot, Option<String>)> {
        let pid = self.adapters.vm.vm_pid(&request.vm_name).await?;
        let process_label = self.adapters.store.process_label(pid).await?;
        let mut snapshot = observe_labels(self.adapters.store.as_ref(), records).await?;
        snapshot.process_label = Some(process_label);

        let image_label = if request.policy.relabel && request.policy.labeling_active() {
            self.adapters
                .vm
                .live_descriptor(&request.vm_name)
                .await?
                .image_label()
        } else {
            None
        };
        Ok((snapshot, image_label))
    }
}

async fn capture_baseline(
    store: &dyn crate::adapters::LabelStore,
    resources: &[ResourceTarget],
) -> AdapterResult<Vec<ResourceLabelRecord>> {
    let mut records = Vec::with_capacity(resources.len());
    for target in resources {
        let original = store.label_of(&target.path).await?;
        debug!("Baseline {} = {}", target.path.display(), original);
        records.push(ResourceLabelRecord::capture(target, original));
    }
    Ok(records)
}

async fn observe_labels(
    store: &dyn crate::adapters::LabelStore,
    records: &[ResourceLabelRecord],
) -> AdapterResult<VmSecuritySnapshot> {
    let mut snapshot = VmSecuritySnapshot::default();
    for record in records {
        let label = store.label_of(&record.path).await?;
        snapshot.resource_labels.insert(record.path.clone(), label);
    }
    Ok(snapshot)
}
