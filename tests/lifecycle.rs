// Lifecycle tests against the in-memory host

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use svirt_verify::adapters::{AdapterError, AdapterResult, FakeHost, LabelStore, VmControl};
use svirt_verify::config::LabelsConfig;
use svirt_verify::label::{EnforcementMode, LabelPolicy, ResourceTarget, SecType};
use svirt_verify::scenario::{run_matrix, MatrixTarget, ScenarioMatrix};
use svirt_verify::verifier::{
    locks, FailKind, FailReason, HostAdapters, LifecycleVerifier, Phase, PhaseOutcome,
    ScenarioRequest, Teardown, Verdict, VerifierOptions,
};

const VM: &str = "vm1";
const DISK: &str = "/var/lib/libvirt/images/vm1.qcow2";
const L0: &str = "system_u:object_r:svirt_image_t:s0";
const L1: &str = "system_u:object_r:svirt_image_t:s0:c3,c4";
const STATIC: &str = "system_u:system_r:svirt_t:s0:c1,c2";

fn host() -> FakeHost {
    FakeHost::simulated(VM, &[PathBuf::from(DISK)], L0).unwrap()
}

fn verifier_with(host: &FakeHost, options: VerifierOptions) -> LifecycleVerifier {
    let shared = Arc::new(host.clone());
    LifecycleVerifier::new(
        HostAdapters::new(shared.clone(), shared.clone(), Some(shared)),
        options,
    )
}

fn verifier(host: &FakeHost) -> LifecycleVerifier {
    verifier_with(host, VerifierOptions::default())
}

fn request(policy: LabelPolicy, pre_label: &str, expect_failure: bool) -> ScenarioRequest {
    ScenarioRequest {
        name: "test".to_string(),
        vm_name: VM.to_string(),
        policy,
        resources: vec![ResourceTarget::new(DISK, Some(pre_label.to_string()))],
        expect_failure,
        host_mode: EnforcementMode::Enforcing,
        teardown: Teardown::Destroy,
    }
}

fn disk_label(host: &FakeHost) -> Option<String> {
    host.file_label(Path::new(DISK))
}

fn is_cancelled(outcome: &PhaseOutcome) -> bool {
    matches!(outcome, PhaseOutcome::Inconclusive(reason) if reason == "cancelled")
}

#[tokio::test]
async fn test_static_label_with_matching_image() {
    let host = host().with_mode(EnforcementMode::Permissive);
    let original = host.inactive_xml(VM).unwrap();

    let result = verifier(&host)
        .run(request(LabelPolicy::static_selinux(STATIC, false), L0, false))
        .await;

    assert_eq!(result.verdict(), Verdict::Pass, "{:?}", result.phases);
    assert!(result.skipped.is_empty());

    let running = result.running.as_ref().unwrap();
    assert_eq!(running.process_label.as_deref(), Some(STATIC));
    assert_eq!(running.resource_labels[Path::new(DISK)], L0);
    let after = result.after_teardown.as_ref().unwrap();
    assert_eq!(after.resource_labels[Path::new(DISK)], L0);

    assert_eq!(disk_label(&host).as_deref(), Some(L0));
    assert_eq!(host.mode(), EnforcementMode::Permissive);
    assert_eq!(host.inactive_xml(VM), Some(original));
    assert!(!host.is_running(VM));
}

#[tokio::test]
async fn test_static_label_with_mismatched_image_is_refused() {
    let host = host().with_mode(EnforcementMode::Permissive);
    let original = host.inactive_xml(VM).unwrap();

    let result = verifier(&host)
        .run(request(LabelPolicy::static_selinux(STATIC, false), L1, true))
        .await;

    assert_eq!(result.verdict(), Verdict::Pass, "{:?}", result.phases);
    assert_eq!(result.outcome(Phase::StartVm), Some(&PhaseOutcome::Pass));
    assert_eq!(
        result.skipped,
        vec![Phase::VerifyRunning, Phase::Teardown, Phase::VerifyRestored]
    );
    assert!(result.running.is_none());

    // Restored to the baseline, not to the pre-start label
    assert_eq!(disk_label(&host).as_deref(), Some(L0));
    assert_eq!(host.mode(), EnforcementMode::Permissive);
    assert_eq!(host.inactive_xml(VM), Some(original));
    assert!(host.events().iter().any(|e| e == &format!("set_label {} {}", DISK, L1)));
}

#[tokio::test]
async fn test_refused_start_fails_positive_scenario() {
    let host = host();
    let result = verifier(&host)
        .run(request(LabelPolicy::static_selinux(STATIC, true), L1, false))
        .await;

    assert_eq!(result.verdict(), Verdict::Fail);
    match result.outcome(Phase::StartVm) {
        Some(PhaseOutcome::Fail(FailReason { kind, message })) => {
            assert_eq!(*kind, FailKind::StartRejected);
            assert!(message.contains("Permission denied"));
        }
        other => panic!("unexpected start outcome: {:?}", other),
    }
    assert_eq!(disk_label(&host).as_deref(), Some(L0));
}

#[tokio::test]
async fn test_unexpected_start_is_torn_down() {
    // Permissive hosts do not deny the mismatched image
    let host = host();
    let mut req = request(LabelPolicy::static_selinux(STATIC, false), L1, true);
    req.host_mode = EnforcementMode::Permissive;

    let result = verifier(&host).run(req).await;

    assert_eq!(result.verdict(), Verdict::Fail);
    assert!(matches!(
        result.outcome(Phase::StartVm),
        Some(PhaseOutcome::Fail(FailReason { kind: FailKind::UnexpectedStart, .. }))
    ));
    assert_eq!(result.outcome(Phase::Teardown), Some(&PhaseOutcome::Pass));
    assert!(!host.is_running(VM));
    assert_eq!(host.mode(), EnforcementMode::Enforcing);
    assert_eq!(disk_label(&host).as_deref(), Some(L0));
}

#[tokio::test]
async fn test_dynamic_relabel_uses_image_label() {
    let host = host();
    let result = verifier(&host)
        .run(request(LabelPolicy::dynamic_selinux(true), L1, false))
        .await;

    assert_eq!(result.verdict(), Verdict::Pass, "{:?}", result.phases);
    let running = result.running.as_ref().unwrap();
    let process = running.process_label.as_deref().unwrap();
    assert!(process.starts_with("system_u:system_r:svirt_t:s0:c"));
    let image = &running.resource_labels[Path::new(DISK)];
    assert!(image.starts_with("system_u:object_r:svirt_image_t:s0:c"));
    assert_ne!(image, L1);
    assert_eq!(disk_label(&host).as_deref(), Some(L0));
}

#[tokio::test]
async fn test_no_relabel_keeps_pre_start_label_while_running() {
    let host = host();
    let result = verifier(&host)
        .run(request(LabelPolicy::dynamic_selinux(false), L1, false))
        .await;

    assert_eq!(result.verdict(), Verdict::Pass, "{:?}", result.phases);
    assert_eq!(
        result.running.as_ref().unwrap().resource_labels[Path::new(DISK)],
        L1
    );
    assert_eq!(
        result.after_teardown.as_ref().unwrap().resource_labels[Path::new(DISK)],
        L1
    );
    // Phase 9 returns the baseline
    assert_eq!(disk_label(&host).as_deref(), Some(L0));
}

#[tokio::test]
async fn test_policy_without_model_runs_unconfined() {
    let host = host();
    let policy = LabelPolicy::new(SecType::Dynamic, None, None, true);
    let result = verifier(&host).run(request(policy, L1, false)).await;

    assert_eq!(result.verdict(), Verdict::Pass, "{:?}", result.phases);
    let running = result.running.as_ref().unwrap();
    assert_eq!(running.resource_labels[Path::new(DISK)], L1);
}

#[tokio::test]
async fn test_leaked_relabel_is_restoration_failure() {
    let host = host();
    host.leak_relabel();

    let result = verifier(&host)
        .run(request(LabelPolicy::dynamic_selinux(true), L0, false))
        .await;

    assert_eq!(result.verdict(), Verdict::Fail);
    assert!(matches!(
        result.outcome(Phase::VerifyRestored),
        Some(PhaseOutcome::Fail(FailReason { kind: FailKind::RestorationIntegrity, .. }))
    ));
    // Phase 9 still cleans up the leak
    assert_eq!(disk_label(&host).as_deref(), Some(L0));
    assert!(result.restoration_failures.is_empty());
}

#[tokio::test]
async fn test_unreadable_resource_is_inconclusive() {
    let host = host();
    host.fail_reads(DISK);

    let result = verifier(&host)
        .run(request(LabelPolicy::dynamic_selinux(true), L1, false))
        .await;

    assert_eq!(result.verdict(), Verdict::Inconclusive);
    assert!(matches!(
        result.outcome(Phase::CaptureBaseline),
        Some(PhaseOutcome::Inconclusive(_))
    ));
    assert_eq!(result.outcome(Phase::RestoreResourceLabels), Some(&PhaseOutcome::Pass));
    assert_eq!(result.outcome(Phase::RestoreHostState), Some(&PhaseOutcome::Pass));
    assert!(!host.events().iter().any(|e| e.starts_with("set_label") || e.starts_with("start")));
}

#[tokio::test]
async fn test_unreachable_control_plane_is_inconclusive() {
    let host = host();
    host.control_plane_down();

    let result = verifier(&host)
        .run(request(LabelPolicy::dynamic_selinux(false), L1, false))
        .await;

    assert_eq!(result.verdict(), Verdict::Inconclusive);
    assert!(matches!(
        result.outcome(Phase::ApplyDescriptor),
        Some(PhaseOutcome::Inconclusive(_))
    ));
    assert_eq!(disk_label(&host).as_deref(), Some(L0));
}

#[tokio::test]
async fn test_start_timeout_is_inconclusive_and_tears_down() {
    let host = host();
    host.delay_start(Duration::from_secs(5));
    let options = VerifierOptions {
        start_timeout: Duration::from_millis(50),
        ..Default::default()
    };

    let result = verifier_with(&host, options)
        .run(request(LabelPolicy::dynamic_selinux(true), L1, false))
        .await;

    assert_eq!(result.verdict(), Verdict::Inconclusive);
    match result.outcome(Phase::StartVm) {
        Some(PhaseOutcome::Inconclusive(reason)) => assert!(reason.contains("did not complete")),
        other => panic!("unexpected start outcome: {:?}", other),
    }
    assert!(result.outcome(Phase::Teardown).is_some());
    assert!(result.skipped.contains(&Phase::VerifyRunning));
    assert_eq!(disk_label(&host).as_deref(), Some(L0));
}

#[tokio::test]
async fn test_hung_shutdown_is_inconclusive_and_vm_is_stopped() {
    let host = host();
    host.hang_shutdown();
    let options = VerifierOptions {
        teardown_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let mut req = request(LabelPolicy::dynamic_selinux(true), L0, false);
    req.teardown = Teardown::Shutdown;

    let result = verifier_with(&host, options).run(req).await;

    assert_eq!(result.verdict(), Verdict::Inconclusive);
    assert!(matches!(
        result.outcome(Phase::Teardown),
        Some(PhaseOutcome::Inconclusive(_))
    ));
    assert!(result.skipped.contains(&Phase::VerifyRestored));
    assert!(!host.is_running(VM));
    assert_eq!(disk_label(&host).as_deref(), Some(L0));
}

#[tokio::test]
async fn test_cancellation_still_restores() {
    let host = host().with_mode(EnforcementMode::Permissive);
    host.delay_start(Duration::from_secs(5));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let result = verifier(&host)
        .run_with_cancel(request(LabelPolicy::dynamic_selinux(false), L1, false), cancel)
        .await;

    assert_eq!(result.verdict(), Verdict::Inconclusive);
    assert!(result.phases.iter().any(|r| is_cancelled(&r.outcome)));
    assert!(result.outcome(Phase::RestoreResourceLabels).is_some());
    assert!(result.outcome(Phase::RestoreHostState).is_some());
    assert_eq!(disk_label(&host).as_deref(), Some(L0));
    assert_eq!(host.mode(), EnforcementMode::Permissive);
    assert!(!host.is_running(VM));
}

#[tokio::test]
async fn test_dropped_run_restores_in_background() {
    let host = host().with_mode(EnforcementMode::Permissive);
    host.delay_start(Duration::from_secs(5));
    let original = host.inactive_xml(VM).unwrap();
    let verifier = verifier(&host);

    let abandoned = tokio::time::timeout(
        Duration::from_millis(200),
        verifier.run(request(LabelPolicy::dynamic_selinux(false), L1, false)),
    )
    .await;
    assert!(abandoned.is_err());

    // Background restoration holds the host lock until it is done
    let _lease = locks::acquire_host().await;
    assert_eq!(disk_label(&host).as_deref(), Some(L0));
    assert_eq!(host.mode(), EnforcementMode::Permissive);
    assert_eq!(host.inactive_xml(VM), Some(original));
}

#[tokio::test]
async fn test_security_driver_override_is_reverted() {
    let host = host();
    let options = VerifierOptions {
        security_driver: Some("none".to_string()),
        ..Default::default()
    };
    let policy = LabelPolicy::new(SecType::None, None, None, false);

    let result = verifier_with(&host, options).run(request(policy, L0, false)).await;

    assert_eq!(result.verdict(), Verdict::Pass, "{:?}", result.phases);
    assert_eq!(
        result.outcome(Phase::ConfigureSecurityDriver),
        Some(&PhaseOutcome::Pass)
    );
    assert!(host.events().iter().any(|e| e == "conf security_driver = \"none\""));
    assert_eq!(host.conf_value("security_driver").as_deref(), Some("\"selinux\""));
    assert_eq!(host.restarts(), 2);
}

/// Label store whose enforcement mode cannot be set back to `stuck`
struct StickyMode {
    inner: FakeHost,
    stuck: EnforcementMode,
}

#[async_trait]
impl LabelStore for StickyMode {
    async fn label_of(&self, path: &Path) -> AdapterResult<String> {
        self.inner.label_of(path).await
    }

    async fn set_label(&self, path: &Path, label: &str) -> AdapterResult<()> {
        self.inner.set_label(path, label).await
    }

    async fn host_mode(&self) -> AdapterResult<EnforcementMode> {
        self.inner.host_mode().await
    }

    async fn set_host_mode(&self, mode: EnforcementMode) -> AdapterResult<()> {
        if mode == self.stuck {
            return Err(AdapterError::Unsupported("setenforce: permission denied".into()));
        }
        self.inner.set_host_mode(mode).await
    }

    async fn process_label(&self, pid: u32) -> AdapterResult<String> {
        self.inner.process_label(pid).await
    }
}

#[tokio::test]
async fn test_restoration_failure_is_surfaced_on_passing_scenario() {
    let host = host().with_mode(EnforcementMode::Permissive);
    let shared = Arc::new(host.clone());
    let store = Arc::new(StickyMode {
        inner: host.clone(),
        stuck: EnforcementMode::Permissive,
    });
    let verifier = LifecycleVerifier::new(
        HostAdapters::new(store, shared.clone(), Some(shared)),
        VerifierOptions::default(),
    );

    let result = verifier
        .run(request(LabelPolicy::dynamic_selinux(false), L1, false))
        .await;

    assert_eq!(result.verdict(), Verdict::Pass, "{:?}", result.phases);
    assert!(result.has_host_drift());
    assert_eq!(result.restoration_failures.len(), 1);
    assert_eq!(result.restoration_failures[0].target, "host enforcement mode");
    assert!(matches!(
        result.outcome(Phase::RestoreHostState),
        Some(PhaseOutcome::Inconclusive(_))
    ));
    // Labels are still restored
    assert_eq!(disk_label(&host).as_deref(), Some(L0));
}

#[tokio::test]
async fn test_concurrent_runs_are_serialized() {
    let host = host();
    let verifier = verifier(&host);

    let (first, second) = tokio::join!(
        verifier.run(request(LabelPolicy::dynamic_selinux(true), L1, false)),
        verifier.run(request(LabelPolicy::dynamic_selinux(false), L1, false)),
    );

    assert_eq!(first.verdict(), Verdict::Pass, "{:?}", first.phases);
    assert_eq!(second.verdict(), Verdict::Pass, "{:?}", second.phases);

    let lifecycle: Vec<String> = host
        .events()
        .into_iter()
        .filter(|e| e.starts_with("start") || e.starts_with("destroy"))
        .collect();
    assert_eq!(lifecycle, vec!["start vm1", "destroy vm1", "start vm1", "destroy vm1"]);
}

#[tokio::test]
async fn test_full_matrix_passes_and_restores_host() {
    let host = host().with_mode(EnforcementMode::Permissive);
    let original = host.inactive_xml(VM).unwrap();
    let verifier = verifier(&host);
    let labels = LabelsConfig::default();
    let target = MatrixTarget {
        vm_name: VM.to_string(),
        disks: vec![PathBuf::from(DISK)],
        host_mode: EnforcementMode::Enforcing,
        teardown: Teardown::Destroy,
    };

    let report = run_matrix(
        &verifier,
        &ScenarioMatrix::new(&labels),
        &target,
        CancellationToken::new(),
    )
    .await;

    assert_eq!(report.results.len(), 12);
    for result in &report.results {
        assert_eq!(result.verdict(), Verdict::Pass, "{}: {:?}", result.scenario, result.phases);
    }
    assert!(report.is_success());
    assert!(report.drifted().is_empty());

    assert_eq!(disk_label(&host).as_deref(), Some(L0));
    assert_eq!(host.mode(), EnforcementMode::Permissive);
    assert_eq!(host.inactive_xml(VM), Some(original));
    assert!(!host.is_running(VM));
}

#[tokio::test]
async fn test_cancelled_matrix_stops_early() {
    let host = host();
    let verifier = verifier(&host);
    let target = MatrixTarget {
        vm_name: VM.to_string(),
        disks: vec![PathBuf::from(DISK)],
        host_mode: EnforcementMode::Enforcing,
        teardown: Teardown::Destroy,
    };
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = run_matrix(
        &verifier,
        &ScenarioMatrix::new(&LabelsConfig::default()),
        &target,
        cancel,
    )
    .await;

    assert!(report.results.is_empty());
    assert!(!report.is_success());
}

#[tokio::test]
async fn test_descriptor_carries_policy_while_running() {
    // The policy reaches the control plane through the descriptor
    let host = host();
    let verifier = verifier(&host);
    let result = verifier
        .run(request(LabelPolicy::static_selinux(STATIC, true), L0, false))
        .await;
    assert_eq!(result.verdict(), Verdict::Pass, "{:?}", result.phases);

    let live = host.live_descriptor(VM).await.unwrap();
    // Stopped again, so the live view is the restored inactive descriptor
    assert!(live.seclabel().unwrap().is_none());
}

/// Label store that is slow to write `slow_label`
struct SlowWrites {
    inner: FakeHost,
    slow_label: &'static str,
    delay: Duration,
}

#[async_trait]
impl LabelStore for SlowWrites {
    async fn label_of(&self, path: &Path) -> AdapterResult<String> {
        self.inner.label_of(path).await
    }

    async fn set_label(&self, path: &Path, label: &str) -> AdapterResult<()> {
        if label == self.slow_label {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.set_label(path, label).await
    }

    async fn host_mode(&self) -> AdapterResult<EnforcementMode> {
        self.inner.host_mode().await
    }

    async fn set_host_mode(&self, mode: EnforcementMode) -> AdapterResult<()> {
        self.inner.set_host_mode(mode).await
    }

    async fn process_label(&self, pid: u32) -> AdapterResult<String> {
        self.inner.process_label(pid).await
    }
}

#[tokio::test]
async fn test_dropped_run_during_restoration_still_restores() {
    let host = host().with_mode(EnforcementMode::Permissive);
    let shared = Arc::new(host.clone());
    let store = Arc::new(SlowWrites {
        inner: host.clone(),
        slow_label: L0,
        delay: Duration::from_millis(300),
    });
    let verifier = LifecycleVerifier::new(
        HostAdapters::new(store, shared.clone(), Some(shared)),
        VerifierOptions::default(),
    );

    // Phases 1 to 8 finish quickly; the timeout fires while L0 is written back
    let abandoned = tokio::time::timeout(
        Duration::from_millis(100),
        verifier.run(request(LabelPolicy::dynamic_selinux(false), L1, false)),
    )
    .await;
    assert!(abandoned.is_err());

    let _lease = locks::acquire_host().await;
    assert_eq!(disk_label(&host).as_deref(), Some(L0));
    assert_eq!(host.mode(), EnforcementMode::Permissive);
    assert!(!host.is_running(VM));
}

#[tokio::test]
async fn test_environment_failure_at_start_is_not_expected_rejection() {
    let host = host();
    let desc = host.read_descriptor(VM).await.unwrap();
    host.start_vm(&desc).await.unwrap();

    let result = verifier(&host)
        .run(request(LabelPolicy::static_selinux(STATIC, false), L1, true))
        .await;

    assert_eq!(result.verdict(), Verdict::Inconclusive);
    match result.outcome(Phase::StartVm) {
        Some(PhaseOutcome::Inconclusive(reason)) => assert!(reason.contains("already running")),
        other => panic!("unexpected start outcome: {:?}", other),
    }
    assert!(!host.is_running(VM));
    assert_eq!(disk_label(&host).as_deref(), Some(L0));
}
