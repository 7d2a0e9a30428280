// Phase outcomes and scenario results

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::label::{EnforcementMode, LabelPolicy, VmSecuritySnapshot};

/// Verification phases in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    CaptureBaseline,
    ForceHostMode,
    ConfigureSecurityDriver,
    ApplyResourceLabels,
    ApplyDescriptor,
    StartVm,
    VerifyRunning,
    Teardown,
    VerifyRestored,
    RestoreResourceLabels,
    RestoreHostState,
}

impl Phase {
    pub const SEQUENCE: [Phase; 11] = [
        Phase::CaptureBaseline,
        Phase::ForceHostMode,
        Phase::ConfigureSecurityDriver,
        Phase::ApplyResourceLabels,
        Phase::ApplyDescriptor,
        Phase::StartVm,
        Phase::VerifyRunning,
        Phase::Teardown,
        Phase::VerifyRestored,
        Phase::RestoreResourceLabels,
        Phase::RestoreHostState,
    ];

    /// Step number as printed in reports
    pub fn number(&self) -> &'static str {
        match self {
            Self::CaptureBaseline => "1",
            Self::ForceHostMode => "2",
            Self::ConfigureSecurityDriver => "2a",
            Self::ApplyResourceLabels => "3",
            Self::ApplyDescriptor => "4",
            Self::StartVm => "5",
            Self::VerifyRunning => "6",
            Self::Teardown => "7",
            Self::VerifyRestored => "8",
            Self::RestoreResourceLabels => "9",
            Self::RestoreHostState => "10",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::CaptureBaseline => "capture baseline",
            Self::ForceHostMode => "force host mode",
            Self::ConfigureSecurityDriver => "configure security driver",
            Self::ApplyResourceLabels => "apply resource labels",
            Self::ApplyDescriptor => "apply descriptor",
            Self::StartVm => "start vm",
            Self::VerifyRunning => "verify running labels",
            Self::Teardown => "teardown vm",
            Self::VerifyRestored => "verify restored labels",
            Self::RestoreResourceLabels => "restore resource labels",
            Self::RestoreHostState => "restore host state",
        }
    }

    /// Restoration phases run unconditionally and never decide the verdict
    pub fn is_restoration(&self) -> bool {
        matches!(self, Self::RestoreResourceLabels | Self::RestoreHostState)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.number(), self.name())
    }
}

/// Class of an assertion failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailKind {
    /// Running-state labels diverge from the policy
    Assertion,
    /// A transient label survived teardown
    RestorationIntegrity,
    /// Start was refused in a positive scenario
    StartRejected,
    /// Start succeeded in a negative scenario
    UnexpectedStart,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailReason {
    pub kind: FailKind,
    pub message: String,
}

/// Result of one phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "lowercase")]
pub enum PhaseOutcome {
    Pass,
    Fail(FailReason),
    Inconclusive(String),
}

impl PhaseOutcome {
    pub fn fail(kind: FailKind, message: impl Into<String>) -> Self {
        Self::Fail(FailReason {
            kind,
            message: message.into(),
        })
    }

    pub fn inconclusive(reason: impl Into<String>) -> Self {
        Self::Inconclusive(reason.into())
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }
}

impl fmt::Display for PhaseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "PASS"),
            Self::Fail(reason) => write!(f, "FAIL ({:?}): {}", reason.kind, reason.message),
            Self::Inconclusive(reason) => write!(f, "INCONCLUSIVE: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub outcome: PhaseOutcome,
    pub elapsed_ms: f64,
}

/// Cleanup step that could not return the host to its baseline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestorationFailure {
    /// What was being restored, e.g. a path or "host enforcement mode"
    pub target: String,
    pub message: String,
}

/// Overall result of a scenario
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
    Inconclusive,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Inconclusive => "INCONCLUSIVE",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub scenario: String,
    pub run_id: Uuid,
    pub policy: LabelPolicy,
    pub expect_failure: bool,
    pub host_mode: EnforcementMode,
    pub phases: Vec<PhaseRecord>,
    /// Phases not executed because an earlier phase short-circuited the run
    pub skipped: Vec<Phase>,
    pub restoration_failures: Vec<RestorationFailure>,
    pub running: Option<VmSecuritySnapshot>,
    pub after_teardown: Option<VmSecuritySnapshot>,
    pub duration_ms: f64,
}

impl ScenarioResult {
    /// Class of the first non-passing verification phase
    pub fn verdict(&self) -> Verdict {
        self.first_problem()
            .map(|record| match record.outcome {
                PhaseOutcome::Fail(_) => Verdict::Fail,
                _ => Verdict::Inconclusive,
            })
            .unwrap_or(Verdict::Pass)
    }

    pub fn first_problem(&self) -> Option<&PhaseRecord> {
        self.phases
            .iter()
            .filter(|r| !r.phase.is_restoration())
            .find(|r| !r.outcome.is_pass())
    }

    pub fn outcome(&self, phase: Phase) -> Option<&PhaseOutcome> {
        self.phases
            .iter()
            .find(|r| r.phase == phase)
            .map(|r| &r.outcome)
    }

    /// Cleanup left the host in a different state than it started in
    pub fn has_host_drift(&self) -> bool {
        !self.restoration_failures.is_empty()
    }
}
