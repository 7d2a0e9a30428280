// Scenario Driver
//
// Enumerates the label policy matrix
// {static, dynamic, none} x {relabel yes, no} x {matching, mismatched}
// and decides which combinations must be refused by the host.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::LabelsConfig;
use crate::label::{EnforcementMode, LabelPolicy, ResourceTarget, SecType};
use crate::report::MatrixReport;
use crate::verifier::{LifecycleVerifier, ScenarioRequest, Teardown};

/// Label forced onto the disk before boot, relative to the static label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreLabel {
    /// Readable by the declared static context
    Matching,
    /// Denied to the declared static context
    Mismatched,
}

impl PreLabel {
    pub const ALL: [PreLabel; 2] = [PreLabel::Matching, PreLabel::Mismatched];
}

impl fmt::Display for PreLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Matching => f.write_str("matching"),
            Self::Mismatched => f.write_str("mismatched"),
        }
    }
}

impl std::str::FromStr for PreLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "matching" | "match" => Ok(Self::Matching),
            "mismatched" | "mismatch" => Ok(Self::Mismatched),
            _ => Err(format!("Invalid pre-label: {}", s)),
        }
    }
}

/// The start must be refused iff a static label meets an image it may not read
pub fn expect_failure(sec_type: SecType, pre_label: PreLabel) -> bool {
    sec_type == SecType::Static && pre_label == PreLabel::Mismatched
}

/// One cell of the policy matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scenario {
    pub sec_type: SecType,
    pub relabel: bool,
    pub pre_label: PreLabel,
}

impl Scenario {
    pub fn new(sec_type: SecType, relabel: bool, pre_label: PreLabel) -> Self {
        Self {
            sec_type,
            relabel,
            pre_label,
        }
    }

    pub fn name(&self) -> String {
        format!(
            "{}-relabel_{}-{}",
            self.sec_type,
            if self.relabel { "yes" } else { "no" },
            self.pre_label
        )
    }

    pub fn expect_failure(&self) -> bool {
        expect_failure(self.sec_type, self.pre_label)
    }

    pub fn policy(&self, labels: &LabelsConfig) -> LabelPolicy {
        let model = Some(labels.model.clone());
        match self.sec_type {
            SecType::Static => LabelPolicy::new(
                SecType::Static,
                model,
                Some(labels.static_label.clone()),
                self.relabel,
            ),
            SecType::Dynamic => LabelPolicy::new(SecType::Dynamic, model, None, self.relabel),
            SecType::None => LabelPolicy::new(SecType::None, None, None, self.relabel),
        }
    }

    pub fn pre_start_label<'a>(&self, labels: &'a LabelsConfig) -> &'a str {
        match self.pre_label {
            PreLabel::Matching => &labels.matching_image_label,
            PreLabel::Mismatched => &labels.mismatched_image_label,
        }
    }

    pub fn request(&self, labels: &LabelsConfig, target: &MatrixTarget) -> ScenarioRequest {
        let pre_start = self.pre_start_label(labels);
        ScenarioRequest {
            name: self.name(),
            vm_name: target.vm_name.clone(),
            policy: self.policy(labels),
            resources: target
                .disks
                .iter()
                .map(|disk| ResourceTarget::new(disk.clone(), Some(pre_start.to_string())))
                .collect(),
            expect_failure: self.expect_failure(),
            host_mode: target.host_mode,
            teardown: target.teardown,
        }
    }
}

/// VM and host settings shared by every scenario of a matrix run
#[derive(Debug, Clone)]
pub struct MatrixTarget {
    pub vm_name: String,
    pub disks: Vec<PathBuf>,
    pub host_mode: EnforcementMode,
    pub teardown: Teardown,
}

/// The full policy matrix
#[derive(Debug, Clone)]
pub struct ScenarioMatrix {
    labels: LabelsConfig,
    scenarios: Vec<Scenario>,
}

impl ScenarioMatrix {
    pub fn new(labels: &LabelsConfig) -> Self {
        let mut scenarios = Vec::with_capacity(12);
        for sec_type in SecType::ALL {
            for relabel in [true, false] {
                for pre_label in PreLabel::ALL {
                    scenarios.push(Scenario::new(sec_type, relabel, pre_label));
                }
            }
        }
        Self {
            labels: labels.clone(),
            scenarios,
        }
    }

    pub fn scenarios(&self) -> &[Scenario] {
        &self.scenarios
    }

    pub fn requests(&self, target: &MatrixTarget) -> Vec<ScenarioRequest> {
        self.scenarios
            .iter()
            .map(|s| s.request(&self.labels, target))
            .collect()
    }
}

/// Run every scenario in order; a cancelled run stops after the scenario in
/// progress has restored the host
pub async fn run_matrix(
    verifier: &LifecycleVerifier,
    matrix: &ScenarioMatrix,
    target: &MatrixTarget,
    cancel: CancellationToken,
) -> MatrixReport {
    let mut report = MatrixReport::new(&target.vm_name, target.host_mode);
    let requests = matrix.requests(target);
    let total = requests.len();

    for (index, request) in requests.into_iter().enumerate() {
        if cancel.is_cancelled() {
            warn!("Matrix cancelled, {} scenario(s) not run", total - index);
            break;
        }
        info!("Scenario {}/{}: {}", index + 1, total, request.name);
        let result = verifier.run_with_cancel(request, cancel.clone()).await;
        report.push(result);
    }

    report.finish();
    report
}
