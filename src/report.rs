// Matrix Report
//
// Collects scenario results of a matrix run and renders them as JSON and as a
// plain-text summary.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::label::EnforcementMode;
use crate::verifier::{ScenarioResult, Verdict};

pub const REPORT_FILE: &str = "label-matrix-report.json";
pub const SUMMARY_FILE: &str = "label-matrix-summary.txt";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixReport {
    pub generated_at: DateTime<Utc>,
    pub hostname: String,
    pub vm_name: String,
    pub host_mode: EnforcementMode,
    pub results: Vec<ScenarioResult>,
    pub total_time_ms: f64,
}

impl MatrixReport {
    pub fn new(vm_name: &str, host_mode: EnforcementMode) -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            generated_at: Utc::now(),
            hostname,
            vm_name: vm_name.to_string(),
            host_mode,
            results: Vec::new(),
            total_time_ms: 0.0,
        }
    }

    pub fn push(&mut self, result: ScenarioResult) {
        self.results.push(result);
    }

    /// Stamp the elapsed time since the report was created
    pub fn finish(&mut self) {
        let elapsed = Utc::now() - self.generated_at;
        self.total_time_ms = elapsed.num_microseconds().unwrap_or(0) as f64 / 1000.0;
    }

    fn count(&self, verdict: Verdict) -> usize {
        self.results.iter().filter(|r| r.verdict() == verdict).count()
    }

    pub fn passed(&self) -> usize {
        self.count(Verdict::Pass)
    }

    pub fn failed(&self) -> usize {
        self.count(Verdict::Fail)
    }

    pub fn inconclusive(&self) -> usize {
        self.count(Verdict::Inconclusive)
    }

    /// Scenarios whose cleanup left the host changed
    pub fn drifted(&self) -> Vec<&ScenarioResult> {
        self.results.iter().filter(|r| r.has_host_drift()).collect()
    }

    pub fn is_success(&self) -> bool {
        !self.results.is_empty() && self.passed() == self.results.len()
    }

    pub fn summary(&self) -> String {
        let mut summary = String::new();
        summary.push_str("Label Lifecycle Matrix Summary\n");
        summary.push_str("==============================\n");
        summary.push_str(&format!("Host: {} ({})\n", self.hostname, self.host_mode));
        summary.push_str(&format!("VM: {}\n", self.vm_name));
        summary.push_str(&format!("Generated: {}\n", self.generated_at.to_rfc3339()));
        summary.push_str(&format!(
            "Scenarios: {}  Pass: {}  Fail: {}  Inconclusive: {}\n",
            self.results.len(),
            self.passed(),
            self.failed(),
            self.inconclusive()
        ));
        summary.push_str(&format!("Execution Time: {:.2}ms\n\n", self.total_time_ms));

        for result in &self.results {
            summary.push_str(&format!(
                "{:<13} {:<32} expect_failure={:<5}",
                result.verdict(),
                result.scenario,
                result.expect_failure
            ));
            if let Some(problem) = result.first_problem() {
                summary.push_str(&format!(" {} {}", problem.phase, problem.outcome));
            }
            summary.push('\n');
        }

        let drifted = self.drifted();
        if !drifted.is_empty() {
            summary.push_str("\nHOST DRIFT WARNINGS:\n");
            for result in drifted {
                for failure in &result.restoration_failures {
                    summary.push_str(&format!(
                        "  - {}: {} not restored: {}\n",
                        result.scenario, failure.target, failure.message
                    ));
                }
            }
        }
        summary
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| anyhow!("Failed to serialize matrix report: {}", e))
    }

    /// Write the JSON report and text summary into `output_dir`
    pub fn save(&self, output_dir: &Path) -> Result<(PathBuf, PathBuf)> {
        fs::create_dir_all(output_dir)
            .with_context(|| format!("Failed to create report directory {:?}", output_dir))?;

        let report_path = output_dir.join(REPORT_FILE);
        fs::write(&report_path, self.to_json()?).context("Failed to write matrix report")?;
        info!("Matrix report saved to: {:?}", report_path);

        let summary_path = output_dir.join(SUMMARY_FILE);
        fs::write(&summary_path, self.summary()).context("Failed to write matrix summary")?;
        info!("Matrix summary saved to: {:?}", summary_path);

        Ok((report_path, summary_path))
    }
}
