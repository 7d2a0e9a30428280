//! svirt-verify Library
//!
//! Verifies the security label lifecycle of libvirt guests on SELinux hosts:
//! the labels a VM and its disk images carry while it starts, runs and stops,
//! and that the host is returned to its prior state afterwards.
//!
//! - [`verifier`]: the phase-by-phase lifecycle verifier
//! - [`scenario`]: the label policy matrix and its expected outcomes
//! - [`descriptor`]: `<seclabel>` injection into domain XML
//! - [`adapters`]: host collaborators (SELinux, virsh, libvirtd) and an
//!   in-memory host for simulation and tests

pub mod adapters;
pub mod config;
pub mod descriptor;
pub mod label;
pub mod logging;
pub mod report;
pub mod scenario;
pub mod verifier;

pub use label::{EnforcementMode, LabelPolicy, ResourceTarget, SecType};
pub use report::MatrixReport;
pub use scenario::{PreLabel, Scenario, ScenarioMatrix};
pub use verifier::{LifecycleVerifier, ScenarioRequest, ScenarioResult, Verdict, VerifierOptions};
