// Security Label Model
//
// Policy, per-resource baseline records and observed snapshots for the
// label lifecycle verifier.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// How the control plane assigns the VM's security label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecType {
    /// Caller-specified fixed context, enforced exactly
    Static,
    /// Control plane generates the context
    Dynamic,
    /// No confinement
    None,
}

impl SecType {
    pub const ALL: [SecType; 3] = [SecType::Static, SecType::Dynamic, SecType::None];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Dynamic => "dynamic",
            Self::None => "none",
        }
    }
}

impl fmt::Display for SecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "static" => Ok(Self::Static),
            "dynamic" => Ok(Self::Dynamic),
            "none" => Ok(Self::None),
            _ => Err(format!("Invalid security label type: {}", s)),
        }
    }
}

/// Host-wide MAC posture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementMode {
    Enforcing,
    Permissive,
    Disabled,
}

impl EnforcementMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enforcing => "enforcing",
            Self::Permissive => "permissive",
            Self::Disabled => "disabled",
        }
    }
}

impl fmt::Display for EnforcementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnforcementMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "enforcing" | "1" => Ok(Self::Enforcing),
            "permissive" | "0" => Ok(Self::Permissive),
            "disabled" => Ok(Self::Disabled),
            _ => Err(format!("Invalid enforcement mode: {}", s)),
        }
    }
}

/// Label policy injected into the VM descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelPolicy {
    pub sec_type: SecType,

    /// MAC model (e.g. "selinux"); absent means labeling is not configured
    pub model: Option<String>,

    /// Process context for static labels
    pub label: Option<String>,

    /// Whether the control plane may rewrite resource labels while running
    pub relabel: bool,
}

impl LabelPolicy {
    pub fn new(
        sec_type: SecType,
        model: Option<String>,
        label: Option<String>,
        relabel: bool,
    ) -> Self {
        Self {
            sec_type,
            model,
            label,
            relabel,
        }
    }

    /// A static policy under the selinux model
    pub fn static_selinux(label: impl Into<String>, relabel: bool) -> Self {
        Self::new(
            SecType::Static,
            Some("selinux".to_string()),
            Some(label.into()),
            relabel,
        )
    }

    /// A dynamic policy under the selinux model
    pub fn dynamic_selinux(relabel: bool) -> Self {
        Self::new(SecType::Dynamic, Some("selinux".to_string()), None, relabel)
    }

    /// Type as seen by the control plane: a policy without a model is
    /// treated as no labeling at all.
    pub fn effective_type(&self) -> SecType {
        if self.model.is_none() {
            SecType::None
        } else {
            self.sec_type
        }
    }

    pub fn labeling_active(&self) -> bool {
        self.effective_type() != SecType::None
    }

    /// Label that the control plane must honour, if any
    pub fn effective_label(&self) -> Option<&str> {
        if self.labeling_active() {
            self.label.as_deref()
        } else {
            None
        }
    }
}

impl fmt::Display for LabelPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "type={} model={} relabel={}",
            self.sec_type,
            self.model.as_deref().unwrap_or("-"),
            if self.relabel { "yes" } else { "no" }
        )?;
        if let Some(label) = &self.label {
            write!(f, " label={}", label)?;
        }
        Ok(())
    }
}

/// A resource consumed by the VM and the label to force onto it before boot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTarget {
    pub path: PathBuf,

    /// Label written before start; `None` leaves the baseline in place
    pub pre_start_label: Option<String>,
}

impl ResourceTarget {
    pub fn new(path: impl Into<PathBuf>, pre_start_label: Option<String>) -> Self {
        Self {
            path: path.into(),
            pre_start_label,
        }
    }
}

/// Baseline for one resource, captured once before any mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLabelRecord {
    pub path: PathBuf,

    /// Label found on the resource before the run touched it
    pub original_label: String,

    /// Label written before start
    pub policy_label: String,
}

impl ResourceLabelRecord {
    pub fn capture(target: &ResourceTarget, original_label: String) -> Self {
        let policy_label = target
            .pre_start_label
            .clone()
            .unwrap_or_else(|| original_label.clone());
        Self {
            path: target.path.clone(),
            original_label,
            policy_label,
        }
    }
}

/// Labels observed at one point of the VM lifecycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSecuritySnapshot {
    pub process_label: Option<String>,
    pub resource_labels: BTreeMap<PathBuf, String>,
}

/// Derive the image context the control plane pairs with a process context.
///
/// `system_u:system_r:svirt_t:s0:c1,c2` becomes
/// `system_u:object_r:svirt_image_t:s0:c1,c2`.
pub fn image_label_for(process_label: &str) -> String {
    let level = process_label.splitn(4, ':').nth(3).unwrap_or("s0");
    format!("system_u:object_r:svirt_image_t:{}", level)
}
