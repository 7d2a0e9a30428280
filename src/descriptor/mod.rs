// VM Descriptor Transformer
//
// A VM configuration record is the libvirt domain XML. The transformer
// replaces the domain-level <seclabel> section with one rendered from a
// LabelPolicy and reads back what the control plane recorded after start.

pub mod xml;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::label::{LabelPolicy, SecType};
use self::xml::{Node, XmlError};

/// Errors raised while interpreting a domain descriptor
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("Malformed domain XML: {0}")]
    Malformed(#[from] XmlError),

    #[error("Domain XML has no <domain> root element")]
    MissingRoot,

    #[error("Domain XML has no <name> element")]
    MissingName,

    #[error("Invalid <seclabel>: {0}")]
    InvalidSeclabel(String),
}

/// A VM configuration record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmDescriptor {
    name: String,
    xml: String,
}

/// The domain-level security label section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecLabel {
    pub sec_type: SecType,
    pub model: Option<String>,
    pub relabel: Option<bool>,
    pub label: Option<String>,
    /// Filled in by the control plane on a running domain
    pub image_label: Option<String>,
}

impl SecLabel {
    /// Render the section for a policy.
    ///
    /// Inactive policies emit only `type='none'`: the control plane treats
    /// the presence of model/label/relabel as "labeling is active".
    pub fn from_policy(policy: &LabelPolicy) -> Self {
        if !policy.labeling_active() {
            return Self {
                sec_type: SecType::None,
                model: None,
                relabel: None,
                label: None,
                image_label: None,
            };
        }

        Self {
            sec_type: policy.sec_type,
            model: policy.model.clone(),
            relabel: Some(policy.relabel),
            label: policy.effective_label().map(str::to_string),
            image_label: None,
        }
    }

    pub fn to_xml(&self, indent: &str) -> String {
        let mut open = format!("<seclabel type='{}'", self.sec_type);
        if let Some(model) = &self.model {
            open.push_str(&format!(" model='{}'", xml::escape(model)));
        }
        if let Some(relabel) = self.relabel {
            open.push_str(&format!(" relabel='{}'", if relabel { "yes" } else { "no" }));
        }

        let mut children = Vec::new();
        if let Some(label) = &self.label {
            children.push(format!("<label>{}</label>", xml::escape(label)));
        }
        if let Some(image_label) = &self.image_label {
            children.push(format!("<imagelabel>{}</imagelabel>", xml::escape(image_label)));
        }

        if children.is_empty() {
            return format!("{}/>", open);
        }

        let mut out = format!("{}>\n", open);
        for child in children {
            out.push_str(&format!("{}  {}\n", indent, child));
        }
        out.push_str(&format!("{}</seclabel>", indent));
        out
    }

    fn from_node(node: &Node, nodes: &[Node]) -> Result<Self, DescriptorError> {
        let sec_type = match node.attr("type") {
            Some(t) => t
                .parse::<SecType>()
                .map_err(DescriptorError::InvalidSeclabel)?,
            // libvirt's default when a model is given without a type
            None => SecType::Dynamic,
        };
        let relabel = match node.attr("relabel") {
            Some("yes") => Some(true),
            Some("no") => Some(false),
            Some(other) => {
                return Err(DescriptorError::InvalidSeclabel(format!(
                    "relabel='{}'",
                    other
                )))
            }
            None => None,
        };
        let child_text = |name: &str| {
            nodes
                .iter()
                .find(|n| n.name == name && n.depth == node.depth + 1 && node.contains(n))
                .and_then(|n| n.text())
        };

        Ok(Self {
            sec_type,
            model: node.attr("model").map(str::to_string),
            relabel,
            label: child_text("label"),
            image_label: child_text("imagelabel"),
        })
    }
}

impl VmDescriptor {
    pub fn from_xml(xml: impl Into<String>) -> Result<Self, DescriptorError> {
        let xml = xml.into();
        let nodes = xml::parse(&xml)?;
        let root = nodes.first().ok_or(DescriptorError::MissingRoot)?;
        if root.name != "domain" {
            return Err(DescriptorError::MissingRoot);
        }
        let name = nodes
            .iter()
            .find(|n| n.name == "name" && n.depth == 1)
            .and_then(|n| n.text())
            .filter(|n| !n.is_empty())
            .ok_or(DescriptorError::MissingName)?;

        Ok(Self { name, xml })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn xml(&self) -> &str {
        &self.xml
    }

    fn nodes(&self) -> Vec<Node> {
        // Validated in from_xml
        xml::parse(&self.xml).unwrap_or_default()
    }

    /// Domain-level security label sections
    pub fn seclabels(&self) -> Result<Vec<SecLabel>, DescriptorError> {
        let nodes = self.nodes();
        nodes
            .iter()
            .filter(|n| n.name == "seclabel" && n.depth == 1)
            .map(|n| SecLabel::from_node(n, &nodes))
            .collect()
    }

    /// The selinux section if present, otherwise the first one
    pub fn seclabel(&self) -> Result<Option<SecLabel>, DescriptorError> {
        let mut labels = self.seclabels()?;
        let selinux = labels
            .iter()
            .position(|l| l.model.as_deref() == Some("selinux"));
        Ok(match selinux {
            Some(idx) => Some(labels.swap_remove(idx)),
            None => labels.into_iter().next(),
        })
    }

    /// Image label the control plane assigned; only present on a running
    /// domain's live descriptor when relabeling is active
    pub fn image_label(&self) -> Option<String> {
        self.seclabel().ok().flatten().and_then(|l| l.image_label)
    }

    /// Host paths backing the domain's disks
    pub fn disk_sources(&self) -> Vec<PathBuf> {
        let nodes = self.nodes();
        nodes
            .iter()
            .filter(|n| n.name == "disk" && n.attr("device").map_or(true, |d| d == "disk"))
            .filter_map(|disk| {
                nodes
                    .iter()
                    .find(|n| n.name == "source" && n.depth == disk.depth + 1 && disk.contains(n))
                    .and_then(|source| source.attr("file").or_else(|| source.attr("dev")))
                    .map(PathBuf::from)
            })
            .collect()
    }

    /// Copy of this descriptor with every domain-level <seclabel> replaced
    pub fn with_seclabel(&self, seclabel: &SecLabel) -> Self {
        let nodes = self.nodes();
        let existing: Vec<&Node> = nodes
            .iter()
            .filter(|n| n.name == "seclabel" && n.depth == 1)
            .collect();

        let mut xml = self.xml.clone();
        let rendered = seclabel.to_xml("  ");

        if let Some(first) = existing.first() {
            // Remove later sections back to front so offsets stay valid
            for node in existing.iter().skip(1).rev() {
                let start = line_start(&xml, node.span.start);
                let end = line_end(&xml, node.span.end);
                xml.replace_range(start..end, "");
            }
            xml.replace_range(first.span.clone(), &rendered);
        } else if let Some(root) = nodes.first() {
            let close = root
                .inner
                .as_ref()
                .map(|inner| inner.end)
                .unwrap_or(root.span.end);
            let at = line_start(&xml, close);
            xml.insert_str(at, &format!("  {}\n", rendered));
        }

        Self {
            name: self.name.clone(),
            xml,
        }
    }
}

/// Inject a label policy into a descriptor
pub fn apply(descriptor: &VmDescriptor, policy: &LabelPolicy) -> VmDescriptor {
    descriptor.with_seclabel(&SecLabel::from_policy(policy))
}

// Start of the line holding `pos` when only whitespace precedes it
fn line_start(xml: &str, pos: usize) -> usize {
    let start = xml[..pos].rfind('\n').map(|i| i + 1).unwrap_or(0);
    if xml[start..pos].trim().is_empty() {
        start
    } else {
        pos
    }
}

// Past the newline ending at `pos` when only whitespace follows it
fn line_end(xml: &str, pos: usize) -> usize {
    match xml[pos..].find('\n') {
        Some(offset) if xml[pos..pos + offset].trim().is_empty() => pos + offset + 1,
        _ => pos,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const DOMAIN: &str = "<domain type='kvm'>
  <name>avocado-vt-vm1</name>
  <memory unit='KiB'>1048576</memory>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='/var/lib/libvirt/images/vm1.qcow2'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='file' device='cdrom'>
      <source file='/var/lib/libvirt/images/seed.iso'/>
    </disk>
    <disk type='block' device='disk'>
      <source dev='/dev/sdb'>
        <seclabel model='selinux' relabel='no'/>
      </source>
    </disk>
  </devices>
</domain>
";

    fn descriptor() -> VmDescriptor {
        VmDescriptor::from_xml(DOMAIN).unwrap()
    }

    #[test]
    fn test_from_xml_reads_name() {
        assert_eq!(descriptor().name(), "avocado-vt-vm1");
    }

    #[test]
    fn test_from_xml_rejects_non_domain() {
        assert_eq!(
            VmDescriptor::from_xml("<network><name>x</name></network>"),
            Err(DescriptorError::MissingRoot)
        );
        assert_eq!(
            VmDescriptor::from_xml("<domain></domain>"),
            Err(DescriptorError::MissingName)
        );
    }

    #[test]
    fn test_disk_sources_skip_cdrom() {
        assert_eq!(
            descriptor().disk_sources(),
            vec![
                PathBuf::from("/var/lib/libvirt/images/vm1.qcow2"),
                PathBuf::from("/dev/sdb"),
            ]
        );
    }

    #[test]
    fn test_apply_static_policy() {
        let policy = LabelPolicy::static_selinux("system_u:system_r:svirt_t:s0:c1,c2", false);
        let updated = apply(&descriptor(), &policy);

        let label = updated.seclabel().unwrap().unwrap();
        assert_eq!(label.sec_type, SecType::Static);
        assert_eq!(label.model.as_deref(), Some("selinux"));
        assert_eq!(label.relabel, Some(false));
        assert_eq!(label.label.as_deref(), Some("system_u:system_r:svirt_t:s0:c1,c2"));
        assert!(updated.xml().contains("<label>system_u:system_r:svirt_t:s0:c1,c2</label>"));

        // Disk-level seclabel is untouched
        assert!(updated.xml().contains("<seclabel model='selinux' relabel='no'/>"));
        assert_eq!(updated.name(), "avocado-vt-vm1");
    }

    #[test]
    fn test_apply_none_policy_omits_fields() {
        let policy = LabelPolicy::new(
            SecType::None,
            Some("selinux".to_string()),
            Some("ignored".to_string()),
            true,
        );
        let updated = apply(&descriptor(), &policy);
        assert!(updated.xml().contains("<seclabel type='none'/>"));
        assert!(!updated.xml().contains("ignored"));

        let label = updated.seclabel().unwrap().unwrap();
        assert_eq!(label.sec_type, SecType::None);
        assert_eq!(label.model, None);
        assert_eq!(label.relabel, None);
        assert_eq!(label.label, None);
    }

    #[test]
    fn test_apply_replaces_previous_sections() {
        let static_policy = LabelPolicy::static_selinux("system_u:system_r:svirt_t:s0:c1,c2", true);
        let once = apply(&descriptor(), &static_policy);

        let dynamic = LabelPolicy::dynamic_selinux(true);
        let twice = apply(&once, &dynamic);

        let labels = twice.seclabels().unwrap();
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0].sec_type, SecType::Dynamic);
        assert_eq!(labels[0].label, None);
        assert!(!twice.xml().contains("svirt_t:s0:c1,c2"));
    }

    #[test]
    fn test_apply_collapses_multiple_sections() {
        let xml = "<domain>
  <name>vm</name>
  <seclabel type='dynamic' model='selinux'/>
  <seclabel type='dynamic' model='dac'/>
</domain>";
        let desc = VmDescriptor::from_xml(xml).unwrap();
        let updated = apply(&desc, &LabelPolicy::dynamic_selinux(false));
        assert_eq!(updated.seclabels().unwrap().len(), 1);
        assert!(VmDescriptor::from_xml(updated.xml()).is_ok());
    }

    #[test]
    fn test_image_label_from_live_descriptor() {
        let live = "<domain id='3'>
  <name>vm</name>
  <seclabel type='dynamic' model='dac' relabel='yes'>
    <label>+107:+107</label>
    <imagelabel>+107:+107</imagelabel>
  </seclabel>
  <seclabel type='dynamic' model='selinux' relabel='yes'>
    <label>system_u:system_r:svirt_t:s0:c87,c578</label>
    <imagelabel>system_u:object_r:svirt_image_t:s0:c87,c578</imagelabel>
  </seclabel>
</domain>";
        let desc = VmDescriptor::from_xml(live).unwrap();
        assert_eq!(
            desc.image_label().as_deref(),
            Some("system_u:object_r:svirt_image_t:s0:c87,c578")
        );
    }

    #[test]
    fn test_cdata_and_character_references() {
        let xml = "<domain>
  <name>vm&#45;1</name>
  <description><![CDATA[<seclabel type='static'/> is ignored]]></description>
  <seclabel type='static' model='selinux' relabel='no'>
    <label><![CDATA[system_u:system_r:svirt_t:s0:c1,c2]]></label>
  </seclabel>
</domain>";
        let desc = VmDescriptor::from_xml(xml).unwrap();
        assert_eq!(desc.name(), "vm-1");

        let labels = desc.seclabels().unwrap();
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0].label.as_deref(), Some("system_u:system_r:svirt_t:s0:c1,c2"));

        let updated = apply(&desc, &LabelPolicy::dynamic_selinux(true));
        assert_eq!(updated.seclabels().unwrap()[0].sec_type, SecType::Dynamic);
        assert!(updated.xml().contains("<![CDATA[<seclabel type='static'/> is ignored]]>"));
    }

    #[test]
    fn test_image_label_absent_on_inactive_descriptor() {
        assert_eq!(descriptor().image_label(), None);
    }

    #[test]
    fn test_invalid_relabel_value() {
        let xml = "<domain><name>vm</name><seclabel type='static' relabel='maybe'/></domain>";
        let desc = VmDescriptor::from_xml(xml).unwrap();
        assert!(matches!(
            desc.seclabel(),
            Err(DescriptorError::InvalidSeclabel(_))
        ));
    }

    fn arb_policy() -> impl Strategy<Value = LabelPolicy> {
        (
            prop_oneof![Just(SecType::Static), Just(SecType::Dynamic), Just(SecType::None)],
            proptest::option::of(Just("selinux".to_string())),
            proptest::option::of("[a-z_]{1,8}:[a-z_]{1,8}:[a-z_]{1,8}:s0(:c[0-9]{1,3},c[0-9]{1,3})?"),
            any::<bool>(),
        )
            .prop_map(|(sec_type, model, label, relabel)| {
                LabelPolicy::new(sec_type, model, label, relabel)
            })
    }

    proptest! {
        #[test]
        fn prop_apply_is_idempotent(policy in arb_policy()) {
            let once = apply(&descriptor(), &policy);
            let twice = apply(&once, &policy);
            prop_assert_eq!(once.xml(), twice.xml());
        }

        #[test]
        fn prop_applied_section_reflects_policy(policy in arb_policy()) {
            let updated = apply(&descriptor(), &policy);
            let label = updated.seclabel().unwrap().unwrap();
            prop_assert_eq!(label.sec_type, policy.effective_type());
            prop_assert_eq!(label.label.as_deref(), policy.effective_label());
            if policy.labeling_active() {
                prop_assert_eq!(label.relabel, Some(policy.relabel));
            } else {
                prop_assert_eq!(label.model, None);
                prop_assert_eq!(label.relabel, None);
            }
            prop_assert_eq!(updated.disk_sources().len(), 2);
        }
    }
}
