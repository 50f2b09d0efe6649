//! Group membership and teardown.
//!
//! A group is every libvirt domain whose name contains the group id: a
//! Cisco instance is one domain, a Juniper instance is a `vcp-`/`vfp-` pair.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ProvisionError, Result};
use crate::executor::HostExecutor;
use crate::hypervisor::{remove_path, vcp_name, vfp_name, CommandOutcome, Virsh, VmxInstaller};
use crate::settings::Timings;

/// Disk images referenced by a domain definition.
pub fn disk_sources(domain_xml: &str) -> Vec<PathBuf> {
    let Ok(re) = Regex::new(r#"<source file=['"]([^'"]+)['"]"#) else {
        return Vec::new();
    };
    re.captures_iter(domain_xml)
        .map(|c| PathBuf::from(&c[1]))
        .collect()
}

/// Directory of an extracted vMX bundle: the ancestor of `disk` named after
/// the instance.
fn bundle_dir(disk: &Path, instance: &str) -> Option<PathBuf> {
    let mut dir = PathBuf::new();
    for component in disk.parent()?.components() {
        dir.push(component);
        if component.as_os_str() == instance {
            return Some(dir);
        }
    }
    None
}

/// Every command a teardown issued and how it went.
#[derive(Debug, Clone, Serialize)]
pub struct TeardownReport {
    pub group: String,
    pub outcomes: Vec<CommandOutcome>,
}

impl TeardownReport {
    fn new(group: &str) -> Self {
        Self {
            group: group.to_string(),
            outcomes: Vec::new(),
        }
    }

    fn push(&mut self, outcome: CommandOutcome) {
        self.outcomes.push(outcome);
    }

    pub fn failures(&self) -> Vec<String> {
        self.outcomes.iter().filter_map(|o| o.error.clone()).collect()
    }

    /// `Err(TeardownPartialFailure)` if any command failed.
    pub fn into_result(self) -> Result<Self> {
        let failures = self.failures();
        if failures.is_empty() {
            Ok(self)
        } else {
            Err(ProvisionError::TeardownPartialFailure {
                group: self.group,
                failures,
            })
        }
    }
}

pub struct GroupRegistry<'a> {
    exec: &'a dyn HostExecutor,
    virsh: Virsh<'a>,
    vmx: VmxInstaller<'a>,
}

impl<'a> GroupRegistry<'a> {
    pub fn new(exec: &'a dyn HostExecutor, timings: &'a Timings) -> Self {
        Self {
            exec,
            virsh: Virsh::new(exec),
            vmx: VmxInstaller::new(exec, timings),
        }
    }

    /// Domains whose name contains `group`.
    pub fn members_of(&self, group: &str) -> Result<Vec<String>> {
        let members: Vec<String> = self
            .virsh
            .list_all()?
            .into_iter()
            .filter(|name| name.contains(group))
            .collect();
        let own = [group.to_string(), vcp_name(group), vfp_name(group)];
        for name in members.iter().filter(|n| !own.contains(n)) {
            warn!(group, domain = %name, "domain matches the group id but may belong to another group");
        }
        Ok(members)
    }

    /// Remove every member of `group`, its storage and, for Juniper, its
    /// bundle directory.
    ///
    /// Every command runs even when an earlier one fails; check the report.
    /// An empty group is an error.
    pub fn teardown(&self, group: &str) -> Result<TeardownReport> {
        let members = self.members_of(group)?;
        if members.is_empty() {
            return Err(ProvisionError::InvalidSpec(format!(
                "no VMs found in group '{}'",
                group
            )));
        }
        info!(group, count = members.len(), "tearing down group");

        let mut report = TeardownReport::new(group);
        for member in &members {
            if member.starts_with("vfp-") {
                // Removed together with its vcp- half.
                debug!(domain = %member, "skipping forwarding plane");
                continue;
            }

            let disk = match self.virsh.dump_xml(member) {
                Ok(xml) => disk_sources(&xml)
                    .into_iter()
                    .find(|p| p.to_string_lossy().contains(group)),
                Err(e) => {
                    report.push(CommandOutcome {
                        command: format!("virsh dumpxml {}", member),
                        error: Some(e.to_string()),
                    });
                    None
                }
            };

            if let Some(instance) = member.strip_prefix("vcp-") {
                match disk.as_deref().and_then(|d| bundle_dir(d, instance)) {
                    Some(dir) => {
                        report.push(self.vmx.cleanup(&dir));
                        report.push(remove_path(self.exec, &dir));
                    }
                    None => report.push(CommandOutcome {
                        command: format!("locate bundle of {}", member),
                        error: Some(format!("no disk of '{}' lies under a '{}' directory", member, instance)),
                    }),
                }
                continue;
            }

            report.push(self.virsh.destroy(member));
            report.push(self.virsh.undefine(member, true));
            if let Some(path) = disk {
                report.push(remove_path(self.exec, &path));
            }
        }
        Ok(report)
    }
}
