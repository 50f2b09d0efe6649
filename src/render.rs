//! Hypervisor configuration artifacts.
//!
//! Cisco instances get a libvirt domain XML defined through virsh. Juniper
//! instances get the two YAML manifests `vmx.sh` reads from the bundle's
//! `config/` directory. MACs and console ports derive from the lowest
//! allocated CPU, so two runs on the same CPUs produce the same values and
//! runs on different CPUs never collide.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::error::{ProvisionError, Result};
use crate::planner::CpuAllocation;
use crate::settings::ImageCatalog;
use crate::vm::{DeviceFamily, InterfaceKind, VmSpec};

/// Management NICs every Cisco domain gets on the management bridge.
pub const CISCO_MGMT_NICS: usize = 3;

/// First Juniper console port. Each instance takes the pair
/// `BASE + 2*lowest` (control plane) and `BASE + 2*lowest + 1` (forwarding
/// plane), so pairs of different CPUs never overlap.
pub const CONSOLE_PORT_BASE: u16 = 8600;

/// A rendered file and where it goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub path: PathBuf,
    #[serde(skip)]
    pub contents: String,
}

impl Artifact {
    pub fn write(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, &self.contents)?;
        debug!(path = %self.path.display(), bytes = self.contents.len(), "wrote artifact");
        Ok(())
    }
}

/// Per-group MAC suffix counter. Every call yields a new value.
#[derive(Debug, Default)]
pub struct MacCounter {
    issued: u32,
}

impl MacCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next two-digit hex suffix, starting at `01`.
    pub fn next_suffix(&mut self) -> String {
        self.issued += 1;
        format!("{:02x}", self.issued % 0x100)
    }
}

/// Everything the renderers need to know about one instance.
#[derive(Debug, Clone, Copy)]
pub struct Instance<'a> {
    pub spec: &'a VmSpec,
    pub cpus: &'a CpuAllocation,
    /// Resolved management bridge.
    pub mgmt_bridge: &'a str,
    /// Cisco: the instance disk. Juniper: the extracted bundle directory.
    pub staged: &'a Path,
}

impl Instance<'_> {
    /// Low byte of the lowest allocated CPU, in hex.
    fn id(&self) -> String {
        format!("{:02x}", self.cpus.lowest() & 0xff)
    }
}

/// Control-plane and forwarding-plane console ports of a Juniper instance.
pub fn console_ports(cpus: &CpuAllocation) -> Result<(u16, u16)> {
    let lowest = cpus.lowest();
    let vcp = lowest
        .checked_mul(2)
        .and_then(|offset| u16::try_from(offset).ok())
        .and_then(|offset| CONSOLE_PORT_BASE.checked_add(offset));
    match vcp.and_then(|port| port.checked_add(1).map(|vfp| (port, vfp))) {
        Some(ports) => Ok(ports),
        None => Err(ProvisionError::InvalidSpec(format!(
            "no console ports left for CPU {}",
            lowest
        ))),
    }
}

pub struct ConfigGenerator<'a> {
    catalog: &'a ImageCatalog,
}

impl<'a> ConfigGenerator<'a> {
    pub fn new(catalog: &'a ImageCatalog) -> Self {
        Self { catalog }
    }

    pub fn render(&self, instance: &Instance<'_>, macs: &mut MacCounter) -> Result<Vec<Artifact>> {
        let artifacts = match instance.spec.family() {
            DeviceFamily::Cisco => vec![Artifact {
                path: instance.staged.with_extension("xml"),
                contents: self.domain_xml(instance, macs),
            }],
            DeviceFamily::Juniper => {
                let config_dir = instance.staged.join("config");
                vec![
                    Artifact {
                        path: config_dir.join("vmx.conf"),
                        contents: self.vmx_conf(instance, macs)?,
                    },
                    Artifact {
                        path: config_dir.join("vmx-junosdev.conf"),
                        contents: junosdev_conf(instance),
                    },
                ]
            }
        };
        Ok(artifacts)
    }

    // ========================================================================
    // Cisco domain XML
    // ========================================================================

    fn domain_xml(&self, instance: &Instance<'_>, macs: &mut MacCounter) -> String {
        let image = &self.catalog.cisco;
        let cpus = instance.cpus.cpus();
        let cpuset = cpus
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let mut xml = String::new();
        xml.push_str(&format!(
            r#"<domain type='kvm'>
  <name>{}</name>
  <uuid>{}</uuid>
  <memory unit='KiB'>{}</memory>
  <currentMemory unit='KiB'>{}</currentMemory>
  <memoryBacking>
    <hugepages/>
  </memoryBacking>
  <vcpu placement='static' cpuset='{}'>{}</vcpu>
"#,
            instance.spec.name(),
            Uuid::new_v4(),
            image.memory_kib,
            image.memory_kib,
            cpuset,
            cpus.len()
        ));

        xml.push_str("  <cputune>\n");
        for (vcpu, cpu) in cpus.iter().enumerate() {
            xml.push_str(&format!("    <vcpupin vcpu='{}' cpuset='{}'/>\n", vcpu, cpu));
        }
        xml.push_str(&format!("    <emulatorpin cpuset='{}'/>\n", cpuset));
        xml.push_str("  </cputune>\n");

        xml.push_str(&format!(
            r#"  <resource>
    <partition>/machine</partition>
  </resource>
  <os>
    <type arch='x86_64' machine='{}'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
    <apic/>
    <vmport state='off'/>
  </features>
  <cpu mode='host-model'>
    <model fallback='allow'/>
  </cpu>
  <clock offset='utc'>
    <timer name='rtc' tickpolicy='catchup'/>
    <timer name='pit' tickpolicy='delay'/>
    <timer name='hpet' present='no'/>
  </clock>
  <on_poweroff>destroy</on_poweroff>
  <on_reboot>restart</on_reboot>
  <on_crash>destroy</on_crash>
  <pm>
    <suspend-to-mem enabled='no'/>
    <suspend-to-disk enabled='no'/>
  </pm>
"#,
            image.machine
        ));

        xml.push_str("  <devices>\n");
        xml.push_str(&format!("    <emulator>{}</emulator>\n", image.emulator));
        xml.push_str(&format!(
            r#"    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='{}'/>
      <target dev='hda' bus='ide'/>
      <address type='drive' controller='0' bus='0' target='0' unit='0'/>
    </disk>
"#,
            instance.staged.display()
        ));
        xml.push_str(CONTROLLERS);
        xml.push_str(&self.nics(instance, macs));
        xml.push_str(
            r#"    <serial type='pty'>
      <target port='0'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
    <channel type='spicevmc'>
      <target type='virtio' name='com.redhat.spice.0'/>
      <address type='virtio-serial' controller='0' bus='0' port='1'/>
    </channel>
    <memballoon model='virtio'>
      <address type='pci' domain='0x0000' bus='0x00' slot='0x0c' function='0x0'/>
    </memballoon>
"#,
        );
        xml.push_str("  </devices>\n");
        xml.push_str("</domain>\n");
        xml
    }

    fn nics(&self, instance: &Instance<'_>, macs: &mut MacCounter) -> String {
        let id = instance.id();
        let mut xml = String::new();

        for _ in 0..CISCO_MGMT_NICS {
            xml.push_str(&format!(
                r#"    <interface type='bridge'>
      <mac address='52:54:00:90:{}:{}'/>
      <source bridge='{}'/>
      <model type='e1000'/>
    </interface>
"#,
                id,
                macs.next_suffix(),
                instance.mgmt_bridge
            ));
        }

        for interface in instance.spec.interfaces() {
            let kind = match interface.kind {
                InterfaceKind::Bridge => "bridge",
                InterfaceKind::Network => "network",
            };
            xml.push_str(&format!(
                r#"    <interface type='{kind}'>
      <mac address='52:54:00:03:{}:{}'/>
      <source {kind}='{}'/>
      <model type='e1000'/>
    </interface>
"#,
                id,
                macs.next_suffix(),
                interface.name,
                kind = kind
            ));
        }
        xml
    }

    // ========================================================================
    // Juniper manifests
    // ========================================================================

    fn vmx_conf(&self, instance: &Instance<'_>, macs: &mut MacCounter) -> Result<String> {
        let image = &self.catalog.juniper;
        let id = instance.id();
        let name = instance.spec.name();
        let identifier = &name[name.len().saturating_sub(6)..];
        let images = instance.staged.join("images");
        let (vcp_port, vfp_port) = console_ports(instance.cpus)?;

        let mut conf = format!(
            r#"##############################################################
#
#  vmx.conf
#  Config file for vmx on the hypervisor.
#  Uses YAML syntax.
#  Leave a space after ":" to specify the parameter value.
#
##############################################################

---
#Configuration on the host side - management interface, VM images etc.
HOST:
    identifier                : {identifier}   # Maximum 6 characters
    host-management-interface : {bridge}
    routing-engine-image      : "{re}"
    routing-engine-hdd        : "{hdd}"
    forwarding-engine-image   : "{fpc}"

---
#External bridge configuration
BRIDGES:
    - type  : external
      name  : {bridge}                  # Max 10 characters

---
#vRE VM parameters
CONTROL_PLANE:
    vcpus       : 1
    memory-mb   : {vcp_mem}
    console_port: {vcp_port}

    interfaces  :
      - type      : static
        ipaddr    : 10.102.144.94
        macaddr   : "0A:00:DD:C0:DF:{id}"

---
#vPFE VM parameters
FORWARDING_PLANE:
    memory-mb   : {vfp_mem}
    vcpus       : 3
    console_port: {vfp_port}
    device-type : virtio

    interfaces  :
      - type      : static
        ipaddr    : 10.102.144.98
        macaddr   : "0A:00:DD:C0:DE:{id}"

---
#Interfaces
JUNOS_DEVICES:
"#,
            identifier = identifier,
            bridge = instance.mgmt_bridge,
            re = images.join(&image.re_image_name).display(),
            hdd = images.join(&image.hdd_image_name).display(),
            fpc = images.join(&image.fpc_image_name).display(),
            vcp_mem = image.vcp_memory_mb,
            vcp_port = vcp_port,
            vfp_mem = image.vfp_memory_mb,
            vfp_port = vfp_port,
            id = id.to_uppercase(),
        );

        for (i, _) in instance.spec.interfaces().iter().enumerate() {
            conf.push_str(&format!(
                r#"   - interface            : ge-0/0/{i}
     mac-address          : "02:06:0A:0E:{id}:{mac}"
     description          : "ge-0/0/{i} interface"
"#,
                i = i,
                id = id.to_uppercase(),
                mac = macs.next_suffix().to_uppercase(),
            ));
        }
        Ok(conf)
    }
}

fn junosdev_conf(instance: &Instance<'_>) -> String {
    let mut conf = String::from("interfaces :\n");
    for (i, interface) in instance.spec.interfaces().iter().enumerate() {
        conf.push_str(&format!(
            r#"
     - link_name  : vmx_link{i}
       mtu        : 9000
       endpoint_1 :
         - type        : junos_dev
           vm_name     : {vm}
           dev_name    : ge-0/0/{i}
       endpoint_2 :
         - type        : bridge_dev
           dev_name    : {bridge}
"#,
            i = i,
            vm = instance.spec.name(),
            bridge = interface.name,
        ));
    }
    conf
}

const CONTROLLERS: &str = r#"    <controller type='usb' index='0' model='ich9-ehci1'>
      <address type='pci' domain='0x0000' bus='0x00' slot='0x0b' function='0x7'/>
    </controller>
    <controller type='usb' index='0' model='ich9-uhci1'>
      <master startport='0'/>
      <address type='pci' domain='0x0000' bus='0x00' slot='0x0b' function='0x0' multifunction='on'/>
    </controller>
    <controller type='usb' index='0' model='ich9-uhci2'>
      <master startport='2'/>
      <address type='pci' domain='0x0000' bus='0x00' slot='0x0b' function='0x1'/>
    </controller>
    <controller type='usb' index='0' model='ich9-uhci3'>
      <master startport='4'/>
      <address type='pci' domain='0x0000' bus='0x00' slot='0x0b' function='0x2'/>
    </controller>
    <controller type='pci' index='0' model='pci-root'/>
    <controller type='ide' index='0'>
      <address type='pci' domain='0x0000' bus='0x00' slot='0x01' function='0x1'/>
    </controller>
    <controller type='virtio-serial' index='0'>
      <address type='pci' domain='0x0000' bus='0x00' slot='0x0a' function='0x0'/>
    </controller>
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::CpuPool;
    use crate::vm::TrafficInterface;
    use std::collections::HashSet;

    fn cisco_spec(interfaces: Vec<TrafficInterface>) -> VmSpec {
        VmSpec::new("r1", DeviceFamily::Cisco, "br0")
            .unwrap()
            .with_interfaces(interfaces)
    }

    #[test]
    fn test_cisco_xml_pins_cpus_and_declares_nics() {
        let catalog = ImageCatalog::default();
        let spec = cisco_spec(vec![
            TrafficInterface::bridge("br5"),
            TrafficInterface::network("lab_net"),
        ]);
        let cpus = CpuAllocation::new(vec![6, 7]);
        let staged = PathBuf::from("/var/lib/libvirt/images/r1.qcow2");
        let instance = Instance {
            spec: &spec,
            cpus: &cpus,
            mgmt_bridge: "br0",
            staged: &staged,
        };

        let artifacts = ConfigGenerator::new(&catalog)
            .render(&instance, &mut MacCounter::new())
            .unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].path, PathBuf::from("/var/lib/libvirt/images/r1.xml"));

        let xml = &artifacts[0].contents;
        assert!(xml.contains("<vcpu placement='static' cpuset='6,7'>2</vcpu>"));
        assert_eq!(xml.matches("<vcpupin ").count(), 2);
        assert!(xml.contains("<vcpupin vcpu='1' cpuset='7'/>"));
        assert!(xml.contains("<emulatorpin cpuset='6,7'/>"));
        assert_eq!(xml.matches("<source bridge='br0'/>").count(), CISCO_MGMT_NICS);
        assert!(xml.contains("<mac address='52:54:00:90:06:01'/>"));
        assert!(xml.contains("<mac address='52:54:00:03:06:04'/>"));
        assert!(xml.contains("<source bridge='br5'/>"));
        assert!(xml.contains("<interface type='network'>\n      <mac address='52:54:00:03:06:05'/>\n      <source network='lab_net'/>"));
        assert!(xml.contains("<source file='/var/lib/libvirt/images/r1.qcow2'/>"));
        assert!(xml.contains("<serial type='pty'>"));
    }

    #[test]
    fn test_macs_unique_for_many_interfaces() {
        let catalog = ImageCatalog::default();
        let interfaces = (0..16)
            .map(|i| TrafficInterface::bridge(&format!("br{}", i + 10)))
            .collect();
        let spec = cisco_spec(interfaces);
        let cpus = CpuAllocation::new(vec![3, 4]);
        let staged = PathBuf::from("/images/r1.qcow2");
        let instance = Instance {
            spec: &spec,
            cpus: &cpus,
            mgmt_bridge: "br0",
            staged: &staged,
        };

        let artifacts = ConfigGenerator::new(&catalog)
            .render(&instance, &mut MacCounter::new())
            .unwrap();
        let xml = &artifacts[0].contents;
        let macs: Vec<&str> = xml
            .lines()
            .filter_map(|l| l.trim().strip_prefix("<mac address='"))
            .collect();
        assert_eq!(macs.len(), 16 + CISCO_MGMT_NICS);
        let unique: HashSet<&str> = macs.iter().copied().collect();
        assert_eq!(unique.len(), macs.len());
    }

    #[test]
    fn test_juniper_manifests() {
        let catalog = ImageCatalog::default();
        let spec = VmSpec::new("lab-r2", DeviceFamily::Juniper, "br0")
            .unwrap()
            .with_interfaces(vec![
                TrafficInterface::bridge("br11"),
                TrafficInterface::bridge("br12"),
                TrafficInterface::bridge("br13"),
            ]);
        let cpus = CpuAllocation::new(vec![12, 13, 14, 15]);
        let staged = PathBuf::from("/var/lib/libvirt/images/lab-r2");
        let instance = Instance {
            spec: &spec,
            cpus: &cpus,
            mgmt_bridge: "br0",
            staged: &staged,
        };

        let artifacts = ConfigGenerator::new(&catalog)
            .render(&instance, &mut MacCounter::new())
            .unwrap();
        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0].path, staged.join("config/vmx.conf"));
        assert_eq!(artifacts[1].path, staged.join("config/vmx-junosdev.conf"));

        let vmx = &artifacts[0].contents;
        assert!(vmx.contains("identifier                : lab-r2"));
        assert!(vmx.contains("console_port: 8624"));
        assert!(vmx.contains("console_port: 8625"));
        assert!(vmx.contains(
            "routing-engine-image      : \"/var/lib/libvirt/images/lab-r2/images/junos-vmx-x86-64-20.4R1.12.qcow2\""
        ));
        let first = vmx.find("ge-0/0/0").unwrap();
        let second = vmx.find("ge-0/0/1").unwrap();
        let third = vmx.find("ge-0/0/2").unwrap();
        assert!(first < second && second < third);
        assert!(vmx.contains("mac-address          : \"02:06:0A:0E:0C:03\""));

        let junosdev = &artifacts[1].contents;
        assert_eq!(junosdev.matches("mtu        : 9000").count(), 3);
        let link = junosdev.find("vmx_link2").unwrap();
        assert!(junosdev[link..].contains("dev_name    : ge-0/0/2"));
        assert!(junosdev[link..].contains("dev_name    : br13"));
    }

    #[test]
    fn test_ports_follow_lowest_cpu() {
        assert_eq!(console_ports(&CpuAllocation::new(vec![9, 5, 6, 7])).unwrap(), (8610, 8611));
    }

    #[test]
    fn test_ports_never_collide_on_a_large_host() {
        let mut pool = CpuPool::new((1..256).collect());
        let mut seen = HashSet::new();
        let mut family = DeviceFamily::Juniper;
        while let Ok(cpus) = pool.allocate(family) {
            let (vcp, vfp) = console_ports(&cpus).unwrap();
            assert!(seen.insert(vcp), "port {} reused", vcp);
            assert!(seen.insert(vfp), "port {} reused", vfp);
            family = match family {
                DeviceFamily::Juniper => DeviceFamily::Cisco,
                DeviceFamily::Cisco => DeviceFamily::Juniper,
            };
        }
        assert!(seen.len() > 150);

        for lowest in 0..256 {
            let (vcp, vfp) = console_ports(&CpuAllocation::new(vec![lowest])).unwrap();
            assert_eq!(vfp, vcp + 1);
            assert!(vcp >= CONSOLE_PORT_BASE);
        }
    }

    #[test]
    fn test_port_overflow_is_an_error() {
        let err = console_ports(&CpuAllocation::new(vec![40_000])).unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidSpec(_)));
    }

    #[test]
    fn test_artifact_write_creates_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = Artifact {
            path: dir.path().join("r2/config/vmx.conf"),
            contents: "HOST:\n".to_string(),
        };
        artifact.write().unwrap();
        assert_eq!(fs::read_to_string(&artifact.path).unwrap(), "HOST:\n");
    }
}
