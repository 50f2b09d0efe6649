//! VM description types.
//!
//! A [`VmSpec`] is built once from validated input and only borrowed after
//! that.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ProvisionError, Result};

/// Longest name the vMX installer accepts as a host identifier.
pub const JUNIPER_MAX_NAME: usize = 6;

/// The two emulated router families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceFamily {
    /// IOS-XRv: a single qcow2 disk defined directly through virsh.
    Cisco,
    /// vMX: a tarball bundle installed by `vmx.sh` as a control-plane and a
    /// forwarding-plane domain.
    Juniper,
}

impl DeviceFamily {
    /// Host CPUs consumed by one instance.
    pub fn cpus(self) -> usize {
        match self {
            Self::Cisco => 2,
            Self::Juniper => 4,
        }
    }

    pub fn id(self) -> &'static str {
        match self {
            Self::Cisco => "cisco",
            Self::Juniper => "juniper",
        }
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for DeviceFamily {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cisco" => Ok(Self::Cisco),
            "juniper" => Ok(Self::Juniper),
            other => Err(ProvisionError::InvalidSpec(format!(
                "unknown router type '{}' (expected cisco or juniper)",
                other
            ))),
        }
    }
}

/// How a traffic interface reaches the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    /// A Linux bridge (`br:<name>`).
    Bridge,
    /// A libvirt virtual network (`net:<name>`).
    Network,
}

/// One requested traffic interface, in the order it was given.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrafficInterface {
    pub kind: InterfaceKind,
    pub name: String,
}

impl TrafficInterface {
    pub fn bridge(name: &str) -> Self {
        Self {
            kind: InterfaceKind::Bridge,
            name: name.to_string(),
        }
    }

    pub fn network(name: &str) -> Self {
        Self {
            kind: InterfaceKind::Network,
            name: name.to_string(),
        }
    }
}

impl FromStr for TrafficInterface {
    type Err = ProvisionError;

    /// Parse `br:<name>` or `net:<name>`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            ProvisionError::InvalidSpec(format!(
                "interface '{}' should follow the format 'type:value', e.g. 'br:br5' or 'net:someNetwork'",
                s
            ))
        };
        let (kind, name) = s.split_once(':').ok_or_else(invalid)?;
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(invalid());
        }
        match kind {
            "br" => Ok(Self::bridge(name)),
            "net" => Ok(Self::network(name)),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for TrafficInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            InterfaceKind::Bridge => write!(f, "br:{}", self.name),
            InterfaceKind::Network => write!(f, "net:{}", self.name),
        }
    }
}

/// Management IPv4 address with prefix length, e.g. `10.0.0.5/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagementAddress {
    pub ip: Ipv4Addr,
    pub prefix: u8,
}

impl ManagementAddress {
    /// Dotted netmask for the prefix.
    pub fn netmask(&self) -> Ipv4Addr {
        let bits = if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix))
        };
        Ipv4Addr::from(bits)
    }
}

impl FromStr for ManagementAddress {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            ProvisionError::InvalidSpec(format!(
                "mgmt ip '{}' should be in format <ip/pfx>, e.g. 10.0.0.1/20",
                s
            ))
        };
        let (ip, prefix) = s.split_once('/').ok_or_else(invalid)?;
        let ip: Ipv4Addr = ip.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        if prefix > 32 {
            return Err(invalid());
        }
        Ok(Self { ip, prefix })
    }
}

impl fmt::Display for ManagementAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.prefix)
    }
}

/// Immutable description of a requested VM instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmSpec {
    name: String,
    family: DeviceFamily,
    mgmt_bridge: String,
    interfaces: Vec<TrafficInterface>,
    mgmt_ip: Option<ManagementAddress>,
    mgmt_gw: Option<Ipv4Addr>,
    cli_config: Option<String>,
}

impl VmSpec {
    /// Validate the name for the family and start a spec with no interfaces
    /// and no management addressing.
    pub fn new(name: &str, family: DeviceFamily, mgmt_bridge: &str) -> Result<Self> {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ProvisionError::InvalidSpec(format!(
                "VM name '{}' may only contain letters, digits, '-' and '_'",
                name
            )));
        }
        if family == DeviceFamily::Juniper && name.len() > JUNIPER_MAX_NAME {
            return Err(ProvisionError::InvalidSpec(format!(
                "juniper VM name cannot exceed {} characters",
                JUNIPER_MAX_NAME
            )));
        }
        if mgmt_bridge.is_empty() {
            return Err(ProvisionError::InvalidSpec(
                "management bridge must not be empty".to_string(),
            ));
        }
        Ok(Self {
            name: name.to_string(),
            family,
            mgmt_bridge: mgmt_bridge.to_string(),
            interfaces: Vec::new(),
            mgmt_ip: None,
            mgmt_gw: None,
            cli_config: None,
        })
    }

    pub fn with_interfaces(mut self, interfaces: Vec<TrafficInterface>) -> Self {
        self.interfaces = interfaces;
        self
    }

    pub fn with_management(mut self, ip: Option<ManagementAddress>, gw: Option<Ipv4Addr>) -> Self {
        self.mgmt_ip = ip;
        self.mgmt_gw = gw;
        self
    }

    /// Literal CLI block pasted after the base configuration.
    pub fn with_cli_config(mut self, config: Option<String>) -> Self {
        self.cli_config = config.filter(|c| !c.trim().is_empty());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn family(&self) -> DeviceFamily {
        self.family
    }

    pub fn mgmt_bridge(&self) -> &str {
        &self.mgmt_bridge
    }

    pub fn interfaces(&self) -> &[TrafficInterface] {
        &self.interfaces
    }

    pub fn mgmt_ip(&self) -> Option<ManagementAddress> {
        self.mgmt_ip
    }

    pub fn mgmt_gw(&self) -> Option<Ipv4Addr> {
        self.mgmt_gw
    }

    pub fn cli_config(&self) -> Option<&str> {
        self.cli_config.as_deref()
    }
}

/// Number of instances of each family requested in one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FamilyCounts {
    pub cisco: usize,
    pub juniper: usize,
}

impl FamilyCounts {
    /// Counts for a single VM of `family`.
    pub fn single(family: DeviceFamily) -> Self {
        match family {
            DeviceFamily::Cisco => Self { cisco: 1, juniper: 0 },
            DeviceFamily::Juniper => Self { cisco: 0, juniper: 1 },
        }
    }

    pub fn required_cpus(&self) -> usize {
        self.cisco * DeviceFamily::Cisco.cpus() + self.juniper * DeviceFamily::Juniper.cpus()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_parsing() {
        assert_eq!(
            "br:br5".parse::<TrafficInterface>().unwrap(),
            TrafficInterface::bridge("br5")
        );
        assert_eq!(
            "net:someNetwork".parse::<TrafficInterface>().unwrap(),
            TrafficInterface::network("someNetwork")
        );
        assert!("eth0".parse::<TrafficInterface>().is_err());
        assert!("vlan:10".parse::<TrafficInterface>().is_err());
        assert!("br:".parse::<TrafficInterface>().is_err());
    }

    #[test]
    fn test_management_address_netmask() {
        let addr: ManagementAddress = "10.0.0.5/24".parse().unwrap();
        assert_eq!(addr.netmask(), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(addr.to_string(), "10.0.0.5/24");

        let addr: ManagementAddress = "10.0.0.1/20".parse().unwrap();
        assert_eq!(addr.netmask(), Ipv4Addr::new(255, 255, 240, 0));

        assert!("10.0.0.1".parse::<ManagementAddress>().is_err());
        assert!("10.0.0.1/33".parse::<ManagementAddress>().is_err());
    }

    #[test]
    fn test_juniper_name_length_limit() {
        assert!(VmSpec::new("router", DeviceFamily::Juniper, "br0").is_ok());
        assert!(VmSpec::new("router1", DeviceFamily::Juniper, "br0").is_err());
        assert!(VmSpec::new("router1", DeviceFamily::Cisco, "br0").is_ok());
        assert!(VmSpec::new("bad name", DeviceFamily::Cisco, "br0").is_err());
    }

    #[test]
    fn test_required_cpus() {
        assert_eq!(FamilyCounts::single(DeviceFamily::Cisco).required_cpus(), 2);
        assert_eq!(FamilyCounts::single(DeviceFamily::Juniper).required_cpus(), 4);
        assert_eq!(FamilyCounts { cisco: 2, juniper: 3 }.required_cpus(), 16);
    }
}
