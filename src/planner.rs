//! Host resource planning: CPUs, disk, RAM, bridges and virsh networks.
//!
//! Planning queries the host once up front and hands out an exhaustible
//! [`CpuPool`]. Bridge resolution is cached for the lifetime of the planner,
//! so asking for the same host interface twice yields the same bridge and
//! bridge numbers handed out in this run are never reused.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::path::PathBuf;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{ProvisionError, Result};
use crate::executor::{HostCommand, HostExecutor, HOST_COMMAND_TIMEOUT};
use crate::hypervisor::Virsh;
use crate::settings::ImageCatalog;
use crate::vm::{DeviceFamily, FamilyCounts, InterfaceKind, TrafficInterface};

/// Bridge created on demand when explicitly requested by name.
pub const TEMP_BRIDGE: &str = "brAutoTmp";

// ============================================================================
// CPU allocation
// ============================================================================

/// Host CPUs reserved for one instance, in allocation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CpuAllocation {
    cpus: Vec<usize>,
}

impl CpuAllocation {
    pub fn new(cpus: Vec<usize>) -> Self {
        Self { cpus }
    }

    pub fn cpus(&self) -> &[usize] {
        &self.cpus
    }

    /// Lowest CPU index, the seed for MAC addresses and console ports.
    pub fn lowest(&self) -> usize {
        self.cpus.iter().copied().min().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }
}

/// Free CPUs set aside for a run. CPUs leave the pool and never return.
#[derive(Debug)]
pub struct CpuPool {
    free: VecDeque<usize>,
}

impl CpuPool {
    pub fn new(cpus: Vec<usize>) -> Self {
        Self { free: cpus.into() }
    }

    pub fn remaining(&self) -> usize {
        self.free.len()
    }

    /// Take the CPUs one `family` instance needs from the front of the pool.
    pub fn allocate(&mut self, family: DeviceFamily) -> Result<CpuAllocation> {
        let needed = family.cpus();
        if self.free.len() < needed {
            return Err(ProvisionError::InsufficientResources(format!(
                "a {} instance needs {} CPUs, only {} left in the pool",
                family,
                needed,
                self.free.len()
            )));
        }
        let cpus: Vec<usize> = self.free.drain(..needed).collect();
        debug!(%family, ?cpus, "allocated CPUs");
        Ok(CpuAllocation::new(cpus))
    }
}

/// What a run will consume on the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Requirements {
    pub cpus: usize,
    pub ram_gb: f64,
    /// Disk needed per images directory, in GB.
    pub disk_gb: BTreeMap<PathBuf, f64>,
}

impl Requirements {
    pub fn total_disk_gb(&self) -> f64 {
        self.disk_gb.values().sum()
    }
}

// ============================================================================
// Bridges
// ============================================================================

/// A Linux bridge and the interfaces enslaved to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeInfo {
    pub name: String,
    pub interfaces: Vec<String>,
}

/// Resolved host objects, keyed by what was asked for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct BridgeMap {
    entries: BTreeMap<String, String>,
}

impl BridgeMap {
    pub fn get(&self, request: &str) -> Option<&str> {
        self.entries.get(request).map(String::as_str)
    }

    pub fn insert(&mut self, request: &str, resolved: &str) {
        self.entries.insert(request.to_string(), resolved.to_string());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Parse `brctl show`. Interfaces past the first sit alone on
/// continuation lines.
pub fn parse_brctl_show(output: &str) -> Vec<BridgeInfo> {
    let mut bridges: Vec<BridgeInfo> = Vec::new();
    for line in output.lines().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        if line.starts_with(char::is_whitespace) {
            if let Some(last) = bridges.last_mut() {
                last.interfaces.push(line.trim().to_string());
            }
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        bridges.push(BridgeInfo {
            name: fields[0].to_string(),
            interfaces: fields.get(3).map(|s| vec![s.to_string()]).unwrap_or_default(),
        });
    }
    bridges
}

/// Host CPUs listed on the `CPU:` lines of `virsh vcpuinfo`.
pub fn parse_vcpuinfo(output: &str) -> Vec<usize> {
    output
        .lines()
        .filter_map(|line| line.strip_prefix("CPU:"))
        .filter_map(|cpu| cpu.trim().parse().ok())
        .collect()
}

fn bridge_number(name: &str) -> Option<u32> {
    let re = Regex::new(r"^br(\d+)$").ok()?;
    re.captures(name)?.get(1)?.as_str().parse().ok()
}

// ============================================================================
// Planner
// ============================================================================

pub struct ResourcePlanner<'a> {
    exec: &'a dyn HostExecutor,
    virsh: Virsh<'a>,
    catalog: &'a ImageCatalog,
    resolved: BridgeMap,
    /// Bridges handed out by this planner.
    claimed: HashSet<String>,
    next_bridge: Option<u32>,
}

impl<'a> ResourcePlanner<'a> {
    pub fn new(exec: &'a dyn HostExecutor, catalog: &'a ImageCatalog) -> Self {
        Self {
            exec,
            virsh: Virsh::new(exec),
            catalog,
            resolved: BridgeMap::default(),
            claimed: HashSet::new(),
            next_bridge: None,
        }
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        self.exec.exec_ok(
            &HostCommand::new(program).args(args.iter().copied()),
            HOST_COMMAND_TIMEOUT,
        )
    }

    /// CPUs not pinned by any running domain. CPU 0 stays with the host.
    pub fn free_cpus(&self) -> Result<Vec<usize>> {
        let mut busy = BTreeSet::new();
        for domain in self.virsh.list_running()? {
            busy.extend(self.virsh.vcpu_info(&domain)?);
        }

        let total: usize = self
            .run("nproc", &["--all"])?
            .trim()
            .parse()
            .map_err(|_| ProvisionError::InsufficientResources("cannot read host CPU count".into()))?;

        let free: Vec<usize> = (1..total).filter(|cpu| !busy.contains(cpu)).collect();
        debug!(total, ?busy, free = free.len(), "host CPU survey");
        Ok(free)
    }

    /// Reserve the CPUs for `counts`, failing before any side effect if
    /// the host cannot fit them.
    pub fn plan(&self, counts: FamilyCounts) -> Result<CpuPool> {
        let required = counts.required_cpus();
        let free = self.free_cpus()?;
        if free.len() < required {
            return Err(ProvisionError::InsufficientResources(format!(
                "not enough available CPUs: need {}, {} free",
                required,
                free.len()
            )));
        }
        info!(required, "CPUs planned");
        Ok(CpuPool::new(free[..required].to_vec()))
    }

    pub fn requirements(&self, counts: FamilyCounts) -> Requirements {
        let mut disk_gb = BTreeMap::new();
        let mut ram_gb = 0.0;
        for (family, count) in [
            (DeviceFamily::Cisco, counts.cisco),
            (DeviceFamily::Juniper, counts.juniper),
        ] {
            if count == 0 {
                continue;
            }
            let dir = self.catalog.descriptor(family).local_dir.clone();
            *disk_gb.entry(dir).or_insert(0.0) += count as f64 * self.catalog.disk_gb(family);
            ram_gb += count as f64 * self.catalog.memory_gb(family);
        }
        Requirements {
            cpus: counts.required_cpus(),
            ram_gb,
            disk_gb,
        }
    }

    /// Fail if any images directory lacks the space `req` needs there.
    pub fn check_disk(&self, req: &Requirements) -> Result<()> {
        for (dir, needed_gb) in &req.disk_gb {
            let dir_arg = dir.to_string_lossy();
            let output = self.run("df", &["-k", "--output=avail", &dir_arg])?;
            let avail_kib: u64 = output
                .lines()
                .last()
                .and_then(|l| l.trim().parse().ok())
                .ok_or_else(|| {
                    ProvisionError::InsufficientResources(format!(
                        "cannot read free space of {}",
                        dir.display()
                    ))
                })?;
            let avail_gb = avail_kib as f64 / (1024.0 * 1024.0);
            debug!(dir = %dir.display(), avail_gb, needed_gb, "disk check");
            if avail_gb < *needed_gb {
                return Err(ProvisionError::InsufficientResources(format!(
                    "{} has {:.1}G free, {:.1}G needed",
                    dir.display(),
                    avail_gb,
                    needed_gb
                )));
            }
        }
        Ok(())
    }

    pub fn bridges(&self) -> Result<Vec<BridgeInfo>> {
        Ok(parse_brctl_show(&self.run("brctl", &["show"])?))
    }

    /// Map each host interface or bridge name to the bridge that carries it,
    /// creating bridges where needed.
    pub fn resolve_bridges(&mut self, host_interfaces: &[&str]) -> Result<BridgeMap> {
        let mut bridges = self.bridges()?;

        if host_interfaces.contains(&TEMP_BRIDGE) && !bridges.iter().any(|b| b.name == TEMP_BRIDGE) {
            info!(bridge = TEMP_BRIDGE, "creating temporary bridge");
            self.run("brctl", &["addbr", TEMP_BRIDGE])?;
            bridges.push(BridgeInfo {
                name: TEMP_BRIDGE.to_string(),
                interfaces: Vec::new(),
            });
        }

        let mut map = BridgeMap::default();
        for &interface in host_interfaces {
            if let Some(bridge) = self.resolved.get(interface) {
                map.insert(interface, bridge);
                continue;
            }

            let bridge = if bridges.iter().any(|b| b.name == interface) {
                interface.to_string()
            } else if let Some(b) = bridges.iter().find(|b| b.interfaces.iter().any(|i| i == interface)) {
                b.name.clone()
            } else {
                let bridge = self.fresh_bridge(&mut bridges)?;
                info!(interface, %bridge, "attaching host interface to bridge");
                self.run("brctl", &["addif", &bridge, interface])?;
                if let Some(b) = bridges.iter_mut().find(|b| b.name == bridge) {
                    b.interfaces.push(interface.to_string());
                }
                bridge
            };

            self.resolved.insert(interface, &bridge);
            map.insert(interface, &bridge);
        }
        Ok(map)
    }

    /// An empty numbered bridge, or a new one after the highest number seen.
    fn fresh_bridge(&mut self, bridges: &mut Vec<BridgeInfo>) -> Result<String> {
        let empty = bridges
            .iter()
            .find(|b| {
                bridge_number(&b.name).is_some() && b.interfaces.is_empty() && !self.claimed.contains(&b.name)
            })
            .map(|b| b.name.clone());

        let bridge = match empty {
            Some(name) => name,
            None => {
                let highest = bridges.iter().filter_map(|b| bridge_number(&b.name)).max();
                let next = match (highest, self.next_bridge) {
                    (Some(h), Some(n)) => (h + 1).max(n),
                    (Some(h), None) => h + 1,
                    (None, Some(n)) => n,
                    (None, None) => 1,
                };
                self.next_bridge = Some(next + 1);
                let name = format!("br{}", next);
                info!(bridge = %name, "creating bridge");
                self.run("brctl", &["addbr", &name])?;
                bridges.push(BridgeInfo {
                    name: name.clone(),
                    interfaces: Vec::new(),
                });
                name
            }
        };

        self.run("ip", &["link", "set", &bridge, "up"])?;
        self.claimed.insert(bridge.clone());
        Ok(bridge)
    }

    /// Make sure every traffic interface's bridge or virsh network exists.
    pub fn resolve_traffic(&mut self, interfaces: &[TrafficInterface]) -> Result<BridgeMap> {
        let mut map = BridgeMap::default();
        if interfaces.is_empty() {
            return Ok(map);
        }

        let existing_bridges: HashSet<String> =
            self.bridges()?.into_iter().map(|b| b.name).collect();
        let existing_networks: HashSet<String> = if interfaces.iter().any(|i| i.kind == InterfaceKind::Network) {
            self.virsh.list_networks()?.into_iter().collect()
        } else {
            HashSet::new()
        };

        let mut created = HashSet::new();
        for interface in interfaces {
            let name = interface.name.as_str();
            match interface.kind {
                InterfaceKind::Bridge if !existing_bridges.contains(name) && created.insert(name) => {
                    info!(bridge = name, "creating bridge");
                    self.run("brctl", &["addbr", name])?;
                    self.run("ip", &["link", "set", name, "up"])?;
                }
                InterfaceKind::Network if !existing_networks.contains(name) && created.insert(name) => {
                    self.virsh.create_network(name)?;
                }
                _ => {}
            }
            map.insert(&interface.to_string(), name);
        }
        Ok(map)
    }
}
