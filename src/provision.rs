//! End-to-end provisioning of one router VM.
//!
//! Runs the components in order (plan, stage, render, install, boot,
//! configure) and prints one line per step the way an operator expects:
//!
//! ```text
//! ▶ Step  1: plan resources... PASS (0.1s)
//! ▶ Step  2: resolve bridges... PASS (0.0s)
//! ```

use std::io::Write as _;
use std::path::PathBuf;
use std::thread;
use std::time::Instant;

use colored::Colorize;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::boot::{BootSequencer, BootState, CiscoConsole, JuniperConsole};
use crate::console::ConsoleOpener;
use crate::error::{ProvisionError, Result};
use crate::executor::HostExecutor;
use crate::hypervisor::{vcp_name, HypervisorDriver, Virsh};
use crate::image::ImageStager;
use crate::planner::{CpuAllocation, ResourcePlanner};
use crate::render::{Artifact, ConfigGenerator, Instance, MacCounter};
use crate::settings::Settings;
use crate::vm::{DeviceFamily, FamilyCounts, VmSpec};

/// A provisioning run that stopped at `step`.
#[derive(Debug, Error)]
#[error("{instance}: {step}: {source}")]
pub struct StepError {
    pub instance: String,
    pub step: &'static str,
    /// How far the instance got.
    pub state: BootState,
    #[source]
    pub source: ProvisionError,
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionReport {
    pub name: String,
    pub family: DeviceFamily,
    pub cpus: CpuAllocation,
    pub mgmt_bridge: String,
    /// Cisco: the instance disk. Juniper: the bundle directory.
    pub staged: PathBuf,
    pub artifacts: Vec<Artifact>,
    pub state: BootState,
    pub elapsed_secs: f64,
}

/// What a run would need, without doing anything.
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub name: String,
    pub family: DeviceFamily,
    pub cpus: CpuAllocation,
    pub disk_gb: f64,
    pub ram_gb: f64,
}

// ============================================================================
// Step output
// ============================================================================

struct Progress {
    enabled: bool,
    count: usize,
    current: &'static str,
}

impl Progress {
    fn new(enabled: bool) -> Self {
        Self {
            enabled,
            count: 0,
            current: "start",
        }
    }

    fn step<T>(&mut self, name: &'static str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.count += 1;
        self.current = name;
        info!(step = name, "starting step");
        if self.enabled {
            print!("{} Step {:2}: {}... ", "▶".cyan(), self.count, name);
            let _ = std::io::stdout().flush();
        }

        let started = Instant::now();
        let result = f();
        if self.enabled {
            let word = if result.is_ok() {
                "PASS".green().bold()
            } else {
                "FAIL".red().bold()
            };
            println!("{} ({:.1}s)", word, started.elapsed().as_secs_f64());
        }
        result
    }
}

// ============================================================================
// Provisioner
// ============================================================================

pub struct Provisioner<'a> {
    exec: &'a dyn HostExecutor,
    opener: &'a dyn ConsoleOpener,
    settings: &'a Settings,
    progress: bool,
}

impl<'a> Provisioner<'a> {
    pub fn new(exec: &'a dyn HostExecutor, opener: &'a dyn ConsoleOpener, settings: &'a Settings) -> Self {
        Self {
            exec,
            opener,
            settings,
            progress: true,
        }
    }

    /// Do not print step lines.
    pub fn quiet(mut self) -> Self {
        self.progress = false;
        self
    }

    /// Plan CPUs and check disk space for `spec` without side effects.
    pub fn check(&self, spec: &VmSpec) -> Result<CheckReport> {
        let planner = ResourcePlanner::new(self.exec, &self.settings.catalog);
        let counts = FamilyCounts::single(spec.family());
        let req = planner.requirements(counts);
        let cpus = planner.plan(counts)?.allocate(spec.family())?;
        planner.check_disk(&req)?;
        Ok(CheckReport {
            name: spec.name().to_string(),
            family: spec.family(),
            cpus,
            disk_gb: req.total_disk_gb(),
            ram_gb: req.ram_gb,
        })
    }

    /// Create, boot and configure the VM described by `spec`.
    ///
    /// Nothing is rolled back on failure; the error says which step failed
    /// and how far the instance got.
    pub fn provision(&self, spec: &VmSpec) -> std::result::Result<ProvisionReport, StepError> {
        let started = Instant::now();
        let mut progress = Progress::new(self.progress);
        let mut seq = BootSequencer::new(self.opener, &self.settings.timings);

        match self.run(spec, &mut progress, &mut seq) {
            Ok(mut report) => {
                report.elapsed_secs = started.elapsed().as_secs_f64();
                info!(instance = spec.name(), elapsed = report.elapsed_secs, "provisioned");
                Ok(report)
            }
            Err(source) => Err(StepError {
                instance: spec.name().to_string(),
                step: progress.current,
                state: seq.state(),
                source,
            }),
        }
    }

    /// A domain already named after the instance owns the disk and
    /// directory this run would stage into.
    fn ensure_unused(&self, spec: &VmSpec) -> Result<()> {
        let name = spec.name();
        let taken = [name.to_string(), vcp_name(name)];
        let existing = Virsh::new(self.exec).list_all()?;
        if existing.iter().any(|d| taken.contains(d)) {
            return Err(ProvisionError::InvalidSpec(format!("a VM named '{}' already exists", name)));
        }
        Ok(())
    }

    fn run(&self, spec: &VmSpec, progress: &mut Progress, seq: &mut BootSequencer<'_>) -> Result<ProvisionReport> {
        let settings = self.settings;
        let timings = &settings.timings;
        let family = spec.family();
        let counts = FamilyCounts::single(family);
        let mut planner = ResourcePlanner::new(self.exec, &settings.catalog);

        let cpus = progress.step("plan resources", || {
            self.ensure_unused(spec)?;
            let req = planner.requirements(counts);
            info!(
                cpus = req.cpus,
                ram_gb = req.ram_gb,
                disk_gb = req.total_disk_gb(),
                "requirements"
            );
            let cpus = planner.plan(counts)?.allocate(family)?;
            planner.check_disk(&req)?;
            Ok(cpus)
        })?;

        let mgmt_bridge = progress.step("resolve bridges", || {
            let bridges = planner.resolve_bridges(&[spec.mgmt_bridge()])?;
            planner.resolve_traffic(spec.interfaces())?;
            bridges
                .get(spec.mgmt_bridge())
                .map(str::to_string)
                .ok_or_else(|| {
                    ProvisionError::InvalidSpec(format!("cannot resolve management bridge '{}'", spec.mgmt_bridge()))
                })
        })?;

        let image = settings.catalog.descriptor(family);
        let stager = ImageStager::new(self.exec, self.opener, timings);
        let staged = progress.step("stage image", || {
            stager.ensure_local_image(image)?;
            stager.clone(family, image, spec.name())
        })?;

        let artifacts = progress.step("render configuration", || {
            let instance = Instance {
                spec,
                cpus: &cpus,
                mgmt_bridge: &mgmt_bridge,
                staged: &staged,
            };
            let artifacts = ConfigGenerator::new(&settings.catalog).render(&instance, &mut MacCounter::new())?;
            for artifact in &artifacts {
                artifact.write()?;
            }
            Ok(artifacts)
        })?;

        let hypervisor = HypervisorDriver::new(self.exec, timings);
        seq.set_state(BootState::Installing);
        progress.step("install", || hypervisor.install(spec, &staged))?;

        match family {
            DeviceFamily::Cisco => {
                let device = CiscoConsole::new(spec, &settings.credentials, timings);
                let mut session = progress.step("wait for boot", || seq.wait_for_boot(&device))?;
                progress.step("base configuration", || {
                    seq.set_base_config(&device, &mut session)?;
                    seq.finish_config(&device, &mut session)
                })?;
            }
            DeviceFamily::Juniper => {
                let device = JuniperConsole::new(spec, &settings.credentials, timings, &staged);
                let mut session = progress.step("wait for boot", || seq.wait_for_boot(&device))?;
                // Configuration pasted right after boot is silently dropped.
                thread::sleep(timings.pre_config_settle);
                progress.step("base configuration", || seq.set_base_config(&device, &mut session))?;

                let keys = &settings.catalog.juniper.license;
                if !keys.is_empty() {
                    progress.step("license", || seq.install_license(spec.name(), keys, &mut session))?;
                }
                if !spec.interfaces().is_empty() {
                    progress.step("bind interfaces", || hypervisor.vmx().bind_devices(&staged))?;
                }
                progress.step("pin CPUs", || hypervisor.pin_pair(spec.name(), &cpus))?;
            }
        }
        seq.set_state(BootState::Bound);

        Ok(ProvisionReport {
            name: spec.name().to_string(),
            family,
            cpus,
            mgmt_bridge,
            staged,
            artifacts,
            state: seq.state(),
            elapsed_secs: 0.0,
        })
    }
}
