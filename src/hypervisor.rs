//! Hypervisor lifecycle: virsh and the vMX installer script.
//!
//! [`Virsh`] wraps the libvirt CLI, [`VmxInstaller`] wraps the `vmx.sh`
//! script shipped inside every vMX bundle, and [`HypervisorDriver`] puts one
//! lifecycle in front of both families.

use std::fs;
use std::path::Path;
use std::thread;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ProvisionError, Result};
use crate::executor::{HostCommand, HostExecutor, HOST_COMMAND_TIMEOUT};
use crate::planner::{parse_vcpuinfo, CpuAllocation};
use crate::settings::Timings;
use crate::vm::{DeviceFamily, VmSpec};

/// Installer attempts before giving up on a Juniper instance.
pub const INSTALL_ATTEMPTS: u32 = 3;

/// Control-plane domain of a Juniper instance.
pub fn vcp_name(instance: &str) -> String {
    format!("vcp-{}", instance)
}

/// Forwarding-plane domain of a Juniper instance.
pub fn vfp_name(instance: &str) -> String {
    format!("vfp-{}", instance)
}

/// What happened to one best-effort command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutcome {
    pub command: String,
    /// `None` when the command succeeded.
    pub error: Option<String>,
}

impl CommandOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

fn best_effort(exec: &dyn HostExecutor, cmd: HostCommand) -> CommandOutcome {
    let command = cmd.to_string();
    let error = match exec.exec(&cmd, HOST_COMMAND_TIMEOUT) {
        Ok(result) if result.success() => None,
        Ok(result) if !result.completed => Some(format!("command '{}' timed out", command)),
        Ok(result) => Some(format!(
            "failed to execute command '{}' (exit {})",
            command, result.exit_code
        )),
        Err(e) => Some(e.to_string()),
    };
    if let Some(e) = &error {
        warn!(%command, error = %e, "best-effort command failed");
    }
    CommandOutcome { command, error }
}

/// Remove a file or directory tree on the host.
pub fn remove_path(exec: &dyn HostExecutor, path: &Path) -> CommandOutcome {
    best_effort(
        exec,
        HostCommand::new("rm").arg("-rf").arg(path.to_string_lossy()),
    )
}

// ============================================================================
// virsh
// ============================================================================

#[derive(Clone, Copy)]
pub struct Virsh<'a> {
    exec: &'a dyn HostExecutor,
}

impl<'a> Virsh<'a> {
    pub fn new(exec: &'a dyn HostExecutor) -> Self {
        Self { exec }
    }

    fn run<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exec
            .exec_ok(&HostCommand::new("virsh").args(args), HOST_COMMAND_TIMEOUT)
    }

    fn names(output: &str) -> Vec<String> {
        output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect()
    }

    pub fn define(&self, xml_path: &Path) -> Result<()> {
        info!(path = %xml_path.display(), "defining domain");
        self.run(["define".to_string(), xml_path.to_string_lossy().into_owned()])?;
        Ok(())
    }

    pub fn start(&self, name: &str) -> Result<()> {
        info!(domain = name, "starting domain");
        self.run(["start", name])?;
        Ok(())
    }

    pub fn autostart(&self, name: &str) -> Result<()> {
        debug!(domain = name, "enabling autostart");
        self.run(["autostart", name])?;
        Ok(())
    }

    pub fn pin_cpu(&self, name: &str, vcpu: usize, host_cpu: usize) -> Result<()> {
        debug!(domain = name, vcpu, host_cpu, "pinning vCPU");
        self.run([
            "vcpupin".to_string(),
            name.to_string(),
            "--vcpu".to_string(),
            vcpu.to_string(),
            host_cpu.to_string(),
            "--config".to_string(),
            "--live".to_string(),
        ])?;
        Ok(())
    }

    pub fn destroy(&self, name: &str) -> CommandOutcome {
        best_effort(self.exec, HostCommand::new("virsh").args(["destroy", name]))
    }

    pub fn undefine(&self, name: &str, purge_storage: bool) -> CommandOutcome {
        let mut cmd = HostCommand::new("virsh").args(["undefine", name]);
        if purge_storage {
            cmd = cmd.args(["--remove-all-storage", "--nvram"]);
        }
        best_effort(self.exec, cmd)
    }

    /// Every defined domain, running or not.
    pub fn list_all(&self) -> Result<Vec<String>> {
        Ok(Self::names(&self.run(["list", "--all", "--name"])?))
    }

    pub fn list_running(&self) -> Result<Vec<String>> {
        Ok(Self::names(&self.run(["list", "--name"])?))
    }

    /// Host CPUs the domain's vCPUs currently run on.
    pub fn vcpu_info(&self, name: &str) -> Result<Vec<usize>> {
        Ok(parse_vcpuinfo(&self.run(["vcpuinfo", name])?))
    }

    pub fn dump_xml(&self, name: &str) -> Result<String> {
        self.run(["dumpxml", name])
    }

    pub fn list_networks(&self) -> Result<Vec<String>> {
        Ok(Self::names(&self.run(["net-list", "--all", "--name"])?))
    }

    /// Define, start and autostart an isolated network named `name`.
    pub fn create_network(&self, name: &str) -> Result<()> {
        info!(network = name, "creating virsh network");
        let xml = format!("<network>\n  <name>{}</name>\n</network>\n", name);
        let path = std::env::temp_dir().join(format!("labvm-net-{}.xml", name));
        fs::write(&path, xml)?;
        let defined = self.run(["net-define".to_string(), path.to_string_lossy().into_owned()]);
        let _ = fs::remove_file(&path);
        defined?;
        self.run(["net-start", name])?;
        self.run(["net-autostart", name])?;
        Ok(())
    }

    /// Interactive serial console of a libvirt domain.
    pub fn console_command(name: &str) -> HostCommand {
        HostCommand::new("virsh").args(["console", name, "--force"])
    }
}

// ============================================================================
// vmx.sh
// ============================================================================

pub struct VmxInstaller<'a> {
    exec: &'a dyn HostExecutor,
    timings: &'a Timings,
}

impl<'a> VmxInstaller<'a> {
    pub fn new(exec: &'a dyn HostExecutor, timings: &'a Timings) -> Self {
        Self { exec, timings }
    }

    fn command(dir: &Path, args: &[&str]) -> HostCommand {
        HostCommand::new("./vmx.sh")
            .args(args.iter().copied())
            .current_dir(dir)
    }

    /// Run the installer, retrying with a fixed backoff. The installer
    /// fails intermittently for environmental reasons.
    pub fn install(&self, dir: &Path, instance: &str) -> Result<()> {
        let cmd = Self::command(dir, &["--install"]);
        for attempt in 1..=INSTALL_ATTEMPTS {
            info!(instance, attempt, "installing vMX");
            let result = self.exec.exec(&cmd, self.timings.install_timeout)?;
            if result.success() {
                return Ok(());
            }
            warn!(
                instance,
                attempt,
                exit_code = result.exit_code,
                "vMX installation failed"
            );
            if attempt < INSTALL_ATTEMPTS {
                thread::sleep(self.timings.install_backoff);
            }
        }
        Err(ProvisionError::InstallFailed {
            instance: instance.to_string(),
            attempts: INSTALL_ATTEMPTS,
        })
    }

    /// Bind the junosdev links to their host bridges.
    pub fn bind_devices(&self, dir: &Path) -> Result<()> {
        info!(dir = %dir.display(), "binding vMX interfaces");
        self.exec
            .exec_ok(&Self::command(dir, &["--bind-dev"]), HOST_COMMAND_TIMEOUT)?;
        Ok(())
    }

    /// Tear down both domains and the host plumbing of an installed bundle.
    pub fn cleanup(&self, dir: &Path) -> CommandOutcome {
        best_effort(self.exec, Self::command(dir, &["--cleanup"]))
    }

    /// Interactive console of the control plane.
    pub fn console_command(dir: &Path, instance: &str) -> HostCommand {
        Self::command(dir, &["--console", "vcp", instance])
    }
}

// ============================================================================
// Family-independent lifecycle
// ============================================================================

pub struct HypervisorDriver<'a> {
    virsh: Virsh<'a>,
    vmx: VmxInstaller<'a>,
}

impl<'a> HypervisorDriver<'a> {
    pub fn new(exec: &'a dyn HostExecutor, timings: &'a Timings) -> Self {
        Self {
            virsh: Virsh::new(exec),
            vmx: VmxInstaller::new(exec, timings),
        }
    }

    pub fn virsh(&self) -> &Virsh<'a> {
        &self.virsh
    }

    pub fn vmx(&self) -> &VmxInstaller<'a> {
        &self.vmx
    }

    /// Bring a staged instance up.
    ///
    /// Cisco: define the rendered XML, enable autostart, start. Juniper: run
    /// the installer, then enable autostart on both domains.
    pub fn install(&self, spec: &VmSpec, staged: &Path) -> Result<()> {
        match spec.family() {
            DeviceFamily::Cisco => {
                self.virsh.define(&staged.with_extension("xml"))?;
                self.virsh.autostart(spec.name())?;
                self.virsh.start(spec.name())
            }
            DeviceFamily::Juniper => {
                self.vmx.install(staged, spec.name())?;
                self.virsh.autostart(&vcp_name(spec.name()))?;
                self.virsh.autostart(&vfp_name(spec.name()))
            }
        }
    }

    /// Pin the control plane to the first CPU and the forwarding plane's
    /// vCPUs to the rest. The installer cannot pin, so this runs after it.
    pub fn pin_pair(&self, instance: &str, cpus: &CpuAllocation) -> Result<()> {
        let Some((&vcp_cpu, vfp_cpus)) = cpus.cpus().split_first() else {
            return Err(ProvisionError::InsufficientResources(format!(
                "no CPUs allocated to '{}'",
                instance
            )));
        };
        info!(instance, vcp_cpu, ?vfp_cpus, "pinning vMX domains");
        self.virsh.pin_cpu(&vcp_name(instance), 0, vcp_cpu)?;
        let vfp = vfp_name(instance);
        for (vcpu, &cpu) in vfp_cpus.iter().enumerate() {
            self.virsh.pin_cpu(&vfp, vcpu, cpu)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecResult;
    use crate::testing::RecordingExecutor;
    use std::path::PathBuf;

    #[test]
    fn test_install_retries_then_autostarts_both_domains() {
        let exec = RecordingExecutor::new()
            .fail("./vmx.sh --install", 1, "vfp did not come up")
            .ok("./vmx.sh --install", "");
        let timings = Timings::immediate();
        let driver = HypervisorDriver::new(&exec, &timings);
        let spec = VmSpec::new("r2", DeviceFamily::Juniper, "br0").unwrap();

        driver.install(&spec, Path::new("/images/r2")).unwrap();
        assert_eq!(exec.calls_matching("./vmx.sh --install").len(), 2);
        assert_eq!(
            exec.calls_matching("virsh autostart"),
            vec!["virsh autostart vcp-r2", "virsh autostart vfp-r2"]
        );
    }

    #[test]
    fn test_install_gives_up_after_three_attempts() {
        let exec = RecordingExecutor::new().fail("./vmx.sh --install", 1, "");
        let timings = Timings::immediate();
        let driver = HypervisorDriver::new(&exec, &timings);
        let spec = VmSpec::new("r2", DeviceFamily::Juniper, "br0").unwrap();

        let err = driver.install(&spec, Path::new("/images/r2")).unwrap_err();
        assert!(matches!(err, ProvisionError::InstallFailed { attempts: 3, .. }));
        assert_eq!(exec.calls_matching("./vmx.sh").len(), 3);
        assert!(exec.calls_matching("virsh autostart").is_empty());
    }

    #[test]
    fn test_cisco_install_defines_then_starts() {
        let exec = RecordingExecutor::new();
        let timings = Timings::immediate();
        let driver = HypervisorDriver::new(&exec, &timings);
        let spec = VmSpec::new("r1", DeviceFamily::Cisco, "br0").unwrap();

        driver.install(&spec, &PathBuf::from("/images/r1.qcow2")).unwrap();
        assert_eq!(
            exec.calls(),
            vec![
                "virsh define /images/r1.xml",
                "virsh autostart r1",
                "virsh start r1"
            ]
        );
    }

    #[test]
    fn test_pin_pair_splits_one_and_three() {
        let exec = RecordingExecutor::new();
        let timings = Timings::immediate();
        let driver = HypervisorDriver::new(&exec, &timings);

        driver.pin_pair("r2", &CpuAllocation::new(vec![4, 5, 6, 7])).unwrap();
        assert_eq!(
            exec.calls(),
            vec![
                "virsh vcpupin vcp-r2 --vcpu 0 4 --config --live",
                "virsh vcpupin vfp-r2 --vcpu 0 5 --config --live",
                "virsh vcpupin vfp-r2 --vcpu 1 6 --config --live",
                "virsh vcpupin vfp-r2 --vcpu 2 7 --config --live",
            ]
        );
    }

    #[test]
    fn test_best_effort_outcomes() {
        let exec = RecordingExecutor::new()
            .fail("virsh destroy", 1, "domain is not running")
            .on("virsh undefine", ExecResult::ok(""));
        let virsh = Virsh::new(&exec);

        let destroyed = virsh.destroy("r1");
        assert!(!destroyed.succeeded());
        assert!(destroyed.error.unwrap().contains("virsh destroy r1"));

        let undefined = virsh.undefine("r1", true);
        assert!(undefined.succeeded());
        assert_eq!(undefined.command, "virsh undefine r1 --remove-all-storage --nvram");
    }

    #[test]
    fn test_console_commands() {
        assert_eq!(Virsh::console_command("r1").to_string(), "virsh console r1 --force");
        assert_eq!(
            VmxInstaller::console_command(Path::new("/images/r2"), "r2").to_string(),
            "./vmx.sh --console vcp r2 (in /images/r2)"
        );
    }
}
