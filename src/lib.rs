//! Lab VM provisioning for emulated routers on a KVM/libvirt host.
//!
//! This library provides:
//! - Resource planning (CPUs, disk, bridges, virsh networks)
//! - Image staging and hypervisor configuration rendering
//! - virsh and `vmx.sh` lifecycle control
//! - Console-driven boot detection and base configuration
//! - Group membership and teardown
//!
//! Two router families are supported: Cisco IOS-XRv (one libvirt domain)
//! and Juniper vMX (a control-plane and a forwarding-plane domain installed
//! by the bundle's own script).

pub mod boot;
pub mod console;
pub mod error;
pub mod executor;
pub mod hypervisor;
pub mod image;
pub mod planner;
pub mod provision;
pub mod registry;
pub mod render;
pub mod settings;
pub mod vm;

#[cfg(test)]
mod testing;

// Re-export commonly used items
pub use boot::{BootSequencer, BootState, RouterConsole};
pub use console::{ConsoleError, ConsoleOpener, ConsoleSession, Prompt, PtyOpener};
pub use error::{ProvisionError, Result};
pub use executor::{ExecResult, HostCommand, HostExecutor, SystemExecutor};
pub use hypervisor::HypervisorDriver;
pub use planner::ResourcePlanner;
pub use provision::{CheckReport, ProvisionReport, Provisioner, StepError};
pub use registry::{GroupRegistry, TeardownReport};
pub use settings::Settings;
pub use vm::{DeviceFamily, FamilyCounts, ManagementAddress, TrafficInterface, VmSpec};
