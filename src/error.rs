//! Error types for VM provisioning.
//!
//! Every fatal condition of a provisioning run maps to one variant here. The
//! binary prints the error and exits non-zero; nothing in the library tries to
//! clean up a half-configured VM.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::console::ConsoleError;

/// Errors that can occur while provisioning or tearing down lab VMs.
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// Not enough free CPUs, disk or memory on the host. Raised before any
    /// side effect.
    #[error("insufficient resources: {0}")]
    InsufficientResources(String),

    /// Fetching, copying or extracting an image failed.
    #[error("image staging failed for '{image}': {reason}")]
    ImageStagingFailed { image: String, reason: String },

    /// The family installer kept failing.
    #[error("installation of '{instance}' failed after {attempts} attempts")]
    InstallFailed { instance: String, attempts: u32 },

    /// An expected console prompt never appeared.
    #[error("console of '{instance}' stopped responding: {source}")]
    ConsoleTimeout {
        instance: String,
        #[source]
        source: ConsoleError,
    },

    /// The boot detector never succeeded within the deadline.
    #[error("'{instance}' did not boot within {}s", .waited.as_secs())]
    BootTimeout { instance: String, waited: Duration },

    /// Base configuration could not be committed and verified.
    #[error("configuration of '{instance}' not committed after {attempts} attempts: {last_error}")]
    ConfigCommitFailed {
        instance: String,
        attempts: u32,
        last_error: String,
    },

    /// One or more teardown commands failed. The group may be partially removed.
    #[error("teardown of group '{group}' incomplete:\n{}", .failures.join("\n"))]
    TeardownPartialFailure { group: String, failures: Vec<String> },

    /// A host command exited non-zero or did not finish in time.
    #[error("host command failed (exit {exit_code}): {command}\n{output}")]
    HostCommand {
        command: String,
        exit_code: i32,
        output: String,
    },

    /// A host command could not be started at all.
    #[error("failed to run '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The requested VM description is not acceptable.
    #[error("invalid VM spec: {0}")]
    InvalidSpec(String),

    /// Settings file could not be read or parsed.
    #[error("invalid settings file {}: {reason}", .path.display())]
    Settings { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProvisionError {
    /// Attach an instance name to a console failure.
    pub fn console(instance: &str, source: ConsoleError) -> Self {
        Self::ConsoleTimeout {
            instance: instance.to_string(),
            source,
        }
    }
}

/// Result type alias for provisioning operations.
pub type Result<T> = std::result::Result<T, ProvisionError>;
