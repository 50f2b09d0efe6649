//! Console-driven bring-up of an installed router.
//!
//! # Overview
//!
//! After the hypervisor has started a VM, everything else happens over its
//! serial console: waiting for the OS to come up, logging in, pasting the
//! base configuration until it sticks, and (vMX only) adding licenses.
//!
//! Each family implements [`RouterConsole`]: how to reach its console and
//! the dialogues it speaks. [`BootSequencer`] owns the timing and retry
//! policy and is the same for every family.

pub mod cisco;
pub mod juniper;
pub mod machine;

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::console::{ConsoleError, ConsoleOpener, ConsoleSession, Prompt};
use crate::error::{ProvisionError, Result};
use crate::executor::HostCommand;
use crate::settings::Timings;

pub use cisco::CiscoConsole;
pub use juniper::JuniperConsole;
pub use machine::Outcome;

/// Paste attempts before the base configuration is given up on.
pub const CONFIG_ATTEMPTS: u32 = 7;

/// License keys are typed in pieces of this many characters.
const LICENSE_CHUNK: usize = 100;

// ============================================================================
// Provisioning state
// ============================================================================

/// Where one instance is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BootState {
    NotStarted,
    Installing,
    AwaitingConsole,
    Authenticating,
    ConfigModeEntered,
    BaseConfigApplied,
    LicenseApplied,
    Bound,
}

impl BootState {
    pub fn description(&self) -> &'static str {
        match self {
            Self::NotStarted => "not started",
            Self::Installing => "installing",
            Self::AwaitingConsole => "waiting for the console",
            Self::Authenticating => "logging in",
            Self::ConfigModeEntered => "in configuration mode",
            Self::BaseConfigApplied => "base configuration applied",
            Self::LicenseApplied => "license applied",
            Self::Bound => "ready",
        }
    }
}

impl std::fmt::Display for BootState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

// ============================================================================
// Family behaviour
// ============================================================================

/// The console dialogues of one router family.
pub trait RouterConsole {
    /// Instance name, used in errors and logs.
    fn instance(&self) -> &str;

    /// Command attaching to the serial console.
    fn console_command(&self) -> HostCommand;

    /// Banner printed once the console is attached.
    fn attach_marker(&self) -> Prompt;

    /// One boot probe. `Done` means the router is ready for configuration.
    fn detect_boot(&self, session: &mut ConsoleSession) -> std::result::Result<Outcome, ConsoleError>;

    fn enter_config_mode(&self, session: &mut ConsoleSession) -> std::result::Result<(), ConsoleError>;

    /// Paste and commit the base configuration.
    fn apply_base_config(&self, session: &mut ConsoleSession) -> std::result::Result<(), ConsoleError>;

    /// Query the running configuration for the statement that proves the
    /// base configuration is active.
    fn verify_base_config(&self, session: &mut ConsoleSession) -> std::result::Result<(), ConsoleError>;

    /// Successful verifications needed before the configuration is trusted:
    /// 3 for Juniper, 1 for Cisco.
    fn required_confirmations(&self) -> u32;

    fn leave_config_mode(&self, _session: &mut ConsoleSession) -> std::result::Result<(), ConsoleError> {
        Ok(())
    }
}

// ============================================================================
// Sequencer
// ============================================================================

/// Drives one instance from "started" to "configured".
pub struct BootSequencer<'a> {
    opener: &'a dyn ConsoleOpener,
    timings: &'a Timings,
    state: BootState,
}

impl<'a> BootSequencer<'a> {
    pub fn new(opener: &'a dyn ConsoleOpener, timings: &'a Timings) -> Self {
        Self {
            opener,
            timings,
            state: BootState::NotStarted,
        }
    }

    pub fn state(&self) -> BootState {
        self.state
    }

    pub fn set_state(&mut self, state: BootState) {
        debug!(from = %self.state, to = %state, "state change");
        self.state = state;
    }

    /// Probe the console until the router answers like a booted one.
    ///
    /// Returns the session the probe succeeded on. A console that closes is
    /// reopened; all of it counts against `boot_timeout`.
    pub fn wait_for_boot(&mut self, device: &dyn RouterConsole) -> Result<ConsoleSession> {
        let instance = device.instance();
        let deadline = Instant::now() + self.timings.boot_timeout;
        let mut session: Option<ConsoleSession> = None;
        self.set_state(BootState::AwaitingConsole);
        info!(instance, "waiting for boot");

        while Instant::now() < deadline {
            if session.is_none() {
                match self.attach(device) {
                    Ok(s) => session = Some(s),
                    Err(e) => warn!(instance, error = %e, "console attach failed"),
                }
            }

            if let Some(mut s) = session.take() {
                self.set_state(BootState::Authenticating);
                match device.detect_boot(&mut s) {
                    Ok(Outcome::Done) => {
                        info!(instance, "booted");
                        self.set_state(BootState::ConfigModeEntered);
                        return Ok(s);
                    }
                    Ok(Outcome::NotReady) => {
                        debug!(instance, "not ready yet");
                        session = Some(s);
                    }
                    Err(e @ ConsoleError::Timeout { .. }) => {
                        debug!(instance, error = %e, "no answer yet");
                        session = Some(s);
                    }
                    Err(e) => warn!(instance, error = %e, "console lost, reopening"),
                }
                session = session.filter(ConsoleSession::is_alive);
            }

            let left = deadline.saturating_duration_since(Instant::now());
            thread::sleep(self.timings.probe_interval.min(left));
        }

        Err(ProvisionError::BootTimeout {
            instance: instance.to_string(),
            waited: self.timings.boot_timeout,
        })
    }

    fn attach(&self, device: &dyn RouterConsole) -> std::result::Result<ConsoleSession, ConsoleError> {
        let mut session = self.opener.open(device.instance(), &device.console_command())?;
        session.expect_one(&device.attach_marker(), self.timings.attach_timeout)?;
        Ok(session)
    }

    /// Paste the base configuration until it has been verified
    /// [`RouterConsole::required_confirmations`] times in total. Every
    /// verified attempt is followed by the settle delay.
    ///
    /// Gives up with [`ProvisionError::ConfigCommitFailed`] only when the
    /// last of [`CONFIG_ATTEMPTS`] attempts fails; a successful last attempt
    /// is accepted with a warning even if confirmations are missing.
    pub fn set_base_config(&mut self, device: &dyn RouterConsole, session: &mut ConsoleSession) -> Result<()> {
        let instance = device.instance();
        let mut remaining = device.required_confirmations();

        for attempt in 1..=CONFIG_ATTEMPTS {
            if remaining == 0 {
                break;
            }
            match self.config_attempt(device, session) {
                Ok(()) => {
                    remaining -= 1;
                    info!(instance, attempt, remaining, "base configuration verified");
                    thread::sleep(self.timings.settle);
                }
                Err(e) if attempt == CONFIG_ATTEMPTS => {
                    return Err(ProvisionError::ConfigCommitFailed {
                        instance: instance.to_string(),
                        attempts: CONFIG_ATTEMPTS,
                        last_error: e.to_string(),
                    });
                }
                Err(e) => warn!(instance, attempt, error = %e, "configuration attempt failed"),
            }
        }

        if remaining > 0 {
            warn!(instance, remaining, "ran out of attempts before every confirmation");
        }
        Ok(())
    }

    fn config_attempt(
        &mut self,
        device: &dyn RouterConsole,
        session: &mut ConsoleSession,
    ) -> std::result::Result<(), ConsoleError> {
        device.enter_config_mode(session)?;
        self.set_state(BootState::ConfigModeEntered);
        device.apply_base_config(session)?;
        device.verify_base_config(session)?;
        self.set_state(BootState::BaseConfigApplied);
        Ok(())
    }

    /// Leave configuration mode once the base configuration is in.
    pub fn finish_config(&mut self, device: &dyn RouterConsole, session: &mut ConsoleSession) -> Result<()> {
        device
            .leave_config_mode(session)
            .map_err(|e| ProvisionError::console(device.instance(), e))
    }

    /// Add vMX license keys over the console and enable the licensed
    /// features. Does nothing without keys.
    pub fn install_license(&mut self, instance: &str, keys: &[String], session: &mut ConsoleSession) -> Result<()> {
        if keys.is_empty() {
            debug!(instance, "no license keys configured");
            return Ok(());
        }
        info!(instance, keys = keys.len(), "installing license");
        self.add_license_keys(keys, session)
            .map_err(|e| ProvisionError::console(instance, e))?;
        self.set_state(BootState::LicenseApplied);
        Ok(())
    }

    fn add_license_keys(&self, keys: &[String], session: &mut ConsoleSession) -> std::result::Result<(), ConsoleError> {
        let t = self.timings;
        session.send_line("run request system license add terminal")?;
        session.expect_one(&Prompt::literal("between each license key]"), t.prompt_timeout)?;

        for key in keys {
            let chars: Vec<char> = key.chars().collect();
            for chunk in chars.chunks(LICENSE_CHUNK) {
                session.send(&chunk.iter().collect::<String>())?;
            }
            session.send_line("")?;
        }
        session.send_control('d')?;
        session.expect_one(&Prompt::literal("successfully added"), t.prompt_timeout)?;

        for line in ["set chassis license bandwidth 100", "set chassis license scale premium", "commit"] {
            session.send_line(line)?;
        }
        session.expect_one(&Prompt::literal("commit complete"), t.commit_timeout)?;
        Ok(())
    }
}

/// A dialogue that ended without reaching its goal.
pub(crate) fn not_ready(what: &str, waited: Duration) -> ConsoleError {
    ConsoleError::Timeout {
        expected: what.to_string(),
        waited,
        tail: String::new(),
    }
}
