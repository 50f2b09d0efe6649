//! vMX control-plane console dialogues.

use std::path::Path;

use crate::console::{ConsoleError, ConsoleSession, Prompt};
use crate::executor::HostCommand;
use crate::hypervisor::VmxInstaller;
use crate::settings::{Credentials, Timings};
use crate::vm::VmSpec;

use super::machine::{self, Input, Machine, Next, Outcome, Transition};
use super::{not_ready, RouterConsole};

pub struct JuniperConsole<'a> {
    spec: &'a VmSpec,
    credentials: &'a Credentials,
    timings: &'a Timings,
    /// Extracted bundle; `vmx.sh` only works from there.
    staged: &'a Path,
}

impl<'a> JuniperConsole<'a> {
    pub fn new(spec: &'a VmSpec, credentials: &'a Credentials, timings: &'a Timings, staged: &'a Path) -> Self {
        Self {
            spec,
            credentials,
            timings,
            staged,
        }
    }

    /// Configuration lines typed at the `[edit]` prompt, ending in `commit`.
    pub fn base_config(&self) -> Vec<String> {
        let name = self.spec.name();
        let user = &self.credentials.username;
        let hash = &self.credentials.md5_hash;
        let mut lines = vec![
            "delete chassis".to_string(),
            "delete system".to_string(),
            "delete interfaces".to_string(),
            format!("set system host-name {}", name),
            format!("set system login user {} class super-user", user),
            format!("set system login user {} authentication encrypted-password \"{}\"", user, hash),
            format!("set system root-authentication encrypted-password \"{}\"", hash),
            "set system services ssh".to_string(),
        ];
        if let Some(addr) = self.spec.mgmt_ip() {
            lines.push(format!("set interfaces fxp0 unit 0 family inet address {}", addr));
        }
        if let Some(gw) = self.spec.mgmt_gw() {
            lines.push(format!("set routing-options static route 0.0.0.0/0 next-hop {}", gw));
        }
        if let Some(extra) = self.spec.cli_config() {
            lines.extend(
                extra
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string),
            );
        }
        lines.push("commit".to_string());
        lines
    }
}

impl RouterConsole for JuniperConsole<'_> {
    fn instance(&self) -> &str {
        self.spec.name()
    }

    fn console_command(&self) -> HostCommand {
        VmxInstaller::console_command(self.staged, self.spec.name())
    }

    fn attach_marker(&self) -> Prompt {
        Prompt::literal("to exit anytime")
    }

    /// Booted means configuration mode can be reached.
    fn detect_boot(&self, session: &mut ConsoleSession) -> Result<Outcome, ConsoleError> {
        machine::drive(&ModeEntry(self.timings), session)
    }

    fn enter_config_mode(&self, session: &mut ConsoleSession) -> Result<(), ConsoleError> {
        match machine::drive(&ModeEntry(self.timings), session)? {
            Outcome::Done => Ok(()),
            Outcome::NotReady => Err(not_ready("configuration mode", self.timings.prompt_timeout)),
        }
    }

    fn apply_base_config(&self, session: &mut ConsoleSession) -> Result<(), ConsoleError> {
        // Ends a half-typed license or multi-line input left from earlier.
        session.send_control('d')?;
        for line in self.base_config() {
            session.send_line(&line)?;
        }
        session.expect_one(&Prompt::literal("commit complete"), self.timings.commit_timeout)?;
        Ok(())
    }

    fn verify_base_config(&self, session: &mut ConsoleSession) -> Result<(), ConsoleError> {
        let (query, statement) = match self.spec.mgmt_ip() {
            Some(addr) => (
                format!("show | display set | match {}", addr),
                format!("family inet address {}", addr),
            ),
            None => (
                "show | display set | match host-name".to_string(),
                format!("host-name {}", self.spec.name()),
            ),
        };
        session.send_line(&query)?;
        session.expect_one(&Prompt::literal(&statement), self.timings.prompt_timeout)?;
        Ok(())
    }

    fn required_confirmations(&self) -> u32 {
        3
    }
}

// ============================================================================
// Mode entry
// ============================================================================

/// Walks from wherever the console currently is to `[edit]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Wake,
    /// `login:` answered with root.
    Login,
    /// FreeBSD shell, start the CLI.
    Shell,
    /// Operational mode.
    Operational,
}

struct ModeEntry<'a>(&'a Timings);

impl Machine for ModeEntry<'_> {
    type State = Mode;

    fn initial(&self) -> Mode {
        Mode::Wake
    }

    fn transition(&self, state: Mode) -> Transition<Mode> {
        let t = self.0;
        let shell = || Prompt::literal("root@:~ #");
        let operational = || Prompt::pattern("operational prompt", r"(?s)root.*>");
        let configuration = || Prompt::pattern("configuration prompt", r"(?s)edit.*#");
        match state {
            Mode::Wake => Transition::expect(
                Some(Input::Raw("\r\n".to_string())),
                vec![
                    (Prompt::literal("login:"), Next::Goto(Mode::Login)),
                    (shell(), Next::Goto(Mode::Shell)),
                    (operational(), Next::Goto(Mode::Operational)),
                    (configuration(), Next::Done),
                ],
                t.probe_timeout,
            ),
            Mode::Login => Transition::expect(
                Some(Input::line("root")),
                vec![(shell(), Next::Goto(Mode::Shell))],
                t.prompt_timeout,
            ),
            Mode::Shell => Transition::expect(
                Some(Input::line("cli")),
                vec![(operational(), Next::Goto(Mode::Operational))],
                t.cli_timeout,
            ),
            Mode::Operational => Transition::expect(
                Some(Input::line("configure")),
                vec![(configuration(), Next::Done)],
                t.prompt_timeout,
            ),
        }
    }
}
