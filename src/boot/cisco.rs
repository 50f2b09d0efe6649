//! IOS-XRv console dialogues.

use std::fmt::Write as _;

use crate::console::{ConsoleError, ConsoleSession, Prompt};
use crate::executor::HostCommand;
use crate::hypervisor::Virsh;
use crate::settings::{Credentials, Timings};
use crate::vm::VmSpec;

use super::machine::{self, Input, Machine, Next, Outcome, Transition};
use super::RouterConsole;

const MGMT_INTERFACE: &str = "MgmtEth0/RP0/CPU0/0";

pub struct CiscoConsole<'a> {
    spec: &'a VmSpec,
    credentials: &'a Credentials,
    timings: &'a Timings,
}

impl<'a> CiscoConsole<'a> {
    pub fn new(spec: &'a VmSpec, credentials: &'a Credentials, timings: &'a Timings) -> Self {
        Self {
            spec,
            credentials,
            timings,
        }
    }

    /// Configuration pasted before `commit replace`.
    pub fn base_config(&self) -> String {
        let mut cfg = String::new();
        let user = &self.credentials.username;
        let _ = writeln!(cfg, "hostname {}", self.spec.name());
        let _ = writeln!(cfg, "username {}", user);
        cfg.push_str(" group root-lr\n group cisco-support\n");
        let _ = writeln!(cfg, " secret 10 {}", self.credentials.sha512_hash);
        cfg.push_str("!\n");
        cfg.push_str("line console\n width 512\n!\n");
        cfg.push_str("line default\n exec-timeout 0 0\n width 512\n length 0\n transport input ssh\n!\n");
        cfg.push_str("vty-pool default 0 4 line-template default\n");
        let _ = writeln!(cfg, "interface {}", MGMT_INTERFACE);
        cfg.push_str(" mtu 1500\n");
        if let Some(addr) = self.spec.mgmt_ip() {
            let _ = writeln!(cfg, " ipv4 address {} {}", addr.ip, addr.netmask());
        }
        cfg.push_str("!\n");
        if let Some(gw) = self.spec.mgmt_gw() {
            cfg.push_str("router static\n address-family ipv4 unicast\n");
            let _ = writeln!(cfg, "  0.0.0.0/0 {}", gw);
            cfg.push_str(" !\n!\n");
        }
        cfg.push_str("ssh server v2\nssh server vrf default\n");
        cfg.push_str("xml agent tty\n iteration off\n!\n");
        if let Some(extra) = self.spec.cli_config() {
            cfg.push_str(extra.trim_end());
            cfg.push('\n');
        }
        cfg
    }
}

impl RouterConsole for CiscoConsole<'_> {
    fn instance(&self) -> &str {
        self.spec.name()
    }

    fn console_command(&self) -> HostCommand {
        Virsh::console_command(self.spec.name())
    }

    fn attach_marker(&self) -> Prompt {
        Prompt::literal("Escape character is")
    }

    fn detect_boot(&self, session: &mut ConsoleSession) -> Result<Outcome, ConsoleError> {
        machine::drive(&BootProbe(self), session)
    }

    fn enter_config_mode(&self, session: &mut ConsoleSession) -> Result<(), ConsoleError> {
        // Abandon whatever is pending and discard the noise it prints.
        session.send_line("end")?;
        session.send_line("no")?;
        session.clear();
        session.send_line("configure")?;
        session.expect_one(&Prompt::pattern("config prompt", r"\(config"), self.timings.prompt_timeout)?;
        Ok(())
    }

    fn apply_base_config(&self, session: &mut ConsoleSession) -> Result<(), ConsoleError> {
        let t = self.timings;
        session.send_line(&format!("{}\ncommit replace", self.base_config()))?;
        session.expect_one(&Prompt::pattern("[no]:", r"\[no\]:"), t.commit_timeout)?;
        session.send_line("yes")?;
        session.expect_one(&Prompt::pattern("commit done", r"(?s)yes.*\(config"), t.commit_timeout)?;
        Ok(())
    }

    fn verify_base_config(&self, session: &mut ConsoleSession) -> Result<(), ConsoleError> {
        let (query, statement) = match self.spec.mgmt_ip() {
            Some(addr) => (
                format!("do show running-config interface {}", MGMT_INTERFACE),
                format!("ipv4 address {} {}", addr.ip, addr.netmask()),
            ),
            None => (
                "do show running-config hostname".to_string(),
                format!("hostname {}", self.spec.name()),
            ),
        };
        session.send_line(&query)?;
        session.expect_one(&Prompt::literal(&statement), self.timings.prompt_timeout)?;
        Ok(())
    }

    fn required_confirmations(&self) -> u32 {
        1
    }

    fn leave_config_mode(&self, session: &mut ConsoleSession) -> Result<(), ConsoleError> {
        session.send_line("end")
    }
}

// ============================================================================
// Boot probe
// ============================================================================

/// The router counts as booted once a login succeeds and `configure`
/// enters configuration mode without a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Probe {
    Wake,
    Login,
    Password,
    Configure,
    /// Answer a `[no]` question and try again later.
    Decline,
}

struct BootProbe<'c, 'a>(&'c CiscoConsole<'a>);

impl Machine for BootProbe<'_, '_> {
    type State = Probe;

    fn initial(&self) -> Probe {
        Probe::Wake
    }

    fn transition(&self, state: Probe) -> Transition<Probe> {
        let t = self.0.timings;
        let creds = self.0.credentials;
        let question = || Prompt::pattern("[no]", r"\[no\]");
        match state {
            Probe::Wake => Transition::expect(
                Some(Input::Raw("\r\n".to_string())),
                vec![
                    (Prompt::literal("Username:"), Next::Goto(Probe::Login)),
                    (question(), Next::Goto(Probe::Decline)),
                    (Prompt::literal("#"), Next::Goto(Probe::Configure)),
                ],
                t.probe_timeout,
            ),
            Probe::Login => Transition::expect(
                Some(Input::line(&creds.username)),
                vec![(Prompt::literal("Password:"), Next::Goto(Probe::Password))],
                t.prompt_timeout,
            ),
            Probe::Password => Transition::expect(
                Some(Input::line(&creds.password)),
                vec![
                    (Prompt::literal("Username:"), Next::NotReady),
                    (question(), Next::Goto(Probe::Decline)),
                    (Prompt::literal("#"), Next::Goto(Probe::Configure)),
                ],
                t.prompt_timeout,
            ),
            Probe::Configure => Transition::expect(
                Some(Input::line("configure")),
                vec![
                    (Prompt::pattern("(config)#", r"\(config[^)]*\)#"), Next::Done),
                    (question(), Next::Goto(Probe::Decline)),
                    (Prompt::literal("#"), Next::NotReady),
                ],
                t.prompt_timeout,
            ),
            Probe::Decline => Transition::send_only(Input::line("no"), Next::NotReady),
        }
    }
}
