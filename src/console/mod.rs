//! Pattern-matched interactive consoles.
//!
//! A [`ConsoleSession`] wraps one pseudo-terminal attached to a router's
//! serial console or to an interactive installer/transfer process, and
//! exposes a send/expect primitive. Every wait is bounded.
//!
//! Sessions are opened through a [`ConsoleOpener`] so boot sequencing and
//! image fetching can be driven against a scripted fake in tests.

pub mod ansi;
pub mod pty;
mod session;

pub use ansi::strip_ansi_codes;
pub use session::{ConsoleSession, Match};

use std::fmt;
use std::io;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::executor::HostCommand;

/// Failure of a single console interaction.
#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("timed out after {}s waiting for {expected}; last output: {tail:?}", waited.as_secs())]
    Timeout {
        expected: String,
        waited: Duration,
        tail: String,
    },

    #[error("console closed while waiting for {expected}; last output: {tail:?}")]
    Closed { expected: String, tail: String },

    #[error("console I/O failed: {0}")]
    Io(#[from] io::Error),
}

// ============================================================================
// Prompts
// ============================================================================

/// A named pattern to wait for on a console.
#[derive(Clone)]
pub struct Prompt {
    label: String,
    matcher: Matcher,
}

#[derive(Clone)]
enum Matcher {
    Literal(String),
    Regex(Regex),
}

impl Prompt {
    /// Match `text` literally.
    pub fn literal(text: &str) -> Self {
        Self {
            label: text.to_string(),
            matcher: Matcher::Literal(text.to_string()),
        }
    }

    /// Match a regular expression. `(?s)` lets `.` cross line breaks.
    ///
    /// An invalid expression degrades to a literal match of the same text.
    pub fn pattern(label: &str, pattern: &str) -> Self {
        let matcher = match Regex::new(pattern) {
            Ok(regex) => Matcher::Regex(regex),
            Err(e) => {
                warn!(pattern, error = %e, "invalid prompt pattern, matching it literally");
                Matcher::Literal(pattern.to_string())
            }
        };
        Self {
            label: label.to_string(),
            matcher,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Byte range of the first match in `haystack`.
    pub fn find(&self, haystack: &str) -> Option<(usize, usize)> {
        match &self.matcher {
            Matcher::Literal(text) => haystack.find(text.as_str()).map(|i| (i, i + text.len())),
            Matcher::Regex(regex) => regex.find(haystack).map(|m| (m.start(), m.end())),
        }
    }
}

impl fmt::Debug for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pattern = match &self.matcher {
            Matcher::Literal(text) => text.as_str(),
            Matcher::Regex(regex) => regex.as_str(),
        };
        f.debug_struct("Prompt")
            .field("label", &self.label)
            .field("pattern", &pattern)
            .finish()
    }
}

// ============================================================================
// Openers
// ============================================================================

/// Opens interactive sessions for host commands.
pub trait ConsoleOpener {
    fn open(&self, label: &str, cmd: &HostCommand) -> Result<ConsoleSession, ConsoleError>;
}

/// Opens sessions on real pseudo-terminals.
#[derive(Debug, Default, Clone, Copy)]
pub struct PtyOpener;

impl ConsoleOpener for PtyOpener {
    fn open(&self, label: &str, cmd: &HostCommand) -> Result<ConsoleSession, ConsoleError> {
        debug!(console = label, command = %cmd, "opening console");
        let (master, child) = pty::spawn(cmd)?;
        let writer = master.try_clone()?;
        let rx = pty::spawn_reader(master);
        Ok(ConsoleSession::from_stream(label, Box::new(writer), rx).with_child(child))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_prompt_escapes_metacharacters() {
        let prompt = Prompt::literal("[no]");
        let (start, end) = prompt.find("commit them? [no]:").unwrap();
        assert_eq!(end - start, 4);
        assert_eq!(prompt.find("n"), None);
    }

    #[test]
    fn test_dotall_pattern_crosses_lines() {
        let prompt = Prompt::pattern("operational", r"(?s)root.*>");
        assert!(prompt.find("root@vmx\r\n> ").is_some());
        let prompt = Prompt::pattern("operational", r"root.*>");
        assert!(prompt.find("root@vmx\r\n> ").is_none());
    }

    #[test]
    fn test_invalid_pattern_falls_back_to_literal() {
        let prompt = Prompt::pattern("broken", "(config");
        assert!(prompt.find("ios(config)#").is_some());
    }

    #[test]
    fn test_pty_opener_round_trip() {
        let mut session = PtyOpener
            .open("cat", &HostCommand::new("cat"))
            .unwrap();
        session.send_line("hello-console").unwrap();
        let m = session
            .expect(&[Prompt::literal("hello-console")], Duration::from_secs(5))
            .unwrap();
        assert_eq!(m.text, "hello-console");
        session.close();
    }
}
