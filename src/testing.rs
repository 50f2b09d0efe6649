//! Test doubles for the host and for router consoles.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::console::{ConsoleError, ConsoleOpener, ConsoleSession};
use crate::error::Result;
use crate::executor::{ExecResult, HostCommand, HostExecutor};

// ============================================================================
// Host commands
// ============================================================================

/// Answers host commands from canned results and records every call.
///
/// A rule matches when the rendered command starts with its prefix; the
/// first matching rule wins. Queued results are consumed in order and the
/// last one repeats. Unmatched commands succeed with empty output.
#[derive(Default)]
pub struct RecordingExecutor {
    rules: Mutex<Vec<(String, VecDeque<ExecResult>)>>,
    calls: Mutex<Vec<String>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, prefix: &str, result: ExecResult) -> Self {
        {
            let mut rules = self.rules.lock().unwrap();
            match rules.iter_mut().find(|(p, _)| p == prefix) {
                Some((_, queue)) => queue.push_back(result),
                None => rules.push((prefix.to_string(), VecDeque::from([result]))),
            }
        }
        self
    }

    pub fn ok(self, prefix: &str, output: &str) -> Self {
        self.on(prefix, ExecResult::ok(output))
    }

    pub fn fail(self, prefix: &str, exit_code: i32, errors: &str) -> Self {
        self.on(prefix, ExecResult::failed(exit_code, errors))
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls starting with `prefix`, in order.
    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    /// Position of the first call starting with `prefix`.
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.calls().iter().position(|c| c.starts_with(prefix))
    }
}

impl HostExecutor for RecordingExecutor {
    fn exec(&self, cmd: &HostCommand, _timeout: Duration) -> Result<ExecResult> {
        let line = cmd.to_string();
        self.calls.lock().unwrap().push(line.clone());

        let mut rules = self.rules.lock().unwrap();
        let result = rules
            .iter_mut()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, queue)| {
                if queue.len() > 1 {
                    queue.pop_front().unwrap()
                } else {
                    queue.front().cloned().unwrap()
                }
            })
            .unwrap_or_else(|| ExecResult::ok(""));
        Ok(result)
    }
}

// ============================================================================
// Consoles
// ============================================================================

type Script = Arc<Mutex<Vec<(String, VecDeque<String>)>>>;

/// A fake device console: each line written to it is looked up in a
/// script of exact-match triggers and the canned reply is fed back as
/// output. Like [`RecordingExecutor`], the last reply for a trigger repeats.
pub struct ScriptedConsole {
    greeting: Vec<String>,
    script: Script,
    sent: Arc<Mutex<Vec<String>>>,
    hang_up_on: Option<String>,
}

impl ScriptedConsole {
    pub fn new() -> Self {
        Self {
            greeting: Vec::new(),
            script: Arc::new(Mutex::new(Vec::new())),
            sent: Arc::new(Mutex::new(Vec::new())),
            hang_up_on: None,
        }
    }

    /// Drop the line when `trigger` is sent, as a console killed by
    /// another client would.
    pub fn hang_up_on(mut self, trigger: &str) -> Self {
        self.hang_up_on = Some(trigger.to_string());
        self
    }

    /// Output available as soon as the console is opened.
    pub fn greeting(mut self, text: &str) -> Self {
        self.greeting.push(text.to_string());
        self
    }

    /// Reply with `reply` when the line `trigger` is sent.
    pub fn on(self, trigger: &str, reply: &str) -> Self {
        {
            let mut script = self.script.lock().unwrap();
            match script.iter_mut().find(|(t, _)| t == trigger) {
                Some((_, queue)) => queue.push_back(reply.to_string()),
                None => script.push((trigger.to_string(), VecDeque::from([reply.to_string()]))),
            }
        }
        self
    }

    /// Every raw write, in order.
    pub fn sent(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.sent)
    }

    pub fn into_session(self, label: &str) -> ConsoleSession {
        let (tx, rx) = mpsc::channel();
        for text in &self.greeting {
            let _ = tx.send(text.clone());
        }
        let writer = ScriptWriter {
            tx: Some(tx),
            script: self.script,
            sent: self.sent,
            hang_up_on: self.hang_up_on,
        };
        ConsoleSession::from_stream(label, Box::new(writer), rx)
    }
}

struct ScriptWriter {
    tx: Option<Sender<String>>,
    script: Script,
    sent: Arc<Mutex<Vec<String>>>,
    hang_up_on: Option<String>,
}

impl ScriptWriter {
    fn react(&mut self, line: &str) {
        if self.hang_up_on.as_deref() == Some(line) {
            self.tx = None;
        }
        let Some(tx) = &self.tx else {
            return;
        };
        let mut script = self.script.lock().unwrap();
        let Some((_, queue)) = script.iter_mut().find(|(t, _)| t == line) else {
            return;
        };
        let reply = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        if let Some(reply) = reply {
            let _ = tx.send(reply);
        }
    }
}

impl Write for ScriptWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf).into_owned();
        self.sent.lock().unwrap().push(text.clone());

        let mut segments: Vec<&str> = text.split('\n').collect();
        if segments.len() > 1 && segments.last() == Some(&"") {
            segments.pop();
        }
        for segment in segments {
            self.react(segment.trim());
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Hands out prepared consoles in order and records what was opened.
#[derive(Default)]
pub struct ScriptedOpener {
    consoles: Mutex<VecDeque<ScriptedConsole>>,
    opened: Mutex<Vec<String>>,
}

impl ScriptedOpener {
    pub fn new(consoles: Vec<ScriptedConsole>) -> Self {
        Self {
            consoles: Mutex::new(consoles.into()),
            opened: Mutex::new(Vec::new()),
        }
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }
}

impl ConsoleOpener for ScriptedOpener {
    fn open(&self, label: &str, cmd: &HostCommand) -> std::result::Result<ConsoleSession, ConsoleError> {
        self.opened.lock().unwrap().push(cmd.to_string());
        match self.consoles.lock().unwrap().pop_front() {
            Some(console) => Ok(console.into_session(label)),
            None => Err(ConsoleError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no scripted console left for '{}'", cmd),
            ))),
        }
    }
}
