//! Interactive console session: send a line, wait for a prompt.

use std::io::Write;
use std::process::Child;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::ansi::AnsiStripper;
use super::{ConsoleError, Prompt};

/// Receive granularity while waiting for a prompt.
const READ_SLICE: Duration = Duration::from_millis(100);

/// Unmatched output kept for matching. Older output is dropped.
const MAX_BUFFER: usize = 64 * 1024;

/// How much trailing output error messages carry.
const TAIL_CHARS: usize = 400;

/// A successful [`ConsoleSession::expect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    /// Index of the winning prompt in the list passed to `expect`.
    pub index: usize,
    /// Text the prompt matched.
    pub text: String,
}

/// One interactive pseudo-terminal, owned by exactly one boot sequence.
pub struct ConsoleSession {
    label: String,
    writer: Box<dyn Write + Send>,
    rx: Receiver<String>,
    child: Option<Child>,
    /// Output received but not yet consumed by a match, ANSI-stripped.
    buffer: String,
    stripper: AnsiStripper,
    last_match: Option<String>,
    alive: bool,
}

impl std::fmt::Debug for ConsoleSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleSession")
            .field("label", &self.label)
            .field("alive", &self.alive)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

impl ConsoleSession {
    /// Build a session over an existing byte stream.
    ///
    /// `writer` receives everything sent; `rx` yields output chunks and
    /// disconnects when the far side hangs up.
    pub fn from_stream(
        label: impl Into<String>,
        writer: Box<dyn Write + Send>,
        rx: Receiver<String>,
    ) -> Self {
        Self {
            label: label.into(),
            writer,
            rx,
            child: None,
            buffer: String::new(),
            stripper: AnsiStripper::default(),
            last_match: None,
            alive: true,
        }
    }

    /// Tie a process to the session; it is killed when the session closes.
    pub fn with_child(mut self, child: Child) -> Self {
        self.child = Some(child);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// False once the far side hung up.
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Text matched by the most recent successful `expect`.
    pub fn last_match(&self) -> Option<&str> {
        self.last_match.as_deref()
    }

    /// Send raw text without a line terminator.
    pub fn send(&mut self, text: &str) -> Result<(), ConsoleError> {
        trace!(console = %self.label, ?text, "send");
        self.writer.write_all(text.as_bytes())?;
        self.writer.flush()?;
        Ok(())
    }

    /// Send `line` followed by a newline.
    pub fn send_line(&mut self, line: &str) -> Result<(), ConsoleError> {
        self.send(&format!("{}\n", line))
    }

    /// Send a control character, e.g. `'d'` for Ctrl-D.
    pub fn send_control(&mut self, c: char) -> Result<(), ConsoleError> {
        let byte = (c.to_ascii_lowercase() as u8) & 0x1f;
        self.send(&char::from(byte).to_string())
    }

    /// Wait until one of `prompts` appears or `timeout` elapses.
    ///
    /// The match starting earliest in the output wins; on a tie the prompt
    /// listed first wins. Output up to the end of the match is consumed.
    /// Never returns a timeout before `timeout` has passed.
    pub fn expect(&mut self, prompts: &[Prompt], timeout: Duration) -> Result<Match, ConsoleError> {
        let deadline = Instant::now() + timeout;

        loop {
            self.drain_pending();

            if let Some((index, start, end)) = earliest_match(&self.buffer, prompts) {
                let text = self.buffer[start..end].to_string();
                self.buffer.drain(..end);
                debug!(console = %self.label, prompt = prompts[index].label(), "matched");
                self.last_match = Some(text.clone());
                return Ok(Match { index, text });
            }

            if !self.alive {
                return Err(ConsoleError::Closed {
                    expected: describe(prompts),
                    tail: self.tail(),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ConsoleError::Timeout {
                    expected: describe(prompts),
                    waited: timeout,
                    tail: self.tail(),
                });
            }

            match self.rx.recv_timeout((deadline - now).min(READ_SLICE)) {
                Ok(chunk) => self.push(&chunk),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => self.alive = false,
            }
        }
    }

    /// Wait for a single prompt and return the matched text.
    pub fn expect_one(&mut self, prompt: &Prompt, timeout: Duration) -> Result<String, ConsoleError> {
        self.expect(std::slice::from_ref(prompt), timeout)
            .map(|m| m.text)
    }

    /// Throw away everything received so far.
    pub fn clear(&mut self) {
        self.drain_pending();
        self.buffer.clear();
    }

    /// Wait for the owned child to exit, consuming its output meanwhile.
    ///
    /// Returns the exit code, `None` if it was killed by a signal.
    pub fn wait_exit(&mut self, timeout: Duration) -> Result<Option<i32>, ConsoleError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.drain_pending();
            if let Some(child) = self.child.as_mut() {
                if let Some(status) = child.try_wait()? {
                    self.child = None;
                    return Ok(status.code());
                }
            } else if !self.alive {
                return Ok(None);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ConsoleError::Timeout {
                    expected: "process exit".to_string(),
                    waited: timeout,
                    tail: self.tail(),
                });
            }
            match self.rx.recv_timeout((deadline - now).min(READ_SLICE)) {
                Ok(chunk) => self.push(&chunk),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.alive = false;
                    // Output is gone, the exit status may still be a moment away.
                    std::thread::sleep(READ_SLICE.min(deadline.saturating_duration_since(Instant::now())));
                }
            }
        }
    }

    /// Kill and reap the owned child, if any.
    pub fn close(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.alive = false;
    }

    fn drain_pending(&mut self) {
        while let Ok(chunk) = self.rx.try_recv() {
            self.push(&chunk);
        }
    }

    fn push(&mut self, chunk: &str) {
        trace!(console = %self.label, ?chunk, "recv");
        let text = self.stripper.push(chunk);
        self.buffer.push_str(&text);
        if self.buffer.len() > MAX_BUFFER {
            let mut cut = self.buffer.len() - MAX_BUFFER / 2;
            while !self.buffer.is_char_boundary(cut) {
                cut += 1;
            }
            self.buffer.drain(..cut);
        }
    }

    fn tail(&self) -> String {
        let skip = self.buffer.chars().count().saturating_sub(TAIL_CHARS);
        self.buffer.chars().skip(skip).collect()
    }
}

impl Drop for ConsoleSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn earliest_match(buffer: &str, prompts: &[Prompt]) -> Option<(usize, usize, usize)> {
    prompts
        .iter()
        .enumerate()
        .filter_map(|(i, p)| p.find(buffer).map(|(start, end)| (i, start, end)))
        .min_by_key(|&(i, start, _)| (start, i))
}

fn describe(prompts: &[Prompt]) -> String {
    prompts
        .iter()
        .map(|p| format!("'{}'", p.label()))
        .collect::<Vec<_>>()
        .join(" or ")
}
