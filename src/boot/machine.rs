//! Prompt-driven state machines.
//!
//! Each state of a console dialogue names what to send and which prompts
//! may follow. [`drive`] runs any such machine over a [`ConsoleSession`].

use std::fmt::Debug;
use std::time::Duration;

use tracing::debug;

use crate::console::{ConsoleError, ConsoleSession, Prompt};

/// Upper bound on transitions per run, so a device bouncing between two
/// prompts cannot loop forever.
const MAX_TRANSITIONS: usize = 16;

/// Something to write before waiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Line(String),
    Raw(String),
    Control(char),
}

impl Input {
    pub fn line(text: &str) -> Self {
        Self::Line(text.to_string())
    }

    fn apply(&self, session: &mut ConsoleSession) -> Result<(), ConsoleError> {
        match self {
            Self::Line(text) => session.send_line(text),
            Self::Raw(text) => session.send(text),
            Self::Control(c) => session.send_control(*c),
        }
    }
}

/// Where a matched prompt leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next<S> {
    Goto(S),
    /// The dialogue reached its goal.
    Done,
    /// The device is not there yet; try again later.
    NotReady,
}

/// What the machine ended with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    NotReady,
}

/// One state's behaviour.
#[derive(Debug)]
pub struct Transition<S> {
    pub send: Option<Input>,
    /// Prompts to wait for, checked with the usual earliest-match rule.
    pub arms: Vec<(Prompt, Next<S>)>,
    pub timeout: Duration,
    /// Taken without waiting when `arms` is empty.
    pub fallthrough: Next<S>,
}

impl<S> Transition<S> {
    pub fn expect(send: Option<Input>, arms: Vec<(Prompt, Next<S>)>, timeout: Duration) -> Self {
        Self {
            send,
            arms,
            timeout,
            fallthrough: Next::NotReady,
        }
    }

    /// Send and move on without reading anything.
    pub fn send_only(send: Input, then: Next<S>) -> Self {
        Self {
            send: Some(send),
            arms: Vec::new(),
            timeout: Duration::ZERO,
            fallthrough: then,
        }
    }
}

pub trait Machine {
    type State: Copy + Debug + PartialEq;

    fn initial(&self) -> Self::State;

    fn transition(&self, state: Self::State) -> Transition<Self::State>;
}

/// Run `machine` from its initial state until it finishes.
///
/// Console errors (a timeout on any expected prompt included) end the run
/// and are returned to the caller, which decides whether to retry.
pub fn drive<M: Machine>(machine: &M, session: &mut ConsoleSession) -> Result<Outcome, ConsoleError> {
    let mut state = machine.initial();
    for _ in 0..MAX_TRANSITIONS {
        let transition = machine.transition(state);
        if let Some(input) = &transition.send {
            input.apply(session)?;
        }

        let next = if transition.arms.is_empty() {
            transition.fallthrough
        } else {
            let prompts: Vec<Prompt> = transition.arms.iter().map(|(p, _)| p.clone()).collect();
            let m = session.expect(&prompts, transition.timeout)?;
            transition.arms[m.index].1
        };
        debug!(console = session.label(), from = ?state, to = ?next, "transition");

        match next {
            Next::Goto(s) => state = s,
            Next::Done => return Ok(Outcome::Done),
            Next::NotReady => return Ok(Outcome::NotReady),
        }
    }
    Ok(Outcome::NotReady)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedConsole;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Door {
        Knock,
        Answer,
        Leave,
    }

    struct Visit;

    impl Machine for Visit {
        type State = Door;

        fn initial(&self) -> Door {
            Door::Knock
        }

        fn transition(&self, state: Door) -> Transition<Door> {
            let t = Duration::from_millis(200);
            match state {
                Door::Knock => Transition::expect(
                    Some(Input::line("knock")),
                    vec![
                        (Prompt::literal("who is it?"), Next::Goto(Door::Answer)),
                        (Prompt::literal("go away"), Next::Goto(Door::Leave)),
                    ],
                    t,
                ),
                Door::Answer => Transition::expect(
                    Some(Input::line("me")),
                    vec![(Prompt::literal("come in"), Next::Done)],
                    t,
                ),
                Door::Leave => Transition::send_only(Input::line("bye"), Next::NotReady),
            }
        }
    }

    #[test]
    fn test_machine_reaches_done() {
        let mut session = ScriptedConsole::new()
            .on("knock", "who is it?")
            .on("me", "come in")
            .into_session("door");
        assert_eq!(drive(&Visit, &mut session).unwrap(), Outcome::Done);
    }

    #[test]
    fn test_fallthrough_state_sends_without_waiting() {
        let console = ScriptedConsole::new().on("knock", "go away");
        let sent = console.sent();
        let mut session = console.into_session("door");
        assert_eq!(drive(&Visit, &mut session).unwrap(), Outcome::NotReady);
        assert_eq!(sent.lock().unwrap().last().unwrap(), "bye\n");
    }

    #[test]
    fn test_missing_prompt_is_a_timeout() {
        let mut session = ScriptedConsole::new().on("knock", "who is it?").into_session("door");
        assert!(matches!(
            drive(&Visit, &mut session),
            Err(ConsoleError::Timeout { .. })
        ));
    }
}
