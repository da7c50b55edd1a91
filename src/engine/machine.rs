use std::fmt;

use tracing::trace;

use super::error::DecodeError;

/// A decoder's finite set of protocol states.
pub trait MachineState: Copy + Eq + fmt::Debug {
    fn initial() -> Self;

    fn is_terminal(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance<S, O> {
    Moved { from: S, to: S, output: O },
    /// The machine is terminal; the transition was not evaluated.
    Halted(S),
}

/// Drives one flow's state machine.
///
/// A failed transition leaves the state untouched, and a terminal state is never
/// left again. The session only calls [`advance`](Machine::advance) on a frame's
/// first pass; replays render from the entry state stored in the frame memo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine<S> {
    state: S,
    last_frame: Option<u64>,
    transitions: u32,
}

impl<S: MachineState> Default for Machine<S> {
    fn default() -> Self {
        Self {
            state: S::initial(),
            last_frame: None,
            transitions: 0,
        }
    }
}

impl<S: MachineState> Machine<S> {
    /// A machine that starts in `state`, for flows whose earlier negotiation
    /// happened on another flow.
    pub fn at(state: S) -> Self {
        Self {
            state,
            last_frame: None,
            transitions: 0,
        }
    }

    pub fn state(&self) -> S {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn last_frame(&self) -> Option<u64> {
        self.last_frame
    }

    pub fn transitions(&self) -> u32 {
        self.transitions
    }

    pub fn advance<O, F>(&mut self, frame: u64, transition: F) -> Result<Advance<S, O>, DecodeError>
    where
        F: FnOnce(S) -> Result<(S, O), DecodeError>,
    {
        let from = self.state;
        if from.is_terminal() {
            return Ok(Advance::Halted(from));
        }

        let (to, output) = transition(from)?;
        trace!(frame, ?from, ?to, "state transition");
        self.state = to;
        self.last_frame = Some(frame);
        self.transitions += 1;
        Ok(Advance::Moved { from, to, output })
    }
}
