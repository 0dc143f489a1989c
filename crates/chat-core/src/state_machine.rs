use crate::{
    error::ChatError,
    types::{CaseStatus, ThreadState},
};

/// Inbound signal that may move a thread forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadTransition {
    /// Thread metadata was fetched.
    MetadataLoaded,
    /// Full recovery (messages, agent, fields) completed.
    Recovered,
    /// Backend case status changed.
    StatusChanged(CaseStatus),
    /// An agent was assigned or unassigned.
    AssigneeChanged,
    /// Local or remote close (archive confirmation, synthesized update).
    Closed,
}

impl ThreadState {
    fn rank(self) -> u8 {
        match self {
            ThreadState::Pending => 0,
            ThreadState::Loaded => 1,
            ThreadState::Ready => 2,
            ThreadState::Closed => 3,
        }
    }
}

/// Forward-only thread state machine.
///
/// `Pending → Loaded → Ready`, `Closed` reachable from anywhere and terminal.
/// Stale or backward transitions are ignored rather than rejected, since
/// they come from reordered wire events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadStateMachine {
    state: ThreadState,
}

impl Default for ThreadStateMachine {
    fn default() -> Self {
        Self {
            state: ThreadState::Pending,
        }
    }
}

impl ThreadStateMachine {
    pub fn new(state: ThreadState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    /// Target state for a transition, independent of the current state.
    pub fn target(transition: ThreadTransition) -> Option<ThreadState> {
        match transition {
            ThreadTransition::MetadataLoaded => Some(ThreadState::Loaded),
            ThreadTransition::Recovered | ThreadTransition::AssigneeChanged => {
                Some(ThreadState::Ready)
            }
            ThreadTransition::StatusChanged(CaseStatus::Closed) | ThreadTransition::Closed => {
                Some(ThreadState::Closed)
            }
            ThreadTransition::StatusChanged(_) => Some(ThreadState::Loaded),
        }
    }

    /// Apply a transition; returns the new state when it changed.
    pub fn apply(&mut self, transition: ThreadTransition) -> Option<ThreadState> {
        let next = Self::target(transition)?;
        self.advance_to(next)
    }

    /// Move to `next` if that is a forward step.
    pub fn advance_to(&mut self, next: ThreadState) -> Option<ThreadState> {
        if self.state == ThreadState::Closed || next.rank() <= self.state.rank() {
            return None;
        }
        self.state = next;
        Some(next)
    }

    /// Fail unless the machine is in `expected`.
    pub fn require(&self, expected: ThreadState, action: &str) -> Result<(), ChatError> {
        if self.state != expected {
            return Err(ChatError::invalid_state(self.state, action));
        }
        Ok(())
    }
}
