use thiserror::Error;

/// Control-loop state of the supervised server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Launching,
    Active,
    /// Cancellation sent, waiting for the server to exit
    Stopping,
    TearingDown,
}

#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("invalid transition: {0:?} -> {1:?}")]
    InvalidTransition(State, State),
}

pub struct StateMachine {
    pub state: State,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self { state: State::Idle }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn can_transition(&self, to: &State) -> bool {
        matches!(
            (&self.state, to),
            (State::Idle, State::Launching)
                | (State::Launching, State::Active)
                | (State::Launching, State::Idle)
                | (State::Active, State::Stopping)
                | (State::Active, State::TearingDown)
                | (State::Stopping, State::TearingDown)
                | (State::TearingDown, State::Idle)
        )
    }

    pub fn transition(&mut self, to: State) -> Result<(), TransitionError> {
        if self.can_transition(&to) {
            tracing::debug!("State transition: {:?} -> {:?}", self.state, to);
            self.state = to;
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition(self.state, to))
        }
    }
}
