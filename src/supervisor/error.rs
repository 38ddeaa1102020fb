//! Supervisor error type. Variants separate failures that leave the
//! supervisor idle from the one deliberately ambiguous outcome
//! ([`SupervisorError::StopTimeout`]).

use super::process::ProcessError;
use crate::protocol::RelayError;

#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    /// The server did not stop even after a forced kill. The stop request
    /// was accepted but teardown is still pending; use `wait_idle` or a
    /// done-waiter to learn when it finishes.
    #[error("server process did not stop even after manual kill. please check your server configuration")]
    StopTimeout,

    #[error("no open UDP connection found")]
    NoOpenUdpConnection,

    #[error("no race event to restart")]
    NothingToRestart,

    #[error("supervisor control loop is no longer running")]
    ControlLoopClosed,

    #[error("could not load server options: {0}")]
    Store(#[source] anyhow::Error),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::StopTimeout => "STOP_TIMEOUT",
            Self::NoOpenUdpConnection => "NO_OPEN_UDP_CONNECTION",
            Self::NothingToRestart => "NOTHING_TO_RESTART",
            Self::ControlLoopClosed => "CONTROL_LOOP_CLOSED",
            Self::Store(_) => "STORE_ERROR",
            Self::Relay(RelayError::InvalidAddress { .. }) => "INVALID_UDP_ADDRESS",
            Self::Relay(_) => "UDP_RELAY_ERROR",
            Self::Process(_) => "PROCESS_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }

    /// True when a session may still be running after this error.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::StopTimeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let parse = SupervisorError::from(RelayError::InvalidAddress {
            address: "not-an-address".into(),
            reason: "missing port in address".into(),
        });
        assert_eq!(parse.error_code(), "INVALID_UDP_ADDRESS");
        assert!(parse.to_string().contains("not-an-address"));

        assert_eq!(SupervisorError::from(RelayError::NotOpen).error_code(), "UDP_RELAY_ERROR");
        assert_eq!(SupervisorError::StopTimeout.error_code(), "STOP_TIMEOUT");
    }

    #[test]
    fn test_only_stop_timeout_is_ambiguous() {
        assert!(SupervisorError::StopTimeout.is_ambiguous());
        assert!(!SupervisorError::NoOpenUdpConnection.is_ambiguous());
        assert!(!SupervisorError::ControlLoopClosed.is_ambiguous());
    }
}
