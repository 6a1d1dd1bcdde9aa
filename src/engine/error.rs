use super::state::EngineState;
use crate::transport::TransportError;
use std::io;

#[derive(Debug)]
pub enum EngineError {
    /// An operation was attempted from a state that does not allow it.
    InvalidState {
        operation: &'static str,
        state: EngineState,
    },
    /// A transition would not move the lifecycle strictly forward.
    InvalidTransition { from: EngineState, to: EngineState },
    AlreadyDisposed { state: EngineState },
    /// A value that is only known after negotiation was requested too early.
    NotConnected { state: EngineState },
    Bind(io::Error),
    Connect(io::Error),
    Timeout { waiting_for: EngineState },
    Transport(TransportError),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidState { operation, state } => {
                write!(f, "cannot call {operation} in state {state}")
            }
            EngineError::InvalidTransition { from, to } => {
                write!(f, "invalid engine state transition from {from} to {to}")
            }
            EngineError::AlreadyDisposed { state } => {
                write!(f, "engine is already disposed (state {state})")
            }
            EngineError::NotConnected { state } => {
                write!(f, "engine is not connected (state {state})")
            }
            EngineError::Bind(err) => write!(f, "failed to bind loopback listener: {err}"),
            EngineError::Connect(err) => write!(f, "failed to connect to runner: {err}"),
            EngineError::Timeout { waiting_for } => {
                write!(f, "timed out waiting for engine state {waiting_for}")
            }
            EngineError::Transport(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Bind(err) | EngineError::Connect(err) => Some(err),
            EngineError::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<TransportError> for EngineError {
    fn from(err: TransportError) -> Self {
        EngineError::Transport(err)
    }
}
