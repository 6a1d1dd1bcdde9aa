//! Runner and execution engines sharing one lifecycle state machine and one
//! token-dispatch table.

pub mod commands;
pub mod dispatcher;
pub mod error;
pub mod execution;
pub mod runner;
pub mod state;

/// Renders a wire address the way diagnostics print it.
pub(crate) fn loopback_uri(port: u16) -> String {
    format!("tcp://localhost:{port}/")
}
