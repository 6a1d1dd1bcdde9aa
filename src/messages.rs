//! Payloads carried over the wire and the diagnostic channel the engines
//! report protocol-level problems through.

pub mod diagnostics;
pub mod event;
pub mod ids;
