//! Consumers at the end of the message bus.

pub mod crash;
pub mod registry;
pub mod reporters;
pub mod sink;
pub mod summary;
