pub mod config;
pub mod fatal;
pub mod telemetry;
