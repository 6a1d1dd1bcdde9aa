use crate::engine::commands::PROTOCOL_VERSION;
use anyhow::{bail, Context, Result};
use std::time::Duration;

const DEFAULT_CRASH_DRAIN_TIMEOUT_MS: u64 = 100;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Settings shared by the runner and execution engines and by the sinks that
/// sit behind them.
///
/// All instances must be constructed via [`EngineConfig::builder`] or [`EngineConfig::new`]
/// so invariants are validated before any engine observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    engine_id: String,
    protocol_version: String,
    crash_drain_timeout: Duration,
    stop_on_fail: bool,
    connect_timeout: Duration,
}

pub struct EngineConfigParams {
    pub engine_id: String,
    pub protocol_version: String,
    pub crash_drain_timeout: Duration,
    pub stop_on_fail: bool,
    pub connect_timeout: Duration,
}

impl EngineConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    pub fn new(params: EngineConfigParams) -> Result<Self> {
        let EngineConfigParams {
            engine_id,
            protocol_version,
            crash_drain_timeout,
            stop_on_fail,
            connect_timeout,
        } = params;

        let config = Self {
            engine_id: trimmed_string(engine_id),
            protocol_version: trimmed_string(protocol_version),
            crash_drain_timeout,
            stop_on_fail,
            connect_timeout,
        };

        config.validate()?;
        Ok(config)
    }

    /// Label used in every diagnostic line the engine emits, e.g. `1r`.
    pub fn engine_id(&self) -> &str {
        &self.engine_id
    }

    /// Protocol version announced during negotiation.
    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    /// How long the crash detection sink waits for a late finish event after
    /// the worker process exits.
    pub fn crash_drain_timeout(&self) -> Duration {
        self.crash_drain_timeout
    }

    /// Whether the first failed test flips the message bus into its stopped state.
    pub fn stop_on_fail(&self) -> bool {
        self.stop_on_fail
    }

    /// Upper bound on the worker's TCP connect attempt.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        ensure_not_empty(&self.engine_id, "engine_id")?;
        ensure_not_empty(&self.protocol_version, "protocol_version")?;

        if self.engine_id.bytes().any(|b| b == b' ' || b == b'\n') {
            bail!("engine_id cannot contain spaces or newlines");
        }

        if self.crash_drain_timeout.is_zero() {
            bail!("crash_drain_timeout must be greater than 0");
        }

        if self.connect_timeout.is_zero() {
            bail!("connect_timeout must be greater than 0");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct EngineConfigBuilder {
    engine_id: Option<String>,
    protocol_version: Option<String>,
    crash_drain_timeout: Option<Duration>,
    stop_on_fail: Option<bool>,
    connect_timeout: Option<Duration>,
}

impl EngineConfigBuilder {
    pub fn engine_id(mut self, id: impl Into<String>) -> Self {
        self.engine_id = Some(id.into());
        self
    }

    pub fn protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = Some(version.into());
        self
    }

    pub fn crash_drain_timeout(mut self, timeout: Duration) -> Self {
        self.crash_drain_timeout = Some(timeout);
        self
    }

    pub fn stop_on_fail(mut self, enabled: bool) -> Self {
        self.stop_on_fail = Some(enabled);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<EngineConfig> {
        let params = EngineConfigParams {
            engine_id: self.engine_id.context("engine_id is required")?,
            protocol_version: self
                .protocol_version
                .unwrap_or_else(|| PROTOCOL_VERSION.to_owned()),
            crash_drain_timeout: self
                .crash_drain_timeout
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_CRASH_DRAIN_TIMEOUT_MS)),
            stop_on_fail: self.stop_on_fail.unwrap_or(false),
            connect_timeout: self
                .connect_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS)),
        };

        EngineConfig::new(params)
    }
}

fn trimmed_string(value: String) -> String {
    value.trim().to_owned()
}

fn ensure_not_empty(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("{field} cannot be empty");
    }
    Ok(())
}
