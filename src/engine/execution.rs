//! Connecting (worker) side of the protocol.
//!
//! The execution engine dials the runner, answers its `INFO`, and turns each
//! `FIND`/`RUN` into a task driving the [`ExecutionHost`]. Events the host
//! reports through its [`OperationReporter`] travel back as `MSG` frames.

use super::commands::{execution, runner, ExecutionEngineInfo, RunnerEngineInfo};
use super::dispatcher::CommandDispatcher;
use super::error::EngineError;
use super::loopback_uri;
use super::state::{disposal_action, EngineCore, EngineState};
use crate::messages::diagnostics::{DiagnosticSink, Diagnostics};
use crate::messages::event::{ErrorMessage, TestEvent};
use crate::runtime::config::EngineConfig;
use crate::runtime::fatal::panic_message;
use crate::runtime::telemetry::Telemetry;
use crate::transport::{split_on_separator, FrameHandler, FrameSender, FramedTransport};
use anyhow::Context;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashSet;
use std::io;
use std::net::Ipv4Addr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// `exceptionType` of the error event sent when a host operation fails.
pub const HOST_ERROR_TYPE: &str = "ExecutionHostError";
/// `exceptionType` of the error event sent when a host operation panics.
pub const HOST_PANIC_TYPE: &str = "ExecutionHostPanic";

pub type HostFuture = BoxFuture<'static, anyhow::Result<()>>;

/// The test framework living inside the worker process.
pub trait ExecutionHost: Send + Sync + 'static {
    fn test_assembly_unique_id(&self) -> String;

    fn test_framework_display_name(&self) -> String;

    /// Discovers tests, reporting each through `reporter`.
    fn find(&self, reporter: OperationReporter, filter: Option<String>) -> HostFuture;

    /// Runs tests, reporting each through `reporter`.
    fn run(&self, reporter: OperationReporter, filter: Option<String>) -> HostFuture;
}

#[derive(Default)]
struct OperationSet {
    executing: HashSet<String>,
    cancelled: HashSet<String>,
}

#[derive(Default)]
struct OperationTable {
    inner: Mutex<OperationSet>,
}

impl OperationTable {
    fn lock(&self) -> std::sync::MutexGuard<'_, OperationSet> {
        self.inner.lock().expect("operation table poisoned")
    }

    fn begin(&self, operation_id: &str) -> bool {
        self.lock().executing.insert(operation_id.to_owned())
    }

    fn finish(&self, operation_id: &str) {
        let mut set = self.lock();
        set.executing.remove(operation_id);
        set.cancelled.remove(operation_id);
    }

    fn cancel(&self, operation_id: &str) -> bool {
        let mut set = self.lock();
        if !set.executing.contains(operation_id) {
            return false;
        }
        set.cancelled.insert(operation_id.to_owned());
        true
    }

    fn is_cancelled(&self, operation_id: &str) -> bool {
        self.lock().cancelled.contains(operation_id)
    }
}

/// Handle a host uses to stream events for one operation.
#[derive(Clone)]
pub struct OperationReporter {
    operation_id: Arc<str>,
    sender: FrameSender,
    operations: Arc<OperationTable>,
}

impl OperationReporter {
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    /// Sends `event` as `MSG <op> <json>`. Returns `false` once the runner has
    /// cancelled this operation.
    pub fn report(&self, event: &TestEvent) -> bool {
        match event.to_json() {
            Ok(json) => {
                let parts = [self.operation_id.as_bytes(), json.as_bytes()];
                if let Err(err) = self.sender.send_frame(execution::MESSAGE, &parts) {
                    tracing::debug!(
                        operation = %self.operation_id,
                        error = %err,
                        "dropping event for closed connection"
                    );
                }
            }
            Err(err) => tracing::warn!(
                operation = %self.operation_id,
                kind = event.kind(),
                error = %err,
                "failed to serialize event"
            ),
        }
        !self.is_cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.operations.is_cancelled(&self.operation_id)
    }
}

#[derive(Debug, Clone, Copy)]
enum OperationKind {
    Find,
    Run,
}

impl OperationKind {
    fn verb(self) -> &'static str {
        match self {
            OperationKind::Find => "FIND",
            OperationKind::Run => "RUN",
        }
    }
}

pub struct ExecutionEngine {
    shared: Arc<ExecutionShared>,
}

struct ExecutionShared {
    core: EngineCore,
    config: EngineConfig,
    runner_port: u16,
    host: Arc<dyn ExecutionHost>,
    commands: CommandDispatcher<ExecutionShared>,
    sender: OnceLock<FrameSender>,
    operations: Arc<OperationTable>,
    quit: CancellationToken,
    telemetry: Arc<Telemetry>,
}

impl ExecutionEngine {
    pub fn new(
        config: EngineConfig,
        runner_port: u16,
        host: Arc<dyn ExecutionHost>,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Self {
        let core = EngineCore::new("ExecutionEngine", config.engine_id(), sink);
        let telemetry = Arc::new(Telemetry::default());
        let mut commands =
            CommandDispatcher::new(core.diagnostics().clone(), Arc::clone(&telemetry));
        commands.add_command_handler(runner::CANCEL, on_cancel);
        commands.add_command_handler(runner::FIND, |shared: &ExecutionShared, data| {
            start_operation(shared, OperationKind::Find, data)
        });
        commands.add_command_handler(runner::INFO, on_info);
        commands.add_command_handler(runner::QUIT, |shared: &ExecutionShared, _| {
            if let Some(sender) = shared.sender.get() {
                sender.expect_close();
            }
            shared.quit.cancel();
            Ok(())
        });
        commands.add_command_handler(runner::RUN, |shared: &ExecutionShared, data| {
            start_operation(shared, OperationKind::Run, data)
        });

        core.transition(EngineState::Initialized)
            .expect("a new engine starts in Unknown");

        Self {
            shared: Arc::new(ExecutionShared {
                core,
                config,
                runner_port,
                host,
                commands,
                sender: OnceLock::new(),
                operations: Arc::new(OperationTable::default()),
                quit: CancellationToken::new(),
                telemetry,
            }),
        }
    }

    /// Connects to the runner and begins negotiation. Returns the local port
    /// of the connection.
    pub async fn start(&self) -> Result<u16, EngineError> {
        let shared = &self.shared;
        {
            let mut guard = shared.core.lock();
            let state = guard.state();
            if state != EngineState::Initialized {
                return Err(EngineError::InvalidState {
                    operation: "start",
                    state,
                });
            }
            guard.set(EngineState::Connecting)?;
        }

        let diagnostics = shared.diagnostics().clone();
        let uri = loopback_uri(shared.runner_port);
        diagnostics.report(format!("Connecting to {uri}"));

        let connect_timeout = shared.config.connect_timeout();
        let connect = TcpStream::connect((Ipv4Addr::LOCALHOST, shared.runner_port));
        let stream = match tokio::time::timeout(connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(EngineError::Connect(err)),
            Err(_) => {
                return Err(EngineError::Connect(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no answer from {uri} within {connect_timeout:?}"),
                )))
            }
        };
        diagnostics.report(format!("Connected to {uri}"));

        let local_port = stream.local_addr().map_err(EngineError::Connect)?.port();
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(error = %err, "failed to disable nagle on worker socket");
        }

        let weak = Arc::downgrade(shared);
        let handler: FrameHandler = Arc::new(move |frame: Bytes| {
            if let Some(shared) = weak.upgrade() {
                shared.commands.process_request(&shared, frame);
            }
        });
        let transport_name = format!("execution::{}", shared.core.engine_id());

        let mut guard = shared.core.lock();
        let state = guard.state();
        if state.is_closing() {
            return Err(EngineError::AlreadyDisposed { state });
        }

        let transport = FramedTransport::start(
            transport_name.clone(),
            stream,
            handler,
            diagnostics.with_source(format!("FramedTransport({transport_name})")),
            Arc::clone(&shared.telemetry),
        );
        let _ = shared.sender.set(transport.sender());
        guard.track(
            "connection",
            disposal_action(move || async move {
                diagnostics.report(format!("Disconnecting from {uri}"));
                let closed = transport.shutdown().await;
                diagnostics.report(format!("Disconnected from {uri}"));
                if let Err(err) = closed {
                    tracing::debug!(error = %err, "worker transport closed with a fault");
                }
                Ok(())
            }),
        );
        guard.set(EngineState::Negotiating)?;

        Ok(local_port)
    }

    pub fn state(&self) -> EngineState {
        self.shared.core.state()
    }

    pub fn engine_id(&self) -> &str {
        self.shared.core.engine_id()
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        Arc::clone(&self.shared.telemetry)
    }

    /// Sends an event outside of any host callback. Returns `false` if the
    /// operation was cancelled or there is no connection.
    pub fn send_message(&self, operation_id: &str, event: &TestEvent) -> bool {
        let Some(sender) = self.shared.sender.get() else {
            self.shared
                .diagnostics()
                .report("SendMessage called when there is no connected runner");
            return false;
        };
        OperationReporter {
            operation_id: Arc::from(operation_id),
            sender: sender.clone(),
            operations: Arc::clone(&self.shared.operations),
        }
        .report(event)
    }

    pub fn quit_requested(&self) -> bool {
        self.shared.quit.is_cancelled()
    }

    /// Resolves once the runner sends `QUIT`.
    pub async fn wait_for_quit(&self) {
        self.shared.quit.cancelled().await;
    }

    pub async fn dispose(&self) -> Result<(), EngineError> {
        self.shared.core.dispose().await
    }
}

impl ExecutionShared {
    fn diagnostics(&self) -> &Diagnostics {
        self.core.diagnostics()
    }
}

fn on_info(shared: &ExecutionShared, data: Option<Bytes>) -> anyhow::Result<()> {
    if let Some(data) = data.filter(|data| !data.is_empty()) {
        match serde_json::from_slice::<RunnerEngineInfo>(&data) {
            Ok(info) if info.protocol_version != shared.config.protocol_version() => {
                shared.diagnostics().report(format!(
                    "Runner reports protocol version '{}' (expected '{}')",
                    info.protocol_version,
                    shared.config.protocol_version()
                ));
            }
            Ok(_) => {}
            Err(err) => shared
                .diagnostics()
                .report(format!("INFO payload from runner is not valid: {err}")),
        }
    }

    {
        let mut guard = shared.core.lock();
        let state = guard.state();
        if state != EngineState::Negotiating {
            shared.diagnostics().report(format!(
                "INFO message received outside of Negotiating state (current state is {state})"
            ));
            return Ok(());
        }
        guard.set(EngineState::Connected)?;
    }

    let info = ExecutionEngineInfo {
        protocol_version: shared.config.protocol_version().to_owned(),
        test_assembly_unique_id: shared.host.test_assembly_unique_id(),
        test_framework_display_name: shared.host.test_framework_display_name(),
    };
    let json = serde_json::to_vec(&info).context("failed to serialize engine info")?;
    let sender = shared
        .sender
        .get()
        .context("INFO received before the transport was ready")?;
    sender
        .send_frame(execution::INFO, &[json.as_slice()])
        .context("failed to reply to INFO")?;
    Ok(())
}

fn start_operation(
    shared: &ExecutionShared,
    kind: OperationKind,
    data: Option<Bytes>,
) -> anyhow::Result<()> {
    let verb = kind.verb();
    let state = shared.core.state();
    if state != EngineState::Connected {
        shared.diagnostics().report(format!(
            "Ignoring {verb} message received outside of Connected state (current state is {state})"
        ));
        return Ok(());
    }

    let (operation_id, filter) = match data {
        Some(data) => split_on_separator(&data),
        None => (Bytes::new(), None),
    };
    if operation_id.is_empty() {
        shared
            .diagnostics()
            .report(format!("{verb} data is missing the operation ID"));
        return Ok(());
    }
    let operation_id = String::from_utf8_lossy(&operation_id).into_owned();
    let filter = filter
        .filter(|filter| !filter.is_empty())
        .map(|filter| String::from_utf8_lossy(&filter).into_owned());

    if !shared.operations.begin(&operation_id) {
        shared.diagnostics().report(format!(
            "{verb} requested duplicate operation ID '{operation_id}'"
        ));
        return Ok(());
    }

    let Some(sender) = shared.sender.get().cloned() else {
        shared.operations.finish(&operation_id);
        anyhow::bail!("{verb} received before the transport was ready");
    };
    let reporter = OperationReporter {
        operation_id: Arc::from(operation_id.as_str()),
        sender,
        operations: Arc::clone(&shared.operations),
    };
    let host = Arc::clone(&shared.host);

    tracing::debug!(operation = %operation_id, verb, "starting host operation");
    tokio::spawn(async move {
        let host_reporter = reporter.clone();
        let outcome = AssertUnwindSafe(async move {
            match kind {
                OperationKind::Find => host.find(host_reporter, filter).await,
                OperationKind::Run => host.run(host_reporter, filter).await,
            }
        })
        .catch_unwind()
        .await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(ErrorMessage::from_error(HOST_ERROR_TYPE, &err)),
            Err(panic) => Some(ErrorMessage::new(
                HOST_PANIC_TYPE,
                panic_message(panic.as_ref()),
            )),
        };
        if let Some(error) = failure {
            reporter.report(&TestEvent::Error(error));
        }

        reporter.operations.finish(reporter.operation_id());
        tracing::debug!(operation = %reporter.operation_id(), verb, "host operation finished");
    });
    Ok(())
}

fn on_cancel(shared: &ExecutionShared, data: Option<Bytes>) -> anyhow::Result<()> {
    let state = shared.core.state();
    if state != EngineState::Connected {
        shared.diagnostics().report(format!(
            "Ignoring CANCEL message received outside of Connected state (current state is {state})"
        ));
        return Ok(());
    }

    let operation_id = match data {
        Some(data) => split_on_separator(&data).0,
        None => Bytes::new(),
    };
    if operation_id.is_empty() {
        shared
            .diagnostics()
            .report("CANCEL data is missing the operation ID");
        return Ok(());
    }
    let operation_id = String::from_utf8_lossy(&operation_id);

    if !shared.operations.cancel(&operation_id) {
        shared.diagnostics().report(format!(
            "CANCEL requested for unknown operation ID '{operation_id}'"
        ));
    }
    Ok(())
}
