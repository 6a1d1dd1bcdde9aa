//! Listening side of the protocol.
//!
//! The runner binds an ephemeral loopback port, accepts exactly one worker
//! connection, negotiates with `INFO`, and from then on forwards every `MSG`
//! event to the caller's dispatcher. When the dispatcher asks to stop, the
//! runner sends a single `CANCEL` for the operation that produced the event.

use super::commands::{execution, runner, ExecutionEngineInfo, RunnerEngineInfo};
use super::dispatcher::CommandDispatcher;
use super::error::EngineError;
use super::loopback_uri;
use super::state::{disposal_action, EngineCore, EngineState};
use crate::messages::diagnostics::{DiagnosticSink, Diagnostics};
use crate::messages::event::TestEvent;
use crate::runtime::config::EngineConfig;
use crate::runtime::telemetry::Telemetry;
use crate::transport::{split_on_separator, FrameHandler, FrameSender, FramedTransport};
use anyhow::Context;
use bytes::Bytes;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::select;
use tokio_util::sync::CancellationToken;

/// Receives every event the worker reports, tagged with its operation ID.
/// Returning `false` asks the worker to cancel that operation.
pub type MessageDispatcher = Arc<dyn Fn(&str, TestEvent) -> bool + Send + Sync>;

pub struct RunnerEngine {
    shared: Arc<RunnerShared>,
}

struct RunnerShared {
    core: EngineCore,
    config: EngineConfig,
    commands: CommandDispatcher<RunnerShared>,
    dispatcher: MessageDispatcher,
    sender: OnceLock<FrameSender>,
    info: Mutex<Option<ExecutionEngineInfo>>,
    port: OnceLock<u16>,
    cancel_sent: AtomicBool,
    quit_sent: AtomicBool,
    telemetry: Arc<Telemetry>,
}

impl RunnerEngine {
    pub fn new(
        config: EngineConfig,
        dispatcher: MessageDispatcher,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Self {
        let core = EngineCore::new("RunnerEngine", config.engine_id(), sink);
        let telemetry = Arc::new(Telemetry::default());
        let mut commands =
            CommandDispatcher::new(core.diagnostics().clone(), Arc::clone(&telemetry));
        commands.add_command_handler(execution::INFO, on_info);
        commands.add_command_handler(execution::MESSAGE, on_message);

        core.transition(EngineState::Initialized)
            .expect("a new engine starts in Unknown");

        Self {
            shared: Arc::new(RunnerShared {
                core,
                config,
                commands,
                dispatcher,
                sender: OnceLock::new(),
                info: Mutex::new(None),
                port: OnceLock::new(),
                cancel_sent: AtomicBool::new(false),
                quit_sent: AtomicBool::new(false),
                telemetry,
            }),
        }
    }

    /// Binds `127.0.0.1:0` and starts waiting for the worker. Returns the
    /// port the worker should connect to. Must be called within a tokio runtime.
    pub fn start(&self) -> Result<u16, EngineError> {
        let shared = &self.shared;
        let port = {
            let mut guard = shared.core.lock();
            let state = guard.state();
            if state != EngineState::Initialized {
                return Err(EngineError::InvalidState {
                    operation: "start",
                    state,
                });
            }

            let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
                .map_err(EngineError::Bind)?;
            listener.set_nonblocking(true).map_err(EngineError::Bind)?;
            let port = listener.local_addr().map_err(EngineError::Bind)?.port();
            let listener = TcpListener::from_std(listener).map_err(EngineError::Bind)?;
            let _ = shared.port.set(port);
            guard.set(EngineState::Listening)?;

            let stop = CancellationToken::new();
            let accept = tokio::spawn(accept_connection(
                Arc::clone(shared),
                listener,
                stop.clone(),
            ));
            guard.track(
                "listener",
                disposal_action(move || async move {
                    stop.cancel();
                    accept.await.context("accept task failed")?;
                    Ok(())
                }),
            );
            port
        };

        shared
            .core
            .diagnostics()
            .report(format!("Listening on {}", loopback_uri(port)));
        Ok(port)
    }

    pub fn state(&self) -> EngineState {
        self.shared.core.state()
    }

    pub fn engine_id(&self) -> &str {
        self.shared.core.engine_id()
    }

    /// Listening port, once [`RunnerEngine::start`] has succeeded.
    pub fn port(&self) -> Option<u16> {
        self.shared.port.get().copied()
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        Arc::clone(&self.shared.telemetry)
    }

    /// Whatever the worker last announced, if anything.
    pub fn execution_engine_info(&self) -> Option<ExecutionEngineInfo> {
        self.shared
            .info
            .lock()
            .expect("engine info poisoned")
            .clone()
    }

    pub fn test_assembly_unique_id(&self) -> Result<String, EngineError> {
        self.connected_info()
            .map(|info| info.test_assembly_unique_id)
    }

    pub fn test_framework_display_name(&self) -> Result<String, EngineError> {
        self.connected_info()
            .map(|info| info.test_framework_display_name)
    }

    fn connected_info(&self) -> Result<ExecutionEngineInfo, EngineError> {
        let state = self.state();
        if state != EngineState::Connected {
            return Err(EngineError::NotConnected { state });
        }
        self.execution_engine_info()
            .ok_or(EngineError::NotConnected { state })
    }

    /// Resolves once negotiation completes. Fails on timeout or if the engine
    /// is disposed first.
    pub async fn wait_for_connection(&self, timeout: Duration) -> Result<(), EngineError> {
        match self
            .shared
            .core
            .wait_for(EngineState::Connected, timeout)
            .await?
        {
            EngineState::Connected => Ok(()),
            state => Err(EngineError::NotConnected { state }),
        }
    }

    pub fn send_find(&self, operation_id: &str, filter: Option<&str>) {
        self.shared
            .send_operation("SendFind", runner::FIND, operation_id, filter);
    }

    pub fn send_run(&self, operation_id: &str, filter: Option<&str>) {
        self.shared
            .send_operation("SendRun", runner::RUN, operation_id, filter);
    }

    pub fn send_cancel(&self, operation_id: &str) {
        self.shared
            .send_operation("SendCancel", runner::CANCEL, operation_id, None);
    }

    pub fn send_quit(&self) {
        self.shared.send_quit();
    }

    /// Sends `QUIT` if it has not been sent, closes the connection and stops
    /// listening.
    pub async fn dispose(&self) -> Result<(), EngineError> {
        self.shared.core.dispose().await
    }
}

impl RunnerShared {
    fn diagnostics(&self) -> &Diagnostics {
        self.core.diagnostics()
    }

    fn send_command(&self, verb: &str, token: &[u8], parts: &[&[u8]]) -> bool {
        let Some(sender) = self.sender.get() else {
            self.diagnostics().report(format!(
                "{verb} called when there is no connected execution engine"
            ));
            return false;
        };

        match sender.send_frame(token, parts) {
            Ok(()) => true,
            Err(err) => {
                self.diagnostics().warn(format!("{verb} failed: {err}"));
                false
            }
        }
    }

    fn send_operation(&self, verb: &str, token: &[u8], operation_id: &str, filter: Option<&str>) {
        if operation_id.is_empty() || operation_id.contains([' ', '\n']) {
            self.diagnostics()
                .report(format!("{verb} called with invalid operation ID '{operation_id}'"));
            return;
        }

        match filter {
            Some(filter) if filter.contains('\n') => {
                self.diagnostics()
                    .report(format!("{verb} called with a filter containing a newline"));
            }
            Some(filter) => {
                self.send_command(verb, token, &[operation_id.as_bytes(), filter.as_bytes()]);
            }
            None => {
                self.send_command(verb, token, &[operation_id.as_bytes()]);
            }
        }
    }

    fn send_quit(&self) {
        if let Some(sender) = self.sender.get() {
            sender.expect_close();
        }
        if self.send_command("SendQuit", runner::QUIT, &[]) {
            self.quit_sent.store(true, Ordering::SeqCst);
        }
    }
}

async fn accept_connection(
    shared: Arc<RunnerShared>,
    listener: TcpListener,
    stop: CancellationToken,
) {
    let accepted = select! {
        _ = stop.cancelled() => return,
        accepted = listener.accept() => accepted,
    };
    drop(listener);

    let diagnostics = shared.diagnostics().clone();
    let (stream, remote) = match accepted {
        Ok(pair) => pair,
        Err(err) => {
            diagnostics.warn(format!("Failed to accept connection: {err}"));
            return;
        }
    };
    diagnostics.report(format!(
        "Connection accepted from {}",
        loopback_uri(remote.port())
    ));
    if let Err(err) = stream.set_nodelay(true) {
        tracing::debug!(error = %err, "failed to disable nagle on runner socket");
    }

    let transport_name = format!("runner::{}", shared.core.engine_id());
    let weak = Arc::downgrade(&shared);
    let handler: FrameHandler = Arc::new(move |frame: Bytes| {
        if let Some(shared) = weak.upgrade() {
            shared.commands.process_request(&shared, frame);
        }
    });
    let remote_port = remote.port();

    // The reader may deliver INFO as soon as it is spawned; its handler waits
    // on the state lock until Negotiating is set.
    let sender = {
        let mut guard = shared.core.lock();
        if guard.state().is_closing() {
            None
        } else {
            let transport = FramedTransport::start(
                transport_name.clone(),
                stream,
                handler,
                diagnostics.with_source(format!("FramedTransport({transport_name})")),
                Arc::clone(&shared.telemetry),
            );
            let sender = transport.sender();
            let _ = shared.sender.set(sender.clone());

            let socket_diagnostics = diagnostics.clone();
            guard.track(
                "socket",
                disposal_action(move || async move {
                    let uri = loopback_uri(remote_port);
                    socket_diagnostics.report(format!("Disconnecting from {uri}"));
                    socket_diagnostics.report(format!("Disconnected from {uri}"));
                    Ok(())
                }),
            );

            let weak = Arc::downgrade(&shared);
            guard.track(
                "transport",
                disposal_action(move || async move {
                    if let Some(shared) = weak.upgrade() {
                        if !shared.quit_sent.load(Ordering::SeqCst) {
                            shared.send_quit();
                        }
                    }
                    if let Err(err) = transport.shutdown().await {
                        tracing::debug!(error = %err, "runner transport closed with a fault");
                    }
                    Ok(())
                }),
            );

            if let Err(err) = guard.set(EngineState::Negotiating) {
                diagnostics.warn(format!("Cannot begin negotiation: {err}"));
            }
            Some(sender)
        }
    };

    let Some(sender) = sender else {
        diagnostics.report("Dropping connection accepted during disposal");
        return;
    };

    let info = RunnerEngineInfo {
        protocol_version: shared.config.protocol_version().to_owned(),
    };
    match serde_json::to_vec(&info) {
        Ok(json) => {
            if let Err(err) = sender.send_frame(runner::INFO, &[json.as_slice()]) {
                diagnostics.warn(format!("Failed to send INFO: {err}"));
            }
        }
        Err(err) => diagnostics.warn(format!("Failed to serialize INFO: {err}")),
    }
}

fn on_info(shared: &RunnerShared, data: Option<Bytes>) -> anyhow::Result<()> {
    let Some(data) = data.filter(|data| !data.is_empty()) else {
        shared.diagnostics().report("INFO data is missing the JSON");
        return Ok(());
    };

    let info: ExecutionEngineInfo =
        serde_json::from_slice(&data).context("INFO payload is not valid engine info")?;
    if info.protocol_version != shared.config.protocol_version() {
        shared.diagnostics().report(format!(
            "Execution engine reports protocol version '{}' (expected '{}')",
            info.protocol_version,
            shared.config.protocol_version()
        ));
    }
    *shared.info.lock().expect("engine info poisoned") = Some(info);

    let mut guard = shared.core.lock();
    let state = guard.state();
    if state != EngineState::Negotiating {
        shared.diagnostics().report(format!(
            "INFO message received outside of Negotiating state (current state is {state})"
        ));
        return Ok(());
    }
    guard.set(EngineState::Connected)?;
    Ok(())
}

fn on_message(shared: &RunnerShared, data: Option<Bytes>) -> anyhow::Result<()> {
    let state = shared.core.state();
    if state != EngineState::Connected {
        shared.diagnostics().report(format!(
            "MSG message received before we reached Connected state (current state is {state})"
        ));
    }

    let Some(data) = data.filter(|data| !data.is_empty()) else {
        shared
            .diagnostics()
            .report("MSG data is missing the operation ID");
        return Ok(());
    };
    let (operation_id, json) = split_on_separator(&data);
    let Some(json) = json.filter(|json| !json.is_empty()) else {
        shared.diagnostics().report("MSG data is missing the JSON");
        return Ok(());
    };

    let operation_id = String::from_utf8_lossy(&operation_id).into_owned();
    let event = TestEvent::from_json(&json).with_context(|| {
        format!("MSG payload for operation '{operation_id}' is not a valid test event")
    })?;
    shared.telemetry.record_event_dispatched();

    let keep_running = (shared.dispatcher)(&operation_id, event);
    if !keep_running && !shared.cancel_sent.swap(true, Ordering::SeqCst) {
        shared.send_command("SendCancel", runner::CANCEL, &[operation_id.as_bytes()]);
    }
    Ok(())
}
