use std::sync::Arc;

use crate::support::{
    helpers::{config, init_tracing, RecordingDiagnostics, StaticHost, WAIT},
    simulated_worker::SimulatedWorker,
};
use anyhow::Result;
use testwire::{EngineState, ExecutionEngine, MessageDispatcher, RunnerEngine, TestEvent};

fn ignore_events() -> MessageDispatcher {
    Arc::new(|_: &str, _: TestEvent| true)
}

#[tokio::test]
async fn runner_connects_to_minimal_worker() -> Result<()> {
    init_tracing();
    let runner = RunnerEngine::new(
        config("r1"),
        ignore_events(),
        Arc::new(RecordingDiagnostics::default()),
    );
    let port = runner.start()?;

    let mut worker = SimulatedWorker::connect(port).await?;
    assert_eq!(worker.next_line().await?, r#"INFO {"protocolVersion":"1.0"}"#);
    worker.send_line(r#"INFO {"protocolVersion":"1.0"}"#).await?;

    runner.wait_for_connection(WAIT).await?;
    assert_eq!(runner.state(), EngineState::Connected);
    let info = runner
        .execution_engine_info()
        .expect("info is stored once connected");
    assert_eq!(info.protocol_version, "1.0");
    assert_eq!(runner.test_assembly_unique_id()?, "");

    runner.dispose().await?;
    Ok(())
}

#[tokio::test]
async fn runner_session_diagnostics_and_quit_on_dispose() -> Result<()> {
    init_tracing();
    let diagnostics = Arc::new(RecordingDiagnostics::default());
    let runner = RunnerEngine::new(config("r2"), ignore_events(), diagnostics.clone());
    let port = runner.start()?;

    let mut worker = SimulatedWorker::connect(port).await?;
    worker.negotiate("asm-7").await?;
    runner.wait_for_connection(WAIT).await?;
    assert_eq!(runner.test_assembly_unique_id()?, "asm-7");
    assert_eq!(runner.test_framework_display_name()?, "simulated");

    runner.dispose().await?;
    assert_eq!(worker.next_line().await?, "QUIT");
    worker.expect_eof().await?;

    let uri = format!("tcp://localhost:{port}/");
    let expected = vec![
        "RunnerEngine(r2): Engine state transition from Unknown to Initialized".to_string(),
        "RunnerEngine(r2): Engine state transition from Initialized to Listening".to_string(),
        format!("RunnerEngine(r2): Listening on {uri}"),
        format!(
            "RunnerEngine(r2): Connection accepted from tcp://localhost:{}/",
            worker.local_port()
        ),
        "RunnerEngine(r2): Engine state transition from Listening to Negotiating".to_string(),
        "RunnerEngine(r2): Engine state transition from Negotiating to Connected".to_string(),
        "RunnerEngine(r2): Engine state transition from Connected to Disconnecting".to_string(),
        format!(
            "RunnerEngine(r2): Disconnecting from tcp://localhost:{}/",
            worker.local_port()
        ),
        format!(
            "RunnerEngine(r2): Disconnected from tcp://localhost:{}/",
            worker.local_port()
        ),
        "RunnerEngine(r2): Engine state transition from Disconnecting to Disconnected".to_string(),
    ];
    assert_eq!(diagnostics.lines(), expected);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn info_sent_immediately_after_connecting_completes_negotiation() -> Result<()> {
    init_tracing();
    for round in 0..50 {
        let diagnostics = Arc::new(RecordingDiagnostics::default());
        let runner = RunnerEngine::new(
            config(&format!("eager{round}")),
            ignore_events(),
            diagnostics.clone(),
        );
        let port = runner.start()?;

        let mut worker = SimulatedWorker::connect(port).await?;
        worker.reply_info("asm-eager").await?;
        runner.wait_for_connection(WAIT).await?;
        assert_eq!(worker.next_line().await?, r#"INFO {"protocolVersion":"1.0"}"#);
        assert_eq!(runner.test_assembly_unique_id()?, "asm-eager");
        assert!(!diagnostics.contains("outside of Negotiating"));

        runner.dispose().await?;
    }
    Ok(())
}

#[tokio::test]
async fn worker_vanishing_first_is_an_unclean_shutdown() -> Result<()> {
    init_tracing();
    let diagnostics = Arc::new(RecordingDiagnostics::default());
    let runner = RunnerEngine::new(config("r8"), ignore_events(), diagnostics.clone());
    let runner_port = runner.start()?;
    let worker = ExecutionEngine::new(
        config("w8"),
        runner_port,
        Arc::new(StaticHost::new("asm-8", 0)),
        Arc::new(RecordingDiagnostics::default()),
    );
    let execution_port = worker.start().await?;
    runner.wait_for_connection(WAIT).await?;

    worker.dispose().await?;
    diagnostics
        .wait_for_line("FramedTransport(runner::r8): remote end closed the connection")
        .await?;
    runner.dispose().await?;

    let lines = diagnostics.lines();
    let worker_uri = format!("tcp://localhost:{execution_port}/");
    assert_eq!(
        lines[..7],
        [
            "RunnerEngine(r8): Engine state transition from Unknown to Initialized".to_string(),
            "RunnerEngine(r8): Engine state transition from Initialized to Listening".to_string(),
            format!("RunnerEngine(r8): Listening on tcp://localhost:{runner_port}/"),
            format!("RunnerEngine(r8): Connection accepted from {worker_uri}"),
            "RunnerEngine(r8): Engine state transition from Listening to Negotiating".to_string(),
            "RunnerEngine(r8): Engine state transition from Negotiating to Connected".to_string(),
            "FramedTransport(runner::r8): remote end closed the connection".to_string(),
        ]
    );
    assert_eq!(
        lines[7],
        "RunnerEngine(r8): Engine state transition from Connected to Disconnecting"
    );
    assert!(
        lines[8].starts_with("FramedTransport(runner::r8): abnormal termination of pipe"),
        "{}",
        lines[8]
    );
    assert_eq!(
        lines[9..],
        [
            format!("RunnerEngine(r8): Disconnecting from {worker_uri}"),
            format!("RunnerEngine(r8): Disconnected from {worker_uri}"),
            "RunnerEngine(r8): Engine state transition from Disconnecting to Disconnected"
                .to_string(),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn explicit_quit_is_not_repeated_on_dispose() -> Result<()> {
    init_tracing();
    let runner = RunnerEngine::new(
        config("r3"),
        ignore_events(),
        Arc::new(RecordingDiagnostics::default()),
    );
    let port = runner.start()?;
    let mut worker = SimulatedWorker::connect(port).await?;
    worker.negotiate("asm").await?;
    runner.wait_for_connection(WAIT).await?;

    runner.send_find("op-1", Some("class=Sample"));
    runner.send_quit();
    runner.dispose().await?;

    assert_eq!(worker.next_line().await?, "FIND op-1 class=Sample");
    assert_eq!(worker.next_line().await?, "QUIT");
    worker.expect_eof().await?;
    Ok(())
}

#[tokio::test]
async fn unknown_command_keeps_the_connection() -> Result<()> {
    init_tracing();
    let diagnostics = Arc::new(RecordingDiagnostics::default());
    let runner = RunnerEngine::new(config("r4"), ignore_events(), diagnostics.clone());
    let port = runner.start()?;
    let mut worker = SimulatedWorker::connect(port).await?;
    worker.negotiate("asm").await?;
    runner.wait_for_connection(WAIT).await?;

    worker.send_line("TELEMETRY 1 {}").await?;
    diagnostics
        .wait_for_line("RunnerEngine(r4): Received unknown command 'TELEMETRY'")
        .await?;
    assert_eq!(runner.state(), EngineState::Connected);

    runner.send_run("op-2", None);
    assert_eq!(worker.next_line().await?, "RUN op-2");
    assert_eq!(runner.telemetry().snapshot().unknown_commands, 1);

    runner.dispose().await?;
    Ok(())
}

#[tokio::test]
async fn worker_session_diagnostics() -> Result<()> {
    init_tracing();
    let runner = RunnerEngine::new(
        config("r5"),
        ignore_events(),
        Arc::new(RecordingDiagnostics::default()),
    );
    let port = runner.start()?;

    let diagnostics = Arc::new(RecordingDiagnostics::default());
    let worker = ExecutionEngine::new(
        config("w5"),
        port,
        Arc::new(StaticHost::new("asm-5", 0)),
        diagnostics.clone(),
    );
    worker.start().await?;
    runner.wait_for_connection(WAIT).await?;
    assert_eq!(worker.state(), EngineState::Connected);
    assert_eq!(runner.test_assembly_unique_id()?, "asm-5");
    assert_eq!(runner.test_framework_display_name()?, "sample framework");

    worker.dispose().await?;
    runner.dispose().await?;

    let uri = format!("tcp://localhost:{port}/");
    let expected = vec![
        "ExecutionEngine(w5): Engine state transition from Unknown to Initialized".to_string(),
        "ExecutionEngine(w5): Engine state transition from Initialized to Connecting".to_string(),
        format!("ExecutionEngine(w5): Connecting to {uri}"),
        format!("ExecutionEngine(w5): Connected to {uri}"),
        "ExecutionEngine(w5): Engine state transition from Connecting to Negotiating".to_string(),
        "ExecutionEngine(w5): Engine state transition from Negotiating to Connected".to_string(),
        "ExecutionEngine(w5): Engine state transition from Connected to Disconnecting".to_string(),
        format!("ExecutionEngine(w5): Disconnecting from {uri}"),
        format!("ExecutionEngine(w5): Disconnected from {uri}"),
        "ExecutionEngine(w5): Engine state transition from Disconnecting to Disconnected"
            .to_string(),
    ];
    assert_eq!(diagnostics.lines(), expected);
    Ok(())
}

#[tokio::test]
async fn worker_observes_quit() -> Result<()> {
    init_tracing();
    let runner = RunnerEngine::new(
        config("r6"),
        ignore_events(),
        Arc::new(RecordingDiagnostics::default()),
    );
    let port = runner.start()?;
    let worker = ExecutionEngine::new(
        config("w6"),
        port,
        Arc::new(StaticHost::new("asm-6", 0)),
        Arc::new(RecordingDiagnostics::default()),
    );
    worker.start().await?;
    runner.wait_for_connection(WAIT).await?;

    runner.send_quit();
    tokio::time::timeout(WAIT, worker.wait_for_quit()).await?;
    assert!(worker.quit_requested());

    runner.dispose().await?;
    worker.dispose().await?;
    Ok(())
}
