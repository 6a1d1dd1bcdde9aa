use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::support::{
    helpers::{
        config, init_tracing, FailingHost, RecordingDiagnostics, RecordingSink, StaticHost, WAIT,
    },
    simulated_worker::SimulatedWorker,
};
use anyhow::Result;
use testwire::{
    engine::execution::{HOST_ERROR_TYPE, HOST_PANIC_TYPE},
    messages::event::TestAssemblyFinished,
    CrashDetectionSink, EventBus, ExecutionEngine, ExecutionSummary, ExecutionSummarySink,
    MessageBus, MessageDispatcher, MessageSink, MonitoredAssembly, RunnerEngine, TestEvent,
};
use tokio::time::{sleep, timeout};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn run_flows_from_worker_to_reporters() -> Result<()> {
    init_tracing();
    let recorder = Arc::new(RecordingSink::default());
    let summary = Arc::new(ExecutionSummarySink::new(recorder.clone()));
    let crash = Arc::new(CrashDetectionSink::for_execution(
        summary.clone(),
        MonitoredAssembly::new("/work/Sample.Tests.dll"),
        Duration::from_millis(50),
    ));
    let bus = Arc::new(MessageBus::new(crash.clone(), false));
    let dispatcher: MessageDispatcher = {
        let bus = Arc::clone(&bus);
        Arc::new(move |_: &str, event: TestEvent| bus.queue_message(event))
    };

    let runner = RunnerEngine::new(
        config("runner"),
        dispatcher,
        Arc::new(RecordingDiagnostics::default()),
    );
    let port = runner.start()?;
    let worker = ExecutionEngine::new(
        config("worker"),
        port,
        Arc::new(StaticHost::new("asm-e2e", 25)),
        Arc::new(RecordingDiagnostics::default()),
    );
    worker.start().await?;
    runner.wait_for_connection(WAIT).await?;

    runner.send_run("run-1", None);
    timeout(WAIT, summary.finished()).await?;

    assert_eq!(
        summary.summary(),
        ExecutionSummary {
            total: 25,
            time: 0.01,
            ..ExecutionSummary::default()
        }
    );
    let kinds = recorder.kinds();
    assert_eq!(kinds.len(), 27);
    assert_eq!(kinds.first(), Some(&"TestAssemblyStarting"));
    assert_eq!(kinds.last(), Some(&"TestAssemblyFinished"));
    assert!(kinds[1..26].iter().all(|kind| *kind == "TestPassed"));

    worker.dispose().await?;
    runner.dispose().await?;
    bus.shutdown().await;
    assert!(!crash.on_process_exited(Some(0)).await);
    assert_eq!(recorder.events().len(), 27);
    assert_eq!(runner.telemetry().snapshot().events_dispatched, 27);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dispatcher_refusal_cancels_the_operation() -> Result<()> {
    init_tracing();
    let recorder = Arc::new(RecordingSink::default());
    let dispatcher: MessageDispatcher = {
        let recorder = Arc::clone(&recorder);
        Arc::new(move |_: &str, event: TestEvent| {
            recorder.on_message(&event);
            !matches!(event, TestEvent::TestPassed(_))
        })
    };

    let runner = RunnerEngine::new(
        config("runner"),
        dispatcher,
        Arc::new(RecordingDiagnostics::default()),
    );
    let port = runner.start()?;
    let worker = ExecutionEngine::new(
        config("worker"),
        port,
        Arc::new(StaticHost::new("asm-cancel", 1_000).with_delay(Duration::from_millis(2))),
        Arc::new(RecordingDiagnostics::default()),
    );
    worker.start().await?;
    runner.wait_for_connection(WAIT).await?;

    runner.send_run("run-2", None);
    let finished = timeout(WAIT, async {
        loop {
            let finish = recorder.events().into_iter().find_map(|event| match event {
                TestEvent::TestAssemblyFinished(finish) => Some(finish),
                _ => None,
            });
            if let Some(finish) = finish {
                return finish;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;

    let TestAssemblyFinished {
        tests_total,
        tests_not_run,
        ..
    } = finished;
    assert!(tests_not_run > 0, "host should have stopped early");
    assert_eq!(tests_total + tests_not_run, 1_000);

    worker.dispose().await?;
    runner.dispose().await?;
    Ok(())
}

#[tokio::test]
async fn cancel_is_sent_once_per_engine() -> Result<()> {
    init_tracing();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let dispatcher: MessageDispatcher = {
        let calls = Arc::clone(&calls);
        Arc::new(move |operation: &str, event: TestEvent| {
            calls.lock().unwrap().push((operation.to_owned(), event.kind()));
            false
        })
    };
    let runner = RunnerEngine::new(
        config("runner"),
        dispatcher,
        Arc::new(RecordingDiagnostics::default()),
    );
    let port = runner.start()?;
    let mut worker = SimulatedWorker::connect(port).await?;
    worker.negotiate("asm").await?;
    runner.wait_for_connection(WAIT).await?;

    let event = r#"{"$type":"Diagnostic","message":"hello"}"#;
    worker.send_line(&format!("MSG op-a {event}")).await?;
    worker.send_line(&format!("MSG op-a {event}")).await?;
    worker.send_line(&format!("MSG op-b {event}")).await?;
    timeout(WAIT, async {
        while runner.telemetry().snapshot().events_dispatched < 3 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;

    runner.dispose().await?;
    assert_eq!(worker.next_line().await?, "CANCEL op-a");
    assert_eq!(worker.next_line().await?, "QUIT");
    worker.expect_eof().await?;

    assert_eq!(
        *calls.lock().unwrap(),
        vec![
            ("op-a".to_string(), "Diagnostic"),
            ("op-a".to_string(), "Diagnostic"),
            ("op-b".to_string(), "Diagnostic"),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn malformed_messages_are_diagnosed() -> Result<()> {
    init_tracing();
    let diagnostics = Arc::new(RecordingDiagnostics::default());
    let recorder = Arc::new(RecordingSink::default());
    let dispatcher: MessageDispatcher = {
        let recorder = Arc::clone(&recorder);
        Arc::new(move |_: &str, event: TestEvent| {
            recorder.on_message(&event)
        })
    };
    let runner = RunnerEngine::new(config("rm"), dispatcher, diagnostics.clone());
    let port = runner.start()?;
    let mut worker = SimulatedWorker::connect(port).await?;
    assert_eq!(worker.next_line().await?, r#"INFO {"protocolVersion":"1.0"}"#);

    worker
        .send_line(r#"MSG early {"$type":"Diagnostic","message":"before INFO"}"#)
        .await?;
    diagnostics
        .wait_for_line(
            "RunnerEngine(rm): MSG message received before we reached Connected state (current state is Negotiating)",
        )
        .await?;
    recorder.wait_for_len(1).await?;

    worker.reply_info("asm").await?;
    runner.wait_for_connection(WAIT).await?;

    worker.send_line("MSG").await?;
    worker.send_line("MSG op-1").await?;
    worker.send_line("MSG op-1 {not json").await?;
    diagnostics
        .wait_for_line("RunnerEngine(rm): MSG data is missing the operation ID")
        .await?;
    diagnostics
        .wait_for_line("RunnerEngine(rm): MSG data is missing the JSON")
        .await?;
    diagnostics
        .wait_for_line(
            "RunnerEngine(rm): Error during message processing of 'MSG': MSG payload for operation 'op-1' is not a valid test event",
        )
        .await?;
    assert_eq!(runner.telemetry().snapshot().handler_faults, 1);
    assert_eq!(recorder.events().len(), 1);

    runner.dispose().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn host_failures_become_error_events() -> Result<()> {
    init_tracing();
    let recorder = Arc::new(RecordingSink::default());
    let dispatcher: MessageDispatcher = {
        let recorder = Arc::clone(&recorder);
        Arc::new(move |_: &str, event: TestEvent| {
            recorder.on_message(&event)
        })
    };
    let runner = RunnerEngine::new(
        config("runner"),
        dispatcher,
        Arc::new(RecordingDiagnostics::default()),
    );
    let port = runner.start()?;
    let worker = ExecutionEngine::new(
        config("worker"),
        port,
        Arc::new(FailingHost),
        Arc::new(RecordingDiagnostics::default()),
    );
    worker.start().await?;
    runner.wait_for_connection(WAIT).await?;

    runner.send_find("find-1", None);
    recorder.wait_for_len(1).await?;
    runner.send_run("run-1", None);
    recorder.wait_for_len(2).await?;

    let events = recorder.events();
    let TestEvent::Error(find_error) = &events[0] else {
        panic!("expected an error event, got {:?}", events[0]);
    };
    assert_eq!(find_error.exception_type, HOST_ERROR_TYPE);
    assert_eq!(find_error.message, "discovery failed");
    assert_eq!(find_error.stack_trace.as_deref(), Some("disk on fire"));

    let TestEvent::Error(run_error) = &events[1] else {
        panic!("expected an error event, got {:?}", events[1]);
    };
    assert_eq!(run_error.exception_type, HOST_PANIC_TYPE);
    assert_eq!(run_error.message, "runner exploded");

    worker.dispose().await?;
    runner.dispose().await?;
    Ok(())
}

#[tokio::test]
async fn worker_rejects_operations_it_cannot_run() -> Result<()> {
    init_tracing();
    let runner = RunnerEngine::new(
        config("runner"),
        Arc::new(|_: &str, _: TestEvent| true),
        Arc::new(RecordingDiagnostics::default()),
    );
    let port = runner.start()?;
    let diagnostics = Arc::new(RecordingDiagnostics::default());
    let worker = ExecutionEngine::new(
        config("wr"),
        port,
        Arc::new(StaticHost::new("asm", 1).with_delay(Duration::from_millis(200))),
        diagnostics.clone(),
    );
    worker.start().await?;
    runner.wait_for_connection(WAIT).await?;

    runner.send_cancel("ghost");
    diagnostics
        .wait_for_line("ExecutionEngine(wr): CANCEL requested for unknown operation ID 'ghost'")
        .await?;

    runner.send_run("dup", None);
    runner.send_run("dup", None);
    diagnostics
        .wait_for_line("ExecutionEngine(wr): RUN requested duplicate operation ID 'dup'")
        .await?;

    worker.dispose().await?;
    runner.dispose().await?;
    Ok(())
}
