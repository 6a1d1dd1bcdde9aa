#![cfg(unix)]

use std::{sync::Arc, time::Duration};

use crate::support::helpers::{assembly_starting, init_tracing, RecordingSink, WAIT};
use anyhow::Result;
use testwire::{
    messages::{event::ErrorMessage, ids},
    sinks::crash::CRASH_ERROR_TYPE,
    CrashDetectionSink, MessageSink, MonitoredAssembly, TestEvent,
};
use tokio::process::Command;
use tokio::time::timeout;

fn shell(script: &str) -> Result<tokio::process::Child> {
    Ok(Command::new("sh").arg("-c").arg(script).spawn()?)
}

#[tokio::test]
async fn crash_after_start_reports_exit_code() -> Result<()> {
    init_tracing();
    let recorder = Arc::new(RecordingSink::default());
    let sink = Arc::new(CrashDetectionSink::for_execution(
        recorder.clone(),
        MonitoredAssembly::new("/work/Sample.Tests.dll"),
        Duration::from_millis(50),
    ));
    sink.on_message(&assembly_starting("real-asm"));

    timeout(WAIT, sink.monitor(shell("exit 42")?)).await??;

    let events = recorder.events();
    assert_eq!(
        recorder.kinds(),
        vec!["TestAssemblyStarting", "Error", "TestAssemblyFinished"]
    );
    assert_eq!(
        events[1],
        TestEvent::Error(ErrorMessage::new(
            CRASH_ERROR_TYPE,
            "Test process crashed with exit code 42."
        ))
    );
    let TestEvent::TestAssemblyFinished(finish) = &events[2] else {
        panic!("expected a finish event, got {:?}", events[2]);
    };
    assert_eq!(finish.assembly_unique_id, "real-asm");
    assert_eq!(finish.tests_total, 0);
    Ok(())
}

#[tokio::test]
async fn silent_clean_exit_is_still_a_crash() -> Result<()> {
    init_tracing();
    let recorder = Arc::new(RecordingSink::default());
    let assembly = MonitoredAssembly::new("/work/bin/Other.Tests.dll")
        .with_target_framework("net8.0");
    let sink = Arc::new(CrashDetectionSink::for_execution(
        recorder.clone(),
        assembly,
        Duration::from_millis(20),
    ));

    timeout(WAIT, sink.monitor(shell("exit 0")?)).await??;

    let events = recorder.events();
    let expected_id = ids::for_assembly("/work/bin/Other.Tests.dll", None);
    let TestEvent::TestAssemblyStarting(start) = &events[0] else {
        panic!("expected a synthetic start, got {:?}", events[0]);
    };
    assert_eq!(start.assembly_unique_id, expected_id);
    assert_eq!(start.assembly_name, "Other.Tests");
    assert_eq!(start.target_framework.as_deref(), Some("net8.0"));
    assert_eq!(
        events[1],
        TestEvent::Error(ErrorMessage::new(
            CRASH_ERROR_TYPE,
            "Test process crashed or communication channel was lost."
        ))
    );
    let TestEvent::TestAssemblyFinished(finish) = &events[2] else {
        panic!("expected a synthetic finish, got {:?}", events[2]);
    };
    assert_eq!(finish.assembly_unique_id, expected_id);
    assert_eq!(events.len(), 3);
    Ok(())
}
