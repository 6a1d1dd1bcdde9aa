use super::sink::MessageSink;
use crate::messages::event::TestEvent;

/// Writes a line per event through `tracing`: failures and errors at warn,
/// assembly bookends at info, everything else at debug.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl MessageSink for TracingReporter {
    fn on_message(&self, event: &TestEvent) -> bool {
        match event {
            TestEvent::TestAssemblyStarting(starting) => tracing::info!(
                target: "testwire::reporter",
                assembly = %starting.assembly_name,
                "assembly starting"
            ),
            TestEvent::TestAssemblyFinished(finished) => tracing::info!(
                target: "testwire::reporter",
                total = finished.tests_total,
                failed = finished.tests_failed,
                skipped = finished.tests_skipped,
                not_run = finished.tests_not_run,
                time = finished.execution_time,
                "assembly finished"
            ),
            TestEvent::TestFailed(failed) => tracing::warn!(
                target: "testwire::reporter",
                test = %failed.test.test_unique_id,
                exception = %failed.exception_type,
                message = %failed.message,
                "test failed"
            ),
            TestEvent::Error(error) => tracing::warn!(
                target: "testwire::reporter",
                exception = %error.exception_type,
                message = %error.message,
                "error"
            ),
            other => tracing::debug!(target: "testwire::reporter", kind = other.kind(), "event"),
        }
        true
    }
}

/// Accepts and discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentReporter;

impl MessageSink for SilentReporter {
    fn on_message(&self, _event: &TestEvent) -> bool {
        true
    }
}
