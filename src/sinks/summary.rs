use super::sink::MessageSink;
use crate::messages::event::TestEvent;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Totals of one assembly run.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExecutionSummary {
    pub total: u32,
    pub failed: u32,
    pub skipped: u32,
    pub not_run: u32,
    pub errors: u32,
    pub time: f64,
}

/// Pass-through sink that keeps an [`ExecutionSummary`] of what flows past.
pub struct ExecutionSummarySink {
    inner: Arc<dyn MessageSink>,
    summary: Mutex<ExecutionSummary>,
    finished: watch::Sender<bool>,
}

impl ExecutionSummarySink {
    pub fn new(inner: Arc<dyn MessageSink>) -> Self {
        let (finished, _) = watch::channel(false);
        Self {
            inner,
            summary: Mutex::new(ExecutionSummary::default()),
            finished,
        }
    }

    pub fn summary(&self) -> ExecutionSummary {
        *self.summary.lock().expect("summary lock poisoned")
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// Resolves once `TestAssemblyFinished` has been handed to the inner sink.
    pub async fn finished(&self) {
        let mut rx = self.finished.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl MessageSink for ExecutionSummarySink {
    fn on_message(&self, event: &TestEvent) -> bool {
        let finishes = {
            let mut summary = self.summary.lock().expect("summary lock poisoned");
            match event {
                TestEvent::Error(_) => {
                    summary.errors += 1;
                    false
                }
                TestEvent::TestAssemblyFinished(finished) => {
                    summary.total += finished.tests_total;
                    summary.failed += finished.tests_failed;
                    summary.skipped += finished.tests_skipped;
                    summary.not_run += finished.tests_not_run;
                    summary.time += finished.execution_time;
                    true
                }
                _ => false,
            }
        };

        let keep_going = self.inner.on_message(event);
        if finishes {
            self.finished.send_replace(true);
        }
        keep_going
    }
}
