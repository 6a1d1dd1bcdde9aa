//! Guarantees a start/finish pair for a monitored worker process.
//!
//! The sink sits between the bus and the reporters. When the worker exits it
//! waits briefly for in-flight events, then fills in whatever bookends the
//! worker never managed to send so that downstream consumers always see a
//! well-formed run.

use super::sink::MessageSink;
use crate::messages::event::{
    DiscoveryComplete, DiscoveryStarting, ErrorMessage, TestAssemblyFinished,
    TestAssemblyStarting, TestEvent,
};
use crate::messages::ids;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// `exceptionType` of the synthetic error describing the crash.
pub const CRASH_ERROR_TYPE: &str = "TestProcessCrashed";

/// What is known about the assembly before the worker says anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitoredAssembly {
    pub assembly_path: String,
    pub config_file_path: Option<String>,
    pub target_framework: Option<String>,
}

impl MonitoredAssembly {
    pub fn new(assembly_path: impl Into<String>) -> Self {
        Self {
            assembly_path: assembly_path.into(),
            ..Self::default()
        }
    }

    pub fn with_config_file(mut self, path: impl Into<String>) -> Self {
        self.config_file_path = Some(path.into());
        self
    }

    pub fn with_target_framework(mut self, framework: impl Into<String>) -> Self {
        self.target_framework = Some(framework.into());
        self
    }

    /// File stem of the assembly path, or the whole path when it has none.
    pub fn assembly_name(&self) -> String {
        Path::new(&self.assembly_path)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.assembly_path.clone())
    }

    pub fn unique_id(&self) -> String {
        ids::for_assembly(&self.assembly_path, self.config_file_path.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Discovery,
    Execution,
}

#[derive(Debug, Default)]
struct Observed {
    started: Option<(String, Instant)>,
    finished: bool,
    total: u32,
    failed: u32,
    skipped: u32,
    discovered: u32,
    exit_handled: bool,
    synthesized: bool,
}

/// What the sink does with an incoming event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Forward,
    /// Forward, then release a pending drain wait.
    Finish,
    /// A real bookend arriving after synthetic ones were already emitted.
    Drop,
}

pub struct CrashDetectionSink {
    inner: Arc<dyn MessageSink>,
    assembly: MonitoredAssembly,
    scope: Scope,
    drain_timeout: Duration,
    observed: Mutex<Observed>,
    finished: watch::Sender<bool>,
}

impl CrashDetectionSink {
    /// Watches an execution run: `TestAssemblyStarting` / `TestAssemblyFinished`.
    pub fn for_execution(
        inner: Arc<dyn MessageSink>,
        assembly: MonitoredAssembly,
        drain_timeout: Duration,
    ) -> Self {
        Self::new(inner, assembly, Scope::Execution, drain_timeout)
    }

    /// Watches a discovery run: `DiscoveryStarting` / `DiscoveryComplete`.
    pub fn for_discovery(
        inner: Arc<dyn MessageSink>,
        assembly: MonitoredAssembly,
        drain_timeout: Duration,
    ) -> Self {
        Self::new(inner, assembly, Scope::Discovery, drain_timeout)
    }

    fn new(
        inner: Arc<dyn MessageSink>,
        assembly: MonitoredAssembly,
        scope: Scope,
        drain_timeout: Duration,
    ) -> Self {
        let (finished, _) = watch::channel(false);
        Self {
            inner,
            assembly,
            scope,
            drain_timeout,
            observed: Mutex::new(Observed::default()),
            finished,
        }
    }

    pub fn assembly(&self) -> &MonitoredAssembly {
        &self.assembly
    }

    /// Waits for the child to exit, then runs the exit handling.
    pub fn monitor(self: &Arc<Self>, mut child: Child) -> JoinHandle<()> {
        let sink = Arc::clone(self);
        tokio::spawn(async move {
            let exit_code = match child.wait().await {
                Ok(status) => status.code(),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to wait for test process");
                    None
                }
            };
            sink.on_process_exited(exit_code).await;
        })
    }

    /// Handles the end of the worker process. Returns `true` when synthetic
    /// events had to be emitted. Only the first call has any effect.
    pub async fn on_process_exited(&self, exit_code: Option<i32>) -> bool {
        let mut rx = self.finished.subscribe();
        let drained = tokio::time::timeout(self.drain_timeout, async {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .is_ok();

        let events = {
            let mut observed = self.observed.lock().expect("crash sink state poisoned");
            if observed.exit_handled {
                return false;
            }
            observed.exit_handled = true;
            if observed.finished {
                return false;
            }
            observed.synthesized = true;
            self.synthesize(&observed, exit_code)
        };

        tracing::warn!(
            assembly = %self.assembly.assembly_path,
            exit_code = ?exit_code,
            drained,
            "test process ended without a finish event"
        );
        for event in &events {
            self.inner.on_message(event);
        }
        true
    }

    fn synthesize(&self, observed: &Observed, exit_code: Option<i32>) -> Vec<TestEvent> {
        let message = match exit_code {
            Some(code) if code != 0 => format!("Test process crashed with exit code {code}."),
            _ => "Test process crashed or communication channel was lost.".to_string(),
        };
        let error = TestEvent::Error(ErrorMessage::new(CRASH_ERROR_TYPE, message));

        let mut events = Vec::with_capacity(3);
        let (assembly_unique_id, elapsed) = match &observed.started {
            Some((id, at)) => (id.clone(), at.elapsed().as_secs_f64()),
            None => {
                let id = self.assembly.unique_id();
                events.push(self.synthetic_start(&id));
                (id, 0.0)
            }
        };
        events.push(error);
        events.push(match self.scope {
            Scope::Execution => TestEvent::TestAssemblyFinished(TestAssemblyFinished {
                assembly_unique_id,
                execution_time: elapsed,
                tests_total: observed.total,
                tests_failed: observed.failed,
                tests_skipped: observed.skipped,
                tests_not_run: 0,
            }),
            Scope::Discovery => TestEvent::DiscoveryComplete(DiscoveryComplete {
                assembly_unique_id,
                test_cases_to_run: observed.discovered,
            }),
        });
        events
    }

    fn synthetic_start(&self, assembly_unique_id: &str) -> TestEvent {
        let assembly = &self.assembly;
        match self.scope {
            Scope::Execution => TestEvent::TestAssemblyStarting(TestAssemblyStarting {
                assembly_unique_id: assembly_unique_id.to_string(),
                assembly_name: assembly.assembly_name(),
                assembly_path: Some(assembly.assembly_path.clone()),
                config_file_path: assembly.config_file_path.clone(),
                target_framework: assembly.target_framework.clone(),
                test_framework: None,
            }),
            Scope::Discovery => TestEvent::DiscoveryStarting(DiscoveryStarting {
                assembly_unique_id: assembly_unique_id.to_string(),
                assembly_name: assembly.assembly_name(),
                assembly_path: Some(assembly.assembly_path.clone()),
                config_file_path: assembly.config_file_path.clone(),
            }),
        }
    }

    fn is_bookend(&self, event: &TestEvent) -> bool {
        matches!(
            (self.scope, event),
            (Scope::Execution, TestEvent::TestAssemblyStarting(_))
                | (Scope::Execution, TestEvent::TestAssemblyFinished(_))
                | (Scope::Discovery, TestEvent::DiscoveryStarting(_))
                | (Scope::Discovery, TestEvent::DiscoveryComplete(_))
        )
    }

    /// Updates the observed state and decides how `event` is delivered.
    fn observe(&self, event: &TestEvent) -> Delivery {
        let mut observed = self.observed.lock().expect("crash sink state poisoned");
        if observed.synthesized && self.is_bookend(event) {
            return Delivery::Drop;
        }
        match (self.scope, event) {
            (Scope::Execution, TestEvent::TestAssemblyStarting(e)) => {
                observed.started = Some((e.assembly_unique_id.clone(), Instant::now()));
            }
            (Scope::Execution, TestEvent::TestPassed(_)) => observed.total += 1,
            (Scope::Execution, TestEvent::TestFailed(_)) => {
                observed.total += 1;
                observed.failed += 1;
            }
            (Scope::Execution, TestEvent::TestSkipped(_)) => {
                observed.total += 1;
                observed.skipped += 1;
            }
            (Scope::Execution, TestEvent::TestAssemblyFinished(_))
            | (Scope::Discovery, TestEvent::DiscoveryComplete(_)) => {
                observed.finished = true;
                return Delivery::Finish;
            }
            (Scope::Discovery, TestEvent::DiscoveryStarting(e)) => {
                observed.started = Some((e.assembly_unique_id.clone(), Instant::now()));
            }
            (Scope::Discovery, TestEvent::TestCaseDiscovered(_)) => observed.discovered += 1,
            _ => {}
        }
        Delivery::Forward
    }
}

impl MessageSink for CrashDetectionSink {
    fn on_message(&self, event: &TestEvent) -> bool {
        match self.observe(event) {
            Delivery::Forward => self.inner.on_message(event),
            Delivery::Finish => {
                let keep_going = self.inner.on_message(event);
                self.finished.send_replace(true);
                keep_going
            }
            Delivery::Drop => {
                tracing::warn!(
                    assembly = %self.assembly.assembly_path,
                    kind = event.kind(),
                    "dropping event that arrived after the crash was reported"
                );
                true
            }
        }
    }
}
