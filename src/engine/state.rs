use super::error::EngineError;
use crate::messages::diagnostics::{DiagnosticSink, Diagnostics};
use crate::runtime::fatal::panic_message;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    Unknown,
    Initialized,
    Listening,
    Connecting,
    Negotiating,
    Connected,
    Disconnecting,
    Disconnected,
}

impl EngineState {
    /// Position in the lifecycle. `Listening` and `Connecting` are the two
    /// roles' equivalents and share a rank.
    pub fn rank(self) -> u8 {
        match self {
            EngineState::Unknown => 0,
            EngineState::Initialized => 1,
            EngineState::Listening | EngineState::Connecting => 2,
            EngineState::Negotiating => 3,
            EngineState::Connected => 4,
            EngineState::Disconnecting => 5,
            EngineState::Disconnected => 6,
        }
    }

    pub fn is_closing(self) -> bool {
        self.rank() >= EngineState::Disconnecting.rank()
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Unknown => "Unknown",
            EngineState::Initialized => "Initialized",
            EngineState::Listening => "Listening",
            EngineState::Connecting => "Connecting",
            EngineState::Negotiating => "Negotiating",
            EngineState::Connected => "Connected",
            EngineState::Disconnecting => "Disconnecting",
            EngineState::Disconnected => "Disconnected",
        };
        f.write_str(name)
    }
}

/// Cleanup registered while the engine runs and executed during disposal.
pub type DisposalAction = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

pub fn disposal_action<F, Fut>(action: F) -> DisposalAction
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Box::new(move || action().boxed())
}

struct CoreState {
    state: EngineState,
    disposal: Vec<(&'static str, DisposalAction)>,
}

/// Lifecycle state plus the disposal stack, behind one lock.
pub struct EngineCore {
    engine_id: Arc<str>,
    diagnostics: Diagnostics,
    inner: Mutex<CoreState>,
    state_tx: watch::Sender<EngineState>,
}

impl EngineCore {
    /// Creates the core in `Unknown`; callers move it to `Initialized` once
    /// their command table is in place.
    pub fn new(kind: &str, engine_id: &str, sink: Arc<dyn DiagnosticSink>) -> Self {
        let (state_tx, _) = watch::channel(EngineState::Unknown);
        Self {
            engine_id: Arc::from(engine_id),
            diagnostics: Diagnostics::new(format!("{kind}({engine_id})"), sink),
            inner: Mutex::new(CoreState {
                state: EngineState::Unknown,
                disposal: Vec::new(),
            }),
            state_tx,
        }
    }

    pub fn engine_id(&self) -> &str {
        &self.engine_id
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn state(&self) -> EngineState {
        self.inner.lock().expect("engine state poisoned").state
    }

    /// Holds the engine lock so a state check and the action depending on it
    /// happen atomically.
    pub fn lock(&self) -> StateGuard<'_> {
        StateGuard {
            core: self,
            guard: self.inner.lock().expect("engine state poisoned"),
        }
    }

    pub fn transition(&self, next: EngineState) -> Result<(), EngineError> {
        self.lock().set(next)
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.state_tx.subscribe()
    }

    /// Waits until the lifecycle reaches `target` or moves past it, returning
    /// the state observed.
    pub async fn wait_for(
        &self,
        target: EngineState,
        timeout: Duration,
    ) -> Result<EngineState, EngineError> {
        let mut rx = self.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|state| state.rank() >= target.rank()),
        )
        .await;
        match waited {
            Ok(Ok(state)) => Ok(*state),
            Ok(Err(_)) => Err(EngineError::AlreadyDisposed {
                state: self.state(),
            }),
            Err(_) => Err(EngineError::Timeout {
                waiting_for: target,
            }),
        }
    }

    /// Moves to `Disconnecting`, runs every tracked action last-registered
    /// first, then moves to `Disconnected`. Action failures are diagnosed and
    /// never stop the remaining actions.
    pub async fn dispose(&self) -> Result<(), EngineError> {
        let actions = {
            let mut guard = self.lock();
            let state = guard.state();
            if state.is_closing() {
                return Err(EngineError::AlreadyDisposed { state });
            }
            guard.set(EngineState::Disconnecting)?;
            std::mem::take(&mut guard.guard.disposal)
        };

        for (label, action) in actions.into_iter().rev() {
            match AssertUnwindSafe(action()).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => self
                    .diagnostics
                    .warn(format!("error during disposal of {label}: {err:#}")),
                Err(panic) => self.diagnostics.warn(format!(
                    "panic during disposal of {label}: {}",
                    panic_message(panic.as_ref())
                )),
            }
        }

        self.transition(EngineState::Disconnected)
    }
}

pub struct StateGuard<'a> {
    core: &'a EngineCore,
    guard: MutexGuard<'a, CoreState>,
}

impl StateGuard<'_> {
    pub fn state(&self) -> EngineState {
        self.guard.state
    }

    /// Applies a strictly forward transition and logs it.
    pub fn set(&mut self, next: EngineState) -> Result<(), EngineError> {
        let current = self.guard.state;
        if next.rank() <= current.rank() {
            return Err(EngineError::InvalidTransition {
                from: current,
                to: next,
            });
        }

        self.core.diagnostics.report(format!(
            "Engine state transition from {current} to {next}"
        ));
        self.guard.state = next;
        self.core.state_tx.send_replace(next);
        Ok(())
    }

    pub fn track(&mut self, label: &'static str, action: DisposalAction) {
        self.guard.disposal.push((label, action));
    }
}
