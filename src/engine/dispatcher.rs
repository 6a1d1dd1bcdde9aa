use crate::messages::diagnostics::Diagnostics;
use crate::runtime::fatal::panic_message;
use crate::runtime::telemetry::Telemetry;
use crate::transport::split_on_separator;
use bytes::Bytes;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

pub type CommandHandler<C> = Box<dyn Fn(&C, Option<Bytes>) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    UnknownCommand,
    HandlerFailed,
}

/// Maps the leading token of a frame to its handler. `C` is the engine state
/// handed to every handler.
pub struct CommandDispatcher<C> {
    handlers: Vec<(&'static [u8], CommandHandler<C>)>,
    diagnostics: Diagnostics,
    telemetry: Arc<Telemetry>,
}

impl<C> CommandDispatcher<C> {
    pub fn new(diagnostics: Diagnostics, telemetry: Arc<Telemetry>) -> Self {
        Self {
            handlers: Vec::new(),
            diagnostics,
            telemetry,
        }
    }

    /// Registers `handler` for `token`. Only the first registration of a token
    /// is ever reached.
    pub fn add_command_handler<F>(&mut self, token: &'static [u8], handler: F)
    where
        F: Fn(&C, Option<Bytes>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        debug_assert!(
            !token.contains(&b' ') && !token.contains(&b'\n'),
            "command tokens cannot contain separators"
        );
        debug_assert!(
            self.handlers.iter().all(|(existing, _)| *existing != token),
            "command token registered twice"
        );
        self.handlers.push((token, Box::new(handler)));
    }

    pub fn process_request(&self, ctx: &C, frame: Bytes) -> DispatchOutcome {
        let (token, data) = split_on_separator(&frame);
        let Some((name, handler)) = self
            .handlers
            .iter()
            .find(|(candidate, _)| *candidate == &token[..])
        else {
            self.telemetry.record_unknown_command();
            self.diagnostics.report(format!(
                "Received unknown command '{}'",
                String::from_utf8_lossy(&token)
            ));
            return DispatchOutcome::UnknownCommand;
        };

        let name = String::from_utf8_lossy(name);
        match catch_unwind(AssertUnwindSafe(|| handler(ctx, data))) {
            Ok(Ok(())) => DispatchOutcome::Handled,
            Ok(Err(err)) => {
                self.telemetry.record_handler_fault();
                self.diagnostics
                    .warn(format!("Error during message processing of '{name}': {err:#}"));
                DispatchOutcome::HandlerFailed
            }
            Err(panic) => {
                self.telemetry.record_handler_fault();
                self.diagnostics.warn(format!(
                    "Panic during message processing of '{name}': {}",
                    panic_message(panic.as_ref())
                ));
                DispatchOutcome::HandlerFailed
            }
        }
    }
}
