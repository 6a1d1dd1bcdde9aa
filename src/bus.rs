//! Ordered delivery of test events from many producers to one sink.

pub mod message_bus;
pub mod synchronous;

pub use message_bus::MessageBus;
pub use synchronous::SynchronousMessageBus;

use crate::messages::event::{ErrorMessage, TestEvent};
use crate::runtime::fatal::panic_message;
use crate::sinks::sink::MessageSink;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};

/// `exceptionType` of the error event forwarded when a sink panics.
pub const SINK_PANIC_TYPE: &str = "MessageSinkPanic";

/// Common surface of the queued and inline buses.
pub trait EventBus: Send + Sync {
    /// Hands `event` to the sink (now or later) and reports whether the run
    /// should keep going.
    fn queue_message(&self, event: TestEvent) -> bool;
}

/// Delivers one event, converting a sink panic into an error event. A sink
/// that declines, or panics again on the error event, stops the bus.
pub(crate) fn deliver(sink: &dyn MessageSink, running: &AtomicBool, event: TestEvent) {
    let panic = match catch_unwind(AssertUnwindSafe(|| sink.on_message(&event))) {
        Ok(true) => return,
        Ok(false) => {
            running.store(false, Ordering::SeqCst);
            return;
        }
        Err(panic) => panic,
    };

    let message = panic_message(panic.as_ref());
    tracing::warn!(kind = event.kind(), error = %message, "message sink panicked");
    let error = TestEvent::Error(ErrorMessage::new(
        SINK_PANIC_TYPE,
        format!("sink panicked while handling {}: {message}", event.kind()),
    ));
    match catch_unwind(AssertUnwindSafe(|| sink.on_message(&error))) {
        Ok(true) => {}
        Ok(false) => running.store(false, Ordering::SeqCst),
        Err(_) => {
            tracing::error!("message sink panicked while handling the panic report");
            running.store(false, Ordering::SeqCst);
        }
    }
}
