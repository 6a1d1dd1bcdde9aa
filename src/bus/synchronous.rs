use super::{deliver, EventBus};
use crate::messages::event::TestEvent;
use crate::sinks::sink::MessageSink;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Bus variant that delivers on the caller's thread. Deliveries are
/// serialized so the sink still sees one event at a time.
pub struct SynchronousMessageBus {
    sink: Arc<dyn MessageSink>,
    running: AtomicBool,
    stop_on_fail: bool,
    delivery: Mutex<()>,
}

impl SynchronousMessageBus {
    pub fn new(sink: Arc<dyn MessageSink>, stop_on_fail: bool) -> Self {
        Self {
            sink,
            running: AtomicBool::new(true),
            stop_on_fail,
            delivery: Mutex::new(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl EventBus for SynchronousMessageBus {
    fn queue_message(&self, event: TestEvent) -> bool {
        if self.stop_on_fail && event.is_failure() {
            self.running.store(false, Ordering::SeqCst);
        }

        {
            let _serialized = self
                .delivery
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            deliver(self.sink.as_ref(), &self.running, event);
        }
        self.is_running()
    }
}
