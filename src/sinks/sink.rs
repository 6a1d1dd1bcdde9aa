use crate::messages::event::TestEvent;
use std::sync::Arc;

/// Receives events one at a time, in bus order. Returning `false` asks the
/// run to stop.
pub trait MessageSink: Send + Sync + 'static {
    fn on_message(&self, event: &TestEvent) -> bool;
}

impl<F> MessageSink for F
where
    F: Fn(&TestEvent) -> bool + Send + Sync + 'static,
{
    fn on_message(&self, event: &TestEvent) -> bool {
        self(event)
    }
}

/// Forwards every event to each inner sink; keeps running only while all of
/// them want to.
pub struct FanOutSink {
    sinks: Vec<Arc<dyn MessageSink>>,
}

impl FanOutSink {
    pub fn new(sinks: Vec<Arc<dyn MessageSink>>) -> Self {
        Self { sinks }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl MessageSink for FanOutSink {
    fn on_message(&self, event: &TestEvent) -> bool {
        self.sinks
            .iter()
            .fold(true, |keep_going, sink| sink.on_message(event) && keep_going)
    }
}
