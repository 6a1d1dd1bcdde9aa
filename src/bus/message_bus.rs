use super::{deliver, EventBus};
use crate::messages::event::TestEvent;
use crate::sinks::sink::MessageSink;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Queues events from any thread and forwards them to the sink, in arrival
/// order, from a single consumer task.
pub struct MessageBus {
    sender: RwLock<Option<mpsc::UnboundedSender<TestEvent>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    stop_on_fail: bool,
}

impl MessageBus {
    /// Spawns the consumer task; must be called within a tokio runtime.
    pub fn new(sink: Arc<dyn MessageSink>, stop_on_fail: bool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));
        let consumer = tokio::spawn(consume(rx, sink, Arc::clone(&running)));

        Self {
            sender: RwLock::new(Some(tx)),
            consumer: Mutex::new(Some(consumer)),
            running,
            stop_on_fail,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops accepting events, waits until every event queued so far has
    /// reached the sink, then returns. Later calls return immediately.
    pub async fn shutdown(&self) {
        self.sender
            .write()
            .expect("message bus sender poisoned")
            .take();

        let consumer = self
            .consumer
            .lock()
            .expect("message bus consumer poisoned")
            .take();
        if let Some(handle) = consumer {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "message bus consumer panicked");
            }
        }
    }
}

impl EventBus for MessageBus {
    fn queue_message(&self, event: TestEvent) -> bool {
        if self.stop_on_fail && event.is_failure() {
            self.running.store(false, Ordering::SeqCst);
        }

        let sender = self.sender.read().expect("message bus sender poisoned");
        let queued = match sender.as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        };
        if !queued {
            tracing::warn!("message bus is shut down; dropping event");
            return false;
        }

        self.is_running()
    }
}

impl Drop for MessageBus {
    fn drop(&mut self) {
        if let Ok(mut sender) = self.sender.write() {
            sender.take();
        }
    }
}

async fn consume(
    mut rx: mpsc::UnboundedReceiver<TestEvent>,
    sink: Arc<dyn MessageSink>,
    running: Arc<AtomicBool>,
) {
    while let Some(event) = rx.recv().await {
        deliver(sink.as_ref(), &running, event);
    }
    tracing::debug!("message bus drained");
}
