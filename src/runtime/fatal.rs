use std::any::Any;
use std::sync::{Arc, Mutex};

/// First-fault-wins slot shared between a background task that observes a
/// failure and the owner that surfaces it later.
pub struct FaultSlot<E> {
    inner: Arc<Mutex<Option<E>>>,
}

impl<E> Clone for FaultSlot<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> Default for FaultSlot<E> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }
}

impl<E> FaultSlot<E> {
    /// Stores `error` unless an earlier fault is already held. Returns whether
    /// this call captured it.
    pub fn record(&self, error: E) -> bool {
        let mut slot = self.inner.lock().expect("fault slot poisoned");
        if slot.is_some() {
            return false;
        }
        *slot = Some(error);
        true
    }

    pub fn is_faulted(&self) -> bool {
        self.inner.lock().expect("fault slot poisoned").is_some()
    }

    pub fn take(&self) -> Option<E> {
        self.inner.lock().expect("fault slot poisoned").take()
    }
}

/// Renders a caught panic payload as text.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
