use std::sync::Arc;

/// Receives the human-readable protocol diagnostics emitted by engines and
/// transports. Lines arrive already prefixed with their source, e.g.
/// `RunnerEngine(1r): Engine state transition from Unknown to Initialized`.
pub trait DiagnosticSink: Send + Sync + 'static {
    fn on_diagnostic(&self, message: &str);
}

/// Sink that drops diagnostics; they still reach `tracing` through [`Diagnostics`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl DiagnosticSink for TracingDiagnostics {
    fn on_diagnostic(&self, _message: &str) {}
}

/// Prefixing handle over a shared [`DiagnosticSink`].
#[derive(Clone)]
pub struct Diagnostics {
    source: Arc<str>,
    sink: Arc<dyn DiagnosticSink>,
}

impl Diagnostics {
    pub fn new(source: impl Into<Arc<str>>, sink: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            source: source.into(),
            sink,
        }
    }

    pub fn tracing_only(source: impl Into<Arc<str>>) -> Self {
        Self::new(source, Arc::new(TracingDiagnostics))
    }

    /// A handle for another component writing into the same sink.
    pub fn with_source(&self, source: impl Into<Arc<str>>) -> Self {
        Self::new(source, Arc::clone(&self.sink))
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn report(&self, message: impl AsRef<str>) {
        let line = format!("{}: {}", self.source, message.as_ref());
        tracing::debug!(target: "testwire::diagnostics", "{line}");
        self.sink.on_diagnostic(&line);
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        let line = format!("{}: {}", self.source, message.as_ref());
        tracing::warn!(target: "testwire::diagnostics", "{line}");
        self.sink.on_diagnostic(&line);
    }
}

impl std::fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Diagnostics")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}
