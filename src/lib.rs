pub mod bus;
pub mod engine;
pub mod messages;
pub mod runtime;
pub mod sinks;
pub mod transport;

pub use bus::{EventBus, MessageBus, SynchronousMessageBus};
pub use engine::commands::{ExecutionEngineInfo, RunnerEngineInfo, PROTOCOL_VERSION};
pub use engine::error::EngineError;
pub use engine::execution::{ExecutionEngine, ExecutionHost, HostFuture, OperationReporter};
pub use engine::runner::{MessageDispatcher, RunnerEngine};
pub use engine::state::{DisposalAction, EngineCore, EngineState, StateGuard};
pub use messages::diagnostics::{DiagnosticSink, Diagnostics, TracingDiagnostics};
pub use messages::event::TestEvent;
pub use runtime::config::{EngineConfig, EngineConfigBuilder};
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use sinks::crash::{CrashDetectionSink, MonitoredAssembly};
pub use sinks::registry::{ReporterFactory, ReporterRegistry};
pub use sinks::reporters::{SilentReporter, TracingReporter};
pub use sinks::sink::{FanOutSink, MessageSink};
pub use sinks::summary::{ExecutionSummary, ExecutionSummarySink};
pub use transport::{FrameHandler, FrameSender, FramedTransport, TransportError};
