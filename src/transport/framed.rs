use super::error::TransportError;
use super::frame::{encode_frame, FrameCodec};
use crate::messages::diagnostics::Diagnostics;
use crate::runtime::fatal::{panic_message, FaultSlot};
use crate::runtime::telemetry::Telemetry;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::{select, task};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

const READ_CHUNK_BYTES: usize = 4096;

/// Callback invoked on the reader task for every received frame.
pub type FrameHandler = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Cloneable, non-blocking handle for enqueuing outbound bytes.
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<Bytes>,
    close_expected: Arc<AtomicBool>,
    telemetry: Arc<Telemetry>,
}

impl FrameSender {
    /// Enqueues raw bytes; the caller is responsible for the terminator.
    pub fn send(&self, bytes: impl Into<Bytes>) -> Result<(), TransportError> {
        self.tx
            .send(bytes.into())
            .map_err(|_| TransportError::Closed)?;
        self.telemetry.record_frame_sent();
        Ok(())
    }

    pub fn send_frame(&self, token: &[u8], parts: &[&[u8]]) -> Result<(), TransportError> {
        self.send(encode_frame(token, parts))
    }

    /// Marks the end of the conversation. From here on the remote end closing
    /// the stream is a normal shutdown rather than a fault.
    pub fn expect_close(&self) {
        self.close_expected.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl std::fmt::Debug for FrameSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSender")
            .field("closed", &self.tx.is_closed())
            .field("close_expected", &self.close_expected.load(Ordering::SeqCst))
            .finish()
    }
}

/// Owns the reader and writer tasks of one connection.
pub struct FramedTransport {
    name: String,
    sender: FrameSender,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    reader_stop: CancellationToken,
    writer_stop: CancellationToken,
    faults: FaultSlot<io::Error>,
    diagnostics: Diagnostics,
}

impl FramedTransport {
    /// Splits `stream` and spawns its reader and writer tasks. Must be called
    /// from within a tokio runtime.
    pub fn start<S>(
        name: impl Into<String>,
        stream: S,
        handler: FrameHandler,
        diagnostics: Diagnostics,
        telemetry: Arc<Telemetry>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let name = name.into();
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();
        let close_expected = Arc::new(AtomicBool::new(false));
        let faults = FaultSlot::default();
        let reader_stop = CancellationToken::new();
        let writer_stop = CancellationToken::new();

        let reader = task::spawn(read_loop(ReadLoop {
            name: name.clone(),
            frames: FramedRead::with_capacity(read_half, FrameCodec::new(), READ_CHUNK_BYTES),
            handler,
            stop: reader_stop.clone(),
            close_expected: Arc::clone(&close_expected),
            faults: faults.clone(),
            diagnostics: diagnostics.clone(),
            telemetry: Arc::clone(&telemetry),
        }));
        let writer = task::spawn(write_loop(
            name.clone(),
            FramedWrite::new(write_half, FrameCodec::new()),
            rx,
            writer_stop.clone(),
            faults.clone(),
        ));

        Self {
            name,
            sender: FrameSender {
                tx,
                close_expected,
                telemetry,
            },
            reader: Some(reader),
            writer: Some(writer),
            reader_stop,
            writer_stop,
            faults,
            diagnostics,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    /// Drains queued output, stops both tasks and surfaces the first I/O fault
    /// observed on the connection.
    pub async fn shutdown(mut self) -> Result<(), TransportError> {
        self.writer_stop.cancel();
        if let Some(handle) = self.writer.take() {
            if let Err(err) = handle.await {
                tracing::warn!(transport = %self.name, error = %err, "writer task panicked");
            }
        }

        self.reader_stop.cancel();
        if let Some(handle) = self.reader.take() {
            if let Err(err) = handle.await {
                tracing::warn!(transport = %self.name, error = %err, "reader task panicked");
            }
        }

        match self.faults.take() {
            Some(err) => {
                self.diagnostics
                    .warn(format!("abnormal termination of pipe: {err}"));
                Err(TransportError::Io(err))
            }
            None => Ok(()),
        }
    }
}

impl Drop for FramedTransport {
    fn drop(&mut self) {
        self.writer_stop.cancel();
        self.reader_stop.cancel();
    }
}

struct ReadLoop<S> {
    name: String,
    frames: FramedRead<ReadHalf<S>, FrameCodec>,
    handler: FrameHandler,
    stop: CancellationToken,
    close_expected: Arc<AtomicBool>,
    faults: FaultSlot<io::Error>,
    diagnostics: Diagnostics,
    telemetry: Arc<Telemetry>,
}

async fn read_loop<S>(params: ReadLoop<S>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let ReadLoop {
        name,
        mut frames,
        handler,
        stop,
        close_expected,
        faults,
        diagnostics,
        telemetry,
    } = params;

    loop {
        let next = select! {
            biased;
            _ = stop.cancelled() => break,
            next = frames.next() => next,
        };

        match next {
            Some(Ok(frame)) => {
                telemetry.record_frame_received();
                let outcome = catch_unwind(AssertUnwindSafe(|| handler(frame)));
                if let Err(panic) = outcome {
                    diagnostics.warn(format!(
                        "receive handler panicked: {}",
                        panic_message(panic.as_ref())
                    ));
                }
            }
            Some(Err(err)) => {
                tracing::warn!(transport = %name, error = %err, "read failed");
                faults.record(err);
                break;
            }
            None => {
                let pending = frames.read_buffer().len();
                if pending > 0 {
                    diagnostics.report(format!(
                        "discarding {pending} bytes of incomplete frame at end of stream"
                    ));
                }
                if close_expected.load(Ordering::SeqCst) {
                    tracing::debug!(transport = %name, "remote end closed the stream");
                } else {
                    faults.record(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by remote end",
                    ));
                    diagnostics.report("remote end closed the connection");
                }
                break;
            }
        }
    }
}

async fn write_loop<S>(
    name: String,
    mut frames: FramedWrite<WriteHalf<S>, FrameCodec>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    stop: CancellationToken,
    faults: FaultSlot<io::Error>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    loop {
        let chunk = select! {
            biased;
            chunk = rx.recv() => chunk,
            _ = stop.cancelled() => None,
        };
        let Some(chunk) = chunk else { break };
        if let Err(err) = frames.send(chunk).await {
            tracing::warn!(transport = %name, error = %err, "write failed");
            faults.record(err);
            return;
        }
    }

    rx.close();
    while let Ok(chunk) = rx.try_recv() {
        if let Err(err) = frames.send(chunk).await {
            tracing::warn!(transport = %name, error = %err, "write failed while draining");
            faults.record(err);
            return;
        }
    }

    if let Err(err) = frames.close().await {
        tracing::debug!(transport = %name, error = %err, "write half shutdown failed");
    }
}
