use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::helpers::WAIT;

/// Plays the worker side of the protocol by hand, one line at a time.
pub struct SimulatedWorker {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    local_port: u16,
}

impl SimulatedWorker {
    pub async fn connect(port: u16) -> Result<Self> {
        let stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .with_context(|| format!("failed to connect to runner on port {port}"))?;
        let local_port = stream.local_addr()?.port();
        let (reader, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
            local_port,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub async fn next_line(&mut self) -> Result<String> {
        match timeout(WAIT, self.lines.next_line()).await {
            Ok(Ok(Some(line))) => Ok(line),
            Ok(Ok(None)) => bail!("runner closed the connection"),
            Ok(Err(err)) => Err(err).context("failed to read from runner"),
            Err(_) => bail!("timed out waiting for a line from the runner"),
        }
    }

    pub async fn expect_eof(&mut self) -> Result<()> {
        match timeout(WAIT, self.lines.next_line()).await {
            Ok(Ok(None)) => Ok(()),
            Ok(Ok(Some(line))) => bail!("expected end of stream, got {line:?}"),
            Ok(Err(err)) => Err(err).context("failed to read from runner"),
            Err(_) => bail!("timed out waiting for the runner to close"),
        }
    }

    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Answers the runner's `INFO` the way a real worker would.
    pub async fn negotiate(&mut self, assembly: &str) -> Result<()> {
        let info = self.next_line().await?;
        if info != r#"INFO {"protocolVersion":"1.0"}"# {
            bail!("unexpected handshake {info:?}");
        }
        self.reply_info(assembly).await
    }

    pub async fn reply_info(&mut self, assembly: &str) -> Result<()> {
        self.send_line(&format!(
            r#"INFO {{"protocolVersion":"1.0","testAssemblyUniqueID":"{assembly}","testFrameworkDisplayName":"simulated"}}"#
        ))
        .await
    }
}
