use crate::config::AtConfig;
use crate::error::TransportError;
use crate::models::ConnectionType;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::info;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt};

/// Line-oriented duplex channel to the modem.
#[async_trait]
pub trait Transport: Send {
    /// Write `data` as-is. Callers add line endings.
    async fn write(&mut self, data: &str) -> Result<(), TransportError>;

    /// Wait at most `wait` for the next non-empty line, without its line ending.
    async fn read_line(&mut self, wait: Duration) -> Result<String, TransportError>;
}

/// Frames an async byte stream (serial port, TCP socket) into lines.
pub struct LineChannel<S> {
    stream: S,
    buffer: Vec<u8>,
}

impl<S> LineChannel<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
        }
    }
}

#[async_trait]
impl<S> Transport for LineChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, data: &str) -> Result<(), TransportError> {
        self.stream.write_all(data.as_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self, wait: Duration) -> Result<String, TransportError> {
        let deadline = Instant::now() + wait;
        let mut buf = [0u8; 1024];

        loop {
            if let Some(line) = extract_next_line(&mut self.buffer) {
                return Ok(line);
            }
            // The data prompt is not followed by a newline
            if let Some(prompt) = extract_prompt(&mut self.buffer) {
                return Ok(prompt);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout);
            }

            match timeout(remaining, self.stream.read(&mut buf)).await {
                Ok(Ok(0)) => return Err(TransportError::Closed),
                Ok(Ok(n)) => self.buffer.extend_from_slice(&buf[..n]),
                Ok(Err(e)) => return Err(TransportError::Io(e)),
                Err(_) => return Err(TransportError::Timeout),
            }
        }
    }
}

fn extract_next_line(buffer: &mut Vec<u8>) -> Option<String> {
    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let remaining = buffer.split_off(pos + 1);
        let line_bytes = std::mem::replace(buffer, remaining);

        // Strips \n and any \r
        let line = String::from_utf8_lossy(&line_bytes).trim().to_string();
        if !line.is_empty() {
            return Some(line);
        }
    }
    None
}

fn extract_prompt(buffer: &mut Vec<u8>) -> Option<String> {
    let text = String::from_utf8_lossy(buffer);
    if text.trim_start().starts_with('>') && !text.contains('\n') {
        buffer.clear();
        return Some(">".to_string());
    }
    None
}

/// Open the transport selected by `config`.
pub async fn open(config: &AtConfig) -> Result<Box<dyn Transport>> {
    match config.connection_type {
        ConnectionType::Serial => {
            info!(
                "Opening serial port {} at {} (flow control {:?})",
                config.serial.port, config.serial.baudrate, config.serial.flow_control
            );
            let mut port = tokio_serial::new(&config.serial.port, config.serial.baudrate)
                .flow_control(config.serial.flow_control)
                .open_native_async()
                .with_context(|| format!("Failed to open serial port {}", config.serial.port))?;

            // No other process may talk to the modem while a run is in progress
            #[cfg(unix)]
            port.set_exclusive(true)
                .with_context(|| format!("Failed to lock serial port {}", config.serial.port))?;
            port.write_data_terminal_ready(true)
                .context("Failed to raise DTR")?;
            port.clear(ClearBuffer::All)
                .context("Failed to clear serial buffers")?;

            Ok(Box::new(LineChannel::new(port)))
        }
        ConnectionType::Network => {
            let addr = format!("{}:{}", config.network.host, config.network.port);
            info!("Connecting to network AT server at {}", addr);
            let stream = timeout(
                Duration::from_secs(config.network.timeout),
                TcpStream::connect(&addr),
            )
            .await
            .map_err(|_| anyhow::anyhow!("Connection to {} timed out", addr))?
            .context("Failed to connect to network AT server")?;
            info!("Connected to network AT server");
            Ok(Box::new(LineChannel::new(stream)))
        }
    }
}
