//! TCP transport for the spalloc protocol.
//!
//! A [`Connection`] is split into a [`FrameReader`], owned by the
//! client's receive loop, and a [`FrameWriter`], shared by every task
//! that issues commands. Writes are serialized by a mutex held for the
//! duration of a single frame so concurrent frames never interleave.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, SpallocError};
use crate::protocol::codec::LineBuffer;

/// Size of each socket read.
const READ_CHUNK: usize = 4096;

/// What a single [`FrameReader::receive`] produced.
#[derive(Debug, PartialEq, Eq)]
pub enum Received {
    /// One complete frame, newline stripped
    Frame(Vec<u8>),
    /// The peer closed the stream cleanly between frames
    Eof,
}

/// Opens connections to a spalloc server.
pub struct Transport;

impl Transport {
    /// Connect to `hostname:port`.
    ///
    /// Each resolved address is tried in turn. `timeout` bounds the whole
    /// attempt; `None` waits for the OS connect timeout.
    pub async fn connect(hostname: &str, port: u16, timeout: Option<Duration>) -> Result<Connection> {
        let attempt = Self::connect_any(hostname, port);
        match timeout {
            Some(limit) => tokio::time::timeout(limit, attempt).await.map_err(|_| {
                SpallocError::ProtocolTimeout {
                    command: "connect".to_string(),
                    timeout: limit,
                }
            })?,
            None => attempt.await,
        }
    }

    async fn connect_any(hostname: &str, port: u16) -> Result<Connection> {
        let addrs = lookup_host((hostname, port)).await.map_err(|e| {
            SpallocError::connection(format!("Invalid address '{}:{}': {}", hostname, port, e))
        })?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    debug!("Connected to spalloc server at {}", addr);
                    return Ok(Connection { stream, peer: addr });
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(SpallocError::connection(format!(
            "Failed to connect to {}:{}: {}",
            hostname,
            port,
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no addresses resolved".to_string())
        )))
    }
}

/// An open connection to the server.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
}

impl Connection {
    /// Address of the server.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Split into independently owned read and write halves.
    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        let (read_half, write_half) = self.stream.into_split();
        (
            FrameReader {
                reader: read_half,
                buffer: LineBuffer::new(),
                eof: false,
            },
            FrameWriter {
                writer: Mutex::new(Some(write_half)),
            },
        )
    }
}

/// Read side of a connection. Only the receive loop owns one.
#[derive(Debug)]
pub struct FrameReader {
    reader: OwnedReadHalf,
    buffer: LineBuffer,
    eof: bool,
}

impl FrameReader {
    /// Receive the next frame.
    ///
    /// `None` blocks until a frame arrives; `Some(Duration::ZERO)` only
    /// returns frames that are already available. Returns
    /// [`SpallocError::ProtocolTimeout`] when the timeout elapses; bytes
    /// read so far stay buffered for the next call.
    pub async fn receive(&mut self, timeout: Option<Duration>) -> Result<Received> {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.receive_frame())
                .await
                .map_err(|_| SpallocError::ProtocolTimeout {
                    command: "receive".to_string(),
                    timeout: limit,
                })?,
            None => self.receive_frame().await,
        }
    }

    async fn receive_frame(&mut self) -> Result<Received> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.buffer.next_frame()? {
                return Ok(Received::Frame(frame));
            }
            if self.eof {
                return Ok(Received::Eof);
            }

            // `read` is cancel safe: nothing is consumed unless it completes
            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                self.eof = true;
                self.buffer.finish()?;
                return Ok(Received::Eof);
            }
            self.buffer.extend(&chunk[..n]);
        }
    }
}

/// Write side of a connection, shared by all callers.
#[derive(Debug)]
pub struct FrameWriter {
    writer: Mutex<Option<OwnedWriteHalf>>,
}

impl FrameWriter {
    /// Write one complete frame.
    pub async fn send(&self, frame: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(SpallocError::ConnectionClosed)?;
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Close the write side; later sends fail with `ConnectionClosed`.
    pub async fn shutdown(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}
