//! Channel transport layer
//!
//! One [`ChannelSocket`] per logical channel. The trait keeps the transport
//! swappable: TCP with explicit multipart framing for live kernels, an
//! in-memory pair for tests. Sockets carry opaque frame lists; framing and
//! signing of message bodies is the codec's job.
//!
//! A socket splits into independently owned send and receive halves so the
//! per-channel receive loop blocks only on socket readiness and is never
//! cancelled mid-read by outbound traffic.

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{Error, Result};

/// Upper bound on frames per message; anything larger is a corrupt stream.
const MAX_FRAMES: u32 = 1024;
/// Upper bound on a single frame, 64 MiB.
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// The five logical channel roles of the kernel wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Request/reply: execution and introspection requests.
    Shell,
    /// Request/reply: out-of-band requests (interrupt, shutdown).
    Control,
    /// Request/reply, kernel-initiated: input prompts.
    Stdin,
    /// Publish/subscribe, kernel to bridge only: status, stream output,
    /// display data, results, errors.
    IoPub,
    /// Pure echo: opaque liveness probes.
    Heartbeat,
}

/// Message direction a channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Bidirectional,
    KernelToBridge,
}

impl ChannelKind {
    pub fn name(&self) -> &'static str {
        match self {
            ChannelKind::Shell => "shell",
            ChannelKind::Control => "control",
            ChannelKind::Stdin => "stdin",
            ChannelKind::IoPub => "iopub",
            ChannelKind::Heartbeat => "hb",
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            ChannelKind::IoPub => Direction::KernelToBridge,
            _ => Direction::Bidirectional,
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Outbound half of a channel socket.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one multipart message.
    async fn send(&mut self, frames: Vec<Vec<u8>>) -> Result<()>;

    /// Close the outbound side.
    async fn close(&mut self) -> Result<()>;
}

/// Inbound half of a channel socket.
#[async_trait]
pub trait FrameSource: Send {
    /// Receive one multipart message. Blocks only on socket readiness.
    async fn recv(&mut self) -> Result<Vec<Vec<u8>>>;
}

/// One channel endpoint, splittable into its two halves.
pub trait ChannelSocket: Send {
    fn into_split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameSource>);
}

// ---------------------------------------------------------------------------
// TCP

/// TCP channel socket with length-prefixed multipart framing.
///
/// Wire layout per message: `u32` frame count, then per frame a `u32` length
/// followed by the frame bytes, all big-endian.
pub struct TcpChannelSocket {
    stream: TcpStream,
}

impl TcpChannelSocket {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Connect to a channel endpoint.
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            Error::Connection(format!("failed to connect channel to {}: {}", addr, e))
        })?;
        debug!("Channel connected to {}", addr);
        Ok(Self::new(stream))
    }
}

impl ChannelSocket for TcpChannelSocket {
    fn into_split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameSource>) {
        let (read, write) = self.stream.into_split();
        (Box::new(TcpFrameSink { write }), Box::new(TcpFrameSource { read }))
    }
}

pub struct TcpFrameSink {
    write: OwnedWriteHalf,
}

pub struct TcpFrameSource {
    read: OwnedReadHalf,
}

#[async_trait]
impl FrameSink for TcpFrameSink {
    async fn send(&mut self, frames: Vec<Vec<u8>>) -> Result<()> {
        self.write.write_u32(frames.len() as u32).await?;
        for frame in &frames {
            self.write.write_u32(frame.len() as u32).await?;
            self.write.write_all(frame).await?;
        }
        self.write.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Err(e) = self.write.shutdown().await {
            debug!("Error shutting down channel socket: {}", e);
        }
        Ok(())
    }
}

#[async_trait]
impl FrameSource for TcpFrameSource {
    async fn recv(&mut self) -> Result<Vec<Vec<u8>>> {
        let count = match self.read.read_u32().await {
            Ok(count) => count,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(Error::Connection("channel closed by peer".to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        if count > MAX_FRAMES {
            return Err(Error::Transport(format!(
                "frame count {} exceeds limit",
                count
            )));
        }

        let mut frames = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = self.read.read_u32().await?;
            if len > MAX_FRAME_LEN {
                return Err(Error::Transport(format!(
                    "frame length {} exceeds limit",
                    len
                )));
            }
            let mut frame = vec![0u8; len as usize];
            self.read.read_exact(&mut frame).await?;
            frames.push(frame);
        }
        Ok(frames)
    }
}

// ---------------------------------------------------------------------------
// In-memory

/// In-memory channel socket for testing and local wiring.
pub struct InMemoryChannelSocket {
    sender: mpsc::UnboundedSender<Vec<Vec<u8>>>,
    receiver: mpsc::UnboundedReceiver<Vec<Vec<u8>>>,
}

impl InMemoryChannelSocket {
    /// Create a pair of connected in-memory sockets; one side plays the
    /// bridge, the other the kernel.
    pub fn pair() -> (Self, Self) {
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();

        (
            Self {
                sender: tx1,
                receiver: rx2,
            },
            Self {
                sender: tx2,
                receiver: rx1,
            },
        )
    }

    /// Send without splitting; convenient for test harnesses.
    pub async fn send(&mut self, frames: Vec<Vec<u8>>) -> Result<()> {
        self.sender
            .send(frames)
            .map_err(|_| Error::Connection("peer socket dropped".to_string()))
    }

    /// Receive without splitting; convenient for test harnesses.
    pub async fn recv(&mut self) -> Result<Vec<Vec<u8>>> {
        self.receiver
            .recv()
            .await
            .ok_or_else(|| Error::Connection("channel closed by peer".to_string()))
    }
}

impl ChannelSocket for InMemoryChannelSocket {
    fn into_split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameSource>) {
        (
            Box::new(InMemoryFrameSink {
                sender: self.sender,
            }),
            Box::new(InMemoryFrameSource {
                receiver: self.receiver,
            }),
        )
    }
}

pub struct InMemoryFrameSink {
    sender: mpsc::UnboundedSender<Vec<Vec<u8>>>,
}

pub struct InMemoryFrameSource {
    receiver: mpsc::UnboundedReceiver<Vec<Vec<u8>>>,
}

#[async_trait]
impl FrameSink for InMemoryFrameSink {
    async fn send(&mut self, frames: Vec<Vec<u8>>) -> Result<()> {
        self.sender
            .send(frames)
            .map_err(|_| Error::Connection("peer socket dropped".to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl FrameSource for InMemoryFrameSource {
    async fn recv(&mut self) -> Result<Vec<Vec<u8>>> {
        self.receiver
            .recv()
            .await
            .ok_or_else(|| Error::Connection("channel closed by peer".to_string()))
    }
}
