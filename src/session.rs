//! Connection plumbing shared by both endpoints
//!
//! One writer task serializes every outbound packet, so frames are never
//! interleaved mid-wire. Handlers and the connection loop talk to it
//! through a [`PacketSink`]. Stream handlers get a [`StreamCtx`] carrying
//! only their id, the sink, the flow window, and a cancel signal, never
//! a reference back into the connection, so teardown is a plain drop.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::flow::FlowControl;
use crate::framer::{encode, Framer};
use crate::messages::{self, Hello, HelloAck, StreamEnd, StreamError};
use crate::protocol::{packet, status, timeouts, VERSION};
use crate::trace::{Dir, Trace};

/// Handler lifecycle reports back to the connection loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// The stream's local direction finished (End was sent).
    Ended(u32),
    /// The stream failed or was abandoned locally; drop its entry.
    Closed(u32),
}

/// Cheap-to-clone handle that frames and enqueues one packet at a time.
#[derive(Clone)]
pub struct PacketSink {
    tx: mpsc::Sender<Vec<u8>>,
    trace: Arc<dyn Trace>,
}

impl PacketSink {
    /// Enqueue a packet; false means the connection is gone.
    pub async fn send(&self, t: u8, payload: &[u8]) -> bool {
        self.trace.packet(Dir::Send, t, payload.len());
        self.tx.send(encode(t, payload)).await.is_ok()
    }
}

/// Spawn the writer task over the socket's write half.
pub fn start_writer(
    mut write: OwnedWriteHalf,
    trace: Arc<dyn Trace>,
) -> (PacketSink, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
    let handle = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write.write_all(&frame).await.is_err() {
                break;
            }
        }
        let _ = write.shutdown().await;
    });
    (PacketSink { tx, trace }, handle)
}

/// Read until the framer yields one complete packet. `Ok(None)` is a
/// clean EOF; incomplete trailing bytes are discarded without error.
pub async fn read_packet(
    read: &mut OwnedReadHalf,
    framer: &mut Framer,
    trace: &dyn Trace,
) -> Result<Option<(u8, Vec<u8>)>> {
    let mut buf = [0u8; 8192];
    loop {
        if let Some((t, payload)) = framer.next_packet()? {
            trace.packet(Dir::Recv, t, payload.len());
            return Ok(Some((t, payload)));
        }
        let n = read.read(&mut buf).await.context("socket read")?;
        if n == 0 {
            return Ok(None);
        }
        framer.feed(&buf[..n]);
    }
}

/// Result of [`StreamCtx::data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// The peer canceled while we were waiting for credit or queueing.
    Cancelled,
    /// The connection is gone.
    Closed,
}

/// Per-stream handle given to operation handlers.
pub struct StreamCtx {
    pub id: u32,
    sink: PacketSink,
    flow: Arc<FlowControl>,
    cancel: watch::Receiver<bool>,
    lifecycle: mpsc::UnboundedSender<Lifecycle>,
}

impl StreamCtx {
    pub fn new(
        id: u32,
        sink: PacketSink,
        flow: Arc<FlowControl>,
        cancel: watch::Receiver<bool>,
        lifecycle: mpsc::UnboundedSender<Lifecycle>,
    ) -> StreamCtx {
        StreamCtx {
            id,
            sink,
            flow,
            cancel,
            lifecycle,
        }
    }

    pub fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Send one STREAM_DATA chunk, reserving flow credit for the body
    /// (the bytes after the id prefix) first.
    pub async fn data(&mut self, body: &[u8]) -> SendOutcome {
        if self.cancelled() {
            return SendOutcome::Cancelled;
        }
        tokio::select! {
            ok = self.flow.reserve(body.len()) => {
                if !ok {
                    return SendOutcome::Closed;
                }
            }
            _ = self.cancel.changed() => return SendOutcome::Cancelled,
        }
        let payload = messages::encode_data(self.id, body);
        if self.sink.send(packet::STREAM_DATA, &payload).await {
            SendOutcome::Sent
        } else {
            SendOutcome::Closed
        }
    }

    /// Finish the stream normally.
    pub async fn end_ok(&self) {
        self.end(status::OK, None).await;
    }

    pub async fn end(&self, end_status: u8, detail: Option<u32>) {
        let end = StreamEnd {
            id: self.id,
            status: end_status,
            detail,
        };
        let _ = self.sink.send(packet::STREAM_END, &end.encode()).await;
        let _ = self.lifecycle.send(Lifecycle::Ended(self.id));
    }

    /// Fail the stream. Closes it on both sides.
    pub async fn error(&self, code: u8, message: &str) {
        let e = StreamError {
            id: self.id,
            code,
            message: message.to_string(),
        };
        let _ = self.sink.send(packet::STREAM_ERROR, &e.encode()).await;
        let _ = self.lifecycle.send(Lifecycle::Closed(self.id));
    }
}

// ---------------------------------------------------------------------------
// Handshake

/// Client side: send HELLO, await a valid HELLO_ACK within the deadline.
pub async fn initiate(
    read: &mut OwnedReadHalf,
    framer: &mut Framer,
    sink: &PacketSink,
    flags: u8,
    window: u32,
    cwd: &[u8],
    trace: &dyn Trace,
) -> Result<HelloAck> {
    let hello = Hello {
        version: VERSION,
        flags,
        window,
        cwd: cwd.to_vec(),
    };
    if !sink.send(packet::HELLO, &hello.encode()).await {
        bail!("connection closed before HELLO");
    }

    let deadline = timeouts::HANDSHAKE;
    let (t, payload) = match timeout(deadline, read_packet(read, framer, trace)).await {
        Err(_) => bail!("timed out waiting for HELLO_ACK"),
        Ok(r) => r?.context("connection closed during handshake")?,
    };
    if t != packet::HELLO_ACK {
        bail!("expected HELLO_ACK, got 0x{:02X}", t);
    }
    let ack = HelloAck::parse(&payload)?;
    messages::check_version(ack.version)?;
    messages::check_window(ack.window)?;
    Ok(ack)
}

/// Acceptor side: the first packet must be HELLO. A stale text-framed
/// client is caught here by the type byte alone.
pub async fn accept(
    read: &mut OwnedReadHalf,
    framer: &mut Framer,
    sink: &PacketSink,
    window: u32,
    trace: &dyn Trace,
) -> Result<Hello> {
    let deadline = timeouts::HANDSHAKE;
    let (t, payload) = match timeout(deadline, read_packet(read, framer, trace)).await {
        Err(_) => bail!("timed out waiting for HELLO"),
        Ok(r) => r?.context("connection closed during handshake")?,
    };
    if t != packet::HELLO {
        bail!("expected HELLO, got 0x{:02X}", t);
    }
    let hello = Hello::parse(&payload)?;
    messages::check_version(hello.version)?;
    messages::check_window(hello.window)?;

    let ack = HelloAck {
        version: VERSION,
        flags: 0,
        window,
    };
    if !sink.send(packet::HELLO_ACK, &ack.encode()).await {
        bail!("connection closed before HELLO_ACK");
    }
    Ok(hello)
}

/// Best-effort GOODBYE before closing.
pub async fn goodbye(sink: &PacketSink, reason: u8) {
    let _ = sink.send(packet::GOODBYE, &messages::encode_goodbye(reason)).await;
}
