//! Relay-side endpoint
//!
//! Accepts the legacy client's connection, then bridges two worlds into
//! Wire streams: the host agent's PTY (terminal channel) and the tool
//! adapter's typed operations ([`RemoteOps`]), each realized as exactly
//! one even-numbered stream. Stream failures surface as typed errors
//! and never disturb the terminal channel.
//!
//! The PTY spawn glue stays outside: callers hand [`Relay::run`] a pair
//! of channels ([`TermHooks`]) and pump the PTY themselves.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::flow::{AckCounter, FlowControl};
use crate::framer::Framer;
use crate::messages::{
    self, DirEntryWire, Hello, OpenMeta, SearchHit, StatReply, StreamEnd, StreamError,
};
use crate::mux::{Disposition, Mux, Side, StreamMsg};
use crate::protocol::{
    bye, err, exit, flags, kind, packet, status, timeouts, ASSIGNED_TYPE_MAX, CHUNK_SIZE,
    DEFAULT_WINDOW, MAX_PACKET_SIZE,
};
use crate::session::{self, PacketSink};
use crate::trace::{Dir, Trace};

// Terminal output is forwarded in slices no larger than this so a
// minimum-window peer can always absorb one send
const TERM_SLICE: usize = 8 * 1024;

pub struct RelayConfig {
    /// Our receive window advertisement.
    pub window: u32,
    /// Deadline applied to every adapter operation; a stream that blows
    /// it is canceled.
    pub op_timeout: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            window: DEFAULT_WINDOW,
            op_timeout: Some(Duration::from_secs(60)),
        }
    }
}

/// Events the session sends toward the PTY glue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TermEvent {
    Input(Vec<u8>),
    Resize { rows: u16, cols: u16 },
}

/// Channel pair wiring the PTY glue to the session.
pub struct TermHooks {
    /// Bytes the PTY produced; forwarded as TERM_OUTPUT.
    pub pty_output: mpsc::Receiver<Vec<u8>>,
    /// Keystrokes and resizes for the PTY.
    pub pty_events: mpsc::Sender<TermEvent>,
}

// ---------------------------------------------------------------------------
// Terminal replay ring

/// Bounded ring of recent terminal output. The PTY glue keeps one
/// across client sessions and feeds its snapshot to a client that
/// reconnects with the resume flag (best-effort resume).
pub struct ReplayBuffer {
    buf: Vec<u8>,
    write_pos: usize,
    filled: bool,
    max: usize,
}

impl ReplayBuffer {
    pub fn new(max: usize) -> ReplayBuffer {
        ReplayBuffer {
            buf: vec![0; max],
            write_pos: 0,
            filled: false,
            max,
        }
    }

    pub fn write(&mut self, data: &[u8]) {
        if self.max == 0 {
            return;
        }
        if data.len() >= self.max {
            let start = data.len() - self.max;
            self.buf.copy_from_slice(&data[start..]);
            self.write_pos = 0;
            self.filled = true;
            return;
        }
        let space = self.max - self.write_pos;
        if data.len() <= space {
            self.buf[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
            self.write_pos += data.len();
            if self.write_pos == self.max {
                self.write_pos = 0;
                self.filled = true;
            }
        } else {
            self.buf[self.write_pos..].copy_from_slice(&data[..space]);
            let rest = data.len() - space;
            self.buf[..rest].copy_from_slice(&data[space..]);
            self.write_pos = rest;
            self.filled = true;
        }
    }

    /// Linearized contents, oldest byte first.
    pub fn snapshot(&self) -> Vec<u8> {
        if !self.filled {
            return self.buf[..self.write_pos].to_vec();
        }
        let mut out = Vec::with_capacity(self.max);
        out.extend_from_slice(&self.buf[self.write_pos..]);
        out.extend_from_slice(&self.buf[..self.write_pos]);
        out
    }
}

// ---------------------------------------------------------------------------
// Operation errors and results

#[derive(Debug)]
pub enum OpError {
    /// The legacy side reported a structured failure.
    Remote { code: u8, message: String },
    Cancelled,
    TimedOut,
    Disconnected,
    NoResources,
    /// The reply did not parse.
    Protocol(String),
}

impl std::fmt::Display for OpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpError::Remote { code, message } => {
                write!(f, "remote error 0x{:02X}: {}", code, message)
            }
            OpError::Cancelled => write!(f, "canceled"),
            OpError::TimedOut => write!(f, "operation timed out"),
            OpError::Disconnected => write!(f, "connection closed"),
            OpError::NoResources => write!(f, "stream table full"),
            OpError::Protocol(msg) => write!(f, "malformed reply: {}", msg),
        }
    }
}

impl std::error::Error for OpError {}

pub type OpResult<T> = std::result::Result<T, OpError>;

fn check_end(end_status: u8) -> OpResult<()> {
    match end_status {
        status::OK => Ok(()),
        status::CANCELLED => Err(OpError::Cancelled),
        _ => Err(OpError::Remote {
            code: err::UNKNOWN,
            message: "stream ended abnormally".into(),
        }),
    }
}

/// How an executed command finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ExecExit {
    Normal(u32),
    Signal(u32),
    TimedOut,
    Cancelled,
    Unknown,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecOutcome {
    /// (channel, bytes) chunks in arrival order.
    pub output: Vec<(u8, Vec<u8>)>,
    pub exit: ExecExit,
}

impl ExecOutcome {
    /// Stdout and stderr merged in arrival order.
    pub fn merged_output(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (_, chunk) in &self.output {
            out.extend_from_slice(chunk);
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Shared session state

struct Shared {
    mux: Mutex<Mux>,
    sink: PacketSink,
    flow: Arc<FlowControl>,
    op_timeout: Option<Duration>,
    cwd: Vec<u8>,
}

/// Typed operation API handed to the tool-call adapter. Every call maps
/// onto at most one Wire stream, drained to completion.
#[derive(Clone)]
pub struct RemoteOps {
    shared: Arc<Shared>,
}

/// An open stream seen from the initiator's side.
struct OpStream {
    id: u32,
    rx: mpsc::Receiver<StreamMsg>,
    shared: Arc<Shared>,
    started: Instant,
    finished: bool,
}

impl RemoteOps {
    /// Resolve a cwd-relative path against the working directory the
    /// client announced in HELLO.
    pub fn resolve(&self, path: &[u8]) -> Vec<u8> {
        if path.first() == Some(&b'/') {
            return path.to_vec();
        }
        let mut out = self.shared.cwd.clone();
        if out.last() != Some(&b'/') {
            out.push(b'/');
        }
        out.extend_from_slice(path);
        out
    }

    pub fn remote_cwd(&self) -> &[u8] {
        &self.shared.cwd
    }

    async fn open(&self, stream_kind: u8, meta: &OpenMeta) -> OpResult<OpStream> {
        let (tx, rx) = mpsc::channel::<StreamMsg>(64);
        let (cancel_tx, _cancel_rx) = watch::channel(false);
        let id = {
            let mut mux = self.shared.mux.lock();
            mux.open_local(stream_kind, tx, cancel_tx)
                .ok_or(OpError::NoResources)?
        };
        let payload = messages::encode_open(id, stream_kind, meta);
        if !self.shared.sink.send(packet::STREAM_OPEN, &payload).await {
            self.shared.mux.lock().forget(id);
            return Err(OpError::Disconnected);
        }
        Ok(OpStream {
            id,
            rx,
            shared: self.shared.clone(),
            started: Instant::now(),
            finished: false,
        })
    }

    pub async fn read_file(&self, path: &[u8]) -> OpResult<Vec<u8>> {
        let mut s = self
            .open(kind::FILE_READ, &OpenMeta::Path(self.resolve(path)))
            .await?;
        let mut out = Vec::new();
        loop {
            match s.next().await? {
                StreamMsg::Data(body) => out.extend_from_slice(&body),
                StreamMsg::End { status: st, .. } => {
                    check_end(st)?;
                    return Ok(out);
                }
                other => return Err(s.unexpected(other)),
            }
        }
    }

    pub async fn write_file(&self, path: &[u8], mode: u16, data: &[u8]) -> OpResult<()> {
        let mut s = self
            .open(
                kind::FILE_WRITE,
                &OpenMeta::WriteFile {
                    path: self.resolve(path),
                    mode,
                },
            )
            .await?;

        for chunk in data.chunks(CHUNK_SIZE) {
            if !self.shared.flow.reserve(chunk.len()).await {
                return Err(OpError::Disconnected);
            }
            let payload = messages::encode_data(s.id, chunk);
            if !self.shared.sink.send(packet::STREAM_DATA, &payload).await {
                return Err(OpError::Disconnected);
            }
        }

        let end = StreamEnd {
            id: s.id,
            status: status::OK,
            detail: None,
        };
        if !self.shared.sink.send(packet::STREAM_END, &end.encode()).await {
            return Err(OpError::Disconnected);
        }
        self.shared.mux.lock().on_local_end(s.id);

        match s.next().await? {
            StreamMsg::End { status: st, .. } => check_end(st),
            other => Err(s.unexpected(other)),
        }
    }

    pub async fn stat(&self, path: &[u8]) -> OpResult<StatReply> {
        self.stat_inner(kind::STAT, path).await
    }

    pub async fn lstat(&self, path: &[u8]) -> OpResult<StatReply> {
        self.stat_inner(kind::LSTAT, path).await
    }

    async fn stat_inner(&self, stream_kind: u8, path: &[u8]) -> OpResult<StatReply> {
        let mut s = self
            .open(stream_kind, &OpenMeta::Path(self.resolve(path)))
            .await?;
        let mut reply = None;
        loop {
            match s.next().await? {
                StreamMsg::Data(body) => {
                    reply = Some(
                        StatReply::parse(&body).map_err(|e| OpError::Protocol(e.to_string()))?,
                    );
                }
                StreamMsg::End { status: st, .. } => {
                    check_end(st)?;
                    return reply.ok_or_else(|| OpError::Protocol("missing stat reply".into()));
                }
                other => return Err(s.unexpected(other)),
            }
        }
    }

    pub async fn exists(&self, path: &[u8]) -> OpResult<bool> {
        let mut s = self
            .open(kind::EXISTS, &OpenMeta::Path(self.resolve(path)))
            .await?;
        let mut found = false;
        loop {
            match s.next().await? {
                StreamMsg::Data(body) => found = body.first().copied().unwrap_or(0) != 0,
                StreamMsg::End { status: st, .. } => {
                    check_end(st)?;
                    return Ok(found);
                }
                other => return Err(s.unexpected(other)),
            }
        }
    }

    pub async fn list_dir(&self, path: &[u8]) -> OpResult<Vec<DirEntryWire>> {
        let mut s = self
            .open(kind::DIR_LIST, &OpenMeta::Path(self.resolve(path)))
            .await?;
        let mut entries = Vec::new();
        loop {
            match s.next().await? {
                StreamMsg::Data(body) => entries.push(
                    DirEntryWire::parse(&body).map_err(|e| OpError::Protocol(e.to_string()))?,
                ),
                StreamMsg::End { status: st, .. } => {
                    check_end(st)?;
                    return Ok(entries);
                }
                other => return Err(s.unexpected(other)),
            }
        }
    }

    pub async fn mkdir(&self, path: &[u8]) -> OpResult<()> {
        self.unit_op(kind::MKDIR, &OpenMeta::Path(self.resolve(path)))
            .await
    }

    pub async fn remove(&self, path: &[u8]) -> OpResult<()> {
        self.unit_op(kind::REMOVE, &OpenMeta::Path(self.resolve(path)))
            .await
    }

    pub async fn rename(&self, from: &[u8], to: &[u8]) -> OpResult<()> {
        self.unit_op(
            kind::MOVE,
            &OpenMeta::Move {
                from: self.resolve(from),
                to: self.resolve(to),
            },
        )
        .await
    }

    async fn unit_op(&self, stream_kind: u8, meta: &OpenMeta) -> OpResult<()> {
        let mut s = self.open(stream_kind, meta).await?;
        loop {
            match s.next().await? {
                StreamMsg::Data(_) => {}
                StreamMsg::End { status: st, .. } => return check_end(st),
                other => return Err(s.unexpected(other)),
            }
        }
    }

    pub async fn realpath(&self, path: &[u8]) -> OpResult<Vec<u8>> {
        let mut s = self
            .open(kind::REALPATH, &OpenMeta::Path(self.resolve(path)))
            .await?;
        let mut resolved = None;
        loop {
            match s.next().await? {
                StreamMsg::Data(body) => {
                    let (p, _) = messages::take_strz(&body, 0)
                        .map_err(|e| OpError::Protocol(e.to_string()))?;
                    resolved = Some(p.to_vec());
                }
                StreamMsg::End { status: st, .. } => {
                    check_end(st)?;
                    return resolved.ok_or_else(|| OpError::Protocol("missing path".into()));
                }
                other => return Err(s.unexpected(other)),
            }
        }
    }

    pub async fn find(&self, base: &[u8], pattern: &[u8]) -> OpResult<Vec<Vec<u8>>> {
        let mut s = self
            .open(
                kind::FIND,
                &OpenMeta::Find {
                    base: self.resolve(base),
                    pattern: pattern.to_vec(),
                },
            )
            .await?;
        let mut paths = Vec::new();
        loop {
            match s.next().await? {
                StreamMsg::Data(body) => {
                    let (p, _) = messages::take_strz(&body, 0)
                        .map_err(|e| OpError::Protocol(e.to_string()))?;
                    paths.push(p.to_vec());
                }
                StreamMsg::End { status: st, .. } => {
                    check_end(st)?;
                    return Ok(paths);
                }
                other => return Err(s.unexpected(other)),
            }
        }
    }

    pub async fn search(
        &self,
        base: &[u8],
        pattern: &[u8],
        name_pattern: Option<&[u8]>,
    ) -> OpResult<Vec<SearchHit>> {
        let mut s = self
            .open(
                kind::SEARCH,
                &OpenMeta::Search {
                    base: self.resolve(base),
                    pattern: pattern.to_vec(),
                    name_pattern: name_pattern.map(|p| p.to_vec()),
                },
            )
            .await?;
        let mut hits = Vec::new();
        loop {
            match s.next().await? {
                StreamMsg::Data(body) => hits
                    .push(SearchHit::parse(&body).map_err(|e| OpError::Protocol(e.to_string()))?),
                StreamMsg::End { status: st, .. } => {
                    check_end(st)?;
                    return Ok(hits);
                }
                other => return Err(s.unexpected(other)),
            }
        }
    }

    /// Run a shell command, streaming until exit. `deadline` overrides
    /// the configured op timeout; on expiry the stream is canceled and
    /// the outcome reports what ran before the cut.
    pub async fn exec(&self, command: &[u8], deadline: Option<Duration>) -> OpResult<ExecOutcome> {
        let mut s = self
            .open(
                kind::EXEC,
                &OpenMeta::Exec {
                    command: command.to_vec(),
                },
            )
            .await?;
        if let Some(d) = deadline {
            s.started = Instant::now();
            // Narrow the per-stream budget to the explicit deadline
            return self.exec_collect(s, Some(d)).await;
        }
        let limit = self.shared.op_timeout;
        self.exec_collect(s, limit).await
    }

    async fn exec_collect(
        &self,
        mut s: OpStream,
        limit: Option<Duration>,
    ) -> OpResult<ExecOutcome> {
        let mut output = Vec::new();
        let mut timed_out = false;

        loop {
            let left = match (timed_out, limit) {
                (true, _) => Some(Duration::from_secs(5)), // draining after cancel
                (false, Some(l)) => Some(l.saturating_sub(s.started.elapsed())),
                (false, None) => None,
            };
            match s.next_raw(left).await {
                Ok(StreamMsg::Data(body)) => {
                    if let Some((&channel, bytes)) = body.split_first() {
                        output.push((channel, bytes.to_vec()));
                    }
                }
                Ok(StreamMsg::End { status: st, detail }) => {
                    s.finished = true;
                    let exit = if timed_out {
                        ExecExit::TimedOut
                    } else {
                        match (st, detail) {
                            (exit::NORMAL, Some(code)) => ExecExit::Normal(code),
                            (exit::SIGNAL, Some(sig)) => ExecExit::Signal(sig),
                            // CANCELLED and the timeout discriminant
                            // share a value; a plain End here means the
                            // far side stopped the child
                            (status::CANCELLED, _) => ExecExit::Cancelled,
                            _ => ExecExit::Unknown,
                        }
                    };
                    return Ok(ExecOutcome { output, exit });
                }
                Ok(StreamMsg::Error { code, message }) => {
                    s.finished = true;
                    return Err(OpError::Remote { code, message });
                }
                Ok(StreamMsg::Cancelled) => {
                    s.finished = true;
                    return Err(OpError::Cancelled);
                }
                Err(OpError::TimedOut) if !timed_out => {
                    s.cancel().await;
                    timed_out = true;
                }
                Err(OpError::TimedOut) => {
                    // The cancel went unanswered; abandon the stream
                    return Ok(ExecOutcome {
                        output,
                        exit: ExecExit::TimedOut,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl OpStream {
    /// Next message under the per-operation deadline. A timeout cancels
    /// the stream, waits briefly for the acknowledgement, and reports
    /// TimedOut.
    async fn next(&mut self) -> OpResult<StreamMsg> {
        let left = self
            .shared
            .op_timeout
            .map(|l| l.saturating_sub(self.started.elapsed()));
        match self.next_raw(left).await {
            Err(OpError::TimedOut) => {
                self.cancel().await;
                let _ = self.next_raw(Some(Duration::from_secs(5))).await;
                Err(OpError::TimedOut)
            }
            other => {
                if let Ok(StreamMsg::End { .. }) | Err(_) = &other {
                    self.finished = true;
                }
                other
            }
        }
    }

    async fn next_raw(&mut self, limit: Option<Duration>) -> OpResult<StreamMsg> {
        let recv = self.rx.recv();
        let msg = match limit {
            Some(l) => tokio::time::timeout(l, recv)
                .await
                .map_err(|_| OpError::TimedOut)?,
            None => recv.await,
        };
        match msg {
            Some(StreamMsg::Error { code, message }) => Err(OpError::Remote { code, message }),
            Some(StreamMsg::Cancelled) => Err(OpError::Cancelled),
            Some(m) => Ok(m),
            None => Err(OpError::Disconnected),
        }
    }

    async fn cancel(&self) {
        self.shared
            .sink
            .send(packet::STREAM_CANCEL, &messages::encode_cancel(self.id))
            .await;
    }

    fn unexpected(&self, msg: StreamMsg) -> OpError {
        OpError::Protocol(format!("unexpected message {:?}", msg))
    }
}

impl Drop for OpStream {
    fn drop(&mut self) {
        if !self.finished {
            // Abandoned mid-flight; release the table slot
            self.shared.mux.lock().forget(self.id);
        }
    }
}

// ---------------------------------------------------------------------------
// Session

pub struct Relay {
    shared: Arc<Shared>,
    read: tokio::net::tcp::OwnedReadHalf,
    framer: Framer,
    hello: Hello,
    trace: Arc<dyn Trace>,
    writer: tokio::task::JoinHandle<()>,
}

impl Relay {
    /// Accept-side handshake over a fresh TCP connection.
    pub async fn establish(
        stream: TcpStream,
        cfg: RelayConfig,
        trace: Arc<dyn Trace>,
    ) -> Result<Relay> {
        stream.set_nodelay(true).ok();
        let (mut read, write) = stream.into_split();
        let (sink, writer) = session::start_writer(write, trace.clone());
        let mut framer = Framer::new(MAX_PACKET_SIZE);

        let hello =
            match session::accept(&mut read, &mut framer, &sink, cfg.window, trace.as_ref()).await
            {
                Ok(h) => h,
                Err(e) => {
                    session::goodbye(&sink, bye::PROTOCOL_ERROR).await;
                    return Err(e).context("handshake");
                }
            };
        trace.note(&format!(
            "established: client window={} flags=0x{:02X} cwd={}",
            hello.window,
            hello.flags,
            String::from_utf8_lossy(&hello.cwd)
        ));

        let shared = Arc::new(Shared {
            mux: Mutex::new(Mux::new(Side::Relay)),
            sink,
            flow: FlowControl::new(hello.window),
            op_timeout: cfg.op_timeout,
            cwd: hello.cwd.clone(),
        });

        Ok(Relay {
            shared,
            read,
            framer,
            hello,
            trace,
            writer,
        })
    }

    pub fn ops(&self) -> RemoteOps {
        RemoteOps {
            shared: self.shared.clone(),
        }
    }

    pub fn hello(&self) -> &Hello {
        &self.hello
    }

    pub fn wants_simple(&self) -> bool {
        self.hello.flags & flags::SIMPLE != 0
    }

    pub fn wants_resume(&self) -> bool {
        self.hello.flags & flags::RESUME != 0
    }

    /// Drive the session until the client leaves or the connection
    /// fails. Consumes the relay; [`RemoteOps`] handles stay valid and
    /// start failing with Disconnected afterwards.
    pub async fn run(mut self, hooks: TermHooks) -> Result<()> {
        let TermHooks {
            mut pty_output,
            pty_events,
        } = hooks;

        // Terminal output is pumped by its own task so a full window
        // never stalls packet dispatch
        let pump_shared = self.shared.clone();
        let pump = tokio::spawn(async move {
            while let Some(bytes) = pty_output.recv().await {
                if !send_term_output(&pump_shared, &bytes).await {
                    break;
                }
            }
        });

        let result = self.event_loop(&pty_events).await;

        self.shared.flow.close();
        self.shared.mux.lock().close_all();
        pump.abort();
        // Adapter handles may still hold the sink, so the writer cannot
        // be joined by channel closure alone; give it a moment to drain
        // and cut it loose
        let _ = tokio::time::timeout(Duration::from_secs(1), &mut self.writer).await;
        self.writer.abort();
        result
    }

    async fn event_loop(&mut self, pty_events: &mpsc::Sender<TermEvent>) -> Result<()> {
        let mut acker = AckCounter::new();
        let mut last_inbound = Instant::now();
        let mut awaiting_pong: Option<Instant> = None;
        let mut ping_serial: u64 = 0;

        let mut tick = tokio::time::interval(Duration::from_secs(5));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut rbuf = [0u8; 8192];
        loop {
            tokio::select! {
                r = self.read.read(&mut rbuf) => {
                    let n = r.context("socket read")?;
                    if n == 0 {
                        bail!("connection closed by client");
                    }
                    last_inbound = Instant::now();
                    self.framer.feed(&rbuf[..n]);
                    loop {
                        let (t, payload) = match self.framer.next_packet() {
                            Ok(Some(p)) => p,
                            Ok(None) => break,
                            Err(e) => {
                                session::goodbye(&self.shared.sink, bye::PROTOCOL_ERROR).await;
                                return Err(anyhow!(e)).context("framing");
                            }
                        };
                        self.trace.packet(Dir::Recv, t, payload.len());
                        match self.dispatch(t, payload, &mut acker, &mut awaiting_pong, pty_events).await? {
                            Step::Continue => {}
                            Step::Goodbye => return Ok(()),
                        }
                    }
                }
                _ = tick.tick() => {
                    if let Some(sent) = awaiting_pong {
                        if sent.elapsed() > timeouts::PONG_DEADLINE {
                            session::goodbye(&self.shared.sink, bye::TIMEOUT).await;
                            bail!("keepalive probe unanswered");
                        }
                    } else if last_inbound.elapsed() > timeouts::PING_INTERVAL {
                        ping_serial += 1;
                        self.shared.sink.send(packet::PING, &ping_serial.to_be_bytes()).await;
                        awaiting_pong = Some(Instant::now());
                    }
                }
            }
        }
    }

    async fn dispatch(
        &self,
        t: u8,
        payload: Vec<u8>,
        acker: &mut AckCounter,
        awaiting_pong: &mut Option<Instant>,
        pty_events: &mpsc::Sender<TermEvent>,
    ) -> Result<Step> {
        match t {
            packet::TERM_INPUT => {
                let _ = pty_events.send(TermEvent::Input(payload)).await;
            }
            packet::TERM_RESIZE => {
                if let Ok((rows, cols)) = messages::parse_resize(&payload) {
                    let _ = pty_events.send(TermEvent::Resize { rows, cols }).await;
                }
            }
            packet::PING => {
                self.shared.sink.send(packet::PONG, &payload).await;
            }
            packet::PONG => {
                *awaiting_pong = None;
            }
            packet::GOODBYE => {
                self.trace.note(&format!(
                    "client goodbye reason={}",
                    messages::parse_goodbye(&payload)
                ));
                return Ok(Step::Goodbye);
            }
            packet::WINDOW_UPDATE => {
                if let Ok(inc) = messages::parse_window_update(&payload) {
                    self.trace.flow(&format!("credit +{}", inc));
                    if let Err(e) = self.shared.flow.credit(inc) {
                        session::goodbye(&self.shared.sink, bye::PROTOCOL_ERROR).await;
                        bail!("flow control: {}", e);
                    }
                }
            }
            packet::STREAM_OPEN => {
                // No operations are served on this side; the legacy
                // endpoint owns the filesystem
                if let Ok((id, _)) = messages::parse_open_header(&payload) {
                    self.send_reject(id, err::INVALID, "no operations served on relay side")
                        .await;
                }
            }
            packet::STREAM_DATA => {
                if let Ok((id, body)) = messages::split_stream_payload(&payload) {
                    let n = body.len();
                    let disposition = self.shared.mux.lock().on_data(id);
                    match disposition {
                        Disposition::Deliver(tx) | Disposition::DeliverFinal(tx) => {
                            let _ = tx.send(StreamMsg::Data(body.to_vec())).await;
                        }
                        Disposition::Ignore => {}
                        Disposition::Reject { code, message } => {
                            self.send_reject(id, code, message).await;
                        }
                    }
                    if let Some(inc) = acker.consume(n) {
                        self.send_window_update(inc).await;
                    }
                }
            }
            packet::STREAM_END => {
                if let Ok(end) = StreamEnd::parse(&payload) {
                    let disposition = self.shared.mux.lock().on_end(end.id);
                    match disposition {
                        Disposition::Deliver(tx) | Disposition::DeliverFinal(tx) => {
                            let _ = tx
                                .send(StreamMsg::End {
                                    status: end.status,
                                    detail: end.detail,
                                })
                                .await;
                        }
                        Disposition::Ignore | Disposition::Reject { .. } => {}
                    }
                    // Stream completion acknowledges whatever is pending
                    if let Some(inc) = acker.flush() {
                        self.send_window_update(inc).await;
                    }
                }
            }
            packet::STREAM_ERROR => {
                if let Ok(e) = StreamError::parse(&payload) {
                    let disposition = self.shared.mux.lock().on_error(e.id);
                    if let Disposition::DeliverFinal(tx) = disposition {
                        let _ = tx
                            .send(StreamMsg::Error {
                                code: e.code,
                                message: e.message,
                            })
                            .await;
                    }
                    if let Some(inc) = acker.flush() {
                        self.send_window_update(inc).await;
                    }
                }
            }
            packet::STREAM_CANCEL => {
                if let Ok(id) = messages::parse_cancel(&payload) {
                    let disposition = self.shared.mux.lock().on_cancel(id);
                    if let Disposition::DeliverFinal(tx) = disposition {
                        let _ = tx.send(StreamMsg::Cancelled).await;
                    }
                }
            }
            packet::TERM_OUTPUT | packet::HELLO | packet::HELLO_ACK => {}
            unknown if unknown <= ASSIGNED_TYPE_MAX => {
                session::goodbye(&self.shared.sink, bye::PROTOCOL_ERROR).await;
                bail!("unknown packet type 0x{:02X}", unknown);
            }
            _ => {
                // Reserved high range: ignore silently
            }
        }
        Ok(Step::Continue)
    }

    async fn send_reject(&self, id: u32, code: u8, message: &str) {
        let e = StreamError {
            id,
            code,
            message: message.to_string(),
        };
        self.shared.sink.send(packet::STREAM_ERROR, &e.encode()).await;
    }

    async fn send_window_update(&self, inc: u32) {
        self.shared
            .sink
            .send(packet::WINDOW_UPDATE, &messages::encode_window_update(inc))
            .await;
    }
}

/// Forward terminal bytes in window-friendly slices.
async fn send_term_output(shared: &Arc<Shared>, bytes: &[u8]) -> bool {
    for slice in bytes.chunks(TERM_SLICE) {
        if !shared.flow.reserve(slice.len()).await {
            return false;
        }
        if !shared.sink.send(packet::TERM_OUTPUT, slice).await {
            return false;
        }
    }
    true
}

enum Step {
    Continue,
    Goodbye,
}
