//! Legacy-side endpoint
//!
//! Connects to the relay, completes the handshake, then drives one event
//! loop: socket packets in, keystrokes and resizes out, operation
//! handlers spawned per stream. A stream failure stays on its stream;
//! only framing errors, credit violations, and handshake trouble take
//! the connection down.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossterm::tty::IsTty;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::exec;
use crate::flow::{AckCounter, FlowControl};
use crate::framer::Framer;
use crate::messages::{self, OpenMeta, StreamEnd, StreamError};
use crate::mux::{Disposition, Mux, OpenOutcome, Side, StreamMsg};
use crate::ops;
use crate::protocol::{bye, err, flags, kind, packet, ASSIGNED_TYPE_MAX, MAX_PACKET_SIZE_LEGACY};
use crate::search;
use crate::session::{self, Lifecycle, PacketSink, StreamCtx};
use crate::term::{self, RawModeGuard, TermFilter};
use crate::trace::{Dir, Trace};

pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub simple: bool,
    pub resume: bool,
    /// Our receive window advertisement.
    pub window: u32,
    /// Reap streams stuck waiting on the peer after this long. Off by
    /// default.
    pub idle_stream_timeout: Option<Duration>,
    /// Switch the local terminal to raw mode for the session (skipped
    /// automatically when stdin is not a terminal).
    pub raw_terminal: bool,
}

impl ClientConfig {
    pub fn new(host: &str, port: u16) -> ClientConfig {
        ClientConfig {
            host: host.to_string(),
            port,
            simple: false,
            resume: false,
            window: crate::protocol::DEFAULT_WINDOW,
            idle_stream_timeout: None,
            raw_terminal: true,
        }
    }

    fn hello_flags(&self) -> u8 {
        let mut f = 0;
        if self.resume {
            f |= flags::RESUME;
        }
        if self.simple {
            f |= flags::SIMPLE;
        }
        f
    }
}

/// SIGWINCH as a future; pends forever where the signal does not exist.
struct Winch {
    #[cfg(unix)]
    inner: tokio::signal::unix::Signal,
}

impl Winch {
    fn new() -> Result<Winch> {
        Ok(Winch {
            #[cfg(unix)]
            inner: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change())?,
        })
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        {
            self.inner.recv().await;
        }
        #[cfg(not(unix))]
        std::future::pending::<()>().await
    }
}

/// Run a session to completion with keystrokes read from the real
/// stdin. `Ok(())` means an orderly GOODBYE; any error maps to a
/// nonzero exit.
pub async fn run(
    cfg: ClientConfig,
    trace: Arc<dyn Trace>,
    filter: Box<dyn TermFilter>,
) -> Result<()> {
    // Keystrokes come in on their own task so a blocked read never
    // stalls the loop
    let (stdin_tx, stdin_rx) = mpsc::channel::<Vec<u8>>(16);
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdin_tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    run_with_input(cfg, trace, filter, stdin_rx).await
}

/// Same as [`run`] but with terminal input supplied by the caller.
pub async fn run_with_input(
    cfg: ClientConfig,
    trace: Arc<dyn Trace>,
    filter: Box<dyn TermFilter>,
    input: mpsc::Receiver<Vec<u8>>,
) -> Result<()> {
    let stream = TcpStream::connect((cfg.host.as_str(), cfg.port))
        .await
        .with_context(|| format!("connect {}:{}", cfg.host, cfg.port))?;
    stream.set_nodelay(true).ok();

    let (mut read, write) = stream.into_split();
    let (sink, writer) = session::start_writer(write, trace.clone());
    let mut framer = Framer::new(MAX_PACKET_SIZE_LEGACY);

    let cwd = std::env::current_dir()
        .map(|p| ops::path_to_bytes(&p))
        .unwrap_or_else(|_| b"/".to_vec());

    let ack = session::initiate(
        &mut read,
        &mut framer,
        &sink,
        cfg.hello_flags(),
        cfg.window,
        &cwd,
        trace.as_ref(),
    )
    .await
    .context("handshake")?;
    trace.note(&format!(
        "established: peer window={} flags=0x{:02X}",
        ack.window, ack.flags
    ));

    let flow = FlowControl::new(ack.window);

    // Raw mode only when stdin really is a terminal; a session piped
    // through another program still works
    let mut raw = if cfg.raw_terminal && std::io::stdin().is_tty() {
        RawModeGuard::enable().ok()
    } else {
        None
    };

    let result = event_loop(
        &cfg,
        &mut read,
        &mut framer,
        sink.clone(),
        flow.clone(),
        trace,
        filter,
        input,
    )
    .await;

    if let Some(g) = raw.as_mut() {
        g.restore();
    }
    flow.close();
    drop(sink);
    let _ = writer.await;
    result
}

struct LoopState {
    mux: Mux,
    acker: AckCounter,
    lifecycle_tx: mpsc::UnboundedSender<Lifecycle>,
    sink: PacketSink,
    flow: Arc<FlowControl>,
    trace: Arc<dyn Trace>,
    filter: Box<dyn TermFilter>,
    stdout: tokio::io::Stdout,
    filtered: Vec<u8>,
}

impl LoopState {
    /// Count consumed inbound payload bytes, acknowledging when due.
    async fn consume(&mut self, n: usize) {
        if let Some(inc) = self.acker.consume(n) {
            self.send_window_update(inc).await;
        }
    }

    async fn send_window_update(&self, inc: u32) {
        self.trace.flow(&format!("window update +{}", inc));
        self.sink
            .send(packet::WINDOW_UPDATE, &messages::encode_window_update(inc))
            .await;
    }

    async fn reject(&self, id: u32, code: u8, message: &str) {
        let e = StreamError {
            id,
            code,
            message: message.to_string(),
        };
        self.sink.send(packet::STREAM_ERROR, &e.encode()).await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn event_loop(
    cfg: &ClientConfig,
    read: &mut tokio::net::tcp::OwnedReadHalf,
    framer: &mut Framer,
    sink: PacketSink,
    flow: Arc<FlowControl>,
    trace: Arc<dyn Trace>,
    filter: Box<dyn TermFilter>,
    mut stdin_rx: mpsc::Receiver<Vec<u8>>,
) -> Result<()> {
    let (lifecycle_tx, mut lifecycle_rx) = mpsc::unbounded_channel();
    let mut st = LoopState {
        mux: Mux::new(Side::Legacy),
        acker: AckCounter::new(),
        lifecycle_tx,
        sink,
        flow,
        trace,
        filter,
        stdout: tokio::io::stdout(),
        filtered: Vec::new(),
    };

    let mut winch = Winch::new()?;

    // Announce the real terminal size right away
    let (rows, cols) = term::size();
    st.sink
        .send(packet::TERM_RESIZE, &messages::encode_resize(rows, cols))
        .await;

    let mut sweep =
        tokio::time::interval(cfg.idle_stream_timeout.unwrap_or(Duration::from_secs(3600)));
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    sweep.tick().await; // the first tick fires immediately

    let mut rbuf = [0u8; 8192];
    let result = loop {
        // Biased order: lifecycle transitions land before the next
        // socket packet, so a freed stream id is reusable by the time
        // its successor's Open is dispatched
        tokio::select! {
            biased;
            Some(ev) = lifecycle_rx.recv() => {
                match ev {
                    Lifecycle::Ended(id) => st.mux.on_local_end(id),
                    Lifecycle::Closed(id) => st.mux.forget(id),
                }
                // Stream completion is an acknowledge point
                if let Some(inc) = st.acker.flush() {
                    st.send_window_update(inc).await;
                }
            }
            Some(bytes) = stdin_rx.recv() => {
                if !st.sink.send(packet::TERM_INPUT, &bytes).await {
                    break Err(anyhow!("connection closed"));
                }
            }
            _ = winch.recv() => {
                let (rows, cols) = term::size();
                st.sink.send(packet::TERM_RESIZE, &messages::encode_resize(rows, cols)).await;
            }
            _ = sweep.tick(), if cfg.idle_stream_timeout.is_some() => {
                let idle = cfg.idle_stream_timeout.unwrap();
                for id in st.mux.sweep_idle(idle) {
                    st.reject(id, err::TIMEOUT, "stream idle").await;
                }
            }
            r = read.read(&mut rbuf) => {
                let n = match r.context("socket read") {
                    Ok(n) => n,
                    Err(e) => break Err(e),
                };
                if n == 0 {
                    break Err(anyhow!("connection closed by relay"));
                }
                framer.feed(&rbuf[..n]);
                let mut step = Step::Continue;
                loop {
                    let (t, payload) = match framer.next_packet() {
                        Ok(Some(p)) => p,
                        Ok(None) => break,
                        Err(e) => {
                            session::goodbye(&st.sink, bye::PROTOCOL_ERROR).await;
                            step = Step::Fail(anyhow!(e).context("framing"));
                            break;
                        }
                    };
                    st.trace.packet(Dir::Recv, t, payload.len());
                    match dispatch(t, payload, &mut st).await {
                        Step::Continue => {}
                        other => {
                            step = other;
                            break;
                        }
                    }
                }
                match step {
                    Step::Continue => {}
                    Step::Goodbye => break Ok(()),
                    Step::Fail(e) => break Err(e),
                }
            }
        }
    };

    // Force-terminate whatever is still live
    st.mux.close_all();
    result
}

enum Step {
    Continue,
    Goodbye,
    Fail(anyhow::Error),
}

async fn dispatch(t: u8, payload: Vec<u8>, st: &mut LoopState) -> Step {
    match t {
        packet::TERM_OUTPUT => {
            st.filtered.clear();
            let LoopState {
                filter, filtered, ..
            } = st;
            filter.apply(&payload, filtered);
            st.stdout.write_all(&st.filtered).await.ok();
            st.stdout.flush().await.ok();
            st.consume(payload.len()).await;
        }
        packet::PING => {
            st.sink.send(packet::PONG, &payload).await;
        }
        packet::PONG => {}
        packet::GOODBYE => {
            return Step::Goodbye;
        }
        packet::WINDOW_UPDATE => {
            let inc = match messages::parse_window_update(&payload) {
                Ok(i) => i,
                Err(_) => return Step::Continue,
            };
            st.trace.flow(&format!("credit +{}", inc));
            if let Err(e) = st.flow.credit(inc) {
                session::goodbye(&st.sink, bye::PROTOCOL_ERROR).await;
                return Step::Fail(anyhow!("flow control: {}", e));
            }
        }
        packet::STREAM_OPEN => {
            on_stream_open(payload, st).await;
        }
        packet::STREAM_DATA => {
            let (id, body) = match messages::split_stream_payload(&payload) {
                Ok((id, body)) => (id, body.to_vec()),
                Err(_) => return Step::Continue,
            };
            // Credit returns even when the stream is already gone
            st.consume(body.len()).await;
            match st.mux.on_data(id) {
                Disposition::Deliver(tx) | Disposition::DeliverFinal(tx) => {
                    let _ = tx.send(StreamMsg::Data(body)).await;
                }
                Disposition::Ignore => {}
                Disposition::Reject { code, message } => {
                    st.reject(id, code, message).await;
                }
            }
        }
        packet::STREAM_END => {
            if let Ok(end) = StreamEnd::parse(&payload) {
                match st.mux.on_end(end.id) {
                    Disposition::Deliver(tx) | Disposition::DeliverFinal(tx) => {
                        let _ = tx
                            .send(StreamMsg::End {
                                status: end.status,
                                detail: end.detail,
                            })
                            .await;
                    }
                    Disposition::Ignore => {}
                    Disposition::Reject { code, message } => {
                        st.reject(end.id, code, message).await;
                    }
                }
            }
        }
        packet::STREAM_ERROR => {
            if let Ok(e) = StreamError::parse(&payload) {
                if let Disposition::DeliverFinal(tx) = st.mux.on_error(e.id) {
                    let _ = tx
                        .send(StreamMsg::Error {
                            code: e.code,
                            message: e.message,
                        })
                        .await;
                }
            }
        }
        packet::STREAM_CANCEL => {
            if let Ok(id) = messages::parse_cancel(&payload) {
                if let Disposition::DeliverFinal(tx) = st.mux.on_cancel(id) {
                    let _ = tx.send(StreamMsg::Cancelled).await;
                }
            }
        }
        packet::TERM_INPUT | packet::TERM_RESIZE | packet::HELLO | packet::HELLO_ACK => {
            // Known but meaningless in this direction or after the
            // handshake; drop
        }
        unknown if unknown <= ASSIGNED_TYPE_MAX => {
            session::goodbye(&st.sink, bye::PROTOCOL_ERROR).await;
            return Step::Fail(anyhow!("unknown packet type 0x{:02X}", unknown));
        }
        _ => {
            // Reserved high range: ignore silently
        }
    }
    Step::Continue
}

async fn on_stream_open(payload: Vec<u8>, st: &mut LoopState) {
    let (id, stream_kind) = match messages::parse_open_header(&payload) {
        Ok(h) => h,
        Err(_) => return, // not even an id to answer on
    };
    let meta = match messages::parse_open_meta(stream_kind, &payload) {
        Ok(m) => m,
        Err(e) => {
            st.reject(id, err::INVALID, &e.to_string()).await;
            return;
        }
    };

    let (data_tx, data_rx) = mpsc::channel::<StreamMsg>(64);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let exec_cancel = cancel_tx.subscribe();

    match st.mux.open_remote(id, stream_kind, data_tx, cancel_tx) {
        OpenOutcome::Accepted => {}
        OpenOutcome::Reject { code, message } => {
            st.reject(id, code, message).await;
            return;
        }
    }

    let ctx = StreamCtx::new(
        id,
        st.sink.clone(),
        st.flow.clone(),
        cancel_rx,
        st.lifecycle_tx.clone(),
    );

    match (stream_kind, meta) {
        (kind::FILE_READ, OpenMeta::Path(path)) => {
            tokio::spawn(ops::file_read(ctx, path));
        }
        (kind::FILE_WRITE, OpenMeta::WriteFile { path, mode }) => {
            tokio::spawn(ops::file_write(ctx, path, mode, data_rx));
        }
        (kind::STAT, OpenMeta::Path(path)) => {
            tokio::spawn(ops::stat(ctx, path, true));
        }
        (kind::LSTAT, OpenMeta::Path(path)) => {
            tokio::spawn(ops::stat(ctx, path, false));
        }
        (kind::EXISTS, OpenMeta::Path(path)) => {
            tokio::spawn(ops::exists(ctx, path));
        }
        (kind::DIR_LIST, OpenMeta::Path(path)) => {
            tokio::spawn(ops::dir_list(ctx, path));
        }
        (kind::MKDIR, OpenMeta::Path(path)) => {
            tokio::spawn(ops::mkdir(ctx, path));
        }
        (kind::REMOVE, OpenMeta::Path(path)) => {
            tokio::spawn(ops::remove(ctx, path));
        }
        (kind::MOVE, OpenMeta::Move { from, to }) => {
            tokio::spawn(ops::rename(ctx, from, to));
        }
        (kind::REALPATH, OpenMeta::Path(path)) => {
            tokio::spawn(ops::realpath(ctx, path));
        }
        (kind::FIND, OpenMeta::Find { base, pattern }) => {
            tokio::spawn(ops::find(ctx, base, pattern));
        }
        (kind::SEARCH, OpenMeta::Search { base, pattern, name_pattern }) => {
            tokio::spawn(search::search(ctx, base, pattern, name_pattern));
        }
        (kind::EXEC, OpenMeta::Exec { command }) => {
            tokio::spawn(exec::exec(ctx, command, exec_cancel));
        }
        (k, _) => {
            st.mux.forget(id);
            st.reject(id, err::INVALID, &format!("unknown stream kind 0x{:02X}", k))
                .await;
        }
    }
}
