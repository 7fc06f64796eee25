//! telewired: the relay-side daemon
//!
//! Owns one long-lived PTY running the host agent and accepts legacy
//! clients one at a time, bridging the PTY and the tool-call API over
//! the Wire. The PTY (and whatever is running in it) survives client
//! disconnects; a client returning with --resume gets the recent
//! terminal output replayed from a bounded ring.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use telewire::cli::RelayOpts;
use telewire::relay::{Relay, RelayConfig, ReplayBuffer, TermEvent, TermHooks};
use telewire::trace::{NoopTrace, TextTrace, Trace};

const REPLAY_BYTES: usize = 256 * 1024;

/// Long-lived PTY wiring shared across client sessions.
struct PtyBridge {
    /// Where live PTY output goes while a session is attached.
    attach: Arc<tokio::sync::Mutex<Option<mpsc::Sender<Vec<u8>>>>>,
    /// Keystrokes and resizes toward the PTY.
    events: mpsc::Sender<TermEvent>,
    ring: Arc<Mutex<ReplayBuffer>>,
}

fn spawn_pty(command: &str) -> Result<PtyBridge> {
    let pty = native_pty_system();
    let pair = pty
        .openpty(PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| anyhow::anyhow!("openpty: {}", e))?;

    let mut cmd = CommandBuilder::new("/bin/sh");
    cmd.arg("-c");
    cmd.arg(command);
    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| anyhow::anyhow!("spawn {:?}: {}", command, e))?;
    drop(pair.slave);

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| anyhow::anyhow!("pty reader: {}", e))?;
    let mut writer = pair
        .master
        .take_writer()
        .map_err(|e| anyhow::anyhow!("pty writer: {}", e))?;
    let master = pair.master;

    // Blocking thread drains the PTY into a channel
    let (raw_tx, mut raw_rx) = mpsc::channel::<Vec<u8>>(32);
    tokio::task::spawn_blocking(move || {
        let mut reader = reader;
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if raw_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Distribute output: always into the ring, and to the attached
    // session when there is one
    let attach: Arc<tokio::sync::Mutex<Option<mpsc::Sender<Vec<u8>>>>> =
        Arc::new(tokio::sync::Mutex::new(None));
    let ring = Arc::new(Mutex::new(ReplayBuffer::new(REPLAY_BYTES)));
    {
        let attach = attach.clone();
        let ring = ring.clone();
        tokio::spawn(async move {
            while let Some(bytes) = raw_rx.recv().await {
                ring.lock().write(&bytes);
                let slot = attach.lock().await;
                if let Some(tx) = slot.as_ref() {
                    let _ = tx.send(bytes).await;
                }
            }
        });
    }

    // Keystrokes and resizes; the channel lives as long as the daemon
    let (ev_tx, mut ev_rx) = mpsc::channel::<TermEvent>(32);
    tokio::task::spawn_blocking(move || {
        while let Some(ev) = ev_rx.blocking_recv() {
            match ev {
                TermEvent::Input(bytes) => {
                    if writer.write_all(&bytes).is_err() {
                        break;
                    }
                    let _ = writer.flush();
                }
                TermEvent::Resize { rows, cols } => {
                    let _ = master.resize(PtySize {
                        rows,
                        cols,
                        pixel_width: 0,
                        pixel_height: 0,
                    });
                }
            }
        }
        let _ = child.kill();
    });

    Ok(PtyBridge {
        attach,
        events: ev_tx,
        ring,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = RelayOpts::parse();

    let trace: Arc<dyn Trace> = if opts.log {
        match TextTrace::open_default() {
            Ok(t) => {
                eprintln!("logging to {}", t.path().display());
                Arc::new(t)
            }
            Err(e) => {
                eprintln!("cannot open trace log: {}", e);
                Arc::new(NoopTrace)
            }
        }
    } else {
        Arc::new(NoopTrace)
    };

    let listener = TcpListener::bind(&opts.bind)
        .await
        .with_context(|| format!("bind {}", opts.bind))?;
    eprintln!(
        "telewired listening on {} command={:?}",
        opts.bind, opts.command
    );

    let bridge = spawn_pty(&opts.command)?;

    loop {
        let (sock, peer) = match listener.accept().await {
            Ok(c) => c,
            Err(e) => {
                eprintln!("accept error: {}", e);
                continue;
            }
        };
        eprintln!("conn from {}", peer);

        let cfg = RelayConfig {
            op_timeout: (opts.op_timeout > 0).then(|| Duration::from_secs(opts.op_timeout)),
            ..RelayConfig::default()
        };
        let relay = match Relay::establish(sock, cfg, trace.clone()).await {
            Ok(r) => r,
            Err(e) => {
                eprintln!("handshake failed: {:#}", e);
                continue;
            }
        };

        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(32);
        if relay.wants_resume() {
            let snap = bridge.ring.lock().snapshot();
            if !snap.is_empty() {
                let _ = out_tx.send(snap).await;
            }
        }
        *bridge.attach.lock().await = Some(out_tx);

        let hooks = TermHooks {
            pty_output: out_rx,
            pty_events: bridge.events.clone(),
        };
        match relay.run(hooks).await {
            Ok(()) => eprintln!("session ended"),
            Err(e) => eprintln!("session error: {:#}", e),
        }
        *bridge.attach.lock().await = None;
    }
}
