//! End-to-end sessions over loopback TCP: a real legacy endpoint on one
//! side, either the relay endpoint or a raw packet peer on the other.

use std::sync::Arc;
use std::time::{Duration, Instant};

use telewire::client::{self, ClientConfig};
use telewire::framer::{encode, Framer};
use telewire::messages::{
    encode_data, encode_goodbye, encode_open, parse_open_header, split_stream_payload, Hello,
    HelloAck, OpenMeta, StreamEnd, StreamError, KIND_DIR, KIND_FILE, KIND_SYMLINK,
};
use telewire::protocol::{bye, err, kind, packet, status, MAX_PATH, MAX_PACKET_SIZE, VERSION};
use telewire::relay::{ExecExit, OpError, Relay, RelayConfig, RemoteOps, TermEvent, TermHooks};
use telewire::term::Passthrough;
use telewire::trace::{NoopTrace, Trace};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

fn noop() -> Arc<dyn Trace> {
    Arc::new(NoopTrace)
}

fn bytes(p: &std::path::Path) -> Vec<u8> {
    p.to_string_lossy().into_owned().into_bytes()
}

/// A full client + relay pair over loopback.
struct Pair {
    ops: RemoteOps,
    /// Feed bytes here to simulate PTY output.
    pty_out: mpsc::Sender<Vec<u8>>,
    /// Input/resize events the relay forwarded toward the "PTY".
    events: mpsc::Receiver<TermEvent>,
    /// Simulated keystrokes on the legacy side.
    term_in: mpsc::Sender<Vec<u8>>,
    client: JoinHandle<anyhow::Result<()>>,
    session: JoinHandle<anyhow::Result<()>>,
}

async fn connect_pair() -> Pair {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let (term_in, input_rx) = mpsc::channel(8);
    let mut cfg = ClientConfig::new("127.0.0.1", port);
    cfg.raw_terminal = false;
    let client = tokio::spawn(client::run_with_input(
        cfg,
        noop(),
        Box::new(Passthrough),
        input_rx,
    ));

    let (sock, _) = listener.accept().await.unwrap();
    let relay = Relay::establish(
        sock,
        RelayConfig {
            window: 262_144,
            op_timeout: Some(Duration::from_secs(20)),
        },
        noop(),
    )
    .await
    .unwrap();
    let ops = relay.ops();

    let (pty_out, pty_output) = mpsc::channel(8);
    let (pty_events, events) = mpsc::channel(8);
    let session = tokio::spawn(relay.run(TermHooks {
        pty_output,
        pty_events,
    }));

    Pair {
        ops,
        pty_out,
        events,
        term_in,
        client,
        session,
    }
}

// ---------------------------------------------------------------------------
// Operations through the full stack

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_then_read_round_trip() {
    let pair = connect_pair().await;
    let tmp = tempfile::tempdir().unwrap();
    let path = bytes(&tmp.path().join("blob.bin"));

    // Spans many chunks and multiple window refills
    let data: Vec<u8> = (0..1_048_576u32).map(|i| (i % 251) as u8).collect();
    pair.ops.write_file(&path, 0, &data).await.unwrap();
    let back = pair.ops.read_file(&path).await.unwrap();
    assert_eq!(back.len(), data.len());
    assert_eq!(back, data);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(tmp.path().join("blob.bin"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o644); // mode 0 means the default
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reads_share_the_window() {
    let pair = connect_pair().await;
    let tmp = tempfile::tempdir().unwrap();

    let a: Vec<u8> = (0..786_432u32).map(|i| (i % 13) as u8).collect();
    let b: Vec<u8> = (0..786_432u32).map(|i| (i % 7) as u8).collect();
    std::fs::write(tmp.path().join("a"), &a).unwrap();
    std::fs::write(tmp.path().join("b"), &b).unwrap();

    let pa = bytes(&tmp.path().join("a"));
    let pb = bytes(&tmp.path().join("b"));
    let (ra, rb) = tokio::join!(pair.ops.read_file(&pa), pair.ops.read_file(&pb));
    assert_eq!(ra.unwrap(), a);
    assert_eq!(rb.unwrap(), b);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stat_lstat_exists_realpath() {
    let pair = connect_pair().await;
    let tmp = tempfile::tempdir().unwrap();
    let file = tmp.path().join("f.txt");
    std::fs::write(&file, b"12345").unwrap();

    let st = pair.ops.stat(&bytes(&file)).await.unwrap();
    assert!(st.exists);
    assert_eq!(st.kind, KIND_FILE);
    assert_eq!(st.size, 5);
    assert!(st.mtime > 0);

    let dir_st = pair.ops.stat(&bytes(tmp.path())).await.unwrap();
    assert_eq!(dir_st.kind, KIND_DIR);

    // Missing path is a clean "absent" answer, not an error
    let missing = pair.ops.stat(b"/no/such/path/here").await.unwrap();
    assert!(!missing.exists);
    assert_eq!(missing.size, 0);

    #[cfg(unix)]
    {
        let link = tmp.path().join("ln");
        std::os::unix::fs::symlink(&file, &link).unwrap();
        let via_stat = pair.ops.stat(&bytes(&link)).await.unwrap();
        assert_eq!(via_stat.kind, KIND_FILE); // followed
        let via_lstat = pair.ops.lstat(&bytes(&link)).await.unwrap();
        assert_eq!(via_lstat.kind, KIND_SYMLINK); // not followed
    }

    assert!(pair.ops.exists(&bytes(&file)).await.unwrap());
    assert!(!pair.ops.exists(b"/no/such/path/here").await.unwrap());

    let twisted = bytes(&tmp.path().join("sub/../f.txt"));
    std::fs::create_dir(tmp.path().join("sub")).unwrap();
    let resolved = pair.ops.realpath(&twisted).await.unwrap();
    let expect = std::fs::canonicalize(&file).unwrap();
    assert_eq!(resolved, bytes(&expect));

    match pair.ops.realpath(b"/no/such/path/here").await {
        Err(OpError::Remote { code, .. }) => assert_eq!(code, err::NOT_FOUND),
        other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mkdir_move_remove_lifecycle() {
    let pair = connect_pair().await;
    let tmp = tempfile::tempdir().unwrap();

    let d = bytes(&tmp.path().join("newdir"));
    pair.ops.mkdir(&d).await.unwrap();
    // Idempotent on an existing directory
    pair.ops.mkdir(&d).await.unwrap();

    let src = tmp.path().join("newdir/src.txt");
    std::fs::write(&src, b"move me").unwrap();
    let pre = pair.ops.stat(&bytes(&src)).await.unwrap();

    let dst = tmp.path().join("newdir/dst.txt");
    pair.ops.rename(&bytes(&src), &bytes(&dst)).await.unwrap();
    let post = pair.ops.stat(&bytes(&dst)).await.unwrap();
    assert_eq!(post.size, pre.size);
    assert_eq!(post.mtime, pre.mtime);
    assert!(!pair.ops.exists(&bytes(&src)).await.unwrap());

    pair.ops.remove(&bytes(&dst)).await.unwrap();
    assert!(!pair.ops.exists(&bytes(&dst)).await.unwrap());

    match pair.ops.remove(&bytes(&dst)).await {
        Err(OpError::Remote { code, .. }) => assert_eq!(code, err::NOT_FOUND),
        other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn list_dir_reports_kinds_and_sizes() {
    let pair = connect_pair().await;
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("a.txt"), b"abc").unwrap();
    std::fs::create_dir(tmp.path().join("sub")).unwrap();

    let mut entries = pair.ops.list_dir(&bytes(tmp.path())).await.unwrap();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].name, b"a.txt");
    assert_eq!(entries[0].kind, KIND_FILE);
    assert_eq!(entries[0].size, 3);
    assert_eq!(entries[1].name, b"sub");
    assert_eq!(entries[1].kind, KIND_DIR);

    match pair.ops.list_dir(b"/no/such/dir").await {
        Err(OpError::Remote { code, .. }) => assert_eq!(code, err::NOT_FOUND),
        other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn find_matches_leaves_without_following_symlinks() {
    let pair = connect_pair().await;
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("a.c"), b"").unwrap();
    std::fs::write(tmp.path().join("d.h"), b"").unwrap();
    std::fs::create_dir_all(tmp.path().join("sub/deep")).unwrap();
    std::fs::write(tmp.path().join("sub/b.c"), b"").unwrap();
    std::fs::write(tmp.path().join("sub/deep/c.c"), b"").unwrap();
    #[cfg(unix)]
    std::os::unix::fs::symlink(tmp.path().join("sub"), tmp.path().join("loop")).unwrap();

    let mut found = pair.ops.find(&bytes(tmp.path()), b"*.c").await.unwrap();
    found.sort();
    let mut expect = vec![
        bytes(&tmp.path().join("a.c")),
        bytes(&tmp.path().join("sub/b.c")),
        bytes(&tmp.path().join("sub/deep/c.c")),
    ];
    expect.sort();
    assert_eq!(found, expect);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn search_finds_lines_and_skips_noise() {
    let pair = connect_pair().await;
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir(tmp.path().join("src")).unwrap();
    std::fs::write(
        tmp.path().join("src/main.c"),
        b"int main(void) {\n    /* TODO fix leak */\n    return 0;\n}\n",
    )
    .unwrap();
    std::fs::write(tmp.path().join("src/util.c"), b"TODO: cleanup\n").unwrap();
    // Noise that must be skipped
    std::fs::create_dir(tmp.path().join(".git")).unwrap();
    std::fs::write(tmp.path().join(".git/config"), b"TODO hidden\n").unwrap();
    std::fs::write(tmp.path().join("obj.o"), b"TODO in binary ext\n").unwrap();
    std::fs::write(tmp.path().join("blob.dat"), b"TODO\x00after nul\n").unwrap();

    let mut hits = pair
        .ops
        .search(&bytes(tmp.path()), b"TODO", None)
        .await
        .unwrap();
    hits.sort_by(|a, b| a.path.cmp(&b.path));
    assert_eq!(hits.len(), 2);
    assert!(hits[0].path.ends_with(b"main.c"));
    assert_eq!(hits[0].line, 2);
    assert_eq!(hits[0].text, b"    /* TODO fix leak */");
    assert!(hits[1].path.ends_with(b"util.c"));
    assert_eq!(hits[1].line, 1);

    let narrowed = pair
        .ops
        .search(&bytes(tmp.path()), b"TODO", Some(b"util.*"))
        .await
        .unwrap();
    assert_eq!(narrowed.len(), 1);
    assert!(narrowed[0].path.ends_with(b"util.c"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn search_stops_cleanly_at_the_result_cap() {
    let pair = connect_pair().await;
    let tmp = tempfile::tempdir().unwrap();
    let mut text = String::new();
    for i in 0..300 {
        text.push_str(&format!("line {} has a MARKER in it\n", i));
    }
    std::fs::write(tmp.path().join("big.txt"), text).unwrap();

    let hits = pair
        .ops
        .search(&bytes(tmp.path()), b"MARKER", None)
        .await
        .unwrap();
    // Capped, and the stream still ended Ok rather than erroring
    assert_eq!(hits.len(), 200);
    assert_eq!(hits[0].line, 1);
    assert_eq!(hits[199].line, 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn find_descends_to_the_depth_cap_and_no_further() {
    let pair = connect_pair().await;
    let tmp = tempfile::tempdir().unwrap();

    // A directory at depth N holds a marker file at depth N+1
    let mut at_cap = tmp.path().to_path_buf();
    for _ in 0..63 {
        at_cap.push("d");
    }
    std::fs::create_dir_all(&at_cap).unwrap();
    std::fs::write(at_cap.join("hit.marker"), b"").unwrap(); // depth 64

    let mut below_cap = at_cap.clone();
    below_cap.push("d"); // depth 64
    std::fs::create_dir_all(&below_cap).unwrap();
    std::fs::write(below_cap.join("miss.marker"), b"").unwrap(); // depth 65

    let found = pair
        .ops
        .find(&bytes(tmp.path()), b"*.marker")
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert!(found[0].ends_with(b"hit.marker"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exec_reports_output_and_exit_code() {
    let pair = connect_pair().await;
    let outcome = pair
        .ops
        .exec(b"echo out; echo err 1>&2; exit 3", None)
        .await
        .unwrap();
    assert_eq!(outcome.exit, ExecExit::Normal(3));
    let merged = outcome.merged_output();
    let text = String::from_utf8_lossy(&merged);
    assert!(text.contains("out"), "missing stdout in {:?}", text);
    assert!(text.contains("err"), "missing stderr in {:?}", text);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exec_cancel_stops_the_child() {
    let pair = connect_pair().await;
    let started = Instant::now();
    let outcome = pair
        .ops
        .exec(
            b"sleep 30; echo done",
            Some(Duration::from_millis(200)),
        )
        .await
        .unwrap();
    assert_eq!(outcome.exit, ExecExit::TimedOut);
    assert!(
        !outcome.merged_output().windows(4).any(|w| w == b"done"),
        "child kept running past cancel"
    );
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "cancel took {:?}",
        started.elapsed()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stream_failure_leaves_siblings_alive() {
    let mut pair = connect_pair().await;
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("ok.txt"), b"still here").unwrap();

    match pair.ops.read_file(b"/no/such/file").await {
        Err(OpError::Remote { code, .. }) => assert_eq!(code, err::NOT_FOUND),
        other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
    }

    // Operations keep working
    let back = pair
        .ops
        .read_file(&bytes(&tmp.path().join("ok.txt")))
        .await
        .unwrap();
    assert_eq!(back, b"still here");

    // And the terminal channel is undisturbed
    pair.term_in.send(b"ls\n".to_vec()).await.unwrap();
    loop {
        match pair.events.recv().await.expect("events channel closed") {
            TermEvent::Input(b) => {
                assert_eq!(b, b"ls\n");
                break;
            }
            TermEvent::Resize { .. } => continue, // the initial size report
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn terminal_bridge_carries_both_directions() {
    let mut pair = connect_pair().await;

    // The client announces its size right after the handshake
    match pair.events.recv().await.unwrap() {
        TermEvent::Resize { rows, cols } => {
            assert!(rows > 0 && cols > 0);
        }
        other => panic!("expected initial resize, got {:?}", other),
    }

    pair.term_in.send(b"make test\r".to_vec()).await.unwrap();
    match pair.events.recv().await.unwrap() {
        TermEvent::Input(b) => assert_eq!(b, b"make test\r"),
        other => panic!("expected input, got {:?}", other),
    }

    // PTY output flows to the client without error and the session
    // stays healthy afterwards
    pair.pty_out.send(b"$ make test\r\nok\r\n".to_vec()).await.unwrap();
    assert!(pair.ops.exists(b"/").await.unwrap());
}

// ---------------------------------------------------------------------------
// Raw packet peers against each endpoint

struct RawPeer {
    sock: TcpStream,
    framer: Framer,
}

impl RawPeer {
    fn new(sock: TcpStream) -> RawPeer {
        RawPeer {
            sock,
            framer: Framer::new(MAX_PACKET_SIZE),
        }
    }

    async fn send(&mut self, t: u8, payload: &[u8]) {
        self.sock.write_all(&encode(t, payload)).await.unwrap();
    }

    async fn recv(&mut self) -> Option<(u8, Vec<u8>)> {
        let mut buf = [0u8; 8192];
        loop {
            if let Some(p) = self.framer.next_packet().unwrap() {
                return Some(p);
            }
            match self.sock.read(&mut buf).await {
                Ok(0) | Err(_) => return None,
                Ok(n) => self.framer.feed(&buf[..n]),
            }
        }
    }

    /// Next packet of the wanted type, skipping terminal chatter and
    /// window updates.
    async fn recv_type(&mut self, want: u8) -> Vec<u8> {
        loop {
            let (t, payload) = self.recv().await.expect("peer closed early");
            if t == want {
                return payload;
            }
        }
    }
}

/// Spawn a real legacy client and pose as its relay.
async fn raw_relay_with_client() -> (RawPeer, JoinHandle<anyhow::Result<()>>, mpsc::Sender<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (term_in, input_rx) = mpsc::channel(4);
    let mut cfg = ClientConfig::new("127.0.0.1", port);
    cfg.raw_terminal = false;
    let client = tokio::spawn(client::run_with_input(
        cfg,
        noop(),
        Box::new(Passthrough),
        input_rx,
    ));
    let (sock, _) = listener.accept().await.unwrap();
    let mut peer = RawPeer::new(sock);

    let hello_payload = peer.recv_type(packet::HELLO).await;
    let hello = Hello::parse(&hello_payload).unwrap();
    assert_eq!(hello.version, VERSION);
    assert!(!hello.cwd.is_empty());
    let ack = HelloAck {
        version: VERSION,
        flags: 0,
        window: 262_144,
    };
    peer.send(packet::HELLO_ACK, &ack.encode()).await;
    (peer, client, term_in)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn legacy_endpoint_speaks_the_wire() {
    let (mut peer, client, _term_in) = raw_relay_with_client().await;
    let tmp = tempfile::tempdir().unwrap();
    let path = bytes(&tmp.path().join("x"));

    // Write stream with a zero-byte flush marker in the middle
    peer.send(
        packet::STREAM_OPEN,
        &encode_open(
            2,
            kind::FILE_WRITE,
            &OpenMeta::WriteFile {
                path: path.clone(),
                mode: 0o600,
            },
        ),
    )
    .await;
    peer.send(packet::STREAM_DATA, &encode_data(2, b"hello")).await;
    peer.send(packet::STREAM_DATA, &encode_data(2, b"")).await;
    peer.send(packet::STREAM_DATA, &encode_data(2, b"\n")).await;
    peer.send(
        packet::STREAM_END,
        &StreamEnd {
            id: 2,
            status: status::OK,
            detail: None,
        }
        .encode(),
    )
    .await;
    let end = StreamEnd::parse(&peer.recv_type(packet::STREAM_END).await).unwrap();
    assert_eq!((end.id, end.status), (2, status::OK));
    assert_eq!(std::fs::read(tmp.path().join("x")).unwrap(), b"hello\n");

    // The id is free again after Closed: reuse it for the read back
    peer.send(
        packet::STREAM_OPEN,
        &encode_open(2, kind::FILE_READ, &OpenMeta::Path(path.clone())),
    )
    .await;
    let data = peer.recv_type(packet::STREAM_DATA).await;
    let (id, body) = split_stream_payload(&data).unwrap();
    assert_eq!(id, 2);
    assert_eq!(body, b"hello\n");
    let end = StreamEnd::parse(&peer.recv_type(packet::STREAM_END).await).unwrap();
    assert_eq!(end.status, status::OK);

    // Duplicate open of a live id is rejected; the stream survives
    peer.send(
        packet::STREAM_OPEN,
        &encode_open(4, kind::EXEC, &OpenMeta::Exec { command: b"sleep 5".to_vec() }),
    )
    .await;
    peer.send(
        packet::STREAM_OPEN,
        &encode_open(4, kind::FILE_READ, &OpenMeta::Path(path.clone())),
    )
    .await;
    let e = StreamError::parse(&peer.recv_type(packet::STREAM_ERROR).await).unwrap();
    assert_eq!((e.id, e.code), (4, err::INVALID));

    // Cancel reaps the child and answers End(Cancelled)
    peer.send(packet::STREAM_CANCEL, &[0, 0, 0, 4]).await;
    let end = StreamEnd::parse(&peer.recv_type(packet::STREAM_END).await).unwrap();
    assert_eq!((end.id, end.status), (4, status::CANCELLED));

    // Unknown stream kind is Invalid, connection survives
    let mut open = Vec::new();
    open.extend_from_slice(&6u32.to_be_bytes());
    open.push(0x7E);
    open.extend_from_slice(b"/whatever\0");
    peer.send(packet::STREAM_OPEN, &open).await;
    let e = StreamError::parse(&peer.recv_type(packet::STREAM_ERROR).await).unwrap();
    assert_eq!((e.id, e.code), (6, err::INVALID));

    // Orderly goodbye: the client exits zero
    peer.send(packet::GOODBYE, &encode_goodbye(bye::NORMAL)).await;
    assert!(client.await.unwrap().is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn legacy_endpoint_enforces_path_cap() {
    let (mut peer, client, _term_in) = raw_relay_with_client().await;

    // Exactly MAX_PATH bytes: passes protocol validation and reaches
    // the filesystem, which reports its own failure (not Invalid)
    let exact = vec![b'a'; MAX_PATH];
    peer.send(
        packet::STREAM_OPEN,
        &encode_open(2, kind::FILE_READ, &OpenMeta::Path(exact)),
    )
    .await;
    let e = StreamError::parse(&peer.recv_type(packet::STREAM_ERROR).await).unwrap();
    assert_eq!(e.id, 2);
    assert_ne!(e.code, err::INVALID);

    // One byte more: rejected as Invalid before any filesystem access
    let over = vec![b'a'; MAX_PATH + 1];
    peer.send(
        packet::STREAM_OPEN,
        &encode_open(4, kind::FILE_READ, &OpenMeta::Path(over)),
    )
    .await;
    let e = StreamError::parse(&peer.recv_type(packet::STREAM_ERROR).await).unwrap();
    assert_eq!((e.id, e.code), (4, err::INVALID));

    peer.send(packet::GOODBYE, &encode_goodbye(bye::NORMAL)).await;
    assert!(client.await.unwrap().is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oversized_packet_is_fatal() {
    let (mut peer, client, _term_in) = raw_relay_with_client().await;

    // Declare 2 MiB against the legacy side's 1 MiB ceiling; the header
    // alone is enough to kill the connection
    let mut hdr = vec![packet::STREAM_DATA];
    hdr.extend_from_slice(&(2 * 1024 * 1024u32).to_be_bytes());
    peer.sock.write_all(&hdr).await.unwrap();

    let payload = peer.recv_type(packet::GOODBYE).await;
    assert_eq!(payload, [bye::PROTOCOL_ERROR]);
    assert!(client.await.unwrap().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn data_for_unopened_stream_is_rejected_not_fatal() {
    let (mut peer, client, _term_in) = raw_relay_with_client().await;

    peer.send(packet::STREAM_DATA, &encode_data(88, b"stray")).await;
    let e = StreamError::parse(&peer.recv_type(packet::STREAM_ERROR).await).unwrap();
    assert_eq!((e.id, e.code), (88, err::INVALID));

    peer.send(packet::GOODBYE, &encode_goodbye(bye::NORMAL)).await;
    assert!(client.await.unwrap().is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn relay_rejects_non_hello_first_packet() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let accept = tokio::spawn(async move {
        let (sock, _) = listener.accept().await.unwrap();
        Relay::establish(sock, RelayConfig::default(), noop()).await
    });

    let sock = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut peer = RawPeer::new(sock);
    // First byte 0x21 instead of 0x00: a stale or text-framed client
    peer.send(packet::STREAM_DATA, b"junk").await;

    assert!(accept.await.unwrap().is_err());
    let payload = peer.recv_type(packet::GOODBYE).await;
    assert_eq!(payload, [bye::PROTOCOL_ERROR]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn relay_forwards_open_metadata_verbatim() {
    // A raw legacy peer checks the exact bytes the relay emits for an
    // adapter call, and answers it
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let relay_task = tokio::spawn(async move {
        let (sock, _) = listener.accept().await.unwrap();
        let relay = Relay::establish(sock, RelayConfig::default(), noop())
            .await
            .unwrap();
        let ops = relay.ops();
        let (_pty_out, pty_output) = mpsc::channel(1);
        let (pty_events, _events) = mpsc::channel(1);
        let session = tokio::spawn(relay.run(TermHooks {
            pty_output,
            pty_events,
        }));
        assert_eq!(ops.remote_cwd(), b"/work/project");
        let found = ops.exists(b"rel/probe.txt").await.unwrap();
        session.abort();
        found
    });

    let sock = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut peer = RawPeer::new(sock);
    let hello = Hello {
        version: VERSION,
        flags: 0,
        window: 262_144,
        cwd: b"/work/project".to_vec(),
    };
    peer.send(packet::HELLO, &hello.encode()).await;
    let ack = HelloAck::parse(&peer.recv_type(packet::HELLO_ACK).await).unwrap();
    assert_eq!(ack.version, VERSION);

    let open = peer.recv_type(packet::STREAM_OPEN).await;
    let (id, k) = parse_open_header(&open).unwrap();
    assert_eq!(id, 2); // first relay-initiated stream id
    assert_eq!(k, kind::EXISTS);
    // Relative adapter paths resolve against the HELLO cwd
    assert_eq!(&open[5..], b"/work/project/rel/probe.txt\0");

    peer.send(packet::STREAM_DATA, &encode_data(id, &[1])).await;
    peer.send(
        packet::STREAM_END,
        &StreamEnd {
            id,
            status: status::OK,
            detail: None,
        }
        .encode(),
    )
    .await;

    assert!(relay_task.await.unwrap());
}

// Keep handles alive to the end of each test
impl Drop for Pair {
    fn drop(&mut self) {
        self.client.abort();
        self.session.abort();
    }
}
