//! Packet payload encoding and parsing
//!
//! Everything on the wire is big-endian; strings are NUL-terminated raw
//! bytes with no encoding assumption. The framer hands payloads to this
//! module, which turns them into typed values and back. Parsers are
//! defensive: a malformed payload is reported, never indexed blindly.

use anyhow::{bail, Result};

use crate::protocol::{kind, MAX_PATH, MAX_WINDOW, MIN_WINDOW, VERSION};

/// Pull a NUL-terminated byte string starting at `off`; returns the
/// string and the offset just past its terminator.
pub fn take_strz(payload: &[u8], off: usize) -> Result<(&[u8], usize)> {
    if off > payload.len() {
        bail!("truncated payload");
    }
    match payload[off..].iter().position(|&b| b == 0) {
        Some(n) => Ok((&payload[off..off + n], off + n + 1)),
        None => bail!("string missing terminator"),
    }
}

fn take_u32(payload: &[u8], off: usize) -> Result<u32> {
    if payload.len() < off + 4 {
        bail!("truncated payload");
    }
    Ok(u32::from_be_bytes([
        payload[off],
        payload[off + 1],
        payload[off + 2],
        payload[off + 3],
    ]))
}

fn take_u64(payload: &[u8], off: usize) -> Result<u64> {
    if payload.len() < off + 8 {
        bail!("truncated payload");
    }
    let mut b = [0u8; 8];
    b.copy_from_slice(&payload[off..off + 8]);
    Ok(u64::from_be_bytes(b))
}

fn check_path(path: &[u8]) -> Result<()> {
    if path.len() > MAX_PATH {
        bail!("path too long ({} bytes)", path.len());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Handshake

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub version: u8,
    pub flags: u8,
    pub window: u32,
    pub cwd: Vec<u8>,
}

impl Hello {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(7 + self.cwd.len());
        buf.push(self.version);
        buf.push(self.flags);
        buf.extend_from_slice(&self.window.to_be_bytes());
        buf.extend_from_slice(&self.cwd);
        buf.push(0);
        buf
    }

    pub fn parse(payload: &[u8]) -> Result<Hello> {
        if payload.len() < 7 {
            bail!("HELLO too short");
        }
        let window = take_u32(payload, 2)?;
        let (cwd, _) = take_strz(payload, 6)?;
        check_path(cwd)?;
        Ok(Hello {
            version: payload[0],
            flags: payload[1],
            window,
            cwd: cwd.to_vec(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloAck {
    pub version: u8,
    pub flags: u8,
    pub window: u32,
}

impl HelloAck {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(6);
        buf.push(self.version);
        buf.push(self.flags);
        buf.extend_from_slice(&self.window.to_be_bytes());
        buf
    }

    pub fn parse(payload: &[u8]) -> Result<HelloAck> {
        if payload.len() < 6 {
            bail!("HELLO_ACK too short");
        }
        Ok(HelloAck {
            version: payload[0],
            flags: payload[1],
            window: take_u32(payload, 2)?,
        })
    }
}

/// Handshake window advertisements outside this range are fatal.
pub fn check_window(window: u32) -> Result<()> {
    if !(MIN_WINDOW..=MAX_WINDOW).contains(&window) {
        bail!(
            "advertised window {} outside [{}, {}]",
            window,
            MIN_WINDOW,
            MAX_WINDOW
        );
    }
    Ok(())
}

/// Version check shared by both handshake sides.
pub fn check_version(version: u8) -> Result<()> {
    if version != VERSION {
        bail!("protocol version mismatch: got {}, expected {}", version, VERSION);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Stream open

/// Kind-specific metadata carried in STREAM_OPEN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenMeta {
    Path(Vec<u8>),
    WriteFile { path: Vec<u8>, mode: u16 },
    Move { from: Vec<u8>, to: Vec<u8> },
    Find { base: Vec<u8>, pattern: Vec<u8> },
    Search {
        base: Vec<u8>,
        pattern: Vec<u8>,
        name_pattern: Option<Vec<u8>>,
    },
    Exec { command: Vec<u8> },
}

pub fn encode_open(id: u32, stream_kind: u8, meta: &OpenMeta) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&id.to_be_bytes());
    buf.push(stream_kind);
    match meta {
        OpenMeta::Path(p) => {
            buf.extend_from_slice(p);
            buf.push(0);
        }
        OpenMeta::WriteFile { path, mode } => {
            buf.extend_from_slice(path);
            buf.push(0);
            buf.extend_from_slice(&mode.to_be_bytes());
        }
        OpenMeta::Move { from, to } => {
            buf.extend_from_slice(from);
            buf.push(0);
            buf.extend_from_slice(to);
            buf.push(0);
        }
        OpenMeta::Find { base, pattern } => {
            buf.extend_from_slice(base);
            buf.push(0);
            buf.extend_from_slice(pattern);
            buf.push(0);
        }
        OpenMeta::Search {
            base,
            pattern,
            name_pattern,
        } => {
            buf.extend_from_slice(base);
            buf.push(0);
            buf.extend_from_slice(pattern);
            buf.push(0);
            if let Some(np) = name_pattern {
                buf.extend_from_slice(np);
                buf.push(0);
            }
        }
        OpenMeta::Exec { command } => {
            buf.extend_from_slice(command);
            buf.push(0);
        }
    }
    buf
}

/// Parse STREAM_OPEN into `(id, kind, metadata)`. The id and kind are
/// recovered even when the metadata is bad, so the error can be sent
/// back on the right stream.
pub fn parse_open_header(payload: &[u8]) -> Result<(u32, u8)> {
    if payload.len() < 5 {
        bail!("STREAM_OPEN too short");
    }
    Ok((take_u32(payload, 0)?, payload[4]))
}

pub fn parse_open_meta(stream_kind: u8, payload: &[u8]) -> Result<OpenMeta> {
    let (first, rest) = take_strz(payload, 5)?;
    check_path(first)?;
    match stream_kind {
        kind::FILE_READ
        | kind::DIR_LIST
        | kind::STAT
        | kind::LSTAT
        | kind::MKDIR
        | kind::REMOVE
        | kind::EXISTS
        | kind::REALPATH => Ok(OpenMeta::Path(first.to_vec())),
        kind::FILE_WRITE => {
            let mode = if payload.len() >= rest + 2 {
                u16::from_be_bytes([payload[rest], payload[rest + 1]])
            } else {
                0
            };
            Ok(OpenMeta::WriteFile {
                path: first.to_vec(),
                mode,
            })
        }
        kind::MOVE => {
            let (to, _) = take_strz(payload, rest)?;
            check_path(to)?;
            Ok(OpenMeta::Move {
                from: first.to_vec(),
                to: to.to_vec(),
            })
        }
        kind::FIND => {
            let (pattern, _) = take_strz(payload, rest)?;
            Ok(OpenMeta::Find {
                base: first.to_vec(),
                pattern: pattern.to_vec(),
            })
        }
        kind::SEARCH => {
            let (pattern, after) = take_strz(payload, rest)?;
            let name_pattern = if after < payload.len() {
                let (np, _) = take_strz(payload, after)?;
                Some(np.to_vec())
            } else {
                None
            };
            Ok(OpenMeta::Search {
                base: first.to_vec(),
                pattern: pattern.to_vec(),
                name_pattern,
            })
        }
        kind::EXEC => Ok(OpenMeta::Exec {
            command: first.to_vec(),
        }),
        other => bail!("unknown stream kind 0x{:02X}", other),
    }
}

// ---------------------------------------------------------------------------
// Stream data / end / error / cancel

pub fn encode_data(id: u32, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(body);
    buf
}

/// Split any stream-scoped payload into `(id, body)`.
pub fn split_stream_payload(payload: &[u8]) -> Result<(u32, &[u8])> {
    if payload.len() < 4 {
        bail!("stream payload missing id");
    }
    Ok((take_u32(payload, 0)?, &payload[4..]))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamEnd {
    pub id: u32,
    pub status: u8,
    /// Exec streams carry an exit detail (code or signal number).
    pub detail: Option<u32>,
}

impl StreamEnd {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(9);
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.push(self.status);
        if let Some(d) = self.detail {
            buf.extend_from_slice(&d.to_be_bytes());
        }
        buf
    }

    pub fn parse(payload: &[u8]) -> Result<StreamEnd> {
        if payload.len() < 5 {
            bail!("STREAM_END too short");
        }
        let detail = if payload.len() >= 9 {
            Some(take_u32(payload, 5)?)
        } else {
            None
        };
        Ok(StreamEnd {
            id: take_u32(payload, 0)?,
            status: payload[4],
            detail,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamError {
    pub id: u32,
    pub code: u8,
    pub message: String,
}

impl StreamError {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(6 + self.message.len());
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.push(self.code);
        buf.extend_from_slice(self.message.as_bytes());
        buf.push(0);
        buf
    }

    pub fn parse(payload: &[u8]) -> Result<StreamError> {
        if payload.len() < 5 {
            bail!("STREAM_ERROR too short");
        }
        let (msg, _) = take_strz(payload, 5)?;
        Ok(StreamError {
            id: take_u32(payload, 0)?,
            code: payload[4],
            message: String::from_utf8_lossy(msg).into_owned(),
        })
    }
}

pub fn encode_cancel(id: u32) -> Vec<u8> {
    id.to_be_bytes().to_vec()
}

pub fn parse_cancel(payload: &[u8]) -> Result<u32> {
    take_u32(payload, 0)
}

// ---------------------------------------------------------------------------
// Flow control / terminal / goodbye

pub fn encode_window_update(increment: u32) -> Vec<u8> {
    increment.to_be_bytes().to_vec()
}

pub fn parse_window_update(payload: &[u8]) -> Result<u32> {
    take_u32(payload, 0)
}

pub fn encode_resize(rows: u16, cols: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4);
    buf.extend_from_slice(&rows.to_be_bytes());
    buf.extend_from_slice(&cols.to_be_bytes());
    buf
}

pub fn parse_resize(payload: &[u8]) -> Result<(u16, u16)> {
    if payload.len() < 4 {
        bail!("TERM_RESIZE too short");
    }
    Ok((
        u16::from_be_bytes([payload[0], payload[1]]),
        u16::from_be_bytes([payload[2], payload[3]]),
    ))
}

pub fn encode_goodbye(reason: u8) -> Vec<u8> {
    vec![reason]
}

pub fn parse_goodbye(payload: &[u8]) -> u8 {
    payload.first().copied().unwrap_or(crate::protocol::bye::UNKNOWN)
}

// ---------------------------------------------------------------------------
// Handler reply bodies (the part of STREAM_DATA after the id prefix)

/// File kind discriminant used by stat and directory replies.
pub const KIND_FILE: u8 = b'f';
pub const KIND_DIR: u8 = b'd';
pub const KIND_SYMLINK: u8 = b'l';
pub const KIND_OTHER: u8 = b'?';

/// Stat reply: one 22-byte body. A missing path is `exists == 0` with
/// every other field zero, and the stream still ends Ok.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct StatReply {
    pub exists: bool,
    pub kind: u8,
    pub mode: u32,
    pub size: u64,
    pub mtime: u64,
}

impl StatReply {
    pub fn absent() -> StatReply {
        StatReply {
            exists: false,
            kind: KIND_OTHER,
            mode: 0,
            size: 0,
            mtime: 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(22);
        buf.push(self.exists as u8);
        buf.push(self.kind);
        buf.extend_from_slice(&self.mode.to_be_bytes());
        buf.extend_from_slice(&self.size.to_be_bytes());
        buf.extend_from_slice(&self.mtime.to_be_bytes());
        buf
    }

    pub fn parse(body: &[u8]) -> Result<StatReply> {
        if body.len() < 22 {
            bail!("stat reply too short");
        }
        Ok(StatReply {
            exists: body[0] != 0,
            kind: body[1],
            mode: take_u32(body, 2)?,
            size: take_u64(body, 6)?,
            mtime: take_u64(body, 14)?,
        })
    }
}

/// Directory listing entry: kind, size, mtime, then the raw name.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DirEntryWire {
    pub kind: u8,
    pub size: u64,
    pub mtime: u64,
    pub name: Vec<u8>,
}

impl DirEntryWire {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(18 + self.name.len());
        buf.push(self.kind);
        buf.extend_from_slice(&self.size.to_be_bytes());
        buf.extend_from_slice(&self.mtime.to_be_bytes());
        buf.extend_from_slice(&self.name);
        buf.push(0);
        buf
    }

    pub fn parse(body: &[u8]) -> Result<DirEntryWire> {
        if body.len() < 18 {
            bail!("dir entry too short");
        }
        let (name, _) = take_strz(body, 17)?;
        Ok(DirEntryWire {
            kind: body[0],
            size: take_u64(body, 1)?,
            mtime: take_u64(body, 9)?,
            name: name.to_vec(),
        })
    }
}

/// Content-search hit: line number, file path, line text.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SearchHit {
    pub line: u32,
    pub path: Vec<u8>,
    pub text: Vec<u8>,
}

impl SearchHit {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(6 + self.path.len() + self.text.len());
        buf.extend_from_slice(&self.line.to_be_bytes());
        buf.extend_from_slice(&self.path);
        buf.push(0);
        buf.extend_from_slice(&self.text);
        buf.push(0);
        buf
    }

    pub fn parse(body: &[u8]) -> Result<SearchHit> {
        let line = take_u32(body, 0)?;
        let (path, after) = take_strz(body, 4)?;
        let (text, _) = take_strz(body, after)?;
        Ok(SearchHit {
            line,
            path: path.to_vec(),
            text: text.to_vec(),
        })
    }
}
