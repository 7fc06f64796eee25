//! Protocol trace logging
//!
//! Enabled by `--log`. Writes one line per packet plus flow-control and
//! lifecycle notes, timestamped, to `telewire.log` in the working
//! directory (falling back to the system temp directory when the cwd is
//! not writable). The no-op implementation keeps the hot path free of
//! formatting when tracing is off.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;

use crate::protocol::packet_name;

pub const LOG_FILE_NAME: &str = "telewire.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    Send,
    Recv,
}

impl Dir {
    fn tag(self) -> &'static str {
        match self {
            Dir::Send => "SEND",
            Dir::Recv => "RECV",
        }
    }
}

pub trait Trace: Send + Sync {
    fn packet(&self, _dir: Dir, _ptype: u8, _len: usize) {}
    fn flow(&self, _note: &str) {}
    fn note(&self, _msg: &str) {}
}

pub struct NoopTrace;
impl Trace for NoopTrace {}

pub struct TextTrace {
    file: Mutex<File>,
    path: PathBuf,
}

impl TextTrace {
    /// Open the trace file in the cwd, falling back to the temp dir.
    pub fn open_default() -> Result<TextTrace> {
        let primary = PathBuf::from(LOG_FILE_NAME);
        match Self::open_at(primary) {
            Ok(t) => Ok(t),
            Err(_) => Self::open_at(std::env::temp_dir().join(LOG_FILE_NAME)),
        }
    }

    pub fn open_at(path: PathBuf) -> Result<TextTrace> {
        let f = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(TextTrace {
            file: Mutex::new(f),
            path,
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn line(&self, s: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl Trace for TextTrace {
    fn packet(&self, dir: Dir, ptype: u8, len: usize) {
        self.line(&format!(
            "{} {} (0x{:02X}) len={}",
            dir.tag(),
            packet_name(ptype),
            ptype,
            len
        ));
    }

    fn flow(&self, note: &str) {
        self.line(&format!("FLOW {}", note));
    }

    fn note(&self, msg: &str) {
        self.line(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_packet_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_FILE_NAME);
        let trace = TextTrace::open_at(path.clone()).unwrap();
        trace.packet(Dir::Send, crate::protocol::packet::HELLO, 17);
        trace.flow("window update +8192");
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("SEND HELLO (0x00) len=17"));
        assert!(text.contains("FLOW window update +8192"));
    }
}
