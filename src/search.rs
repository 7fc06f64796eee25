//! Content search: Boyer-Moore-Horspool over a bounded directory walk
//!
//! The skip table is built once per stream and reused for every file;
//! the file buffer is reused across files so the hot loop does not
//! allocate. Directories that never hold interesting sources, binary
//! files, oversized files, and empty files are skipped before any byte
//! is scanned.

use tokio::io::AsyncReadExt;

use crate::glob::glob_match;
use crate::messages::SearchHit;
use crate::ops::{io_code, path_from_bytes, path_to_bytes};
use crate::protocol::status;
use crate::session::{SendOutcome, StreamCtx};

// Result and traversal bounds; hitting one ends the stream cleanly
pub const MAX_MATCHES: usize = 200;
pub const MAX_FILES: usize = 500;
pub const MAX_DEPTH: usize = 32;
pub const MAX_FILE_SIZE: u64 = 512 * 1024;

// NUL sniff window for binary detection
const SNIFF_LEN: usize = 512;

// Directory names that never hold interesting sources
const SKIP_DIRS: &[&str] = &[
    ".git",
    ".svn",
    ".hg",
    "CVS",
    "node_modules",
    "target",
    "__pycache__",
    ".cache",
    "build",
    "dist",
];

// Extensions that mark a file binary without opening it
const BINARY_EXTS: &[&str] = &[
    "o", "a", "so", "obj", "lib", "dll", "exe", "bin", "class", "pyc", "wasm", "png", "jpg",
    "jpeg", "gif", "bmp", "ico", "tif", "tiff", "zip", "tar", "gz", "tgz", "bz2", "xz", "7z",
    "pdf", "mp3", "mp4", "avi", "mov", "sqlite", "db",
];

/// Horspool substring finder over raw bytes.
pub struct Bmh {
    pattern: Vec<u8>,
    skip: [usize; 256],
}

impl Bmh {
    pub fn new(pattern: &[u8]) -> Bmh {
        let mut skip = [pattern.len(); 256];
        for (i, &b) in pattern.iter().enumerate().take(pattern.len().saturating_sub(1)) {
            skip[b as usize] = pattern.len() - 1 - i;
        }
        Bmh {
            pattern: pattern.to_vec(),
            skip,
        }
    }

    pub fn find(&self, hay: &[u8]) -> Option<usize> {
        let m = self.pattern.len();
        if m == 0 {
            return Some(0);
        }
        if m > hay.len() {
            return None;
        }
        let mut i = 0;
        while i <= hay.len() - m {
            let mut j = m - 1;
            while hay[i + j] == self.pattern[j] {
                if j == 0 {
                    return Some(i);
                }
                j -= 1;
            }
            i += self.skip[hay[i + m - 1] as usize];
        }
        None
    }
}

fn skip_dir_name(name: &str) -> bool {
    name.starts_with('.') || SKIP_DIRS.contains(&name)
}

fn binary_extension(path: &std::path::Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => {
            let lower = ext.to_ascii_lowercase();
            BINARY_EXTS.iter().any(|&b| b == lower)
        }
        None => false,
    }
}

fn looks_binary(buf: &[u8]) -> bool {
    buf[..buf.len().min(SNIFF_LEN)].contains(&0)
}

/// Content search handler. Metadata: base path, substring pattern, and
/// an optional leaf-name glob restricting which files are scanned.
pub async fn search(
    mut ctx: StreamCtx,
    base: Vec<u8>,
    pattern: Vec<u8>,
    name_pattern: Option<Vec<u8>>,
) {
    if pattern.is_empty() {
        ctx.end_ok().await;
        return;
    }
    let finder = Bmh::new(&pattern);
    let base = path_from_bytes(&base);

    let md = match tokio::fs::metadata(&base).await {
        Ok(md) => md,
        Err(e) => {
            ctx.error(io_code(&e), &e.to_string()).await;
            return;
        }
    };

    let mut scan = Scan {
        ctx,
        finder,
        name_pattern,
        file_buf: Vec::with_capacity(64 * 1024),
        files_scanned: 0,
        matches: 0,
    };

    if md.is_file() {
        if scan.scan_file(&base, md.len()).await == Flow::Stop {
            return;
        }
        scan.ctx.end_ok().await;
        return;
    }

    let walker = walkdir::WalkDir::new(&base)
        .follow_links(false)
        .max_depth(MAX_DEPTH)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !e.file_type().is_dir()
                || !e
                    .file_name()
                    .to_str()
                    .map(skip_dir_name)
                    .unwrap_or(false)
        });

    let mut visited = 0u32;
    for entry in walker.filter_map(|e| e.ok()) {
        visited += 1;
        if visited % 64 == 0 {
            tokio::task::yield_now().await;
            if scan.ctx.cancelled() {
                scan.ctx.end(status::CANCELLED, None).await;
                return;
            }
        }
        if !entry.file_type().is_file() {
            continue;
        }
        if scan.files_scanned >= MAX_FILES || scan.matches >= MAX_MATCHES {
            break;
        }
        let size = match entry.metadata() {
            Ok(md) => md.len(),
            Err(_) => continue,
        };
        match scan.scan_file(entry.path(), size).await {
            Flow::Continue => {}
            Flow::Stop => return,
        }
    }
    scan.ctx.end_ok().await;
}

#[derive(PartialEq)]
enum Flow {
    Continue,
    /// The stream already finished (canceled or connection gone).
    Stop,
}

struct Scan {
    ctx: StreamCtx,
    finder: Bmh,
    name_pattern: Option<Vec<u8>>,
    file_buf: Vec<u8>,
    files_scanned: usize,
    matches: usize,
}

impl Scan {
    async fn scan_file(&mut self, path: &std::path::Path, size: u64) -> Flow {
        if size == 0 || size > MAX_FILE_SIZE {
            return Flow::Continue;
        }
        if binary_extension(path) {
            return Flow::Continue;
        }
        if let Some(np) = &self.name_pattern {
            let matched = path
                .file_name()
                .map(|n| glob_match(np, n.to_string_lossy().as_bytes()))
                .unwrap_or(false);
            if !matched {
                return Flow::Continue;
            }
        }

        self.file_buf.clear();
        let mut file = match tokio::fs::File::open(path).await {
            Ok(f) => f,
            Err(_) => return Flow::Continue, // unreadable files are skipped
        };
        if file.read_to_end(&mut self.file_buf).await.is_err() {
            return Flow::Continue;
        }
        if self.file_buf.is_empty() || looks_binary(&self.file_buf) {
            return Flow::Continue;
        }
        self.files_scanned += 1;

        let path_bytes = path_to_bytes(path);
        let ctx = &mut self.ctx;
        let mut line_no = 0u32;
        for line in self.file_buf.split(|&b| b == b'\n') {
            line_no += 1;
            if self.finder.find(line).is_none() {
                continue;
            }
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            let body = SearchHit {
                line: line_no,
                path: path_bytes.clone(),
                text: line.to_vec(),
            }
            .encode();
            match ctx.data(&body).await {
                SendOutcome::Sent => {}
                SendOutcome::Cancelled => {
                    ctx.end(status::CANCELLED, None).await;
                    return Flow::Stop;
                }
                SendOutcome::Closed => return Flow::Stop,
            }
            self.matches += 1;
            if self.matches >= MAX_MATCHES {
                break;
            }
        }
        Flow::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bmh_finds_substrings() {
        let f = Bmh::new(b"needle");
        assert_eq!(f.find(b"a needle in a haystack"), Some(2));
        assert_eq!(f.find(b"no match here"), None);
        assert_eq!(f.find(b"needle"), Some(0));
        assert_eq!(f.find(b"needl"), None);
    }

    #[test]
    fn bmh_single_byte_and_repeats() {
        let f = Bmh::new(b"x");
        assert_eq!(f.find(b"abcx"), Some(3));
        let f = Bmh::new(b"aaa");
        assert_eq!(f.find(b"aaaa"), Some(0));
        assert_eq!(f.find(b"aabaa"), None);
    }

    #[test]
    fn bmh_binary_safe() {
        let f = Bmh::new(&[0xFF, 0x00, 0xFE]);
        assert_eq!(f.find(&[1, 2, 0xFF, 0x00, 0xFE, 3]), Some(2));
    }

    #[test]
    fn skip_dirs_and_extensions() {
        assert!(skip_dir_name(".git"));
        assert!(skip_dir_name(".hidden"));
        assert!(skip_dir_name("node_modules"));
        assert!(!skip_dir_name("src"));
        assert!(binary_extension(std::path::Path::new("a.o")));
        assert!(binary_extension(std::path::Path::new("photo.JPG")));
        assert!(!binary_extension(std::path::Path::new("main.c")));
        assert!(!binary_extension(std::path::Path::new("Makefile")));
    }

    #[test]
    fn nul_sniff() {
        assert!(looks_binary(&[b'a', 0, b'b']));
        assert!(!looks_binary(b"plain text\n"));
        // NUL beyond the sniff window is not checked
        let mut buf = vec![b'x'; SNIFF_LEN];
        buf.push(0);
        assert!(!looks_binary(&buf));
    }
}
