//! Legacy-side operation handlers
//!
//! One async fn per stream kind. Each handler owns its resources (open
//! file, directory iterator) for exactly the life of its task, reports
//! completion through its [`StreamCtx`], and stops promptly when the
//! stream is canceled. Content search and process execution live in
//! their own modules.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::glob::glob_match;
use crate::messages::{DirEntryWire, StatReply, KIND_DIR, KIND_FILE, KIND_OTHER, KIND_SYMLINK};
use crate::mux::StreamMsg;
use crate::protocol::{err, status, CHUNK_SIZE};
use crate::session::{SendOutcome, StreamCtx};

/// Depth cap for the find walk; also bounds symlink-cycle damage since
/// directory symlinks are never followed.
pub const FIND_MAX_DEPTH: usize = 64;

/// Map an I/O failure to its wire code.
pub fn io_code(e: &std::io::Error) -> u8 {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::NotFound => err::NOT_FOUND,
        ErrorKind::PermissionDenied => err::PERMISSION,
        ErrorKind::AlreadyExists => err::EXISTS,
        _ => {
            #[cfg(unix)]
            if let Some(code) = e.raw_os_error() {
                if code == libc::ENOTDIR {
                    return err::NOT_DIR;
                }
                if code == libc::EISDIR {
                    return err::IS_DIR;
                }
            }
            err::IO_ERROR
        }
    }
}

/// Raw path bytes to a `PathBuf` without an encoding assumption.
#[cfg(unix)]
pub fn path_from_bytes(bytes: &[u8]) -> PathBuf {
    use std::os::unix::ffi::OsStrExt;
    PathBuf::from(std::ffi::OsStr::from_bytes(bytes))
}

#[cfg(not(unix))]
pub fn path_from_bytes(bytes: &[u8]) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
}

#[cfg(unix)]
pub fn path_to_bytes(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
pub fn path_to_bytes(path: &Path) -> Vec<u8> {
    path.to_string_lossy().into_owned().into_bytes()
}

#[cfg(unix)]
fn name_bytes(name: &std::ffi::OsStr) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    name.as_bytes().to_vec()
}

#[cfg(not(unix))]
fn name_bytes(name: &std::ffi::OsStr) -> Vec<u8> {
    name.to_string_lossy().into_owned().into_bytes()
}

fn file_kind(md: &std::fs::Metadata) -> u8 {
    let ft = md.file_type();
    if ft.is_file() {
        KIND_FILE
    } else if ft.is_dir() {
        KIND_DIR
    } else if ft.is_symlink() {
        KIND_SYMLINK
    } else {
        KIND_OTHER
    }
}

#[cfg(unix)]
fn mode_bits(md: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    md.mode()
}

#[cfg(not(unix))]
fn mode_bits(_md: &std::fs::Metadata) -> u32 {
    0
}

fn mtime_secs(md: &std::fs::Metadata) -> u64 {
    md.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// File read

pub async fn file_read(mut ctx: StreamCtx, path: Vec<u8>) {
    let path = path_from_bytes(&path);
    let mut file = match fs::File::open(&path).await {
        Ok(f) => f,
        Err(e) => {
            ctx.error(io_code(&e), &e.to_string()).await;
            return;
        }
    };

    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = match file.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                ctx.error(err::IO_ERROR, &e.to_string()).await;
                return;
            }
        };
        match ctx.data(&buf[..n]).await {
            SendOutcome::Sent => {}
            SendOutcome::Cancelled => {
                ctx.end(status::CANCELLED, None).await;
                return;
            }
            SendOutcome::Closed => return,
        }
    }
    ctx.end_ok().await;
}

// ---------------------------------------------------------------------------
// File write

pub async fn file_write(
    ctx: StreamCtx,
    path: Vec<u8>,
    mode: u16,
    mut rx: mpsc::Receiver<StreamMsg>,
) {
    let path = path_from_bytes(&path);
    let mut file = match fs::File::create(&path).await {
        Ok(f) => f,
        Err(e) => {
            ctx.error(io_code(&e), &e.to_string()).await;
            return;
        }
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if mode == 0 { 0o644 } else { mode as u32 };
        let _ = fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).await;
    }
    #[cfg(not(unix))]
    let _ = mode;

    while let Some(msg) = rx.recv().await {
        match msg {
            StreamMsg::Data(bytes) => {
                // A zero-byte chunk is a flush marker
                let r = if bytes.is_empty() {
                    file.flush().await
                } else {
                    file.write_all(&bytes).await
                };
                if let Err(e) = r {
                    ctx.error(err::IO_ERROR, &e.to_string()).await;
                    return;
                }
            }
            StreamMsg::End { .. } => {
                if let Err(e) = file.flush().await {
                    ctx.error(err::IO_ERROR, &e.to_string()).await;
                    return;
                }
                ctx.end_ok().await;
                return;
            }
            StreamMsg::Cancelled => {
                // Stop where we are; the partial file stays
                ctx.end(status::CANCELLED, None).await;
                return;
            }
            StreamMsg::Error { .. } => return,
        }
    }
}

/// Send a single reply body and finish the stream.
async fn reply_once(ctx: &mut StreamCtx, body: &[u8]) {
    match ctx.data(body).await {
        SendOutcome::Sent => ctx.end_ok().await,
        SendOutcome::Cancelled => ctx.end(status::CANCELLED, None).await,
        SendOutcome::Closed => {}
    }
}

// ---------------------------------------------------------------------------
// Stat / lstat / exists

pub async fn stat(mut ctx: StreamCtx, path: Vec<u8>, follow: bool) {
    let path = path_from_bytes(&path);
    let md = if follow {
        fs::metadata(&path).await
    } else {
        fs::symlink_metadata(&path).await
    };
    // A path that cannot be statted is reported as absent, not an error
    let reply = match md {
        Ok(md) => StatReply {
            exists: true,
            kind: file_kind(&md),
            mode: mode_bits(&md),
            size: md.len(),
            mtime: mtime_secs(&md),
        },
        Err(_) => StatReply::absent(),
    };
    reply_once(&mut ctx, &reply.encode()).await;
}

pub async fn exists(mut ctx: StreamCtx, path: Vec<u8>) {
    let found = fs::metadata(path_from_bytes(&path)).await.is_ok();
    reply_once(&mut ctx, &[found as u8]).await;
}

// ---------------------------------------------------------------------------
// Mkdir / remove / move / realpath

pub async fn mkdir(ctx: StreamCtx, path: Vec<u8>) {
    let path = path_from_bytes(&path);
    match fs::create_dir(&path).await {
        Ok(()) => ctx.end_ok().await,
        Err(e) => {
            // Idempotent when the directory is already there
            let already_dir = fs::metadata(&path).await.map(|m| m.is_dir()).unwrap_or(false);
            if already_dir {
                ctx.end_ok().await;
            } else {
                ctx.error(io_code(&e), &e.to_string()).await;
            }
        }
    }
}

pub async fn remove(ctx: StreamCtx, path: Vec<u8>) {
    match fs::remove_file(path_from_bytes(&path)).await {
        Ok(()) => ctx.end_ok().await,
        Err(e) => ctx.error(io_code(&e), &e.to_string()).await,
    }
}

pub async fn rename(ctx: StreamCtx, from: Vec<u8>, to: Vec<u8>) {
    match fs::rename(path_from_bytes(&from), path_from_bytes(&to)).await {
        Ok(()) => ctx.end_ok().await,
        // Cross-filesystem moves are the caller's problem
        Err(e) => ctx.error(io_code(&e), &e.to_string()).await,
    }
}

pub async fn realpath(mut ctx: StreamCtx, path: Vec<u8>) {
    match fs::canonicalize(path_from_bytes(&path)).await {
        Ok(resolved) => {
            let mut body = path_to_bytes(&resolved);
            body.push(0);
            reply_once(&mut ctx, &body).await;
        }
        Err(e) => ctx.error(io_code(&e), &e.to_string()).await,
    }
}

// ---------------------------------------------------------------------------
// Directory listing

pub async fn dir_list(mut ctx: StreamCtx, path: Vec<u8>) {
    let path = path_from_bytes(&path);
    let mut rd = match fs::read_dir(&path).await {
        Ok(rd) => rd,
        Err(e) => {
            ctx.error(io_code(&e), &e.to_string()).await;
            return;
        }
    };

    loop {
        let entry = match rd.next_entry().await {
            Ok(Some(e)) => e,
            Ok(None) => break,
            Err(e) => {
                ctx.error(err::IO_ERROR, &e.to_string()).await;
                return;
            }
        };
        // A stat failure on one entry must not fail the listing
        let wire = match entry.metadata().await {
            Ok(md) => DirEntryWire {
                kind: file_kind(&md),
                size: md.len(),
                mtime: mtime_secs(&md),
                name: name_bytes(&entry.file_name()),
            },
            Err(_) => DirEntryWire {
                kind: KIND_OTHER,
                size: 0,
                mtime: 0,
                name: name_bytes(&entry.file_name()),
            },
        };
        match ctx.data(&wire.encode()).await {
            SendOutcome::Sent => {}
            SendOutcome::Cancelled => {
                ctx.end(status::CANCELLED, None).await;
                return;
            }
            SendOutcome::Closed => return,
        }
    }
    ctx.end_ok().await;
}

// ---------------------------------------------------------------------------
// Glob find

pub async fn find(mut ctx: StreamCtx, base: Vec<u8>, pattern: Vec<u8>) {
    let base = absolute(path_from_bytes(&base));

    let md = match fs::metadata(&base).await {
        Ok(md) => md,
        Err(e) => {
            ctx.error(io_code(&e), &e.to_string()).await;
            return;
        }
    };

    // A plain file: test its own leaf name
    if !md.is_dir() {
        if let Some(name) = base.file_name() {
            if glob_match(&pattern, &name_bytes(name)) && !emit_path(&mut ctx, &base).await {
                return;
            }
        }
        ctx.end_ok().await;
        return;
    }

    let walker = walkdir::WalkDir::new(&base)
        .follow_links(false)
        .max_depth(FIND_MAX_DEPTH);
    let mut visited = 0u32;
    for entry in walker.into_iter().filter_map(|e| e.ok()) {
        if entry.depth() == 0 {
            continue;
        }
        visited += 1;
        if visited % 256 == 0 {
            // Long fruitless scans must not monopolize the loop
            tokio::task::yield_now().await;
            if ctx.cancelled() {
                ctx.end(status::CANCELLED, None).await;
                return;
            }
        }
        if glob_match(&pattern, &name_bytes(entry.file_name()))
            && !emit_path(&mut ctx, entry.path()).await
        {
            return;
        }
    }
    ctx.end_ok().await;
}

fn absolute(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(&path))
            .unwrap_or(path)
    }
}

/// Emit one matched path; false means the stream is finished (canceled
/// End already sent, or the connection is gone).
async fn emit_path(ctx: &mut StreamCtx, path: &Path) -> bool {
    let mut body = path_to_bytes(path);
    body.push(0);
    match ctx.data(&body).await {
        SendOutcome::Sent => true,
        SendOutcome::Cancelled => {
            ctx.end(status::CANCELLED, None).await;
            false
        }
        SendOutcome::Closed => false,
    }
}
