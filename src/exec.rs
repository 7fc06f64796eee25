//! Process execution streams
//!
//! The command runs under the platform shell with stdout and stderr
//! piped separately; whatever is available is forwarded immediately, so
//! interactive output is never held back to fill a chunk. Exit is
//! reported in the stream's End packet as a discriminant plus detail
//! (exit code or signal number). Cancel sends SIGTERM, waits a short
//! grace, escalates to SIGKILL, reaps, and answers End(Cancelled).

use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::watch;

use crate::protocol::{chan, err, exit, status, timeouts, EXEC_CHUNK};
use crate::session::{SendOutcome, StreamCtx};

#[cfg(unix)]
fn shell_command(command: &[u8]) -> Command {
    use std::os::unix::ffi::OsStrExt;
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c").arg(std::ffi::OsStr::from_bytes(command));
    cmd
}

#[cfg(not(unix))]
fn shell_command(command: &[u8]) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(String::from_utf8_lossy(command).into_owned());
    cmd
}

#[cfg(unix)]
fn send_sigterm(child: &Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) {}

/// Terminate, escalate, and reap a canceled child.
async fn kill_and_reap(mut child: Child) {
    send_sigterm(&child);
    if tokio::time::timeout(timeouts::EXEC_TERM_GRACE, child.wait())
        .await
        .is_err()
    {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

pub async fn exec(mut ctx: StreamCtx, command: Vec<u8>, mut cancel: watch::Receiver<bool>) {
    let mut child = match shell_command(&command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(c) => c,
        Err(e) => {
            ctx.error(err::IO_ERROR, &e.to_string()).await;
            return;
        }
    };

    let mut out = child.stdout.take().expect("stdout piped");
    let mut errp = child.stderr.take().expect("stderr piped");
    let mut out_done = false;
    let mut err_done = false;
    let mut out_buf = [0u8; EXEC_CHUNK];
    let mut err_buf = [0u8; EXEC_CHUNK];
    let mut body = Vec::with_capacity(EXEC_CHUNK + 1);

    while !(out_done && err_done) {
        body.clear();
        tokio::select! {
            r = out.read(&mut out_buf), if !out_done => match r {
                Ok(0) | Err(_) => out_done = true,
                Ok(n) => {
                    body.push(chan::STDOUT);
                    body.extend_from_slice(&out_buf[..n]);
                }
            },
            r = errp.read(&mut err_buf), if !err_done => match r {
                Ok(0) | Err(_) => err_done = true,
                Ok(n) => {
                    body.push(chan::STDERR);
                    body.extend_from_slice(&err_buf[..n]);
                }
            },
            _ = cancel.changed() => {
                kill_and_reap(child).await;
                ctx.end(status::CANCELLED, None).await;
                return;
            }
        }
        if body.is_empty() {
            continue;
        }

        match ctx.data(&body).await {
            SendOutcome::Sent => {}
            SendOutcome::Cancelled => {
                kill_and_reap(child).await;
                ctx.end(status::CANCELLED, None).await;
                return;
            }
            SendOutcome::Closed => {
                kill_and_reap(child).await;
                return;
            }
        }
    }

    // Output drained; collect the exit status
    let wait = tokio::select! {
        r = child.wait() => r,
        _ = cancel.changed() => {
            kill_and_reap(child).await;
            ctx.end(status::CANCELLED, None).await;
            return;
        }
    };

    let (discriminant, detail) = match wait {
        Ok(st) => exit_parts(st),
        Err(_) => (exit::UNKNOWN, 0),
    };
    ctx.end(discriminant, Some(detail)).await;
}

#[cfg(unix)]
fn exit_parts(st: std::process::ExitStatus) -> (u8, u32) {
    use std::os::unix::process::ExitStatusExt;
    if let Some(code) = st.code() {
        (exit::NORMAL, code as u32)
    } else if let Some(sig) = st.signal() {
        (exit::SIGNAL, sig as u32)
    } else {
        (exit::UNKNOWN, 0)
    }
}

#[cfg(not(unix))]
fn exit_parts(st: std::process::ExitStatus) -> (u8, u32) {
    match st.code() {
        Some(code) => (exit::NORMAL, code as u32),
        None => (exit::UNKNOWN, 0),
    }
}
