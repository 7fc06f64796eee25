//! Credit-based flow control
//!
//! Each direction of a connection has one window. The send side charges
//! `bytes_in_flight` for every counted payload byte (stream data after
//! the id prefix, terminal output) and may not exceed the peer's
//! advertised window; credit returns only via WINDOW_UPDATE. The receive
//! side accrues consumed bytes and acknowledges them once a threshold is
//! crossed or a stream completes.

use std::pin::pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::protocol::WINDOW_UPDATE_THRESHOLD;

/// A credit increment the peer's accounting cannot absorb. Fatal for
/// the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditOverflow {
    pub increment: u32,
    pub in_flight: u64,
}

impl std::fmt::Display for CreditOverflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "window credit +{} exceeds {} bytes in flight",
            self.increment, self.in_flight
        )
    }
}

impl std::error::Error for CreditOverflow {}

struct Inner {
    window: u64,
    in_flight: u64,
    closed: bool,
}

/// Send-side window shared between the connection loop and handler
/// tasks. The lock is never held across an await.
pub struct FlowControl {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl FlowControl {
    pub fn new(peer_window: u32) -> Arc<FlowControl> {
        Arc::new(FlowControl {
            inner: Mutex::new(Inner {
                window: peer_window as u64,
                in_flight: 0,
                closed: false,
            }),
            notify: Notify::new(),
        })
    }

    /// Reserve `n` counted bytes, suspending until the peer's window has
    /// room. Returns false if the connection closed while waiting.
    pub async fn reserve(&self, n: usize) -> bool {
        let n = n as u64;
        let mut notified = pin!(self.notify.notified());
        loop {
            notified.as_mut().enable();
            {
                let mut s = self.inner.lock();
                if s.closed {
                    return false;
                }
                if s.in_flight + n <= s.window {
                    s.in_flight += n;
                    return true;
                }
            }
            notified.as_mut().await;
            notified.set(self.notify.notified());
        }
    }

    /// Apply a WINDOW_UPDATE from the peer.
    pub fn credit(&self, increment: u32) -> Result<(), CreditOverflow> {
        let mut s = self.inner.lock();
        if (increment as u64) > s.in_flight {
            return Err(CreditOverflow {
                increment,
                in_flight: s.in_flight,
            });
        }
        s.in_flight -= increment as u64;
        drop(s);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Unblock every waiter; subsequent reserves fail.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn in_flight(&self) -> u64 {
        self.inner.lock().in_flight
    }
}

/// Receive-side acknowledgement accounting. Owned by the single reader
/// loop, so no locking.
pub struct AckCounter {
    pending: u32,
    threshold: u32,
}

impl AckCounter {
    pub fn new() -> AckCounter {
        AckCounter {
            pending: 0,
            threshold: WINDOW_UPDATE_THRESHOLD,
        }
    }

    /// Record `n` consumed payload bytes; returns the increment to send
    /// if the threshold was crossed.
    pub fn consume(&mut self, n: usize) -> Option<u32> {
        self.pending = self.pending.saturating_add(n as u32);
        if self.pending >= self.threshold {
            Some(std::mem::take(&mut self.pending))
        } else {
            None
        }
    }

    /// Flush whatever is pending (stream completion, shutdown).
    pub fn flush(&mut self) -> Option<u32> {
        if self.pending > 0 {
            Some(std::mem::take(&mut self.pending))
        } else {
            None
        }
    }
}

impl Default for AckCounter {
    fn default() -> Self {
        Self::new()
    }
}
