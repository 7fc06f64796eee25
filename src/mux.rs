//! Stream multiplexer: table, lifecycle, and dispatch decisions
//!
//! The mux is the state machine only: it decides what to do with each
//! stream-scoped packet and tracks lifecycle, while the connection loop
//! performs the side effects (spawning handlers, forwarding messages,
//! sending rejections). Keeping it synchronous makes the transition
//! table directly testable.
//!
//! Stream identifiers carry their initiator in the low bit: relay-opened
//! streams are even, legacy-opened streams are odd, and each side steps
//! its own counter by two. A kind that carries no request body (every
//! kind except FileWrite) half-closes the opener's direction at open
//! time, so a responder's final End takes the stream straight to Closed
//! and nothing leaks.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::{mpsc, watch};

use crate::protocol::{err, kind, MAX_STREAMS};

/// Which endpoint this mux lives in. Decides id parity both for local
/// allocation and for validating peer opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Legacy,
    Relay,
}

impl Side {
    fn first_local_id(self) -> u32 {
        match self {
            Side::Relay => 2,
            Side::Legacy => 1,
        }
    }

    fn peer_owns(self, id: u32) -> bool {
        match self {
            // Relay allocates even ids, legacy odd
            Side::Legacy => id % 2 == 0,
            Side::Relay => id % 2 == 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// Inbound events delivered to the task servicing a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMsg {
    Data(Vec<u8>),
    End { status: u8, detail: Option<u32> },
    Error { code: u8, message: String },
    Cancelled,
}

struct Entry {
    state: StreamState,
    to_handler: mpsc::Sender<StreamMsg>,
    cancel: watch::Sender<bool>,
    last_activity: Instant,
}

/// What the connection loop should do with a packet.
#[derive(Debug)]
pub enum Disposition {
    /// Forward the message to the stream's servicing task.
    Deliver(mpsc::Sender<StreamMsg>),
    /// Forward, and the stream is now Closed.
    DeliverFinal(mpsc::Sender<StreamMsg>),
    /// Packet crossed a close in flight; discard silently.
    Ignore,
    /// Respond with STREAM_ERROR(code) on this id; connection survives.
    Reject { code: u8, message: &'static str },
}

/// Outcome of a peer STREAM_OPEN.
#[derive(Debug)]
pub enum OpenOutcome {
    Accepted,
    Reject { code: u8, message: &'static str },
}

pub struct Mux {
    side: Side,
    streams: HashMap<u32, Entry>,
    next_local_id: u32,
    /// Highest peer-owned id ever opened; lets us tell "closed recently"
    /// from "never existed" when a stray packet arrives.
    peer_high: u32,
    max_streams: usize,
}

impl Mux {
    pub fn new(side: Side) -> Mux {
        Mux {
            side,
            streams: HashMap::new(),
            next_local_id: side.first_local_id(),
            peer_high: 0,
            max_streams: MAX_STREAMS,
        }
    }

    #[cfg(test)]
    pub fn with_capacity(side: Side, max_streams: usize) -> Mux {
        let mut m = Mux::new(side);
        m.max_streams = max_streams;
        m
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn state(&self, id: u32) -> Option<StreamState> {
        self.streams.get(&id).map(|e| e.state)
    }

    /// Peer opened a stream. On acceptance the entry starts Open for
    /// kinds with a request body and HalfClosedRemote otherwise.
    pub fn open_remote(
        &mut self,
        id: u32,
        stream_kind: u8,
        to_handler: mpsc::Sender<StreamMsg>,
        cancel: watch::Sender<bool>,
    ) -> OpenOutcome {
        if !self.side.peer_owns(id) {
            return OpenOutcome::Reject {
                code: err::INVALID,
                message: "stream id parity does not match initiator",
            };
        }
        if self.streams.contains_key(&id) {
            return OpenOutcome::Reject {
                code: err::INVALID,
                message: "stream id already in use",
            };
        }
        if self.streams.len() >= self.max_streams {
            // The id is not considered allocated
            return OpenOutcome::Reject {
                code: err::NO_RESOURCES,
                message: "too many streams",
            };
        }
        self.peer_high = self.peer_high.max(id);
        let state = if stream_kind == kind::FILE_WRITE {
            StreamState::Open
        } else {
            StreamState::HalfClosedRemote
        };
        self.streams.insert(
            id,
            Entry {
                state,
                to_handler,
                cancel,
                last_activity: Instant::now(),
            },
        );
        OpenOutcome::Accepted
    }

    /// Allocate and register a locally initiated stream.
    pub fn open_local(
        &mut self,
        stream_kind: u8,
        to_handler: mpsc::Sender<StreamMsg>,
        cancel: watch::Sender<bool>,
    ) -> Option<u32> {
        if self.streams.len() >= self.max_streams {
            return None;
        }
        let id = self.next_local_id;
        self.next_local_id += 2;
        let state = if stream_kind == kind::FILE_WRITE {
            StreamState::Open
        } else {
            StreamState::HalfClosedLocal
        };
        self.streams.insert(
            id,
            Entry {
                state,
                to_handler,
                cancel,
                last_activity: Instant::now(),
            },
        );
        Some(id)
    }

    fn stray(&self, id: u32) -> Disposition {
        // A packet for an id that was once live crossed a close in
        // flight; one for an id never allocated is a peer bug.
        let was_allocated = if self.side.peer_owns(id) {
            id <= self.peer_high
        } else {
            id < self.next_local_id
        };
        if was_allocated {
            Disposition::Ignore
        } else {
            Disposition::Reject {
                code: err::INVALID,
                message: "no such stream",
            }
        }
    }

    pub fn on_data(&mut self, id: u32) -> Disposition {
        let Some(e) = self.streams.get_mut(&id) else {
            return self.stray(id);
        };
        match e.state {
            StreamState::Open | StreamState::HalfClosedLocal => {
                e.last_activity = Instant::now();
                Disposition::Deliver(e.to_handler.clone())
            }
            StreamState::HalfClosedRemote => Disposition::Reject {
                code: err::INVALID,
                message: "data after end",
            },
            StreamState::Closed => Disposition::Ignore,
        }
    }

    pub fn on_end(&mut self, id: u32) -> Disposition {
        let Some(state) = self.streams.get(&id).map(|e| e.state) else {
            return self.stray(id);
        };
        match state {
            StreamState::Open => match self.streams.get_mut(&id) {
                Some(e) => {
                    e.state = StreamState::HalfClosedRemote;
                    e.last_activity = Instant::now();
                    Disposition::Deliver(e.to_handler.clone())
                }
                None => Disposition::Ignore,
            },
            StreamState::HalfClosedLocal => match self.streams.remove(&id) {
                Some(e) => Disposition::DeliverFinal(e.to_handler),
                None => Disposition::Ignore,
            },
            StreamState::HalfClosedRemote => Disposition::Reject {
                code: err::INVALID,
                message: "duplicate end",
            },
            StreamState::Closed => Disposition::Ignore,
        }
    }

    pub fn on_error(&mut self, id: u32) -> Disposition {
        match self.streams.remove(&id) {
            None => match self.stray(id) {
                // An error for an unknown stream is not worth another
                // error; drop it either way.
                Disposition::Reject { .. } => Disposition::Ignore,
                d => d,
            },
            Some(e) => {
                e.cancel.send_replace(true);
                Disposition::DeliverFinal(e.to_handler)
            }
        }
    }

    /// Peer canceled. The servicing task is signaled and the entry
    /// dropped; the task performs its best-effort stop and emits
    /// End(Cancelled) itself.
    pub fn on_cancel(&mut self, id: u32) -> Disposition {
        match self.streams.remove(&id) {
            None => Disposition::Ignore,
            Some(e) => {
                e.cancel.send_replace(true);
                Disposition::DeliverFinal(e.to_handler)
            }
        }
    }

    /// The local handler finished its sending direction (it emitted End).
    pub fn on_local_end(&mut self, id: u32) {
        if let Some(e) = self.streams.get_mut(&id) {
            match e.state {
                StreamState::Open => e.state = StreamState::HalfClosedLocal,
                StreamState::HalfClosedRemote => {
                    self.streams.remove(&id);
                }
                StreamState::HalfClosedLocal | StreamState::Closed => {}
            }
        }
    }

    /// Drop a stream outright (local cancel, op future abandoned).
    pub fn forget(&mut self, id: u32) {
        if let Some(e) = self.streams.remove(&id) {
            e.cancel.send_replace(true);
        }
    }

    /// Streams stuck waiting on the peer longer than `idle`: signal them
    /// and hand back their ids so the loop can report Error(Timeout).
    pub fn sweep_idle(&mut self, idle: std::time::Duration) -> Vec<u32> {
        let now = Instant::now();
        let stale: Vec<u32> = self
            .streams
            .iter()
            .filter(|(_, e)| {
                e.state == StreamState::Open && now.duration_since(e.last_activity) > idle
            })
            .map(|(&id, _)| id)
            .collect();
        for id in &stale {
            if let Some(e) = self.streams.remove(id) {
                e.cancel.send_replace(true);
            }
        }
        stale
    }

    /// Connection teardown: every live stream is force-terminated and
    /// its servicing task signaled. Handler resources are freed by the
    /// tasks as their channels close.
    pub fn close_all(&mut self) {
        for (_, e) in self.streams.drain() {
            e.cancel.send_replace(true);
        }
    }
}
