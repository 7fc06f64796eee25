//! Shared wire constants for the telewire framed transport

// Protocol version carried in HELLO/HELLO_ACK
pub const VERSION: u8 = 2;

// Packet header is type (1) + payload length (4, big-endian)
pub const HEADER_LEN: usize = 5;

// Maximum packet payload. The relay side accepts the full 16 MiB; the
// legacy side keeps the smaller ceiling since those machines are
// memory-starved. Senders keep data chunks far below either value.
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;
pub const MAX_PACKET_SIZE_LEGACY: usize = 1024 * 1024;

// Paths are raw bytes, NUL-free, bounded
pub const MAX_PATH: usize = 4096;

// Concurrent live streams per connection
pub const MAX_STREAMS: usize = 256;

// Flow control window bounds negotiated in the handshake
pub const MIN_WINDOW: u32 = 16 * 1024;
pub const MAX_WINDOW: u32 = 16 * 1024 * 1024;
pub const DEFAULT_WINDOW: u32 = 256 * 1024;

// Acknowledge received payload bytes once this many have accumulated
pub const WINDOW_UPDATE_THRESHOLD: u32 = 8 * 1024;

// File read streams chunk at 64 KiB; exec output is forwarded eagerly in
// small reads so interactive commands stay responsive
pub const CHUNK_SIZE: usize = 64 * 1024;
pub const EXEC_CHUNK: usize = 4096;

// Packet type IDs. Codes 0x00..=0x3F are the assigned space: an unknown
// code in it is a protocol error. Codes 0x40..=0xFF are reserved and
// silently ignored so the vocabulary can grow without breaking old peers.
pub const ASSIGNED_TYPE_MAX: u8 = 0x3F;

pub mod packet {
    pub const HELLO: u8 = 0x00;
    pub const HELLO_ACK: u8 = 0x01;
    pub const GOODBYE: u8 = 0x0D;
    pub const PING: u8 = 0x0E;
    pub const PONG: u8 = 0x0F;

    pub const TERM_INPUT: u8 = 0x10;
    pub const TERM_OUTPUT: u8 = 0x11;
    pub const TERM_RESIZE: u8 = 0x12;

    pub const STREAM_OPEN: u8 = 0x20;
    pub const STREAM_DATA: u8 = 0x21;
    pub const STREAM_END: u8 = 0x22;
    pub const STREAM_ERROR: u8 = 0x23;
    pub const STREAM_CANCEL: u8 = 0x24;

    pub const WINDOW_UPDATE: u8 = 0x28;
}

// Stream kinds (the operation vocabulary). STAT follows symlinks, LSTAT
// does not; both stay distinct on the wire even where the platform
// collapses them.
pub mod kind {
    pub const FILE_READ: u8 = 0x01;
    pub const FILE_WRITE: u8 = 0x02;
    pub const EXEC: u8 = 0x03;
    pub const DIR_LIST: u8 = 0x04;
    pub const STAT: u8 = 0x05;
    pub const FIND: u8 = 0x06;
    pub const SEARCH: u8 = 0x07;
    pub const MKDIR: u8 = 0x08;
    pub const REMOVE: u8 = 0x09;
    pub const MOVE: u8 = 0x0A;
    pub const EXISTS: u8 = 0x0B;
    pub const REALPATH: u8 = 0x0C;
    pub const LSTAT: u8 = 0x0D;
}

// STREAM_END status byte
pub mod status {
    pub const OK: u8 = 0x00;
    pub const ERROR: u8 = 0x01;
    pub const CANCELLED: u8 = 0x02;
}

// Exec streams reuse the STREAM_END status position for the exit
// discriminant and append a u32 detail (exit code or signal number)
pub mod exit {
    pub const NORMAL: u8 = 0x00;
    pub const SIGNAL: u8 = 0x01;
    pub const TIMEOUT: u8 = 0x02;
    pub const UNKNOWN: u8 = 0xFF;
}

// Exec output channel discriminant
pub mod chan {
    pub const STDOUT: u8 = 0x01;
    pub const STDERR: u8 = 0x02;
}

// STREAM_ERROR codes
pub mod err {
    pub const NOT_FOUND: u8 = 0x01;
    pub const PERMISSION: u8 = 0x02;
    pub const IO_ERROR: u8 = 0x03;
    pub const TIMEOUT: u8 = 0x04;
    pub const CANCELLED: u8 = 0x05;
    pub const NO_RESOURCES: u8 = 0x06;
    pub const INVALID: u8 = 0x07;
    pub const EXISTS: u8 = 0x08;
    pub const NOT_DIR: u8 = 0x09;
    pub const IS_DIR: u8 = 0x0A;
    pub const UNKNOWN: u8 = 0xFF;
}

// HELLO flag bits
pub mod flags {
    pub const RESUME: u8 = 0x01;
    pub const SIMPLE: u8 = 0x02;
}

// GOODBYE reason byte
pub mod bye {
    pub const NORMAL: u8 = 0x00;
    pub const PROTOCOL_ERROR: u8 = 0x01;
    pub const TIMEOUT: u8 = 0x02;
    pub const RESOURCE: u8 = 0x03;
    pub const UNKNOWN: u8 = 0xFF;
}

// Centralized timing constants so both endpoints agree on liveness
pub mod timeouts {
    use std::time::Duration;

    // HELLO/HELLO_ACK must complete within this window
    pub const HANDSHAKE: Duration = Duration::from_secs(10);

    // Keepalive probe after this much inbound silence
    pub const PING_INTERVAL: Duration = Duration::from_secs(300);

    // A probe unanswered for this long fails the connection
    pub const PONG_DEADLINE: Duration = Duration::from_secs(10);

    // Grace between SIGTERM and SIGKILL when canceling an exec stream
    pub const EXEC_TERM_GRACE: Duration = Duration::from_secs(2);
}

/// Map a packet type to its trace name.
pub fn packet_name(t: u8) -> &'static str {
    match t {
        packet::HELLO => "HELLO",
        packet::HELLO_ACK => "HELLO_ACK",
        packet::GOODBYE => "GOODBYE",
        packet::PING => "PING",
        packet::PONG => "PONG",
        packet::TERM_INPUT => "TERM_INPUT",
        packet::TERM_OUTPUT => "TERM_OUTPUT",
        packet::TERM_RESIZE => "TERM_RESIZE",
        packet::STREAM_OPEN => "STREAM_OPEN",
        packet::STREAM_DATA => "STREAM_DATA",
        packet::STREAM_END => "STREAM_END",
        packet::STREAM_ERROR => "STREAM_ERROR",
        packet::STREAM_CANCEL => "STREAM_CANCEL",
        packet::WINDOW_UPDATE => "WINDOW_UPDATE",
        _ => "UNKNOWN",
    }
}
