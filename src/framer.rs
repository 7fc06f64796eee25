//! Length-prefixed packet framing with incremental reassembly
//!
//! The framer is the only component that knows where packet boundaries
//! are; everything else consumes whole `(type, payload)` packets. Bytes
//! arrive with arbitrary TCP segmentation, so decoding carries state
//! across reads.

use crate::protocol::HEADER_LEN;

/// Fatal framing failure. A short read or connection reset is an I/O
/// error and never reaches this type; an oversized declared length is a
/// protocol error and does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Oversized {
    pub declared: usize,
    pub ceiling: usize,
}

impl std::fmt::Display for Oversized {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "declared packet length {} exceeds ceiling {}",
            self.declared, self.ceiling
        )
    }
}

impl std::error::Error for Oversized {}

/// Encode one packet: type byte, u32 big-endian length, payload.
pub fn encode(t: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.push(t);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Incremental decoder. Feed it raw socket bytes, then drain complete
/// packets. The internal buffer compacts with a read cursor so steady
/// state costs amortize to O(1) per byte.
pub struct Framer {
    buf: Vec<u8>,
    pos: usize,
    ceiling: usize,
}

impl Framer {
    pub fn new(ceiling: usize) -> Self {
        Framer {
            buf: Vec::with_capacity(8192),
            pos: 0,
            ceiling,
        }
    }

    /// Append raw bytes from the transport.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.compact();
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete packet, if one is buffered.
    pub fn next_packet(&mut self) -> Result<Option<(u8, Vec<u8>)>, Oversized> {
        let avail = self.buf.len() - self.pos;
        if avail < HEADER_LEN {
            return Ok(None);
        }
        let head = &self.buf[self.pos..];
        let t = head[0];
        let len = u32::from_be_bytes([head[1], head[2], head[3], head[4]]) as usize;
        if len > self.ceiling {
            return Err(Oversized {
                declared: len,
                ceiling: self.ceiling,
            });
        }
        if avail < HEADER_LEN + len {
            return Ok(None);
        }
        let payload = self.buf[self.pos + HEADER_LEN..self.pos + HEADER_LEN + len].to_vec();
        self.pos += HEADER_LEN + len;
        Ok(Some((t, payload)))
    }

    /// Bytes buffered but not yet consumed. A nonzero value at EOF means
    /// a truncated trailing packet, which is discarded without error.
    pub fn pending(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn compact(&mut self) {
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        } else if self.pos > 64 * 1024 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(f: &mut Framer) -> Vec<(u8, Vec<u8>)> {
        let mut out = Vec::new();
        while let Some(p) = f.next_packet().unwrap() {
            out.push(p);
        }
        out
    }

    #[test]
    fn round_trip_single() {
        let mut f = Framer::new(1024);
        f.feed(&encode(0x21, b"hello"));
        assert_eq!(drain(&mut f), vec![(0x21, b"hello".to_vec())]);
        assert_eq!(f.pending(), 0);
    }

    #[test]
    fn round_trip_every_segmentation() {
        // Two packets, split at every possible byte boundary
        let mut wire = encode(0x10, b"ls\n");
        wire.extend_from_slice(&encode(0x22, &[0, 0, 0, 2, 0]));
        for split in 0..=wire.len() {
            let mut f = Framer::new(1024);
            f.feed(&wire[..split]);
            let mut got = drain(&mut f);
            f.feed(&wire[split..]);
            got.extend(drain(&mut f));
            assert_eq!(
                got,
                vec![
                    (0x10, b"ls\n".to_vec()),
                    (0x22, vec![0, 0, 0, 2, 0]),
                ],
                "split at {}",
                split
            );
        }
    }

    #[test]
    fn byte_at_a_time() {
        let wire = encode(0x11, &[7u8; 300]);
        let mut f = Framer::new(1024);
        let mut got = Vec::new();
        for b in &wire {
            f.feed(std::slice::from_ref(b));
            got.extend(drain(&mut f));
        }
        assert_eq!(got, vec![(0x11, vec![7u8; 300])]);
    }

    #[test]
    fn zero_length_payload_is_valid() {
        let mut f = Framer::new(1024);
        f.feed(&encode(0x21, b""));
        assert_eq!(drain(&mut f), vec![(0x21, Vec::new())]);
    }

    #[test]
    fn ceiling_is_inclusive() {
        let mut f = Framer::new(16);
        f.feed(&encode(0x21, &[0u8; 16]));
        assert!(f.next_packet().unwrap().is_some());

        let mut f = Framer::new(16);
        f.feed(&encode(0x21, &[0u8; 17]));
        let err = f.next_packet().unwrap_err();
        assert_eq!(err.declared, 17);
        assert_eq!(err.ceiling, 16);
    }

    #[test]
    fn oversized_detected_from_header_alone() {
        // Header declares 2 MiB; no payload bytes needed to reject it
        let mut f = Framer::new(1024 * 1024);
        let mut hdr = vec![0x21u8];
        hdr.extend_from_slice(&(2 * 1024 * 1024u32).to_be_bytes());
        f.feed(&hdr);
        assert!(f.next_packet().is_err());
    }

    #[test]
    fn incomplete_trailing_bytes_left_pending() {
        let mut f = Framer::new(1024);
        let wire = encode(0x21, b"abcdef");
        f.feed(&wire[..wire.len() - 2]);
        assert_eq!(f.next_packet().unwrap(), None);
        assert!(f.pending() > 0);
    }

    #[test]
    fn compaction_keeps_unread_tail() {
        let mut f = Framer::new(1024 * 1024);
        // Force the cursor past the compaction threshold, with a partial
        // packet straddling the boundary
        let big = encode(0x21, &vec![1u8; 100 * 1024]);
        let tail = encode(0x22, &[0, 0, 0, 4, 0]);
        f.feed(&big);
        assert!(f.next_packet().unwrap().is_some());
        f.feed(&tail[..3]);
        f.feed(&tail[3..]);
        assert_eq!(f.next_packet().unwrap(), Some((0x22, vec![0, 0, 0, 4, 0])));
    }
}
