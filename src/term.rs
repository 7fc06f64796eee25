//! Local terminal handling for the legacy endpoint
//!
//! Raw mode for the duration of the session, restored on every exit
//! path via the guard's Drop. The session byte stream itself is opaque;
//! an optional filter hook rewrites output for dumb terminals before it
//! reaches the screen (the SGR/UTF-8 downconverter plugs in there).

use anyhow::Result;
use crossterm::terminal;

/// Puts the terminal in raw mode; restores it when dropped.
pub struct RawModeGuard {
    active: bool,
}

impl RawModeGuard {
    pub fn enable() -> Result<RawModeGuard> {
        terminal::enable_raw_mode()?;
        Ok(RawModeGuard { active: true })
    }

    /// Restore early (before printing a final message).
    pub fn restore(&mut self) {
        if self.active {
            let _ = terminal::disable_raw_mode();
            self.active = false;
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        self.restore();
    }
}

/// Current size as (rows, cols), with the classic fallback.
pub fn size() -> (u16, u16) {
    match terminal::size() {
        Ok((cols, rows)) => (rows, cols),
        Err(_) => (24, 80),
    }
}

/// Stateful output transform applied to terminal bytes before display.
/// State persists across calls since escape sequences split arbitrarily
/// over packet boundaries.
pub trait TermFilter: Send + Sync {
    fn apply(&mut self, input: &[u8], out: &mut Vec<u8>);
}

/// Default filter: bytes through untouched.
pub struct Passthrough;

impl TermFilter for Passthrough {
    fn apply(&mut self, input: &[u8], out: &mut Vec<u8>) {
        out.extend_from_slice(input);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_is_identity() {
        let mut f = Passthrough;
        let mut out = Vec::new();
        f.apply(b"\x1b[31mred\x1b[0m", &mut out);
        assert_eq!(out, b"\x1b[31mred\x1b[0m");
        f.apply(b" more", &mut out);
        assert_eq!(out, b"\x1b[31mred\x1b[0m more");
    }
}
