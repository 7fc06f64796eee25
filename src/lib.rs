//! telewire
//!
//! A length-prefixed binary protocol ("the Wire") multiplexing an
//! interactive terminal session and remote file/process operations over
//! one TCP connection, plus both endpoint implementations: the legacy
//! side (owns the filesystem, processes, and the user's terminal) and
//! the relay side (owns the host agent's PTY and the tool-call API).

pub mod cli;
pub mod client;
pub mod exec;
pub mod flow;
pub mod framer;
pub mod glob;
pub mod messages;
pub mod mux;
pub mod ops;
pub mod protocol;
pub mod relay;
pub mod search;
pub mod session;
pub mod term;
pub mod trace;
