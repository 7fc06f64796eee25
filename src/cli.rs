//! Shared CLI fragments for the two binaries

use clap::Parser;

/// Legacy-side client: `telewire [flags] <host> <port>`
#[derive(Clone, Debug, Parser)]
#[command(
    name = "telewire",
    version,
    about = "Terminal + tool-call bridge client for legacy machines"
)]
pub struct ClientOpts {
    /// Relay host
    pub host: String,

    /// Relay port
    pub port: u16,

    /// Advertise simple mode (ASCII-only terminal)
    #[arg(short = 's', long)]
    pub simple: bool,

    /// Ask the relay to resume the previous session (best-effort)
    #[arg(short = 'r', long)]
    pub resume: bool,

    /// Write a protocol trace to telewire.log in the working directory
    /// (temp directory if that is not writable)
    #[arg(short = 'l', long)]
    pub log: bool,
}

/// Relay daemon options
#[derive(Clone, Debug, Parser)]
#[command(
    name = "telewired",
    version,
    about = "Relay daemon bridging a host agent to legacy terminals"
)]
pub struct RelayOpts {
    /// Bind address (host:port)
    #[arg(long, default_value = "127.0.0.1:9470")]
    pub bind: String,

    /// Command to run inside the bridged PTY
    #[arg(long, default_value = "/bin/sh")]
    pub command: String,

    /// Per-operation deadline in seconds (0 disables)
    #[arg(long, default_value_t = 60)]
    pub op_timeout: u64,

    /// Write a protocol trace to telewire.log
    #[arg(short = 'l', long)]
    pub log: bool,
}
