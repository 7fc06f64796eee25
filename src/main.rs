//! telewire client binary (the legacy-side endpoint)

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use telewire::cli::ClientOpts;
use telewire::client::{self, ClientConfig};
use telewire::term::Passthrough;
use telewire::trace::{NoopTrace, TextTrace, Trace};

fn main() -> ExitCode {
    let opts = ClientOpts::parse();

    let trace: Arc<dyn Trace> = if opts.log {
        match TextTrace::open_default() {
            Ok(t) => {
                eprintln!("logging to {}", t.path().display());
                Arc::new(t)
            }
            Err(e) => {
                eprintln!("cannot open trace log: {}", e);
                Arc::new(NoopTrace)
            }
        }
    } else {
        Arc::new(NoopTrace)
    };

    let mut cfg = ClientConfig::new(&opts.host, opts.port);
    cfg.simple = opts.simple;
    cfg.resume = opts.resume;

    eprintln!("connecting to {}:{}...", opts.host, opts.port);

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = rt.block_on(client::run(cfg, trace, Box::new(Passthrough)));
    // The stdin reader may still be parked in a blocking read; do not
    // let it hold up process exit
    rt.shutdown_background();

    match result {
        Ok(()) => {
            eprintln!("\r\nsession ended");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("\r\ntelewire: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

