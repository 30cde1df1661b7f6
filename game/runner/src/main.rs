//! Server binary: parses the command line, loads configuration, wires the
//! in-memory data provider and the offline authenticator, and runs until
//! told to stop.

use clap::Parser;
use ember::logging::{self, info, warn};
use ember::store::MemoryProvider;
use servercore::config::ServerConfig;
use servercore::server::{OfflineAuthenticator, Server};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "serverrunner", about = "Protocol server")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "server.toml")]
    config: PathBuf,

    /// Override the bind list, e.g. "127.0.0.1:25565;[::1]:25565".
    #[arg(long)]
    bind: Option<String>,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let args = Args::parse();

    let log = logging::terminal(logging::severity(args.verbose))
        .expect("Error building the terminal logger");

    let mut config = if args.config.exists() {
        ServerConfig::load(&args.config)
    } else {
        warn!(log, "configuration file not found, using defaults";
              "path" => %args.config.display());
        ServerConfig::default()
    };

    if let Some(bind) = args.bind {
        config.binds = bind;
    }

    // The SQL-backed provider ships separately; the in-memory provider
    // keeps a single session's world alive.
    let provider = Arc::new(MemoryProvider::new());

    let server = Server::start(config, provider, Arc::new(OfflineAuthenticator), log.clone())
        .expect("Error starting server");

    info!(log, "server running"; "endpoints" => ?server.local_addrs());
    info!(log, "type 'stop' to shut down");

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        match line {
            Ok(command) if command.trim() == "stop" => break,
            Ok(_) => {}
            Err(_) => break,
        }
    }

    info!(log, "shutting down");
    server.shutdown();
}
