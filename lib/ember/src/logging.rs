//! Thin wrapper around `slog`. Components receive a `Logger` and derive
//! children with `log.new(o!(...))`; binaries build the root logger here.

pub use slog::{crit, debug, error, info, o, trace, warn};
pub use slog::{Discard, Drain, Level, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Builds the root terminal logger used by the server binaries.
pub fn terminal(level: Severity) -> Result<Logger, sloggers::Error> {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(level);
    builder.destination(Destination::Stderr);
    builder.build()
}

/// A logger that swallows everything. Used by tests and detached components.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

/// Maps a verbosity flag count to a severity.
pub fn severity(verbose: u8) -> Severity {
    match verbose {
        0 => Severity::Info,
        1 => Severity::Debug,
        _ => Severity::Trace,
    }
}
