//! Logger construction for the transport. Embedders either pass their own
//! `slog` logger down through the client, or rely on `discard` which keeps
//! the plumbing silent.

pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Builds a terminal logger writing human readable lines to stderr.
pub fn terminal() -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(Severity::Debug);
    builder.destination(Destination::Stderr);

    builder.build().expect("Terminal logger construction failed")
}

/// Logger that swallows everything.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
